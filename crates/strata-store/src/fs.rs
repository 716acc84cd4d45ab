//! File-per-key store backend.
//!
//! Each object lives in its own file at a path mirroring the key's
//! hierarchy under a root directory (`ns1/a` → `<root>/ns1/a.obj`), so
//! sorted directory traversal order equals list iteration order. File
//! contents are a checksummed frame:
//!
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload (bincode-serialized Envelope)]
//! ```
//!
//! Writes go through a temp file and an atomic rename. On open the tree is
//! scanned, live objects are recovered, and the version counter resumes
//! after the highest recovered stamp; files that fail the CRC or decode
//! step are skipped with a warning (torn writes from a crash). Mutation
//! history is not persisted, so replay for versions older than the
//! recovered one fails `Gone` after a reopen.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use strata_types::{Key, RawObject, ResourceVersion, StorageError, StorageResult};

use crate::store::{Entry, Persister, StoreConfig, StoreCore};

/// Frame header: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// File extension for object files, keeping a key's file distinct from the
/// directory holding its children.
const OBJECT_EXT: &str = "obj";

/// On-disk representation of one object.
#[derive(Serialize, Deserialize)]
struct Envelope {
    /// Version stamp of the mutation that produced this state.
    rv: u64,
    /// Expiry deadline in milliseconds since the UNIX epoch.
    expires_at_ms: Option<u64>,
    /// Opaque payload bytes.
    data: Vec<u8>,
}

fn system_time_to_ms(deadline: SystemTime) -> u64 {
    deadline
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn ms_to_system_time(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// [`Persister`] writing one checksummed file per key.
#[derive(Clone, Debug)]
pub struct FsPersister {
    root: PathBuf,
}

impl FsPersister {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &Key) -> PathBuf {
        self.root.join(format!("{}.{OBJECT_EXT}", key.as_str()))
    }
}

impl Persister for FsPersister {
    fn persist(&self, object: &RawObject, expires_at: Option<SystemTime>) -> StorageResult<()> {
        let path = self.path_for(&object.key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let envelope = Envelope {
            rv: object.rv.get(),
            expires_at_ms: expires_at.map(system_time_to_ms),
            data: object.data.clone(),
        };
        let payload = bincode::serialize(&envelope)
            .map_err(|e| StorageError::Internal(format!("envelope serialization: {e}")))?;
        let crc = crc32fast::hash(&payload);

        // Write the frame to a temp file, then rename into place so a
        // crash mid-write can never clobber the previous state.
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&(payload.len() as u32).to_le_bytes())?;
            file.write_all(&crc.to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &Key) -> StorageResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_envelope(path: &Path) -> StorageResult<Envelope> {
    let mut file = File::open(path)?;
    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header)?;
    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let mut payload = vec![0u8; length];
    file.read_exact(&mut payload)?;

    let actual_crc = crc32fast::hash(&payload);
    if actual_crc != expected_crc {
        return Err(StorageError::Internal(format!(
            "CRC mismatch in {}: expected {expected_crc:08x}, computed {actual_crc:08x}",
            path.display()
        )));
    }
    bincode::deserialize(&payload)
        .map_err(|e| StorageError::Internal(format!("envelope decode in {}: {e}", path.display())))
}

fn key_for_path(root: &Path, path: &Path) -> StorageResult<Key> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| StorageError::Internal(format!("path escapes root: {}", path.display())))?
        .with_extension("");
    let segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Key::parse(segments.join("/"))
}

/// File-per-key store.
pub type FsStore = StoreCore<FsPersister>;

impl FsStore {
    /// Open (or create) a file-backed store rooted at the given directory.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with_config(root, StoreConfig::default())
    }

    /// Open with explicit configuration, scanning the tree to recover live
    /// objects and resume the version sequence.
    pub fn open_with_config(root: impl AsRef<Path>, config: StoreConfig) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let now = SystemTime::now();
        let mut live = BTreeMap::new();
        let mut recovered = ResourceVersion::ZERO;
        let mut skipped = 0usize;

        for dirent in WalkDir::new(&root).sort_by_file_name() {
            let dirent = dirent.map_err(|e| StorageError::Internal(e.to_string()))?;
            if !dirent.file_type().is_file()
                || dirent.path().extension().and_then(|e| e.to_str()) != Some(OBJECT_EXT)
            {
                continue;
            }
            let path = dirent.path();
            let envelope = match read_envelope(path) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable object file");
                    skipped += 1;
                    continue;
                }
            };
            let key = match key_for_path(&root, path) {
                Ok(key) => key,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping file with malformed key");
                    skipped += 1;
                    continue;
                }
            };

            let rv = ResourceVersion::new(envelope.rv);
            recovered = recovered.max(rv);

            let expires_at = envelope.expires_at_ms.map(ms_to_system_time);
            if expires_at.is_some_and(|deadline| deadline <= now) {
                debug!(%key, "dropping expired object during recovery");
                let _ = fs::remove_file(path);
                continue;
            }

            live.insert(
                key.clone(),
                Entry {
                    object: RawObject {
                        key,
                        data: envelope.data,
                        rv,
                    },
                    expires_at,
                },
            );
        }

        info!(
            root = %root.display(),
            objects = live.len(),
            skipped,
            recovered_rv = recovered.get(),
            "opened file store"
        );
        Ok(StoreCore::from_recovered(
            FsPersister::new(root),
            config,
            live,
            recovered,
        ))
    }
}
