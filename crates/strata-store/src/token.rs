//! Continuation token codec.
//!
//! A token captures where a truncated page stopped: the last returned key
//! and the snapshot version the page was served from. Tokens are opaque to
//! callers — hex-wrapped JSON, validated on decode — and carry no
//! authority: resuming re-checks the snapshot against retained history.

use serde::{Deserialize, Serialize};

use strata_types::{Key, ResourceVersion, StorageError, StorageResult};

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    /// Last key returned on the previous page.
    k: String,
    /// Snapshot version the page sequence was issued at.
    rv: u64,
}

/// Encode a continuation resuming after `last_key` at snapshot `rv`.
pub(crate) fn encode(last_key: &Key, rv: ResourceVersion) -> String {
    let payload = TokenPayload {
        k: last_key.as_str().to_string(),
        rv: rv.get(),
    };
    // Serializing two plain fields cannot fail.
    let json = serde_json::to_vec(&payload).expect("token serialization");
    hex::encode(json)
}

/// Decode and validate a continuation token.
pub(crate) fn decode(token: &str) -> StorageResult<(Key, ResourceVersion)> {
    let bytes = hex::decode(token)
        .map_err(|e| StorageError::Invalid(format!("malformed continuation token: {e}")))?;
    let payload: TokenPayload = serde_json::from_slice(&bytes)
        .map_err(|e| StorageError::Invalid(format!("malformed continuation token: {e}")))?;
    if payload.rv == 0 {
        return Err(StorageError::Invalid(
            "continuation token carries no snapshot version".into(),
        ));
    }
    let key = Key::parse(payload.k)
        .map_err(|_| StorageError::Invalid("continuation token carries a malformed key".into()))?;
    Ok((key, ResourceVersion::new(payload.rv)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = Key::parse("ns1/a").unwrap();
        let token = encode(&key, ResourceVersion::new(7));
        let (back_key, back_rv) = decode(&token).unwrap();
        assert_eq!(back_key, key);
        assert_eq!(back_rv, ResourceVersion::new(7));
    }

    #[test]
    fn tampered_tokens_are_invalid() {
        let key = Key::parse("ns1/a").unwrap();
        let token = encode(&key, ResourceVersion::new(7));

        let truncated = &token[..token.len() - 2];
        assert!(matches!(decode(truncated), Err(StorageError::Invalid(_))));

        let garbage = "zz not hex";
        assert!(matches!(decode(garbage), Err(StorageError::Invalid(_))));
    }

    #[test]
    fn zero_snapshot_is_rejected() {
        let key = Key::parse("ns1/a").unwrap();
        let token = encode(&key, ResourceVersion::ZERO);
        assert!(matches!(decode(&token), Err(StorageError::Invalid(_))));
    }
}
