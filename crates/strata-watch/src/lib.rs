//! Watch fan-out for Strata.
//!
//! The [`Broadcaster`] keeps a registry of independent subscriptions, each
//! with its own bounded delivery queue. The store routes every committed
//! mutation through [`Broadcaster::route`] inside its commit critical
//! section, so watch delivery order is exactly commit order. A lagging
//! consumer only ever loses its own subscription (terminal
//! `Error(Overflowed)` event) — it can never slow the writer path or other
//! subscribers.

pub mod broadcaster;
pub mod subscription;

pub use broadcaster::{Broadcaster, Change, WatchConfig};
pub use subscription::Subscription;
