//! # Records
//! The wire-level units of a stream. An action is submitted as a [`NewEventRecord`] (no timestamp;
//! the log assigns one on append), comes back to every subscriber as an [`EventRecord`] ordered by
//! the server clock, and each successful fold leaves behind a [`SnapshotRecord`] so that later
//! clients can seed from the latest reduced value instead of replaying the whole log.

use chrono::{DateTime, Utc};

/// A record appended to a stream's event log. Never mutated; ordered by `ts`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EventRecord {
    pub value: serde_json::Value,
    pub ts: DateTime<Utc>,
    /// Ties the record back to the pending response registered by whichever
    /// client submitted it. Random; collisions are accepted as negligible.
    pub correlation_id: u64,
}

/// An action as submitted, before the log has assigned its timestamp.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct NewEventRecord {
    pub value: serde_json::Value,
    pub correlation_id: u64,
}

/// The latest reduced value of a stream, persisted after every fold.
///
/// `ts` is the timestamp of the last event folded in; `None` when the value
/// is a freshly registered initial value that has folded nothing yet.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotRecord {
    pub value: serde_json::Value,
    pub ts: Option<DateTime<Utc>>,
}

/// One `{value, ts}` pair in the local cache, stored under `cache-<name>`.
/// Read once at startup for optimistic first paint, overwritten on every fold.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub ts: Option<DateTime<Utc>>,
}
