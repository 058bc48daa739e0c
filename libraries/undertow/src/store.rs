//! The remote log port. A backend keeps, per stream name: an append-only
//! collection of timestamped event records, an append-only collection of
//! reduced-value snapshots, and a single reducer manifest. Timestamps are
//! assigned by the backend, which makes them the one total order every client
//! agrees on.
//!
//! Returned futures must own what they need (`'static`): stream drivers hold
//! on to them across turns of the event loop.

use futures::future::LocalBoxFuture;
use futures::stream::LocalBoxStream;

use crate::data_model::{EventRecord, NewEventRecord, ReducerManifest, SnapshotRecord};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("appending to stream {stream} failed: {message}")]
    Append { stream: String, message: String },

    #[error("fetching from stream {stream} failed: {message}")]
    Fetch { stream: String, message: String },

    #[error("decoding a record for stream {stream} failed: {source}")]
    Decode {
        stream: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "the reducer supplied for stream {stream} does not match the one registered for it; bump the stream version and migrate the data over"
    )]
    ReducerMismatch { stream: String },
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait LogStore {
    /// Append an event record. The backend assigns the timestamp.
    fn append(&self, stream: &str, record: NewEventRecord) -> LocalBoxFuture<'static, Result<()>>;

    /// The most recent persisted snapshot, if any. Fetched once at startup.
    fn latest_snapshot(
        &self,
        stream: &str,
    ) -> LocalBoxFuture<'static, Result<Option<SnapshotRecord>>>;

    /// Persist a new latest snapshot. Called after every fold.
    fn persist_snapshot(
        &self,
        stream: &str,
        snapshot: SnapshotRecord,
    ) -> LocalBoxFuture<'static, Result<()>>;

    /// The manifest registered under this stream name, if any.
    fn reducer_manifest(
        &self,
        stream: &str,
    ) -> LocalBoxFuture<'static, Result<Option<ReducerManifest>>>;

    /// Register the manifest for a stream name. First registration wins.
    fn register_manifest(
        &self,
        stream: &str,
        manifest: ReducerManifest,
    ) -> LocalBoxFuture<'static, Result<()>>;

    /// Live feed of the stream's newest record: pushes the current newest
    /// immediately if one exists, then pushes again on every append. This is
    /// a latest-record feed, not a replay; history is covered by snapshots.
    fn subscribe_latest(&self, stream: &str) -> LocalBoxStream<'static, EventRecord>;
}
