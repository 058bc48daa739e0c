//! In-memory log store with the same observable contract as a real backend:
//! server-assigned strictly increasing timestamps, latest-record fan-out to
//! subscribers, first-registration-wins manifests. Everything an engine (or a
//! test) needs to run without a network.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use futures::channel::{mpsc, oneshot};
use futures::future::LocalBoxFuture;
use futures::stream::LocalBoxStream;

use crate::data_model::{EventRecord, NewEventRecord, ReducerManifest, SnapshotRecord};
use crate::store::{Error, LogStore, Result};

#[derive(Clone)]
pub struct MemoryStore {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    events: HashMap<String, Vec<EventRecord>>,
    snapshots: HashMap<String, Vec<SnapshotRecord>>,
    manifests: HashMap<String, ReducerManifest>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<EventRecord>>>,
    held_snapshot_fetches: Vec<oneshot::Sender<()>>,
    hold_snapshot_fetches: bool,
    fail_appends: bool,
    clock_ms: i64,
}

impl Inner {
    fn next_ts(&mut self) -> DateTime<Utc> {
        self.clock_ms += 1;
        DateTime::from_timestamp_millis(self.clock_ms)
            .expect("the in-memory clock stays within the representable range")
    }

    fn fan_out(&mut self, stream: &str, record: &EventRecord) {
        if let Some(subscribers) = self.subscribers.get_mut(stream) {
            subscribers.retain(|tx| tx.unbounded_send(record.clone()).is_ok());
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                events: HashMap::new(),
                snapshots: HashMap::new(),
                manifests: HashMap::new(),
                subscribers: HashMap::new(),
                held_snapshot_fetches: Vec::new(),
                hold_snapshot_fetches: false,
                fail_appends: false,
                clock_ms: 1_700_000_000_000,
            })),
        }
    }

    /// Make every following append fail, to exercise the emit failure path.
    pub fn fail_appends(&self, fail: bool) {
        self.inner.borrow_mut().fail_appends = fail;
    }

    /// Park snapshot fetches until [`MemoryStore::release_snapshot_fetches`],
    /// so records can arrive while a client is still establishing its
    /// baseline.
    pub fn hold_snapshot_fetches(&self) {
        self.inner.borrow_mut().hold_snapshot_fetches = true;
    }

    pub fn release_snapshot_fetches(&self) {
        let held = {
            let mut inner = self.inner.borrow_mut();
            inner.hold_snapshot_fetches = false;
            std::mem::take(&mut inner.held_snapshot_fetches)
        };
        for gate in held {
            let _ = gate.send(());
        }
    }

    /// Push the stream's newest record to all subscribers again, simulating
    /// the duplicate deliveries a latest-record subscription can produce.
    pub fn redeliver_latest(&self, stream: &str) {
        let mut inner = self.inner.borrow_mut();
        if let Some(record) = inner.events.get(stream).and_then(|log| log.last()).cloned() {
            inner.fan_out(stream, &record);
        }
    }

    /// Append bypassing a client, as if some other process had emitted.
    pub fn append_raw(&self, stream: &str, value: serde_json::Value, correlation_id: u64) {
        let mut inner = self.inner.borrow_mut();
        let ts = inner.next_ts();
        let record = EventRecord {
            value,
            ts,
            correlation_id,
        };
        inner
            .events
            .entry(stream.to_string())
            .or_default()
            .push(record.clone());
        inner.fan_out(stream, &record);
    }

    pub fn event_count(&self, stream: &str) -> usize {
        self.inner
            .borrow()
            .events
            .get(stream)
            .map_or(0, |log| log.len())
    }

    pub fn snapshot_count(&self, stream: &str) -> usize {
        self.inner
            .borrow()
            .snapshots
            .get(stream)
            .map_or(0, |snapshots| snapshots.len())
    }

    pub fn latest_snapshot_value(&self, stream: &str) -> Option<serde_json::Value> {
        self.inner
            .borrow()
            .snapshots
            .get(stream)
            .and_then(|snapshots| snapshots.last())
            .map(|snapshot| snapshot.value.clone())
    }

    pub fn manifest(&self, stream: &str) -> Option<ReducerManifest> {
        self.inner.borrow().manifests.get(stream).cloned()
    }

    /// Overwrite the manifest directly, e.g. to stage a mismatch.
    pub fn put_manifest(&self, stream: &str, manifest: ReducerManifest) {
        self.inner
            .borrow_mut()
            .manifests
            .insert(stream.to_string(), manifest);
    }
}

impl LogStore for MemoryStore {
    fn append(&self, stream: &str, record: NewEventRecord) -> LocalBoxFuture<'static, Result<()>> {
        let inner = self.inner.clone();
        let stream = stream.to_string();
        Box::pin(async move {
            let mut inner = inner.borrow_mut();
            if inner.fail_appends {
                return Err(Error::Append {
                    stream,
                    message: "simulated append failure".to_string(),
                });
            }
            let ts = inner.next_ts();
            let record = EventRecord {
                value: record.value,
                ts,
                correlation_id: record.correlation_id,
            };
            inner
                .events
                .entry(stream.clone())
                .or_default()
                .push(record.clone());
            inner.fan_out(&stream, &record);
            Ok(())
        })
    }

    fn latest_snapshot(
        &self,
        stream: &str,
    ) -> LocalBoxFuture<'static, Result<Option<SnapshotRecord>>> {
        let inner = self.inner.clone();
        let stream = stream.to_string();
        Box::pin(async move {
            let gate = {
                let mut inner = inner.borrow_mut();
                if inner.hold_snapshot_fetches {
                    let (tx, rx) = oneshot::channel();
                    inner.held_snapshot_fetches.push(tx);
                    Some(rx)
                } else {
                    None
                }
            };
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            let inner = inner.borrow();
            Ok(inner
                .snapshots
                .get(&stream)
                .and_then(|snapshots| snapshots.last())
                .cloned())
        })
    }

    fn persist_snapshot(
        &self,
        stream: &str,
        snapshot: SnapshotRecord,
    ) -> LocalBoxFuture<'static, Result<()>> {
        let inner = self.inner.clone();
        let stream = stream.to_string();
        Box::pin(async move {
            inner
                .borrow_mut()
                .snapshots
                .entry(stream)
                .or_default()
                .push(snapshot);
            Ok(())
        })
    }

    fn reducer_manifest(
        &self,
        stream: &str,
    ) -> LocalBoxFuture<'static, Result<Option<ReducerManifest>>> {
        let inner = self.inner.clone();
        let stream = stream.to_string();
        Box::pin(async move { Ok(inner.borrow().manifests.get(&stream).cloned()) })
    }

    fn register_manifest(
        &self,
        stream: &str,
        manifest: ReducerManifest,
    ) -> LocalBoxFuture<'static, Result<()>> {
        let inner = self.inner.clone();
        let stream = stream.to_string();
        Box::pin(async move {
            inner.borrow_mut().manifests.entry(stream).or_insert(manifest);
            Ok(())
        })
    }

    fn subscribe_latest(&self, stream: &str) -> LocalBoxStream<'static, EventRecord> {
        let (tx, rx) = mpsc::unbounded();
        let mut inner = self.inner.borrow_mut();
        if let Some(latest) = inner.events.get(stream).and_then(|log| log.last()) {
            let _ = tx.unbounded_send(latest.clone());
        }
        inner
            .subscribers
            .entry(stream.to_string())
            .or_default()
            .push(tx);
        Box::pin(rx)
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use futures::StreamExt;

    use super::*;

    #[test]
    fn timestamps_strictly_increase_across_appends() {
        let store = MemoryStore::new();
        store.append_raw("s", serde_json::json!(1), 1);
        store.append_raw("s", serde_json::json!(2), 2);

        let inner = store.inner.borrow();
        let log = &inner.events["s"];
        assert!(log[0].ts < log[1].ts);
    }

    #[test]
    fn a_new_subscription_sees_the_current_newest_record_first() {
        let store = MemoryStore::new();
        store.append_raw("s", serde_json::json!("old"), 1);
        store.append_raw("s", serde_json::json!("new"), 2);

        let mut feed = store.subscribe_latest("s");
        let first = block_on(feed.next()).unwrap();
        assert_eq!(first.value, serde_json::json!("new"));

        store.append_raw("s", serde_json::json!("newer"), 3);
        let second = block_on(feed.next()).unwrap();
        assert_eq!(second.value, serde_json::json!("newer"));
    }

    #[test]
    fn first_manifest_registration_wins() {
        let store = MemoryStore::new();
        let first = ReducerManifest::new("v1", serde_json::json!(0));
        let second = ReducerManifest::new("v2", serde_json::json!(0));

        block_on(store.register_manifest("s", first.clone())).unwrap();
        block_on(store.register_manifest("s", second)).unwrap();

        assert_eq!(store.manifest("s"), Some(first));
    }
}
