//! This is a library for realtime shared state between browser clients.
//! It was created for a Conduit-style blogging app, so it doesn't include much that was not needed for that project.
//!
//! How shared state works:
//! 1. Each piece of shared state is a named stream. A stream is folded out of an append-only event log by a reducer every client agrees on.
//! 2. Instead of modifying state directly, clients submit actions. The log assigns each record a server timestamp, and every client applies records in timestamp order, so everyone converges on the same value.
//! 3. After every fold the new value is written to a local cache (for fast restarts) and persisted remotely as a snapshot, so a freshly arriving client seeds from the latest snapshot instead of replaying history.
//! 4. A reducer, once registered under a stream name, is frozen. A client carrying a different definition for the same name is refused. Migrations work by bumping the version suffix in the stream name and seeding the new stream from the old one.
//!
//! Sounds simple, but the startup sequencing is the tricky part this library handles.

pub mod cache;
pub mod data_model;
pub mod engine;
pub mod store;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

#[cfg(target_arch = "wasm32")]
#[cfg(feature = "supabase")]
pub mod supabase;

pub use data_model::Responder;
pub use engine::{EmitError, Engine, InitialValue};
pub use store::{Error, LogStore, Result};

/// A pure fold shared by every client of a stream.
///
/// `reduce` must be deterministic and total over `(state, action)`: it runs
/// on every subscribed client, against the same totally ordered log, and all
/// of them must arrive at the same value. Validation and authorization
/// failures are reported by resolving the responder with an error-shaped
/// payload, never by panicking.
pub trait SharedReducer {
    type State: Clone + serde::Serialize + serde::de::DeserializeOwned + 'static;
    type Action: serde::Serialize + serde::de::DeserializeOwned + 'static;
    type Response: 'static;

    /// Identity of this reducer's definition. Hashed into the stream's
    /// manifest; two clients sharing a stream name must agree on it, so
    /// change it (and the stream version) whenever the semantics change.
    fn definition(&self) -> &str;

    fn reduce(
        &self,
        state: Self::State,
        action: Self::Action,
        responder: &mut Responder<Self::Response>,
    ) -> Self::State;
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen::prelude::wasm_bindgen)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ListenerKey(pub(crate) slotmap::DefaultKey);

#[cfg(test)]
mod tests {
    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::cache::MemoryCache;
    use crate::data_model::Responder;
    use crate::engine::{Engine, InitialValue};
    use crate::memory::MemoryStore;
    use crate::SharedReducer;

    struct Adder;

    #[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
    #[serde(tag = "op")]
    enum CounterAction {
        #[serde(rename = "add")]
        Add { n: i64 },
    }

    impl SharedReducer for Adder {
        type State = i64;
        type Action = CounterAction;
        type Response = i64;

        fn definition(&self) -> &str {
            "counter: add(n) adds n to the total"
        }

        fn reduce(
            &self,
            state: i64,
            action: CounterAction,
            responder: &mut Responder<i64>,
        ) -> i64 {
            let CounterAction::Add { n } = action;
            let next = state + n;
            responder.resolve(next);
            next
        }
    }

    #[test]
    fn counter_stream_folds_in_order_and_ignores_redelivery() {
        let store = MemoryStore::new();
        let engine = Engine::new(store.clone(), MemoryCache::default());

        let mut pool = LocalPool::new();
        let spawner = pool.spawner();

        let driver = engine.open_stream("counter-1", Adder, InitialValue::Now(0));
        spawner
            .spawn_local(async move {
                let _ = driver.await;
            })
            .unwrap();
        pool.run_until_stalled();

        let first = engine.emit::<Adder>("counter-1", CounterAction::Add { n: 5 });
        let second = engine.emit::<Adder>("counter-1", CounterAction::Add { n: 3 });

        let responses = Rc::new(RefCell::new(Vec::new()));
        for fut in [first, second] {
            let responses = responses.clone();
            spawner
                .spawn_local(async move {
                    let r = fut.await;
                    responses.borrow_mut().push(r);
                })
                .unwrap();
        }
        pool.run_until_stalled();

        assert_eq!(engine.ready_state::<Adder>("counter-1"), Some(8));

        // the reducer resolved each emission with the running total
        let responses = responses.borrow();
        assert_eq!(responses.len(), 2);
        assert!(matches!(responses[0], Ok(Some(5))));
        assert!(matches!(responses[1], Ok(Some(8))));

        // redelivering an already-applied record must change nothing
        store.redeliver_latest("counter-1");
        pool.run_until_stalled();
        assert_eq!(engine.ready_state::<Adder>("counter-1"), Some(8));
    }

    #[test]
    fn two_engines_converge_on_the_same_value() {
        let store = MemoryStore::new();
        let engine_a = Engine::new(store.clone(), MemoryCache::default());
        let engine_b = Engine::new(store.clone(), MemoryCache::default());

        let mut pool = LocalPool::new();
        let spawner = pool.spawner();

        for engine in [&engine_a, &engine_b] {
            let driver = engine.open_stream("counter-1", Adder, InitialValue::Now(0));
            spawner
                .spawn_local(async move {
                    let _ = driver.await;
                })
                .unwrap();
        }
        pool.run_until_stalled();

        let emit = engine_a.emit::<Adder>("counter-1", CounterAction::Add { n: 5 });
        spawner
            .spawn_local(async move {
                let _ = emit.await;
            })
            .unwrap();
        pool.run_until_stalled();
        let emit = engine_b.emit::<Adder>("counter-1", CounterAction::Add { n: 3 });
        spawner
            .spawn_local(async move {
                let _ = emit.await;
            })
            .unwrap();
        pool.run_until_stalled();

        assert_eq!(engine_a.ready_state::<Adder>("counter-1"), Some(8));
        assert_eq!(engine_b.ready_state::<Adder>("counter-1"), Some(8));
    }
}
