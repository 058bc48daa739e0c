//! One engine instance per process. It owns every stream's machine, the
//! pending-response tables, and the listener registry; nothing here lives in
//! module-level state, so independent engines (several tests, several tabs'
//! worth of simulation) can coexist.
//!
//! Streams of different reducer types share one map, so entries are stored
//! type-erased and downcast on access. We should never hold a borrow of the
//! stream map across an `.await`; by avoiding this, we guarantee the absence
//! of "borrow while locked" panics.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::future::{AbortHandle, Abortable, LocalBoxFuture};
use futures::stream::{self, LocalBoxStream, SelectAll};
use futures::StreamExt;

use crate::cache::LocalCache;
use crate::data_model::{
    CacheEntry, Effect, IncomingAction, InitialSeed, NewEventRecord, ReducerManifest, Responders,
    Signal, SnapshotRecord, StreamMachine,
};
use crate::store::{Error, LogStore, Result};
use crate::{ListenerKey, SharedReducer};

/// The caller's initial value for a stream: available immediately, or
/// resolving later (e.g. seeded from the previous version of the stream).
pub enum InitialValue<S> {
    Now(S),
    Deferred(LocalBoxFuture<'static, S>),
}

/// Why an emission settled without a response.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("stream {0} is not open")]
    UnknownStream(String),

    #[error("the action could not be encoded: {0}")]
    Encode(String),

    #[error("appending the action failed: {0}")]
    Append(String),

    #[error("the stream was closed before the action was folded")]
    Closed,
}

struct StreamSlot {
    typed: Box<dyn Any>,
    dirty: bool,
    abort: AbortHandle,
}

struct TypedSlot<R: SharedReducer> {
    machine: StreamMachine<R>,
    responders: Responders<R::Response>,
}

/// What a stream driver multiplexes over.
enum Feed<R: SharedReducer> {
    Signal(Signal<R>),
    Snapshot(Result<Option<SnapshotRecord>>),
    Record(crate::data_model::EventRecord),
}

pub struct Engine<L, C> {
    inner: Rc<Inner<L, C>>,
}

impl<L, C> Clone for Engine<L, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<L, C> {
    store: L,
    cache: C,
    streams: RefCell<HashMap<String, StreamSlot>>,
    listeners: RefCell<slotmap::SlotMap<slotmap::DefaultKey, Arc<dyn Fn(String)>>>,
}

fn downcast_slot<'a, R: SharedReducer + 'static>(
    slot: &'a mut StreamSlot,
    name: &str,
) -> &'a mut TypedSlot<R> {
    slot.typed
        .downcast_mut::<TypedSlot<R>>()
        .unwrap_or_else(|| {
            panic!(
                "Type mismatch: stream {name} is open with a different reducer type than the one requested. Note: requested reducer = {:?}",
                std::any::type_name::<R>()
            )
        })
}

impl<L: LogStore + 'static, C: LocalCache + 'static> Engine<L, C> {
    pub fn new(store: L, cache: C) -> Self {
        Self {
            inner: Rc::new(Inner {
                store,
                cache,
                streams: RefCell::new(HashMap::new()),
                listeners: RefCell::new(slotmap::SlotMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &L {
        &self.inner.store
    }

    /// The listener is invoked with the stream name whenever a stream's
    /// observable value may have changed.
    pub fn subscribe(&self, listener: impl Fn(String) + 'static) -> ListenerKey {
        ListenerKey(self.inner.listeners.borrow_mut().insert(Arc::new(listener)))
    }

    /// Unregister a previously registered listener.
    pub fn unsubscribe(&self, key: ListenerKey) {
        self.inner.listeners.borrow_mut().remove(key.0);
    }

    fn drain_due_notifications(&self) -> Vec<Box<dyn FnOnce()>> {
        let mut notifications: Vec<Box<dyn FnOnce()>> = Vec::new();
        let mut streams = self.inner.streams.borrow_mut();
        let listeners = self.inner.listeners.borrow();
        for (name, slot) in streams.iter_mut() {
            if !slot.dirty {
                continue;
            }
            slot.dirty = false;
            for (_, listener) in listeners.iter() {
                let listener = listener.clone();
                let name = name.clone();
                notifications.push(Box::new(move || listener(name)));
            }
        }
        notifications
    }

    /// Flush pending notifications. Collected first, run after the borrow is
    /// released: the callbacks usually call straight back into the engine.
    pub fn flush_notifications(&self) {
        let notifications = self.drain_due_notifications();
        for notification in notifications {
            notification();
        }
    }

    /// Register a stream and hand back its driver. The driver must be
    /// spawned; it owns the startup sequencing (manifest check, snapshot
    /// fetch, live subscription) and runs until the stream is closed. It
    /// resolves with an error only on conditions that make the stream
    /// unusable, reducer mismatch above all.
    pub fn open_stream<R: SharedReducer + 'static>(
        &self,
        name: &str,
        reducer: R,
        initial: InitialValue<R::State>,
    ) -> LocalBoxFuture<'static, Result<()>> {
        let name = name.to_string();
        if self.inner.streams.borrow().contains_key(&name) {
            log::debug!("Stream {name} is already open");
            return Box::pin(futures::future::ready(Ok(())));
        }

        let cached = self.inner.cache.get(&name).and_then(|entry| {
            match serde_json::from_value::<R::State>(entry.value) {
                Ok(value) => Some(value),
                Err(e) => {
                    // only costs the warm start
                    log::warn!("Ignoring incompatible cached value for {name}: {e}");
                    None
                }
            }
        });

        let (seed, deferred) = match initial {
            InitialValue::Now(value) => (InitialSeed::Now(value), None),
            InitialValue::Deferred(fut) => (InitialSeed::Deferred, Some(fut)),
        };

        let (abort, registration) = AbortHandle::new_pair();
        self.inner.streams.borrow_mut().insert(
            name.clone(),
            StreamSlot {
                typed: Box::new(TypedSlot::<R> {
                    machine: StreamMachine::new(reducer, seed, cached),
                    responders: Responders::default(),
                }),
                // a newly opened stream is itself worth a notification
                dirty: true,
                abort,
            },
        );

        let engine = self.clone();
        Box::pin(async move {
            match Abortable::new(engine.drive::<R>(name, deferred), registration).await {
                Ok(result) => result,
                Err(futures::future::Aborted) => Ok(()),
            }
        })
    }

    /// Tear a stream down: cancel its driver and live subscription, drop its
    /// machine and any still-pending responses.
    pub fn close_stream(&self, name: &str) {
        if let Some(slot) = self.inner.streams.borrow_mut().remove(name) {
            slot.abort.abort();
        }
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.inner.streams.borrow().contains_key(name)
    }

    /// The settled value of a stream. `None` while it is still loading (or
    /// after it was poisoned), which is what gates composed views.
    pub fn ready_state<R: SharedReducer + 'static>(&self, name: &str) -> Option<R::State> {
        let mut streams = self.inner.streams.borrow_mut();
        let slot = streams.get_mut(name)?;
        downcast_slot::<R>(slot, name).machine.ready_state().cloned()
    }

    /// The best value to show right now, falling back to the cached
    /// warm-start value while the stream is loading.
    pub fn display_state<R: SharedReducer + 'static>(&self, name: &str) -> Option<R::State> {
        let mut streams = self.inner.streams.borrow_mut();
        let slot = streams.get_mut(name)?;
        downcast_slot::<R>(slot, name)
            .machine
            .display_state()
            .cloned()
    }

    pub fn is_poisoned<R: SharedReducer + 'static>(&self, name: &str) -> bool {
        let mut streams = self.inner.streams.borrow_mut();
        let Some(slot) = streams.get_mut(name) else {
            return false;
        };
        downcast_slot::<R>(slot, name).machine.is_poisoned()
    }

    /// Submit an action. The returned future settles when the action has been
    /// folded: with the reducer's response if it resolved one, with `None` if
    /// it stayed silent, or with an [`EmitError`] if the append failed or the
    /// stream went away first.
    pub fn emit<R: SharedReducer + 'static>(
        &self,
        name: &str,
        action: R::Action,
    ) -> LocalBoxFuture<'static, std::result::Result<Option<R::Response>, EmitError>> {
        let name = name.to_string();
        let correlation_id = eyedee::fresh_correlation_id();

        let prepared = serde_json::to_value(&action)
            .map_err(|e| EmitError::Encode(e.to_string()))
            .and_then(|value| {
                let mut streams = self.inner.streams.borrow_mut();
                let slot = streams
                    .get_mut(&name)
                    .ok_or_else(|| EmitError::UnknownStream(name.clone()))?;
                let rx = downcast_slot::<R>(slot, &name)
                    .responders
                    .register(correlation_id);
                Ok((
                    NewEventRecord {
                        value,
                        correlation_id,
                    },
                    rx,
                ))
            });

        let engine = self.clone();
        Box::pin(async move {
            let (record, rx) = prepared?;
            if let Err(e) = engine.inner.store.append(&name, record).await {
                log::error!("Error emitting event: {e}");
                // forget the pending response so the emitter gets an explicit
                // failure instead of waiting forever
                if let Some(slot) = engine.inner.streams.borrow_mut().get_mut(&name) {
                    downcast_slot::<R>(slot, &name)
                        .responders
                        .discard(correlation_id);
                }
                return Err(EmitError::Append(e.to_string()));
            }
            match rx.await {
                Ok(response) => Ok(response),
                Err(futures::channel::oneshot::Canceled) => Err(EmitError::Closed),
            }
        })
    }

    /// An initial value resolved from the latest reduced value of another
    /// stream, the migration path when a stream version is bumped. Missing or
    /// unreadable predecessors seed fresh.
    pub fn seed_from<S>(&self, name: &str) -> InitialValue<S>
    where
        S: serde::de::DeserializeOwned + Default + 'static,
    {
        let fetch = self.inner.store.latest_snapshot(name);
        let name = name.to_string();
        InitialValue::Deferred(Box::pin(async move {
            match fetch.await {
                Ok(Some(snapshot)) => match serde_json::from_value(snapshot.value) {
                    Ok(value) => value,
                    Err(e) => {
                        log::warn!("Could not decode the latest value of {name}; seeding fresh: {e}");
                        S::default()
                    }
                },
                Ok(None) => S::default(),
                Err(e) => {
                    log::warn!("Could not fetch the latest value of {name}; seeding fresh: {e}");
                    S::default()
                }
            }
        }))
    }

    async fn drive<R: SharedReducer + 'static>(
        self,
        name: String,
        mut deferred: Option<LocalBoxFuture<'static, R::State>>,
    ) -> Result<()> {
        // a client whose reducer disagrees with the registered manifest must
        // never fold a single record
        if let Some(manifest) = self.inner.store.reducer_manifest(&name).await? {
            let (matches, initial_differs) = {
                let mut streams = self.inner.streams.borrow_mut();
                let Some(slot) = streams.get_mut(&name) else {
                    return Ok(());
                };
                let typed = downcast_slot::<R>(slot, &name);
                let matches = manifest.matches(typed.machine.reducer().definition());
                let initial_differs = typed.machine.initial_now().is_some_and(|initial| {
                    serde_json::to_value(initial)
                        .map(|value| value != manifest.initial)
                        .unwrap_or(false)
                });
                (matches, initial_differs)
            };
            if !matches {
                self.apply_signal::<R>(&name, Signal::ReducerMismatch);
                self.flush_notifications();
                log::error!(
                    "The reducer supplied to {name} does not match the reducer initially supplied. Bump the stream version and migrate over data from {name} to create a new stream."
                );
                return Err(Error::ReducerMismatch { stream: name });
            }
            if initial_differs {
                log::warn!(
                    "Initial value supplied to reducer {name} is ignored because one is already registered"
                );
            }
        }

        let (self_tx, self_rx) = mpsc::unbounded::<Signal<R>>();

        let mut sources: SelectAll<LocalBoxStream<'static, Feed<R>>> = SelectAll::new();
        sources.push(self_rx.map(Feed::Signal).boxed_local());
        sources.push(
            stream::once(self.inner.store.latest_snapshot(&name))
                .map(Feed::Snapshot)
                .boxed_local(),
        );
        sources.push(
            self.inner
                .store
                .subscribe_latest(&name)
                .map(Feed::Record)
                .boxed_local(),
        );

        // registration is itself a signal, so records that outrun it are
        // buffered rather than dropped
        let _ = self_tx.unbounded_send(Signal::Register(self_tx.clone()));
        drop(self_tx);

        while let Some(feed) = sources.next().await {
            let signal = match feed {
                Feed::Signal(signal) => signal,
                Feed::Snapshot(Ok(Some(snapshot))) => {
                    let value =
                        serde_json::from_value::<R::State>(snapshot.value).map_err(|source| {
                            Error::Decode {
                                stream: name.clone(),
                                source,
                            }
                        })?;
                    Signal::SnapshotFound {
                        value,
                        ts: snapshot.ts,
                    }
                }
                Feed::Snapshot(Ok(None)) => Signal::SnapshotMissing,
                Feed::Snapshot(Err(e)) => return Err(e),
                Feed::Record(record) => {
                    let action =
                        serde_json::from_value::<R::Action>(record.value).map_err(|source| {
                            Error::Decode {
                                stream: name.clone(),
                                source,
                            }
                        })?;
                    Signal::Incoming(IncomingAction {
                        action,
                        ts: record.ts,
                        correlation_id: record.correlation_id,
                    })
                }
            };

            let Some(effects) = self.apply_signal::<R>(&name, signal) else {
                // closed under us
                return Ok(());
            };

            for effect in effects {
                self.run_effect::<R>(&name, effect, &mut deferred, &mut sources)
                    .await;
            }

            self.flush_notifications();
        }

        Ok(())
    }

    fn apply_signal<R: SharedReducer + 'static>(
        &self,
        name: &str,
        signal: Signal<R>,
    ) -> Option<Vec<Effect<R>>> {
        let mut streams = self.inner.streams.borrow_mut();
        let slot = streams.get_mut(name)?;
        let poisoning = matches!(signal, Signal::ReducerMismatch);
        let typed = downcast_slot::<R>(slot, name);
        let effects = typed.machine.apply(signal, &mut typed.responders);
        if !effects.is_empty() || poisoning {
            slot.dirty = true;
        }
        Some(effects)
    }

    async fn run_effect<R: SharedReducer + 'static>(
        &self,
        name: &str,
        effect: Effect<R>,
        deferred: &mut Option<LocalBoxFuture<'static, R::State>>,
        sources: &mut SelectAll<LocalBoxStream<'static, Feed<R>>>,
    ) {
        match effect {
            Effect::CacheWrite { value, ts } => match serde_json::to_value(&value) {
                Ok(value) => self.inner.cache.set(name, &CacheEntry { value, ts }),
                Err(e) => log::error!("Failed to encode cache value for {name}: {e}"),
            },
            Effect::PersistSnapshot { value, ts } => match serde_json::to_value(&value) {
                Ok(value) => {
                    if let Err(e) = self
                        .inner
                        .store
                        .persist_snapshot(name, SnapshotRecord { value, ts })
                        .await
                    {
                        // the next successful fold writes a fresh one
                        log::error!("Failed to persist snapshot for {name}: {e}");
                    }
                }
                Err(e) => log::error!("Failed to encode snapshot for {name}: {e}"),
            },
            Effect::RegisterManifest { initial } => {
                let definition = {
                    let mut streams = self.inner.streams.borrow_mut();
                    let Some(slot) = streams.get_mut(name) else {
                        return;
                    };
                    downcast_slot::<R>(slot, name)
                        .machine
                        .reducer()
                        .definition()
                        .to_string()
                };
                match serde_json::to_value(&initial) {
                    Ok(initial) => {
                        let manifest = ReducerManifest::new(&definition, initial);
                        if let Err(e) = self.inner.store.register_manifest(name, manifest).await {
                            log::error!("Failed to register reducer manifest for {name}: {e}");
                        }
                    }
                    Err(e) => log::error!("Failed to encode initial value for {name}: {e}"),
                }
            }
            Effect::AwaitInitialValue { handle } => {
                if let Some(fut) = deferred.take() {
                    sources.push(
                        stream::once(async move {
                            let value = fut.await;
                            // completion re-enters as a self-dispatched signal
                            let _ = handle.unbounded_send(Signal::InitialValueReady(value));
                        })
                        .filter_map(|()| futures::future::ready(None::<Feed<R>>))
                        .boxed_local(),
                    );
                } else {
                    log::error!("Stream {name} asked for a deferred initial value it does not have");
                }
            }
        }
    }
}
