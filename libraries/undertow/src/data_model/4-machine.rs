//! # StreamMachine
//! Startup sequencing for a stream. A fresh client cannot fold live records right away: it must
//! first wire its self-dispatch channel, then learn whether the stream already has a remote
//! snapshot, and if not, wait for the caller's (possibly deferred) initial value. Records that
//! arrive while that is still in flight are buffered and replayed in order once folding becomes
//! possible, so nothing is lost even when the live feed outruns the baseline. The timestamp guard
//! (`ts > last_applied`) makes the replay discard anything the baseline already covered.
//!
//! The machine is a closed set of phases with one transition function. It performs no I/O itself:
//! each transition hands back the [`Effect`]s to run (cache write, snapshot persist, manifest
//! registration), which keeps folding deterministic and testable without a backend.

use chrono::{DateTime, Utc};
use futures::channel::mpsc::UnboundedSender;

use super::Responders;
use crate::SharedReducer;

/// Channel a stream uses to dispatch signals back to itself, e.g. when the
/// caller's deferred initial value finally resolves.
pub type SelfHandle<R> = UnboundedSender<Signal<R>>;

/// A live record, decoded and ready to fold.
pub struct IncomingAction<R: SharedReducer> {
    pub action: R::Action,
    pub ts: DateTime<Utc>,
    pub correlation_id: u64,
}

/// Everything that can happen to a stream.
pub enum Signal<R: SharedReducer> {
    /// The engine wired this stream's self-dispatch channel.
    Register(SelfHandle<R>),
    /// The one-shot fetch of the latest remote snapshot found one.
    SnapshotFound {
        value: R::State,
        ts: Option<DateTime<Utc>>,
    },
    /// The one-shot fetch of the latest remote snapshot came back empty.
    SnapshotMissing,
    /// The caller's deferred initial value resolved.
    InitialValueReady(R::State),
    /// A record arrived on the live subscription.
    Incoming(IncomingAction<R>),
    /// The manifest registered under this stream name was produced by a
    /// different reducer definition.
    ReducerMismatch,
}

/// Side effects a transition asks the driver to run, in order.
pub enum Effect<R: SharedReducer> {
    /// Write the new value to the local cache.
    CacheWrite {
        value: R::State,
        ts: Option<DateTime<Utc>>,
    },
    /// Persist the new value as the stream's latest remote snapshot.
    PersistSnapshot {
        value: R::State,
        ts: Option<DateTime<Utc>>,
    },
    /// First use of this stream name: register the reducer's manifest.
    RegisterManifest { initial: R::State },
    /// Start waiting on the caller's deferred initial value; its completion
    /// comes back through `handle` as [`Signal::InitialValueReady`].
    AwaitInitialValue { handle: SelfHandle<R> },
}

/// Whether the caller's initial value is available immediately or resolves
/// later (e.g. seeded from the previous version of the stream).
pub enum InitialSeed<S> {
    Now(S),
    Deferred,
}

enum Phase<R: SharedReducer> {
    /// No self-dispatch handle yet; anything that arrives early is buffered.
    AwaitingRegistration { pending: Vec<IncomingAction<R>> },
    /// Registered; the one-shot snapshot fetch is in flight.
    AwaitingSnapshot {
        handle: SelfHandle<R>,
        pending: Vec<IncomingAction<R>>,
    },
    /// No snapshot exists remotely; the deferred initial value is resolving.
    AwaitingInitialValue { pending: Vec<IncomingAction<R>> },
    /// Steady state: new records fold immediately.
    Ready {
        current: R::State,
        last_applied: Option<DateTime<Utc>>,
    },
    /// Terminal: this client's reducer disagrees with the one registered for
    /// the stream name.
    Poisoned { last_known: Option<R::State> },
}

pub struct StreamMachine<R: SharedReducer> {
    reducer: R,
    seed: InitialSeed<R::State>,
    /// Warm-start value read from the local cache, shown while loading.
    cached: Option<R::State>,
    phase: Phase<R>,
}

impl<R: SharedReducer> StreamMachine<R> {
    pub fn new(reducer: R, seed: InitialSeed<R::State>, cached: Option<R::State>) -> Self {
        Self {
            reducer,
            seed,
            cached,
            phase: Phase::AwaitingRegistration {
                pending: Vec::new(),
            },
        }
    }

    pub fn reducer(&self) -> &R {
        &self.reducer
    }

    /// The synchronous initial value, if there is one. Used to warn when it
    /// diverges from the value already registered in the manifest.
    pub fn initial_now(&self) -> Option<&R::State> {
        match &self.seed {
            InitialSeed::Now(value) => Some(value),
            InitialSeed::Deferred => None,
        }
    }

    /// The settled value. `None` until the machine reaches its steady state.
    pub fn ready_state(&self) -> Option<&R::State> {
        match &self.phase {
            Phase::Ready { current, .. } => Some(current),
            _ => None,
        }
    }

    /// The best value to show right now: the settled value once there is one,
    /// otherwise the cached warm-start value (optimistic first paint).
    pub fn display_state(&self) -> Option<&R::State> {
        match &self.phase {
            Phase::Ready { current, .. } => Some(current),
            Phase::Poisoned { last_known } => last_known.as_ref(),
            _ => self.cached.as_ref(),
        }
    }

    pub fn is_poisoned(&self) -> bool {
        matches!(self.phase, Phase::Poisoned { .. })
    }

    /// Advance the machine by one signal, resolving responders as folds run.
    /// Returns the side effects the caller must execute, in order.
    pub fn apply(
        &mut self,
        signal: Signal<R>,
        responders: &mut Responders<R::Response>,
    ) -> Vec<Effect<R>> {
        let phase = std::mem::replace(
            &mut self.phase,
            Phase::AwaitingRegistration {
                pending: Vec::new(),
            },
        );
        let mut effects = Vec::new();
        self.phase = self.step(phase, signal, responders, &mut effects);
        effects
    }

    fn step(
        &self,
        phase: Phase<R>,
        signal: Signal<R>,
        responders: &mut Responders<R::Response>,
        effects: &mut Vec<Effect<R>>,
    ) -> Phase<R> {
        match (phase, signal) {
            // terminal; nothing revives a poisoned stream
            (phase @ Phase::Poisoned { .. }, _) => phase,

            (phase, Signal::ReducerMismatch) => Phase::Poisoned {
                last_known: self.observable_value(&phase),
            },

            (Phase::AwaitingRegistration { pending }, Signal::Register(handle)) => {
                Phase::AwaitingSnapshot { handle, pending }
            }
            (Phase::AwaitingRegistration { mut pending }, Signal::Incoming(record)) => {
                pending.push(record);
                Phase::AwaitingRegistration { pending }
            }
            (phase @ Phase::AwaitingRegistration { .. }, _) => phase,

            // already registered
            (phase, Signal::Register(_)) => phase,

            (Phase::AwaitingSnapshot { pending, .. }, Signal::SnapshotFound { value, ts }) => {
                effects.push(Effect::CacheWrite {
                    value: value.clone(),
                    ts,
                });
                self.replay(
                    Phase::Ready {
                        current: value,
                        last_applied: ts,
                    },
                    pending,
                    responders,
                    effects,
                )
            }
            (Phase::AwaitingSnapshot { handle, pending }, Signal::SnapshotMissing) => {
                match &self.seed {
                    InitialSeed::Now(initial) => {
                        self.settle(initial.clone(), pending, responders, effects)
                    }
                    InitialSeed::Deferred => {
                        effects.push(Effect::AwaitInitialValue { handle });
                        Phase::AwaitingInitialValue { pending }
                    }
                }
            }
            (Phase::AwaitingSnapshot { handle, mut pending }, Signal::Incoming(record)) => {
                pending.push(record);
                Phase::AwaitingSnapshot { handle, pending }
            }
            (phase @ Phase::AwaitingSnapshot { .. }, Signal::InitialValueReady(_)) => phase,

            (Phase::AwaitingInitialValue { pending }, Signal::InitialValueReady(value)) => {
                self.settle(value, pending, responders, effects)
            }
            (Phase::AwaitingInitialValue { mut pending }, Signal::Incoming(record)) => {
                pending.push(record);
                Phase::AwaitingInitialValue { pending }
            }
            (phase @ Phase::AwaitingInitialValue { .. }, _) => phase,

            (
                Phase::Ready {
                    current,
                    last_applied,
                },
                Signal::Incoming(record),
            ) => {
                if last_applied.is_none_or(|applied| record.ts > applied) {
                    let mut responder = responders.claim(record.correlation_id);
                    let next = self.reducer.reduce(current, record.action, &mut responder);
                    responder.finish();
                    effects.push(Effect::CacheWrite {
                        value: next.clone(),
                        ts: Some(record.ts),
                    });
                    effects.push(Effect::PersistSnapshot {
                        value: next.clone(),
                        ts: Some(record.ts),
                    });
                    Phase::Ready {
                        current: next,
                        last_applied: Some(record.ts),
                    }
                } else {
                    // stale or duplicate delivery
                    Phase::Ready {
                        current,
                        last_applied,
                    }
                }
            }
            (phase @ Phase::Ready { .. }, _) => phase,
        }
    }

    /// Fold the initial value in, register the manifest, and replay whatever
    /// was buffered while the baseline was being established.
    fn settle(
        &self,
        initial: R::State,
        pending: Vec<IncomingAction<R>>,
        responders: &mut Responders<R::Response>,
        effects: &mut Vec<Effect<R>>,
    ) -> Phase<R> {
        effects.push(Effect::RegisterManifest {
            initial: initial.clone(),
        });
        effects.push(Effect::CacheWrite {
            value: initial.clone(),
            ts: None,
        });
        effects.push(Effect::PersistSnapshot {
            value: initial.clone(),
            ts: None,
        });
        self.replay(
            Phase::Ready {
                current: initial,
                last_applied: None,
            },
            pending,
            responders,
            effects,
        )
    }

    fn replay(
        &self,
        mut phase: Phase<R>,
        pending: Vec<IncomingAction<R>>,
        responders: &mut Responders<R::Response>,
        effects: &mut Vec<Effect<R>>,
    ) -> Phase<R> {
        for record in pending {
            phase = self.step(phase, Signal::Incoming(record), responders, effects);
        }
        phase
    }

    fn observable_value(&self, phase: &Phase<R>) -> Option<R::State> {
        match phase {
            Phase::Ready { current, .. } => Some(current.clone()),
            Phase::Poisoned { last_known } => last_known.clone(),
            _ => self.cached.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use futures::channel::mpsc;

    use super::*;
    use crate::data_model::Responder;

    struct Adder;

    #[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
    struct Add(i64);

    impl SharedReducer for Adder {
        type State = i64;
        type Action = Add;
        type Response = i64;

        fn definition(&self) -> &str {
            "adder"
        }

        fn reduce(&self, state: i64, action: Add, responder: &mut Responder<i64>) -> i64 {
            let next = state + action.0;
            responder.resolve(next);
            next
        }
    }

    struct Silent;

    impl SharedReducer for Silent {
        type State = i64;
        type Action = Add;
        type Response = i64;

        fn definition(&self) -> &str {
            "silent adder"
        }

        fn reduce(&self, state: i64, action: Add, _responder: &mut Responder<i64>) -> i64 {
            state + action.0
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn incoming<R: SharedReducer<Action = Add>>(n: i64, at: i64) -> Signal<R> {
        Signal::Incoming(IncomingAction {
            action: Add(n),
            ts: ts(at),
            correlation_id: 0,
        })
    }

    fn handle<R: SharedReducer>() -> SelfHandle<R> {
        mpsc::unbounded().0
    }

    fn ready_machine(initial: i64) -> (StreamMachine<Adder>, Responders<i64>) {
        let mut machine = StreamMachine::new(Adder, InitialSeed::Now(initial), None);
        let mut responders = Responders::default();
        machine.apply(Signal::Register(handle()), &mut responders);
        machine.apply(Signal::SnapshotMissing, &mut responders);
        assert_eq!(machine.ready_state(), Some(&initial));
        (machine, responders)
    }

    #[test]
    fn records_buffered_before_registration_fold_after_the_baseline() {
        let mut machine = StreamMachine::new(Adder, InitialSeed::Now(0), None);
        let mut responders = Responders::default();

        machine.apply(incoming(5, 1), &mut responders);
        machine.apply(incoming(3, 2), &mut responders);
        assert_eq!(machine.ready_state(), None);

        machine.apply(Signal::Register(handle()), &mut responders);
        let effects = machine.apply(Signal::SnapshotMissing, &mut responders);

        assert_eq!(machine.ready_state(), Some(&8));
        assert!(matches!(effects[0], Effect::RegisterManifest { initial: 0 }));

        // same result as folding the same records directly from the steady state
        let (mut direct, mut direct_responders) = ready_machine(0);
        direct.apply(incoming(5, 1), &mut direct_responders);
        direct.apply(incoming(3, 2), &mut direct_responders);
        assert_eq!(direct.ready_state(), machine.ready_state());
    }

    #[test]
    fn replaying_an_applied_record_changes_nothing() {
        let (mut machine, mut responders) = ready_machine(0);

        machine.apply(incoming(5, 1), &mut responders);
        machine.apply(incoming(3, 2), &mut responders);
        assert_eq!(machine.ready_state(), Some(&8));

        let effects = machine.apply(incoming(5, 1), &mut responders);
        assert!(effects.is_empty());
        assert_eq!(machine.ready_state(), Some(&8));

        // equal timestamps count as duplicates too
        let effects = machine.apply(incoming(3, 2), &mut responders);
        assert!(effects.is_empty());
        assert_eq!(machine.ready_state(), Some(&8));
    }

    #[test]
    fn snapshot_seeds_the_baseline_and_replays_only_fresh_buffered_records() {
        let mut machine = StreamMachine::new(Adder, InitialSeed::Now(0), None);
        let mut responders = Responders::default();

        machine.apply(Signal::Register(handle()), &mut responders);
        machine.apply(incoming(2, 1), &mut responders); // covered by the snapshot
        machine.apply(incoming(7, 5), &mut responders); // fresh
        let effects = machine.apply(
            Signal::SnapshotFound {
                value: 10,
                ts: Some(ts(3)),
            },
            &mut responders,
        );

        assert_eq!(machine.ready_state(), Some(&17));
        assert!(matches!(
            effects[0],
            Effect::CacheWrite { value: 10, ts: Some(_) }
        ));
    }

    #[test]
    fn deferred_initial_value_buffers_until_it_resolves() {
        let mut machine = StreamMachine::new(Adder, InitialSeed::Deferred, None);
        let mut responders = Responders::default();

        machine.apply(Signal::Register(handle()), &mut responders);
        let effects = machine.apply(Signal::SnapshotMissing, &mut responders);
        assert!(matches!(effects[0], Effect::AwaitInitialValue { .. }));

        machine.apply(incoming(4, 2), &mut responders);
        assert_eq!(machine.ready_state(), None);

        machine.apply(Signal::InitialValueReady(100), &mut responders);
        assert_eq!(machine.ready_state(), Some(&104));
    }

    #[test]
    fn mismatch_is_terminal() {
        let (mut machine, mut responders) = ready_machine(0);
        machine.apply(incoming(8, 1), &mut responders);

        machine.apply(Signal::ReducerMismatch, &mut responders);
        assert!(machine.is_poisoned());
        assert_eq!(machine.display_state(), Some(&8));

        let effects = machine.apply(incoming(5, 9), &mut responders);
        assert!(effects.is_empty());
        assert!(machine.is_poisoned());
        assert_eq!(machine.ready_state(), None);
        assert_eq!(machine.display_state(), Some(&8));
    }

    #[test]
    fn duplicate_redelivery_converges_across_machines() {
        let deliveries_a = [(5, 1), (5, 1), (3, 2), (2, 4)];
        let deliveries_b = [(5, 1), (3, 2), (3, 2), (2, 4), (2, 4)];

        let mut finals = Vec::new();
        for deliveries in [&deliveries_a[..], &deliveries_b[..]] {
            let (mut machine, mut responders) = ready_machine(0);
            for &(n, at) in deliveries {
                machine.apply(incoming(n, at), &mut responders);
            }
            finals.push(*machine.ready_state().unwrap());
        }

        assert_eq!(finals[0], finals[1]);
        assert_eq!(finals[0], 10);
    }

    #[test]
    fn cached_value_shows_while_loading_but_is_never_folded() {
        let mut machine = StreamMachine::new(Adder, InitialSeed::Now(0), Some(42));
        let mut responders = Responders::default();

        assert_eq!(machine.display_state(), Some(&42));
        assert_eq!(machine.ready_state(), None);

        machine.apply(Signal::Register(handle()), &mut responders);
        machine.apply(Signal::SnapshotMissing, &mut responders);
        assert_eq!(machine.ready_state(), Some(&0));
    }

    #[test]
    fn silent_reducer_still_settles_the_emitter_with_none() {
        let mut machine = StreamMachine::new(Silent, InitialSeed::Now(0), None);
        let mut responders = Responders::default();
        machine.apply(Signal::Register(handle()), &mut responders);
        machine.apply(Signal::SnapshotMissing, &mut responders);

        let mut rx = responders.register(42);
        machine.apply(
            Signal::Incoming(IncomingAction {
                action: Add(5),
                ts: ts(1),
                correlation_id: 42,
            }),
            &mut responders,
        );

        assert_eq!(rx.try_recv(), Ok(Some(None)));
        assert!(responders.is_empty());
    }

    #[test]
    fn resolving_reducer_reaches_the_emitter() {
        let (mut machine, mut responders) = ready_machine(10);

        let mut rx = responders.register(7);
        machine.apply(
            Signal::Incoming(IncomingAction {
                action: Add(3),
                ts: ts(1),
                correlation_id: 7,
            }),
            &mut responders,
        );

        assert_eq!(rx.try_recv(), Ok(Some(Some(13))));
    }
}
