//! # Responders
//! When a client submits an action it gets a future that settles once the action has been folded.
//! The table below holds the pending half of those futures, keyed by correlation id, owned by the
//! engine instance that created them (per process; never persisted). An entry is removed exactly
//! once: either the reducer resolves it with a response while folding, or the engine resolves it
//! with `None` right after the fold. Records submitted by other clients carry correlation ids this
//! table has never seen, and claiming those yields an inert responder that ignores resolution.

use std::collections::HashMap;

use futures::channel::oneshot;

pub struct Responders<Resp> {
    pending: HashMap<u64, oneshot::Sender<Option<Resp>>>,
}

impl<Resp> Default for Responders<Resp> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<Resp> Responders<Resp> {
    /// Register a pending response under a fresh correlation id and hand back
    /// the receiving half for the emitter to await.
    pub fn register(&mut self, correlation_id: u64) -> oneshot::Receiver<Option<Resp>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, tx);
        rx
    }

    /// Remove the entry for a correlation id, returning a single-use handle.
    /// Unknown ids (records emitted by other clients) yield an inert handle.
    pub fn claim(&mut self, correlation_id: u64) -> Responder<Resp> {
        Responder {
            slot: self.pending.remove(&correlation_id),
        }
    }

    /// Drop a pending entry without resolving it, e.g. when the append that
    /// would have produced the matching record failed.
    pub fn discard(&mut self, correlation_id: u64) {
        self.pending.remove(&correlation_id);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Handle a reducer may use to settle the emitter's pending future with a
/// response. The first resolution wins; later calls are no-ops.
pub struct Responder<Resp> {
    slot: Option<oneshot::Sender<Option<Resp>>>,
}

impl<Resp> Responder<Resp> {
    /// A responder connected to nothing. Resolving it does nothing.
    pub fn inert() -> Self {
        Self { slot: None }
    }

    /// A responder paired with a receiver, for exercising reducers directly.
    pub fn capture() -> (Self, oneshot::Receiver<Option<Resp>>) {
        let (tx, rx) = oneshot::channel();
        (Self { slot: Some(tx) }, rx)
    }

    pub fn resolve(&mut self, response: Resp) {
        if let Some(tx) = self.slot.take() {
            let _ = tx.send(Some(response));
        }
    }

    /// Resolve with `None` if the reducer did not resolve explicitly, so
    /// every emission settles. Called by the engine after each fold.
    pub(crate) fn finish(mut self) {
        if let Some(tx) = self.slot.take() {
            let _ = tx.send(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_resolution_wins_and_entries_are_removed_once() {
        let mut responders: Responders<i32> = Responders::default();
        let mut rx = responders.register(7);

        let mut responder = responders.claim(7);
        responder.resolve(1);
        responder.resolve(2);
        responder.finish();

        assert_eq!(rx.try_recv(), Ok(Some(Some(1))));
        assert!(responders.is_empty());

        // claiming again yields an inert handle
        let mut again = responders.claim(7);
        again.resolve(3);
    }

    #[test]
    fn finish_resolves_with_none_when_the_reducer_stayed_silent() {
        let mut responders: Responders<i32> = Responders::default();
        let mut rx = responders.register(9);

        let responder = responders.claim(9);
        responder.finish();

        assert_eq!(rx.try_recv(), Ok(Some(None)));
    }

    #[test]
    fn discard_leaves_the_receiver_cancelled() {
        let mut responders: Responders<i32> = Responders::default();
        let mut rx = responders.register(3);

        responders.discard(3);

        assert!(rx.try_recv().is_err());
    }
}
