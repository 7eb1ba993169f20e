//! One-shot acknowledgment handles and propagation primitives.
//!
//! Every [`Message`](crate::message::Message) carries an [`Acknowledgment`]:
//! a shared cell resolved at most once to acked or nacked. Resolving twice
//! is detected, logged, and reported as a contract violation instead of
//! crashing the pipeline. [`AckGroup`] tracks a round of derived messages
//! for 1:N propagation.

use crate::error::{nack_cause, MediatorError, NackCause};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

/// How an outbound Message's ack/nack relates to the inbound Message(s)
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Acknowledge the inbound Message as soon as it is handed to the
    /// user method, independent of downstream outcome.
    Pre,
    /// Acknowledge the inbound Message only once the derived outbound
    /// Message resolves; nacks propagate with the same cause.
    Post,
    /// The user method acknowledges explicitly; requires a shape that
    /// exposes the wrapped Message.
    Manual,
    /// The engine never resolves the Message.
    None,
}

/// Final state of an acknowledgment cell.
#[derive(Clone)]
pub enum AckOutcome {
    Acked,
    Nacked(NackCause),
}

impl AckOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, AckOutcome::Acked)
    }

    /// The failure cause, if this outcome is a nack
    pub fn cause(&self) -> Option<&NackCause> {
        match self {
            AckOutcome::Acked => None,
            AckOutcome::Nacked(cause) => Some(cause),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AckOutcome::Acked => "acked",
            AckOutcome::Nacked(_) => "nacked",
        }
    }
}

impl fmt::Debug for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckOutcome::Acked => write!(f, "Acked"),
            AckOutcome::Nacked(cause) => write!(f, "Nacked({cause})"),
        }
    }
}

type Observer = Box<dyn FnOnce(&AckOutcome) + Send>;

enum AckState {
    Pending(Vec<Observer>),
    Resolved(AckOutcome),
}

struct AckCell {
    state: Mutex<AckState>,
}

impl Drop for AckCell {
    fn drop(&mut self) {
        // Backstop: a cell dropped while pending resolves its observers to
        // nacked so no listener can hang on a vanished message.
        let state = self.state.get_mut();
        if let AckState::Pending(observers) =
            std::mem::replace(state, AckState::Resolved(AckOutcome::Acked))
        {
            if !observers.is_empty() {
                warn!("message dropped without acknowledgment");
                let outcome = AckOutcome::Nacked(nack_cause(anyhow::anyhow!(
                    "message dropped without acknowledgment"
                )));
                for observer in observers {
                    observer(&outcome);
                }
            }
        }
    }
}

/// Shared one-shot ack/nack handle with exactly-once-fire semantics.
#[derive(Clone)]
pub struct Acknowledgment {
    cell: Arc<AckCell>,
}

impl Default for Acknowledgment {
    fn default() -> Self {
        Self::new()
    }
}

impl Acknowledgment {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(AckCell {
                state: Mutex::new(AckState::Pending(Vec::new())),
            }),
        }
    }

    /// Resolve as acknowledged. Fails if the cell is already resolved.
    pub fn ack(&self) -> Result<(), MediatorError> {
        self.resolve(AckOutcome::Acked)
    }

    /// Resolve as negatively acknowledged with a cause.
    pub fn nack(&self, cause: NackCause) -> Result<(), MediatorError> {
        self.resolve(AckOutcome::Nacked(cause))
    }

    /// Resolve the cell. A second resolution is logged as a contract
    /// violation and returned as [`MediatorError::Acknowledgment`].
    pub fn resolve(&self, outcome: AckOutcome) -> Result<(), MediatorError> {
        let observers = {
            let mut state = self.cell.state.lock();
            match &mut *state {
                AckState::Resolved(prior) => {
                    let detail = format!(
                        "message already {} when {} arrived",
                        prior.label(),
                        outcome.label()
                    );
                    warn!(%detail, "acknowledgment resolved more than once");
                    return Err(MediatorError::Acknowledgment { detail });
                }
                AckState::Pending(observers) => {
                    let observers = std::mem::take(observers);
                    *state = AckState::Resolved(outcome.clone());
                    observers
                }
            }
        };
        for observer in observers {
            observer(&outcome);
        }
        Ok(())
    }

    /// Resolve only if still pending. Used for teardown and chain
    /// propagation, where racing an explicit resolution is expected.
    pub(crate) fn resolve_if_pending(&self, outcome: AckOutcome) -> bool {
        let observers = {
            let mut state = self.cell.state.lock();
            match &mut *state {
                AckState::Resolved(_) => return false,
                AckState::Pending(observers) => {
                    let observers = std::mem::take(observers);
                    *state = AckState::Resolved(outcome.clone());
                    observers
                }
            }
        };
        for observer in observers {
            observer(&outcome);
        }
        true
    }

    pub fn is_resolved(&self) -> bool {
        matches!(&*self.cell.state.lock(), AckState::Resolved(_))
    }

    /// The resolved outcome, if any
    pub fn outcome(&self) -> Option<AckOutcome> {
        match &*self.cell.state.lock() {
            AckState::Resolved(outcome) => Some(outcome.clone()),
            AckState::Pending(_) => None,
        }
    }

    /// Run `f` when the cell resolves; immediately if it already has.
    pub fn on_resolve(&self, f: impl FnOnce(&AckOutcome) + Send + 'static) {
        let mut f = Some(f);
        let resolved = {
            let mut state = self.cell.state.lock();
            match &mut *state {
                AckState::Pending(observers) => {
                    if let Some(f) = f.take() {
                        observers.push(Box::new(f));
                    }
                    None
                }
                AckState::Resolved(outcome) => Some(outcome.clone()),
            }
        };
        if let (Some(outcome), Some(f)) = (resolved, f) {
            f(&outcome);
        }
    }

    /// Subscribe to the resolution of this cell.
    pub fn listen(&self) -> AckListener {
        let (tx, rx) = oneshot::channel();
        self.on_resolve(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        AckListener { rx }
    }

    /// Whether two handles share the same underlying cell
    pub fn same(a: &Acknowledgment, b: &Acknowledgment) -> bool {
        Arc::ptr_eq(&a.cell, &b.cell)
    }

    /// Propagate this cell's resolution to `parent` with the same outcome.
    /// A no-op when both handles share one cell.
    pub fn chain_to(&self, parent: Acknowledgment) {
        if Acknowledgment::same(self, &parent) {
            return;
        }
        self.on_resolve(move |outcome| {
            if !parent.resolve_if_pending(outcome.clone()) {
                tracing::debug!("acknowledgment chain target already resolved");
            }
        });
    }
}

impl fmt::Debug for Acknowledgment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.cell.state.lock() {
            AckState::Pending(_) => "pending",
            AckState::Resolved(AckOutcome::Acked) => "acked",
            AckState::Resolved(AckOutcome::Nacked(_)) => "nacked",
        };
        write!(f, "Acknowledgment({state})")
    }
}

/// Awaitable view of an acknowledgment (or group) resolution.
pub struct AckListener {
    rx: oneshot::Receiver<AckOutcome>,
}

impl AckListener {
    /// Wait for the resolution.
    pub async fn outcome(self) -> AckOutcome {
        self.rx.await.unwrap_or_else(|_| {
            AckOutcome::Nacked(nack_cause(anyhow::anyhow!(
                "acknowledgment observer dropped before resolution"
            )))
        })
    }
}

struct GroupState {
    outstanding: usize,
    sealed: bool,
    outcome: Option<AckOutcome>,
    observers: Vec<Observer>,
}

struct GroupInner {
    state: Mutex<GroupState>,
}

impl GroupInner {
    fn fire(state: &mut GroupState, outcome: AckOutcome) -> (AckOutcome, Vec<Observer>) {
        state.outcome = Some(outcome.clone());
        (outcome, std::mem::take(&mut state.observers))
    }

    fn child_resolved(inner: &Arc<GroupInner>, child: &AckOutcome) {
        let fired = {
            let mut state = inner.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            if state.outcome.is_some() {
                None
            } else if let AckOutcome::Nacked(cause) = child {
                // First nack fails the round immediately; siblings are
                // left to complete independently.
                Some(Self::fire(&mut state, AckOutcome::Nacked(cause.clone())))
            } else if state.sealed && state.outstanding == 0 {
                Some(Self::fire(&mut state, AckOutcome::Acked))
            } else {
                None
            }
        };
        if let Some((outcome, observers)) = fired {
            for observer in observers {
                observer(&outcome);
            }
        }
    }
}

/// Tracks one round of derived messages: resolves acked only after every
/// tracked acknowledgment acks, or nacked with the first failure cause.
#[derive(Clone)]
pub struct AckGroup {
    inner: Arc<GroupInner>,
}

impl Default for AckGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl AckGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GroupInner {
                state: Mutex::new(GroupState {
                    outstanding: 0,
                    sealed: false,
                    outcome: None,
                    observers: Vec::new(),
                }),
            }),
        }
    }

    /// Add a derived message's acknowledgment to the round.
    pub fn track(&self, ack: &Acknowledgment) {
        self.inner.state.lock().outstanding += 1;
        let inner = Arc::clone(&self.inner);
        ack.on_resolve(move |outcome| GroupInner::child_resolved(&inner, outcome));
    }

    /// Declare the round complete: no further members will be tracked.
    pub fn seal(&self) {
        let fired = {
            let mut state = self.inner.state.lock();
            state.sealed = true;
            if state.outcome.is_none() && state.outstanding == 0 {
                Some(GroupInner::fire(&mut state, AckOutcome::Acked))
            } else {
                None
            }
        };
        if let Some((outcome, observers)) = fired {
            for observer in observers {
                observer(&outcome);
            }
        }
    }

    /// The round outcome, if resolved
    pub fn outcome(&self) -> Option<AckOutcome> {
        self.inner.state.lock().outcome.clone()
    }

    /// Run `f` when the round resolves; immediately if it already has.
    pub fn on_resolve(&self, f: impl FnOnce(&AckOutcome) + Send + 'static) {
        let mut f = Some(f);
        let resolved = {
            let mut state = self.inner.state.lock();
            match &state.outcome {
                Some(outcome) => Some(outcome.clone()),
                None => {
                    if let Some(f) = f.take() {
                        state.observers.push(Box::new(f));
                    }
                    None
                }
            }
        };
        if let (Some(outcome), Some(f)) = (resolved, f) {
            f(&outcome);
        }
    }

    /// Subscribe to the round resolution.
    pub fn listen(&self) -> AckListener {
        let (tx, rx) = oneshot::channel();
        self.on_resolve(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        AckListener { rx }
    }

    /// Propagate the round outcome to a parent acknowledgment.
    pub fn chain_to(&self, parent: Acknowledgment) {
        self.on_resolve(move |outcome| {
            if !parent.resolve_if_pending(outcome.clone()) {
                tracing::debug!("group chain target already resolved");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_resolves_once() {
        let ack = Acknowledgment::new();
        assert!(ack.ack().is_ok());
        let second = ack.ack();
        assert!(matches!(
            second,
            Err(MediatorError::Acknowledgment { .. })
        ));
        assert!(ack.outcome().is_some_and(|o| o.is_acked()));
    }

    #[test]
    fn test_nack_after_ack_keeps_first_outcome() {
        let ack = Acknowledgment::new();
        ack.ack().unwrap();
        let err = ack.nack(nack_cause(anyhow::anyhow!("late")));
        assert!(err.is_err());
        assert!(ack.outcome().unwrap().is_acked());
    }

    #[tokio::test]
    async fn test_listener_sees_nack_cause() {
        let ack = Acknowledgment::new();
        let listener = ack.listen();
        ack.nack(nack_cause(anyhow::anyhow!("bad payload"))).unwrap();
        let outcome = listener.outcome().await;
        assert_eq!(
            outcome.cause().unwrap().to_string(),
            "bad payload"
        );
    }

    #[tokio::test]
    async fn test_chain_propagates_outcome() {
        let inbound = Acknowledgment::new();
        let outbound = Acknowledgment::new();
        outbound.chain_to(inbound.clone());

        let listener = inbound.listen();
        outbound.nack(nack_cause(anyhow::anyhow!("downstream refused"))).unwrap();
        let outcome = listener.outcome().await;
        assert_eq!(
            outcome.cause().unwrap().to_string(),
            "downstream refused"
        );
    }

    #[test]
    fn test_chain_to_self_is_noop() {
        let ack = Acknowledgment::new();
        ack.chain_to(ack.clone());
        assert!(ack.ack().is_ok());
    }

    #[tokio::test]
    async fn test_group_requires_every_member() {
        let group = AckGroup::new();
        let members: Vec<Acknowledgment> =
            (0..3).map(|_| Acknowledgment::new()).collect();
        for member in &members {
            group.track(member);
        }
        group.seal();

        members[0].ack().unwrap();
        members[1].ack().unwrap();
        assert!(group.outcome().is_none());

        members[2].ack().unwrap();
        assert!(group.outcome().unwrap().is_acked());
    }

    #[tokio::test]
    async fn test_group_fails_on_first_nack() {
        let group = AckGroup::new();
        let a = Acknowledgment::new();
        let b = Acknowledgment::new();
        group.track(&a);
        group.track(&b);
        group.seal();

        let listener = group.listen();
        a.nack(nack_cause(anyhow::anyhow!("first failure"))).unwrap();
        let outcome = listener.outcome().await;
        assert_eq!(outcome.cause().unwrap().to_string(), "first failure");

        // Siblings still complete independently.
        assert!(b.ack().is_ok());
        assert_eq!(
            group.outcome().unwrap().cause().unwrap().to_string(),
            "first failure"
        );
    }

    #[test]
    fn test_empty_sealed_group_completes() {
        let group = AckGroup::new();
        group.seal();
        assert!(group.outcome().unwrap().is_acked());
    }

    #[tokio::test]
    async fn test_dropped_cell_nacks_observers() {
        let ack = Acknowledgment::new();
        let listener = ack.listen();
        drop(ack);
        let outcome = listener.outcome().await;
        assert!(!outcome.is_acked());
    }
}
