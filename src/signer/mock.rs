//! Scriptable in-memory signer used by tests and the demo binary

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{watch, Mutex};
use tracing::debug;
use uuid::Uuid;

use super::{Signer, SignerError, TransactionHandle};
use crate::asset::Amount;

/// Outcome the mock produces for one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Confirm the full requested amount
    Confirm,
    /// Confirm at most the given amount
    ConfirmUpTo(Amount),
    /// Confirm exactly the given amount, even more than requested
    ConfirmExactly(Amount),
    /// Fail with the given error
    Fail(SignerError),
}

/// Signer double with scripted outcomes, a call log and an optional hold gate
pub struct MockSigner {
    script: Mutex<VecDeque<MockOutcome>>,
    default_outcome: MockOutcome,
    calls: Mutex<Vec<Amount>>,
    call_count: watch::Sender<usize>,
    held: watch::Sender<bool>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockSigner {
    /// Create a signer that confirms every request
    pub fn new() -> Self {
        Self::with_default(MockOutcome::Confirm)
    }

    /// Create a signer whose unscripted calls produce `outcome`
    pub fn with_default(outcome: MockOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_outcome: outcome,
            calls: Mutex::new(Vec::new()),
            call_count: watch::channel(0).0,
            held: watch::channel(false).0,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a signer that rejects every request
    pub fn failing(error: SignerError) -> Self {
        Self::with_default(MockOutcome::Fail(error))
    }

    /// Queue an outcome for the next unscripted call
    pub async fn push_outcome(&self, outcome: MockOutcome) {
        self.script.lock().await.push_back(outcome);
    }

    /// Keep every call pending until [`MockSigner::release`] is called
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    /// Let pending and future calls complete
    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Amounts requested so far, in call order
    pub async fn calls(&self) -> Vec<Amount> {
        self.calls.lock().await.clone()
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.borrow()
    }

    /// Wait until at least `count` calls have started
    pub async fn wait_for_calls(&self, count: usize) {
        let mut rx = self.call_count.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|started| *started >= count).await;
    }

    /// Highest number of calls observed in flight at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Signer for MockSigner {
    async fn create_transaction(
        &self,
        amount: Amount,
    ) -> std::result::Result<TransactionHandle, SignerError> {
        let _in_flight = InFlight::enter(&self.in_flight, &self.max_in_flight);

        self.calls.lock().await.push(amount);
        self.call_count.send_modify(|count| *count += 1);

        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default_outcome.clone());

        debug!("Mock signer call for {}: {:?}", amount, outcome);
        match outcome {
            MockOutcome::Confirm => Ok(TransactionHandle::new(Uuid::new_v4().to_string(), amount)),
            MockOutcome::ConfirmUpTo(limit) => Ok(TransactionHandle::new(
                Uuid::new_v4().to_string(),
                amount.min(limit),
            )),
            MockOutcome::ConfirmExactly(confirmed) => Ok(TransactionHandle::new(
                Uuid::new_v4().to_string(),
                confirmed,
            )),
            MockOutcome::Fail(error) => Err(error),
        }
    }
}

/// Counts a call as in flight until dropped, including when the caller
/// abandons the call
struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, high_water: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        high_water.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_outcomes_then_default() {
        let signer = MockSigner::new();
        signer
            .push_outcome(MockOutcome::Fail(SignerError::retriable("busy")))
            .await;
        signer.push_outcome(MockOutcome::ConfirmUpTo(3)).await;

        assert!(signer.create_transaction(10).await.is_err());
        assert_eq!(signer.create_transaction(10).await.unwrap().amount, 3);
        assert_eq!(signer.create_transaction(10).await.unwrap().amount, 10);
        assert_eq!(signer.calls().await, vec![10, 10, 10]);
        assert_eq!(signer.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_hold_keeps_call_pending() {
        let signer = std::sync::Arc::new(MockSigner::new());
        signer.hold();

        let task = {
            let signer = signer.clone();
            tokio::spawn(async move { signer.create_transaction(5).await })
        };
        signer.wait_for_calls(1).await;
        assert!(!task.is_finished());

        signer.release();
        let handle = task.await.unwrap().unwrap();
        assert_eq!(handle.amount, 5);
    }

    #[tokio::test]
    async fn test_abandoned_call_leaves_flight() {
        let signer = MockSigner::new();
        signer.hold();

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            signer.create_transaction(5),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(signer.in_flight.load(Ordering::SeqCst), 0);

        signer.release();
        signer.create_transaction(7).await.unwrap();
        assert_eq!(signer.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_confirm_exactly_ignores_request() {
        let signer = MockSigner::with_default(MockOutcome::ConfirmExactly(150));
        assert_eq!(signer.create_transaction(100).await.unwrap().amount, 150);
    }
}
