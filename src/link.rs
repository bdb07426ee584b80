//! Peer link abstraction
//!
//! The connection does not frame bytes itself; it only needs to know whether
//! the underlying channel to the peer is usable and a way to ask for it to be
//! re-established. Handshake and exchange-rate negotiation plug in here.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{Result, StreamError};

/// Transport collaborator used by the send loop
#[async_trait]
pub trait Link: Send + Sync {
    /// Whether the link can currently carry transactions
    fn is_established(&self) -> bool;

    /// Try to (re)establish the link
    async fn establish(&self) -> Result<()>;
}

/// In-process link whose state is set directly.
///
/// `establish` succeeds unless the link was marked as refusing, in which case
/// it reports a link error.
#[derive(Debug)]
pub struct StaticLink {
    established: AtomicBool,
    refuse: AtomicBool,
    attempts: AtomicUsize,
}

impl StaticLink {
    /// Create a link that is already established
    pub fn established() -> Self {
        Self::with_state(true)
    }

    /// Create a link that must be established by the send loop first
    pub fn disconnected() -> Self {
        Self::with_state(false)
    }

    fn with_state(established: bool) -> Self {
        Self {
            established: AtomicBool::new(established),
            refuse: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Drop the link, the next send loop iteration re-establishes it
    pub fn disconnect(&self) {
        self.established.store(false, Ordering::SeqCst);
    }

    /// Make further `establish` calls fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of `establish` calls so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Default for StaticLink {
    fn default() -> Self {
        Self::established()
    }
}

#[async_trait]
impl Link for StaticLink {
    fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    async fn establish(&self) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(StreamError::link("peer refused connection"));
        }
        self.established.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_link_reconnects() {
        let link = StaticLink::disconnected();
        assert!(!link.is_established());

        link.establish().await.unwrap();
        assert!(link.is_established());
        assert_eq!(link.attempts(), 1);

        link.disconnect();
        assert!(!link.is_established());
    }

    #[tokio::test]
    async fn test_refusing_link_reports_error() {
        let link = StaticLink::disconnected();
        link.refuse_connections(true);

        let err = link.establish().await.unwrap_err();
        assert!(matches!(err, StreamError::Link(_)));
        assert!(!link.is_established());
    }
}
