//! Streams multiplexed over a connection
//!
//! A [`Stream`] is the consumer's handle on one logical money channel. The
//! owning connection keeps the stream state in its registry; the handle only
//! carries the connection id and a signal sender, so it never keeps the
//! connection alive and never reaches the signer or the link.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::asset::Amount;
use crate::connection::ConnectionId;
use crate::events::{StreamEvent, StreamSignal};
use crate::ledger::LedgerEntry;
use crate::{Result, StreamError};

/// Stream identifier, odd for client-initiated and even for server-initiated streams
pub type StreamId = u32;

/// Stream state shared between the connection registry and the handle
pub(crate) struct StreamShared {
    id: StreamId,
    connection_id: ConnectionId,
    is_server: bool,
    amount_available: AtomicU64,
    sent: AtomicU64,
    delivered: AtomicU64,
    closed: AtomicBool,
    events: broadcast::Sender<StreamEvent>,
}

impl StreamShared {
    pub(crate) fn new(
        id: StreamId,
        connection_id: ConnectionId,
        is_server: bool,
        event_buffer: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_buffer);
        Self {
            id,
            connection_id,
            is_server,
            amount_available: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            events,
        }
    }

    pub(crate) fn id(&self) -> StreamId {
        self.id
    }

    pub(crate) fn amount_available(&self) -> Amount {
        self.amount_available.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// `amount` was handed to the signer for this stream
    pub(crate) fn on_sent(&self, amount: Amount) {
        self.sent.fetch_add(amount, Ordering::SeqCst);
    }

    /// The signer did not cover `amount` of what was handed to it
    pub(crate) fn on_unsent(&self, amount: Amount) {
        let _ = self
            .sent
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |sent| {
                Some(sent.saturating_sub(amount))
            });
    }

    /// A confirmed transaction covered `amount` for this stream
    pub(crate) fn on_outgoing_money(&self, amount: Amount) {
        let _ = self
            .amount_available
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |available| {
                Some(available.saturating_sub(amount))
            });
        self.delivered.fetch_add(amount, Ordering::SeqCst);
        trace!("Stream {} released {} to its consumer", self.id, amount);
        self.emit(StreamEvent::OutgoingMoney { amount });
    }

    pub(crate) fn on_send_loop_finished(&self) {
        self.emit(StreamEvent::SendLoopFinished);
    }

    /// Reject further raises; returns false if the stream was already closed
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("Stream {} closed with {} still available", self.id, self.amount_available());
        self.emit(StreamEvent::Closed);
        true
    }

    fn emit(&self, event: StreamEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

/// Consumer handle for one logical money stream
#[derive(Clone)]
pub struct Stream {
    shared: Arc<StreamShared>,
    signals: mpsc::UnboundedSender<StreamSignal>,
}

impl Stream {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        signals: mpsc::UnboundedSender<StreamSignal>,
    ) -> Self {
        Self { shared, signals }
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    /// Id of the owning connection
    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }

    pub fn is_server(&self) -> bool {
        self.shared.is_server
    }

    /// Whether the owning connection has closed this stream
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Snapshot of the amount the consumer currently wants transferred
    pub fn amount_available_to_send(&self) -> Amount {
        self.shared.amount_available()
    }

    /// Total confirmed for this stream so far
    pub fn total_delivered(&self) -> Amount {
        self.shared.delivered.load(Ordering::SeqCst)
    }

    /// Total handed to the signer for this stream, including the in-flight amount
    pub fn total_sent(&self) -> Amount {
        self.shared.sent.load(Ordering::SeqCst)
    }

    /// Snapshot of this stream's sent and delivered totals
    pub fn ledger(&self) -> LedgerEntry {
        LedgerEntry {
            sent: self.total_sent(),
            delivered: self.total_delivered(),
        }
    }

    /// Replace the sendable amount.
    ///
    /// Any increase asks the connection to start its send loop; the request
    /// is a no-op while a loop is already running.
    pub fn set_amount_available_to_send(&self, amount: Amount) -> Result<()> {
        self.ensure_open()?;
        self.ensure_connected()?;
        let previous = self.shared.amount_available.swap(amount, Ordering::SeqCst);
        debug!(
            "Stream {} sendable amount {} -> {}",
            self.shared.id, previous, amount
        );
        if amount > previous {
            self.signal_maybe_start()?;
        }
        Ok(())
    }

    /// Raise the sendable amount by `delta`
    pub fn add_amount_available_to_send(&self, delta: Amount) -> Result<Amount> {
        self.ensure_open()?;
        self.ensure_connected()?;
        let previous = self
            .shared
            .amount_available
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |available| {
                available.checked_add(delta)
            })
            .map_err(|available| {
                StreamError::overflow(format!(
                    "stream {} cannot add {} to {}",
                    self.shared.id, delta, available
                ))
            })?;
        let amount = previous + delta;
        debug!(
            "Stream {} sendable amount {} -> {}",
            self.shared.id, previous, amount
        );
        if delta > 0 {
            self.signal_maybe_start()?;
        }
        Ok(amount)
    }

    /// Subscribe to this stream's events
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            debug!("Stream {} is closed, rejecting raise", self.shared.id);
            return Err(StreamError::StreamClosed(self.shared.id));
        }
        Ok(())
    }

    /// The owning connection was dropped without being closed
    fn ensure_connected(&self) -> Result<()> {
        if self.signals.is_closed() {
            return Err(self.disconnected());
        }
        Ok(())
    }

    fn signal_maybe_start(&self) -> Result<()> {
        self.signals
            .send(StreamSignal::MaybeStartSendLoop {
                stream_id: self.shared.id,
            })
            .map_err(|_| self.disconnected())
    }

    fn disconnected(&self) -> StreamError {
        StreamError::connection_closed(format!(
            "connection {} no longer accepts signals",
            self.shared.connection_id
        ))
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("connection_id", &self.shared.connection_id)
            .field("is_server", &self.shared.is_server)
            .field("amount_available", &self.shared.amount_available())
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_stream() -> (Stream, mpsc::UnboundedReceiver<StreamSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(StreamShared::new(1, Uuid::new_v4(), false, 8));
        (Stream::new(shared, tx), rx)
    }

    #[tokio::test]
    async fn test_raise_signals_connection() {
        let (stream, mut rx) = test_stream();
        assert_eq!(stream.amount_available_to_send(), 0);

        stream.set_amount_available_to_send(100).unwrap();
        assert_eq!(stream.amount_available_to_send(), 100);
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamSignal::MaybeStartSendLoop { stream_id: 1 }
        );

        // Lowering the amount does not ask for a send
        stream.set_amount_available_to_send(40).unwrap();
        assert!(rx.try_recv().is_err());

        assert_eq!(stream.add_amount_available_to_send(10).unwrap(), 50);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_outgoing_money_updates_local_accounting() {
        let (stream, _rx) = test_stream();
        let mut events = stream.subscribe();
        stream.set_amount_available_to_send(100).unwrap();

        stream.shared.on_sent(100);
        stream.shared.on_unsent(40);
        stream.shared.on_outgoing_money(60);
        assert_eq!(stream.amount_available_to_send(), 40);
        assert_eq!(
            stream.ledger(),
            LedgerEntry {
                sent: 60,
                delivered: 60
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            StreamEvent::OutgoingMoney { amount: 60 }
        );
    }

    #[tokio::test]
    async fn test_closed_stream_rejects_raises() {
        let (stream, mut rx) = test_stream();
        let mut events = stream.subscribe();

        assert!(stream.shared.close());
        assert!(!stream.shared.close());
        assert_eq!(events.recv().await.unwrap(), StreamEvent::Closed);

        let err = stream.set_amount_available_to_send(5).unwrap_err();
        assert!(matches!(err, StreamError::StreamClosed(1)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_raise_after_connection_dropped_leaves_amount() {
        let (stream, rx) = test_stream();
        stream.set_amount_available_to_send(10).unwrap();
        drop(rx);

        let err = stream.set_amount_available_to_send(50).unwrap_err();
        assert!(matches!(err, StreamError::ConnectionClosed(_)));
        assert!(stream.add_amount_available_to_send(5).is_err());
        assert_eq!(stream.amount_available_to_send(), 10);
    }

    #[tokio::test]
    async fn test_add_overflow_is_rejected() {
        let (stream, _rx) = test_stream();
        stream.set_amount_available_to_send(u64::MAX).unwrap();
        let err = stream.add_amount_available_to_send(1).unwrap_err();
        assert!(matches!(err, StreamError::AmountOverflow(_)));
        assert_eq!(stream.amount_available_to_send(), u64::MAX);
    }
}
