//! Connection and stream signals
//!
//! Signals are a fixed, typed set. Consumers subscribe through
//! `tokio::sync::broadcast`; the stream-to-connection request travels over an
//! unbounded mpsc channel owned by the connection.

use crate::asset::Amount;
use crate::stream::StreamId;

/// Events published by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The send loop exited, cleanly or through an error
    SendLoopFinished,
    /// A transaction was confirmed for a stream
    OutgoingMoney {
        stream_id: StreamId,
        amount: Amount,
    },
    /// The connection reached its terminal state
    Closed {
        /// Display form of the error that destroyed the connection, if any
        cause: Option<String>,
    },
}

/// Events delivered to a stream's consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// No further transactions for this stream in the current cycle
    SendLoopFinished,
    /// A transaction covering `amount` was confirmed for this stream
    OutgoingMoney { amount: Amount },
    /// The owning connection closed, further raises are rejected
    Closed,
}

/// Requests a stream sends to its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSignal {
    /// The stream has sendable amount, start the send loop if idle
    MaybeStartSendLoop { stream_id: StreamId },
}
