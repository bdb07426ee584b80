//! moneystream - streaming payment connection engine
//!
//! A [`Connection`] multiplexes logical money [`Stream`]s over one peer
//! session. Stream consumers declare how much they want transferred; a single
//! cooperative send loop per connection asks an injected [`Signer`] for a
//! transaction covering that amount, records confirmed deliveries in the
//! amount ledger and notifies the streams.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use moneystream::{Connection, ConnectionConfig, MockSigner, StaticLink, StreamEvent};
//!
//! #[tokio::main]
//! async fn main() -> moneystream::Result<()> {
//!     let connection = Connection::new(
//!         ConnectionConfig::default(),
//!         Arc::new(MockSigner::new()),
//!         Arc::new(StaticLink::established()),
//!     )?;
//!
//!     let stream = connection.create_stream().await?;
//!     let mut events = stream.subscribe();
//!     stream.set_amount_available_to_send(100)?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if event == StreamEvent::SendLoopFinished {
//!             break;
//!         }
//!     }
//!     connection.end().await?;
//!     println!("delivered {}", connection.total_delivered_formatted().await);
//!     Ok(())
//! }
//! ```

pub mod asset;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod ledger;
pub mod link;
pub mod logging;
pub mod retry;
pub mod signer;
pub mod stream;

// Re-export main types for convenience
pub use asset::{Amount, AssetDetails};
pub use config::{Config, ConnectionConfig, LogFormat, LoggingConfig};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{Result, StreamError};
pub use events::{ConnectionEvent, StreamEvent};
pub use ledger::{AmountLedger, LedgerEntry};
pub use link::{Link, StaticLink};
pub use retry::RetryPolicy;
pub use signer::{MockOutcome, MockSigner, Signer, SignerError, TransactionHandle};
pub use stream::{Stream, StreamId};
