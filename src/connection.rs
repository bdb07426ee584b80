//! Connection and send loop
//!
//! A [`Connection`] owns its streams, the amount ledger, the injected signer
//! and the peer link. A single send loop per connection turns the streams'
//! sendable amounts into transactions, one signer call at a time.
//!
//! State machine:
//!
//! ```text
//!   Idle --start_send_loop--> Sending --drained / retries exhausted--> Idle
//!   Sending --end--> Ending --in-flight send done--> Closed
//!   any --destroy / loop-fatal error--> Closed
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::asset::{Amount, AssetDetails};
use crate::config::ConnectionConfig;
use crate::events::{ConnectionEvent, StreamSignal};
use crate::ledger::{AmountLedger, LedgerEntry};
use crate::link::Link;
use crate::signer::{Signer, SignerError, TransactionHandle};
use crate::stream::{Stream, StreamId, StreamShared};
use crate::{Result, StreamError};

/// Connection identifier type
pub type ConnectionId = Uuid;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No send loop is running
    Idle,
    /// The send loop is running
    Sending,
    /// `end` was requested while sending; the loop stops after the in-flight send
    Ending,
    /// Terminal state
    Closed,
}

/// Why a send loop run ended without a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// No stream had anything left to send
    Drained,
    /// Retriable failures hit the retry limit
    RetriesExhausted,
    /// `end` asked the loop to stop
    Ending,
    /// The connection was closed underneath the loop
    Cancelled,
}

/// Result of a single signer round trip
enum SendOutcome {
    Delivered,
    Retry(StreamError),
    Cancelled,
}

/// Session-scoped owner of streams and the send loop
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    config: ConnectionConfig,
    signer: Arc<dyn Signer>,
    link: Arc<dyn Link>,
    state: RwLock<ConnectionState>,
    ledger: RwLock<AmountLedger>,
    streams: RwLock<BTreeMap<StreamId, Arc<StreamShared>>>,
    next_client_stream_id: AtomicU32,
    next_server_stream_id: AtomicU32,
    last_transaction: RwLock<Option<TransactionHandle>>,
    /// A start was requested while a loop was already sending
    start_requested: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    signals: mpsc::UnboundedSender<StreamSignal>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Create a new connection.
    ///
    /// Must be called from within a Tokio runtime: the connection spawns the
    /// task that turns stream signals into send loop starts.
    pub fn new(
        config: ConnectionConfig,
        signer: Arc<dyn Signer>,
        link: Arc<dyn Link>,
    ) -> Result<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_buffer);
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            id: ConnectionId::new_v4(),
            config,
            signer,
            link,
            state: RwLock::new(ConnectionState::Idle),
            ledger: RwLock::new(AmountLedger::new()),
            streams: RwLock::new(BTreeMap::new()),
            next_client_stream_id: AtomicU32::new(1),
            next_server_stream_id: AtomicU32::new(2),
            last_transaction: RwLock::new(None),
            start_requested: AtomicBool::new(false),
            events,
            signals,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(dispatch_signals(
            Arc::downgrade(&inner),
            signals_rx,
            inner.shutdown.clone(),
        ));

        info!(
            "Created connection {} ({} -> {})",
            inner.id, inner.config.source_asset, inner.config.destination_asset
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn source_asset(&self) -> &AssetDetails {
        &self.inner.config.source_asset
    }

    pub fn destination_asset(&self) -> &AssetDetails {
        &self.inner.config.destination_asset
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn is_closed(&self) -> bool {
        self.state().await == ConnectionState::Closed
    }

    /// Whether a send loop is running (including one that is winding down)
    pub async fn is_sending(&self) -> bool {
        matches!(
            self.state().await,
            ConnectionState::Sending | ConnectionState::Ending
        )
    }

    pub fn is_link_established(&self) -> bool {
        self.inner.link.is_established()
    }

    /// Total confirmed across all streams, in source asset base units
    pub async fn total_delivered(&self) -> Amount {
        self.inner.ledger.read().await.total_delivered()
    }

    /// Total delivered formatted with the source asset scale
    pub async fn total_delivered_formatted(&self) -> String {
        let total = self.total_delivered().await;
        self.inner.config.source_asset.format(total)
    }

    /// Ledger entry of one stream
    pub async fn stream_ledger(&self, stream_id: StreamId) -> LedgerEntry {
        self.inner.ledger.read().await.entry(stream_id)
    }

    /// Most recent confirmed transaction
    pub async fn last_transaction(&self) -> Option<TransactionHandle> {
        self.inner.last_transaction.read().await.clone()
    }

    pub async fn stream_ids(&self) -> Vec<StreamId> {
        self.inner.streams.read().await.keys().copied().collect()
    }

    /// Subscribe to connection events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Open a new client-role stream
    pub async fn create_stream(&self) -> Result<Stream> {
        self.open_stream(false).await
    }

    /// Open a new server-role stream
    pub async fn create_server_stream(&self) -> Result<Stream> {
        self.open_stream(true).await
    }

    async fn open_stream(&self, is_server: bool) -> Result<Stream> {
        let state = self.inner.state.read().await;
        if *state == ConnectionState::Closed {
            return Err(StreamError::connection_closed(format!(
                "connection {} cannot open new streams",
                self.inner.id
            )));
        }

        let counter = if is_server {
            &self.inner.next_server_stream_id
        } else {
            &self.inner.next_client_stream_id
        };
        let id = counter.fetch_add(2, Ordering::SeqCst);
        let shared = Arc::new(StreamShared::new(
            id,
            self.inner.id,
            is_server,
            self.inner.config.event_buffer,
        ));
        self.inner.streams.write().await.insert(id, Arc::clone(&shared));
        drop(state);

        debug!("Connection {} opened stream {}", self.inner.id, id);
        Ok(Stream::new(shared, self.inner.signals.clone()))
    }

    /// Start the send loop unless one is running or the connection is closed.
    ///
    /// Returns whether a new loop was started.
    pub async fn start_send_loop(&self) -> bool {
        self.inner.start_send_loop().await
    }

    /// Stop sending gracefully and close.
    ///
    /// The in-flight transaction, if any, completes and is accounted before the
    /// connection closes. Resolves once the connection is closed.
    pub async fn end(&self) -> Result<()> {
        let mut state = self.inner.state.write().await;
        let current = *state;
        match current {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Idle => {
                info!("Ending idle connection {}", self.inner.id);
                self.inner.close_locked(state, None).await;
            }
            ConnectionState::Sending => {
                info!(
                    "Ending connection {} after the in-flight send",
                    self.inner.id
                );
                *state = ConnectionState::Ending;
                drop(state);
            }
            ConnectionState::Ending => drop(state),
        }
        self.inner.shutdown.cancelled().await;
        Ok(())
    }

    /// Close immediately.
    ///
    /// Safe to call from any state. A running send loop stops at its next
    /// suspension point and no delivery is recorded after this call.
    pub async fn destroy(&self, cause: Option<StreamError>) {
        self.inner.destroy(cause).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("source_asset", &self.inner.config.source_asset)
            .field("destination_asset", &self.inner.config.destination_asset)
            .finish()
    }
}

/// Forward stream signals to the connection until it closes or is dropped
async fn dispatch_signals(
    inner: Weak<ConnectionInner>,
    mut signals: mpsc::UnboundedReceiver<StreamSignal>,
    shutdown: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            _ = shutdown.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let Some(connection) = inner.upgrade() else {
            break;
        };
        match signal {
            StreamSignal::MaybeStartSendLoop { stream_id } => {
                trace!(
                    "Stream {} asked connection {} to send",
                    stream_id,
                    connection.id
                );
                connection.start_send_loop().await;
            }
        }
    }
}

impl ConnectionInner {
    async fn start_send_loop(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.write().await;
            let current = *state;
            match current {
                ConnectionState::Idle => {
                    *state = ConnectionState::Sending;
                    self.start_requested.store(false, Ordering::SeqCst);
                }
                ConnectionState::Closed => {
                    debug!(
                        "Connection {} is closed, not starting another send loop",
                        self.id
                    );
                    return false;
                }
                ConnectionState::Sending => {
                    trace!("Connection {} is already sending", self.id);
                    self.start_requested.store(true, Ordering::SeqCst);
                    return false;
                }
                ConnectionState::Ending => {
                    trace!("Connection {} is ending, not sending more", self.id);
                    return false;
                }
            }
        }

        info!("Connection {} starting send loop", self.id);
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_send_loop().await });
        true
    }

    /// Drive send loop cycles until one ends without pending work.
    ///
    /// The state stays `Sending` until the finish notifications are out, and
    /// the following transition happens under the same write lock, so a new
    /// cycle can never overlap the tail of the previous one.
    async fn run_send_loop(self: Arc<Self>) {
        loop {
            match self.send_loop().await {
                Ok(exit) => debug!("Connection {} send loop exited: {:?}", self.id, exit),
                Err(e) => {
                    error!("Connection {} send loop failed: {}", self.id, e);
                    self.destroy(Some(e)).await;
                }
            }

            let mut state = self.state.write().await;
            info!("Connection {} finished sending", self.id);
            self.emit(ConnectionEvent::SendLoopFinished);
            let streams: Vec<Arc<StreamShared>> =
                self.streams.read().await.values().cloned().collect();
            for stream in &streams {
                stream.on_send_loop_finished();
            }

            let current = *state;
            match current {
                ConnectionState::Ending => {
                    self.close_locked(state, None).await;
                    return;
                }
                ConnectionState::Sending => {
                    let requested = self.start_requested.swap(false, Ordering::SeqCst);
                    if requested && streams.iter().any(|stream| is_sendable(stream)) {
                        debug!(
                            "Connection {} received more to send while finishing, sending again",
                            self.id
                        );
                        continue;
                    }
                    *state = ConnectionState::Idle;
                    return;
                }
                ConnectionState::Idle | ConnectionState::Closed => return,
            }
        }
    }

    async fn send_loop(&self) -> Result<LoopExit> {
        let retry = &self.config.retry;
        let mut link_attempts = 0usize;
        let mut failures = 0usize;
        let mut cursor: Option<StreamId> = None;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(LoopExit::Cancelled);
            }
            let current = *self.state.read().await;
            match current {
                ConnectionState::Closed => return Ok(LoopExit::Cancelled),
                ConnectionState::Ending => return Ok(LoopExit::Ending),
                ConnectionState::Idle | ConnectionState::Sending => {}
            }

            if !self.link.is_established() {
                if link_attempts >= self.config.max_link_attempts {
                    return Err(StreamError::link(format!(
                        "link not established after {} attempts",
                        link_attempts
                    )));
                }
                link_attempts += 1;
                info!(
                    "Connection {} link down, establishing (attempt {}/{})",
                    self.id, link_attempts, self.config.max_link_attempts
                );
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return Ok(LoopExit::Cancelled),
                    result = self.link.establish() => result?,
                }
                continue;
            }
            link_attempts = 0;

            // Give streams raising their amounts in the same tick a chance to be seen
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(LoopExit::Cancelled),
                _ = tokio::task::yield_now() => {}
            }

            let Some((stream, amount)) = self.next_sendable(cursor).await else {
                return Ok(LoopExit::Drained);
            };
            cursor = Some(stream.id());

            match self.send_once(&stream, amount).await? {
                SendOutcome::Delivered => failures = 0,
                SendOutcome::Cancelled => return Ok(LoopExit::Cancelled),
                SendOutcome::Retry(e) => {
                    failures += 1;
                    let Some(delay) = retry.next_backoff(failures) else {
                        warn!(
                            "Connection {} giving up after {} failed attempts: {}",
                            self.id, failures, e
                        );
                        return Ok(LoopExit::RetriesExhausted);
                    };
                    debug!(
                        "Connection {} retrying in {}ms (attempt {}/{})",
                        self.id,
                        delay.as_millis(),
                        failures + 1,
                        retry.max_attempts
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Ok(LoopExit::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Next open stream with a positive amount, round-robin after `cursor`
    async fn next_sendable(&self, cursor: Option<StreamId>) -> Option<(Arc<StreamShared>, Amount)> {
        let streams = self.streams.read().await;
        let sendable = |stream: &&Arc<StreamShared>| is_sendable(stream);
        let after = cursor.map_or(0, |id| id.saturating_add(1));
        let next = streams
            .range(after..)
            .map(|(_, stream)| stream)
            .find(sendable)
            .or_else(|| streams.values().find(sendable))
            .map(|stream| (Arc::clone(stream), stream.amount_available()));
        next
    }

    /// One signer round trip for `amount` on `stream`
    async fn send_once(&self, stream: &StreamShared, amount: Amount) -> Result<SendOutcome> {
        let asset = &self.config.source_asset;
        self.ledger.write().await.record_sent(stream.id(), amount)?;
        stream.on_sent(amount);
        debug!(
            "Connection {} requesting transaction for {} on stream {}",
            self.id,
            asset.format(amount),
            stream.id()
        );

        let signed = async {
            let call = self.signer.create_transaction(amount);
            match self.config.signer_timeout_ms {
                Some(timeout_ms) => {
                    match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
                        Ok(result) => result.map_err(StreamError::from),
                        Err(_) => Err(StreamError::timeout(timeout_ms)),
                    }
                }
                None => call.await.map_err(StreamError::from),
            }
        };
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            result = signed => Some(result),
        };

        let handle = match result {
            None => {
                warn!(
                    "Connection {} closed while a transaction for {} on stream {} was pending",
                    self.id,
                    amount,
                    stream.id()
                );
                return Ok(SendOutcome::Cancelled);
            }
            Some(Err(e)) => {
                self.ledger.write().await.rollback_sent(stream.id(), amount)?;
                stream.on_unsent(amount);
                if e.is_retriable() {
                    warn!(
                        "Connection {} signer failed for {} on stream {}: {}",
                        self.id,
                        amount,
                        stream.id(),
                        e
                    );
                    return Ok(SendOutcome::Retry(e));
                }
                return Err(e);
            }
            Some(Ok(handle)) => handle,
        };

        let state = self.state.read().await;
        if *state == ConnectionState::Closed {
            warn!(
                "Connection {} closed before transaction {} could be applied, dropping it",
                self.id, handle.id
            );
            return Ok(SendOutcome::Cancelled);
        }

        self.ledger
            .write()
            .await
            .record_delivery(stream.id(), amount, handle.amount)?;
        stream.on_unsent(amount - handle.amount);
        if handle.amount == 0 {
            return Ok(SendOutcome::Retry(StreamError::from(SignerError::retriable(
                "signer confirmed a zero amount",
            ))));
        }

        stream.on_outgoing_money(handle.amount);
        info!(
            "Connection {} sent {} on stream {} (transaction {})",
            self.id,
            asset.format(handle.amount),
            stream.id(),
            handle.id
        );
        let confirmed = handle.amount;
        *self.last_transaction.write().await = Some(handle);
        self.emit(ConnectionEvent::OutgoingMoney {
            stream_id: stream.id(),
            amount: confirmed,
        });
        drop(state);

        Ok(SendOutcome::Delivered)
    }

    async fn destroy(&self, cause: Option<StreamError>) {
        let state = self.state.write().await;
        if *state == ConnectionState::Closed {
            debug!("Connection {} already closed", self.id);
            return;
        }
        match &cause {
            Some(e) => error!("Destroying connection {}: {}", self.id, e),
            None => info!("Destroying connection {}", self.id),
        }
        self.close_locked(state, cause).await;
    }

    /// Move to `Closed`, close every stream and release waiters
    async fn close_locked(
        &self,
        mut state: RwLockWriteGuard<'_, ConnectionState>,
        cause: Option<StreamError>,
    ) {
        *state = ConnectionState::Closed;
        drop(state);

        let streams: Vec<Arc<StreamShared>> =
            self.streams.read().await.values().cloned().collect();
        for stream in &streams {
            stream.close();
        }

        let total = self.ledger.read().await.total_delivered();
        info!(
            "Connection {} closed, {} delivered",
            self.id,
            self.config.source_asset.format(total)
        );
        self.emit(ConnectionEvent::Closed {
            cause: cause.map(|e| e.to_string()),
        });
        self.shutdown.cancel();
    }

    fn emit(&self, event: ConnectionEvent) {
        trace!("Connection {} event: {:?}", self.id, event);
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

fn is_sendable(stream: &StreamShared) -> bool {
    !stream.is_closed() && stream.amount_available() > 0
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
