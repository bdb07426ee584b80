// Shared helpers for the integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use moneystream::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionState, Link, MockSigner, RetryPolicy, StaticLink,
};

/// Upper bound for any single wait in a test
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default config with quick, deterministic retries
pub fn fast_retry_config(attempts: usize) -> ConnectionConfig {
    ConnectionConfig {
        retry: RetryPolicy::fixed_delay(attempts, 5),
        ..ConnectionConfig::default()
    }
}

pub fn connection_with(signer: Arc<MockSigner>, config: ConnectionConfig) -> Connection {
    connection_with_link(signer, config, Arc::new(StaticLink::established()))
}

pub fn connection_with_link(
    signer: Arc<MockSigner>,
    config: ConnectionConfig,
    link: Arc<dyn Link>,
) -> Connection {
    Connection::new(config, signer, link).expect("valid test config")
}

/// Receive the next event or fail the test after `TEST_TIMEOUT`
pub async fn next_event<T: Clone>(events: &mut broadcast::Receiver<T>) -> T {
    tokio::time::timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Collect connection events up to and including the next `SendLoopFinished`
pub async fn events_until_loop_finished(
    events: &mut broadcast::Receiver<ConnectionEvent>,
) -> Vec<ConnectionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let finished = event == ConnectionEvent::SendLoopFinished;
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

/// Wait until the connection reaches `expected` or fail after `TEST_TIMEOUT`
pub async fn wait_for_state(connection: &Connection, expected: ConnectionState) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while connection.state().await != expected {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("connection did not reach expected state in time");
}
