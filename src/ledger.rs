//! Amount ledger
//!
//! Running totals per stream and per connection. The ledger performs no I/O;
//! the send loop is the only writer and records deliveries only after the
//! signer has confirmed a transaction.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::asset::Amount;
use crate::stream::StreamId;
use crate::{Result, StreamError};

/// Sent and delivered totals for one stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Amount handed to the signer and not rolled back
    pub sent: Amount,
    /// Amount confirmed by the signer
    pub delivered: Amount,
}

impl LedgerEntry {
    /// Amount sent but not (yet) confirmed
    pub fn in_flight(&self) -> Amount {
        self.sent - self.delivered
    }
}

/// Per-stream and connection-wide accounting
#[derive(Debug, Default)]
pub struct AmountLedger {
    entries: HashMap<StreamId, LedgerEntry>,
    total_sent: Amount,
    total_delivered: Amount,
}

impl AmountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an amount handed to the signer for a stream
    pub fn record_sent(&mut self, stream_id: StreamId, amount: Amount) -> Result<()> {
        let total_sent = self
            .total_sent
            .checked_add(amount)
            .ok_or_else(|| StreamError::overflow("connection sent total"))?;
        let entry = self.entries.entry(stream_id).or_default();
        entry.sent = entry
            .sent
            .checked_add(amount)
            .ok_or_else(|| StreamError::overflow(format!("stream {} sent total", stream_id)))?;
        self.total_sent = total_sent;
        Ok(())
    }

    /// Undo a previous `record_sent` for an amount the signer did not accept
    pub fn rollback_sent(&mut self, stream_id: StreamId, amount: Amount) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&stream_id)
            .ok_or_else(|| StreamError::ledger(format!("no entry for stream {}", stream_id)))?;
        if entry.in_flight() < amount {
            return Err(StreamError::ledger(format!(
                "cannot roll back {} on stream {}: only {} in flight",
                amount,
                stream_id,
                entry.in_flight()
            )));
        }
        entry.sent -= amount;
        self.total_sent -= amount;
        Ok(())
    }

    /// Record a confirmed transaction.
    ///
    /// `requested` is the amount passed to `record_sent`; any unconfirmed
    /// remainder is rolled back so that `delivered <= sent` keeps holding.
    pub fn record_delivery(
        &mut self,
        stream_id: StreamId,
        requested: Amount,
        confirmed: Amount,
    ) -> Result<()> {
        if confirmed > requested {
            return Err(StreamError::ledger(format!(
                "signer confirmed {} but only {} was requested",
                confirmed, requested
            )));
        }
        let entry = self
            .entries
            .get_mut(&stream_id)
            .ok_or_else(|| StreamError::ledger(format!("no entry for stream {}", stream_id)))?;
        if entry.in_flight() < requested {
            return Err(StreamError::ledger(format!(
                "stream {} has {} in flight, cannot settle {}",
                stream_id,
                entry.in_flight(),
                requested
            )));
        }
        let total_delivered = self
            .total_delivered
            .checked_add(confirmed)
            .ok_or_else(|| StreamError::overflow("connection delivered total"))?;

        let unconfirmed = requested - confirmed;
        entry.sent -= unconfirmed;
        entry.delivered += confirmed;
        self.total_sent -= unconfirmed;
        self.total_delivered = total_delivered;
        Ok(())
    }

    /// Entry for one stream (zeroed if the stream never sent)
    pub fn entry(&self, stream_id: StreamId) -> LedgerEntry {
        self.entries.get(&stream_id).copied().unwrap_or_default()
    }

    pub fn total_sent(&self) -> Amount {
        self.total_sent
    }

    pub fn total_delivered(&self) -> Amount {
        self.total_delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_updates_stream_and_connection() {
        let mut ledger = AmountLedger::new();
        ledger.record_sent(1, 100).unwrap();
        assert_eq!(ledger.entry(1).in_flight(), 100);
        assert_eq!(ledger.total_delivered(), 0);

        ledger.record_delivery(1, 100, 100).unwrap();
        assert_eq!(ledger.entry(1), LedgerEntry { sent: 100, delivered: 100 });
        assert_eq!(ledger.total_delivered(), 100);
        assert_eq!(ledger.total_sent(), 100);
    }

    #[test]
    fn test_partial_confirmation_rolls_back_remainder() {
        let mut ledger = AmountLedger::new();
        ledger.record_sent(2, 50).unwrap();
        ledger.record_delivery(2, 50, 30).unwrap();

        let entry = ledger.entry(2);
        assert_eq!(entry.sent, 30);
        assert_eq!(entry.delivered, 30);
        assert_eq!(ledger.total_sent(), 30);
    }

    #[test]
    fn test_over_confirmation_is_rejected() {
        let mut ledger = AmountLedger::new();
        ledger.record_sent(1, 10).unwrap();
        let err = ledger.record_delivery(1, 10, 11).unwrap_err();
        assert!(matches!(err, StreamError::Ledger(_)));
        assert_eq!(ledger.total_delivered(), 0);
    }

    #[test]
    fn test_rollback_restores_totals() {
        let mut ledger = AmountLedger::new();
        ledger.record_sent(1, 10).unwrap();
        ledger.rollback_sent(1, 10).unwrap();
        assert_eq!(ledger.entry(1), LedgerEntry::default());
        assert_eq!(ledger.total_sent(), 0);
        assert!(ledger.rollback_sent(1, 1).is_err());
    }

    #[test]
    fn test_per_stream_totals_sum_to_connection_total() {
        let mut ledger = AmountLedger::new();
        for (id, amount) in [(1u32, 5u64), (2, 7), (3, 11)] {
            ledger.record_sent(id, amount).unwrap();
            ledger.record_delivery(id, amount, amount).unwrap();
        }
        let sum: Amount = (1..=3).map(|id| ledger.entry(id).delivered).sum();
        assert_eq!(sum, ledger.total_delivered());
        assert_eq!(ledger.entry(9), LedgerEntry::default());
    }

    #[test]
    fn test_overflow_is_checked() {
        let mut ledger = AmountLedger::new();
        ledger.record_sent(1, u64::MAX).unwrap();
        let err = ledger.record_sent(1, 1).unwrap_err();
        assert!(matches!(err, StreamError::AmountOverflow(_)));
        assert_eq!(ledger.total_sent(), u64::MAX);
    }
}
