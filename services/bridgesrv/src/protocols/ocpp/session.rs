//! Charging transactions
//!
//! At most one `InProgress` transaction exists per connector. Completed
//! transactions move to a bounded history.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: i32,
    pub connector_id: u32,
    pub id_tag: String,
    pub status: TransactionStatus,
    pub start_time: DateTime<Utc>,
    /// Connector meter at start, Wh
    pub meter_start: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_stop: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Energy delivered so far given the current meter value
    pub fn energy_wh(&self, meter_now: f64) -> f64 {
        let end = self.meter_stop.unwrap_or(meter_now);
        (end - self.meter_start).max(0.0)
    }

    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::InProgress
    }
}

pub struct TransactionBook {
    next_id: i32,
    active: BTreeMap<u32, Transaction>,
    completed: VecDeque<Transaction>,
    history_limit: usize,
}

impl Default for TransactionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionBook {
    pub const DEFAULT_HISTORY: usize = 100;

    pub fn new() -> Self {
        Self {
            next_id: 1,
            active: BTreeMap::new(),
            completed: VecDeque::new(),
            history_limit: Self::DEFAULT_HISTORY,
        }
    }

    pub fn active(&self, connector_id: u32) -> Option<&Transaction> {
        self.active.get(&connector_id)
    }

    pub fn active_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.active.values()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_charging(&self) -> bool {
        !self.active.is_empty()
    }

    /// Open a transaction; `None` when the connector already has one
    pub fn begin(
        &mut self,
        connector_id: u32,
        id_tag: &str,
        meter_start: f64,
        now: DateTime<Utc>,
    ) -> Option<Transaction> {
        if self.active.contains_key(&connector_id) {
            return None;
        }
        let transaction = Transaction {
            id: self.next_id,
            connector_id,
            id_tag: id_tag.to_string(),
            status: TransactionStatus::InProgress,
            start_time: now,
            meter_start,
            meter_stop: None,
            stop_time: None,
        };
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.active.insert(connector_id, transaction.clone());
        Some(transaction)
    }

    /// Close the connector's transaction and move it to the history
    pub fn finish(
        &mut self,
        connector_id: u32,
        meter_stop: f64,
        now: DateTime<Utc>,
    ) -> Option<Transaction> {
        let mut transaction = self.active.remove(&connector_id)?;
        transaction.status = TransactionStatus::Completed;
        transaction.meter_stop = Some(meter_stop.max(transaction.meter_start));
        transaction.stop_time = Some(now);

        if self.completed.len() >= self.history_limit {
            self.completed.pop_front();
        }
        self.completed.push_back(transaction.clone());
        Some(transaction)
    }

    pub fn completed(&self) -> impl Iterator<Item = &Transaction> {
        self.completed.iter()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_one_transaction_per_connector() {
        let mut book = TransactionBook::new();
        let now = Utc::now();
        let first = book.begin(1, "TAG1", 100.0, now).unwrap();
        assert!(book.begin(1, "TAG2", 100.0, now).is_none());
        let second = book.begin(2, "TAG2", 0.0, now).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(book.active_count(), 2);

        let done = book.finish(1, 1600.0, now).unwrap();
        assert_eq!(done.status, TransactionStatus::Completed);
        assert_eq!(done.energy_wh(0.0), 1500.0);
        assert!(book.active(1).is_none());
        assert!(book.finish(1, 0.0, now).is_none());

        // the connector is free again
        assert!(book.begin(1, "TAG3", 1600.0, now).is_some());
        assert_eq!(book.completed().count(), 1);
    }

    #[test]
    fn test_meter_never_runs_backwards() {
        let mut book = TransactionBook::new();
        let now = Utc::now();
        book.begin(1, "TAG", 500.0, now);
        let done = book.finish(1, 400.0, now).unwrap();
        assert_eq!(done.meter_stop, Some(500.0));
        assert_eq!(done.energy_wh(9999.0), 0.0);
    }
}
