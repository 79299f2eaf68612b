//! Buffers behind the collector query API.
//!
//! Producers (connection tasks) append under a mutex and wake waiters with
//! [`Notify::notify_waiters`]. Consumers register interest *before* checking
//! the buffer, so a push landing between the check and the wait still wakes
//! them.

use crate::error::QueryError;
use apm_agent::wire::{Metricset, Transaction};
use std::pin::pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Transactions in arrival order. Reads by index are destructive.
#[derive(Debug, Default)]
pub struct TransactionBuffer {
    entries: Mutex<Vec<Transaction>>,
    arrived: Notify,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, transaction: Transaction) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transaction);
        self.arrived.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_take(&self, index: usize) -> Option<Transaction> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        (index < entries.len()).then(|| entries.remove(index))
    }

    /// Waits until more than `index` transactions are buffered, then removes
    /// and returns the one at `index`.
    pub async fn take(&self, index: usize, timeout: Duration) -> Result<Transaction, QueryError> {
        let deadline = Instant::now() + timeout;

        loop {
            let mut notified = pin!(self.arrived.notified());
            notified.as_mut().enable();

            if let Some(transaction) = self.try_take(index) {
                return Ok(transaction);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // One last look: the push may have raced the deadline
                return self
                    .try_take(index)
                    .ok_or(QueryError::NotFound { index, timeout });
            }
        }
    }
}

/// Holds at most one metricset. A newer one replaces an unread older one.
#[derive(Debug, Default)]
pub struct MetricMailbox {
    slot: Mutex<Option<Metricset>>,
    arrived: Notify,
}

impl MetricMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, metricset: Metricset) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(metricset);
        self.arrived.notify_waiters();
    }

    fn try_pop(&self) -> Option<Metricset> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Waits up to `timeout` for a metricset and takes it.
    pub async fn pop(&self, timeout: Duration) -> Option<Metricset> {
        let deadline = Instant::now() + timeout;

        loop {
            let mut notified = pin!(self.arrived.notified());
            notified.as_mut().enable();

            if let Some(metricset) = self.try_pop() {
                return Some(metricset);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }
}

/// Everything the collector has ingested.
#[derive(Debug, Default)]
pub struct CollectorStore {
    pub transactions: TransactionBuffer,
    pub metrics: MetricMailbox,
}

impl CollectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}
