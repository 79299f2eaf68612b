//! Process-lifetime counters and the registry the reporter snapshots.

use crate::wire::{Metricset, Sample};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Registered counters, keyed by name.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    counters: Mutex<BTreeMap<String, Arc<AtomicU64>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a counter cell under `name`.
    ///
    /// The first registration of a name wins. Returns `false` if the name was
    /// already taken.
    pub fn register(&self, name: &str, cell: Arc<AtomicU64>) -> bool {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if counters.contains_key(name) {
            return false;
        }
        counters.insert(name.to_string(), cell);
        debug!(counter = name, "metric registered");
        true
    }

    /// Cell registered under `name`, registering a fresh one if the name is free.
    ///
    /// Every caller asking for the same name shares one cell.
    pub fn counter(&self, name: &str) -> Arc<AtomicU64> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let cell = counters.entry(name.to_string()).or_insert_with(|| {
            debug!(counter = name, "metric registered");
            Arc::new(AtomicU64::new(0))
        });
        Arc::clone(cell)
    }

    /// Current cumulative value of every registered counter.
    ///
    /// Returns `None` when nothing is registered yet.
    pub fn snapshot(&self) -> Option<Metricset> {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if counters.is_empty() {
            return None;
        }

        let samples = counters
            .iter()
            .map(|(name, cell)| {
                let value = cell.load(Ordering::Relaxed) as f64;
                (name.clone(), Sample { value })
            })
            .collect();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .ok();

        Some(Metricset {
            samples,
            timestamp,
            extra: serde_json::Map::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Monotonic counter shared across requests.
///
/// The counter registers itself on its first [`record`](Self::record), so a
/// counter that is never hit never shows up in a metricset. Counters created
/// with the same name on one registry count into the same cell.
#[derive(Debug)]
pub struct MetricCounter {
    name: String,
    registry: Arc<MetricRegistry>,
    cell: OnceLock<Arc<AtomicU64>>,
}

impl MetricCounter {
    pub fn new(name: impl Into<String>, registry: Arc<MetricRegistry>) -> Self {
        Self {
            name: name.into(),
            registry,
            cell: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Counts one event.
    ///
    /// Registration happens before the increment, so a non-zero counter is
    /// always visible to the registry. Concurrent first calls block on the
    /// gate until the winner has registered.
    pub fn record(&self) {
        self.cell
            .get_or_init(|| self.registry.counter(&self.name))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Value of the registered cell, `0` before the first record.
    pub fn value(&self) -> u64 {
        self.cell
            .get()
            .map_or(0, |cell| cell.load(Ordering::Relaxed))
    }

    pub fn is_registered(&self) -> bool {
        self.cell.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_unrecorded_counter_is_not_registered() {
        let registry = Arc::new(MetricRegistry::new());
        let counter = MetricCounter::new("page_counter", Arc::clone(&registry));

        assert!(!counter.is_registered());
        assert!(registry.snapshot().is_none());
    }

    #[test]
    fn test_record_registers_then_counts() {
        let registry = Arc::new(MetricRegistry::new());
        let counter = MetricCounter::new("page_counter", Arc::clone(&registry));

        counter.record();
        counter.record();

        assert!(counter.is_registered());
        let snapshot = registry.snapshot().unwrap();
        assert_eq!(snapshot.samples["page_counter"].value, 2.0);
        assert!(snapshot.timestamp.is_some());
    }

    #[test]
    fn test_concurrent_first_record_registers_once() {
        let registry = Arc::new(MetricRegistry::new());
        let counter = Arc::new(MetricCounter::new("page_counter", Arc::clone(&registry)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        counter.record();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.value(), 8_000);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot().unwrap().samples["page_counter"].value, 8_000.0);
    }

    #[test]
    fn test_counters_with_same_name_share_a_cell() {
        let registry = Arc::new(MetricRegistry::new());
        let first = MetricCounter::new("page_counter", Arc::clone(&registry));
        let second = MetricCounter::new("page_counter", Arc::clone(&registry));

        first.record();
        second.record();
        second.record();

        assert!(first.is_registered());
        assert!(second.is_registered());
        assert_eq!(registry.len(), 1);
        assert_eq!(second.value(), 3);
        assert_eq!(registry.snapshot().unwrap().sample("page_counter"), Some(3.0));
    }

    #[test]
    fn test_counter_joins_an_explicitly_registered_cell() {
        let registry = Arc::new(MetricRegistry::new());
        assert!(registry.register("hits", Arc::new(AtomicU64::new(5))));

        let counter = MetricCounter::new("hits", Arc::clone(&registry));
        counter.record();

        assert_eq!(counter.value(), 6);
        assert_eq!(registry.snapshot().unwrap().sample("hits"), Some(6.0));
    }

    #[test]
    fn test_first_registration_wins() {
        let registry = MetricRegistry::new();
        let first = Arc::new(AtomicU64::new(5));
        let second = Arc::new(AtomicU64::new(9));

        assert!(registry.register("hits", first));
        assert!(!registry.register("hits", second));
        assert_eq!(registry.snapshot().unwrap().samples["hits"].value, 5.0);
    }
}
