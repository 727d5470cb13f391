//! Per-signal delivery counters for the bus.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

/// Counters for a single signal name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SignalMetrics {
    /// Times the signal was published.
    pub published: u64,
    /// Inbox deliveries (one publish may fan out to several services).
    pub delivered: u64,
    /// Deliveries skipped because the target service was unknown or gone.
    pub dropped: u64,
    /// Total encoded bytes handed to inboxes.
    pub bytes: u64,
}

/// Thread-safe collection of [`SignalMetrics`] keyed by signal name.
#[derive(Debug, Default)]
pub struct BusMetrics {
    signals: Mutex<HashMap<String, SignalMetrics>>,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry(&self, name: &str, f: impl FnOnce(&mut SignalMetrics)) {
        let mut signals = self.signals.lock().unwrap_or_else(|e| e.into_inner());
        f(signals.entry(name.to_string()).or_default());
    }

    pub(crate) fn record_published(&self, name: &str) {
        self.with_entry(name, |m| m.published += 1);
    }

    pub(crate) fn record_delivered(&self, name: &str, bytes: usize) {
        self.with_entry(name, |m| {
            m.delivered += 1;
            m.bytes += bytes as u64;
        });
    }

    pub(crate) fn record_dropped(&self, name: &str) {
        self.with_entry(name, |m| m.dropped += 1);
    }

    /// Counters for one signal name (zeroes if never seen).
    pub fn get(&self, name: &str) -> SignalMetrics {
        let signals = self.signals.lock().unwrap_or_else(|e| e.into_inner());
        signals.get(name).copied().unwrap_or_default()
    }

    /// Copy of all counters.
    pub fn snapshot(&self) -> HashMap<String, SignalMetrics> {
        self.signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_name() {
        let m = BusMetrics::new();
        m.record_published("a");
        m.record_delivered("a", 10);
        m.record_delivered("a", 5);
        m.record_dropped("b");

        let a = m.get("a");
        assert_eq!(a.published, 1);
        assert_eq!(a.delivered, 2);
        assert_eq!(a.bytes, 15);
        assert_eq!(m.get("b").dropped, 1);
        assert_eq!(m.get("never"), SignalMetrics::default());
        assert_eq!(m.snapshot().len(), 2);
    }
}
