//! In-process signal transport with per-service inboxes.
//!
//! Every service registers once and receives an [`Inbox`]. Publishing is
//! fire-and-forget:
//! - a local signal (no targets) lands only in the emitter's own inbox
//! - a targeted signal lands in each named service's inbox
//!
//! Each inbox is a single unbounded FIFO fed by encoded envelopes, so signals
//! from one emitter with one name arrive in publish order. Nothing is ordered
//! across distinct names beyond that.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SignalError;
use crate::metrics::BusMetrics;
use crate::signal::{Payload, Signal};

/// Publish/subscribe hub owned by the hosting process.
#[derive(Debug, Default)]
pub struct SignalBus {
    inboxes: RwLock<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
    metrics: BusMetrics,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service and hand back the receiving end of its inbox.
    pub fn register(&self, service: &str) -> Result<Inbox, SignalError> {
        let mut inboxes = self.inboxes.write().unwrap_or_else(|e| e.into_inner());
        if inboxes
            .get(service)
            .is_some_and(|tx| !tx.is_closed())
        {
            return Err(SignalError::DuplicateService(service.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inboxes.insert(service.to_string(), tx);
        info!(service, "service registered on signal bus");
        Ok(Inbox {
            service: service.to_string(),
            rx,
        })
    }

    /// Remove a service. Signals already queued in its inbox stay readable.
    pub fn unregister(&self, service: &str) -> bool {
        let removed = self
            .inboxes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(service)
            .is_some();
        if removed {
            info!(service, "service unregistered from signal bus");
        }
        removed
    }

    /// Names of all registered services, sorted.
    pub fn services(&self) -> Vec<String> {
        let inboxes = self.inboxes.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = inboxes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Publish a signal on behalf of `origin`. Returns the number of inboxes reached.
    ///
    /// Never fails the caller: encoding errors and unknown targets are logged
    /// and counted as dropped.
    pub fn publish(&self, origin: &str, signal: Signal) -> usize {
        let signal = signal.stamp_origin(origin);
        let name = signal.name().to_string();
        self.metrics.record_published(&name);

        let bytes = match signal.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                warn!(signal = %name, origin, error = %e, "failed to encode signal");
                self.metrics.record_dropped(&name);
                return 0;
            }
        };

        let recipients: BTreeSet<&str> = if signal.is_local() {
            BTreeSet::from([origin])
        } else {
            signal.target_services().iter().map(String::as_str).collect()
        };

        let inboxes = self.inboxes.read().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        for recipient in recipients {
            match inboxes.get(recipient) {
                Some(tx) if tx.send(bytes.clone()).is_ok() => {
                    self.metrics.record_delivered(&name, bytes.len());
                    delivered += 1;
                }
                Some(_) => {
                    warn!(signal = %name, origin, target = recipient, "inbox closed, signal dropped");
                    self.metrics.record_dropped(&name);
                }
                None => {
                    warn!(signal = %name, origin, target = recipient, "unknown target service, signal dropped");
                    self.metrics.record_dropped(&name);
                }
            }
        }

        debug!(signal = %name, origin, delivered, "signal published");
        delivered
    }

    /// A publishing handle bound to `origin`.
    pub fn emitter(self: &Arc<Self>, origin: impl Into<String>) -> SignalEmitter {
        SignalEmitter {
            bus: Arc::clone(self),
            origin: origin.into(),
        }
    }

    pub fn metrics(&self) -> &BusMetrics {
        &self.metrics
    }
}

/// Receiving end of a service's inbox.
#[derive(Debug)]
pub struct Inbox {
    service: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Inbox {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Wait for the next signal. Returns `None` once the service is
    /// unregistered and the queue is drained.
    pub async fn recv(&mut self) -> Option<Signal> {
        loop {
            let bytes = self.rx.recv().await?;
            match Signal::from_bytes(&bytes) {
                Ok(signal) => return Some(signal),
                Err(e) => warn!(service = %self.service, error = %e, "failed to decode signal envelope"),
            }
        }
    }

    /// Take the next queued signal without waiting.
    pub fn try_recv(&mut self) -> Option<Signal> {
        while let Ok(bytes) = self.rx.try_recv() {
            match Signal::from_bytes(&bytes) {
                Ok(signal) => return Some(signal),
                Err(e) => warn!(service = %self.service, error = %e, "failed to decode signal envelope"),
            }
        }
        None
    }
}

/// Cloneable handle that publishes signals as one service.
#[derive(Debug, Clone)]
pub struct SignalEmitter {
    bus: Arc<SignalBus>,
    origin: String,
}

impl SignalEmitter {
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Emit a local signal.
    pub fn emit(&self, name: &str, payload: Payload) -> usize {
        self.bus.publish(&self.origin, Signal::new(name, payload))
    }

    /// Emit a signal routed to the given services.
    pub fn emit_to<I, S>(&self, name: &str, payload: Payload, targets: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bus
            .publish(&self.origin, Signal::new(name, payload).with_targets(targets))
    }

    /// Publish a pre-built signal.
    pub fn publish(&self, signal: Signal) -> usize {
        self.bus.publish(&self.origin, signal)
    }

    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.bus
    }
}
