//! Delegation of tasks to peer services under bounded concurrency.
//!
//! Every (service, task) pair gets one FIFO semaphore shared by all callers.
//! A dispatch waits for a permit, invokes the peer, and releases the permit
//! when the peer returns, whether it succeeded or not. Failures are handed
//! back to the calling branch and never retried here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::FlowError;
use crate::metrics::FlowMetrics;

/// A delegated call: which peer runs which of its exposed tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeputyRequest {
    pub target_service: String,
    pub task_name: String,
    /// Max in-flight calls for this (service, task) pair.
    pub concurrency_limit: usize,
}

impl DeputyRequest {
    pub fn new(
        target_service: impl Into<String>,
        task_name: impl Into<String>,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            target_service: target_service.into(),
            task_name: task_name.into(),
            concurrency_limit,
        }
    }

    /// `service.task`, the key used in configuration.
    pub fn key(&self) -> String {
        format!("{}.{}", self.target_service, self.task_name)
    }
}

/// A service that can run tasks on behalf of others.
#[async_trait]
pub trait DeputyPeer: Send + Sync {
    fn peer_name(&self) -> &str;

    async fn invoke(&self, task: &str, ctx: Context) -> Result<Context, FlowError>;
}

/// Effective concurrency limits.
///
/// A per-pair override wins, then the request's own limit, then
/// `default_limit` for requests that leave the limit at 0.
#[derive(Debug, Clone)]
pub struct DeputyLimits {
    pub default_limit: usize,
    pub overrides: HashMap<String, usize>,
}

impl Default for DeputyLimits {
    fn default() -> Self {
        Self {
            default_limit: 4,
            overrides: HashMap::new(),
        }
    }
}

impl DeputyLimits {
    pub fn resolve(&self, request: &DeputyRequest) -> usize {
        let limit = match self.overrides.get(&request.key()) {
            Some(&n) => n,
            None if request.concurrency_limit > 0 => request.concurrency_limit,
            None => self.default_limit,
        };
        limit.max(1)
    }
}

struct Slot {
    limit: usize,
    semaphore: Arc<Semaphore>,
}

/// Routes deputy requests to registered peers.
pub struct DeputyDispatcher {
    peers: RwLock<HashMap<String, Weak<dyn DeputyPeer>>>,
    slots: Mutex<HashMap<(String, String), Slot>>,
    limits: DeputyLimits,
    metrics: Arc<FlowMetrics>,
}

impl std::fmt::Debug for DeputyDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeputyDispatcher")
            .field("peers", &self.peer_names())
            .field("limits", &self.limits)
            .finish()
    }
}

impl DeputyDispatcher {
    pub fn new(limits: DeputyLimits, metrics: Arc<FlowMetrics>) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            limits,
            metrics,
        }
    }

    /// Make `peer` reachable by name. Only a weak reference is kept, so a
    /// dropped service simply becomes unavailable.
    pub fn register_peer(&self, peer: &Arc<dyn DeputyPeer>) {
        let name = peer.peer_name().to_string();
        debug!(peer = %name, "deputy peer registered");
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, Arc::downgrade(peer));
    }

    pub fn unregister_peer(&self, name: &str) -> bool {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn peer_names(&self) -> Vec<String> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = peers.keys().cloned().collect();
        names.sort();
        names
    }

    fn peer(&self, name: &str) -> Option<Arc<dyn DeputyPeer>> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .and_then(Weak::upgrade)
    }

    /// Semaphore for the request's pair. Created on first use; its limit is
    /// fixed from then on.
    fn semaphore(&self, request: &DeputyRequest) -> Arc<Semaphore> {
        let limit = self.limits.resolve(request);
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots
            .entry((request.target_service.clone(), request.task_name.clone()))
            .or_insert_with(|| Slot {
                limit,
                semaphore: Arc::new(Semaphore::new(limit)),
            });
        if slot.limit != limit {
            debug!(
                deputy = %request.key(),
                configured = slot.limit,
                requested = limit,
                "deputy limit already fixed, keeping the first"
            );
        }
        Arc::clone(&slot.semaphore)
    }

    /// Free permits for a pair, if it has been used.
    pub fn available_permits(&self, service: &str, task: &str) -> Option<usize> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(service.to_string(), task.to_string()))
            .map(|s| s.semaphore.available_permits())
    }

    /// Run `request` on its peer once a slot is free and return the peer's context.
    pub async fn dispatch(&self, request: &DeputyRequest, ctx: Context) -> Result<Context, FlowError> {
        let service = request.target_service.as_str();
        let task = request.task_name.as_str();

        let peer = self.peer(service).ok_or_else(|| {
            warn!(service, task, "deputy target not available");
            self.metrics.record_deputy(false);
            FlowError::PeerUnavailable(service.to_string())
        })?;

        let semaphore = self.semaphore(request);
        let waited = Instant::now();
        let _permit = semaphore.acquire_owned().await.map_err(|e| FlowError::Deputy {
            service: service.to_string(),
            task: task.to_string(),
            message: e.to_string(),
        })?;
        debug!(service, task, waited_ms = waited.elapsed().as_millis() as u64, "deputy slot acquired");

        match peer.invoke(task, ctx).await {
            Ok(out) => {
                self.metrics.record_deputy(true);
                Ok(out)
            }
            Err(e) => {
                warn!(service, task, error = %e, "deputy call failed");
                self.metrics.record_deputy(false);
                Err(FlowError::Deputy {
                    service: service.to_string(),
                    task: task.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    struct Echo {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl DeputyPeer for Echo {
        fn peer_name(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, task: &str, mut ctx: Context) -> Result<Context, FlowError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if task == "boom" {
                return Err(FlowError::task(task, "exploded"));
            }
            ctx.insert("echoed", true);
            Ok(ctx)
        }
    }

    fn echo() -> Arc<Echo> {
        Arc::new(Echo {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn limit_bounds_in_flight_calls() {
        let peer = echo();
        let dyn_peer: Arc<dyn DeputyPeer> = peer.clone();
        let dispatcher = Arc::new(DeputyDispatcher::new(DeputyLimits::default(), Arc::default()));
        dispatcher.register_peer(&dyn_peer);

        let req = DeputyRequest::new("echo", "work", 2);
        let calls = (0..6).map(|_| {
            let d = Arc::clone(&dispatcher);
            let r = req.clone();
            tokio::spawn(async move { d.dispatch(&r, Context::new()).await })
        });
        for res in futures::future::join_all(calls).await {
            assert!(res.unwrap().unwrap().bool("echoed").unwrap());
        }
        assert_eq!(peer.peak.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.available_permits("echo", "work"), Some(2));
    }

    #[tokio::test]
    async fn failure_releases_permit_and_wraps_error() {
        let peer: Arc<dyn DeputyPeer> = echo();
        let dispatcher = DeputyDispatcher::new(DeputyLimits::default(), Arc::default());
        dispatcher.register_peer(&peer);

        let err = dispatcher
            .dispatch(&DeputyRequest::new("echo", "boom", 1), Context::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Deputy { .. }));
        assert_eq!(dispatcher.available_permits("echo", "boom"), Some(1));
        assert_eq!(dispatcher.metrics.snapshot().deputy_failures, 1);
    }

    #[tokio::test]
    async fn dropped_peer_is_unavailable() {
        let dispatcher = DeputyDispatcher::new(DeputyLimits::default(), Arc::default());
        {
            let peer: Arc<dyn DeputyPeer> = echo();
            dispatcher.register_peer(&peer);
        }
        let err = dispatcher
            .dispatch(&DeputyRequest::new("echo", "work", 1), Context::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::PeerUnavailable(_)));
    }

    /// Logs the `caller` of each call as it starts, then holds the slot.
    struct Ledger {
        started: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeputyPeer for Ledger {
        fn peer_name(&self) -> &str {
            "ledger"
        }

        async fn invoke(&self, _task: &str, ctx: Context) -> Result<Context, FlowError> {
            let caller = ctx.str("caller")?.to_string();
            self.started.lock().unwrap().push(caller);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(ctx)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_admitted_in_arrival_order() {
        let peer = Arc::new(Ledger {
            started: Mutex::new(Vec::new()),
        });
        let dyn_peer: Arc<dyn DeputyPeer> = peer.clone();
        let dispatcher = Arc::new(DeputyDispatcher::new(DeputyLimits::default(), Arc::default()));
        dispatcher.register_peer(&dyn_peer);
        let req = DeputyRequest::new("ledger", "record", 1);

        // Caller 0 takes the only permit; 1..=4 queue behind it 5 ms apart.
        let calls: Vec<_> = (0..5u64)
            .map(|i| {
                let d = Arc::clone(&dispatcher);
                let r = req.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(i * 5)).await;
                    d.dispatch(&r, Context::new().with("caller", format!("c{i}"))).await
                })
            })
            .collect();
        for res in futures::future::join_all(calls).await {
            res.unwrap().unwrap();
        }

        assert_eq!(*peer.started.lock().unwrap(), ["c0", "c1", "c2", "c3", "c4"]);
        assert_eq!(dispatcher.available_permits("ledger", "record"), Some(1));
    }

    #[test]
    fn override_beats_request_limit() {
        let limits = DeputyLimits {
            default_limit: 4,
            overrides: HashMap::from([("anomaly.score_reading".to_string(), 1)]),
        };
        assert_eq!(limits.resolve(&DeputyRequest::new("anomaly", "score_reading", 8)), 1);
        assert_eq!(limits.resolve(&DeputyRequest::new("anomaly", "other", 0)), 4);
        assert_eq!(limits.resolve(&DeputyRequest::new("anomaly", "other", 3)), 3);
    }
}
