//! Endpoint pool for analysis worker services.
//!
//! One process-wide pool holds every registered worker endpoint, grouped by
//! service type. Selection never errors: no healthy endpoint simply means no
//! capacity right now, and the caller backs off. Endpoints are never removed;
//! an unhealthy endpoint sits out its cooldown window and is then re-probed
//! synchronously on the next selection that considers it (resurrection).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::models::ServiceType;

/// Liveness check against a single endpoint. Implementations bound their own
/// I/O; the pool additionally clamps each probe to `PoolConfig::probe_timeout`.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, url: &str, service: ServiceType) -> bool;
}

/// How to pick among healthy candidates. Ties always break toward the lowest
/// registration index, so selection is deterministic for a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    LeastInFlight,
    Random,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub cooldown: Duration,
    pub probe_timeout: Duration,
    pub strategy: SelectionStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(2),
            strategy: SelectionStrategy::RoundRobin,
        }
    }
}

#[derive(Debug, Clone)]
struct EndpointState {
    url: String,
    index: usize,
    is_healthy: bool,
    last_health_check: Option<Instant>,
    in_flight: u32,
    dispatched: u64,
    completed: u64,
    failures: u64,
    total_latency_ms: u64,
}

impl EndpointState {
    fn new(url: String, index: usize) -> Self {
        Self {
            url,
            index,
            is_healthy: true,
            last_health_check: None,
            in_flight: 0,
            dispatched: 0,
            completed: 0,
            failures: 0,
            total_latency_ms: 0,
        }
    }

    /// Unhealthy long enough that the cooldown has lapsed.
    fn is_resurrection_candidate(&self, cooldown: Duration) -> bool {
        !self.is_healthy
            && self
                .last_health_check
                .is_none_or(|checked| checked.elapsed() > cooldown)
    }
}

/// A chosen endpoint. The caller reports the dispatch outcome back with
/// `report_success`/`report_failure` to release the in-flight slot.
#[derive(Debug, Clone)]
pub struct Selection {
    pub service: ServiceType,
    pub url: String,
}

/// Read-only view of one endpoint, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub service: ServiceType,
    pub url: String,
    pub is_healthy: bool,
    pub in_flight: u32,
    pub dispatched: u64,
    pub failures: u64,
    pub avg_latency_ms: Option<u64>,
}

#[derive(Default)]
struct Inner {
    endpoints: HashMap<ServiceType, Vec<EndpointState>>,
    cursors: HashMap<ServiceType, usize>,
}

pub struct EndpointPool {
    inner: Mutex<Inner>,
    config: PoolConfig,
    probe: Arc<dyn Probe>,
}

impl EndpointPool {
    pub fn new(config: PoolConfig, probe: Arc<dyn Probe>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
            probe,
        }
    }

    /// Register an endpoint for a service. Registration order fixes the
    /// tie-breaking index for the lifetime of the pool.
    pub async fn register(&self, service: ServiceType, url: &str) {
        let mut inner = self.inner.lock().await;
        let list = inner.endpoints.entry(service).or_default();
        let index = list.len();
        list.push(EndpointState::new(url.to_string(), index));
        debug!(service = %service, url, index, "registered endpoint");
    }

    /// Pick a live endpoint for `service`, or `None` if there is temporarily
    /// no capacity. Unhealthy endpoints past their cooldown are re-probed
    /// inline before the decision is made.
    pub async fn select(&self, service: ServiceType) -> Option<Selection> {
        // Collect stale endpoints due for a re-probe, without holding the
        // lock across probe I/O.
        let stale: Vec<(usize, String)> = {
            let inner = self.inner.lock().await;
            let list = inner.endpoints.get(&service)?;
            list.iter()
                .filter(|e| e.is_resurrection_candidate(self.config.cooldown))
                .map(|e| (e.index, e.url.clone()))
                .collect()
        };

        let mut probe_outcomes = Vec::with_capacity(stale.len());
        for (index, url) in stale {
            let alive = tokio::time::timeout(
                self.config.probe_timeout,
                self.probe.probe(&url, service),
            )
            .await
            .unwrap_or(false);
            probe_outcomes.push((index, url, alive));
        }

        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let list = inner.endpoints.get_mut(&service)?;
        for (index, url, alive) in probe_outcomes {
            let Some(endpoint) = list.iter_mut().find(|e| e.index == index) else {
                continue;
            };
            endpoint.last_health_check = Some(now);
            if alive {
                endpoint.is_healthy = true;
                info!(service = %service, url, "endpoint resurrected");
            } else {
                debug!(service = %service, url, "endpoint still down, cooldown restarted");
            }
        }

        let candidates: Vec<usize> = list
            .iter()
            .filter(|e| e.is_healthy)
            .map(|e| e.index)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let chosen = match self.config.strategy {
            SelectionStrategy::RoundRobin => {
                let cursor = inner.cursors.entry(service).or_insert(0);
                let pick = candidates[*cursor % candidates.len()];
                *cursor = cursor.wrapping_add(1);
                pick
            }
            SelectionStrategy::LeastInFlight => {
                let list = inner.endpoints.get(&service)?;
                candidates
                    .iter()
                    .copied()
                    .min_by_key(|&i| (list[i].in_flight, i))?
            }
            SelectionStrategy::Random => {
                candidates[rand::thread_rng().gen_range(0..candidates.len())]
            }
        };

        let endpoint = inner.endpoints.get_mut(&service)?.get_mut(chosen)?;
        endpoint.in_flight += 1;
        endpoint.dispatched += 1;
        Some(Selection {
            service,
            url: endpoint.url.clone(),
        })
    }

    /// A dispatch against `url` failed (error or timeout). The endpoint is
    /// flipped unhealthy immediately and a fresh cooldown starts.
    pub async fn report_failure(&self, service: ServiceType, url: &str) {
        let mut inner = self.inner.lock().await;
        let Some(list) = inner.endpoints.get_mut(&service) else {
            return;
        };
        if let Some(endpoint) = list.iter_mut().find(|e| e.url == url) {
            endpoint.is_healthy = false;
            endpoint.last_health_check = Some(Instant::now());
            endpoint.in_flight = endpoint.in_flight.saturating_sub(1);
            endpoint.failures += 1;
            warn!(service = %service, url, "endpoint marked unhealthy");
        }
    }

    /// A dispatch against `url` completed its round trip; release the
    /// in-flight slot and fold the observed latency into the rolling counters.
    pub async fn report_success(&self, service: ServiceType, url: &str, latency: Duration) {
        let mut inner = self.inner.lock().await;
        let Some(list) = inner.endpoints.get_mut(&service) else {
            return;
        };
        if let Some(endpoint) = list.iter_mut().find(|e| e.url == url) {
            endpoint.in_flight = endpoint.in_flight.saturating_sub(1);
            endpoint.completed += 1;
            endpoint.total_latency_ms += latency.as_millis() as u64;
        }
    }

    /// Snapshot of every registered endpoint.
    pub async fn status(&self) -> Vec<EndpointStatus> {
        let inner = self.inner.lock().await;
        let mut out = Vec::new();
        for (service, list) in &inner.endpoints {
            for e in list {
                out.push(EndpointStatus {
                    service: *service,
                    url: e.url.clone(),
                    is_healthy: e.is_healthy,
                    in_flight: e.in_flight,
                    dispatched: e.dispatched,
                    failures: e.failures,
                    avg_latency_ms: (e.completed > 0).then(|| e.total_latency_ms / e.completed),
                });
            }
        }
        out.sort_by(|a, b| (a.service, &a.url).cmp(&(b.service, &b.url)));
        out
    }
}
