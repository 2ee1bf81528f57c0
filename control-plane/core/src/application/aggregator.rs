// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0
//! # Metrics Aggregator
//!
//! Rolls leaf (Specialist) metrics up into domain and system summaries.
//! Recomputed on every registry mutation rather than on a timer, so a
//! rollup can never lag the state it was derived from. This is the only
//! component allowed to hold derived values; views read the cache, they
//! never aggregate on their own.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::application::registry::AgentRegistry;
use crate::domain::node::{AgentStatus, Tier};
use crate::infrastructure::event_bus::{EventBusError, EventReceiver};

/// Aggregate over the `active` specialists of one domain.
///
/// `success_rate` and `avg_response_time_ms` are `None` when the domain
/// has no active specialists; reporting 0 there would read as a 0%
/// success rate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainRollup {
    pub domain: String,
    pub success_rate: Option<f64>,
    pub avg_response_time_ms: Option<f64>,
    pub active: usize,
    pub down: usize,
    pub transitioning: usize,
}

impl DomainRollup {
    /// Share of non-transitioning specialists currently active.
    pub fn health_ratio(&self) -> Option<f64> {
        let counted = self.active + self.down;
        if counted == 0 {
            None
        } else {
            Some(self.active as f64 / counted as f64)
        }
    }
}

/// System-wide aggregate across domain rollups.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemRollup {
    pub success_rate: Option<f64>,
    pub avg_response_time_ms: Option<f64>,
    pub domains: usize,
    pub active: usize,
    pub down: usize,
    pub transitioning: usize,
}

impl SystemRollup {
    pub fn health_ratio(&self) -> Option<f64> {
        let counted = self.active + self.down;
        if counted == 0 {
            None
        } else {
            Some(self.active as f64 / counted as f64)
        }
    }
}

#[derive(Debug, Clone)]
struct RollupSet {
    domains: Vec<DomainRollup>,
    system: SystemRollup,
}

pub struct MetricsAggregator {
    registry: Arc<AgentRegistry>,
    cache: RwLock<RollupSet>,
    /// Subscribed at construction so mutations between construction and
    /// the spawn of `run` are buffered, not lost.
    events: Mutex<Option<EventReceiver>>,
}

impl MetricsAggregator {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        let events = registry.bus().subscribe();
        let aggregator = Self {
            registry,
            events: Mutex::new(Some(events)),
            cache: RwLock::new(RollupSet {
                domains: Vec::new(),
                system: SystemRollup {
                    success_rate: None,
                    avg_response_time_ms: None,
                    domains: 0,
                    active: 0,
                    down: 0,
                    transitioning: 0,
                },
            }),
        };
        aggregator.recompute();
        aggregator
    }

    /// Recompute all rollups from current registry state.
    pub fn recompute(&self) {
        let nodes = self.registry.snapshot();

        let mut per_domain: BTreeMap<String, Vec<(&AgentStatus, f64, f64)>> = BTreeMap::new();
        for node in &nodes {
            if node.tier != Tier::Specialist {
                continue;
            }
            let domain = node.domain.clone().unwrap_or_else(|| "unassigned".to_string());
            per_domain.entry(domain).or_default().push((
                &node.status,
                node.metrics.success_rate,
                node.metrics.avg_response_time_ms,
            ));
        }

        let mut domains = Vec::with_capacity(per_domain.len());
        for (domain, specialists) in per_domain {
            let mut active = 0usize;
            let mut down = 0usize;
            let mut transitioning = 0usize;
            let mut success_sum = 0.0;
            let mut response_sum = 0.0;
            for (status, success, response) in specialists {
                match status {
                    AgentStatus::Active => {
                        active += 1;
                        success_sum += success;
                        response_sum += response;
                    }
                    AgentStatus::Inactive | AgentStatus::Error => down += 1,
                    AgentStatus::Starting | AgentStatus::Stopping => transitioning += 1,
                }
            }
            let (success_rate, avg_response_time_ms) = if active > 0 {
                (
                    Some(success_sum / active as f64),
                    Some(response_sum / active as f64),
                )
            } else {
                (None, None)
            };
            domains.push(DomainRollup {
                domain,
                success_rate,
                avg_response_time_ms,
                active,
                down,
                transitioning,
            });
        }

        // Domains without any active specialists contribute counts but
        // no averages, mirroring the per-domain rule.
        let live: Vec<&DomainRollup> = domains.iter().filter(|d| d.success_rate.is_some()).collect();
        let system = SystemRollup {
            success_rate: mean(live.iter().filter_map(|d| d.success_rate)),
            avg_response_time_ms: mean(live.iter().filter_map(|d| d.avg_response_time_ms)),
            domains: domains.len(),
            active: domains.iter().map(|d| d.active).sum(),
            down: domains.iter().map(|d| d.down).sum(),
            transitioning: domains.iter().map(|d| d.transitioning).sum(),
        };

        debug!(domains = system.domains, active = system.active, "rollups recomputed");
        *self.cache.write() = RollupSet { domains, system };
    }

    pub fn domain_rollups(&self) -> Vec<DomainRollup> {
        self.cache.read().domains.clone()
    }

    pub fn domain_rollup(&self, domain: &str) -> Option<DomainRollup> {
        self.cache
            .read()
            .domains
            .iter()
            .find(|d| d.domain == domain)
            .cloned()
    }

    pub fn system_rollup(&self) -> SystemRollup {
        self.cache.read().system.clone()
    }

    /// Follow the registry event bus and recompute after every
    /// mutation. Lagging just means a redundant recompute.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        // A second `run` gets a fresh subscription.
        let mut rx = self
            .events
            .lock()
            .take()
            .unwrap_or_else(|| self.registry.bus().subscribe());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Ok(_) | Err(EventBusError::Lagged(_)) => self.recompute(),
                    Err(EventBusError::Closed) => return,
                    Err(EventBusError::Empty) => {}
                },
            }
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::{AgentId, AgentMetrics, AgentNode};
    use crate::infrastructure::event_bus::EventBus;
    use chrono::Utc;
    use std::collections::HashMap;

    fn specialist(id: &str, domain: &str, status: AgentStatus, success: f64, response: f64) -> AgentNode {
        AgentNode {
            id: AgentId::from(id),
            name: id.to_string(),
            tier: Tier::Specialist,
            domain: Some(domain.to_string()),
            parent_id: Some(AgentId::from(format!("domain-{domain}").as_str())),
            status,
            metrics: AgentMetrics {
                success_rate: success,
                avg_response_time_ms: response,
                cpu_percent: 10.0,
                memory_mb: 256.0,
                tasks_completed: 100,
                last_updated: Utc::now(),
            },
            config: HashMap::new(),
            config_version: 1,
            last_error: None,
            pending_command: None,
        }
    }

    fn supervisor(id: &str, tier: Tier, parent: Option<&str>, domain: Option<&str>) -> AgentNode {
        AgentNode {
            id: AgentId::from(id),
            name: id.to_string(),
            tier,
            domain: domain.map(str::to_string),
            parent_id: parent.map(AgentId::from),
            status: AgentStatus::Active,
            metrics: AgentMetrics::zero(Utc::now()),
            config: HashMap::new(),
            config_version: 1,
            last_error: None,
            pending_command: None,
        }
    }

    fn registry_with(specialists: Vec<AgentNode>) -> Arc<AgentRegistry> {
        let registry = Arc::new(AgentRegistry::new(EventBus::new(64)));
        let now = Utc::now();
        registry
            .upsert(supervisor("master", Tier::Master, None, None), now)
            .unwrap();
        registry
            .upsert(
                supervisor("domain-ecommerce", Tier::Domain, Some("master"), Some("ecommerce")),
                now,
            )
            .unwrap();
        registry
            .upsert(
                supervisor("domain-analytics", Tier::Domain, Some("master"), Some("analytics")),
                now,
            )
            .unwrap();
        for s in specialists {
            registry.upsert(s, now).unwrap();
        }
        registry
    }

    #[test]
    fn domain_rollup_averages_active_specialists_only() {
        let registry = registry_with(vec![
            specialist("spec-1", "ecommerce", AgentStatus::Active, 90.0, 100.0),
            specialist("spec-2", "ecommerce", AgentStatus::Active, 70.0, 300.0),
            specialist("spec-3", "ecommerce", AgentStatus::Error, 10.0, 900.0),
            specialist("spec-4", "ecommerce", AgentStatus::Starting, 50.0, 500.0),
        ]);
        let aggregator = MetricsAggregator::new(registry);

        let rollup = aggregator.domain_rollup("ecommerce").unwrap();
        assert_eq!(rollup.success_rate, Some(80.0));
        assert_eq!(rollup.avg_response_time_ms, Some(200.0));
        assert_eq!(rollup.active, 2);
        assert_eq!(rollup.down, 1);
        assert_eq!(rollup.transitioning, 1);
        assert_eq!(rollup.health_ratio(), Some(2.0 / 3.0));
    }

    #[test]
    fn zero_active_children_yields_none_not_zero() {
        let registry = registry_with(vec![
            specialist("spec-1", "analytics", AgentStatus::Inactive, 0.0, 0.0),
            specialist("spec-2", "analytics", AgentStatus::Error, 0.0, 0.0),
        ]);
        let aggregator = MetricsAggregator::new(registry);

        let rollup = aggregator.domain_rollup("analytics").unwrap();
        assert_eq!(rollup.success_rate, None);
        assert_eq!(rollup.avg_response_time_ms, None);
        assert_eq!(rollup.down, 2);

        // A system with no active specialists anywhere is also None.
        let system = aggregator.system_rollup();
        assert_eq!(system.success_rate, None);
        assert_eq!(system.avg_response_time_ms, None);
    }

    #[test]
    fn system_rollup_averages_across_domains() {
        let registry = registry_with(vec![
            specialist("spec-1", "ecommerce", AgentStatus::Active, 90.0, 100.0),
            specialist("spec-2", "analytics", AgentStatus::Active, 70.0, 300.0),
            specialist("spec-3", "analytics", AgentStatus::Error, 0.0, 0.0),
        ]);
        let aggregator = MetricsAggregator::new(registry);

        let system = aggregator.system_rollup();
        // Mean of domain means, not of raw specialists.
        assert_eq!(system.success_rate, Some(80.0));
        assert_eq!(system.avg_response_time_ms, Some(200.0));
        assert_eq!(system.active, 2);
        assert_eq!(system.down, 1);
        assert_eq!(system.domains, 2);
    }

    #[test]
    fn recompute_reflects_registry_mutations() {
        let registry = registry_with(vec![specialist(
            "spec-1",
            "ecommerce",
            AgentStatus::Active,
            90.0,
            100.0,
        )]);
        let aggregator = MetricsAggregator::new(registry.clone());
        assert_eq!(aggregator.domain_rollup("ecommerce").unwrap().active, 1);

        let mut failed = specialist("spec-1", "ecommerce", AgentStatus::Error, 90.0, 100.0);
        failed.metrics.last_updated = Utc::now() + chrono::Duration::seconds(1);
        registry.upsert(failed, Utc::now()).unwrap();
        aggregator.recompute();

        let rollup = aggregator.domain_rollup("ecommerce").unwrap();
        assert_eq!(rollup.active, 0);
        assert_eq!(rollup.down, 1);
        assert_eq!(rollup.success_rate, None);
    }

    #[tokio::test]
    async fn events_before_run_spawn_are_not_lost() {
        let registry = registry_with(vec![]);
        let aggregator = Arc::new(MetricsAggregator::new(registry.clone()));

        // Mutation lands before the run task exists; the construction-time
        // subscription buffers it.
        registry
            .upsert(
                specialist("spec-9", "ecommerce", AgentStatus::Active, 88.0, 40.0),
                Utc::now(),
            )
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(aggregator.clone().run(cancel.clone()));

        let mut seen = false;
        for _ in 0..50 {
            if aggregator.domain_rollup("ecommerce").map(|r| r.active) == Some(1) {
                seen = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(seen, "event published before run started was dropped");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn run_loop_recomputes_on_bus_events() {
        let registry = registry_with(vec![]);
        let aggregator = Arc::new(MetricsAggregator::new(registry.clone()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(aggregator.clone().run(cancel.clone()));

        registry
            .upsert(
                specialist("spec-9", "ecommerce", AgentStatus::Active, 88.0, 40.0),
                Utc::now(),
            )
            .unwrap();

        // The loop is asynchronous; poll briefly for the recompute.
        let mut seen = false;
        for _ in 0..50 {
            if aggregator.domain_rollup("ecommerce").map(|r| r.active) == Some(1) {
                seen = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(seen, "aggregator did not react to registry event");

        cancel.cancel();
        handle.await.unwrap();
    }
}
