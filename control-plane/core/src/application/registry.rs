// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Registry
//!
//! Canonical in-memory representation of the supervision hierarchy and
//! the single source of mutable truth for every other component. All
//! writes go through `upsert` (authoritative), `apply_optimistic`
//! (client intent) or `rollback` (reconciliation); everything else
//! reads cloned state.
//!
//! The registry is an explicitly owned, injectable store: constructed
//! once at startup and handed to components as `Arc<AgentRegistry>`,
//! never reached through a global.

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::command::CommandKind;
use crate::domain::error::ControlError;
use crate::domain::events::RegistryEvent;
use crate::domain::node::{AgentId, AgentNode, AgentStatus, NodeError, PendingCommand, Tier};
use crate::infrastructure::event_bus::EventBus;

/// What an authoritative `upsert` did with the incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Record inserted or authoritative fields replaced.
    Applied,
    /// A pending command was confirmed by the reported state.
    Confirmed,
    /// Incoming data carried nothing newer; stored record untouched.
    Unchanged,
    /// Response predates an outstanding command; discarded for this node.
    DiscardedStale,
    /// Authoritative fields merged but the optimistic transitional
    /// status was preserved while its command is still in flight.
    PreservedOptimistic,
}

struct RegistryInner {
    nodes: HashMap<AgentId, AgentNode>,
    /// Last authoritative copy per node; restored on rollback.
    authoritative: HashMap<AgentId, AgentNode>,
    sync_healthy: bool,
    last_sync: Option<DateTime<Utc>>,
}

pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
    bus: EventBus,
}

impl AgentRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                nodes: HashMap::new(),
                authoritative: HashMap::new(),
                sync_healthy: true,
                last_sync: None,
            }),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Merge authoritative server state for one node.
    ///
    /// `observed_at` is when the fetch producing this record was
    /// initiated; responses racing an in-flight command are discarded
    /// when they predate the command's issue time. Arrival order does
    /// not matter: the `config_version` / `last_updated` comparison
    /// makes the merge commutative.
    pub fn upsert(
        &self,
        mut incoming: AgentNode,
        observed_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, ControlError> {
        // Authoritative payloads never carry client-side command state.
        incoming.pending_command = None;

        let now = Utc::now();
        let mut inner = self.inner.write();

        self.check_tree_invariant(&inner, &incoming)?;

        let Some(existing) = inner.nodes.get(&incoming.id).cloned() else {
            debug!(agent_id = %incoming.id, status = %incoming.status, "registering new node");
            inner.authoritative.insert(incoming.id.clone(), incoming.clone());
            let event = RegistryEvent::NodeUpserted {
                agent_id: incoming.id.clone(),
                status: incoming.status,
                config_version: incoming.config_version,
                at: now,
            };
            inner.nodes.insert(incoming.id.clone(), incoming);
            drop(inner);
            self.bus.publish(event);
            return Ok(UpsertOutcome::Applied);
        };

        if incoming.config_version < existing.config_version {
            return Err(ControlError::VersionConflict {
                agent_id: incoming.id,
                held: existing.config_version,
                incoming: incoming.config_version,
            });
        }

        if incoming.config_version == existing.config_version
            && incoming.metrics.last_updated <= existing.metrics.last_updated
        {
            // Replay or reordered duplicate of data we already hold.
            return Ok(UpsertOutcome::Unchanged);
        }

        // Reconcile against an in-flight optimistic command.
        let mut outcome = UpsertOutcome::Applied;
        let mut confirmed: Option<PendingCommand> = None;
        let mut still_pending: Option<PendingCommand> = None;
        if let Some(mut pending) = existing.pending_command.clone() {
            if !pending.is_expired(now) {
                if observed_at < pending.issued_at {
                    return Ok(UpsertOutcome::DiscardedStale);
                }
                if incoming.status != pending.issued_from {
                    pending.departure_seen = true;
                }
                if command_confirmed(&pending, &existing, &incoming) {
                    confirmed = Some(pending);
                    outcome = UpsertOutcome::Confirmed;
                } else if incoming.status == AgentStatus::Error {
                    // Server reports a failure; the command is over.
                    confirmed = None;
                    outcome = UpsertOutcome::Applied;
                } else {
                    // Fresher data, but the backend has not transitioned
                    // yet; keep showing the operator's intent.
                    still_pending = Some(pending);
                    outcome = UpsertOutcome::PreservedOptimistic;
                }
            }
        }

        if !existing.status.can_transition_to(incoming.status) {
            warn!(
                agent_id = %incoming.id,
                from = %existing.status,
                to = %incoming.status,
                "server reported a non-adjacent status transition"
            );
        }

        inner
            .authoritative
            .insert(incoming.id.clone(), incoming.clone());

        let stored = match outcome {
            UpsertOutcome::PreservedOptimistic => {
                let mut merged = incoming.clone();
                merged.status = existing.status;
                merged.pending_command = still_pending;
                merged.last_error = existing.last_error.clone();
                merged
            }
            UpsertOutcome::Confirmed => {
                let mut merged = incoming.clone();
                merged.last_error = None;
                merged
            }
            _ => {
                let mut merged = incoming.clone();
                // An error report resolves whatever was pending.
                if merged.status == AgentStatus::Error && merged.last_error.is_none() {
                    merged.last_error = existing.last_error.clone();
                }
                merged
            }
        };

        let event = RegistryEvent::NodeUpserted {
            agent_id: stored.id.clone(),
            status: stored.status,
            config_version: stored.config_version,
            at: now,
        };
        inner.nodes.insert(stored.id.clone(), stored);
        drop(inner);

        if let Some(pending) = confirmed {
            info!(
                agent_id = %incoming.id,
                kind = %pending.kind,
                "command confirmed by authoritative state"
            );
            counter!("fleet_commands_confirmed_total").increment(1);
            self.bus.publish(RegistryEvent::CommandConfirmed {
                agent_id: incoming.id.clone(),
                command_id: pending.command_id,
                kind: pending.kind,
                at: now,
            });
        }
        self.bus.publish(event);
        Ok(outcome)
    }

    /// Apply a full hierarchy snapshot: upsert every reported node and
    /// remove nodes the backend no longer reports (decommissioning is
    /// only ever backend-driven).
    pub fn apply_snapshot(&self, mut nodes: Vec<AgentNode>, observed_at: DateTime<Utc>) {
        // Parents before children so the tree invariant holds mid-apply.
        nodes.sort_by_key(|n| match n.tier {
            Tier::Master => 0u8,
            Tier::Domain => 1,
            Tier::Specialist => 2,
        });

        let reported: HashSet<AgentId> = nodes.iter().map(|n| n.id.clone()).collect();

        for node in nodes {
            let agent_id = node.id.clone();
            match self.upsert(node, observed_at) {
                Ok(_) => {}
                Err(ControlError::VersionConflict { held, incoming, .. }) => {
                    warn!(
                        agent_id = %agent_id,
                        held, incoming,
                        "discarding stale snapshot record"
                    );
                }
                Err(e) => warn!(agent_id = %agent_id, error = %e, "snapshot record rejected"),
            }
        }

        let removed: Vec<AgentId> = {
            let mut inner = self.inner.write();
            let gone: Vec<AgentId> = inner
                .nodes
                .keys()
                .filter(|id| !reported.contains(*id))
                .cloned()
                .collect();
            for id in &gone {
                inner.nodes.remove(id);
                inner.authoritative.remove(id);
            }
            inner.last_sync = Some(Utc::now());
            gone
        };

        for id in removed {
            info!(agent_id = %id, "node decommissioned by backend");
            self.bus.publish(RegistryEvent::NodeRemoved {
                agent_id: id,
                at: Utc::now(),
            });
        }
    }

    /// Record operator intent before the backend has confirmed it: set
    /// the transitional status and the pending command marker in one
    /// synchronous step, so views reflect the command immediately.
    pub fn apply_optimistic(
        &self,
        id: &AgentId,
        kind: CommandKind,
        command_id: Uuid,
        timeout: std::time::Duration,
    ) -> Result<PendingCommand, ControlError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| ControlError::NodeNotFound(id.clone()))?;

        if let Some(pending) = &node.pending_command {
            if !pending.is_expired(now) {
                return Err(ControlError::CommandPending {
                    agent_id: id.clone(),
                    kind,
                    pending: pending.kind,
                });
            }
        }

        if !kind.allowed_from(node.status) {
            return Err(ControlError::TransitionRejected {
                agent_id: id.clone(),
                kind,
                status: node.status,
            });
        }

        let pending = PendingCommand {
            kind,
            command_id,
            issued_from: node.status,
            departure_seen: false,
            issued_at: now,
            timeout_at: now + chrono::Duration::from_std(timeout).unwrap_or_default(),
        };
        node.pending_command = Some(pending.clone());
        if let Some(transitional) = kind.transitional_status() {
            node.status = transitional;
        }
        let event = RegistryEvent::NodeUpserted {
            agent_id: id.clone(),
            status: node.status,
            config_version: node.config_version,
            at: now,
        };
        drop(inner);

        self.bus.publish(event);
        Ok(pending)
    }

    /// Restore the last authoritative snapshot for a node whose pending
    /// command timed out or was rejected by the backend. A no-op when
    /// the command was already resolved (late confirmation beats a
    /// racing watchdog).
    pub fn rollback(&self, id: &AgentId, command_id: Uuid, reason: &str) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.write();

        let Some(node) = inner.nodes.get(id) else {
            return false;
        };
        let Some(pending) = node.pending_command.clone() else {
            return false;
        };
        if pending.command_id != command_id {
            return false;
        }

        let restored = match inner.authoritative.get(id) {
            Some(snapshot) => {
                let mut restored = snapshot.clone();
                restored.pending_command = None;
                restored.last_error = Some(NodeError::new(reason, now));
                restored
            }
            None => {
                let mut restored = node.clone();
                restored.pending_command = None;
                restored.last_error = Some(NodeError::new(reason, now));
                restored
            }
        };

        warn!(
            agent_id = %id,
            kind = %pending.kind,
            status = %restored.status,
            "rolling back unconfirmed command"
        );
        counter!("fleet_command_rollbacks_total").increment(1);

        let event = RegistryEvent::NodeUpserted {
            agent_id: id.clone(),
            status: restored.status,
            config_version: restored.config_version,
            at: now,
        };
        inner.nodes.insert(id.clone(), restored);
        drop(inner);

        self.bus.publish(event);
        true
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentNode> {
        self.inner.read().nodes.get(id).cloned()
    }

    /// A node and all its descendants, top-down. Used for cascading
    /// operations. Empty when the root is unknown.
    pub fn get_subtree(&self, id: &AgentId) -> Vec<AgentNode> {
        let inner = self.inner.read();
        let Some(root) = inner.nodes.get(id) else {
            return Vec::new();
        };

        let mut children: HashMap<&AgentId, Vec<&AgentNode>> = HashMap::new();
        for node in inner.nodes.values() {
            if let Some(parent) = &node.parent_id {
                children.entry(parent).or_default().push(node);
            }
        }

        let mut out = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(node) = queue.pop_front() {
            out.push(node.clone());
            if let Some(kids) = children.get(&node.id) {
                let mut kids = kids.clone();
                kids.sort_by(|a, b| a.id.cmp(&b.id));
                queue.extend(kids);
            }
        }
        out
    }

    /// Clone of every node, parents first. Views render from this.
    pub fn snapshot(&self) -> Vec<AgentNode> {
        let inner = self.inner.read();
        let mut nodes: Vec<AgentNode> = inner.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| {
            let rank = |t: Tier| match t {
                Tier::Master => 0u8,
                Tier::Domain => 1,
                Tier::Specialist => 2,
            };
            rank(a.tier).cmp(&rank(b.tier)).then(a.id.cmp(&b.id))
        });
        nodes
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }

    /// Flip the transport-health flag; data is kept and marked stale in
    /// the views rather than cleared.
    pub fn mark_sync_degraded(&self, reason: &str) {
        let changed = {
            let mut inner = self.inner.write();
            let changed = inner.sync_healthy;
            inner.sync_healthy = false;
            changed
        };
        if changed {
            warn!(reason, "sync channel degraded; serving possibly stale data");
            self.bus.publish(RegistryEvent::SyncDegraded {
                reason: reason.to_string(),
                at: Utc::now(),
            });
        }
    }

    pub fn mark_sync_healthy(&self) {
        let changed = {
            let mut inner = self.inner.write();
            let changed = !inner.sync_healthy;
            inner.sync_healthy = true;
            inner.last_sync = Some(Utc::now());
            changed
        };
        if changed {
            info!("sync channel recovered");
            self.bus.publish(RegistryEvent::SyncRecovered { at: Utc::now() });
        }
    }

    pub fn sync_health(&self) -> (bool, Option<DateTime<Utc>>) {
        let inner = self.inner.read();
        (inner.sync_healthy, inner.last_sync)
    }

    fn check_tree_invariant(
        &self,
        inner: &RegistryInner,
        incoming: &AgentNode,
    ) -> Result<(), ControlError> {
        if incoming.is_master() {
            return Ok(());
        }
        let Some(parent) = &incoming.parent_id else {
            return Err(ControlError::OrphanNode {
                agent_id: incoming.id.clone(),
                parent: AgentId::from("<unset>"),
            });
        };
        if !inner.nodes.contains_key(parent) {
            return Err(ControlError::OrphanNode {
                agent_id: incoming.id.clone(),
                parent: parent.clone(),
            });
        }
        // Re-parenting an existing node must not close a cycle.
        let mut cursor = Some(parent.clone());
        while let Some(id) = cursor {
            if id == incoming.id {
                return Err(ControlError::OrphanNode {
                    agent_id: incoming.id.clone(),
                    parent: parent.clone(),
                });
            }
            cursor = inner.nodes.get(&id).and_then(|n| n.parent_id.clone());
        }
        Ok(())
    }
}

/// Whether an authoritative report resolves the pending command.
fn command_confirmed(pending: &PendingCommand, existing: &AgentNode, incoming: &AgentNode) -> bool {
    match pending.kind.expected_status() {
        // When the expected status equals the pre-command status (a
        // restart issued from `active`), a report still showing it may
        // predate the transition; the node must have been seen leaving
        // first.
        Some(expected) => {
            incoming.status == expected
                && (expected != pending.issued_from || pending.departure_seen)
        }
        // Configure confirms on a version bump, not a status change.
        None => incoming.config_version > existing.config_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::AgentMetrics;
    use std::time::Duration;

    fn node(id: &str, tier: Tier, parent: Option<&str>, status: AgentStatus) -> AgentNode {
        AgentNode {
            id: AgentId::from(id),
            name: id.to_string(),
            tier,
            domain: match tier {
                Tier::Master => None,
                _ => Some("ecommerce".to_string()),
            },
            parent_id: parent.map(AgentId::from),
            status,
            metrics: AgentMetrics::zero(Utc::now()),
            config: HashMap::new(),
            config_version: 1,
            last_error: None,
            pending_command: None,
        }
    }

    fn seeded_registry() -> AgentRegistry {
        let registry = AgentRegistry::new(EventBus::new(64));
        let now = Utc::now();
        registry
            .upsert(node("master", Tier::Master, None, AgentStatus::Active), now)
            .unwrap();
        registry
            .upsert(
                node("domain-ecommerce", Tier::Domain, Some("master"), AgentStatus::Active),
                now,
            )
            .unwrap();
        registry
            .upsert(
                node("spec-17", Tier::Specialist, Some("domain-ecommerce"), AgentStatus::Active),
                now,
            )
            .unwrap();
        registry
    }

    #[test]
    fn upsert_rejects_lower_config_version() {
        let registry = seeded_registry();
        let mut update = node("spec-17", Tier::Specialist, Some("domain-ecommerce"), AgentStatus::Active);
        update.config_version = 5;
        update.metrics.last_updated = Utc::now() + chrono::Duration::seconds(1);
        registry.upsert(update.clone(), Utc::now()).unwrap();

        let mut stale = update.clone();
        stale.config_version = 3;
        stale.status = AgentStatus::Error;
        let err = registry.upsert(stale, Utc::now()).unwrap_err();
        assert!(matches!(err, ControlError::VersionConflict { held: 5, incoming: 3, .. }));

        let stored = registry.get(&AgentId::from("spec-17")).unwrap();
        assert_eq!(stored.config_version, 5);
        assert_eq!(stored.status, AgentStatus::Active);
    }

    #[test]
    fn upsert_equal_version_without_newer_metrics_is_noop() {
        let registry = seeded_registry();
        let stored = registry.get(&AgentId::from("spec-17")).unwrap();

        let mut replay = stored.clone();
        replay.status = AgentStatus::Error;
        replay.metrics.last_updated = stored.metrics.last_updated;
        let outcome = registry.upsert(replay, Utc::now()).unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert_eq!(
            registry.get(&AgentId::from("spec-17")).unwrap().status,
            AgentStatus::Active
        );
    }

    #[test]
    fn upsert_rejects_orphans() {
        let registry = AgentRegistry::new(EventBus::new(16));
        let orphan = node("spec-9", Tier::Specialist, Some("domain-missing"), AgentStatus::Active);
        let err = registry.upsert(orphan, Utc::now()).unwrap_err();
        assert!(matches!(err, ControlError::OrphanNode { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn optimistic_start_sets_transitional_status_immediately() {
        let registry = seeded_registry();
        let id = AgentId::from("spec-17");

        // Put the node somewhere start is legal first.
        let mut stopped = registry.get(&id).unwrap();
        stopped.status = AgentStatus::Inactive;
        stopped.config_version += 1;
        registry.upsert(stopped, Utc::now()).unwrap();

        let command_id = Uuid::new_v4();
        registry
            .apply_optimistic(&id, CommandKind::Start, command_id, Duration::from_secs(15))
            .unwrap();

        let stored = registry.get(&id).unwrap();
        assert_eq!(stored.status, AgentStatus::Starting);
        let pending = stored.pending_command.unwrap();
        assert_eq!(pending.kind, CommandKind::Start);
        assert_eq!(pending.command_id, command_id);
    }

    #[test]
    fn start_on_active_node_is_rejected() {
        let registry = seeded_registry();
        let err = registry
            .apply_optimistic(
                &AgentId::from("spec-17"),
                CommandKind::Start,
                Uuid::new_v4(),
                Duration::from_secs(15),
            )
            .unwrap_err();
        assert!(matches!(err, ControlError::TransitionRejected { .. }));
        // No-op: status untouched, nothing pending.
        let stored = registry.get(&AgentId::from("spec-17")).unwrap();
        assert_eq!(stored.status, AgentStatus::Active);
        assert!(stored.pending_command.is_none());
    }

    #[test]
    fn contradictory_command_rejected_while_pending() {
        let registry = seeded_registry();
        let id = AgentId::from("spec-17");
        registry
            .apply_optimistic(&id, CommandKind::Restart, Uuid::new_v4(), Duration::from_secs(20))
            .unwrap();

        let err = registry
            .apply_optimistic(&id, CommandKind::Stop, Uuid::new_v4(), Duration::from_secs(15))
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::CommandPending { pending: CommandKind::Restart, .. }
        ));
    }

    #[test]
    fn stale_poll_discarded_during_pending_window() {
        let registry = seeded_registry();
        let id = AgentId::from("spec-17");
        let before_command = Utc::now() - chrono::Duration::seconds(5);

        registry
            .apply_optimistic(&id, CommandKind::Restart, Uuid::new_v4(), Duration::from_secs(20))
            .unwrap();

        // A poll initiated before the command raced it and arrives late.
        let mut stale = node("spec-17", Tier::Specialist, Some("domain-ecommerce"), AgentStatus::Active);
        stale.metrics.last_updated = Utc::now() + chrono::Duration::seconds(1);
        let outcome = registry.upsert(stale, before_command).unwrap();
        assert_eq!(outcome, UpsertOutcome::DiscardedStale);
        assert_eq!(registry.get(&id).unwrap().status, AgentStatus::Starting);
    }

    #[test]
    fn confirmation_clears_pending_and_last_error() {
        let registry = seeded_registry();
        let id = AgentId::from("spec-17");
        registry
            .apply_optimistic(&id, CommandKind::Restart, Uuid::new_v4(), Duration::from_secs(20))
            .unwrap();

        // Backend reports the agent going down, then back up.
        let mut mid = node("spec-17", Tier::Specialist, Some("domain-ecommerce"), AgentStatus::Starting);
        mid.metrics.last_updated = Utc::now() + chrono::Duration::seconds(1);
        registry.upsert(mid, Utc::now()).unwrap();

        let mut confirmed = node("spec-17", Tier::Specialist, Some("domain-ecommerce"), AgentStatus::Active);
        confirmed.metrics.success_rate = 92.0;
        confirmed.metrics.last_updated = Utc::now() + chrono::Duration::seconds(3);
        let outcome = registry.upsert(confirmed, Utc::now()).unwrap();
        assert_eq!(outcome, UpsertOutcome::Confirmed);

        let stored = registry.get(&id).unwrap();
        assert_eq!(stored.status, AgentStatus::Active);
        assert!(stored.pending_command.is_none());
        assert!(stored.last_error.is_none());
    }

    #[test]
    fn restart_from_active_confirms_only_after_observed_departure() {
        let registry = seeded_registry();
        let id = AgentId::from("spec-17");
        registry
            .apply_optimistic(&id, CommandKind::Restart, Uuid::new_v4(), Duration::from_secs(20))
            .unwrap();

        // Fresher poll still showing the pre-restart `active` state must
        // not be read as the restart having completed.
        let mut pre_transition = node("spec-17", Tier::Specialist, Some("domain-ecommerce"), AgentStatus::Active);
        pre_transition.metrics.last_updated = Utc::now() + chrono::Duration::seconds(1);
        let outcome = registry.upsert(pre_transition, Utc::now()).unwrap();
        assert_eq!(outcome, UpsertOutcome::PreservedOptimistic);
        assert!(registry.get(&id).unwrap().pending_command.is_some());

        // The node is seen leaving `active`...
        let mut down = node("spec-17", Tier::Specialist, Some("domain-ecommerce"), AgentStatus::Inactive);
        down.metrics.last_updated = Utc::now() + chrono::Duration::seconds(2);
        let outcome = registry.upsert(down, Utc::now()).unwrap();
        assert_eq!(outcome, UpsertOutcome::PreservedOptimistic);

        // ...and only now does `active` confirm.
        let mut back_up = node("spec-17", Tier::Specialist, Some("domain-ecommerce"), AgentStatus::Active);
        back_up.metrics.last_updated = Utc::now() + chrono::Duration::seconds(3);
        let outcome = registry.upsert(back_up, Utc::now()).unwrap();
        assert_eq!(outcome, UpsertOutcome::Confirmed);
        assert!(registry.get(&id).unwrap().pending_command.is_none());
    }

    #[test]
    fn fresh_but_unconfirming_poll_preserves_optimistic_status() {
        let registry = seeded_registry();
        let id = AgentId::from("spec-17");
        registry
            .apply_optimistic(&id, CommandKind::Restart, Uuid::new_v4(), Duration::from_secs(20))
            .unwrap();

        // Backend still reports the pre-command status.
        let mut unchanged = node("spec-17", Tier::Specialist, Some("domain-ecommerce"), AgentStatus::Active);
        unchanged.metrics.cpu_percent = 55.0;
        unchanged.metrics.last_updated = Utc::now() + chrono::Duration::seconds(1);
        let outcome = registry.upsert(unchanged, Utc::now()).unwrap();
        assert_eq!(outcome, UpsertOutcome::PreservedOptimistic);

        let stored = registry.get(&id).unwrap();
        assert_eq!(stored.status, AgentStatus::Starting);
        assert!(stored.pending_command.is_some());
        // Non-status authoritative fields still land.
        assert_eq!(stored.metrics.cpu_percent, 55.0);
    }

    #[test]
    fn rollback_restores_authoritative_snapshot() {
        let registry = seeded_registry();
        let id = AgentId::from("spec-17");
        let command_id = Uuid::new_v4();
        registry
            .apply_optimistic(&id, CommandKind::Restart, command_id, Duration::from_secs(20))
            .unwrap();
        assert_eq!(registry.get(&id).unwrap().status, AgentStatus::Starting);

        assert!(registry.rollback(&id, command_id, "restart timed out after 20s"));

        let stored = registry.get(&id).unwrap();
        assert_eq!(stored.status, AgentStatus::Active);
        assert!(stored.pending_command.is_none());
        let err = stored.last_error.unwrap();
        assert!(err.message.contains("timed out"));
    }

    #[test]
    fn rollback_with_wrong_command_id_is_noop() {
        let registry = seeded_registry();
        let id = AgentId::from("spec-17");
        registry
            .apply_optimistic(&id, CommandKind::Restart, Uuid::new_v4(), Duration::from_secs(20))
            .unwrap();

        assert!(!registry.rollback(&id, Uuid::new_v4(), "other command"));
        assert_eq!(registry.get(&id).unwrap().status, AgentStatus::Starting);
    }

    #[test]
    fn subtree_returns_descendants_top_down() {
        let registry = seeded_registry();
        let now = Utc::now();
        registry
            .upsert(
                node("spec-18", Tier::Specialist, Some("domain-ecommerce"), AgentStatus::Active),
                now,
            )
            .unwrap();

        let subtree = registry.get_subtree(&AgentId::from("domain-ecommerce"));
        let ids: Vec<&str> = subtree.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["domain-ecommerce", "spec-17", "spec-18"]);

        let whole = registry.get_subtree(&AgentId::from("master"));
        assert_eq!(whole.len(), 4);
        assert_eq!(whole[0].id.as_str(), "master");
    }

    #[test]
    fn snapshot_apply_removes_decommissioned_nodes() {
        let registry = seeded_registry();
        let snapshot = vec![
            node("master", Tier::Master, None, AgentStatus::Active),
            node("domain-ecommerce", Tier::Domain, Some("master"), AgentStatus::Active),
        ];
        registry.apply_snapshot(snapshot, Utc::now());
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&AgentId::from("spec-17")).is_none());
    }

    #[test]
    fn snapshot_apply_orders_parents_first() {
        let registry = AgentRegistry::new(EventBus::new(16));
        // Deliberately shuffled: children listed before parents.
        let snapshot = vec![
            node("spec-17", Tier::Specialist, Some("domain-ecommerce"), AgentStatus::Active),
            node("domain-ecommerce", Tier::Domain, Some("master"), AgentStatus::Active),
            node("master", Tier::Master, None, AgentStatus::Active),
        ];
        registry.apply_snapshot(snapshot, Utc::now());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn sync_health_transitions_publish_once() {
        let registry = seeded_registry();
        let mut rx = registry.bus().subscribe();

        registry.mark_sync_degraded("poll failed");
        registry.mark_sync_degraded("poll failed again");
        registry.mark_sync_healthy();

        let mut degraded = 0;
        let mut recovered = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                RegistryEvent::SyncDegraded { .. } => degraded += 1,
                RegistryEvent::SyncRecovered { .. } => recovered += 1,
                _ => {}
            }
        }
        assert_eq!(degraded, 1);
        assert_eq!(recovered, 1);
    }
}
