// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::command::CommandKind;

/// Backend-assigned stable identifier for an agent node (e.g. `spec-17`).
///
/// The backend owns the identifier namespace; the control plane never
/// mints ids of its own, it only echoes what the hierarchy snapshot
/// reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Position of a node in the supervision tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Master,
    Domain,
    Specialist,
}

/// Lifecycle state of an agent node.
///
/// The legal cycle is `inactive → starting → active → stopping → inactive`.
/// `error` is reachable from any non-terminal state on a reported failure;
/// from `error` a restart moves to `starting` and a stop to `stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Inactive,
    Starting,
    Active,
    Stopping,
    Error,
}

impl AgentStatus {
    /// A node in a transitional state has a lifecycle operation in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(self, AgentStatus::Starting | AgentStatus::Stopping)
    }

    /// Whether a server-reported move from `self` to `to` is legal.
    ///
    /// Server events are authoritative, so this table is deliberately
    /// permissive about failure: `error` is reachable from anything but
    /// `inactive`, and the backend may report a node straight back to
    /// `inactive` after a crash-stop.
    pub fn can_transition_to(&self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        if *self == to {
            return true;
        }
        match (*self, to) {
            (Inactive, Starting) => true,
            (Starting, Active) | (Starting, Error) | (Starting, Inactive) => true,
            (Active, Stopping) | (Active, Error) => true,
            (Stopping, Inactive) | (Stopping, Error) => true,
            (Error, Starting) | (Error, Stopping) | (Error, Inactive) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Inactive => "inactive",
            AgentStatus::Starting => "starting",
            AgentStatus::Active => "active",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time performance readings for a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    /// 0-100.
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub cpu_percent: f64,
    #[serde(rename = "memoryMB")]
    pub memory_mb: f64,
    pub tasks_completed: u64,
    pub last_updated: DateTime<Utc>,
}

impl AgentMetrics {
    pub fn zero(now: DateTime<Utc>) -> Self {
        Self {
            success_rate: 0.0,
            avg_response_time_ms: 0.0,
            cpu_percent: 0.0,
            memory_mb: 0.0,
            tasks_completed: 0,
            last_updated: now,
        }
    }
}

/// Last failure reported for a node. Cleared on the next confirmed
/// successful transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeError {
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl NodeError {
    pub fn new(message: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            message: message.into(),
            occurred_at,
        }
    }
}

/// An optimistic operation awaiting backend confirmation.
///
/// Carries enough information for reconciliation to decide between
/// confirm, rollback and ignore-stale-response; a bare "loading" flag
/// would not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCommand {
    pub kind: CommandKind,
    pub command_id: Uuid,
    /// Status the node held when the command was issued. A restart from
    /// `active` expects `active` back, so confirmation additionally
    /// requires the node to have been seen leaving this status.
    pub issued_from: AgentStatus,
    /// Whether an authoritative report has shown the node in a status
    /// other than `issued_from` since issuance.
    #[serde(default)]
    pub departure_seen: bool,
    pub issued_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
}

impl PendingCommand {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.timeout_at
    }
}

/// One row of the supervision hierarchy: Master Supervisor, Domain
/// Supervisor or Specialist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentNode {
    pub id: AgentId,
    pub name: String,
    pub tier: Tier,
    /// Business domain (`ecommerce`, `analytics`, ...). None for the master.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<AgentId>,
    pub status: AgentStatus,
    pub metrics: AgentMetrics,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    /// Monotonic per node; lower-versioned writes are rejected as stale.
    pub config_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<NodeError>,
    /// Client-side only; never present in backend payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_command: Option<PendingCommand>,
}

impl AgentNode {
    /// Metrics older than twice the poll interval mean the node has
    /// missed at least one full sync cycle.
    pub fn is_stale(&self, poll_interval: Duration, now: DateTime<Utc>) -> bool {
        now - self.metrics.last_updated > poll_interval * 2
    }

    pub fn is_master(&self) -> bool {
        self.tier == Tier::Master
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_cycle_is_legal() {
        use AgentStatus::*;
        assert!(Inactive.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Active));
        assert!(Active.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Inactive));
    }

    #[test]
    fn error_reachable_from_non_terminal_states() {
        use AgentStatus::*;
        assert!(Starting.can_transition_to(Error));
        assert!(Active.can_transition_to(Error));
        assert!(Stopping.can_transition_to(Error));
        assert!(!Inactive.can_transition_to(Error));
    }

    #[test]
    fn error_recovers_through_restart_or_stop() {
        use AgentStatus::*;
        assert!(Error.can_transition_to(Starting));
        assert!(Error.can_transition_to(Stopping));
        assert!(!Error.can_transition_to(Active));
    }

    #[test]
    fn skipping_states_is_illegal() {
        use AgentStatus::*;
        assert!(!Inactive.can_transition_to(Active));
        assert!(!Active.can_transition_to(Inactive));
        assert!(!Active.can_transition_to(Starting));
    }

    #[test]
    fn node_round_trips_backend_json() {
        let json = serde_json::json!({
            "id": "spec-17",
            "name": "Checkout Agent",
            "tier": "specialist",
            "domain": "ecommerce",
            "parentId": "domain-ecommerce",
            "status": "active",
            "metrics": {
                "successRate": 92.0,
                "avgResponseTimeMs": 120.5,
                "cpuPercent": 34.0,
                "memoryMB": 512.0,
                "tasksCompleted": 4210,
                "lastUpdated": "2026-08-30T10:00:00Z"
            },
            "config": {"model": "large"},
            "configVersion": 7
        });
        let node: AgentNode = serde_json::from_value(json).unwrap();
        assert_eq!(node.id, AgentId::from("spec-17"));
        assert_eq!(node.tier, Tier::Specialist);
        assert_eq!(node.status, AgentStatus::Active);
        assert_eq!(node.config_version, 7);
        assert_eq!(node.metrics.success_rate, 92.0);
        assert!(node.pending_command.is_none());
    }

    #[test]
    fn staleness_uses_twice_poll_interval() {
        let now = Utc::now();
        let mut node: AgentNode = serde_json::from_value(serde_json::json!({
            "id": "m-1", "name": "master", "tier": "master", "status": "active",
            "metrics": {
                "successRate": 100.0, "avgResponseTimeMs": 1.0, "cpuPercent": 1.0,
                "memoryMB": 1.0, "tasksCompleted": 0,
                "lastUpdated": now.to_rfc3339()
            },
            "configVersion": 1
        }))
        .unwrap();
        let interval = Duration::seconds(30);
        assert!(!node.is_stale(interval, now + Duration::seconds(59)));
        node.metrics.last_updated = now - Duration::seconds(61);
        assert!(node.is_stale(interval, now));
    }
}
