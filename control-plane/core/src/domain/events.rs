// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::command::CommandKind;
use crate::domain::node::{AgentId, AgentStatus};

/// Registry mutation events published on the event bus.
///
/// Views and the metrics aggregator subscribe to these; nothing in the
/// payload is authoritative beyond what the registry already holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    NodeUpserted {
        agent_id: AgentId,
        status: AgentStatus,
        config_version: u64,
        at: DateTime<Utc>,
    },
    NodeRemoved {
        agent_id: AgentId,
        at: DateTime<Utc>,
    },
    CommandIssued {
        agent_id: AgentId,
        command_id: Uuid,
        kind: CommandKind,
        cascade: bool,
        at: DateTime<Utc>,
    },
    CommandConfirmed {
        agent_id: AgentId,
        command_id: Uuid,
        kind: CommandKind,
        at: DateTime<Utc>,
    },
    CommandRejected {
        agent_id: AgentId,
        kind: CommandKind,
        reason: String,
        at: DateTime<Utc>,
    },
    CommandFailed {
        agent_id: AgentId,
        command_id: Uuid,
        kind: CommandKind,
        reason: String,
        at: DateTime<Utc>,
    },
    CommandTimedOut {
        agent_id: AgentId,
        command_id: Uuid,
        kind: CommandKind,
        at: DateTime<Utc>,
    },
    SyncDegraded {
        reason: String,
        at: DateTime<Utc>,
    },
    SyncRecovered {
        at: DateTime<Utc>,
    },
}

impl RegistryEvent {
    /// Node the event concerns, if any.
    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            RegistryEvent::NodeUpserted { agent_id, .. }
            | RegistryEvent::NodeRemoved { agent_id, .. }
            | RegistryEvent::CommandIssued { agent_id, .. }
            | RegistryEvent::CommandConfirmed { agent_id, .. }
            | RegistryEvent::CommandRejected { agent_id, .. }
            | RegistryEvent::CommandFailed { agent_id, .. }
            | RegistryEvent::CommandTimedOut { agent_id, .. } => Some(agent_id),
            RegistryEvent::SyncDegraded { .. } | RegistryEvent::SyncRecovered { .. } => None,
        }
    }
}

/// Delta emitted by the backend push channel.
///
/// Transport is best-effort, at-most-once: messages may be dropped or
/// reordered, so a delta is only ever a hint to re-fetch the affected
/// node, never an authoritative payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushDelta {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub config_version: u64,
    pub timestamp: DateTime<Utc>,
}
