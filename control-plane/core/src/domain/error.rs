// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::command::CommandKind;
use crate::domain::node::{AgentId, AgentStatus};

/// Control-plane error taxonomy.
///
/// Nothing here is fatal to the process: every variant degrades to a
/// stale or error indicator on the affected node(s) while the rest of
/// the hierarchy keeps functioning.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    #[error("{kind} rejected for {agent_id}: incompatible with status '{status}'")]
    TransitionRejected {
        agent_id: AgentId,
        kind: CommandKind,
        status: AgentStatus,
    },

    #[error("{kind} rejected for {agent_id}: a '{pending}' command is already pending")]
    CommandPending {
        agent_id: AgentId,
        kind: CommandKind,
        pending: CommandKind,
    },

    #[error("{kind} for {agent_id} timed out without confirmation")]
    CommandTimeout { agent_id: AgentId, kind: CommandKind },

    #[error("state changed elsewhere for {agent_id}: held version {held}, write carried {incoming}")]
    VersionConflict {
        agent_id: AgentId,
        held: u64,
        incoming: u64,
    },

    #[error("agent not found: {0}")]
    NodeNotFound(AgentId),

    #[error("orphan node {agent_id}: parent {parent} is not in the registry")]
    OrphanNode { agent_id: AgentId, parent: AgentId },

    #[error("transport failure: {0}")]
    Transport(String),
}

impl ControlError {
    /// Whether the operator may usefully retry the same action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlError::CommandTimeout { .. } | ControlError::Transport(_)
        )
    }
}
