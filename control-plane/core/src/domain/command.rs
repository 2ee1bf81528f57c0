// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::error::ControlError;
use crate::domain::node::{AgentId, AgentStatus};

/// Lifecycle command issuable against a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Start,
    Stop,
    Restart,
    Configure,
}

impl CommandKind {
    /// Client-side precondition: which current statuses accept this command.
    ///
    /// `configure` is gated on the absence of a pending command rather
    /// than on status, so it accepts every status here.
    pub fn allowed_from(&self, status: AgentStatus) -> bool {
        use AgentStatus::*;
        match self {
            CommandKind::Start => matches!(status, Inactive | Error),
            CommandKind::Stop => matches!(status, Starting | Active | Error),
            // Overlapping transitions are the one thing restart must avoid.
            CommandKind::Restart => !matches!(status, Starting | Stopping),
            CommandKind::Configure => true,
        }
    }

    /// Status applied optimistically the moment the command is issued.
    /// `None` means the command does not move the lifecycle machine.
    pub fn transitional_status(&self) -> Option<AgentStatus> {
        match self {
            CommandKind::Start | CommandKind::Restart => Some(AgentStatus::Starting),
            CommandKind::Stop => Some(AgentStatus::Stopping),
            CommandKind::Configure => None,
        }
    }

    /// Status the backend is expected to report once the command lands.
    pub fn expected_status(&self) -> Option<AgentStatus> {
        match self {
            CommandKind::Start | CommandKind::Restart => Some(AgentStatus::Active),
            CommandKind::Stop => Some(AgentStatus::Inactive),
            CommandKind::Configure => None,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            CommandKind::Start | CommandKind::Stop => Duration::from_secs(15),
            CommandKind::Restart => Duration::from_secs(20),
            CommandKind::Configure => Duration::from_secs(15),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Start => "start",
            CommandKind::Stop => "stop",
            CommandKind::Restart => "restart",
            CommandKind::Configure => "configure",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node result of a command issuance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub agent_id: AgentId,
    pub kind: CommandKind,
    /// Set when the optimistic transition was applied and the backend
    /// call is in flight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,
    /// Set when the command was rejected client-side; no network call
    /// was made for this node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

impl CommandOutcome {
    pub fn accepted(agent_id: AgentId, kind: CommandKind, command_id: Uuid) -> Self {
        Self {
            agent_id,
            kind,
            command_id: Some(command_id),
            rejected: None,
        }
    }

    pub fn rejected(agent_id: AgentId, kind: CommandKind, err: &ControlError) -> Self {
        Self {
            agent_id,
            kind,
            command_id: None,
            rejected: Some(err.to_string()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.command_id.is_some()
    }
}

/// Outcome of a cascading command over a subtree.
///
/// Partial failure is the normal case: some nodes accept, some reject,
/// and the cascade as a whole is never rolled back wholesale.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeReport {
    pub root: AgentId,
    pub kind: CommandKind,
    pub outcomes: Vec<CommandOutcome>,
}

impl CascadeReport {
    pub fn accepted_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_accepted()).count()
    }

    pub fn rejected_count(&self) -> usize {
        self.outcomes.len() - self.accepted_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentStatus::*;

    #[test]
    fn start_requires_inactive_or_error() {
        assert!(CommandKind::Start.allowed_from(Inactive));
        assert!(CommandKind::Start.allowed_from(Error));
        assert!(!CommandKind::Start.allowed_from(Active));
        assert!(!CommandKind::Start.allowed_from(Starting));
    }

    #[test]
    fn stop_requires_live_or_error() {
        assert!(CommandKind::Stop.allowed_from(Starting));
        assert!(CommandKind::Stop.allowed_from(Active));
        assert!(CommandKind::Stop.allowed_from(Error));
        assert!(!CommandKind::Stop.allowed_from(Inactive));
        assert!(!CommandKind::Stop.allowed_from(Stopping));
    }

    #[test]
    fn restart_rejected_mid_transition() {
        assert!(!CommandKind::Restart.allowed_from(Starting));
        assert!(!CommandKind::Restart.allowed_from(Stopping));
        assert!(CommandKind::Restart.allowed_from(Active));
        assert!(CommandKind::Restart.allowed_from(Error));
        assert!(CommandKind::Restart.allowed_from(Inactive));
    }

    #[test]
    fn restart_has_longer_timeout() {
        assert!(CommandKind::Restart.default_timeout() > CommandKind::Start.default_timeout());
    }
}
