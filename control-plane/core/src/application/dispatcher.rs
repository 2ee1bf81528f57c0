// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0
//! # Command Dispatcher
//!
//! Issues lifecycle commands against one node or a whole subtree.
//! Issuance is non-blocking: the optimistic transition is applied
//! synchronously so the view reflects operator intent at once, then the
//! backend round trip and the timeout watchdog run as spawned tasks.
//! Confirmation arrives through the sync engine clearing the pending
//! marker; the watchdog only acts when it finds the marker still set.

use chrono::Utc;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::registry::AgentRegistry;
use crate::domain::command::{CascadeReport, CommandKind, CommandOutcome};
use crate::domain::error::ControlError;
use crate::domain::events::RegistryEvent;
use crate::domain::node::{AgentId, PendingCommand};
use crate::infrastructure::client::{ClientError, ControlPlaneClient};

pub struct CommandDispatcher {
    registry: Arc<AgentRegistry>,
    client: Arc<dyn ControlPlaneClient>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<AgentRegistry>, client: Arc<dyn ControlPlaneClient>) -> Self {
        Self { registry, client }
    }

    /// Issue a lifecycle command against `id`, or against its whole
    /// subtree when `cascade` is set.
    ///
    /// Returns synchronously once every optimistic transition is
    /// applied; per-node backend calls continue in the background.
    /// Ineligible nodes are reported as rejected in the outcome list
    /// without aborting their siblings.
    pub fn issue(
        &self,
        id: &AgentId,
        kind: CommandKind,
        cascade: bool,
    ) -> Result<CascadeReport, ControlError> {
        if kind == CommandKind::Configure {
            // Config writes carry a payload and go through `configure`.
            return Err(ControlError::TransitionRejected {
                agent_id: id.clone(),
                kind,
                status: self
                    .registry
                    .get(id)
                    .ok_or_else(|| ControlError::NodeNotFound(id.clone()))?
                    .status,
            });
        }

        let targets = if cascade {
            self.registry.get_subtree(id)
        } else {
            self.registry.get(id).into_iter().collect()
        };
        if targets.is_empty() {
            return Err(ControlError::NodeNotFound(id.clone()));
        }

        let mut outcomes = Vec::with_capacity(targets.len());
        // Top-down: get_subtree already yields parents before children.
        for node in &targets {
            let command_id = Uuid::new_v4();
            match self.registry.apply_optimistic(
                &node.id,
                kind,
                command_id,
                kind.default_timeout(),
            ) {
                Ok(pending) => {
                    info!(agent_id = %node.id, kind = %kind, cascade, "command issued");
                    counter!("fleet_commands_issued_total", "kind" => kind.as_str()).increment(1);
                    self.registry.bus().publish(RegistryEvent::CommandIssued {
                        agent_id: node.id.clone(),
                        command_id,
                        kind,
                        cascade,
                        at: Utc::now(),
                    });
                    self.launch(node.id.clone(), kind, pending);
                    outcomes.push(CommandOutcome::accepted(node.id.clone(), kind, command_id));
                }
                Err(e) => {
                    // Rejected client-side: surfaced, no network call.
                    warn!(agent_id = %node.id, kind = %kind, error = %e, "command rejected");
                    counter!("fleet_commands_rejected_total", "kind" => kind.as_str()).increment(1);
                    self.registry.bus().publish(RegistryEvent::CommandRejected {
                        agent_id: node.id.clone(),
                        kind,
                        reason: e.to_string(),
                        at: Utc::now(),
                    });
                    outcomes.push(CommandOutcome::rejected(node.id.clone(), kind, &e));
                }
            }
        }

        Ok(CascadeReport {
            root: id.clone(),
            kind,
            outcomes,
        })
    }

    /// Write a node's config with optimistic concurrency. Awaits the
    /// backend response: a version mismatch must surface to the caller
    /// as "state changed elsewhere" rather than ride a watchdog.
    pub async fn configure(
        &self,
        id: &AgentId,
        config: HashMap<String, serde_json::Value>,
        expected_version: u64,
    ) -> Result<Uuid, ControlError> {
        let node = self
            .registry
            .get(id)
            .ok_or_else(|| ControlError::NodeNotFound(id.clone()))?;
        if node.config_version != expected_version {
            return Err(ControlError::VersionConflict {
                agent_id: id.clone(),
                held: node.config_version,
                incoming: expected_version,
            });
        }

        let command_id = Uuid::new_v4();
        let pending = self.registry.apply_optimistic(
            id,
            CommandKind::Configure,
            command_id,
            CommandKind::Configure.default_timeout(),
        )?;

        match self.client.patch_config(id, &config, expected_version).await {
            Ok(()) => {
                // Confirmation (the version bump) arrives via sync; the
                // watchdog covers a backend that accepted then stalled.
                self.spawn_watchdog(id.clone(), CommandKind::Configure, pending);
                Ok(command_id)
            }
            Err(ClientError::VersionConflict(msg)) => {
                self.registry
                    .rollback(id, command_id, "state changed elsewhere, refresh");
                warn!(agent_id = %id, %msg, "config write lost the version race");
                Err(ControlError::VersionConflict {
                    agent_id: id.clone(),
                    held: node.config_version,
                    incoming: expected_version,
                })
            }
            Err(e) => {
                self.registry
                    .rollback(id, command_id, &format!("config write failed: {e}"));
                Err(ControlError::Transport(e.to_string()))
            }
        }
    }

    /// Fire the backend call and arm the watchdog for one node.
    fn launch(&self, agent_id: AgentId, kind: CommandKind, pending: PendingCommand) {
        let client = self.client.clone();
        let registry = self.registry.clone();
        let command_id = pending.command_id;
        tokio::spawn(async move {
            match client.send_command(&agent_id, kind).await {
                Ok(()) => {
                    watchdog(registry, agent_id, kind, pending).await;
                }
                Err(ClientError::Rejected(reason)) => {
                    // Server-side 409: our optimistic view was wrong.
                    if registry.rollback(
                        &agent_id,
                        command_id,
                        &format!("{kind} rejected by backend: {reason}"),
                    ) {
                        registry.bus().publish(RegistryEvent::CommandFailed {
                            agent_id,
                            command_id,
                            kind,
                            reason,
                            at: Utc::now(),
                        });
                    }
                }
                Err(e) => {
                    if registry.rollback(&agent_id, command_id, &format!("{kind} failed: {e}")) {
                        registry.bus().publish(RegistryEvent::CommandFailed {
                            agent_id,
                            command_id,
                            kind,
                            reason: e.to_string(),
                            at: Utc::now(),
                        });
                    }
                }
            }
        });
    }

    fn spawn_watchdog(&self, agent_id: AgentId, kind: CommandKind, pending: PendingCommand) {
        let registry = self.registry.clone();
        tokio::spawn(watchdog(registry, agent_id, kind, pending));
    }
}

/// Roll back a command that receives no confirmation within its
/// deadline. A timeout is never silently treated as success.
async fn watchdog(
    registry: Arc<AgentRegistry>,
    agent_id: AgentId,
    kind: CommandKind,
    pending: PendingCommand,
) {
    tokio::time::sleep(kind.default_timeout()).await;
    let reason = format!(
        "{kind} timed out after {}s without confirmation",
        kind.default_timeout().as_secs()
    );
    if registry.rollback(&agent_id, pending.command_id, &reason) {
        counter!("fleet_command_timeouts_total", "kind" => kind.as_str()).increment(1);
        registry.bus().publish(RegistryEvent::CommandTimedOut {
            agent_id,
            command_id: pending.command_id,
            kind,
            at: Utc::now(),
        });
    }
    // Pending marker already gone: the command resolved first.
}
