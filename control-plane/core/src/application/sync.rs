// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0
//! # Status Sync Engine
//!
//! Two producers feed the registry: a fixed-interval poll that fetches
//! the full hierarchy snapshot, and a push channel whose deltas are
//! treated purely as "something changed here, re-fetch" hints. The poll
//! is the correctness backstop; push only lowers latency. Every merge
//! goes through `AgentRegistry::upsert`, so version checks are never
//! shortcut.

use chrono::Utc;
use metrics::counter;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::registry::AgentRegistry;
use crate::domain::error::ControlError;
use crate::domain::events::PushDelta;
use crate::infrastructure::client::{ClientError, ControlPlaneClient};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const HINT_CHANNEL_CAPACITY: usize = 256;

pub struct StatusSyncEngine {
    registry: Arc<AgentRegistry>,
    client: Arc<dyn ControlPlaneClient>,
    poll_interval: Duration,
    hint_tx: mpsc::Sender<PushDelta>,
    hint_rx: Mutex<Option<mpsc::Receiver<PushDelta>>>,
}

impl StatusSyncEngine {
    pub fn new(
        registry: Arc<AgentRegistry>,
        client: Arc<dyn ControlPlaneClient>,
        poll_interval: Duration,
    ) -> Self {
        let (hint_tx, hint_rx) = mpsc::channel(HINT_CHANNEL_CAPACITY);
        Self {
            registry,
            client,
            poll_interval,
            hint_tx,
            hint_rx: Mutex::new(Some(hint_rx)),
        }
    }

    /// Sender the push listener feeds re-fetch hints into.
    pub fn hint_sender(&self) -> mpsc::Sender<PushDelta> {
        self.hint_tx.clone()
    }

    /// One full poll cycle: fetch the hierarchy snapshot and merge it.
    ///
    /// `observed_at` passed to the registry is the fetch start time, so
    /// responses that raced a command issued mid-flight are discarded
    /// per node rather than clobbering optimistic state.
    pub async fn poll_once(&self) -> Result<(), ControlError> {
        let started_at = Utc::now();
        match self.client.fetch_hierarchy().await {
            Ok(nodes) => {
                debug!(nodes = nodes.len(), "hierarchy snapshot received");
                counter!("fleet_poll_cycles_total").increment(1);
                self.registry.apply_snapshot(nodes, started_at);
                self.registry.mark_sync_healthy();
                Ok(())
            }
            Err(e) => {
                // Existing data is kept and flagged stale, not cleared.
                self.registry.mark_sync_degraded(&e.to_string());
                Err(ControlError::Transport(e.to_string()))
            }
        }
    }

    /// React to a push hint: targeted re-fetch of the affected node.
    /// The delta payload itself is never applied; the transport may
    /// drop or reorder messages, so only a fresh `GET` is trusted.
    pub async fn handle_hint(&self, delta: PushDelta) {
        let started_at = Utc::now();
        match self.client.fetch_node(&delta.agent_id).await {
            Ok(node) => match self.registry.upsert(node, started_at) {
                Ok(outcome) => {
                    debug!(agent_id = %delta.agent_id, ?outcome, "push-triggered re-fetch merged")
                }
                Err(ControlError::VersionConflict { held, incoming, .. }) => {
                    debug!(
                        agent_id = %delta.agent_id,
                        held, incoming,
                        "push-triggered re-fetch was stale"
                    );
                }
                Err(e) => warn!(agent_id = %delta.agent_id, error = %e, "re-fetch merge rejected"),
            },
            Err(ClientError::NotFound(_)) => {
                // Decommission is confirmed by the next full snapshot;
                // a single 404 is not enough to drop local state.
                warn!(agent_id = %delta.agent_id, "push hint for unknown node; awaiting poll");
            }
            Err(e) => {
                warn!(agent_id = %delta.agent_id, error = %e, "targeted re-fetch failed");
            }
        }
    }

    /// Drive polling and hint handling until cancelled. On poll failure
    /// the next attempt uses exponential backoff instead of waiting out
    /// the full interval.
    ///
    /// The poll deadline is fixed when it is armed; hint handling never
    /// moves it. A steady stream of push hints therefore cannot starve
    /// the full-snapshot poll, which is the only path that removes
    /// decommissioned nodes.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        // A second `run` finds the receiver gone and just polls.
        let Some(mut hints) = self.hint_rx.lock().take() else {
            self.poll_loop_only(cancel).await;
            return;
        };

        info!(interval_secs = self.poll_interval.as_secs(), "status sync engine started");
        let mut backoff: Option<Duration> = None;
        let mut next_poll = tokio::time::Instant::now() + self.poll_interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(next_poll) => {
                    backoff = match self.poll_once().await {
                        Ok(()) => None,
                        Err(_) => Some(next_backoff(backoff)),
                    };
                    next_poll = tokio::time::Instant::now()
                        + backoff.unwrap_or(self.poll_interval);
                }
                hint = hints.recv() => {
                    match hint {
                        Some(delta) => self.handle_hint(delta).await,
                        // All senders dropped; polling continues alone.
                        None => {
                            self.poll_loop_only(cancel).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn poll_loop_only(&self, cancel: CancellationToken) {
        let mut backoff: Option<Duration> = None;
        loop {
            let wait = backoff.unwrap_or(self.poll_interval);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {
                    backoff = match self.poll_once().await {
                        Ok(()) => None,
                        Err(_) => Some(next_backoff(backoff)),
                    };
                }
            }
        }
    }
}

fn next_backoff(current: Option<Duration>) -> Duration {
    match current {
        None => INITIAL_BACKOFF,
        Some(d) => (d * 2).min(MAX_BACKOFF),
    }
}
