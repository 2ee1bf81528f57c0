// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0
//! Push channel listener.
//!
//! Consumes the backend's event stream of node deltas and forwards them
//! to the sync engine as re-fetch hints. Delivery is best-effort,
//! at-most-once: a dropped or reordered message costs latency, never
//! correctness, because the periodic poll remains the backstop.

use bytes::BytesMut;
use futures::StreamExt;
use metrics::counter;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::events::PushDelta;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct PushListener {
    http: reqwest::Client,
    url: String,
    hints: mpsc::Sender<PushDelta>,
}

impl PushListener {
    /// `base_url` is the backend root; the stream lives at
    /// `{base}/agents/events`.
    pub fn new(base_url: &str, hints: mpsc::Sender<PushDelta>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{}/agents/events", base_url.trim_end_matches('/')),
            hints,
        }
    }

    /// Connect, forward deltas, reconnect with backoff on any failure.
    /// Runs until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.consume_stream(&cancel).await {
                Ok(()) => return, // cancelled mid-stream
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "push channel dropped; reconnecting");
                    counter!("fleet_push_reconnects_total").increment(1);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn consume_stream(&self, cancel: &CancellationToken) -> Result<(), String> {
        let response = self
            .http
            .get(&self.url)
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("stream endpoint returned {}", response.status()));
        }
        info!(url = %self.url, "push channel connected");

        let mut body = response.bytes_stream();
        let mut buffer = BytesMut::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return Err("stream closed by server".to_string());
            };
            let chunk = chunk.map_err(|e| e.to_string())?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(pos + 1);
                let line = String::from_utf8_lossy(&line[..pos]);
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                match serde_json::from_str::<PushDelta>(data.trim()) {
                    Ok(delta) => {
                        debug!(agent_id = %delta.agent_id, status = %delta.status, "push delta received");
                        counter!("fleet_push_hints_total").increment(1);
                        if self.hints.send(delta).await.is_err() {
                            // Sync engine is gone; nothing left to hint.
                            return Ok(());
                        }
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed push delta"),
                }
            }
        }
    }
}
