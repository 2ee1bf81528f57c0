// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0
//! Backend control-plane API client.
//!
//! The backend is an external collaborator; this module pins down the
//! contract the core consumes: hierarchy snapshots, targeted node
//! fetches, lifecycle POSTs, optimistic-concurrency config writes and
//! paginated log backfill. The trait exists so the sync engine and
//! dispatcher can be tested against a scripted fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;

use crate::domain::command::CommandKind;
use crate::domain::log::LogLevel;
use crate::domain::node::{AgentId, AgentNode};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// 409 on a lifecycle POST: the backend refused the transition.
    #[error("backend rejected the transition: {0}")]
    Rejected(String),

    /// 409 on a config PATCH: the held configVersion is stale.
    #[error("config version conflict: {0}")]
    VersionConflict(String),

    #[error("agent not found on backend: {0}")]
    NotFound(AgentId),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("malformed backend payload: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

/// Parameters for a log backfill request.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub level: Option<LogLevel>,
    pub since: Option<DateTime<Utc>>,
    pub q: Option<String>,
    pub cursor: Option<String>,
}

/// Log record as the backend reports it; the log controller assigns
/// local sequence ids at ingestion.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteLogRecord {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBatch {
    pub entries: Vec<RemoteLogRecord>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// `GET /agents` — full hierarchy snapshot.
    async fn fetch_hierarchy(&self) -> Result<Vec<AgentNode>, ClientError>;

    /// `GET /agents/{id}` — targeted re-fetch after a push hint.
    async fn fetch_node(&self, id: &AgentId) -> Result<AgentNode, ClientError>;

    /// `POST /agents/{id}/{start|stop|restart}` — accepted (202) or
    /// rejected (409). `Configure` goes through `patch_config` instead.
    async fn send_command(&self, id: &AgentId, kind: CommandKind) -> Result<(), ClientError>;

    /// `PATCH /agents/{id}/config` — 409 on version mismatch.
    async fn patch_config(
        &self,
        id: &AgentId,
        config: &HashMap<String, serde_json::Value>,
        config_version: u64,
    ) -> Result<(), ClientError>;

    /// `GET /agents/{id}/logs?...` — paginated log backfill.
    async fn fetch_logs(&self, id: &AgentId, query: &LogQuery) -> Result<LogBatch, ClientError>;
}

pub struct HttpControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpControlPlaneClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn fetch_hierarchy(&self) -> Result<Vec<AgentNode>, ClientError> {
        let response = self.http.get(self.url("/agents")).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Transport(format!(
                "GET /agents returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn fetch_node(&self, id: &AgentId) -> Result<AgentNode, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/agents/{id}")))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(id.clone())),
            s if s.is_success() => Ok(response.json().await?),
            s => Err(ClientError::Transport(format!(
                "GET /agents/{id} returned {s}"
            ))),
        }
    }

    async fn send_command(&self, id: &AgentId, kind: CommandKind) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/agents/{id}/{kind}")))
            .send()
            .await?;
        match response.status() {
            StatusCode::CONFLICT => {
                let body = response.text().await.unwrap_or_default();
                Err(ClientError::Rejected(body))
            }
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(id.clone())),
            s if s.is_success() => Ok(()),
            s => Err(ClientError::Transport(format!(
                "POST /agents/{id}/{kind} returned {s}"
            ))),
        }
    }

    async fn patch_config(
        &self,
        id: &AgentId,
        config: &HashMap<String, serde_json::Value>,
        config_version: u64,
    ) -> Result<(), ClientError> {
        let body = serde_json::json!({
            "config": config,
            "configVersion": config_version,
        });
        let response = self
            .http
            .patch(self.url(&format!("/agents/{id}/config")))
            .json(&body)
            .send()
            .await?;
        match response.status() {
            StatusCode::CONFLICT => {
                let body = response.text().await.unwrap_or_default();
                Err(ClientError::VersionConflict(body))
            }
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(id.clone())),
            s if s.is_success() => Ok(()),
            s => Err(ClientError::Transport(format!(
                "PATCH /agents/{id}/config returned {s}"
            ))),
        }
    }

    async fn fetch_logs(&self, id: &AgentId, query: &LogQuery) -> Result<LogBatch, ClientError> {
        let mut request = self.http.get(self.url(&format!("/agents/{id}/logs")));
        if let Some(level) = query.level {
            request = request.query(&[("level", level.to_string())]);
        }
        if let Some(since) = query.since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }
        if let Some(q) = &query.q {
            request = request.query(&[("q", q.as_str())]);
        }
        if let Some(cursor) = &query.cursor {
            request = request.query(&[("cursor", cursor.as_str())]);
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(id.clone())),
            s if s.is_success() => Ok(response.json().await?),
            s => Err(ClientError::Transport(format!(
                "GET /agents/{id}/logs returned {s}"
            ))),
        }
    }
}
