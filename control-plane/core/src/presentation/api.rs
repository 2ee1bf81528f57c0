// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0
//
// Dashboard API - the operator interface for this subsystem.
//
// Four read surfaces (hierarchy, metrics, logs, event stream) and two
// write surfaces (lifecycle commands, config writes). Handlers read
// cloned registry state and the aggregator cache; they never compute
// or store derived values of their own.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{sse::Event, sse::KeepAlive, IntoResponse, Sse},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::application::aggregator::{DomainRollup, MetricsAggregator, SystemRollup};
use crate::application::dispatcher::CommandDispatcher;
use crate::application::logs::{LogFilter, LogStreamController};
use crate::application::registry::AgentRegistry;
use crate::domain::command::CommandKind;
use crate::domain::error::ControlError;
use crate::domain::log::LogLevel;
use crate::domain::node::{AgentId, AgentNode};
use crate::infrastructure::client::{ControlPlaneClient, LogQuery as BackendLogQuery};
use crate::infrastructure::event_bus::EventBusError;

pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub aggregator: Arc<MetricsAggregator>,
    pub logs: Arc<LogStreamController>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub client: Arc<dyn ControlPlaneClient>,
    pub poll_interval: chrono::Duration,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/hierarchy", get(hierarchy))
        .route("/api/metrics", get(metrics))
        .route("/api/logs", get(logs))
        .route("/api/logs/stream", get(tail_logs))
        .route("/api/agents/{id}/command", post(command))
        .route("/api/agents/{id}/config", patch(configure))
        .route("/api/agents/{id}/logs/backfill", post(backfill_logs))
        .route("/api/stream", get(stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Node plus view-layer annotations. `stale` is computed at render
/// time from metrics freshness, never stored on the node.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeView {
    #[serde(flatten)]
    node: AgentNode,
    stale: bool,
    children: Vec<NodeView>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HierarchyView {
    roots: Vec<NodeView>,
    sync_healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_sync: Option<DateTime<Utc>>,
}

async fn hierarchy(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = Utc::now();
    let nodes = state.registry.snapshot();
    let (sync_healthy, last_sync) = state.registry.sync_health();

    let mut by_parent: HashMap<AgentId, Vec<AgentNode>> = HashMap::new();
    let mut roots = Vec::new();
    for node in nodes {
        match node.parent_id.clone() {
            Some(parent) => by_parent.entry(parent).or_default().push(node),
            None => roots.push(node),
        }
    }

    fn build(node: AgentNode, by_parent: &mut HashMap<AgentId, Vec<AgentNode>>, interval: chrono::Duration, now: DateTime<Utc>) -> NodeView {
        let children = by_parent
            .remove(&node.id)
            .unwrap_or_default()
            .into_iter()
            .map(|child| build(child, by_parent, interval, now))
            .collect();
        NodeView {
            stale: node.is_stale(interval, now),
            node,
            children,
        }
    }

    let roots = roots
        .into_iter()
        .map(|root| build(root, &mut by_parent, state.poll_interval, now))
        .collect();

    Json(HierarchyView {
        roots,
        sync_healthy,
        last_sync,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DomainRollupView {
    #[serde(flatten)]
    rollup: DomainRollup,
    health_ratio: Option<f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsView {
    system: SystemRollupView,
    domains: Vec<DomainRollupView>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemRollupView {
    #[serde(flatten)]
    rollup: SystemRollup,
    health_ratio: Option<f64>,
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let system = state.aggregator.system_rollup();
    let domains = state
        .aggregator
        .domain_rollups()
        .into_iter()
        .map(|rollup| DomainRollupView {
            health_ratio: rollup.health_ratio(),
            rollup,
        })
        .collect();
    Json(MetricsView {
        system: SystemRollupView {
            health_ratio: system.health_ratio(),
            rollup: system,
        },
        domains,
    })
}

#[derive(Deserialize)]
struct LogParams {
    /// Comma-separated level names.
    level: Option<String>,
    q: Option<String>,
    /// Comma-separated agent ids.
    agent: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    after: Option<u64>,
    limit: Option<usize>,
}

fn parse_levels(raw: &str) -> Option<HashSet<LogLevel>> {
    let levels: HashSet<LogLevel> = raw
        .split(',')
        .filter_map(|s| serde_json::from_value(json!(s.trim())).ok())
        .collect();
    (!levels.is_empty()).then_some(levels)
}

async fn logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogParams>,
) -> impl IntoResponse {
    let filter = LogFilter {
        levels: params.level.as_deref().and_then(parse_levels),
        q: params.q,
        agents: params.agent.map(|raw| {
            raw.split(',')
                .map(|s| AgentId::from(s.trim()))
                .collect::<HashSet<_>>()
        }),
        since: params.since,
        until: params.until,
        after: params.after,
        limit: params.limit,
    };
    Json(state.logs.query(&filter))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandRequest {
    #[serde(rename = "type")]
    kind: CommandKind,
    #[serde(default)]
    cascade: bool,
}

async fn command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    let agent_id = AgentId::from(id.as_str());
    match state.dispatcher.issue(&agent_id, request.kind, request.cascade) {
        Ok(report) => (StatusCode::ACCEPTED, Json(json!(report))).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigRequest {
    config: HashMap<String, serde_json::Value>,
    config_version: u64,
}

async fn configure(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ConfigRequest>,
) -> impl IntoResponse {
    let agent_id = AgentId::from(id.as_str());
    match state
        .dispatcher
        .configure(&agent_id, request.config, request.config_version)
        .await
    {
        Ok(command_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "commandId": command_id })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct BackfillParams {
    level: Option<LogLevel>,
    q: Option<String>,
    since: Option<DateTime<Utc>>,
    cursor: Option<String>,
}

/// Pull historical entries for one agent from the backend into the
/// local buffer.
async fn backfill_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<BackfillParams>,
) -> impl IntoResponse {
    let agent_id = AgentId::from(id.as_str());
    let query = BackendLogQuery {
        level: params.level,
        since: params.since,
        q: params.q,
        cursor: params.cursor,
    };
    match state.client.fetch_logs(&agent_id, &query).await {
        Ok(batch) => {
            let ingested = batch.entries.len();
            for record in batch.entries {
                state.logs.append(
                    agent_id.clone(),
                    record.level,
                    record.message,
                    record.timestamp,
                    record.metadata,
                );
            }
            Json(json!({ "ingested": ingested, "cursor": batch.cursor })).into_response()
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct TailParams {
    /// Comma-separated agent ids; omit to tail everything.
    agent: Option<String>,
}

/// Live tail of the log buffer as server-sent events, optionally
/// restricted to a set of agents.
async fn tail_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TailParams>,
) -> impl IntoResponse {
    let agents = params.agent.map(|raw| {
        raw.split(',')
            .map(|s| AgentId::from(s.trim()))
            .collect::<HashSet<_>>()
    });
    let receiver = state.logs.tail(agents);
    let stream = futures::stream::unfold(receiver, |mut rx| async move {
        let entry = rx.recv().await?;
        let data = serde_json::to_string(&entry).unwrap_or_default();
        Some((Ok::<_, axum::Error>(Event::default().data(data)), rx))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Live feed of registry events for the dashboard.
async fn stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let receiver = state.registry.bus().subscribe();
    let stream = futures::stream::unfold(receiver, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok::<_, axum::Error>(Event::default().data(data)), rx));
                }
                // Lag just drops events; state endpoints stay correct.
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn error_response(e: ControlError) -> axum::response::Response {
    let status = match &e {
        ControlError::NodeNotFound(_) => StatusCode::NOT_FOUND,
        ControlError::TransitionRejected { .. }
        | ControlError::CommandPending { .. }
        | ControlError::VersionConflict { .. } => StatusCode::CONFLICT,
        ControlError::CommandTimeout { .. } | ControlError::Transport(_) => {
            StatusCode::BAD_GATEWAY
        }
        ControlError::OrphanNode { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (
        status,
        Json(json!({ "error": e.to_string(), "retryable": e.is_retryable() })),
    )
        .into_response()
}
