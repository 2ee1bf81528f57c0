// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0
//! # Log Stream Controller
//!
//! Append-only ingestion into a bounded ring buffer with live tail.
//! Filtering and search are pure functions over the buffer: they never
//! mutate stored entries, so the same query over an unchanged buffer
//! always yields the same page.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::broadcast;

use crate::domain::log::{LogEntry, LogLevel};
use crate::domain::node::AgentId;

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
pub const DEFAULT_MAX_AGE_HOURS: i64 = 24;
const DEFAULT_PAGE_LIMIT: usize = 100;

/// Query over the log buffer. All criteria are conjunctive; unset
/// criteria match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    /// Set membership over levels.
    pub levels: Option<HashSet<LogLevel>>,
    /// Case-insensitive free-text search over `message`.
    pub q: Option<String>,
    pub agents: Option<HashSet<AgentId>>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Pagination cursor: only entries with id greater than this.
    pub after: Option<u64>,
    pub limit: Option<usize>,
}

impl LogFilter {
    fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(levels) = &self.levels {
            if !levels.contains(&entry.level) {
                return false;
            }
        }
        if let Some(agents) = &self.agents {
            if !agents.contains(&entry.agent_id) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp > until {
                return false;
            }
        }
        if let Some(q) = &self.q {
            if !entry.message.to_lowercase().contains(&q.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// One page of filtered results, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    pub entries: Vec<LogEntry>,
    /// Cursor for the next page; `None` when the page exhausted the
    /// matching entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<u64>,
}

struct LogBuffer {
    entries: VecDeque<LogEntry>,
    next_id: u64,
}

/// Retention: whichever of the count and age bounds binds first.
pub struct LogStreamController {
    buffer: RwLock<LogBuffer>,
    tail: broadcast::Sender<LogEntry>,
    max_entries: usize,
    max_age: Duration,
}

impl LogStreamController {
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        let (tail, _) = broadcast::channel(1024);
        Self {
            buffer: RwLock::new(LogBuffer {
                entries: VecDeque::new(),
                next_id: 1,
            }),
            tail,
            max_entries,
            max_age,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, Duration::hours(DEFAULT_MAX_AGE_HOURS))
    }

    /// Append one entry, assigning its sequence id. Entries are
    /// immutable from here on; only eviction removes them.
    pub fn append(
        &self,
        agent_id: AgentId,
        level: LogLevel,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> LogEntry {
        let entry = {
            let mut buffer = self.buffer.write();
            let entry = LogEntry {
                id: buffer.next_id,
                agent_id,
                level,
                message: message.into(),
                timestamp,
                metadata,
            };
            buffer.next_id += 1;
            buffer.entries.push_back(entry.clone());
            Self::evict(&mut buffer, self.max_entries, self.max_age);
            entry
        };
        // Nobody tailing is fine.
        let _ = self.tail.send(entry.clone());
        entry
    }

    fn evict(buffer: &mut LogBuffer, max_entries: usize, max_age: Duration) {
        let mut evicted = 0u64;
        while buffer.entries.len() > max_entries {
            buffer.entries.pop_front();
            evicted += 1;
        }
        let cutoff = Utc::now() - max_age;
        while buffer
            .entries
            .front()
            .is_some_and(|e| e.timestamp < cutoff)
        {
            buffer.entries.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            counter!("fleet_log_evictions_total").increment(evicted);
        }
    }

    /// Pure query: filter, search and paginate without touching the
    /// stored entries.
    pub fn query(&self, filter: &LogFilter) -> LogPage {
        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        let buffer = self.buffer.read();

        let mut entries = Vec::new();
        let mut next_cursor = None;
        for entry in buffer.entries.iter() {
            if let Some(after) = filter.after {
                if entry.id <= after {
                    continue;
                }
            }
            if !filter.matches(entry) {
                continue;
            }
            if entries.len() == limit {
                next_cursor = entries.last().map(|e: &LogEntry| e.id);
                break;
            }
            entries.push(entry.clone());
        }
        LogPage {
            entries,
            next_cursor,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.read().entries.is_empty()
    }

    /// Live tail restricted to the given agents (all agents when
    /// `None`). New matching entries arrive as they are appended.
    pub fn tail(&self, agents: Option<HashSet<AgentId>>) -> TailReceiver {
        TailReceiver {
            receiver: self.tail.subscribe(),
            agents,
        }
    }
}

/// Receiver side of tail mode.
pub struct TailReceiver {
    receiver: broadcast::Receiver<LogEntry>,
    agents: Option<HashSet<AgentId>>,
}

impl TailReceiver {
    pub async fn recv(&mut self) -> Option<LogEntry> {
        loop {
            match self.receiver.recv().await {
                Ok(entry) => {
                    if self
                        .agents
                        .as_ref()
                        .is_none_or(|agents| agents.contains(&entry.agent_id))
                    {
                        return Some(entry);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
