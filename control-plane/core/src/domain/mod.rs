// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0

pub mod command;
pub mod error;
pub mod events;
pub mod log;
pub mod node;

pub use command::{CascadeReport, CommandKind, CommandOutcome};
pub use error::ControlError;
pub use events::{PushDelta, RegistryEvent};
pub use log::{LogEntry, LogLevel};
pub use node::{AgentId, AgentMetrics, AgentNode, AgentStatus, NodeError, PendingCommand, Tier};
