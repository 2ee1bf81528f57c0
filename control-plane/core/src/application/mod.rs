// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0

pub mod aggregator;
pub mod dispatcher;
pub mod logs;
pub mod registry;
pub mod sync;

pub use aggregator::{DomainRollup, MetricsAggregator, SystemRollup};
pub use dispatcher::CommandDispatcher;
pub use logs::{LogFilter, LogPage, LogStreamController};
pub use registry::{AgentRegistry, UpsertOutcome};
pub use sync::StatusSyncEngine;
