// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0
//! # Fleet Control Core
//!
//! Operational control plane for a hierarchical agent fleet.
//!
//! ## Architecture
//!
//! - **domain** — the supervision model: nodes, tiers, lifecycle
//!   statuses, commands, events
//! - **application** — registry, command dispatch, status sync,
//!   metrics rollups, log stream control
//! - **infrastructure** — backend HTTP client, push listener, event
//!   bus, configuration
//! - **presentation** — the dashboard HTTP API

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
