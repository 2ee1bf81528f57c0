// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0

pub mod client;
pub mod config;
pub mod event_bus;
pub mod push;

pub use client::{ControlPlaneClient, HttpControlPlaneClient};
pub use config::ControlPlaneConfig;
pub use event_bus::EventBus;
pub use push::PushListener;
