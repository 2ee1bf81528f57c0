// Copyright (c) 2026 Fleet Control Project
// SPDX-License-Identifier: AGPL-3.0

pub mod api;

pub use api::{app, AppState};
