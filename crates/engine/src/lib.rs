// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod admin;
pub mod assignment;
pub mod clock;
pub mod cloner;
pub mod cloud;
pub mod error;
pub mod events;
pub mod jobs;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod scoring;
pub mod store;
pub mod teardown;
pub mod template;

pub use error::{EngineError, ValidationError};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
