// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

mod api {
    tonic::include_proto!("cyberrange");
}

mod convert;
mod scenarios;

pub use api::scenario_service_server::ScenarioServiceServer;
pub use scenarios::ScenarioManager;
