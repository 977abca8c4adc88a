// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use cyberrange_engine::OrchestratorBuilder;
use cyberrange_engine::cloud::OpenStackAdapter;
use cyberrange_engine::store::{MemoryStore, PgStore, Store, run_migrations};
use cyberrange_engine::template::RepoTemplateStore;
use tokio::sync::broadcast::error::RecvError;

use crate::config::ManagerConfig;
use crate::grpc::{ScenarioManager, ScenarioServiceServer};

mod config;
mod grpc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::warn!("A default TLS provider was already installed");
    }

    let config = ManagerConfig::from_env()?;
    let templates = Arc::new(RepoTemplateStore::new(&config.repo_dir));
    let cloud = Arc::new(OpenStackAdapter::new(config.openstack.clone()));

    let store: Arc<dyn Store> = match &config.database_url {
        Some(database_url) => {
            run_migrations(database_url).await?;
            Arc::new(PgStore::connect(database_url, config.db_pool_size).await?)
        }
        None => {
            tracing::warn!("DATABASE_URL is not set, progress will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let orchestrator = Arc::new(
        OrchestratorBuilder::new(templates.clone(), cloud)
            .store(store)
            .workers(config.worker_count)
            .op_timeout(config.cloud_op_timeout)
            .max_update_retries(config.max_update_retries)
            .job_retention(config.job_retention)
            .build()
            .await?,
    );

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(event) => tracing::info!(target: "cyberrange::events", "{event}"),
                    Err(e) => tracing::warn!("Failed to serialize event: {e}"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event log fell behind, skipped {skipped} events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let scenario_manager = ScenarioManager {
        orchestrator: orchestrator.clone(),
        templates,
    };
    tracing::info!("Cyber range manager listening on {}", config.listen_addr);
    tonic::transport::Server::builder()
        .add_service(ScenarioServiceServer::new(scenario_manager))
        .serve_with_shutdown(config.listen_addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
            }
        })
        .await?;

    tracing::info!("Shutting down job workers");
    orchestrator.shutdown().await;
    Ok(())
}
