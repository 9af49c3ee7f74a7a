// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pg-guest - PostgreSQL guest controller
//!
//! Serves control-plane requests on a Unix socket and keeps the engine
//! container's status up to date.

use std::sync::Arc;
use tracing::{info, warn};

use pg_guest::admin::PgAdmin;
use pg_guest::config::Config;
use pg_guest::object_store;
use pg_guest::runtime::GuestRuntime;
use pg_guest::supervisor::{DockerSupervisor, DockerSupervisorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pg_guest=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        instance_id = %config.instance_id,
        socket = %config.socket_path.display(),
        mount_point = %config.mount_point.display(),
        image = %config.docker_image,
        "Starting pg-guest"
    );

    let password = match tokio::fs::read_to_string(config.password_file()).await {
        Ok(text) => Some(text.trim().to_string()).filter(|p| !p.is_empty()),
        Err(_) => None,
    };
    let admin = Arc::new(PgAdmin::from_config(&config, password.as_deref()));
    let store = object_store::from_config(&config)?;
    let supervisor = Arc::new(DockerSupervisor::new(DockerSupervisorConfig::default()));

    let runtime = GuestRuntime::builder()
        .config(config)
        .supervisor(supervisor)
        .admin(admin)
        .object_store(store)
        .build()?
        .start()
        .await?;

    info!(socket = %runtime.socket_path().display(), "pg-guest ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("pg-guest shut down");

    Ok(())
}
