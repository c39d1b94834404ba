// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Weft node entry point.
//!
//! Assembles one cluster node: the Postgres store, the namespace registry
//! with its refresher, the shard controller that owns this host's share of
//! the execution engine, and the namespace replication applier. The RPC
//! frontend attaches to these services separately.

mod config;

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use weft_common::config::{keys, Constraints, DynamicConfig};
use weft_history::cache::MutableStateCache;
use weft_history::config::HistoryConfig;
use weft_history::shard::ShardController;
use weft_namespace::Registry;
use weft_persistence::{migrations, PostgresStore};
use weft_replication::namespace_replication::NamespaceReplicationApplier;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("weft=info".parse()?),
        )
        .init();

    info!("Starting Weft node");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    info!(
        shards = config.num_history_shards,
        cluster = %config.cluster_name,
        host = %config.host_identity,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await?;
    migrations::run_migrations(&pool).await?;
    info!("Database ready");

    let store = Arc::new(PostgresStore::new(pool.clone()));
    let dynamic_config = DynamicConfig::new();

    // namespace registry + background refresher
    let registry = Registry::new(store.clone(), dynamic_config.clone());
    let registry_handle = registry.clone().start().await?;

    // shard engine: this standalone node owns every shard
    let cache = Arc::new(MutableStateCache::new());
    let history_config = HistoryConfig::new(dynamic_config.clone(), config.num_history_shards);
    let controller = ShardController::new(
        store.clone(),
        history_config,
        config.host_identity.clone(),
        Arc::new(|_| true),
        cache,
    );
    let controller_shutdown = controller.shutdown_handle();
    let controller_handle = controller.clone().start();

    // namespace replication applier: drains metadata mutations from peers
    let applier = NamespaceReplicationApplier::new(store.clone(), store.clone());
    let applier_config = dynamic_config.clone();
    let applier_handle = tokio::spawn(async move {
        loop {
            if let Err(e) = applier.drain_once(100).await {
                error!(error = %e, "namespace replication drain failed");
            }
            let interval = applier_config.get_duration(
                keys::REPLICATION_FETCH_INTERVAL,
                &Constraints::default(),
                keys::REPLICATION_FETCH_INTERVAL_DEFAULT,
            );
            tokio::time::sleep(interval).await;
        }
    });

    info!("Weft node started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    registry.shutdown_handle().notify_one();
    controller_shutdown.notify_one();
    applier_handle.abort();
    let _ = registry_handle.await;
    let _ = controller_handle.await;

    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}
