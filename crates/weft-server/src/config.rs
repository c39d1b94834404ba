// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node configuration from environment variables.

/// Weft node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Static shard count of the cluster
    pub num_history_shards: i32,
    /// Name of the cluster this node belongs to
    pub cluster_name: String,
    /// Host identity used for shard and partition leases
    pub host_identity: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `WEFT_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `WEFT_NUM_HISTORY_SHARDS`: shard count (default: 4). Must match
    ///   every other node of the cluster; changing it requires a reset.
    /// - `WEFT_CLUSTER_NAME`: cluster name (default: "active")
    /// - `WEFT_HOST_IDENTITY`: lease owner identity (default: hostname:pid)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("WEFT_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("WEFT_DATABASE_URL"))?;

        let num_history_shards: i32 = std::env::var("WEFT_NUM_HISTORY_SHARDS")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("WEFT_NUM_HISTORY_SHARDS", "must be a positive integer")
            })?;
        if num_history_shards <= 0 {
            return Err(ConfigError::Invalid(
                "WEFT_NUM_HISTORY_SHARDS",
                "must be a positive integer",
            ));
        }

        let cluster_name =
            std::env::var("WEFT_CLUSTER_NAME").unwrap_or_else(|_| "active".to_string());

        let host_identity = std::env::var("WEFT_HOST_IDENTITY").unwrap_or_else(|_| {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "weft".to_string());
            format!("{host}:{}", std::process::id())
        });

        Ok(Self {
            database_url,
            num_history_shards,
            cluster_name,
            host_identity,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
