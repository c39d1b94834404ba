// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema for the Postgres store.
//!
//! Nested workflow structures are stored as JSONB next to the denormalized
//! columns the store needs for CAS checks and range scans. Applied with
//! `IF NOT EXISTS` so startup is idempotent.

use sqlx::PgPool;

use crate::error::Result;

/// Schema statements in dependency order.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cluster_metadata (
        singleton_key INT PRIMARY KEY DEFAULT 1 CHECK (singleton_key = 1),
        notification_version BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    INSERT INTO cluster_metadata (singleton_key, notification_version)
    VALUES (1, 0)
    ON CONFLICT (singleton_key) DO NOTHING
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS namespaces (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
        record JSONB NOT NULL,
        notification_version BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS shards (
        shard_id INT PRIMARY KEY,
        range_id BIGINT NOT NULL,
        record JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS executions (
        shard_id INT NOT NULL,
        namespace_id UUID NOT NULL,
        workflow_id TEXT NOT NULL,
        run_id UUID NOT NULL,
        snapshot JSONB NOT NULL,
        record_version BIGINT NOT NULL,
        PRIMARY KEY (shard_id, namespace_id, workflow_id, run_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS current_executions (
        shard_id INT NOT NULL,
        namespace_id UUID NOT NULL,
        workflow_id TEXT NOT NULL,
        run_id UUID NOT NULL,
        state TEXT NOT NULL,
        status TEXT NOT NULL,
        last_write_version BIGINT NOT NULL,
        PRIMARY KEY (shard_id, namespace_id, workflow_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS history_nodes (
        tree_id UUID NOT NULL,
        branch_id UUID NOT NULL,
        node_id BIGINT NOT NULL,
        txn_id BIGINT NOT NULL,
        events BYTEA NOT NULL,
        encoding TEXT NOT NULL,
        event_count BIGINT NOT NULL,
        PRIMARY KEY (tree_id, branch_id, node_id, txn_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS history_tasks (
        shard_id INT NOT NULL,
        category TEXT NOT NULL,
        fire_time TIMESTAMPTZ NOT NULL,
        task_id BIGINT NOT NULL,
        task JSONB NOT NULL,
        PRIMARY KEY (shard_id, category, fire_time, task_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_v2_queues (
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        next_message_id BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (kind, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_v2_messages (
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        message_id BIGINT NOT NULL,
        payload BYTEA NOT NULL,
        encoding TEXT NOT NULL,
        enqueue_time TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (kind, name, message_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_queues (
        namespace_id UUID NOT NULL,
        name TEXT NOT NULL,
        task_type TEXT NOT NULL,
        partition INT NOT NULL,
        range_id BIGINT NOT NULL,
        ack_level BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (namespace_id, name, task_type, partition)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS matching_tasks (
        namespace_id UUID NOT NULL,
        name TEXT NOT NULL,
        task_type TEXT NOT NULL,
        partition INT NOT NULL,
        task_id BIGINT NOT NULL,
        task JSONB NOT NULL,
        PRIMARY KEY (namespace_id, name, task_type, partition, task_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_queue_user_data (
        namespace_id UUID NOT NULL,
        name TEXT NOT NULL,
        task_type TEXT NOT NULL,
        version BIGINT NOT NULL,
        data BYTEA NOT NULL,
        encoding TEXT NOT NULL,
        PRIMARY KEY (namespace_id, name, task_type)
    )
    "#,
];

/// Apply the embedded schema.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(statements = SCHEMA.len(), "store schema applied");
    Ok(())
}
