// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Postgres store.
//!
//! Plain SQL over sqlx. Workflow transactions run inside a database
//! transaction that first locks the shard row and verifies the caller's
//! lease; a mismatch surfaces as `ShardOwnershipLost` before any row is
//! touched. Nested workflow structures travel as one JSONB snapshot column;
//! the columns needed for CAS and range scans are denormalized.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use weft_common::tasks::{Task, TaskCategory, TaskKey, WorkflowKey};

use crate::error::{Result, StoreError};
use crate::store::*;
use crate::types::*;

/// Postgres-backed implementation of the full store surface.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap a connection pool. Call [`crate::migrations::run_migrations`]
    /// before first use.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_shard(
        tx: &mut Transaction<'_, Postgres>,
        shard_id: i32,
        range_id: i64,
    ) -> Result<()> {
        let row = sqlx::query("SELECT range_id FROM shards WHERE shard_id = $1 FOR UPDATE")
            .bind(shard_id)
            .fetch_optional(&mut **tx)
            .await?;
        match row {
            Some(row) if row.get::<i64, _>("range_id") == range_id => Ok(()),
            _ => Err(StoreError::ShardOwnershipLost { shard_id, range_id }),
        }
    }

    async fn insert_history_tasks(
        tx: &mut Transaction<'_, Postgres>,
        shard_id: i32,
        tasks: &[Task],
    ) -> Result<()> {
        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO history_tasks (shard_id, category, fire_time, task_id, task)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(shard_id)
            .bind(task.category().to_string())
            .bind(task.key.fire_time)
            .bind(task.key.task_id)
            .bind(serde_json::to_value(task)?)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn insert_history_nodes(
        tx: &mut Transaction<'_, Postgres>,
        writes: &[HistoryNodeWrite],
    ) -> Result<()> {
        for write in writes {
            let info = BranchInfo::from_token(&write.branch_token)?;
            sqlx::query(
                r#"
                INSERT INTO history_nodes
                    (tree_id, branch_id, node_id, txn_id, events, encoding, event_count)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (tree_id, branch_id, node_id, txn_id)
                DO UPDATE SET events = EXCLUDED.events,
                              encoding = EXCLUDED.encoding,
                              event_count = EXCLUDED.event_count
                "#,
            )
            .bind(info.tree_id)
            .bind(info.branch_id)
            .bind(write.node_id)
            .bind(write.transaction_id)
            .bind(&write.events.data)
            .bind(&write.events.encoding)
            .bind(write.event_count)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn upsert_current(
        tx: &mut Transaction<'_, Postgres>,
        shard_id: i32,
        key: &WorkflowKey,
        snapshot: &WorkflowSnapshot,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO current_executions
                (shard_id, namespace_id, workflow_id, run_id, state, status, last_write_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (shard_id, namespace_id, workflow_id)
            DO UPDATE SET run_id = EXCLUDED.run_id,
                          state = EXCLUDED.state,
                          status = EXCLUDED.status,
                          last_write_version = EXCLUDED.last_write_version
            "#,
        )
        .bind(shard_id)
        .bind(key.namespace_id)
        .bind(&key.workflow_id)
        .bind(key.run_id)
        .bind(state_str(snapshot.state))
        .bind(status_str(snapshot.status))
        .bind(snapshot.last_write_version)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn fetch_current(
        tx: &mut Transaction<'_, Postgres>,
        shard_id: i32,
        namespace_id: Uuid,
        workflow_id: &str,
    ) -> Result<Option<CurrentExecution>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, state, status, last_write_version
            FROM current_executions
            WHERE shard_id = $1 AND namespace_id = $2 AND workflow_id = $3
            FOR UPDATE
            "#,
        )
        .bind(shard_id)
        .bind(namespace_id)
        .bind(workflow_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(|row| {
            Ok(CurrentExecution {
                run_id: row.get("run_id"),
                state: parse_state(&row.get::<String, _>("state"))?,
                status: parse_status(&row.get::<String, _>("status"))?,
                last_write_version: row.get("last_write_version"),
            })
        })
        .transpose()
    }

    async fn insert_execution(
        tx: &mut Transaction<'_, Postgres>,
        shard_id: i32,
        key: &WorkflowKey,
        snapshot: &WorkflowSnapshot,
        record_version: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO executions
                (shard_id, namespace_id, workflow_id, run_id, snapshot, record_version)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(shard_id)
        .bind(key.namespace_id)
        .bind(&key.workflow_id)
        .bind(key.run_id)
        .bind(serde_json::to_value(snapshot)?)
        .bind(record_version)
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(format!("workflow run {key}")));
        }
        Ok(())
    }

    /// Read-modify-write of one execution row under the open transaction.
    async fn mutate_execution(
        tx: &mut Transaction<'_, Postgres>,
        shard_id: i32,
        key: &WorkflowKey,
        mutation: &WorkflowMutation,
        expected_record_version: i64,
    ) -> Result<WorkflowSnapshot> {
        let row = sqlx::query(
            r#"
            SELECT snapshot, record_version
            FROM executions
            WHERE shard_id = $1 AND namespace_id = $2 AND workflow_id = $3 AND run_id = $4
            FOR UPDATE
            "#,
        )
        .bind(shard_id)
        .bind(key.namespace_id)
        .bind(&key.workflow_id)
        .bind(key.run_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("workflow run {key}")))?;

        let record_version: i64 = row.get("record_version");
        if record_version != expected_record_version {
            return Err(StoreError::WorkflowConditionFailed(format!(
                "run {key} record version {record_version} != expected {expected_record_version}"
            )));
        }
        let mut snapshot: WorkflowSnapshot = serde_json::from_value(row.get("snapshot"))?;
        mutation.apply_to(&mut snapshot);

        sqlx::query(
            r#"
            UPDATE executions
            SET snapshot = $5, record_version = record_version + 1
            WHERE shard_id = $1 AND namespace_id = $2 AND workflow_id = $3 AND run_id = $4
            "#,
        )
        .bind(shard_id)
        .bind(key.namespace_id)
        .bind(&key.workflow_id)
        .bind(key.run_id)
        .bind(serde_json::to_value(&snapshot)?)
        .execute(&mut **tx)
        .await?;
        Ok(snapshot)
    }
}

fn state_str(state: WorkflowState) -> &'static str {
    match state {
        WorkflowState::Created => "created",
        WorkflowState::Running => "running",
        WorkflowState::Completed => "completed",
        WorkflowState::Zombie => "zombie",
        WorkflowState::Corrupted => "corrupted",
    }
}

fn parse_state(s: &str) -> Result<WorkflowState> {
    match s {
        "created" => Ok(WorkflowState::Created),
        "running" => Ok(WorkflowState::Running),
        "completed" => Ok(WorkflowState::Completed),
        "zombie" => Ok(WorkflowState::Zombie),
        "corrupted" => Ok(WorkflowState::Corrupted),
        other => Err(StoreError::Serialization(format!(
            "unknown workflow state '{other}'"
        ))),
    }
}

fn status_str(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Running => "running",
        WorkflowStatus::Completed => "completed",
        WorkflowStatus::Failed => "failed",
        WorkflowStatus::Canceled => "canceled",
        WorkflowStatus::Terminated => "terminated",
        WorkflowStatus::ContinuedAsNew => "continued_as_new",
        WorkflowStatus::TimedOut => "timed_out",
    }
}

fn parse_status(s: &str) -> Result<WorkflowStatus> {
    match s {
        "running" => Ok(WorkflowStatus::Running),
        "completed" => Ok(WorkflowStatus::Completed),
        "failed" => Ok(WorkflowStatus::Failed),
        "canceled" => Ok(WorkflowStatus::Canceled),
        "terminated" => Ok(WorkflowStatus::Terminated),
        "continued_as_new" => Ok(WorkflowStatus::ContinuedAsNew),
        "timed_out" => Ok(WorkflowStatus::TimedOut),
        other => Err(StoreError::Serialization(format!(
            "unknown workflow status '{other}'"
        ))),
    }
}

fn queue_kind_str(kind: QueueV2Kind) -> &'static str {
    match kind {
        QueueV2Kind::ReplicationDlq => "replication_dlq",
        QueueV2Kind::NamespaceReplication => "namespace_replication",
    }
}

fn task_type_str(task_type: TaskQueueType) -> &'static str {
    match task_type {
        TaskQueueType::Workflow => "workflow",
        TaskQueueType::Activity => "activity",
        TaskQueueType::Nexus => "nexus",
    }
}

// ============================================================================
// Metadata
// ============================================================================

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn get_metadata(&self) -> Result<MetadataInfo> {
        let row = sqlx::query("SELECT notification_version FROM cluster_metadata")
            .fetch_one(&self.pool)
            .await?;
        Ok(MetadataInfo {
            notification_version: row.get("notification_version"),
        })
    }

    async fn list_namespaces(
        &self,
        request: ListNamespacesRequest,
    ) -> Result<ListNamespacesResponse> {
        let after = match &request.next_page_token {
            Some(token) => String::from_utf8(token.clone())
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            None => String::new(),
        };
        let page_size = if request.page_size == 0 {
            i64::MAX
        } else {
            request.page_size as i64
        };
        let rows = sqlx::query(
            r#"
            SELECT record FROM namespaces
            WHERE name > $1 AND (is_deleted = FALSE OR $2)
            ORDER BY name
            LIMIT $3
            "#,
        )
        .bind(&after)
        .bind(request.include_deleted)
        .bind(page_size)
        .fetch_all(&self.pool)
        .await?;

        let namespaces: Vec<NamespaceRecord> = rows
            .into_iter()
            .map(|row| serde_json::from_value(row.get("record")))
            .collect::<std::result::Result<_, _>>()?;
        let next_page_token = if namespaces.len() as i64 >= page_size {
            namespaces.last().map(|r| r.name.clone().into_bytes())
        } else {
            None
        };
        Ok(ListNamespacesResponse {
            namespaces,
            next_page_token,
        })
    }

    async fn get_namespace_by_name(&self, name: &str) -> Result<NamespaceRecord> {
        let row = sqlx::query("SELECT record FROM namespaces WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("namespace '{name}'")))?;
        Ok(serde_json::from_value(row.get("record"))?)
    }

    async fn get_namespace_by_id(&self, id: Uuid) -> Result<NamespaceRecord> {
        let row = sqlx::query("SELECT record FROM namespaces WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("namespace '{id}'")))?;
        Ok(serde_json::from_value(row.get("record"))?)
    }

    async fn create_namespace(&self, mut record: NamespaceRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE cluster_metadata SET notification_version = notification_version + 1
             RETURNING notification_version - 1 AS version",
        )
        .fetch_one(&mut *tx)
        .await?;
        record.notification_version = row.get("version");

        let result = sqlx::query(
            r#"
            INSERT INTO namespaces (id, name, is_deleted, record, notification_version)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(record.state == NamespaceState::Deleted)
        .bind(serde_json::to_value(&record)?)
        .bind(record.notification_version)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(format!(
                "namespace '{}'",
                record.name
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_namespace(
        &self,
        mut record: NamespaceRecord,
        expected_notification_version: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE cluster_metadata SET notification_version = notification_version + 1
             RETURNING notification_version - 1 AS version",
        )
        .fetch_one(&mut *tx)
        .await?;
        record.notification_version = row.get("version");

        let result = sqlx::query(
            r#"
            UPDATE namespaces
            SET record = $2, notification_version = $3, is_deleted = $4
            WHERE id = $1 AND notification_version = $5
            "#,
        )
        .bind(record.id)
        .bind(serde_json::to_value(&record)?)
        .bind(record.notification_version)
        .bind(record.state == NamespaceState::Deleted)
        .bind(expected_notification_version)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ConditionFailed(format!(
                "namespace '{}' notification version moved",
                record.name
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_namespace(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE cluster_metadata SET notification_version = notification_version + 1")
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM namespaces WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("namespace '{id}'")));
        }
        tx.commit().await?;
        Ok(())
    }
}

// ============================================================================
// Shard
// ============================================================================

#[async_trait]
impl ShardStore for PostgresStore {
    async fn get_or_create_shard(&self, shard_id: i32, owner: &str) -> Result<ShardInfo> {
        let fresh = ShardInfo::new(shard_id, owner);
        sqlx::query(
            r#"
            INSERT INTO shards (shard_id, range_id, record)
            VALUES ($1, $2, $3)
            ON CONFLICT (shard_id) DO NOTHING
            "#,
        )
        .bind(shard_id)
        .bind(fresh.range_id)
        .bind(serde_json::to_value(&fresh)?)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT record FROM shards WHERE shard_id = $1")
            .bind(shard_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(serde_json::from_value(row.get("record"))?)
    }

    async fn update_shard(&self, mut info: ShardInfo, expected_range_id: i64) -> Result<()> {
        info.updated_at = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE shards SET range_id = $2, record = $3
            WHERE shard_id = $1 AND range_id = $4
            "#,
        )
        .bind(info.shard_id)
        .bind(info.range_id)
        .bind(serde_json::to_value(&info)?)
        .bind(expected_range_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ShardOwnershipLost {
                shard_id: info.shard_id,
                range_id: expected_range_id,
            });
        }
        Ok(())
    }

    async fn assert_shard_ownership(&self, shard_id: i32, range_id: i64) -> Result<()> {
        let row = sqlx::query("SELECT range_id FROM shards WHERE shard_id = $1")
            .bind(shard_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) if row.get::<i64, _>("range_id") == range_id => Ok(()),
            _ => Err(StoreError::ShardOwnershipLost { shard_id, range_id }),
        }
    }
}

// ============================================================================
// Execution
// ============================================================================

#[async_trait]
impl ExecutionStore for PostgresStore {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_shard(&mut tx, request.shard_id, request.range_id).await?;

        let current = Self::fetch_current(
            &mut tx,
            request.shard_id,
            request.workflow_key.namespace_id,
            &request.workflow_key.workflow_id,
        )
        .await?;

        match &request.mode {
            CreateWorkflowMode::BrandNew => {
                if let Some(current) = current {
                    return Err(StoreError::CurrentWorkflowConditionFailed(format!(
                        "workflow '{}' already has current run {}",
                        request.workflow_key.workflow_id, current.run_id
                    )));
                }
            }
            CreateWorkflowMode::WorkflowIdReuse {
                prev_run_id,
                prev_last_write_version,
            } => {
                let valid = current.as_ref().is_some_and(|c| {
                    c.run_id == *prev_run_id
                        && c.last_write_version == *prev_last_write_version
                        && c.state == WorkflowState::Completed
                });
                if !valid {
                    return Err(StoreError::CurrentWorkflowConditionFailed(format!(
                        "workflow '{}' current run moved",
                        request.workflow_key.workflow_id
                    )));
                }
            }
            CreateWorkflowMode::Zombie => {}
        }

        Self::insert_execution(
            &mut tx,
            request.shard_id,
            &request.workflow_key,
            &request.snapshot,
            request.record_version,
        )
        .await?;
        if !matches!(request.mode, CreateWorkflowMode::Zombie) {
            Self::upsert_current(
                &mut tx,
                request.shard_id,
                &request.workflow_key,
                &request.snapshot,
            )
            .await?;
        }
        Self::insert_history_nodes(&mut tx, &request.new_events).await?;
        Self::insert_history_tasks(&mut tx, request.shard_id, &request.tasks).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_shard(&mut tx, request.shard_id, request.range_id).await?;

        if request.mode == UpdateWorkflowMode::UpdateCurrent {
            let current = Self::fetch_current(
                &mut tx,
                request.shard_id,
                request.workflow_key.namespace_id,
                &request.workflow_key.workflow_id,
            )
            .await?;
            if current.as_ref().map(|c| c.run_id) != Some(request.workflow_key.run_id) {
                return Err(StoreError::CurrentWorkflowConditionFailed(format!(
                    "run {} is not current for workflow '{}'",
                    request.workflow_key.run_id, request.workflow_key.workflow_id
                )));
            }
        }

        let mutated = Self::mutate_execution(
            &mut tx,
            request.shard_id,
            &request.workflow_key,
            &request.mutation,
            request.expected_record_version,
        )
        .await?;

        if let Some((new_key, new_snapshot)) = &request.new_snapshot {
            Self::insert_execution(&mut tx, request.shard_id, new_key, new_snapshot, 1).await?;
            if request.mode == UpdateWorkflowMode::UpdateCurrent {
                Self::upsert_current(&mut tx, request.shard_id, new_key, new_snapshot).await?;
            }
        } else if request.mode == UpdateWorkflowMode::UpdateCurrent {
            Self::upsert_current(&mut tx, request.shard_id, &request.workflow_key, &mutated)
                .await?;
        }

        Self::insert_history_nodes(&mut tx, &request.new_events).await?;
        Self::insert_history_tasks(&mut tx, request.shard_id, &request.tasks).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn conflict_resolve_workflow_execution(
        &self,
        request: ConflictResolveWorkflowExecutionRequest,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_shard(&mut tx, request.shard_id, request.range_id).await?;

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET snapshot = $5, record_version = record_version + 1
            WHERE shard_id = $1 AND namespace_id = $2 AND workflow_id = $3 AND run_id = $4
              AND record_version = $6
            "#,
        )
        .bind(request.shard_id)
        .bind(request.workflow_key.namespace_id)
        .bind(&request.workflow_key.workflow_id)
        .bind(request.workflow_key.run_id)
        .bind(serde_json::to_value(&request.reset_snapshot)?)
        .bind(request.expected_record_version)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowConditionFailed(format!(
                "run {} record version moved during conflict resolve",
                request.workflow_key
            )));
        }

        if let Some((mutated_key, mutation, expected)) = &request.current_mutation {
            Self::mutate_execution(&mut tx, request.shard_id, mutated_key, mutation, *expected)
                .await?;
        }
        if let Some((new_key, new_snapshot)) = &request.new_snapshot {
            Self::insert_execution(&mut tx, request.shard_id, new_key, new_snapshot, 1).await?;
        }
        if request.mode == ConflictResolveMode::ResetCurrent {
            let (winner_key, winner_snapshot) = match &request.new_snapshot {
                Some((k, s)) => (k, s),
                None => (&request.workflow_key, &request.reset_snapshot),
            };
            Self::upsert_current(&mut tx, request.shard_id, winner_key, winner_snapshot).await?;
        }

        Self::insert_history_nodes(&mut tx, &request.new_events).await?;
        Self::insert_history_tasks(&mut tx, request.shard_id, &request.tasks).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        shard_id: i32,
        workflow_key: &WorkflowKey,
    ) -> Result<GetWorkflowExecutionResponse> {
        let row = sqlx::query(
            r#"
            SELECT snapshot, record_version
            FROM executions
            WHERE shard_id = $1 AND namespace_id = $2 AND workflow_id = $3 AND run_id = $4
            "#,
        )
        .bind(shard_id)
        .bind(workflow_key.namespace_id)
        .bind(&workflow_key.workflow_id)
        .bind(workflow_key.run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("workflow run {workflow_key}")))?;
        Ok(GetWorkflowExecutionResponse {
            snapshot: serde_json::from_value(row.get("snapshot"))?,
            record_version: row.get("record_version"),
        })
    }

    async fn set_workflow_execution(
        &self,
        shard_id: i32,
        workflow_key: &WorkflowKey,
        snapshot: WorkflowSnapshot,
        expected_record_version: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET snapshot = $5, record_version = record_version + 1
            WHERE shard_id = $1 AND namespace_id = $2 AND workflow_id = $3 AND run_id = $4
              AND record_version = $6
            "#,
        )
        .bind(shard_id)
        .bind(workflow_key.namespace_id)
        .bind(&workflow_key.workflow_id)
        .bind(workflow_key.run_id)
        .bind(serde_json::to_value(&snapshot)?)
        .bind(expected_record_version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowConditionFailed(format!(
                "run {workflow_key} record version moved"
            )));
        }
        Ok(())
    }

    async fn delete_workflow_execution(
        &self,
        shard_id: i32,
        workflow_key: &WorkflowKey,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM executions
            WHERE shard_id = $1 AND namespace_id = $2 AND workflow_id = $3 AND run_id = $4
            "#,
        )
        .bind(shard_id)
        .bind(workflow_key.namespace_id)
        .bind(&workflow_key.workflow_id)
        .bind(workflow_key.run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_current_workflow_execution(
        &self,
        shard_id: i32,
        namespace_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM current_executions
            WHERE shard_id = $1 AND namespace_id = $2 AND workflow_id = $3 AND run_id = $4
            "#,
        )
        .bind(shard_id)
        .bind(namespace_id)
        .bind(workflow_id)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_current_execution(
        &self,
        shard_id: i32,
        namespace_id: Uuid,
        workflow_id: &str,
    ) -> Result<CurrentExecution> {
        let row = sqlx::query(
            r#"
            SELECT run_id, state, status, last_write_version
            FROM current_executions
            WHERE shard_id = $1 AND namespace_id = $2 AND workflow_id = $3
            "#,
        )
        .bind(shard_id)
        .bind(namespace_id)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("current run of '{workflow_id}'")))?;
        Ok(CurrentExecution {
            run_id: row.get("run_id"),
            state: parse_state(&row.get::<String, _>("state"))?,
            status: parse_status(&row.get::<String, _>("status"))?,
            last_write_version: row.get("last_write_version"),
        })
    }

    async fn list_concrete_executions(
        &self,
        shard_id: i32,
        page_size: usize,
        next_page_token: Option<Vec<u8>>,
    ) -> Result<(Vec<WorkflowKey>, Option<Vec<u8>>)> {
        let after = match next_page_token {
            Some(token) => {
                String::from_utf8(token).map_err(|e| StoreError::Serialization(e.to_string()))?
            }
            None => String::new(),
        };
        let rows = sqlx::query(
            r#"
            SELECT namespace_id, workflow_id, run_id
            FROM executions
            WHERE shard_id = $1
              AND namespace_id::text || '/' || workflow_id || '/' || run_id::text > $2
            ORDER BY namespace_id::text || '/' || workflow_id || '/' || run_id::text
            LIMIT $3
            "#,
        )
        .bind(shard_id)
        .bind(&after)
        .bind(page_size.max(1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let keys: Vec<WorkflowKey> = rows
            .into_iter()
            .map(|row| {
                WorkflowKey::new(
                    row.get("namespace_id"),
                    row.get::<String, _>("workflow_id"),
                    row.get("run_id"),
                )
            })
            .collect();
        let token = if keys.len() >= page_size.max(1) {
            keys.last().map(|k| k.to_string().into_bytes())
        } else {
            None
        };
        Ok((keys, token))
    }
}

// ============================================================================
// History tree
// ============================================================================

#[async_trait]
impl HistoryStore for PostgresStore {
    async fn append_history_nodes(&self, write: HistoryNodeWrite) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_history_nodes(&mut tx, std::slice::from_ref(&write)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_history_branch(
        &self,
        request: ReadHistoryBranchRequest,
    ) -> Result<ReadHistoryBranchResponse> {
        let info = BranchInfo::from_token(&request.branch_token)?;
        let start_after: i64 = match &request.next_page_token {
            Some(t) => serde_json::from_slice(t)?,
            None => i64::MIN,
        };

        let mut segments: Vec<(Uuid, i64, i64)> = info
            .ancestors
            .iter()
            .map(|r| (r.branch_id, r.begin_node_id, r.end_node_id))
            .collect();
        segments.push((info.branch_id, 0, i64::MAX));

        let mut nodes: Vec<HistoryNode> = Vec::new();
        for (branch_id, begin, end) in segments {
            let rows = sqlx::query(
                r#"
                SELECT DISTINCT ON (node_id) node_id, txn_id, events, encoding, event_count
                FROM history_nodes
                WHERE tree_id = $1 AND branch_id = $2
                  AND node_id >= $3 AND node_id < $4
                  AND node_id >= $5 AND node_id < $6
                  AND node_id > $7
                ORDER BY node_id, txn_id DESC
                "#,
            )
            .bind(info.tree_id)
            .bind(branch_id)
            .bind(begin)
            .bind(end)
            .bind(request.min_node_id)
            .bind(request.max_node_id)
            .bind(start_after)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                nodes.push(HistoryNode {
                    node_id: row.get("node_id"),
                    transaction_id: row.get("txn_id"),
                    events: Blob {
                        data: row.get("events"),
                        encoding: row.get("encoding"),
                    },
                    event_count: row.get("event_count"),
                });
            }
        }
        nodes.sort_by_key(|n| n.node_id);

        let page_size = request.page_size.max(1);
        let next_page_token = if nodes.len() > page_size {
            nodes.truncate(page_size);
            nodes
                .last()
                .map(|n| serde_json::to_vec(&n.node_id))
                .transpose()?
        } else {
            None
        };
        Ok(ReadHistoryBranchResponse {
            nodes,
            next_page_token,
        })
    }

    async fn fork_history_branch(&self, source: &[u8], fork_node_id: i64) -> Result<Vec<u8>> {
        let info = BranchInfo::from_token(source)?;
        let mut ancestors = info.ancestors.clone();
        ancestors.retain(|r| r.begin_node_id < fork_node_id);
        if let Some(last) = ancestors.last_mut() {
            last.end_node_id = last.end_node_id.min(fork_node_id);
        }
        ancestors.push(BranchRange {
            branch_id: info.branch_id,
            begin_node_id: ancestors.last().map(|r| r.end_node_id).unwrap_or(1),
            end_node_id: fork_node_id,
        });
        let forked = BranchInfo {
            tree_id: info.tree_id,
            branch_id: Uuid::new_v4(),
            ancestors,
        };
        Ok(forked.to_token()?)
    }

    async fn delete_history_branch(&self, branch_token: &[u8]) -> Result<()> {
        let info = BranchInfo::from_token(branch_token)?;
        sqlx::query("DELETE FROM history_nodes WHERE tree_id = $1 AND branch_id = $2")
            .bind(info.tree_id)
            .bind(info.branch_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn trim_history_branch(
        &self,
        branch_token: &[u8],
        node_id: i64,
        transaction_id: i64,
    ) -> Result<()> {
        let info = BranchInfo::from_token(branch_token)?;
        sqlx::query(
            r#"
            DELETE FROM history_nodes
            WHERE tree_id = $1 AND branch_id = $2
              AND (node_id > $3 OR (node_id = $3 AND txn_id > $4))
            "#,
        )
        .bind(info.tree_id)
        .bind(info.branch_id)
        .bind(node_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// History tasks
// ============================================================================

#[async_trait]
impl TaskStore for PostgresStore {
    async fn add_history_tasks(
        &self,
        shard_id: i32,
        range_id: i64,
        tasks: Vec<Task>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_shard(&mut tx, shard_id, range_id).await?;
        Self::insert_history_tasks(&mut tx, shard_id, &tasks).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_history_tasks(
        &self,
        request: GetHistoryTasksRequest,
    ) -> Result<GetHistoryTasksResponse> {
        let start: TaskKey = match &request.next_page_token {
            Some(t) => serde_json::from_slice(t)?,
            None => request.inclusive_min_key,
        };
        let batch = request.batch_size.max(1) as i64;
        let rows = sqlx::query(
            r#"
            SELECT task FROM history_tasks
            WHERE shard_id = $1 AND category = $2
              AND (fire_time, task_id) >= ($3, $4)
              AND (fire_time, task_id) < ($5, $6)
            ORDER BY fire_time, task_id
            LIMIT $7
            "#,
        )
        .bind(request.shard_id)
        .bind(request.category.to_string())
        .bind(start.fire_time)
        .bind(start.task_id)
        .bind(request.exclusive_max_key.fire_time)
        .bind(request.exclusive_max_key.task_id)
        .bind(batch + 1)
        .fetch_all(&self.pool)
        .await?;

        let mut tasks: Vec<Task> = rows
            .into_iter()
            .map(|row| serde_json::from_value(row.get("task")))
            .collect::<std::result::Result<_, _>>()?;
        let next_page_token = if tasks.len() as i64 > batch {
            tasks.truncate(batch as usize);
            tasks
                .last()
                .map(|t| serde_json::to_vec(&t.key.next()))
                .transpose()?
        } else {
            None
        };
        Ok(GetHistoryTasksResponse {
            tasks,
            next_page_token,
        })
    }

    async fn complete_history_task(
        &self,
        shard_id: i32,
        category: TaskCategory,
        key: TaskKey,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM history_tasks
            WHERE shard_id = $1 AND category = $2 AND fire_time = $3 AND task_id = $4
            "#,
        )
        .bind(shard_id)
        .bind(category.to_string())
        .bind(key.fire_time)
        .bind(key.task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn range_complete_history_tasks(
        &self,
        shard_id: i32,
        category: TaskCategory,
        inclusive_min_key: TaskKey,
        exclusive_max_key: TaskKey,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM history_tasks
            WHERE shard_id = $1 AND category = $2
              AND (fire_time, task_id) >= ($3, $4)
              AND (fire_time, task_id) < ($5, $6)
            "#,
        )
        .bind(shard_id)
        .bind(category.to_string())
        .bind(inclusive_min_key.fire_time)
        .bind(inclusive_min_key.task_id)
        .bind(exclusive_max_key.fire_time)
        .bind(exclusive_max_key.task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// Queue v2
// ============================================================================

#[async_trait]
impl QueueV2Store for PostgresStore {
    async fn create_queue(&self, kind: QueueV2Kind, name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_v2_queues (kind, name, next_message_id)
            VALUES ($1, $2, 0)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(queue_kind_str(kind))
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue_message(&self, kind: QueueV2Kind, name: &str, payload: Blob) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE queue_v2_queues SET next_message_id = next_message_id + 1
            WHERE kind = $1 AND name = $2
            RETURNING next_message_id - 1 AS id
            "#,
        )
        .bind(queue_kind_str(kind))
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("queue '{name}'")))?;
        let id: i64 = row.get("id");

        sqlx::query(
            r#"
            INSERT INTO queue_v2_messages (kind, name, message_id, payload, encoding, enqueue_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(queue_kind_str(kind))
        .bind(name)
        .bind(id)
        .bind(&payload.data)
        .bind(&payload.encoding)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn read_messages(
        &self,
        kind: QueueV2Kind,
        name: &str,
        min_message_id: i64,
        page_size: usize,
    ) -> Result<ReadQueueMessagesResponse> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, payload, encoding, enqueue_time
            FROM queue_v2_messages
            WHERE kind = $1 AND name = $2 AND message_id >= $3
            ORDER BY message_id
            LIMIT $4
            "#,
        )
        .bind(queue_kind_str(kind))
        .bind(name)
        .bind(min_message_id)
        .bind(page_size.max(1) as i64)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .into_iter()
            .map(|row| QueueV2Message {
                id: row.get("message_id"),
                payload: Blob {
                    data: row.get("payload"),
                    encoding: row.get("encoding"),
                },
                enqueue_time: row.get("enqueue_time"),
            })
            .collect();
        Ok(ReadQueueMessagesResponse {
            messages,
            next_page_token: None,
        })
    }

    async fn range_delete_messages(
        &self,
        kind: QueueV2Kind,
        name: &str,
        inclusive_max_message_id: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM queue_v2_messages
            WHERE kind = $1 AND name = $2 AND message_id <= $3
            "#,
        )
        .bind(queue_kind_str(kind))
        .bind(name)
        .bind(inclusive_max_message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_queues(&self, kind: QueueV2Kind) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM queue_v2_queues WHERE kind = $1 ORDER BY name")
            .bind(queue_kind_str(kind))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("name")).collect())
    }
}

// ============================================================================
// Matching
// ============================================================================

#[async_trait]
impl MatchingTaskStore for PostgresStore {
    async fn lease_task_queue(&self, key: &TaskQueueKey, _owner: &str) -> Result<TaskQueueInfo> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO task_queues (namespace_id, name, task_type, partition, range_id, ack_level, updated_at)
            VALUES ($1, $2, $3, $4, 0, 0, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(key.namespace_id)
        .bind(&key.name)
        .bind(task_type_str(key.task_type))
        .bind(key.partition)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            UPDATE task_queues SET range_id = range_id + 1, updated_at = $5
            WHERE namespace_id = $1 AND name = $2 AND task_type = $3 AND partition = $4
            RETURNING range_id, ack_level, updated_at
            "#,
        )
        .bind(key.namespace_id)
        .bind(&key.name)
        .bind(task_type_str(key.task_type))
        .bind(key.partition)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(TaskQueueInfo {
            key: key.clone(),
            range_id: row.get("range_id"),
            ack_level: row.get("ack_level"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn update_task_queue(&self, info: TaskQueueInfo, expected_range_id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE task_queues SET range_id = $5, ack_level = $6, updated_at = $7
            WHERE namespace_id = $1 AND name = $2 AND task_type = $3 AND partition = $4
              AND range_id = $8
            "#,
        )
        .bind(info.key.namespace_id)
        .bind(&info.key.name)
        .bind(task_type_str(info.key.task_type))
        .bind(info.key.partition)
        .bind(info.range_id)
        .bind(info.ack_level)
        .bind(Utc::now())
        .bind(expected_range_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ConditionFailed(format!(
                "task queue {} range_id moved",
                info.key
            )));
        }
        Ok(())
    }

    async fn create_tasks(
        &self,
        key: &TaskQueueKey,
        range_id: i64,
        tasks: Vec<MatchingTask>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT range_id FROM task_queues
            WHERE namespace_id = $1 AND name = $2 AND task_type = $3 AND partition = $4
            FOR UPDATE
            "#,
        )
        .bind(key.namespace_id)
        .bind(&key.name)
        .bind(task_type_str(key.task_type))
        .bind(key.partition)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("task queue {key}")))?;
        if row.get::<i64, _>("range_id") != range_id {
            return Err(StoreError::ConditionFailed(format!(
                "task queue {key} range_id moved"
            )));
        }

        for task in &tasks {
            sqlx::query(
                r#"
                INSERT INTO matching_tasks (namespace_id, name, task_type, partition, task_id, task)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(key.namespace_id)
            .bind(&key.name)
            .bind(task_type_str(key.task_type))
            .bind(key.partition)
            .bind(task.task_id)
            .bind(serde_json::to_value(task)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_tasks(
        &self,
        key: &TaskQueueKey,
        exclusive_min_task_id: i64,
        inclusive_max_task_id: i64,
        batch_size: usize,
    ) -> Result<Vec<MatchingTask>> {
        let rows = sqlx::query(
            r#"
            SELECT task FROM matching_tasks
            WHERE namespace_id = $1 AND name = $2 AND task_type = $3 AND partition = $4
              AND task_id > $5 AND task_id <= $6
            ORDER BY task_id
            LIMIT $7
            "#,
        )
        .bind(key.namespace_id)
        .bind(&key.name)
        .bind(task_type_str(key.task_type))
        .bind(key.partition)
        .bind(exclusive_min_task_id)
        .bind(inclusive_max_task_id)
        .bind(batch_size.max(1) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| serde_json::from_value(row.get("task")).map_err(StoreError::from))
            .collect()
    }

    async fn complete_tasks_less_than(&self, key: &TaskQueueKey, ack_level: i64) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM matching_tasks
            WHERE namespace_id = $1 AND name = $2 AND task_type = $3 AND partition = $4
              AND task_id <= $5
            "#,
        )
        .bind(key.namespace_id)
        .bind(&key.name)
        .bind(task_type_str(key.task_type))
        .bind(key.partition)
        .bind(ack_level)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task_queue_user_data(
        &self,
        namespace_id: Uuid,
        name: &str,
        task_type: TaskQueueType,
    ) -> Result<TaskQueueUserData> {
        let row = sqlx::query(
            r#"
            SELECT version, data, encoding FROM task_queue_user_data
            WHERE namespace_id = $1 AND name = $2 AND task_type = $3
            "#,
        )
        .bind(namespace_id)
        .bind(name)
        .bind(task_type_str(task_type))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|row| TaskQueueUserData {
                version: row.get("version"),
                data: Blob {
                    data: row.get("data"),
                    encoding: row.get("encoding"),
                },
            })
            .unwrap_or_default())
    }

    async fn update_task_queue_user_data(
        &self,
        namespace_id: Uuid,
        name: &str,
        task_type: TaskQueueType,
        data: TaskQueueUserData,
        expected_version: i64,
    ) -> Result<()> {
        let result = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO task_queue_user_data (namespace_id, name, task_type, version, data, encoding)
                VALUES ($1, $2, $3, 1, $4, $5)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(namespace_id)
            .bind(name)
            .bind(task_type_str(task_type))
            .bind(&data.data.data)
            .bind(&data.data.encoding)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE task_queue_user_data
                SET version = version + 1, data = $4, encoding = $5
                WHERE namespace_id = $1 AND name = $2 AND task_type = $3 AND version = $6
                "#,
            )
            .bind(namespace_id)
            .bind(name)
            .bind(task_type_str(task_type))
            .bind(&data.data.data)
            .bind(&data.data.encoding)
            .bind(expected_version)
            .execute(&self.pool)
            .await?
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::ConditionFailed(format!(
                "task queue user data for '{name}' version moved"
            )));
        }
        Ok(())
    }
}
