// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Weft History - the shard-partitioned execution engine
//!
//! Workflows are statically partitioned across `num_history_shards` shards.
//! A shard is the unit of single-writer ownership: one process holds the
//! shard's range-id lease and serializes every mutation through it. This
//! crate owns:
//!
//! - [`shard`]: shard acquisition (range-id CAS), the per-shard context with
//!   its monotonic task-id allocator, and the host-level controller.
//! - [`mutable_state`]: the authoritative per-run record, version histories,
//!   transition history, and buffered-event bookkeeping.
//! - [`cache`]: the host-level LRU of mutable state with per-run locks.
//! - [`transaction`]: the workflow transaction write path (create / update /
//!   conflict-resolve) with history-node assembly, size statistics, the
//!   cross-region event-blob cache, and best-effort trim on conflict.
//! - [`queues`]: the per-category multi-cursor queues, their readers, the
//!   host task scheduler with retry and DLQ, and the outbound gate.
//! - [`standby`]: standby-cluster task validation with the two-tier
//!   resend/discard policy.

/// Engine configuration resolved against dynamic config.
pub mod config;

/// Engine error type.
pub mod error;

/// Shard ownership and the per-shard context.
pub mod shard;

/// Mutable state and its histories.
pub mod mutable_state;

/// Host-level mutable-state cache.
pub mod cache;

/// The workflow transaction write path.
pub mod transaction;

/// Internal task queues, readers, scheduler, DLQ.
pub mod queues;

/// Mutable-state rebuild for the admin surface.
pub mod rebuild;

/// Standby task validation.
pub mod standby;

pub use error::EngineError;
