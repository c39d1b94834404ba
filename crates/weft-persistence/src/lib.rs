// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Weft Persistence - the narrow store interface
//!
//! Every durable read and write in the cluster goes through the traits in
//! [`store`]. The engine, matching and replication crates are written against
//! those traits only; driver choice is an assembly-time concern.
//!
//! Two implementations ship in this crate:
//!
//! - [`postgres::PostgresStore`]: the production driver, plain SQL over sqlx.
//! - [`memory::MemoryStore`]: a full-fidelity in-memory store, including CAS
//!   failure semantics, used by every crate's tests.
//!
//! # Failure taxonomy
//!
//! Store methods fail with [`error::StoreError`] kinds, not driver types.
//! Callers dispatch on the kind:
//!
//! | Kind | Caller policy |
//! |------|---------------|
//! | `NotFound` | map to domain error |
//! | `ConditionFailed` family | shed ownership or retry with fresh state |
//! | `AlreadyExists` | idempotency check or surface |
//! | `ShardOwnershipLost` | unload the shard |
//! | `ResourceExhausted` | backoff and retry |
//! | `Unavailable` / `Timeout` / `Internal` | bounded retry |

/// Store failure taxonomy.
pub mod error;

/// Records, requests and responses exchanged with the store.
pub mod types;

/// The store traits.
pub mod store;

/// In-memory store with full CAS semantics, for tests and embedded use.
pub mod memory;

/// Postgres store over sqlx.
pub mod postgres;

/// Embedded schema and migration runner for the Postgres store.
pub mod migrations;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    ExecutionStore, HistoryStore, MatchingTaskStore, MetadataStore, QueueV2Store, ShardStore,
    Store, TaskStore,
};
