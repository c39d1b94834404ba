// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Weft Replication - cross-cluster task streams
//!
//! Every `(source shard, target cluster)` pair runs a replication stream,
//! split into a high and a low priority tier when tiered processing is
//! enabled. The send side pulls tasks from the shard's replication queue
//! cursor under a per-tier QPS budget and emits periodic sync-status and
//! keep-alive frames; the receive side applies tasks with bounded in-flight
//! work and acks the highest contiguously applied task id, which lets the
//! sender trim its queue.
//!
//! When an incoming task references events the receiver doesn't have yet, it
//! requests a bounded resend; the progress cache deduplicates those
//! requests. Tasks that keep failing to apply land in a per-source-cluster
//! dead-letter queue with enough metadata for manual replay.
//!
//! Namespace metadata mutations ride a dedicated queue; the applier merges
//! them into the local metadata store with last-writer-wins ordering by
//! failover version.

/// Replication configuration.
pub mod config;

/// Replication error type.
pub mod error;

/// Stream messages, sender and receiver.
pub mod stream;

/// Resend protocol and progress cache.
pub mod resend;

/// Dead-letter queue for failed replication tasks.
pub mod dlq;

/// Namespace metadata replication: publisher and applier.
pub mod namespace_replication;

pub use error::ReplicationError;
