// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication seam for namespace metadata.
//!
//! The admin handler publishes a [`NamespaceReplicationMessage`] for every
//! replicated mutation of a global namespace. The stream side (publisher
//! implementation and the peer-cluster applier) lives in the replication
//! crate; a [`NoopNamespaceReplicator`] serves single-cluster deployments
//! and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use weft_persistence::types::NamespaceRecord;

use crate::error::Result;

/// The kind of namespace mutation being replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceOperation {
    /// Namespace creation.
    Create,
    /// Any replicated update (config, failover, promote, state change).
    Update,
    /// Namespace deletion.
    Delete,
}

/// One namespace metadata mutation, shipped to peer clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceReplicationMessage {
    /// The operation.
    pub operation: NamespaceOperation,
    /// The record after the mutation.
    pub record: NamespaceRecord,
}

/// Publisher of namespace metadata mutations.
#[async_trait]
pub trait NamespaceReplicator: Send + Sync {
    /// Publish one mutation to the namespace replication queue.
    async fn publish(&self, message: NamespaceReplicationMessage) -> Result<()>;
}

/// Replicator that drops every message. Used by single-cluster deployments
/// and tests that don't assert on publication.
#[derive(Debug, Default)]
pub struct NoopNamespaceReplicator;

#[async_trait]
impl NamespaceReplicator for NoopNamespaceReplicator {
    async fn publish(&self, _message: NamespaceReplicationMessage) -> Result<()> {
        Ok(())
    }
}

/// Replicator that records every message, for tests that assert on the
/// publish path.
#[derive(Debug, Default)]
pub struct RecordingNamespaceReplicator {
    messages: parking_lot::Mutex<Vec<NamespaceReplicationMessage>>,
}

impl RecordingNamespaceReplicator {
    /// Messages published so far.
    pub fn messages(&self) -> Vec<NamespaceReplicationMessage> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl NamespaceReplicator for RecordingNamespaceReplicator {
    async fn publish(&self, message: NamespaceReplicationMessage) -> Result<()> {
        self.messages.lock().push(message);
        Ok(())
    }
}
