// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The matcher: pairing tasks with waiting pollers.
//!
//! Pollers park in a FIFO of rendezvous channels. A sync-match hands an
//! incoming task to the first compatible waiting poller without touching
//! persistence; backlog tasks are offered the same way. A poller whose
//! versioning capability doesn't match a task's assigned build id is
//! skipped, not failed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use weft_persistence::types::MatchingTask;

use crate::error::{MatchingError, Result};

/// How a matched task reached the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Directly from an add-task call; nothing was persisted.
    Sync,
    /// From the spooled backlog.
    Backlog,
}

/// A task delivered to a poller.
#[derive(Debug)]
pub struct MatchedTask {
    /// The task.
    pub task: MatchingTask,
    /// How it was matched.
    pub kind: MatchKind,
}

struct WaitingPoller {
    /// Build id the poller serves; `None` accepts anything unversioned.
    build_id: Option<String>,
    sender: oneshot::Sender<MatchedTask>,
    parked_at: Instant,
}

impl WaitingPoller {
    fn accepts(&self, task: &MatchingTask) -> bool {
        match (&task.assigned_build_id, &self.build_id) {
            (None, _) => true,
            (Some(required), Some(offered)) => required == offered,
            (Some(_), None) => false,
        }
    }
}

/// The per-partition matcher.
#[derive(Default)]
pub struct Matcher {
    pollers: Mutex<VecDeque<WaitingPoller>>,
}

impl Matcher {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of parked pollers.
    pub fn waiting_pollers(&self) -> usize {
        let mut pollers = self.pollers.lock();
        pollers.retain(|p| !p.sender.is_closed());
        pollers.len()
    }

    /// Age of the longest-parked poller, if any.
    pub fn oldest_poller_wait(&self) -> Option<Duration> {
        let pollers = self.pollers.lock();
        pollers.front().map(|p| p.parked_at.elapsed())
    }

    /// Offer a task to a waiting poller. Returns the task back when no
    /// compatible poller is parked.
    pub fn offer(&self, task: MatchingTask, kind: MatchKind) -> Option<MatchingTask> {
        let mut pollers = self.pollers.lock();
        let mut index = None;
        for (i, poller) in pollers.iter().enumerate() {
            if poller.sender.is_closed() {
                continue;
            }
            if poller.accepts(&task) {
                index = Some(i);
                break;
            }
        }
        let Some(poller) = index.and_then(|i| pollers.remove(i)) else {
            return Some(task);
        };
        match poller.sender.send(MatchedTask { task, kind }) {
            Ok(()) => {
                debug!("task matched to waiting poller");
                None
            }
            // the poller gave up between the check and the send
            Err(matched) => Some(matched.task),
        }
    }

    /// Park as a poller and wait for a task up to `timeout`.
    pub async fn poll(&self, build_id: Option<String>, timeout: Duration) -> Result<MatchedTask> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut pollers = self.pollers.lock();
            pollers.retain(|p| !p.sender.is_closed());
            pollers.push_back(WaitingPoller {
                build_id,
                sender,
                parked_at: Instant::now(),
            });
        }
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(matched)) => Ok(matched),
            Ok(Err(_)) => Err(MatchingError::Unloaded),
            Err(_) => Err(MatchingError::PollTimeout),
        }
    }
}
