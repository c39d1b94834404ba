// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker versioning.
//!
//! A task-queue family carries an ordered list of **assignment rules** (pick
//! a build id for new work at insert time, optionally ramped) and a set of
//! **redirect rules** (move existing work along a build-id chain). Deleted
//! rules keep tombstones for a retention period so in-flight workers drain
//! before the rule disappears.
//!
//! **Worker deployments** extend this: a deployment version is `Draining`
//! while pinned workflows remain open, and becomes `Drained` only after a
//! visibility check past the staleness grace period reports none.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MatchingError, Result};

/// One assignment rule: new work rolls against `ramp_percentage` and lands
/// on `target_build_id` when admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRule {
    /// Build id new work is assigned to.
    pub target_build_id: String,
    /// Percentage of new work admitted, `(0, 100]`.
    pub ramp_percentage: f64,
    /// When the rule was created.
    pub create_time: DateTime<Utc>,
    /// Tombstone time; set when deleted.
    pub delete_time: Option<DateTime<Utc>>,
}

/// One redirect rule: existing work on `source_build_id` moves toward
/// `target_build_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedirectRule {
    /// Chain source.
    pub source_build_id: String,
    /// Chain target.
    pub target_build_id: String,
    /// When the rule was created.
    pub create_time: DateTime<Utc>,
    /// Tombstone time; set when deleted.
    pub delete_time: Option<DateTime<Utc>>,
}

/// Versioning rules of one task-queue family. Persisted as task-queue user
/// data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersioningData {
    /// Ordered assignment rules; first admitting rule wins.
    pub assignment_rules: Vec<AssignmentRule>,
    /// Redirect rules; at most one live rule per source.
    pub redirect_rules: Vec<RedirectRule>,
}

/// Limits applied to rule mutation.
#[derive(Debug, Clone, Copy)]
pub struct RuleLimits {
    /// Maximum live assignment rules.
    pub max_assignment_rules: usize,
    /// Maximum live redirect rules.
    pub max_redirect_rules: usize,
    /// Maximum redirect chain length.
    pub max_chain: usize,
}

impl VersioningData {
    fn live_assignment_rules(&self) -> impl Iterator<Item = &AssignmentRule> {
        self.assignment_rules.iter().filter(|r| r.delete_time.is_none())
    }

    fn live_redirect_rules(&self) -> impl Iterator<Item = &RedirectRule> {
        self.redirect_rules.iter().filter(|r| r.delete_time.is_none())
    }

    /// Insert an assignment rule at `index` among the live rules.
    pub fn insert_assignment_rule(
        &mut self,
        rule: AssignmentRule,
        index: usize,
        limits: RuleLimits,
    ) -> Result<()> {
        if !(rule.ramp_percentage > 0.0 && rule.ramp_percentage <= 100.0) {
            return Err(MatchingError::InvalidRule(
                "ramp percentage must be in (0, 100]".into(),
            ));
        }
        if self.live_assignment_rules().count() >= limits.max_assignment_rules {
            return Err(MatchingError::InvalidRule(format!(
                "assignment rules would exceed {}",
                limits.max_assignment_rules
            )));
        }
        let position = self
            .assignment_rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.delete_time.is_none())
            .map(|(i, _)| i)
            .nth(index)
            .unwrap_or(self.assignment_rules.len());
        self.assignment_rules.insert(position, rule);
        Ok(())
    }

    /// Tombstone the live assignment rule at `index`.
    pub fn delete_assignment_rule(&mut self, index: usize, now: DateTime<Utc>) -> Result<()> {
        let position = self
            .assignment_rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.delete_time.is_none())
            .map(|(i, _)| i)
            .nth(index)
            .ok_or_else(|| MatchingError::InvalidRule(format!("no assignment rule at {index}")))?;
        self.assignment_rules[position].delete_time = Some(now);
        Ok(())
    }

    /// Insert a redirect rule, validating source uniqueness, chain length
    /// and acyclicity over the live set.
    pub fn insert_redirect_rule(&mut self, rule: RedirectRule, limits: RuleLimits) -> Result<()> {
        if rule.source_build_id == rule.target_build_id {
            return Err(MatchingError::InvalidRule(
                "redirect source equals target".into(),
            ));
        }
        if self.live_redirect_rules().count() >= limits.max_redirect_rules {
            return Err(MatchingError::InvalidRule(format!(
                "redirect rules would exceed {}",
                limits.max_redirect_rules
            )));
        }
        if self
            .live_redirect_rules()
            .any(|r| r.source_build_id == rule.source_build_id)
        {
            return Err(MatchingError::InvalidRule(format!(
                "a live redirect already exists for '{}'",
                rule.source_build_id
            )));
        }
        self.redirect_rules.push(rule);

        // validate the whole live graph: chains bounded and acyclic
        let sources: Vec<String> = self
            .live_redirect_rules()
            .map(|r| r.source_build_id.clone())
            .collect();
        for source in sources {
            if let Err(e) = self.follow_redirects(&source, limits.max_chain) {
                self.redirect_rules.pop();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Tombstone the live redirect rule for `source`.
    pub fn delete_redirect_rule(&mut self, source: &str, now: DateTime<Utc>) -> Result<()> {
        let rule = self
            .redirect_rules
            .iter_mut()
            .find(|r| r.delete_time.is_none() && r.source_build_id == source)
            .ok_or_else(|| {
                MatchingError::InvalidRule(format!("no live redirect rule for '{source}'"))
            })?;
        rule.delete_time = Some(now);
        Ok(())
    }

    /// Drop tombstones older than `retention`.
    pub fn purge_tombstones(&mut self, now: DateTime<Utc>, retention: Duration) {
        let cutoff = now - chrono::Duration::from_std(retention).unwrap_or_default();
        self.assignment_rules
            .retain(|r| r.delete_time.is_none_or(|t| t > cutoff));
        self.redirect_rules
            .retain(|r| r.delete_time.is_none_or(|t| t > cutoff));
    }

    /// Pick a build id for new work. `roll` is a uniform sample in
    /// `[0, 100)`; the first live rule whose ramp admits it wins.
    pub fn assign_build_id(&self, roll: f64) -> Option<String> {
        for rule in self.live_assignment_rules() {
            if roll < rule.ramp_percentage {
                return Some(rule.target_build_id.clone());
            }
        }
        None
    }

    /// Follow redirect rules from `build_id` to the end of its chain.
    pub fn follow_redirects(&self, build_id: &str, max_chain: usize) -> Result<String> {
        let mut current = build_id.to_string();
        let mut seen: HashSet<String> = HashSet::from([current.clone()]);
        for _ in 0..max_chain {
            let next = self
                .live_redirect_rules()
                .find(|r| r.source_build_id == current)
                .map(|r| r.target_build_id.clone());
            match next {
                Some(next) => {
                    if !seen.insert(next.clone()) {
                        return Err(MatchingError::InvalidRule(format!(
                            "redirect cycle through '{next}'"
                        )));
                    }
                    current = next;
                }
                None => return Ok(current),
            }
        }
        // one more hop available means the chain exceeds the bound
        if self
            .live_redirect_rules()
            .any(|r| r.source_build_id == current)
        {
            return Err(MatchingError::InvalidRule(format!(
                "redirect chain from '{build_id}' exceeds {max_chain}"
            )));
        }
        Ok(current)
    }
}

// ============================================================================
// Worker deployments
// ============================================================================

/// Drainage status of a deployment version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainageStatus {
    /// Pinned workflows may still be open.
    Draining,
    /// No pinned workflows remain; the version can be retired.
    Drained,
}

/// One version of a worker deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentVersion {
    /// Version identifier (build id).
    pub version: String,
    /// Current drainage status.
    pub drainage_status: DrainageStatus,
    /// When draining began.
    pub draining_since: DateTime<Utc>,
}

impl DeploymentVersion {
    /// Begin draining a version at `now`.
    pub fn start_draining(version: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            version: version.into(),
            drainage_status: DrainageStatus::Draining,
            draining_since: now,
        }
    }

    /// Refresh the drainage status from a visibility check.
    ///
    /// `open_pinned_workflows` is the count visibility reported and
    /// `visibility_as_of` when that data was collected. Visibility lags
    /// writes, so data collected within `grace` of drain start is treated as
    /// stale and cannot complete the drain.
    pub fn refresh_drainage(
        &mut self,
        open_pinned_workflows: i64,
        visibility_as_of: DateTime<Utc>,
        grace: Duration,
    ) {
        if self.drainage_status == DrainageStatus::Drained {
            return;
        }
        if open_pinned_workflows > 0 {
            return;
        }
        let grace = chrono::Duration::from_std(grace).unwrap_or_default();
        if visibility_as_of >= self.draining_since + grace {
            self.drainage_status = DrainageStatus::Drained;
        }
    }
}
