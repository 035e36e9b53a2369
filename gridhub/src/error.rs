/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for the hub core.
//!
//! One taxonomy, [`HubError`], covers every operation surface; each variant
//! maps 1:1 onto a disposition:
//!
//! | Variant | Disposition |
//! |---|---|
//! | `Validation` | surfaced to caller; no state change |
//! | `NotFound` | surfaced to caller; no state change |
//! | `Conflict` / `AlreadySubmitted` | surfaced to caller; no state change |
//! | `Transient` | retried up to [`crate::store::TRANSIENT_RETRIES`] inside the store helper, then surfaced; partial work rolled back |
//! | `Fatal` | host decides: halt or decline new work |
//!
//! Scheduling pressure (no eligible node) is **not** an error — it is recorded
//! as task staleness and retried on the next tick. Event-bus failures are
//! logged and swallowed at the publish site. The core never panics on data it
//! produced itself.
//!
//! **Do not** collapse these into `anyhow::Error` in library paths — the
//! structured variants are intentional; `anyhow` is for the binary boundary.

use thiserror::Error;

use crate::model::{NodeId, TaskId};
use crate::store::StoreError;

/// Top-level error type of the orchestration core.
#[derive(Debug, Error)]
pub enum HubError {
    /// Malformed input at a port boundary.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// An id lookup missed.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The operation contradicts existing state (duplicate registration,
    /// duplicate assignment, …).
    #[error("{0}")]
    Conflict(String),

    /// A second result submission for an assignment that already completed.
    ///
    /// Kept separate from [`HubError::Conflict`] because callers key the
    /// at-most-once acceptance contract on it.
    #[error("result for task {task} on node {node} was already submitted")]
    AlreadySubmitted { task: TaskId, node: NodeId },

    /// A store failure that may clear on retry (lock contention, deadline).
    #[error("transient store failure: {0}")]
    Transient(#[source] StoreError),

    /// The store is unreachable or the configuration is unusable.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HubError {
    /// Shorthand for a [`HubError::Validation`] with an owned reason.
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        HubError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`HubError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        HubError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for HubError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateAssignment { task, node } => HubError::Conflict(format!(
                "assignment for task {task} on node {node} already exists"
            )),
            StoreError::Busy(_) | StoreError::DeadlineExceeded => HubError::Transient(err),
            StoreError::Unavailable(reason) => HubError::Fatal(reason),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
