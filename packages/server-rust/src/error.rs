//! Coordinator error taxonomy.
//!
//! Every operator-facing operation resolves to one of four outcomes:
//!
//! - [`CoordError::Validation`]: the request was rejected before any state
//!   was touched.
//! - [`CoordError::Conflict`]: the request was understood but refused by the
//!   current cluster state. Conflicts carry a typed [`Conflict`] payload so
//!   callers can react programmatically instead of parsing messages.
//! - [`CoordError::Unreachable`]: a remote process (storage server, proxy,
//!   watchdog) did not answer and the operation could not proceed.
//! - [`CoordError::Fatal`]: an internal invariant broke. The topology is not
//!   modified past the point of failure; operator attention is required.

use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// Typed refusal reasons for operations that collide with live state.
///
/// Serialized into error responses under the `conflict` key, tagged by
/// `type`, so admin tooling can branch without string matching.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all_fields = "camelCase")]
pub enum Conflict {
    /// The topology version moved between read and write.
    #[error("topology version moved from {expected} to {actual}")]
    StaleWrite { expected: u64, actual: u64 },

    /// Creating something that already exists. Not fatal: the caller's
    /// intent is already satisfied or satisfiable by a different resource id.
    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    /// The slot already carries a migration action.
    #[error("slot {slot} already has a migration scheduled")]
    SlotBusy { slot: usize },

    /// The group is mid-promotion or otherwise unable to take the request.
    #[error("group {group} is not ready for this operation")]
    GroupNotReady { group: u32 },

    /// The slot's migration has passed the point of no return.
    #[error("slot {slot} is already migrating and cannot be cancelled")]
    MigrationInProgress { slot: usize },

    /// Slot migrations are executing somewhere in the cluster.
    #[error("{active} slot migration(s) currently running")]
    MigrationsRunning { active: usize },

    /// The group still holds servers or slots.
    #[error("group {group} is not empty")]
    GroupNotEmpty { group: u32 },

    /// The server address is already a member of some group.
    #[error("server {server} already belongs to group {group}")]
    ServerAlreadyAssigned { server: String, group: u32 },

    /// The server already has an unfinished replication sync action.
    #[error("server {server} has a replication action in flight")]
    ActionPending { server: String },

    /// Promotion refused: the watchdogs observe a different live master than
    /// the topology records. Carries both views so the operator can decide
    /// whether to retry with force.
    #[error("group {group}: recorded master and observed master disagree")]
    Promote {
        group: u32,
        logical_master: Option<String>,
        observed_real_master: Option<String>,
    },

    /// The expansion backup step cannot be skipped for this plan.
    #[error("plan {plan}: destination group has replicas, backup step is required")]
    BackupRequired { plan: u64 },

    /// An expansion step was invoked out of order.
    #[error("plan {plan}: step requires {expected}, plan is at {state}")]
    PlanStep {
        plan: u64,
        expected: String,
        state: String,
    },

    /// The expansion plan has work in flight and cannot be touched.
    #[error("plan {plan} is still running")]
    PlanBusy { plan: u64 },
}

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CoordError {
    /// Malformed or out-of-range request. Nothing was modified.
    #[error("{0}")]
    Validation(String),

    /// Refused by current cluster state. Nothing was modified.
    #[error(transparent)]
    Conflict(#[from] Conflict),

    /// A required remote did not answer.
    #[error("{target} unreachable: {detail}")]
    Unreachable { target: String, detail: String },

    /// Broken invariant or unavailable store.
    #[error("{0}")]
    Fatal(String),
}

impl CoordError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn unreachable(target: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Unreachable {
            target: target.into(),
            detail: err.to_string(),
        }
    }

    /// Short machine-readable class, used as the `error` key in responses.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::Unreachable { .. } => "unreachable",
            Self::Fatal(_) => "fatal",
        }
    }

    /// HTTP status the admin API answers with for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The typed conflict payload, when this is a conflict.
    #[must_use]
    pub fn conflict(&self) -> Option<&Conflict> {
        match self {
            Self::Conflict(c) => Some(c),
            _ => None,
        }
    }
}

impl From<StoreError> for CoordError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StaleWrite { expected, actual } => {
                Self::Conflict(Conflict::StaleWrite { expected, actual })
            }
            StoreError::Corrupt(detail) => Self::Fatal(format!("store payload corrupt: {detail}")),
            StoreError::Io(err) => Self::Fatal(format!("store unavailable: {err}")),
        }
    }
}
