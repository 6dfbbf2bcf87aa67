// Optimistic mutation lifecycle - pure transitions, no side effects
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::PostId;

/// Idle -> Pending -> {Committed, RolledBack}
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MutationState {
    /// Not started yet
    Idle,

    /// Applied locally, waiting for the remote
    Pending { started_at: DateTime<Utc> },

    /// Remote accepted; local entry replaced with the authoritative one
    Committed {
        post_id: PostId,
        committed_at: DateTime<Utc>,
    },

    /// Remote refused; local change reverted
    RolledBack {
        reason: String,
        rolled_back_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot {action} from {from} state")]
pub struct InvalidTransition {
    pub action: &'static str,
    pub from: &'static str,
}

impl MutationState {
    pub fn state_name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Pending { .. } => "Pending",
            Self::Committed { .. } => "Committed",
            Self::RolledBack { .. } => "RolledBack",
        }
    }

    /// Transition: Idle → Pending
    pub fn begin(self, now: DateTime<Utc>) -> Result<Self, InvalidTransition> {
        match self {
            Self::Idle => Ok(Self::Pending { started_at: now }),
            other => Err(other.invalid("begin")),
        }
    }

    /// Transition: Pending → Committed
    pub fn commit(self, post_id: PostId, now: DateTime<Utc>) -> Result<Self, InvalidTransition> {
        match self {
            Self::Pending { .. } => Ok(Self::Committed {
                post_id,
                committed_at: now,
            }),
            other => Err(other.invalid("commit")),
        }
    }

    /// Transition: Pending → RolledBack
    pub fn roll_back(
        self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, InvalidTransition> {
        match self {
            Self::Pending { .. } => Ok(Self::RolledBack {
                reason: reason.into(),
                rolled_back_at: now,
            }),
            other => Err(other.invalid("roll back")),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed { .. } | Self::RolledBack { .. })
    }

    fn invalid(&self, action: &'static str) -> InvalidTransition {
        InvalidTransition {
            action,
            from: self.state_name(),
        }
    }
}
