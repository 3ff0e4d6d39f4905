use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_storage::StorageError;
use thiserror::Error;

/// Limit seeded on first run and restored when a subscription lapses.
pub const DEFAULT_TRIAL_LIMIT: u32 = 2;

/// Entitlement state as assembled from its persisted keys. A `None`
/// limit means unlimited, which is only trusted when `is_premium`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitlementState {
    pub is_premium: bool,
    pub premium_type: Option<String>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub prescription_count: u32,
    pub prescription_limit: Option<u32>,
    pub used_codes: Vec<String>,
    pub premium_activated_at: Option<DateTime<Utc>>,
    pub trial_activated_at: Option<DateTime<Utc>>,
}

impl EntitlementState {
    /// The limit actually enforced: premium is unlimited, and a stored
    /// null limit while non-premium falls back to the trial default.
    pub fn effective_limit(&self) -> Option<u32> {
        if self.is_premium {
            None
        } else {
            Some(self.prescription_limit.unwrap_or(DEFAULT_TRIAL_LIMIT))
        }
    }

    pub fn can_consume(&self) -> bool {
        match self.effective_limit() {
            None => true,
            Some(limit) => self.prescription_count < limit,
        }
    }

    /// Remaining quota; `None` when unlimited.
    pub fn remaining(&self) -> Option<u32> {
        self.effective_limit()
            .map(|limit| limit.saturating_sub(self.prescription_count))
    }
}

/// Wire shape returned by the remote code-verification endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanDescriptor {
    pub success: bool,
    #[serde(rename = "type", default)]
    pub plan_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActivationOutcome {
    Lifetime,
    Subscription {
        plan: String,
        expires_at: DateTime<Utc>,
    },
    TrialExtended {
        added: u32,
        new_limit: u32,
    },
    /// A recognized premium plan with no expiry semantics of its own.
    Premium {
        plan: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryCheck {
    pub expired: bool,
}

#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("Prescription limit reached ({count}/{limit})")]
    LimitExceeded { count: u32, limit: u32 },

    /// The server examined the code and rejected it.
    #[error("Activation code rejected: {message}")]
    InvalidCode { message: String },

    /// The code could not be verified at all; never to be read as a
    /// definite rejection.
    #[error("Could not verify activation code: {message}")]
    Verification { message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}
