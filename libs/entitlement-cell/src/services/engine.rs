use std::sync::Arc;

use chrono::{DateTime, Months, Utc};
use shared_config::AppConfig;
use shared_storage::KeyValueStore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::{
    ActivationOutcome, EntitlementError, EntitlementState, ExpiryCheck, DEFAULT_TRIAL_LIMIT,
};
use crate::services::verification::ActivationVerifier;

const KEY_IS_PREMIUM: &str = "isPremium";
const KEY_PREMIUM_TYPE: &str = "premiumType";
const KEY_EXPIRY_DATE: &str = "expiryDate";
const KEY_COUNT: &str = "prescriptionCount";
const KEY_LIMIT: &str = "prescriptionLimit";
const KEY_USED_CODES: &str = "usedCodes";
const KEY_PREMIUM_ACTIVATED_AT: &str = "premiumActivatedAt";
const KEY_TRIAL_ACTIVATED_AT: &str = "trialActivatedAt";

/// Gates every prescription-producing action behind remaining quota or
/// premium status, and owns the activation lifecycle. Mutators
/// serialize on a write lock and re-read persisted state inside it.
pub struct EntitlementService {
    store: Arc<dyn KeyValueStore>,
    verifier: ActivationVerifier,
    write_lock: Mutex<()>,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &AppConfig) -> Self {
        Self {
            store,
            verifier: ActivationVerifier::new(config),
            write_lock: Mutex::new(()),
        }
    }

    /// First-run seeding: fills missing keys with the trial defaults
    /// and normalizes a premium state carrying a finite limit.
    pub async fn initialize(&self) -> Result<EntitlementState, EntitlementError> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.read_state().await?;

        if state.is_premium && state.prescription_limit.is_some() {
            warn!("Premium state carried a finite limit; clearing it");
            state.prescription_limit = None;
        }

        self.write_state(&state).await?;
        debug!(
            "Entitlement initialized: premium={} count={} limit={:?}",
            state.is_premium, state.prescription_count, state.prescription_limit
        );
        Ok(state)
    }

    /// Current state with read defaults applied. Read-only.
    pub async fn snapshot(&self) -> Result<EntitlementState, EntitlementError> {
        self.read_state().await
    }

    pub async fn can_consume(&self) -> Result<bool, EntitlementError> {
        Ok(self.read_state().await?.can_consume())
    }

    /// Remaining quota; `None` when unlimited.
    pub async fn remaining(&self) -> Result<Option<u32>, EntitlementError> {
        Ok(self.read_state().await?.remaining())
    }

    /// Consume one entitlement. Premium accounts pass through without
    /// mutation; trial accounts increment the counter or fail with
    /// `LimitExceeded`, leaving the count untouched.
    pub async fn consume(&self) -> Result<u32, EntitlementError> {
        let _guard = self.write_lock.lock().await;
        let state = self.read_state().await?;

        if state.is_premium {
            return Ok(state.prescription_count);
        }

        let limit = state.prescription_limit.unwrap_or(DEFAULT_TRIAL_LIMIT);
        if state.prescription_count >= limit {
            return Err(EntitlementError::LimitExceeded {
                count: state.prescription_count,
                limit,
            });
        }

        let new_count = state.prescription_count + 1;
        self.store.set(KEY_COUNT, &new_count).await?;
        debug!("Consumed entitlement: {}/{}", new_count, limit);
        Ok(new_count)
    }

    /// Redeem an activation code against the remote verifier and apply
    /// the granted plan.
    pub async fn redeem_code(&self, code: &str) -> Result<ActivationOutcome, EntitlementError> {
        self.redeem_code_at(code, Utc::now()).await
    }

    pub async fn redeem_code_at(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<ActivationOutcome, EntitlementError> {
        let code = code.trim().to_uppercase();
        let descriptor = self.verifier.verify(&code).await?;

        if !descriptor.success {
            return Err(EntitlementError::InvalidCode {
                message: descriptor
                    .message
                    .unwrap_or_else(|| "Invalid activation code.".to_string()),
            });
        }

        let plan = descriptor.plan_type.unwrap_or_default();

        let _guard = self.write_lock.lock().await;
        let mut state = self.read_state().await?;
        // Redeemed codes are recorded for audit; replay is not blocked
        // here, callers wanting single-use enforce it from `usedCodes`.
        state.used_codes.push(code.clone());

        let outcome = if plan == "Lifetime" {
            state.is_premium = true;
            state.premium_type = Some(plan);
            state.expiry_date = None;
            state.prescription_count = 0;
            state.prescription_limit = None;
            state.premium_activated_at = Some(now);
            ActivationOutcome::Lifetime
        } else if plan.contains("Month") || plan.contains("Year") {
            let months = months_granted(&plan);
            let base = match state.expiry_date {
                Some(expiry) if state.is_premium && expiry > now => expiry,
                _ => now,
            };
            let expires_at = add_months(base, months);

            state.is_premium = true;
            state.premium_type = Some(plan.clone());
            state.expiry_date = Some(expires_at);
            state.prescription_count = 0;
            state.prescription_limit = None;
            state.premium_activated_at = Some(now);
            ActivationOutcome::Subscription { plan, expires_at }
        } else if plan.contains("Trial") || leading_number(&plan).is_some() {
            let added = first_number(&plan).unwrap_or(10);
            let new_limit = state.prescription_limit.unwrap_or(DEFAULT_TRIAL_LIMIT) + added;

            state.is_premium = false;
            state.prescription_limit = Some(new_limit);
            state.trial_activated_at = Some(now);
            ActivationOutcome::TrialExtended { added, new_limit }
        } else {
            state.is_premium = true;
            state.premium_type = Some(plan.clone());
            state.expiry_date = None;
            state.prescription_count = 0;
            state.prescription_limit = None;
            state.premium_activated_at = Some(now);
            ActivationOutcome::Premium { plan }
        };

        self.write_state(&state).await?;
        info!("Activation code redeemed: {:?}", outcome);
        Ok(outcome)
    }

    /// Revert a lapsed subscription to the default trial. Idempotent;
    /// safe to call on every status render.
    pub async fn check_and_reconcile_expiry(&self) -> Result<ExpiryCheck, EntitlementError> {
        self.check_and_reconcile_expiry_at(Utc::now()).await
    }

    pub async fn check_and_reconcile_expiry_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ExpiryCheck, EntitlementError> {
        let _guard = self.write_lock.lock().await;
        let state = self.read_state().await?;

        let expired = state.is_premium
            && matches!(state.expiry_date, Some(expiry) if now > expiry);
        if expired {
            let reverted = EntitlementState {
                is_premium: false,
                premium_type: None,
                expiry_date: None,
                prescription_count: 0,
                prescription_limit: Some(DEFAULT_TRIAL_LIMIT),
                ..state
            };
            self.write_state(&reverted).await?;
            warn!("Premium subscription expired; reverted to trial");
        }

        Ok(ExpiryCheck { expired })
    }

    async fn read_state(&self) -> Result<EntitlementState, EntitlementError> {
        let is_premium = self
            .store
            .get::<Option<bool>>(KEY_IS_PREMIUM)
            .await?
            .flatten()
            .unwrap_or(false);
        // A stored null limit is meaningful (unlimited); a missing key
        // falls back to the trial default.
        let prescription_limit = match self.store.get::<Option<u32>>(KEY_LIMIT).await? {
            None => Some(DEFAULT_TRIAL_LIMIT),
            Some(limit) => limit,
        };
        let prescription_count = self
            .store
            .get::<Option<u32>>(KEY_COUNT)
            .await?
            .flatten()
            .unwrap_or(0);
        let premium_type = self
            .store
            .get::<Option<String>>(KEY_PREMIUM_TYPE)
            .await?
            .flatten();
        let expiry_date = self
            .store
            .get::<Option<DateTime<Utc>>>(KEY_EXPIRY_DATE)
            .await?
            .flatten();
        let used_codes = self
            .store
            .get::<Vec<String>>(KEY_USED_CODES)
            .await?
            .unwrap_or_default();
        let premium_activated_at = self
            .store
            .get::<Option<DateTime<Utc>>>(KEY_PREMIUM_ACTIVATED_AT)
            .await?
            .flatten();
        let trial_activated_at = self
            .store
            .get::<Option<DateTime<Utc>>>(KEY_TRIAL_ACTIVATED_AT)
            .await?
            .flatten();

        Ok(EntitlementState {
            is_premium,
            premium_type,
            expiry_date,
            prescription_count,
            prescription_limit,
            used_codes,
            premium_activated_at,
            trial_activated_at,
        })
    }

    async fn write_state(&self, state: &EntitlementState) -> Result<(), EntitlementError> {
        self.store.set(KEY_IS_PREMIUM, &state.is_premium).await?;
        self.store
            .set(KEY_PREMIUM_TYPE, &state.premium_type)
            .await?;
        self.store.set(KEY_EXPIRY_DATE, &state.expiry_date).await?;
        self.store.set(KEY_COUNT, &state.prescription_count).await?;
        self.store
            .set(KEY_LIMIT, &state.prescription_limit)
            .await?;
        self.store.set(KEY_USED_CODES, &state.used_codes).await?;
        self.store
            .set(KEY_PREMIUM_ACTIVATED_AT, &state.premium_activated_at)
            .await?;
        self.store
            .set(KEY_TRIAL_ACTIVATED_AT, &state.trial_activated_at)
            .await?;
        Ok(())
    }
}

/// Months granted by a time-based plan label, e.g. "6 Month" or
/// "1 Year". A missing leading number means one unit.
fn months_granted(plan: &str) -> u32 {
    let units = leading_number(plan).unwrap_or(1);
    if plan.contains("Year") {
        units * 12
    } else {
        units
    }
}

/// Calendar-month addition: month-of-year arithmetic, clamped at
/// month-end, never a fixed day count.
fn add_months(base: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    base.checked_add_months(Months::new(months)).unwrap_or(base)
}

fn leading_number(label: &str) -> Option<u32> {
    let digits: String = label
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn first_number(label: &str) -> Option<u32> {
    let mut digits = String::new();
    for c in label.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else if !digits.is_empty() {
            break;
        }
    }
    digits.parse().ok()
}
