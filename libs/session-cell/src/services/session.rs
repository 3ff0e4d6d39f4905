use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use entitlement_cell::{EntitlementError, EntitlementService, DEFAULT_TRIAL_LIMIT};
use history_cell::{HistoryRepository, PatientRecord, PriorPrescription};
use shared_config::AppConfig;
use shared_storage::{FileStore, KeyValueStore};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::models::{EditMode, PrescriptionDraft, SaveOutcome, SessionError};

#[derive(Debug, Default)]
struct SessionState {
    mode: EditMode,
    /// Prescriptions of the patient being edited, newest visit first.
    previous: Vec<PatientRecord>,
    selected: Option<usize>,
}

/// Transient form/edit state between UI collaborators and the core:
/// packages drafts into records, routes them through the entitlement
/// gate and into the repository.
pub struct FormSession {
    history: Arc<HistoryRepository>,
    entitlement: Arc<EntitlementService>,
    state: Mutex<SessionState>,
}

impl FormSession {
    pub fn new(history: Arc<HistoryRepository>, entitlement: Arc<EntitlementService>) -> Self {
        Self {
            history,
            entitlement,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Assemble the whole core over a file-backed store: the session,
    /// its repository and its entitlement engine share one store.
    pub fn from_config(config: &AppConfig) -> Self {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(config.data_dir.clone()));
        let history = Arc::new(HistoryRepository::new(store.clone()));
        let entitlement = Arc::new(EntitlementService::new(store, config));
        Self::new(history, entitlement)
    }

    /// Repository handle for listing/delete collaborators.
    pub fn history(&self) -> Arc<HistoryRepository> {
        self.history.clone()
    }

    /// Entitlement handle for settings/licensing collaborators.
    pub fn entitlement(&self) -> Arc<EntitlementService> {
        self.entitlement.clone()
    }

    pub async fn edit_mode(&self) -> EditMode {
        self.state.lock().await.mode
    }

    /// Open the record at `index` for demographics-only editing.
    pub async fn enter_patient_edit(&self, index: usize) {
        let mut state = self.state.lock().await;
        state.mode = EditMode::Patient { index };
        state.previous.clear();
        state.selected = None;
    }

    /// Open the record at `index` for prescription editing, loading
    /// the patient's previous prescriptions for selection.
    pub async fn enter_prescription_edit(
        &self,
        index: usize,
        mobile: &str,
    ) -> Result<Vec<PatientRecord>, SessionError> {
        let previous = if mobile.trim().is_empty() {
            Vec::new()
        } else {
            self.history.query_by_mobile(mobile).await?
        };

        let mut state = self.state.lock().await;
        state.mode = EditMode::Prescription { index };
        state.previous = previous.clone();
        state.selected = None;

        debug!(
            "Entered prescription edit: {} previous prescriptions",
            previous.len()
        );
        Ok(previous)
    }

    /// Leave any edit mode and drop cached prescriptions.
    pub async fn clear_edit_mode(&self) {
        let mut state = self.state.lock().await;
        *state = SessionState::default();
    }

    pub async fn previous_prescriptions(&self) -> Vec<PatientRecord> {
        self.state.lock().await.previous.clone()
    }

    /// Select a previous prescription by its position in the
    /// date-descending list; out-of-range or `None` clears the
    /// selection. Returns the selected record for form loading.
    pub async fn select_previous(&self, index: Option<usize>) -> Option<PatientRecord> {
        let mut state = self.state.lock().await;
        match index {
            Some(i) if i < state.previous.len() => {
                state.selected = Some(i);
                Some(state.previous[i].clone())
            }
            _ => {
                state.selected = None;
                None
            }
        }
    }

    /// Save a prescription: package the draft, consult the entitlement
    /// gate, commit to history, then advance the counter.
    pub async fn save_prescription(
        &self,
        draft: PrescriptionDraft,
    ) -> Result<SaveOutcome, SessionError> {
        self.save_prescription_at(draft, Utc::now().date_naive())
            .await
    }

    pub async fn save_prescription_at(
        &self,
        mut draft: PrescriptionDraft,
        today: NaiveDate,
    ) -> Result<SaveOutcome, SessionError> {
        draft
            .medicines
            .retain(|line| !line.name.trim().is_empty());
        if draft.medicines.is_empty() {
            return Err(SessionError::NoMedicines);
        }

        let snapshot = self.entitlement.snapshot().await?;
        if !snapshot.can_consume() {
            return Err(EntitlementError::LimitExceeded {
                count: snapshot.prescription_count,
                limit: snapshot
                    .prescription_limit
                    .unwrap_or(DEFAULT_TRIAL_LIMIT),
            }
            .into());
        }

        // Prescriptions are always stamped with today's date; the
        // draft date only matters for patient-details saves.
        let today = today.format("%Y-%m-%d").to_string();
        let record = draft.into_record(today.clone());

        let prior = {
            let state = self.state.lock().await;
            state
                .selected
                .and_then(|i| state.previous.get(i))
                .filter(|selected| selected.visit_date == today)
                .map(PriorPrescription::of)
        };

        match prior {
            Some(prior) => self.history.upsert_replacing(record, &prior).await?,
            None => self.history.upsert_prescription(record).await?,
        }

        let new_count = if snapshot.is_premium {
            self.entitlement.consume().await?;
            None
        } else {
            Some(self.entitlement.consume().await?)
        };

        info!("Prescription saved (count: {:?})", new_count);
        Ok(SaveOutcome { new_count })
    }

    /// Save patient details only, as a placeholder record. Consumes no
    /// entitlement.
    pub async fn save_patient_details(&self, draft: PrescriptionDraft) -> Result<(), SessionError> {
        let mut draft = draft;
        draft.medicines.clear();
        let visit_date = draft.visit_date.clone();
        let record = draft.into_record(visit_date);
        self.history.upsert_prescription(record).await?;
        Ok(())
    }

    /// Commit a demographics edit to the record the patient edit was
    /// opened from. Only legal in patient edit mode.
    pub async fn update_patient_details(
        &self,
        draft: &PrescriptionDraft,
    ) -> Result<(), SessionError> {
        let index = match self.edit_mode().await {
            EditMode::Patient { index } => index,
            _ => return Err(SessionError::NotEditingPatient),
        };

        self.history
            .update_patient_details(index, draft.details())
            .await?;
        self.clear_edit_mode().await;
        Ok(())
    }
}
