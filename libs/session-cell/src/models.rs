use entitlement_cell::EntitlementError;
use history_cell::{HistoryError, MedicineLine, PatientDetails, PatientRecord};
use thiserror::Error;

/// What the form is currently editing. Indices address the stored
/// history record the edit was opened from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EditMode {
    #[default]
    Inactive,
    Patient {
        index: usize,
    },
    Prescription {
        index: usize,
    },
}

/// Raw form field values, as collected by a UI collaborator. Medicine
/// lines without a name are dropped at save time.
#[derive(Debug, Clone, Default)]
pub struct PrescriptionDraft {
    pub patient_name: String,
    pub sex: String,
    pub age: String,
    pub mobile: String,
    pub visit_date: String,
    pub complaint: String,
    pub examination: String,
    pub pulse: String,
    pub blood_pressure: String,
    pub temperature: String,
    pub investigation: String,
    pub medicines: Vec<MedicineLine>,
}

impl PrescriptionDraft {
    pub(crate) fn into_record(self, visit_date: String) -> PatientRecord {
        PatientRecord {
            patient_name: self.patient_name,
            sex: self.sex,
            age: self.age,
            mobile: self.mobile,
            visit_date,
            findings: history_cell::ClinicalFindings {
                complaint: self.complaint,
                examination: self.examination,
                pulse: self.pulse,
                blood_pressure: self.blood_pressure,
                temperature: self.temperature,
                investigation: self.investigation,
            },
            medicines: self.medicines,
            ..Default::default()
        }
    }

    pub(crate) fn details(&self) -> PatientDetails {
        PatientDetails {
            patient_name: self.patient_name.trim().to_string(),
            sex: self.sex.clone(),
            age: self.age.trim().to_string(),
            mobile: self.mobile.trim().to_string(),
            visit_date: self.visit_date.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    /// New consumed count after the save; `None` under premium.
    pub new_count: Option<u32>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Prescription must contain at least one medicine")]
    NoMedicines,

    #[error("Patient edit mode is not active")]
    NotEditingPatient,

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Entitlement(#[from] EntitlementError),
}
