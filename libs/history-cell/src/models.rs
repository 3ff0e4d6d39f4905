use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared_storage::StorageError;
use thiserror::Error;

/// One prescribed medicine. Field names follow the persisted JSON shape
/// of the history store; extra fields written by other collaborators
/// (e.g. the renderer) survive a read-modify-write cycle untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MedicineLine {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "qty", default)]
    pub quantity: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub dose: String,
    #[serde(rename = "freq", default)]
    pub frequency: String,
    #[serde(rename = "days", default)]
    pub duration_days: String,
    #[serde(rename = "meal", default)]
    pub meal_relation: String,
    #[serde(rename = "inst", default)]
    pub instructions: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClinicalFindings {
    #[serde(rename = "cc", default)]
    pub complaint: String,
    #[serde(rename = "oe", default)]
    pub examination: String,
    #[serde(default)]
    pub pulse: String,
    #[serde(rename = "bp", default)]
    pub blood_pressure: String,
    #[serde(rename = "temp", default)]
    pub temperature: String,
    #[serde(rename = "inv", default)]
    pub investigation: String,
}

/// A patient visit as stored in history. A record with no medicines is
/// a placeholder carrying patient details only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    #[serde(rename = "pName", default)]
    pub patient_name: String,
    #[serde(rename = "pSex", default)]
    pub sex: String,
    #[serde(rename = "pAge", default)]
    pub age: String,
    #[serde(rename = "pMobile", default)]
    pub mobile: String,
    /// ISO calendar date, `YYYY-MM-DD`.
    #[serde(rename = "pDate", default)]
    pub visit_date: String,
    #[serde(flatten)]
    pub findings: ClinicalFindings,
    #[serde(rename = "meds", default)]
    pub medicines: Vec<MedicineLine>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PatientRecord {
    pub fn is_placeholder(&self) -> bool {
        self.medicines.is_empty()
    }

    /// Temperature reading, falling back to the legacy `rbs` field kept
    /// by older exports.
    pub fn temperature(&self) -> &str {
        if !self.findings.temperature.is_empty() {
            return &self.findings.temperature;
        }
        self.extra
            .get("rbs")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Full identity match: same mobile and same demographic triple.
    pub fn same_patient(&self, other: &PatientRecord) -> bool {
        self.mobile.trim() == other.mobile.trim()
            && names_match(&self.patient_name, &other.patient_name)
            && self.age.trim() == other.age.trim()
            && self.sex.trim() == other.sex.trim()
    }
}

pub(crate) fn names_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Demographic fields updated by the patient-details edit flow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientDetails {
    pub patient_name: String,
    pub sex: String,
    pub age: String,
    pub mobile: String,
    pub visit_date: String,
}

/// Identity of an already-stored prescription, used by the edit flow to
/// replace that record in place when re-saving on the same day.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorPrescription {
    pub mobile: String,
    pub visit_date: String,
    pub complaint: String,
    pub medicines: Vec<MedicineLine>,
}

impl PriorPrescription {
    pub fn of(record: &PatientRecord) -> Self {
        Self {
            mobile: record.mobile.clone(),
            visit_date: record.visit_date.clone(),
            complaint: record.findings.complaint.clone(),
            medicines: record.medicines.clone(),
        }
    }
}

/// A record paired with its position in the stored history, as needed
/// by listing UIs to address edits and deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedRecord {
    pub index: usize,
    pub record: PatientRecord,
}

/// Per-patient projection of the history for listing: prescription
/// entries when any exist, else the single placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingGroup {
    pub mobile: String,
    pub has_prescriptions: bool,
    pub records: Vec<IndexedRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Keep current records, add imported ones not already present.
    Merge,
    /// Discard current records entirely.
    Replace,
    /// Concatenate imported records after current ones.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    /// Records contained in the imported payload.
    pub imported: usize,
    /// Records in the repository after the import.
    pub total: usize,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Mobile number {mobile} already belongs to a different patient")]
    Conflict { mobile: String },

    #[error("History record {index} not found ({len} records)")]
    NotFound { index: usize, len: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),
}
