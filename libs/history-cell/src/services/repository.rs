use std::sync::Arc;

use shared_storage::KeyValueStore;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::models::{
    names_match, HistoryError, ImportMode, ImportSummary, IndexedRecord, ListingGroup,
    PatientDetails, PatientRecord, PriorPrescription,
};

const HISTORY_KEY: &str = "history";

/// Retention cap for the incremental save path.
const SAVE_CAP: usize = 100;
/// Retention cap for the bulk-import path.
const IMPORT_CAP: usize = 1000;

/// Single source of truth for stored patient records. Mutating
/// operations serialize on a write lock and re-read the stored history
/// inside it, so two overlapping saves cannot interleave across their
/// store await points and clobber each other.
pub struct HistoryRepository {
    store: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl HistoryRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<PatientRecord>, HistoryError> {
        Ok(self
            .store
            .get::<Vec<PatientRecord>>(HISTORY_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn persist(&self, history: &[PatientRecord]) -> Result<(), HistoryError> {
        self.store.set(HISTORY_KEY, history).await?;
        Ok(())
    }

    /// True iff some record (other than `exclude`) carries the same
    /// normalized mobile number but a different demographic triple.
    /// Sole authority for the mobile-identity invariant.
    pub async fn find_conflict(
        &self,
        mobile: &str,
        name: &str,
        age: &str,
        sex: &str,
        exclude: Option<usize>,
    ) -> Result<bool, HistoryError> {
        let history = self.load().await?;
        Ok(find_conflict_in(&history, mobile, name, age, sex, exclude))
    }

    /// Save a prescription or a patient-details placeholder, enforcing
    /// the identity and placeholder invariants.
    pub async fn upsert_prescription(&self, record: PatientRecord) -> Result<(), HistoryError> {
        self.save(record, None).await
    }

    /// Save from the edit flow: when `prior` identifies an existing
    /// record from the same day, that record is replaced in place
    /// instead of a new one being prepended.
    pub async fn upsert_replacing(
        &self,
        record: PatientRecord,
        prior: &PriorPrescription,
    ) -> Result<(), HistoryError> {
        self.save(record, Some(prior)).await
    }

    async fn save(
        &self,
        record: PatientRecord,
        prior: Option<&PriorPrescription>,
    ) -> Result<(), HistoryError> {
        let _guard = self.write_lock.lock().await;
        let mut history = self.load().await?;

        if find_conflict_in(
            &history,
            &record.mobile,
            &record.patient_name,
            &record.age,
            &record.sex,
            None,
        ) {
            return Err(HistoryError::Conflict {
                mobile: record.mobile.trim().to_string(),
            });
        }

        if record.is_placeholder() {
            let has_prescriptions = history
                .iter()
                .any(|entry| entry.same_patient(&record) && !entry.is_placeholder());
            if has_prescriptions {
                // Prescription entries already carry the patient details.
                debug!(
                    "Skipping placeholder save for {}: prescriptions exist",
                    record.mobile
                );
                return Ok(());
            }

            remove_placeholders(&mut history, &record);
            history.insert(0, record);
        } else {
            remove_placeholders(&mut history, &record);

            let key = prior
                .cloned()
                .unwrap_or_else(|| PriorPrescription::of(&record));
            let same_day = key.visit_date == record.visit_date;
            let target = if same_day {
                history.iter().position(|entry| {
                    entry.mobile == key.mobile
                        && entry.visit_date == key.visit_date
                        && entry.findings.complaint == key.complaint
                        && entry.medicines == key.medicines
                })
            } else {
                None
            };

            match target {
                Some(index) => history[index] = record,
                None => history.insert(0, record),
            }
        }

        if history.len() > SAVE_CAP {
            history.truncate(SAVE_CAP);
        }
        self.persist(&history).await
    }

    /// Replace the demographic fields of the record at `index`,
    /// leaving its clinical content untouched.
    pub async fn update_patient_details(
        &self,
        index: usize,
        details: PatientDetails,
    ) -> Result<(), HistoryError> {
        let _guard = self.write_lock.lock().await;
        let mut history = self.load().await?;

        if index >= history.len() {
            return Err(HistoryError::NotFound {
                index,
                len: history.len(),
            });
        }

        if find_conflict_in(
            &history,
            &details.mobile,
            &details.patient_name,
            &details.age,
            &details.sex,
            Some(index),
        ) {
            return Err(HistoryError::Conflict {
                mobile: details.mobile.trim().to_string(),
            });
        }

        let entry = &mut history[index];
        entry.patient_name = details.patient_name;
        entry.sex = details.sex;
        entry.age = details.age;
        entry.mobile = details.mobile;
        entry.visit_date = details.visit_date;

        self.persist(&history).await?;
        info!("Updated patient details at index {}", index);
        Ok(())
    }

    /// Remove the record at `index`. Irreversible; confirmation is the
    /// caller's concern. Returns the removed record.
    pub async fn delete_record(&self, index: usize) -> Result<PatientRecord, HistoryError> {
        let _guard = self.write_lock.lock().await;
        let mut history = self.load().await?;

        if index >= history.len() {
            return Err(HistoryError::NotFound {
                index,
                len: history.len(),
            });
        }

        let removed = history.remove(index);
        self.persist(&history).await?;
        info!(
            "Deleted history record for {} ({})",
            removed.patient_name, removed.mobile
        );
        Ok(removed)
    }

    /// All prescription-bearing records for a mobile number, newest
    /// visit first (stable on ties).
    pub async fn query_by_mobile(
        &self,
        mobile: &str,
    ) -> Result<Vec<PatientRecord>, HistoryError> {
        let history = self.load().await?;
        let needle = mobile.trim();

        let mut matches: Vec<PatientRecord> = history
            .into_iter()
            .filter(|entry| entry.mobile.trim() == needle && !entry.is_placeholder())
            .collect();

        // ISO dates order lexicographically; sort_by is stable.
        matches.sort_by(|a, b| b.visit_date.cmp(&a.visit_date));
        Ok(matches)
    }

    /// Read-only projection for the history listing, grouped per
    /// mobile number in first-appearance (newest-first) order.
    pub async fn group_for_listing(&self) -> Result<Vec<ListingGroup>, HistoryError> {
        let history = self.load().await?;

        let mut grouped: Vec<(String, Vec<IndexedRecord>)> = Vec::new();
        for (index, record) in history.into_iter().enumerate() {
            let entry = IndexedRecord { index, record };
            match grouped
                .iter()
                .position(|(mobile, _)| *mobile == entry.record.mobile)
            {
                Some(pos) => grouped[pos].1.push(entry),
                None => grouped.push((entry.record.mobile.clone(), vec![entry])),
            }
        }

        Ok(grouped
            .into_iter()
            .map(|(mobile, records)| {
                let has_prescriptions = records
                    .iter()
                    .any(|entry| !entry.record.is_placeholder());
                let records = if has_prescriptions {
                    records
                        .into_iter()
                        .filter(|entry| !entry.record.is_placeholder())
                        .collect()
                } else {
                    records.into_iter().take(1).collect()
                };
                ListingGroup {
                    mobile,
                    has_prescriptions,
                    records,
                }
            })
            .collect())
    }

    /// Bulk import from a backup payload.
    pub async fn import_records(
        &self,
        imported: Vec<PatientRecord>,
        mode: ImportMode,
    ) -> Result<ImportSummary, HistoryError> {
        let _guard = self.write_lock.lock().await;
        let current = self.load().await?;
        let imported_count = imported.len();

        let mut merged = match mode {
            ImportMode::Replace => imported,
            ImportMode::Append => {
                let mut merged = current;
                merged.extend(imported);
                merged
            }
            ImportMode::Merge => {
                let existing: std::collections::HashSet<String> =
                    current.iter().map(dedup_key).collect();
                let mut merged = current;
                for record in imported {
                    if !existing.contains(&dedup_key(&record)) {
                        merged.push(record);
                    }
                }
                merged
            }
        };

        if merged.len() > IMPORT_CAP {
            merged.truncate(IMPORT_CAP);
        }
        self.persist(&merged).await?;

        info!(
            "Imported {} records ({} total after {:?})",
            imported_count,
            merged.len(),
            mode
        );
        Ok(ImportSummary {
            imported: imported_count,
            total: merged.len(),
        })
    }

    /// Full snapshot of stored records, for backup export.
    pub async fn export_records(&self) -> Result<Vec<PatientRecord>, HistoryError> {
        self.load().await
    }
}

fn find_conflict_in(
    history: &[PatientRecord],
    mobile: &str,
    name: &str,
    age: &str,
    sex: &str,
    exclude: Option<usize>,
) -> bool {
    let mobile = mobile.trim();
    if mobile.is_empty() {
        return false;
    }

    for (i, entry) in history.iter().enumerate() {
        if Some(i) == exclude {
            continue;
        }
        if entry.mobile.trim() != mobile {
            continue;
        }

        let name_matches = names_match(&entry.patient_name, name);
        let age_matches = entry.age.trim() == age.trim();
        let sex_matches = entry.sex.trim() == sex.trim();
        if !(name_matches && age_matches && sex_matches) {
            return true;
        }
    }
    false
}

/// Drop any placeholder entry for the record's `(mobile, name)`
/// identity; at most one may exist and a fuller save supersedes it.
fn remove_placeholders(history: &mut Vec<PatientRecord>, record: &PatientRecord) {
    history.retain(|entry| {
        !(entry.mobile.trim() == record.mobile.trim()
            && names_match(&entry.patient_name, &record.patient_name)
            && entry.is_placeholder())
    });
}

fn dedup_key(record: &PatientRecord) -> String {
    format!(
        "{}-{}-{}",
        record.patient_name, record.visit_date, record.mobile
    )
}
