use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Resource categories a timeline entry can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Observation,
    Condition,
    Procedure,
    MedicationRequest,
    Patient,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observation => "Observation",
            Self::Condition => "Condition",
            Self::Procedure => "Procedure",
            Self::MedicationRequest => "MedicationRequest",
            Self::Patient => "Patient",
        }
    }
}

/// One dated clinical fact derived from a report.
///
/// Serializes to the timeline entry form `{id, kind, timestamp, label}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalRecord {
    pub id: Uuid,
    pub kind: RecordKind,
    /// Normalized date token, `YYYY-M-D` with `-` separators.
    pub timestamp: String,
    pub label: String,
}

impl ClinicalRecord {
    pub fn new(kind: RecordKind, timestamp: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: timestamp.into(),
            label: label.into(),
        }
    }

    /// Calendar date of `timestamp`, accepting unpadded month/day.
    pub fn date(&self) -> Option<NaiveDate> {
        let mut parts = self.timestamp.split('-').map(|p| p.trim().parse::<u32>());
        let year = parts.next()?.ok()?;
        let month = parts.next()?.ok()?;
        let day = parts.next()?.ok()?;
        if parts.next().is_some() {
            return None;
        }
        NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, day)
    }

    /// Content address over kind, calendar date and label; ignores the id.
    pub fn fingerprint(&self) -> String {
        let date = self
            .date()
            .map(|d| d.to_string())
            .unwrap_or_else(|| self.timestamp.clone());
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(date.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.label.trim().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Order records newest first; undated records sink to the end.
pub fn sort_newest_first(records: &mut [ClinicalRecord]) {
    records.sort_by(|a, b| match (a.date(), b.date()) {
        (Some(da), Some(db)) => db.cmp(&da),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_accepts_unpadded_components() {
        let r = ClinicalRecord::new(RecordKind::Condition, "2023-5-1", "入院");
        assert_eq!(r.date(), NaiveDate::from_ymd_opt(2023, 5, 1));
    }

    #[test]
    fn test_date_rejects_impossible_dates() {
        let r = ClinicalRecord::new(RecordKind::Condition, "2023-13-40", "x");
        assert!(r.date().is_none());
        let r = ClinicalRecord::new(RecordKind::Condition, "2023-1", "x");
        assert!(r.date().is_none());
    }

    #[test]
    fn test_timeline_form_round_trip() {
        let records = vec![
            ClinicalRecord::new(RecordKind::Observation, "2022-11-03", "血常规检查"),
            ClinicalRecord::new(RecordKind::Condition, "2023-5-1", "门诊诊断：高血压"),
        ];

        let json = serde_json::to_string(&records).unwrap();
        let back: Vec<ClinicalRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, records);

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let first = &value[0];
        assert_eq!(first["kind"], "Observation");
        assert_eq!(first["timestamp"], "2022-11-03");
        assert_eq!(first["label"], "血常规检查");
        assert!(first["id"].is_string());
    }

    #[test]
    fn test_fingerprint_ignores_id_and_padding() {
        let a = ClinicalRecord::new(RecordKind::Condition, "2023-5-1", "入院");
        let b = ClinicalRecord::new(RecordKind::Condition, "2023-05-01", "入院");
        assert_ne!(a.id, b.id);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = ClinicalRecord::new(RecordKind::Observation, "2023-5-1", "入院");
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_sort_newest_first_puts_undated_last() {
        let mut records = vec![
            ClinicalRecord::new(RecordKind::Condition, "2021-1-1", "old"),
            ClinicalRecord::new(RecordKind::Condition, "unknown", "undated"),
            ClinicalRecord::new(RecordKind::Condition, "2024-2-29", "new"),
        ];
        sort_newest_first(&mut records);
        let labels: Vec<&str> = records.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["new", "old", "undated"]);
    }
}
