use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsightKind {
    #[serde(alias = "WARNING", alias = "warning")]
    Warning,
    #[serde(alias = "INFO", alias = "info")]
    Info,
    #[serde(alias = "CAUSAL", alias = "causal")]
    Causal,
}

impl InsightKind {
    /// Display rank; lower sorts first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Warning => 0,
            Self::Causal => 1,
            Self::Info => 2,
        }
    }
}

/// A cross-referenced note over the accumulated records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    #[serde(alias = "type")]
    pub kind: InsightKind,
    pub title: String,
    pub description: String,
    #[serde(rename = "sourceIds", alias = "source_ids", default)]
    pub source_ids: Vec<String>,
}

/// Stable sort: warnings, then causal links, then informational notes.
pub fn rank_insights(insights: &mut [Insight]) {
    insights.sort_by_key(|i| i.kind.rank());
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InsightStatus {
    /// No records, so nothing to analyse.
    Empty,
    /// A regeneration for `generation` is in flight.
    Pending { generation: u64 },
    /// The set reflects the records at `generation`.
    Ready { generation: u64 },
    /// Records moved on to `generation` after the set was built and nothing
    /// is regenerating it; the set shown is from an older record state.
    Outdated { generation: u64 },
    /// The last regeneration failed; the set is empty, not "no findings".
    Unavailable { kind: FailureKind, reason: String },
}

/// The current insight set. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightSet {
    pub insights: Vec<Insight>,
    pub status: InsightStatus,
}

impl InsightSet {
    pub fn empty() -> Self {
        Self {
            insights: Vec::new(),
            status: InsightStatus::Empty,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self.status, InsightStatus::Unavailable { .. })
    }
}

impl Default for InsightSet {
    fn default() -> Self {
        Self::empty()
    }
}
