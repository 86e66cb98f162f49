//! Timeline resource extraction: report text → dated clinical records
//!
//! Line-oriented and deterministic: a line becomes a record when it carries a
//! date token and one of the clinical keywords. The classifier sits behind
//! `RecordExtractor` so a different one can be swapped in.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::{ClinicalRecord, RecordKind};

/// `YYYY[-/年]M[-/月]D[日]`, month and day one or two digits.
static DATE_TOKEN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([0-9]{4}[-/年][0-9]{1,2}[-/月][0-9]{1,2}日?)").ok());

/// Exam/lab, diagnosis, admission, report.
const KEYWORDS: [&str; 4] = ["检", "诊", "院", "报告"];

/// Marks an examination or lab line; everything else is a condition.
const OBSERVATION_MARKER: char = '检';

const MARKUP: [char; 5] = ['#', '*', '>', '-', '|'];

/// Derives timeline records from a report. Pure; no I/O.
pub trait RecordExtractor: Send + Sync {
    fn extract(&self, report: &str) -> Vec<ClinicalRecord>;

    fn name(&self) -> &str;
}

/// Keyword and date-token classifier.
#[derive(Debug, Clone)]
pub struct HeuristicExtractor {
    label_max_chars: usize,
}

impl HeuristicExtractor {
    pub fn new(label_max_chars: usize) -> Self {
        Self { label_max_chars }
    }
}

impl Default for HeuristicExtractor {
    fn default() -> Self {
        Self::new(50)
    }
}

impl RecordExtractor for HeuristicExtractor {
    fn extract(&self, report: &str) -> Vec<ClinicalRecord> {
        let Some(re) = DATE_TOKEN.as_ref() else {
            tracing::error!("Date token pattern failed to compile");
            return Vec::new();
        };

        let records: Vec<ClinicalRecord> = report
            .lines()
            .filter(|line| KEYWORDS.iter().any(|k| line.contains(k)))
            .filter_map(|line| {
                let token = re.find(line)?.as_str();
                let kind = if line.contains(OBSERVATION_MARKER) {
                    RecordKind::Observation
                } else {
                    RecordKind::Condition
                };
                Some(ClinicalRecord::new(
                    kind,
                    normalize_timestamp(token),
                    clean_label(&line.replacen(token, "", 1), self.label_max_chars),
                ))
            })
            .collect();

        tracing::debug!(records = records.len(), "Extracted timeline records");
        records
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

/// `2023年5月1日` → `2023-5-1`, `2022/11/03` → `2022-11-03`.
pub fn normalize_timestamp(token: &str) -> String {
    token
        .chars()
        .filter(|c| *c != '日')
        .map(|c| match c {
            '/' | '年' | '月' => '-',
            other => other,
        })
        .collect()
}

/// Strips markdown from both ends, not just the leading marker, so table
/// rows (`| 2023-5-1 | 入院 |`) and trailing emphasis come out clean. `**`
/// is dropped anywhere in the line; single `-` inside the text is kept.
fn clean_label(line: &str, max_chars: usize) -> String {
    line.trim_matches(|c: char| c.is_whitespace() || MARKUP.contains(&c))
        .replace("**", "")
        .chars()
        .take(max_chars)
        .collect()
}
