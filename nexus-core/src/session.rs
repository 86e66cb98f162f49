//! Session coordinator: the single owner of session-scoped state
//!
//! Holds the report, the accumulated records, the current insight set and the
//! conversation. Every mutation goes through a method here; readers get
//! snapshots.
//!
//! Fencing:
//! - every record mutation bumps `generation`; an insight result is applied
//!   only if its generation is still the latest when it completes
//! - `reset` bumps `epoch`; an extraction started before a reset is dropped
//!
//! The state mutex is never held across an await.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chat::{self, ContextAssembler};
use crate::config::{IngestConfig, InsightConfig, MergePolicy, NexusConfig, SessionConfig, TimelineConfig};
use crate::engine::{EngineError, EngineRequest, ReasoningEngine};
use crate::error::NexusError;
use crate::extraction::ExtractionOrchestrator;
use crate::insight::InsightGenerator;
use crate::models::{
    sort_newest_first, ClinicalRecord, ConversationTurn, Document, InsightSet, InsightStatus,
    TurnStatus,
};
use crate::prompts;
use crate::stream::{DeltaSink, StreamOutcome};
use crate::timeline::{HeuristicExtractor, RecordExtractor};

/// Placed between successive reports.
pub const REPORT_SEPARATOR: &str = "\n\n---\n\n";

/// The slices of `NexusConfig` the session reads.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub limits: IngestConfig,
    pub timeline: TimelineConfig,
    pub insights: InsightConfig,
    pub session: SessionConfig,
}

impl From<&NexusConfig> for SessionSettings {
    fn from(config: &NexusConfig) -> Self {
        Self {
            limits: config.ingest.clone(),
            timeline: config.timeline.clone(),
            insights: config.insights.clone(),
            session: config.session.clone(),
        }
    }
}

/// Result of one successful ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub report: String,
    /// Records appended by this ingestion.
    pub records: Vec<ClinicalRecord>,
    /// Records dropped as duplicates under the `dedupe` policy.
    pub duplicates: usize,
    pub generation: u64,
}

/// Whether a regeneration's result made it into the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InsightRefresh {
    Applied { generation: u64 },
    /// The records changed while the call was in flight; the result was dropped.
    Stale { generation: u64, latest: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub report: String,
    /// Newest first.
    pub timeline: Vec<ClinicalRecord>,
    pub insights: InsightSet,
    pub conversation: Vec<ConversationTurn>,
    pub generation: u64,
}

#[derive(Default)]
struct SessionState {
    reports: Vec<String>,
    records: Vec<ClinicalRecord>,
    fingerprints: HashSet<String>,
    insights: InsightSet,
    turns: Vec<ConversationTurn>,
    generation: u64,
    epoch: u64,
}

impl SessionState {
    fn report(&self) -> String {
        self.reports.join(REPORT_SEPARATOR)
    }

    fn turn_mut(&mut self, id: Uuid) -> Option<&mut ConversationTurn> {
        self.turns.iter_mut().find(|t| t.id == id)
    }

    /// Record that the records changed. Without a scheduled refresh the
    /// current set no longer matches the records and must say so.
    fn records_changed(&mut self, refresh_scheduled: bool) {
        self.generation += 1;
        let generation = self.generation;
        if refresh_scheduled {
            self.insights.status = InsightStatus::Pending { generation };
        } else {
            self.mark_outdated();
        }
    }

    fn mark_outdated(&mut self) {
        if self.records.is_empty() {
            self.insights = InsightSet::empty();
        } else {
            self.insights.status = InsightStatus::Outdated {
                generation: self.generation,
            };
        }
    }
}

struct SessionInner {
    extraction: ExtractionOrchestrator,
    extractor: Arc<dyn RecordExtractor>,
    insights: InsightGenerator,
    chat: ContextAssembler,
    settings: SessionSettings,
    state: Mutex<SessionState>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(engine: Arc<dyn ReasoningEngine>, settings: SessionSettings) -> Self {
        let extractor = Arc::new(HeuristicExtractor::new(settings.timeline.label_max_chars));
        Self::with_extractor(engine, extractor, settings)
    }

    pub fn with_extractor(
        engine: Arc<dyn ReasoningEngine>,
        extractor: Arc<dyn RecordExtractor>,
        settings: SessionSettings,
    ) -> Self {
        let session = Self {
            inner: Arc::new(SessionInner {
                extraction: ExtractionOrchestrator::new(engine.clone(), settings.limits.clone()),
                extractor,
                insights: InsightGenerator::new(engine.clone()),
                chat: ContextAssembler::new(engine),
                settings,
                state: Mutex::new(SessionState::default()),
            }),
        };
        session.seed_greeting(None);
        session
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Extract a report from `documents`, derive records and append both.
    pub async fn ingest(
        &self,
        documents: &[Document],
        note: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, NexusError> {
        let epoch = self.lock().epoch;
        let report = self.inner.extraction.extract(documents, note, cancel).await?;
        self.apply_report(report, epoch)
    }

    /// As `ingest`, forwarding report deltas to `sink` as they arrive.
    pub async fn ingest_streaming(
        &self,
        documents: &[Document],
        note: Option<&str>,
        sink: &mut dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, NexusError> {
        let epoch = self.lock().epoch;
        let report = self
            .inner
            .extraction
            .extract_streaming(documents, note, sink, cancel)
            .await?;
        self.apply_report(report, epoch)
    }

    fn apply_report(&self, report: String, epoch: u64) -> Result<IngestOutcome, NexusError> {
        let extracted = self.inner.extractor.extract(&report);
        let dedupe = self.inner.settings.timeline.merge_policy == MergePolicy::Dedupe;

        let mut st = self.lock();
        if st.epoch != epoch {
            tracing::info!("Dropping extraction that finished after a session reset");
            return Err(NexusError::SessionReset);
        }

        st.reports.push(report.clone());

        let mut added = Vec::with_capacity(extracted.len());
        let mut duplicates = 0;
        for record in extracted {
            let fresh = st.fingerprints.insert(record.fingerprint());
            if dedupe && !fresh {
                duplicates += 1;
                continue;
            }
            st.records.push(record.clone());
            added.push(record);
        }

        let changed = !added.is_empty();
        let refresh = changed && self.inner.settings.insights.auto_refresh;
        if changed {
            st.records_changed(refresh);
        }
        let generation = st.generation;
        drop(st);

        tracing::info!(
            extractor = self.inner.extractor.name(),
            added = added.len(),
            duplicates = duplicates,
            generation = generation,
            "Report ingested"
        );

        if refresh {
            self.spawn_insight_refresh();
        }

        Ok(IngestOutcome {
            report,
            records: added,
            duplicates,
            generation,
        })
    }

    /// Bulk-delete records by id. Returns how many were removed.
    pub fn remove_records(&self, ids: &[Uuid]) -> usize {
        let targets: HashSet<&Uuid> = ids.iter().collect();

        let mut st = self.lock();
        let before = st.records.len();
        st.records.retain(|r| !targets.contains(&r.id));
        let removed = before - st.records.len();
        if removed == 0 {
            return 0;
        }

        st.fingerprints = st.records.iter().map(ClinicalRecord::fingerprint).collect();
        let refresh = self.inner.settings.insights.auto_refresh;
        st.records_changed(refresh);
        let generation = st.generation;
        drop(st);

        tracing::info!(removed = removed, generation = generation, "Records removed");
        if refresh {
            self.spawn_insight_refresh();
        }
        removed
    }

    // ========================================================================
    // Insights
    // ========================================================================

    /// Regenerate insights for the current records. The result is applied
    /// only if no record mutation happened while the call was in flight.
    pub async fn refresh_insights(&self) -> InsightRefresh {
        let (generation, records) = {
            let mut st = self.lock();
            let generation = st.generation;
            if !st.records.is_empty() {
                st.insights.status = InsightStatus::Pending { generation };
            }
            (generation, st.records.clone())
        };

        let set = self.inner.insights.generate(&records, generation).await;

        let mut st = self.lock();
        if st.generation != generation {
            tracing::debug!(
                generation = generation,
                latest = st.generation,
                "Discarding stale insight result"
            );
            if st.insights.status == (InsightStatus::Pending { generation }) {
                st.mark_outdated();
            }
            return InsightRefresh::Stale {
                generation,
                latest: st.generation,
            };
        }
        st.insights = set;
        InsightRefresh::Applied { generation }
    }

    /// Run `refresh_insights` in the background.
    pub fn spawn_insight_refresh(&self) -> JoinHandle<InsightRefresh> {
        let session = self.clone();
        tokio::spawn(async move { session.refresh_insights().await })
    }

    // ========================================================================
    // Conversation
    // ========================================================================

    /// Open a user turn and an empty assistant turn; returns the assistant
    /// turn id and the grounded request.
    fn open_turns(
        &self,
        question: &str,
        attachments: &[Document],
    ) -> Result<(Uuid, EngineRequest), NexusError> {
        if question.trim().is_empty() {
            return Err(NexusError::InvalidInput("question is empty".into()));
        }

        let mut st = self.lock();
        let request =
            self.inner
                .chat
                .build_request(question, attachments, &st.report(), &st.records);
        let assistant = ConversationTurn::pending_assistant();
        let id = assistant.id;
        st.turns.push(ConversationTurn::user(question.trim()));
        st.turns.push(assistant);
        Ok((id, request))
    }

    fn close_turn(&self, id: Uuid, content: String, status: TurnStatus) -> ConversationTurn {
        let mut st = self.lock();
        match st.turn_mut(id) {
            Some(turn) => {
                turn.content = content;
                turn.status = status;
                turn.clone()
            }
            // Reset while the answer was in flight; the turn is gone.
            None => ConversationTurn {
                content,
                status,
                id,
                ..ConversationTurn::pending_assistant()
            },
        }
    }

    /// Answer `question` against the current report. Failures become a
    /// notice in the assistant turn; the user turn is always kept.
    pub async fn ask(
        &self,
        question: &str,
        attachments: &[Document],
        cancel: &CancellationToken,
    ) -> Result<ConversationTurn, NexusError> {
        let (id, request) = self.open_turns(question, attachments)?;

        let turn = match self.inner.chat.answer(&request, cancel).await {
            Ok(answer) => self.close_turn(id, answer, TurnStatus::Complete),
            Err(e) => {
                tracing::error!(error = %e, "Question could not be answered");
                self.close_turn(id, chat::failure_notice(&e), TurnStatus::Failed)
            }
        };
        Ok(turn)
    }

    /// As `ask`, filling the assistant turn in place as deltas arrive and
    /// forwarding each delta to `sink`.
    pub async fn ask_streaming(
        &self,
        question: &str,
        attachments: &[Document],
        sink: &mut dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> Result<ConversationTurn, NexusError> {
        let (id, request) = self.open_turns(question, attachments)?;

        let mut relay = |delta: &str| {
            if let Some(turn) = self.lock().turn_mut(id) {
                turn.content.push_str(delta);
            }
            sink.on_delta(delta);
        };
        let outcome = self
            .inner
            .chat
            .answer_streaming(&request, &mut relay, cancel)
            .await;

        let turn = match outcome {
            StreamOutcome::Complete(answer) if !answer.trim().is_empty() => {
                self.close_turn(id, answer, TurnStatus::Complete)
            }
            StreamOutcome::Complete(_) => self.close_turn(
                id,
                chat::failure_notice(&EngineError::MalformedResponse("empty answer".into())),
                TurnStatus::Failed,
            ),
            StreamOutcome::Failed { error, partial } => {
                tracing::error!(error = %error, received = partial.len(), "Streamed answer failed");
                self.settle_broken_turn(id, error, partial)
            }
            StreamOutcome::Aborted { partial } => {
                tracing::info!(received = partial.len(), "Streamed answer aborted");
                self.settle_broken_turn(id, EngineError::Aborted, partial)
            }
        };
        Ok(turn)
    }

    fn settle_broken_turn(&self, id: Uuid, error: EngineError, partial: String) -> ConversationTurn {
        if partial.trim().is_empty() {
            self.close_turn(id, chat::failure_notice(&error), TurnStatus::Failed)
        } else {
            self.close_turn(id, chat::mark_partial(&partial), TurnStatus::Partial)
        }
    }

    // ========================================================================
    // Reset and snapshots
    // ========================================================================

    /// Clear everything (patient switch). `subject` names the new patient
    /// for the greeting turn.
    pub fn reset(&self, subject: Option<&str>) {
        {
            let mut st = self.lock();
            let generation = st.generation + 1;
            let epoch = st.epoch + 1;
            *st = SessionState {
                generation,
                epoch,
                ..SessionState::default()
            };
        }
        self.seed_greeting(subject);
        tracing::info!(subject = subject.unwrap_or(""), "Session reset");
    }

    fn seed_greeting(&self, subject: Option<&str>) {
        let greeting = match subject.map(str::trim).filter(|s| !s.is_empty()) {
            Some(subject) => prompts::greeting_for(subject),
            None => self.inner.settings.session.greeting.clone(),
        };
        if !greeting.trim().is_empty() {
            self.lock().turns.push(ConversationTurn::assistant(greeting));
        }
    }

    pub fn report(&self) -> String {
        self.lock().report()
    }

    /// Records in accumulation order.
    pub fn records(&self) -> Vec<ClinicalRecord> {
        self.lock().records.clone()
    }

    /// Records newest first.
    pub fn timeline(&self) -> Vec<ClinicalRecord> {
        let mut records = self.records();
        sort_newest_first(&mut records);
        records
    }

    pub fn insights(&self) -> InsightSet {
        self.lock().insights.clone()
    }

    pub fn conversation(&self) -> Vec<ConversationTurn> {
        self.lock().turns.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let st = self.lock();
        let mut timeline = st.records.clone();
        sort_newest_first(&mut timeline);
        SessionSnapshot {
            report: st.report(),
            timeline,
            insights: st.insights.clone(),
            conversation: st.turns.clone(),
            generation: st.generation,
        }
    }
}
