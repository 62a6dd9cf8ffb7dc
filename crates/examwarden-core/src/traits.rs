//! Backend contract and wire types.
//!
//! The `AssessmentBackend` trait is implemented by `examwarden-client`
//! (HTTP) and by [`crate::mock::MockBackend`] (in memory).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::model::{AnswerEntry, Choice, Credentials, Question, QuestionId, SectionKind, SessionId, SetId};

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// The authoritative assessment backend.
///
/// Every call carries the caller's credential explicitly; implementations keep
/// no per-user state of their own.
#[async_trait]
pub trait AssessmentBackend: Send + Sync {
    /// Human-readable backend name (e.g. "http").
    fn name(&self) -> &str;

    /// `GET eligibility?set_id`
    async fn eligibility(&self, auth: &Credentials, set_id: SetId) -> Result<Eligibility, BackendError>;

    /// `POST start`
    async fn start_session(&self, auth: &Credentials, set_id: SetId) -> Result<SessionId, BackendError>;

    /// `GET sessions/{id}/questions`
    async fn questions(&self, auth: &Credentials, session_id: SessionId) -> Result<SectionQuestions, BackendError>;

    /// `GET sessions/{id}/existing-answers`
    async fn existing_answers(
        &self,
        auth: &Credentials,
        session_id: SessionId,
    ) -> Result<ExistingAnswers, BackendError>;

    /// `POST submit-question` with one group's full answer batch.
    async fn submit_answers(
        &self,
        auth: &Credentials,
        request: &SubmitAnswersRequest,
    ) -> Result<SubmitAnswersResponse, BackendError>;

    /// `POST submit-section` or `POST auto-submit-section`, depending on `mode`.
    async fn submit_section(
        &self,
        auth: &Credentials,
        request: &SubmitSectionRequest,
        mode: SubmitMode,
    ) -> Result<SectionSubmitResponse, BackendError>;

    /// `GET sessions/{id}/timer-state`
    async fn timer_state(&self, auth: &Credentials, session_id: SessionId) -> Result<TimerStateResponse, BackendError>;

    /// `POST sync-timer`
    async fn sync_timer(
        &self,
        auth: &Credentials,
        request: &SyncTimerRequest,
        delivery: Delivery,
    ) -> Result<(), BackendError>;
}

/// Which section-submission endpoint to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitMode {
    /// User-initiated; the backend validates that everything is answered.
    Manual,
    /// Timer expiry; partial answers are accepted.
    Auto,
}

/// Delivery requirement for a timer sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Periodic sync; a failure is retried on the next interval.
    BestEffort,
    /// Hide/unload flush; the transport must retry until delivered or refused.
    Guaranteed,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Reply of the eligibility check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub eligible: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub has_incomplete: bool,
    #[serde(default)]
    pub incomplete_session: Option<IncompleteSession>,
}

/// An unfinished session the user should resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteSession {
    pub id: SessionId,
    #[serde(default)]
    pub current_section: Option<SectionKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub set_id: SetId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: SessionId,
}

/// The active section's questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionQuestions {
    pub questions: Vec<Question>,
    pub current_section: SectionKind,
    /// Section time limit in minutes.
    pub time_limit: u32,
}

/// Answers already stored for the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingAnswers {
    #[serde(default)]
    pub existing_answers: BTreeMap<QuestionId, Choice>,
    pub section: SectionKind,
    #[serde(default)]
    pub total_answered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAnswersRequest {
    pub session_id: SessionId,
    pub answers: Vec<AnswerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAnswersResponse {
    pub is_last_in_section: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitSectionRequest {
    pub session_id: SessionId,
    pub section: SectionKind,
    /// Seconds spent in the section.
    pub time_spent: u64,
}

/// Reply of a section submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionSubmitResponse {
    pub completed: bool,
    #[serde(default)]
    pub next_section: Option<SectionKind>,
}

/// Authoritative timer state of the session's active section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerStateResponse {
    pub current_section: SectionKind,
    /// Seconds elapsed since the section started.
    #[serde(default)]
    pub elapsed_time: u64,
    #[serde(default)]
    pub is_expired: bool,
    /// Seconds left; may be negative once the limit has passed.
    #[serde(default)]
    pub time_remaining: i64,
    #[serde(default)]
    pub section_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTimerRequest {
    pub session_id: SessionId,
    pub time_spent: u64,
}
