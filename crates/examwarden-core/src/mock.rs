//! In-memory backend for tests and offline demos.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::BackendError;
use crate::model::{Choice, Credentials, Question, QuestionId, SectionKind, SessionId, SetId};
use crate::sync::lock;
use crate::traits::{
    AssessmentBackend, Delivery, Eligibility, ExistingAnswers, IncompleteSession, SectionQuestions,
    SectionSubmitResponse, SubmitAnswersRequest, SubmitAnswersResponse, SubmitMode,
    SubmitSectionRequest, SyncTimerRequest, TimerStateResponse,
};

/// One section served by the mock.
#[derive(Debug, Clone)]
pub struct MockSection {
    pub kind: SectionKind,
    pub time_limit_minutes: u32,
    pub questions: Vec<Question>,
}

impl MockSection {
    pub fn new(kind: SectionKind, time_limit_minutes: u32, questions: Vec<Question>) -> Self {
        Self {
            kind,
            time_limit_minutes,
            questions,
        }
    }

    fn answerable(&self) -> impl Iterator<Item = &Question> {
        self.questions
            .iter()
            .filter(|q| q.has_options() && !q.is_group_parent())
    }
}

/// Backend endpoints, for counting calls and injecting failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Eligibility,
    Start,
    Questions,
    ExistingAnswers,
    SubmitAnswers,
    SubmitSection,
    AutoSubmitSection,
    TimerState,
    SyncTimer,
}

/// A recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Eligibility { set_id: SetId },
    Start { set_id: SetId },
    Questions { session_id: SessionId },
    ExistingAnswers { session_id: SessionId },
    SubmitAnswers(SubmitAnswersRequest),
    SubmitSection { request: SubmitSectionRequest, mode: SubmitMode },
    TimerState { session_id: SessionId },
    SyncTimer { request: SyncTimerRequest, delivery: Delivery },
}

impl BackendCall {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            BackendCall::Eligibility { .. } => Endpoint::Eligibility,
            BackendCall::Start { .. } => Endpoint::Start,
            BackendCall::Questions { .. } => Endpoint::Questions,
            BackendCall::ExistingAnswers { .. } => Endpoint::ExistingAnswers,
            BackendCall::SubmitAnswers(_) => Endpoint::SubmitAnswers,
            BackendCall::SubmitSection {
                mode: SubmitMode::Manual,
                ..
            } => Endpoint::SubmitSection,
            BackendCall::SubmitSection {
                mode: SubmitMode::Auto,
                ..
            } => Endpoint::AutoSubmitSection,
            BackendCall::TimerState { .. } => Endpoint::TimerState,
            BackendCall::SyncTimer { .. } => Endpoint::SyncTimer,
        }
    }
}

struct MockState {
    sections: Vec<MockSection>,
    section_index: usize,
    session_id: Option<SessionId>,
    completed: bool,
    section_started_at: DateTime<Utc>,
    answers: BTreeMap<QuestionId, Choice>,
    eligibility: Option<Eligibility>,
    timer_override: Option<TimerStateResponse>,
    last_synced_elapsed: Option<u64>,
}

impl MockState {
    fn current(&self) -> Option<&MockSection> {
        if self.completed {
            None
        } else {
            self.sections.get(self.section_index)
        }
    }

    fn current_kind(&self) -> SectionKind {
        self.current()
            .map(|s| s.kind)
            .unwrap_or(SectionKind::Completed)
    }
}

/// A scripted, in-memory assessment backend.
///
/// Sections are served in order; the section clock starts when a session is
/// created and restarts on every section transition.
pub struct MockBackend {
    clock: Clock,
    state: Mutex<MockState>,
    calls: Mutex<Vec<BackendCall>>,
    failures: Mutex<HashMap<Endpoint, VecDeque<BackendError>>>,
    latency: Mutex<Option<Duration>>,
}

impl MockBackend {
    pub fn new(clock: Clock, sections: Vec<MockSection>) -> Self {
        Self {
            clock,
            state: Mutex::new(MockState {
                sections,
                section_index: 0,
                session_id: None,
                completed: false,
                section_started_at: clock.now(),
                answers: BTreeMap::new(),
                eligibility: None,
                timer_override: None,
                last_synced_elapsed: None,
            }),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            latency: Mutex::new(None),
        }
    }

    /// Pretend an unfinished session exists, positioned in `section_index`
    /// with `answers` already stored.
    pub fn with_incomplete_session(
        self,
        session_id: SessionId,
        section_index: usize,
        answers: impl IntoIterator<Item = (QuestionId, Choice)>,
    ) -> Self {
        {
            let mut state = lock(&self.state);
            state.session_id = Some(session_id);
            state.section_index = section_index;
            state.answers = answers.into_iter().collect();
        }
        self
    }

    /// Override the eligibility reply.
    pub fn with_eligibility(self, eligibility: Eligibility) -> Self {
        lock(&self.state).eligibility = Some(eligibility);
        self
    }

    /// Move the anchor of the current section.
    pub fn set_section_started_at(&self, at: DateTime<Utc>) {
        lock(&self.state).section_started_at = at;
    }

    /// Serve this timer state instead of deriving one.
    pub fn set_timer_state(&self, state: TimerStateResponse) {
        lock(&self.state).timer_override = Some(state);
    }

    /// Delay submission endpoints by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    /// Fail the next call to `endpoint` with `error`. Calls queue up.
    pub fn fail_next(&self, endpoint: Endpoint, error: BackendError) {
        lock(&self.failures)
            .entry(endpoint)
            .or_default()
            .push_back(error);
    }

    /// All calls received so far, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.calls).clone()
    }

    /// Number of calls received for `endpoint`, failed ones included.
    pub fn count(&self, endpoint: Endpoint) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.endpoint() == endpoint)
            .count()
    }

    /// Answers the backend has accepted.
    pub fn stored_answers(&self) -> BTreeMap<QuestionId, Choice> {
        lock(&self.state).answers.clone()
    }

    /// The section the backend considers active.
    pub fn current_section(&self) -> SectionKind {
        lock(&self.state).current_kind()
    }

    pub fn is_completed(&self) -> bool {
        lock(&self.state).completed
    }

    /// Elapsed seconds of the last successful timer sync.
    pub fn last_synced_elapsed(&self) -> Option<u64> {
        lock(&self.state).last_synced_elapsed
    }

    fn record(&self, call: BackendCall) -> Result<(), BackendError> {
        let endpoint = call.endpoint();
        lock(&self.calls).push(call);
        match lock(&self.failures).get_mut(&endpoint).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_session(state: &MockState, session_id: SessionId) -> Result<(), BackendError> {
        if state.session_id == Some(session_id) {
            Ok(())
        } else {
            Err(BackendError::Rejected {
                status: 404,
                message: format!("session {session_id} not found"),
            })
        }
    }
}

#[async_trait]
impl AssessmentBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn eligibility(&self, _auth: &Credentials, set_id: SetId) -> Result<Eligibility, BackendError> {
        self.record(BackendCall::Eligibility { set_id })?;
        let state = lock(&self.state);
        if let Some(eligibility) = &state.eligibility {
            return Ok(eligibility.clone());
        }
        let incomplete = state
            .session_id
            .filter(|_| !state.completed)
            .map(|id| IncompleteSession {
                id,
                current_section: Some(state.current_kind()),
            });
        Ok(Eligibility {
            eligible: true,
            reason: None,
            has_incomplete: incomplete.is_some(),
            incomplete_session: incomplete,
        })
    }

    async fn start_session(&self, _auth: &Credentials, set_id: SetId) -> Result<SessionId, BackendError> {
        self.record(BackendCall::Start { set_id })?;
        let mut state = lock(&self.state);
        let id = state.session_id.map_or(1, |id| id + 1);
        state.session_id = Some(id);
        state.section_index = 0;
        state.completed = false;
        state.answers.clear();
        state.section_started_at = self.clock.now();
        Ok(id)
    }

    async fn questions(&self, _auth: &Credentials, session_id: SessionId) -> Result<SectionQuestions, BackendError> {
        self.record(BackendCall::Questions { session_id })?;
        let state = lock(&self.state);
        Self::check_session(&state, session_id)?;
        let section = state.current().ok_or_else(|| BackendError::Rejected {
            status: 409,
            message: "assessment already completed".into(),
        })?;
        Ok(SectionQuestions {
            questions: section.questions.clone(),
            current_section: section.kind,
            time_limit: section.time_limit_minutes,
        })
    }

    async fn existing_answers(
        &self,
        _auth: &Credentials,
        session_id: SessionId,
    ) -> Result<ExistingAnswers, BackendError> {
        self.record(BackendCall::ExistingAnswers { session_id })?;
        let state = lock(&self.state);
        Self::check_session(&state, session_id)?;
        let existing_answers: BTreeMap<QuestionId, Choice> = match state.current() {
            Some(section) => section
                .answerable()
                .filter_map(|q| state.answers.get(&q.id).map(|c| (q.id, *c)))
                .collect(),
            None => BTreeMap::new(),
        };
        Ok(ExistingAnswers {
            total_answered: existing_answers.len(),
            existing_answers,
            section: state.current_kind(),
        })
    }

    async fn submit_answers(
        &self,
        _auth: &Credentials,
        request: &SubmitAnswersRequest,
    ) -> Result<SubmitAnswersResponse, BackendError> {
        self.record(BackendCall::SubmitAnswers(request.clone()))?;
        self.simulate_latency().await;
        let mut state = lock(&self.state);
        Self::check_session(&state, request.session_id)?;
        let last_id = state
            .current()
            .and_then(|s| s.answerable().max_by_key(|q| q.order_number))
            .map(|q| q.id);
        for entry in &request.answers {
            state.answers.insert(entry.question_id, entry.answer);
        }
        let is_last_in_section = last_id.is_some_and(|id| request.answers.iter().any(|a| a.question_id == id));
        Ok(SubmitAnswersResponse { is_last_in_section })
    }

    async fn submit_section(
        &self,
        _auth: &Credentials,
        request: &SubmitSectionRequest,
        mode: SubmitMode,
    ) -> Result<SectionSubmitResponse, BackendError> {
        self.record(BackendCall::SubmitSection {
            request: request.clone(),
            mode,
        })?;
        self.simulate_latency().await;
        let mut state = lock(&self.state);
        Self::check_session(&state, request.session_id)?;
        if state.current_kind() != request.section {
            return Err(BackendError::Rejected {
                status: 409,
                message: format!("section {} is not active", request.section),
            });
        }
        if mode == SubmitMode::Manual {
            let unanswered = state
                .current()
                .map(|s| s.answerable().filter(|q| !state.answers.contains_key(&q.id)).count())
                .unwrap_or(0);
            if unanswered > 0 {
                return Err(BackendError::Rejected {
                    status: 422,
                    message: format!("{unanswered} question(s) unanswered"),
                });
            }
        }

        state.section_index += 1;
        state.timer_override = None;
        state.last_synced_elapsed = None;
        if state.section_index >= state.sections.len() {
            state.completed = true;
            return Ok(SectionSubmitResponse {
                completed: true,
                next_section: None,
            });
        }
        state.section_started_at = self.clock.now();
        Ok(SectionSubmitResponse {
            completed: false,
            next_section: Some(state.current_kind()),
        })
    }

    async fn timer_state(&self, _auth: &Credentials, session_id: SessionId) -> Result<TimerStateResponse, BackendError> {
        self.record(BackendCall::TimerState { session_id })?;
        let state = lock(&self.state);
        if let Some(timer) = &state.timer_override {
            return Ok(timer.clone());
        }
        let limit_secs = state
            .current()
            .map_or(0, |s| i64::from(s.time_limit_minutes) * 60);
        let elapsed = (self.clock.now() - state.section_started_at).num_seconds().max(0);
        let remaining = limit_secs - elapsed;
        Ok(TimerStateResponse {
            current_section: state.current_kind(),
            elapsed_time: elapsed as u64,
            is_expired: remaining <= 0,
            time_remaining: remaining,
            section_started_at: Some(state.section_started_at),
        })
    }

    async fn sync_timer(
        &self,
        _auth: &Credentials,
        request: &SyncTimerRequest,
        delivery: Delivery,
    ) -> Result<(), BackendError> {
        self.record(BackendCall::SyncTimer {
            request: request.clone(),
            delivery,
        })?;
        lock(&self.state).last_synced_elapsed = Some(request.time_spent);
        Ok(())
    }
}
