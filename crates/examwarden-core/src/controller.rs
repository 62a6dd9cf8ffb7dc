//! Session controller.
//!
//! Orchestrates one assessment attempt: start or resume, per-group answer
//! submission, section submission and transition, and auto-submission when
//! the section timer expires.
//!
//! All writes go through a single in-flight flag shared by user actions and
//! the timer. An expiry that arrives while another write is outstanding is
//! parked and replayed once the flag is released, unless the outstanding write
//! already left that section.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;

use crate::audio::{AudioPlaybackGuard, AudioPlayer, SilentPlayer};
use crate::clock::Clock;
use crate::error::{AssessmentError, AudioError};
use crate::model::{
    AnswerSet, Choice, ExamContext, QuestionGroup, QuestionId, Section, SectionKind, Session,
    SessionId, SessionStatus,
};
use crate::organizer::{organize, validate_groups};
use crate::state::{ControllerEvent, ControllerState};
use crate::sync::lock;
use crate::timer::{ExpiryHandler, TimerCoordinator, TimerInit, TimerSettings, TimerSnapshot};
use crate::traits::{
    AssessmentBackend, SubmitAnswersRequest, SubmitMode, SubmitSectionRequest,
};

type Result<T> = std::result::Result<T, AssessmentError>;

/// Configuration for the session controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub timer: TimerSettings,
    /// Delay between a listening group becoming current and autoplay.
    pub autoplay_delay: Duration,
    /// How many times a section is reloaded when the backend reports another
    /// section before giving up with `SectionDesync`.
    pub desync_reload_limit: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            timer: TimerSettings::default(),
            autoplay_delay: Duration::from_secs(1),
            desync_reload_limit: 2,
        }
    }
}

/// Progress hooks for the presentation layer.
pub trait SessionObserver: Send + Sync {
    fn on_section_loaded(&self, section: SectionKind, groups: usize, answered: usize);
    fn on_group_submitted(&self, section: SectionKind, index: usize, total: usize);
    fn on_section_submitted(&self, section: SectionKind, time_spent: u64, mode: SubmitMode);
    fn on_completed(&self, session_id: SessionId);
    fn on_error(&self, error: &AssessmentError);
}

/// No-op observer.
pub struct NoopObserver;

impl SessionObserver for NoopObserver {
    fn on_section_loaded(&self, _: SectionKind, _: usize, _: usize) {}
    fn on_group_submitted(&self, _: SectionKind, _: usize, _: usize) {}
    fn on_section_submitted(&self, _: SectionKind, _: u64, _: SubmitMode) {}
    fn on_completed(&self, _: SessionId) {}
    fn on_error(&self, _: &AssessmentError) {}
}

/// Result of a successful [`SessionController::advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The group was accepted; `index` is the new current group.
    Moved { index: usize },
    /// The group was the last one and the section has been submitted.
    SectionSubmitted(SectionOutcome),
}

/// Result of a section submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionOutcome {
    /// The next section is loaded and its timer is running.
    NextSection(SectionKind),
    /// The whole assessment is finished.
    Completed,
}

/// Point-in-time view of the controller for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ControllerState,
    pub session_id: Option<SessionId>,
    pub section: Option<SectionKind>,
    pub group_index: usize,
    pub group_count: usize,
    pub answered: usize,
    pub question_count: usize,
    pub timer: TimerSnapshot,
}

struct SessionData {
    state: ControllerState,
    session_id: Option<SessionId>,
    section: Option<Section>,
    index: usize,
    answers: AnswerSet,
    orphans: Vec<QuestionId>,
}

/// Releases the in-flight flag on drop.
struct Flight<'a> {
    flag: &'a AtomicBool,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Builder for [`SessionController`].
pub struct ControllerBuilder {
    backend: Arc<dyn AssessmentBackend>,
    context: ExamContext,
    player: Arc<dyn AudioPlayer>,
    settings: ControllerSettings,
    clock: Clock,
    observer: Arc<dyn SessionObserver>,
}

impl ControllerBuilder {
    pub fn with_player(mut self, player: Arc<dyn AudioPlayer>) -> Self {
        self.player = player;
        self
    }

    pub fn with_settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> Arc<SessionController> {
        Arc::new_cyclic(|me: &Weak<SessionController>| {
            let weak = me.clone();
            let on_expire: ExpiryHandler = Arc::new(move |section| {
                if let Some(controller) = weak.upgrade() {
                    tokio::spawn(async move { controller.handle_expiry(section).await });
                }
            });
            let timer = TimerCoordinator::new(
                Arc::clone(&self.backend),
                self.context.credentials.clone(),
                self.clock,
                self.settings.timer.clone(),
            )
            .with_expiry_handler(on_expire);
            let audio = AudioPlaybackGuard::new(self.player, self.settings.autoplay_delay);

            SessionController {
                me: me.clone(),
                backend: self.backend,
                context: self.context,
                settings: self.settings,
                timer,
                audio,
                observer: self.observer,
                in_flight: AtomicBool::new(false),
                pending_expiry: Mutex::new(None),
                data: Mutex::new(SessionData {
                    state: ControllerState::Initializing,
                    session_id: None,
                    section: None,
                    index: 0,
                    answers: AnswerSet::new(),
                    orphans: Vec::new(),
                }),
            }
        })
    }
}

/// Runs one assessment attempt.
pub struct SessionController {
    me: Weak<SessionController>,
    backend: Arc<dyn AssessmentBackend>,
    context: ExamContext,
    settings: ControllerSettings,
    timer: TimerCoordinator,
    audio: AudioPlaybackGuard,
    observer: Arc<dyn SessionObserver>,
    in_flight: AtomicBool,
    pending_expiry: Mutex<Option<SectionKind>>,
    data: Mutex<SessionData>,
}

impl SessionController {
    pub fn builder(backend: Arc<dyn AssessmentBackend>, context: ExamContext) -> ControllerBuilder {
        ControllerBuilder {
            backend,
            context,
            player: Arc::new(SilentPlayer),
            settings: ControllerSettings::default(),
            clock: Clock::System,
            observer: Arc::new(NoopObserver),
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Start a new session, or resume the unfinished one.
    ///
    /// Returns the section that is now in progress.
    pub async fn start(&self) -> Result<SectionKind> {
        let flight = self.begin_flight()?;
        let result = self.start_inner().await;
        self.end_flight(flight);
        result.map_err(|e| self.handle_error(e))
    }

    /// Submit the current group and move to the next one. After the last
    /// group the section is submitted as well.
    pub async fn advance(&self) -> Result<AdvanceOutcome> {
        let flight = self.begin_flight()?;
        let result = self.advance_inner().await;
        self.end_flight(flight);
        result.map_err(|e| self.handle_error(e))
    }

    /// Finish the current section.
    ///
    /// Before expiry every question must be answered. Once the timer has
    /// expired this performs the auto-submission instead, so a failed
    /// auto-submit can be retried from here.
    pub async fn submit_section(&self) -> Result<SectionOutcome> {
        let flight = self.begin_flight()?;
        let result = self.submit_section_manual().await;
        self.end_flight(flight);
        result.map_err(|e| self.handle_error(e))
    }

    /// Reload the active section from the backend. Used to recover from a
    /// failed transition or a section desync.
    pub async fn reload_section(&self) -> Result<SectionKind> {
        let flight = self.begin_flight()?;
        let result = self.reload_inner().await;
        self.end_flight(flight);
        result.map_err(|e| self.handle_error(e))
    }

    /// Select an answer for a question of the current section.
    pub fn select_answer(&self, question_id: QuestionId, choice: Choice) -> Result<()> {
        let mut data = lock(&self.data);
        if data.state != ControllerState::SectionInProgress {
            return Err(AssessmentError::InvalidTransition {
                state: data.state.to_string(),
                action: "select an answer".into(),
            });
        }
        let in_section = data
            .section
            .as_ref()
            .is_some_and(|s| s.contains(question_id));
        if !in_section {
            return Err(AssessmentError::UnknownQuestion(question_id));
        }
        data.answers.select(question_id, choice);
        Ok(())
    }

    /// Manually (re)start the current group's audio.
    pub async fn start_audio(&self) -> std::result::Result<(), AudioError> {
        let Some(group) = self.current_group() else {
            return Err(AudioError::NoCurrentGroup);
        };
        self.audio.start(&group).await
    }

    /// Page hidden or about to unload: flush elapsed time with guaranteed delivery.
    pub async fn on_hidden(&self) -> Result<bool> {
        self.timer.flush().await.map_err(AssessmentError::from)
    }

    /// Flush elapsed time and stop all background tasks.
    pub async fn shutdown(&self) {
        if let Err(e) = self.timer.flush().await {
            tracing::warn!("final timer flush failed: {e}");
        }
        self.timer.stop();
        self.audio.reset();
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ControllerState {
        lock(&self.data).state
    }

    pub fn session(&self) -> Option<Session> {
        let data = lock(&self.data);
        let id = data.session_id?;
        let (current_section, status) = if data.state == ControllerState::Completed {
            (SectionKind::Completed, SessionStatus::Completed)
        } else {
            (
                data.section.as_ref().map_or(SectionKind::Listening, |s| s.kind),
                SessionStatus::InProgress,
            )
        };
        Some(Session {
            id,
            current_section,
            status,
        })
    }

    pub fn section(&self) -> Option<Section> {
        lock(&self.data).section.clone()
    }

    pub fn current_group(&self) -> Option<QuestionGroup> {
        let data = lock(&self.data);
        data.section
            .as_ref()
            .and_then(|s| s.groups.get(data.index))
            .cloned()
    }

    pub fn current_index(&self) -> usize {
        lock(&self.data).index
    }

    pub fn answers(&self) -> AnswerSet {
        lock(&self.data).answers.clone()
    }

    /// Questions of the active section whose declared group does not exist.
    pub fn orphans(&self) -> Vec<QuestionId> {
        lock(&self.data).orphans.clone()
    }

    /// The exact request [`advance`](Self::advance) would send for the
    /// current group.
    pub fn pending_batch(&self) -> Option<SubmitAnswersRequest> {
        let data = lock(&self.data);
        let session_id = data.session_id?;
        let group = data.section.as_ref()?.groups.get(data.index)?;
        Some(SubmitAnswersRequest {
            session_id,
            answers: data.answers.batch_for(group),
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let timer = self.timer.snapshot();
        let data = lock(&self.data);
        SessionSnapshot {
            state: data.state,
            session_id: data.session_id,
            section: data.section.as_ref().map(|s| s.kind),
            group_index: data.index,
            group_count: data.section.as_ref().map_or(0, |s| s.groups.len()),
            answered: data.answers.len(),
            question_count: data.section.as_ref().map_or(0, Section::question_count),
            timer,
        }
    }

    pub fn subscribe_timer(&self) -> watch::Receiver<TimerSnapshot> {
        self.timer.subscribe()
    }

    pub fn timer(&self) -> &TimerCoordinator {
        &self.timer
    }

    pub fn audio(&self) -> &AudioPlaybackGuard {
        &self.audio
    }

    // -----------------------------------------------------------------------
    // Flows
    // -----------------------------------------------------------------------

    async fn start_inner(&self) -> Result<SectionKind> {
        {
            let data = lock(&self.data);
            if data.state != ControllerState::Initializing {
                return Err(AssessmentError::InvalidTransition {
                    state: data.state.to_string(),
                    action: "start".into(),
                });
            }
        }

        let auth = &self.context.credentials;
        let eligibility = self.backend.eligibility(auth, self.context.set_id).await?;

        let resume = eligibility
            .incomplete_session
            .as_ref()
            .filter(|_| eligibility.has_incomplete)
            .map(|s| s.id);

        let (session_id, resumed) = match resume {
            Some(id) => {
                self.apply(ControllerEvent::ResumeFound)?;
                tracing::info!(session_id = id, backend = self.backend.name(), "resuming incomplete session");
                (id, true)
            }
            None => {
                if !eligibility.eligible {
                    let reason = eligibility
                        .reason
                        .unwrap_or_else(|| "not eligible for this assessment".into());
                    return Err(AssessmentError::Eligibility(reason));
                }
                let id = self.backend.start_session(auth, self.context.set_id).await?;
                tracing::info!(
                    session_id = id,
                    set_id = self.context.set_id,
                    backend = self.backend.name(),
                    "session started"
                );
                (id, false)
            }
        };

        {
            let mut data = lock(&self.data);
            data.session_id = Some(session_id);
            data.answers.clear();
        }

        match self.load_section(session_id, resumed).await {
            Ok(section) => Ok(section),
            Err(e) => {
                self.revert(ControllerEvent::LoadFailed);
                Err(e)
            }
        }
    }

    async fn advance_inner(&self) -> Result<AdvanceOutcome> {
        let (request, section, index, total) = {
            let data = lock(&self.data);
            data.state.on(ControllerEvent::AdvanceRequested)?;
            let session_id = data.session_id.ok_or(AssessmentError::NoActiveSession)?;
            let section = data.section.as_ref().ok_or(AssessmentError::NoActiveSession)?;
            let group = section.groups.get(data.index).ok_or_else(|| {
                AssessmentError::InvalidTransition {
                    state: data.state.to_string(),
                    action: "advance past the last group".into(),
                }
            })?;
            let missing = group.missing_answers(&data.answers);
            if missing > 0 {
                return Err(AssessmentError::Unanswered { missing });
            }
            let request = SubmitAnswersRequest {
                session_id,
                answers: data.answers.batch_for(group),
            };
            (request, section.kind, data.index, section.groups.len())
        };

        self.apply(ControllerEvent::AdvanceRequested)?;
        let reply = match self
            .backend
            .submit_answers(&self.context.credentials, &request)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                self.revert(ControllerEvent::GroupFailed);
                return Err(e.into());
            }
        };
        tracing::debug!(%section, index, total, last = reply.is_last_in_section, "group submitted");
        self.observer.on_group_submitted(section, index, total);

        if reply.is_last_in_section || index + 1 >= total {
            self.apply(ControllerEvent::LastGroupAccepted)?;
            let outcome = self.submit_section_inner(SubmitMode::Manual).await?;
            return Ok(AdvanceOutcome::SectionSubmitted(outcome));
        }

        let next_group = {
            let mut data = lock(&self.data);
            data.index = index + 1;
            data.section
                .as_ref()
                .and_then(|s| s.groups.get(index + 1))
                .cloned()
        };
        self.apply(ControllerEvent::GroupAccepted)?;
        if let Some(group) = next_group {
            self.audio.on_group_current(section, &group);
        }
        Ok(AdvanceOutcome::Moved { index: index + 1 })
    }

    async fn submit_section_manual(&self) -> Result<SectionOutcome> {
        if self.timer.is_expired() {
            self.apply(ControllerEvent::TimerExpired)?;
            return self.submit_section_inner(SubmitMode::Auto).await;
        }

        {
            let data = lock(&self.data);
            data.state.on(ControllerEvent::SubmitRequested)?;
            let missing: usize = data
                .section
                .as_ref()
                .map(|s| s.groups.iter().map(|g| g.missing_answers(&data.answers)).sum())
                .unwrap_or(0);
            if missing > 0 {
                return Err(AssessmentError::Unanswered { missing });
            }
        }
        self.apply(ControllerEvent::SubmitRequested)?;
        self.submit_section_inner(SubmitMode::Manual).await
    }

    /// Post the section. The controller must already be in `SubmittingSection`.
    async fn submit_section_inner(&self, mode: SubmitMode) -> Result<SectionOutcome> {
        let (session_id, section) = {
            let data = lock(&self.data);
            let session_id = data.session_id.ok_or(AssessmentError::NoActiveSession)?;
            let section = data
                .section
                .as_ref()
                .map(|s| s.kind)
                .ok_or(AssessmentError::NoActiveSession)?;
            (session_id, section)
        };

        let time_spent = self.timer.elapsed_secs();
        let request = SubmitSectionRequest {
            session_id,
            section,
            time_spent,
        };
        let reply = match self
            .backend
            .submit_section(&self.context.credentials, &request, mode)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                self.revert(ControllerEvent::SectionFailed);
                return Err(e.into());
            }
        };

        tracing::info!(session_id, %section, time_spent, ?mode, "section submitted");
        self.observer.on_section_submitted(section, time_spent, mode);
        self.timer.stop();
        self.audio.reset();

        if reply.completed || reply.next_section == Some(SectionKind::Completed) {
            self.apply(ControllerEvent::AssessmentFinished)?;
            tracing::info!(session_id, "assessment completed");
            self.observer.on_completed(session_id);
            return Ok(SectionOutcome::Completed);
        }

        self.apply(ControllerEvent::NextSection)?;
        {
            let mut data = lock(&self.data);
            data.answers.clear();
            data.index = 0;
            data.section = None;
            data.orphans.clear();
        }

        let loaded = match self.load_section(session_id, false).await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.revert(ControllerEvent::LoadFailed);
                return Err(e);
            }
        };
        if let Some(expected) = reply.next_section.filter(|s| *s != loaded) {
            tracing::warn!(%expected, %loaded, "backend announced another next section than it serves");
        }
        Ok(SectionOutcome::NextSection(loaded))
    }

    async fn reload_inner(&self) -> Result<SectionKind> {
        let session_id = {
            let data = lock(&self.data);
            data.session_id.ok_or(AssessmentError::NoActiveSession)?
        };
        if self.state() == ControllerState::SectionInProgress {
            self.apply(ControllerEvent::Desynced)?;
        } else {
            let state = self.state();
            if state != ControllerState::TransitioningSection {
                return Err(AssessmentError::InvalidTransition {
                    state: state.to_string(),
                    action: "reload the section".into(),
                });
            }
        }

        self.timer.stop();
        match self.load_section(session_id, true).await {
            Ok(section) => Ok(section),
            Err(e) => {
                self.revert(ControllerEvent::LoadFailed);
                Err(e)
            }
        }
    }

    /// Fetch the active section, organize it, restore stored answers when
    /// `restore_answers` is set, and start its timer.
    ///
    /// When the same section is served again, unsubmitted local selections
    /// win over stored answers and audio playback state is kept.
    async fn load_section(&self, session_id: SessionId, restore_answers: bool) -> Result<SectionKind> {
        let auth = &self.context.credentials;
        let mut reloads = 0;
        let (previous, local) = {
            let data = lock(&self.data);
            (data.section.as_ref().map(|s| s.kind), data.answers.clone())
        };

        loop {
            let served = self.backend.questions(auth, session_id).await?;
            let kind = served.current_section;
            if kind == SectionKind::Completed {
                return Err(AssessmentError::Eligibility(
                    "assessment already completed".into(),
                ));
            }

            let organized = organize(&served.questions);
            for warning in validate_groups(&organized.groups) {
                tracing::warn!(group_id = warning.group_id, %kind, "{}", warning.message);
            }
            let section = Section {
                kind,
                groups: organized.groups,
                time_limit_secs: u64::from(served.time_limit) * 60,
            };

            let mut answers = AnswerSet::new();
            if restore_answers {
                let stored = self.backend.existing_answers(auth, session_id).await?;
                if stored.section == kind {
                    answers = stored
                        .existing_answers
                        .into_iter()
                        .filter(|(id, _)| section.contains(*id))
                        .collect();
                } else {
                    tracing::warn!(
                        answers_section = %stored.section,
                        %kind,
                        "stored answers belong to another section, ignoring them"
                    );
                }
            }

            let same_section = previous == Some(kind);
            if same_section {
                for (id, choice) in local.iter().filter(|(id, _)| section.contains(*id)) {
                    answers.select(id, choice);
                }
            }

            match self.timer.initialize(session_id, kind, served.time_limit).await? {
                TimerInit::SectionMismatch { expected, actual } => {
                    reloads += 1;
                    if reloads > self.settings.desync_reload_limit {
                        return Err(AssessmentError::SectionDesync { expected, actual });
                    }
                    tracing::warn!(%expected, %actual, reloads, "section desync, reloading questions");
                    continue;
                }
                TimerInit::Running(_) | TimerInit::Expired(_) => {}
            }

            let index = section
                .groups
                .iter()
                .position(|g| g.missing_answers(&answers) > 0)
                .unwrap_or_else(|| section.groups.len().saturating_sub(1));
            let current = section.groups.get(index).cloned();
            let group_count = section.groups.len();
            let answered = answers.len();

            {
                let mut data = lock(&self.data);
                data.section = Some(section);
                data.index = index;
                data.answers = answers;
                data.orphans = organized.orphans;
            }
            self.apply(ControllerEvent::SectionLoaded)?;

            tracing::info!(session_id, %kind, groups = group_count, answered, index, "section loaded");
            self.observer.on_section_loaded(kind, group_count, answered);
            if !same_section {
                self.audio.reset();
            }
            if let Some(group) = current {
                self.audio.on_group_current(kind, &group);
            }
            return Ok(kind);
        }
    }

    // -----------------------------------------------------------------------
    // Expiry
    // -----------------------------------------------------------------------

    async fn handle_expiry(&self, section: SectionKind) {
        *lock(&self.pending_expiry) = Some(section);
        self.drain_expiry().await;
    }

    /// Run parked expiries while the in-flight flag can be taken.
    async fn drain_expiry(&self) {
        loop {
            let Ok(flight) = self.begin_flight() else {
                tracing::debug!("submission in flight, expiry parked");
                return;
            };
            let parked = lock(&self.pending_expiry).take();
            let Some(section) = parked else {
                return;
            };

            let result = self.auto_submit(section).await;
            drop(flight);
            if let Err(e) = result {
                let e = self.handle_error(e);
                tracing::warn!(%section, "auto-submit failed: {e}");
            }
            if lock(&self.pending_expiry).is_none() {
                return;
            }
        }
    }

    async fn auto_submit(&self, section: SectionKind) -> Result<Option<SectionOutcome>> {
        {
            let data = lock(&self.data);
            let current = data.section.as_ref().map(|s| s.kind);
            if data.state != ControllerState::SectionInProgress || current != Some(section) {
                tracing::debug!(%section, state = %data.state, "dropping stale expiry");
                return Ok(None);
            }
        }
        self.apply(ControllerEvent::TimerExpired)?;
        self.submit_section_inner(SubmitMode::Auto).await.map(Some)
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn begin_flight(&self) -> Result<Flight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| AssessmentError::Busy)?;
        Ok(Flight {
            flag: &self.in_flight,
        })
    }

    /// Release the flag and hand any parked expiry to a fresh task.
    fn end_flight(&self, flight: Flight<'_>) {
        drop(flight);
        if lock(&self.pending_expiry).is_some() {
            if let Some(controller) = self.me.upgrade() {
                tokio::spawn(async move { controller.drain_expiry().await });
            }
        }
    }

    fn apply(&self, event: ControllerEvent) -> Result<ControllerState> {
        let mut data = lock(&self.data);
        let next = data.state.on(event)?;
        tracing::trace!(from = %data.state, to = %next, %event, "controller transition");
        data.state = next;
        Ok(next)
    }

    /// Apply a failure event, logging instead of masking the original error.
    fn revert(&self, event: ControllerEvent) {
        if let Err(e) = self.apply(event) {
            tracing::error!("state machine rejected recovery: {e}");
        }
    }

    fn handle_error(&self, err: AssessmentError) -> AssessmentError {
        if err.is_terminal() {
            {
                let mut data = lock(&self.data);
                if let Ok(next) = data.state.on(ControllerEvent::Fatal) {
                    data.state = next;
                }
            }
            self.timer.stop();
            self.audio.reset();
            tracing::error!("session ended: {err}");
        } else if err.is_retryable() {
            tracing::warn!("retryable failure: {err}");
        } else {
            tracing::debug!("rejected: {err}");
        }
        self.observer.on_error(&err);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    use crate::clock::fixed_now;
    use crate::error::BackendError;
    use crate::mock::{Endpoint, MockBackend, MockSection};
    use crate::model::{Credentials, Question};
    use crate::timer::TimerPhase;

    #[derive(Default)]
    struct CountingPlayer {
        plays: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl AudioPlayer for CountingPlayer {
        async fn play(&self, _url: &str) -> anyhow::Result<()> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn q(id: QuestionId, order: u32, group_id: Option<QuestionId>) -> Question {
        Question {
            id,
            order_number: order,
            prompt: format!("question {id}"),
            option_a: Some("a".into()),
            option_b: Some("b".into()),
            option_c: Some("c".into()),
            option_d: Some("d".into()),
            audio_url: None,
            image_url: None,
            group_id,
        }
    }

    fn passage(id: QuestionId) -> Question {
        Question {
            option_a: None,
            option_b: None,
            option_c: None,
            option_d: None,
            group_id: Some(id),
            ..q(id, 0, None)
        }
    }

    /// One 3-question group and one individual question.
    fn structure_section() -> MockSection {
        MockSection::new(
            SectionKind::Structure,
            10,
            vec![
                passage(100),
                q(1, 1, Some(100)),
                q(2, 2, Some(100)),
                q(3, 3, Some(100)),
                q(4, 4, None),
            ],
        )
    }

    /// One listening group with audio and two questions.
    fn listening_section() -> MockSection {
        let mut parent = passage(10);
        parent.audio_url = Some("https://cdn.example.com/10.mp3".into());
        MockSection::new(
            SectionKind::Listening,
            10,
            vec![parent, q(11, 1, Some(10)), q(12, 2, Some(10))],
        )
    }

    fn controller(backend: &Arc<MockBackend>, clock: Clock) -> Arc<SessionController> {
        let backend: Arc<dyn AssessmentBackend> = backend.clone();
        SessionController::builder(backend, ExamContext::new(7, Credentials::bearer("t")))
            .with_clock(clock)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn advance_rejects_incomplete_group_with_exact_count() {
        let clock = Clock::tokio_at(fixed_now());
        let backend = Arc::new(MockBackend::new(clock, vec![structure_section()]));
        let ctrl = controller(&backend, clock);
        ctrl.start().await.unwrap();

        ctrl.select_answer(2, Choice::A).unwrap();
        let err = ctrl.advance().await.unwrap_err();
        assert!(matches!(err, AssessmentError::Unanswered { missing: 2 }));
        assert_eq!(ctrl.state(), ControllerState::SectionInProgress);
        assert_eq!(backend.count(Endpoint::SubmitAnswers), 0);

        ctrl.select_answer(1, Choice::B).unwrap();
        ctrl.select_answer(3, Choice::C).unwrap();
        assert_eq!(ctrl.advance().await.unwrap(), AdvanceOutcome::Moved { index: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn select_answer_outside_section_is_rejected() {
        let clock = Clock::tokio_at(fixed_now());
        let backend = Arc::new(MockBackend::new(clock, vec![structure_section()]));
        let ctrl = controller(&backend, clock);
        ctrl.start().await.unwrap();
        assert!(matches!(
            ctrl.select_answer(999, Choice::A),
            Err(AssessmentError::UnknownQuestion(999))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_group_submission_keeps_position_and_payload() {
        let clock = Clock::tokio_at(fixed_now());
        let backend = Arc::new(MockBackend::new(clock, vec![structure_section()]));
        let ctrl = controller(&backend, clock);
        ctrl.start().await.unwrap();
        for id in 1..=3 {
            ctrl.select_answer(id, Choice::D).unwrap();
        }
        let before = ctrl.pending_batch().unwrap();

        backend.fail_next(Endpoint::SubmitAnswers, BackendError::Network("reset".into()));
        let err = ctrl.advance().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ctrl.current_index(), 0);
        assert_eq!(ctrl.answers().len(), 3);
        assert_eq!(ctrl.state(), ControllerState::SectionInProgress);
        assert_eq!(ctrl.pending_batch().unwrap(), before);

        ctrl.advance().await.unwrap();
        let submitted: Vec<SubmitAnswersRequest> = backend
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                crate::mock::BackendCall::SubmitAnswers(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(submitted, vec![before.clone(), before]);
    }

    #[tokio::test(start_paused = true)]
    async fn last_group_triggers_single_section_submission_with_elapsed_time() {
        let clock = Clock::tokio_at(fixed_now());
        let backend = Arc::new(MockBackend::new(clock, vec![structure_section()]));
        let ctrl = controller(&backend, clock);
        ctrl.start().await.unwrap();

        for id in 1..=3 {
            ctrl.select_answer(id, Choice::A).unwrap();
        }
        tokio::time::advance(Duration::from_secs(40)).await;
        ctrl.advance().await.unwrap();
        ctrl.select_answer(4, Choice::B).unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        let outcome = ctrl.advance().await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::SectionSubmitted(SectionOutcome::Completed));
        assert_eq!(backend.count(Endpoint::SubmitAnswers), 2);
        assert_eq!(backend.count(Endpoint::SubmitSection), 1);
        assert_eq!(backend.count(Endpoint::AutoSubmitSection), 0);
        let time_spent = backend.calls().into_iter().find_map(|c| match c {
            crate::mock::BackendCall::SubmitSection { request, .. } => Some(request.time_spent),
            _ => None,
        });
        assert_eq!(time_spent, Some(60));
        assert_eq!(ctrl.state(), ControllerState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_start_is_terminal() {
        let clock = Clock::tokio_at(fixed_now());
        let backend = Arc::new(MockBackend::new(clock, vec![structure_section()]));
        backend.fail_next(Endpoint::Start, BackendError::Forbidden("no attempts left".into()));
        let ctrl = controller(&backend, clock);

        let err = ctrl.start().await.unwrap_err();
        assert!(matches!(err, AssessmentError::Eligibility(_)));
        assert_eq!(ctrl.state(), ControllerState::Failed);
        assert!(ctrl.start().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn network_failure_on_start_is_retryable() {
        let clock = Clock::tokio_at(fixed_now());
        let backend = Arc::new(MockBackend::new(clock, vec![structure_section()]));
        backend.fail_next(Endpoint::Questions, BackendError::Timeout(30));
        let ctrl = controller(&backend, clock);

        assert!(ctrl.start().await.unwrap_err().is_retryable());
        assert_eq!(ctrl.state(), ControllerState::Initializing);

        // The session exists now, so the retry resumes it.
        assert_eq!(ctrl.start().await.unwrap(), SectionKind::Structure);
        assert_eq!(backend.count(Endpoint::Start), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn desync_reload_gives_up_after_limit() {
        let clock = Clock::tokio_at(fixed_now());
        let backend = Arc::new(MockBackend::new(clock, vec![structure_section()]));
        backend.set_timer_state(crate::traits::TimerStateResponse {
            current_section: SectionKind::Reading,
            elapsed_time: 0,
            is_expired: false,
            time_remaining: 600,
            section_started_at: None,
        });
        let ctrl = controller(&backend, clock);

        let err = ctrl.start().await.unwrap_err();
        assert!(matches!(err, AssessmentError::SectionDesync { .. }));
        assert!(!err.is_terminal());
        assert_eq!(backend.count(Endpoint::Questions), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_restores_answers_and_skips_answered_groups() {
        let clock = Clock::tokio_at(fixed_now());
        let backend = Arc::new(
            MockBackend::new(clock, vec![structure_section()])
                .with_incomplete_session(42, 0, [(1, Choice::A), (2, Choice::B), (3, Choice::C)]),
        );
        backend.set_section_started_at(fixed_now() - TimeDelta::seconds(120));
        let ctrl = controller(&backend, clock);

        ctrl.start().await.unwrap();
        assert_eq!(backend.count(Endpoint::Start), 0);
        assert_eq!(ctrl.session().unwrap().id, 42);
        assert_eq!(ctrl.current_index(), 1);
        assert_eq!(ctrl.answers().len(), 3);
        assert_eq!(ctrl.snapshot().timer.remaining_secs, 480);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_keeps_unsubmitted_answers_and_played_audio() {
        let clock = Clock::tokio_at(fixed_now());
        let backend = Arc::new(MockBackend::new(clock, vec![listening_section()]));
        let player = Arc::new(CountingPlayer::default());
        let ctrl = {
            let dyn_backend: Arc<dyn AssessmentBackend> = backend.clone();
            SessionController::builder(dyn_backend, ExamContext::new(7, Credentials::bearer("t")))
                .with_clock(clock)
                .with_player(player.clone())
                .build()
        };

        ctrl.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(player.plays.load(Ordering::SeqCst), 1);

        ctrl.select_answer(11, Choice::A).unwrap();
        assert_eq!(ctrl.reload_section().await.unwrap(), SectionKind::Listening);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(player.plays.load(Ordering::SeqCst), 1);
        assert!(ctrl.audio().has_played(10));
        assert_eq!(ctrl.answers().get(11), Some(Choice::A));
        assert_eq!(ctrl.state(), ControllerState::SectionInProgress);
        assert_eq!(backend.count(Endpoint::SubmitAnswers), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_timer_state_ends_the_session() {
        let clock = Clock::tokio_at(fixed_now());
        let backend = Arc::new(MockBackend::new(clock, vec![structure_section()]));
        backend.fail_next(Endpoint::TimerState, BackendError::Unauthorized("token expired".into()));
        let ctrl = controller(&backend, clock);

        let err = ctrl.start().await.unwrap_err();
        assert!(matches!(err, AssessmentError::Auth(_)));
        assert!(err.is_terminal());
        assert_eq!(ctrl.state(), ControllerState::Failed);
        assert_eq!(ctrl.timer().phase(), TimerPhase::Stopped);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.count(Endpoint::SyncTimer), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_audio_needs_a_current_group() {
        let clock = Clock::tokio_at(fixed_now());
        let backend = Arc::new(MockBackend::new(clock, vec![listening_section()]));
        let ctrl = controller(&backend, clock);
        assert_eq!(ctrl.start_audio().await, Err(AudioError::NoCurrentGroup));
    }
}
