//! Session controller state machine.
//!
//! Every controller operation moves through [`ControllerState::on`]; any
//! (state, event) pair missing from the table is rejected, which closes the
//! race windows between user actions, timer expiry, and backend replies.

use std::fmt;

use crate::error::AssessmentError;

/// Where the controller is in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Initializing,
    Resuming,
    SectionInProgress,
    SubmittingGroup,
    SubmittingSection,
    TransitioningSection,
    Completed,
    Failed,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Eligibility reported an unfinished session.
    ResumeFound,
    /// Section questions, answers and timer are in place.
    SectionLoaded,
    /// Loading a section failed with a retryable error.
    LoadFailed,
    /// The user asked to submit the current group.
    AdvanceRequested,
    /// The group was accepted and more groups follow.
    GroupAccepted,
    /// The group was accepted and it was the last one.
    LastGroupAccepted,
    /// The group submission failed.
    GroupFailed,
    /// The user asked to finish the section.
    SubmitRequested,
    /// The section timer expired.
    TimerExpired,
    /// The section submission failed.
    SectionFailed,
    /// The backend moved on to another section.
    NextSection,
    /// The backend reported the assessment complete.
    AssessmentFinished,
    /// The backend turned out to be in another section.
    Desynced,
    /// An eligibility or auth failure.
    Fatal,
}

impl ControllerState {
    /// Apply `event`, returning the next state.
    pub fn on(self, event: ControllerEvent) -> Result<ControllerState, AssessmentError> {
        use ControllerEvent as E;
        use ControllerState as S;

        let next = match (self, event) {
            (S::Completed | S::Failed, _) => None,
            (_, E::Fatal) => Some(S::Failed),

            (S::Initializing, E::ResumeFound) => Some(S::Resuming),
            (S::Initializing | S::Resuming, E::SectionLoaded) => Some(S::SectionInProgress),
            (S::Initializing | S::Resuming, E::LoadFailed) => Some(S::Initializing),

            (S::SectionInProgress, E::AdvanceRequested) => Some(S::SubmittingGroup),
            (S::SubmittingGroup, E::GroupAccepted | E::GroupFailed) => Some(S::SectionInProgress),
            (S::SubmittingGroup, E::LastGroupAccepted) => Some(S::SubmittingSection),

            (S::SectionInProgress, E::SubmitRequested | E::TimerExpired) => {
                Some(S::SubmittingSection)
            }
            (S::SubmittingSection, E::SectionFailed) => Some(S::SectionInProgress),
            (S::SubmittingSection, E::NextSection) => Some(S::TransitioningSection),
            (S::SubmittingSection, E::AssessmentFinished) => Some(S::Completed),

            (S::SectionInProgress | S::TransitioningSection, E::Desynced) => {
                Some(S::TransitioningSection)
            }
            (S::TransitioningSection, E::SectionLoaded) => Some(S::SectionInProgress),
            (S::TransitioningSection, E::LoadFailed) => Some(S::TransitioningSection),

            _ => None,
        };

        next.ok_or_else(|| AssessmentError::InvalidTransition {
            state: self.to_string(),
            action: event.to_string(),
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ControllerState::Completed | ControllerState::Failed)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Initializing => "initializing",
            ControllerState::Resuming => "resuming",
            ControllerState::SectionInProgress => "section in progress",
            ControllerState::SubmittingGroup => "submitting group",
            ControllerState::SubmittingSection => "submitting section",
            ControllerState::TransitioningSection => "transitioning section",
            ControllerState::Completed => "completed",
            ControllerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerEvent::ResumeFound => "resume",
            ControllerEvent::SectionLoaded => "load section",
            ControllerEvent::LoadFailed => "fail loading",
            ControllerEvent::AdvanceRequested => "advance",
            ControllerEvent::GroupAccepted => "accept group",
            ControllerEvent::LastGroupAccepted => "accept last group",
            ControllerEvent::GroupFailed => "fail group",
            ControllerEvent::SubmitRequested => "submit section",
            ControllerEvent::TimerExpired => "auto-submit section",
            ControllerEvent::SectionFailed => "fail section",
            ControllerEvent::NextSection => "move to next section",
            ControllerEvent::AssessmentFinished => "finish assessment",
            ControllerEvent::Desynced => "resync section",
            ControllerEvent::Fatal => "fail session",
        };
        f.write_str(name)
    }
}
