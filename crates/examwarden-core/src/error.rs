//! Error types for the assessment engine.
//!
//! `BackendError` describes a failed call to the assessment backend.
//! `AssessmentError` is the taxonomy the session controller exposes to its
//! callers: only eligibility and auth failures end a session, everything else
//! keeps state and can be retried.

use thiserror::Error;

use crate::model::SectionKind;

/// Errors that can occur when talking to the assessment backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The credential was rejected (HTTP 401).
    #[error("credential rejected: {0}")]
    Unauthorized(String),

    /// The caller may not perform this action (HTTP 403).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The backend refused the request (other 4xx).
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The backend failed (5xx).
    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    /// The request timed out.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// A network error occurred.
    #[error("network error: {0}")]
    Network(String),

    /// The response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Returns `true` if repeating the request cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BackendError::Unauthorized(_) | BackendError::Forbidden(_)
        )
    }
}

/// Errors surfaced by the session controller.
#[derive(Debug, Clone, Error)]
pub enum AssessmentError {
    /// The user may not take (or continue) this assessment. Terminal.
    #[error("not eligible: {0}")]
    Eligibility(String),

    /// The credential was rejected; the auth collaborator must sign out. Terminal.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The current group still has unanswered questions.
    #[error("{missing} question(s) in the current group are unanswered")]
    Unanswered { missing: usize },

    /// The question is not part of the active section.
    #[error("question {0} is not part of the current section")]
    UnknownQuestion(i64),

    /// The request did not reach the backend or no reply came back.
    #[error("network failure: {0}")]
    Network(String),

    /// The backend failed or refused the request.
    #[error("server failure: {0}")]
    Server(String),

    /// The backend is in another section than the one loaded locally.
    #[error("backend is in section {actual}, expected {expected}")]
    SectionDesync {
        expected: SectionKind,
        actual: SectionKind,
    },

    /// Another write is already in flight.
    #[error("another submission is already in progress")]
    Busy,

    /// The operation is not allowed in the controller's current state.
    #[error("cannot {action} while {state}")]
    InvalidTransition { state: String, action: String },

    /// No session has been started yet.
    #[error("no active session")]
    NoActiveSession,
}

impl AssessmentError {
    /// Errors after which the session cannot continue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AssessmentError::Eligibility(_) | AssessmentError::Auth(_)
        )
    }

    /// Errors worth retrying without any user correction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AssessmentError::Network(_)
                | AssessmentError::Server(_)
                | AssessmentError::SectionDesync { .. }
                | AssessmentError::Busy
        )
    }
}

impl From<BackendError> for AssessmentError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unauthorized(msg) => AssessmentError::Auth(msg),
            BackendError::Forbidden(msg) => AssessmentError::Eligibility(msg),
            BackendError::Timeout(_) | BackendError::Network(_) => {
                AssessmentError::Network(err.to_string())
            }
            BackendError::Rejected { .. } | BackendError::Server { .. } | BackendError::Decode(_) => {
                AssessmentError::Server(err.to_string())
            }
        }
    }
}

/// Errors from the audio playback guard.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    /// Playback already started once for this group.
    #[error("audio for group {0} has already been played")]
    AlreadyPlayed(i64),

    /// A start attempt for this group is still pending.
    #[error("audio for group {0} is already starting")]
    Starting(i64),

    /// The group has no audio attached.
    #[error("group {0} has no audio")]
    NoAudio(i64),

    /// No question group is current.
    #[error("no question group is current")]
    NoCurrentGroup,

    /// The player failed to start.
    #[error("playback failed: {0}")]
    Playback(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_classify_into_taxonomy() {
        let auth: AssessmentError = BackendError::Unauthorized("expired".into()).into();
        assert!(matches!(auth, AssessmentError::Auth(_)));
        assert!(auth.is_terminal());

        let denied: AssessmentError = BackendError::Forbidden("no quota".into()).into();
        assert!(matches!(denied, AssessmentError::Eligibility(_)));
        assert!(denied.is_terminal());

        let net: AssessmentError = BackendError::Timeout(30).into();
        assert!(matches!(net, AssessmentError::Network(_)));
        assert!(net.is_retryable());
        assert!(!net.is_terminal());

        let server: AssessmentError = BackendError::Server {
            status: 502,
            message: "bad gateway".into(),
        }
        .into();
        assert!(matches!(server, AssessmentError::Server(_)));
        assert!(server.is_retryable());
    }

    #[test]
    fn unanswered_reports_count() {
        let err = AssessmentError::Unanswered { missing: 2 };
        assert!(err.to_string().starts_with("2 question(s)"));
        assert!(!err.is_terminal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn permanent_backend_errors() {
        assert!(BackendError::Unauthorized(String::new()).is_permanent());
        assert!(BackendError::Forbidden(String::new()).is_permanent());
        assert!(!BackendError::Network(String::new()).is_permanent());
    }
}
