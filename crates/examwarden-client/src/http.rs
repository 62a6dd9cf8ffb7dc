//! HTTP implementation of the assessment backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::instrument;

use examwarden_core::error::BackendError;
use examwarden_core::model::{Credentials, SessionId, SetId};
use examwarden_core::traits::{
    AssessmentBackend, Delivery, Eligibility, ExistingAnswers, SectionQuestions,
    SectionSubmitResponse, StartSessionRequest, StartSessionResponse, SubmitAnswersRequest,
    SubmitAnswersResponse, SubmitMode, SubmitSectionRequest, SyncTimerRequest, TimerStateResponse,
};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_GUARANTEED_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Assessment backend reached over HTTP/JSON.
pub struct HttpBackend {
    base_url: String,
    timeout_secs: u64,
    guaranteed_attempts: u32,
    retry_delay: Duration,
    client: reqwest::Client,
}

impl HttpBackend {
    /// Create a backend rooted at `base_url` (e.g. `https://host/api/assessment`).
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self, BackendError> {
        let timeout_secs = timeout.map_or(DEFAULT_TIMEOUT_SECS, |t| t.as_secs().max(1));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| BackendError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
            guaranteed_attempts: DEFAULT_GUARANTEED_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            client,
        })
    }

    /// Retry budget for [`Delivery::Guaranteed`] syncs. The delay doubles after
    /// every failed attempt.
    pub fn with_guaranteed_delivery(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.guaranteed_attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn get(&self, auth: &Credentials, path: &str) -> RequestBuilder {
        self.client
            .get(self.url(path))
            .header("Authorization", auth.authorization())
            .header("Accept", "application/json")
    }

    fn post(&self, auth: &Credentials, path: &str) -> RequestBuilder {
        self.client
            .post(self.url(path))
            .header("Authorization", auth.authorization())
            .header("Accept", "application/json")
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(self.timeout_secs)
            } else {
                BackendError::Network(e.to_string())
            }
        })?;
        check_status(response).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BackendError> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

/// Map an HTTP status to a `BackendError`.
async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status().as_u16();
    if status < 400 {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        401 => BackendError::Unauthorized(body),
        403 => BackendError::Forbidden(body),
        400..=499 => BackendError::Rejected {
            status,
            message: body,
        },
        _ => BackendError::Server {
            status,
            message: body,
        },
    })
}

/// Whether a failed sync may succeed when repeated unchanged.
fn is_transient(err: &BackendError) -> bool {
    matches!(
        err,
        BackendError::Timeout(_) | BackendError::Network(_) | BackendError::Server { .. }
    )
}

#[async_trait]
impl AssessmentBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, auth))]
    async fn eligibility(&self, auth: &Credentials, set_id: SetId) -> Result<Eligibility, BackendError> {
        let request = self.get(auth, "eligibility").query(&[("set_id", set_id)]);
        self.send_json(request).await
    }

    #[instrument(skip(self, auth))]
    async fn start_session(&self, auth: &Credentials, set_id: SetId) -> Result<SessionId, BackendError> {
        let request = self.post(auth, "start").json(&StartSessionRequest { set_id });
        let reply: StartSessionResponse = self.send_json(request).await?;
        tracing::debug!(session_id = reply.session_id, "session created");
        Ok(reply.session_id)
    }

    #[instrument(skip(self, auth))]
    async fn questions(&self, auth: &Credentials, session_id: SessionId) -> Result<SectionQuestions, BackendError> {
        let request = self.get(auth, &format!("sessions/{session_id}/questions"));
        self.send_json(request).await
    }

    #[instrument(skip(self, auth))]
    async fn existing_answers(
        &self,
        auth: &Credentials,
        session_id: SessionId,
    ) -> Result<ExistingAnswers, BackendError> {
        let request = self.get(auth, &format!("sessions/{session_id}/existing-answers"));
        self.send_json(request).await
    }

    #[instrument(skip(self, auth, request), fields(session_id = request.session_id, answers = request.answers.len()))]
    async fn submit_answers(
        &self,
        auth: &Credentials,
        request: &SubmitAnswersRequest,
    ) -> Result<SubmitAnswersResponse, BackendError> {
        let http = self.post(auth, "submit-question").json(request);
        self.send_json(http).await
    }

    #[instrument(skip(self, auth, request), fields(session_id = request.session_id, section = %request.section))]
    async fn submit_section(
        &self,
        auth: &Credentials,
        request: &SubmitSectionRequest,
        mode: SubmitMode,
    ) -> Result<SectionSubmitResponse, BackendError> {
        let path = match mode {
            SubmitMode::Manual => "submit-section",
            SubmitMode::Auto => "auto-submit-section",
        };
        let http = self.post(auth, path).json(request);
        self.send_json(http).await
    }

    #[instrument(skip(self, auth))]
    async fn timer_state(&self, auth: &Credentials, session_id: SessionId) -> Result<TimerStateResponse, BackendError> {
        let request = self.get(auth, &format!("sessions/{session_id}/timer-state"));
        self.send_json(request).await
    }

    #[instrument(skip(self, auth, request), fields(session_id = request.session_id, time_spent = request.time_spent))]
    async fn sync_timer(
        &self,
        auth: &Credentials,
        request: &SyncTimerRequest,
        delivery: Delivery,
    ) -> Result<(), BackendError> {
        let attempts = match delivery {
            Delivery::BestEffort => 1,
            Delivery::Guaranteed => self.guaranteed_attempts,
        };
        let mut delay = self.retry_delay;
        let mut attempt = 1;
        loop {
            let http = self.post(auth, "sync-timer").json(request);
            match self.send(http).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < attempts && is_transient(&e) => {
                    tracing::warn!(attempt, "timer sync failed, retrying in {delay:?}: {e}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use examwarden_core::model::{AnswerEntry, Choice, SectionKind};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn auth() -> Credentials {
        Credentials::bearer("test-token")
    }

    fn backend(server: &MockServer) -> HttpBackend {
        HttpBackend::new(&server.uri(), Some(Duration::from_secs(5)))
            .unwrap()
            .with_guaranteed_delivery(3, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn eligibility_sends_set_id_and_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/eligibility"))
            .and(query_param("set_id", "4"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "eligible": true,
                "has_incomplete": true,
                "incomplete_session": {"id": 12, "current_section": "reading"}
            })))
            .mount(&server)
            .await;

        let reply = backend(&server).eligibility(&auth(), 4).await.unwrap();
        assert!(reply.eligible);
        let incomplete = reply.incomplete_session.unwrap();
        assert_eq!(incomplete.id, 12);
        assert_eq!(incomplete.current_section, Some(SectionKind::Reading));
    }

    #[tokio::test]
    async fn start_returns_session_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/start"))
            .and(body_json(serde_json::json!({"set_id": 4})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"session_id": 99})))
            .mount(&server)
            .await;

        assert_eq!(backend(&server).start_session(&auth(), 4).await.unwrap(), 99);
    }

    #[tokio::test]
    async fn submit_answers_posts_the_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit-question"))
            .and(body_json(serde_json::json!({
                "session_id": 3,
                "answers": [{"question_id": 1, "answer": "B"}, {"question_id": 2, "answer": "D"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"is_last_in_section": true})))
            .mount(&server)
            .await;

        let request = SubmitAnswersRequest {
            session_id: 3,
            answers: vec![
                AnswerEntry { question_id: 1, answer: Choice::B },
                AnswerEntry { question_id: 2, answer: Choice::D },
            ],
        };
        let reply = backend(&server).submit_answers(&auth(), &request).await.unwrap();
        assert!(reply.is_last_in_section);
    }

    #[tokio::test]
    async fn auto_mode_uses_auto_submit_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auto-submit-section"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "completed": false,
                "next_section": "structure"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = SubmitSectionRequest {
            session_id: 3,
            section: SectionKind::Listening,
            time_spent: 1800,
        };
        let reply = backend(&server)
            .submit_section(&auth(), &request, SubmitMode::Auto)
            .await
            .unwrap();
        assert_eq!(reply.next_section, Some(SectionKind::Structure));
    }

    #[tokio::test]
    async fn timer_state_parses_anchor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions/3/timer-state"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "current_section": "listening",
                "elapsed_time": 540,
                "is_expired": false,
                "time_remaining": 60,
                "section_started_at": "2023-11-14T22:04:20Z"
            })))
            .mount(&server)
            .await;

        let state = backend(&server).timer_state(&auth(), 3).await.unwrap();
        assert_eq!(state.elapsed_time, 540);
        assert_eq!(state.section_started_at.map(|t| t.timestamp()), Some(1_699_999_460));
    }

    #[tokio::test]
    async fn status_codes_map_to_errors() {
        let server = MockServer::start().await;
        Mock::given(path("/sessions/1/questions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
            .mount(&server)
            .await;
        Mock::given(path("/start"))
            .respond_with(ResponseTemplate::new(403).set_body_string("no attempts left"))
            .mount(&server)
            .await;
        Mock::given(path("/sessions/2/questions"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/sessions/3/questions"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let backend = backend(&server);
        assert!(matches!(
            backend.questions(&auth(), 1).await,
            Err(BackendError::Unauthorized(body)) if body == "expired"
        ));
        assert!(matches!(
            backend.start_session(&auth(), 1).await,
            Err(BackendError::Forbidden(_))
        ));
        assert!(matches!(
            backend.questions(&auth(), 2).await,
            Err(BackendError::Rejected { status: 404, .. })
        ));
        assert!(matches!(
            backend.questions(&auth(), 3).await,
            Err(BackendError::Server { status: 502, .. })
        ));
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(path("/sessions/1/existing-answers"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        assert!(matches!(
            backend(&server).existing_answers(&auth(), 1).await,
            Err(BackendError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn guaranteed_sync_retries_transient_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync-timer"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sync-timer"))
            .and(body_json(serde_json::json!({"session_id": 3, "time_spent": 42})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let request = SyncTimerRequest {
            session_id: 3,
            time_spent: 42,
        };
        backend(&server)
            .sync_timer(&auth(), &request, Delivery::Guaranteed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn best_effort_sync_does_not_retry() {
        let server = MockServer::start().await;
        Mock::given(path("/sync-timer"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let request = SyncTimerRequest {
            session_id: 3,
            time_spent: 42,
        };
        let result = backend(&server)
            .sync_timer(&auth(), &request, Delivery::BestEffort)
            .await;
        assert!(matches!(result, Err(BackendError::Server { status: 503, .. })));
    }

    #[tokio::test]
    async fn guaranteed_sync_never_retries_forbidden() {
        let server = MockServer::start().await;
        Mock::given(path("/sync-timer"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let request = SyncTimerRequest {
            session_id: 3,
            time_spent: 42,
        };
        let result = backend(&server)
            .sync_timer(&auth(), &request, Delivery::Guaranteed)
            .await;
        assert!(matches!(result, Err(BackendError::Forbidden(_))));
    }
}
