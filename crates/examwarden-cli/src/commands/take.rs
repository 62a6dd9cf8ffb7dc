//! The `examwarden take` command.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use examwarden_client::load_config_from;
use examwarden_core::controller::{SessionController, SessionObserver};
use examwarden_core::error::AssessmentError;
use examwarden_core::model::{ExamContext, SectionKind, SessionId};
use examwarden_core::sheet::{self, AnswerSheet};
use examwarden_core::state::ControllerState;
use examwarden_core::timer::TimerPhase;
use examwarden_core::traits::{AssessmentBackend, SubmitMode};

use super::clock;

const MAX_RETRIES: u32 = 3;

struct SectionRow {
    section: SectionKind,
    groups: usize,
    time_spent: u64,
    mode: SubmitMode,
}

/// Console progress observer; keeps the rows of the final summary.
#[derive(Default)]
struct ConsoleObserver {
    loaded: Mutex<Vec<(SectionKind, usize)>>,
    rows: Mutex<Vec<SectionRow>>,
}

impl SessionObserver for ConsoleObserver {
    fn on_section_loaded(&self, section: SectionKind, groups: usize, answered: usize) {
        eprintln!("  Section: {section} ({groups} groups, {answered} answered)");
        if let Ok(mut loaded) = self.loaded.lock() {
            loaded.push((section, groups));
        }
    }

    fn on_group_submitted(&self, section: SectionKind, index: usize, total: usize) {
        eprintln!("  Submitted: {section} group {}/{total}", index + 1);
    }

    fn on_section_submitted(&self, section: SectionKind, time_spent: u64, mode: SubmitMode) {
        let how = match mode {
            SubmitMode::Manual => "submitted",
            SubmitMode::Auto => "auto-submitted (time expired)",
        };
        eprintln!("  Done: {section} {how} after {}", clock(time_spent));
        let groups = self
            .loaded
            .lock()
            .ok()
            .and_then(|l| l.iter().rev().find(|(s, _)| *s == section).map(|(_, g)| *g))
            .unwrap_or(0);
        if let Ok(mut rows) = self.rows.lock() {
            rows.push(SectionRow {
                section,
                groups,
                time_spent,
                mode,
            });
        }
    }

    fn on_completed(&self, session_id: SessionId) {
        eprintln!("\nAssessment complete (session {session_id})");
    }

    fn on_error(&self, error: &AssessmentError) {
        if !matches!(error, AssessmentError::Busy) {
            eprintln!("  ERROR: {error}");
        }
    }
}

pub async fn execute(
    answers_path: PathBuf,
    set_id: Option<i64>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;
    let answers = sheet::parse_answer_sheet(&answers_path)?;
    for w in sheet::validate_answer_sheet(&answers) {
        eprintln!("  WARNING: {}", w.message);
    }

    let set_id = set_id.unwrap_or(answers.set_id);
    let backend: Arc<dyn AssessmentBackend> = Arc::new(config.create_backend()?);
    let context = ExamContext::new(set_id, config.credentials()?);
    let observer = Arc::new(ConsoleObserver::default());

    let controller = SessionController::builder(backend, context)
        .with_settings(config.controller_settings())
        .with_observer(observer.clone())
        .build();

    let started = Utc::now();
    eprintln!("Taking set {set_id}");

    let countdown = spawn_countdown(&controller);
    let outcome = tokio::select! {
        result = run(&controller, &answers) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };
    countdown.abort();
    controller.shutdown().await;
    outcome?;

    print_summary(&observer, Utc::now() - started);
    Ok(())
}

/// Answer and advance until the assessment completes.
async fn run(controller: &SessionController, answers: &AnswerSheet) -> Result<()> {
    with_retries(move || controller.start()).await?;

    let mut announced = None;
    loop {
        match controller.state() {
            ControllerState::Completed => return Ok(()),
            ControllerState::Failed => anyhow::bail!("session failed"),
            ControllerState::TransitioningSection => {
                with_retries(move || controller.reload_section()).await?;
                continue;
            }
            ControllerState::SectionInProgress => {
                let current = controller.section().map(|s| s.kind);
                if current != announced {
                    announced = current;
                    report_orphans(controller);
                }
            }
            _ => {
                // An auto-submit is running.
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
        }

        let Some(group) = controller.current_group() else {
            with_retries(move || controller.submit_section()).await?;
            continue;
        };
        let selected = controller.answers();
        for question in group.unanswered(&selected) {
            let choice = answers
                .choice_for(question.id)
                .with_context(|| format!("answer sheet has no answer for question {}", question.id))?;
            match controller.select_answer(question.id, choice) {
                Ok(()) => {}
                // The section moved on underneath us; re-read the state.
                Err(AssessmentError::InvalidTransition { .. } | AssessmentError::UnknownQuestion(_)) => break,
                Err(e) => return Err(e.into()),
            }
        }

        match controller.advance().await {
            Ok(_) => {}
            Err(AssessmentError::Busy | AssessmentError::InvalidTransition { .. }) => {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(AssessmentError::Unanswered { .. }) => {}
            Err(e) if e.is_retryable() => {
                with_retries(move || controller.advance()).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn report_orphans(controller: &SessionController) {
    let orphans = controller.orphans();
    if !orphans.is_empty() {
        let ids: Vec<String> = orphans.iter().map(|id| id.to_string()).collect();
        eprintln!(
            "  WARNING: {} question(s) reference a missing group: {}",
            orphans.len(),
            ids.join(", ")
        );
    }
}

/// Print the remaining time of the running section once per minute.
fn spawn_countdown(controller: &SessionController) -> tokio::task::JoinHandle<()> {
    let mut timer = controller.subscribe_timer();
    tokio::spawn(async move {
        let mut shown = None;
        while timer.changed().await.is_ok() {
            let snapshot = timer.borrow_and_update().clone();
            if snapshot.phase != TimerPhase::Running {
                shown = None;
                continue;
            }
            let minute = snapshot.remaining_secs.div_ceil(60);
            if shown == Some(minute) {
                continue;
            }
            shown = Some(minute);
            let section = snapshot.section.map(|s| s.to_string()).unwrap_or_default();
            let offline = if snapshot.degraded { " (offline)" } else { "" };
            eprintln!("  Time left in {section}: {}{offline}", clock(snapshot.remaining_secs));
        }
    })
}

/// Run `op` until it succeeds, a non-retryable error occurs, or the retry
/// budget is spent.
async fn with_retries<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AssessmentError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                attempt += 1;
                let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                tracing::warn!(attempt, "retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_summary(observer: &ConsoleObserver, total: chrono::TimeDelta) {
    use comfy_table::{Cell, Table};

    let mut table = Table::new();
    table.set_header(vec!["Section", "Groups", "Time spent", "Submission"]);

    let rows = match observer.rows.lock() {
        Ok(rows) => rows,
        Err(poisoned) => poisoned.into_inner(),
    };
    for row in rows.iter() {
        table.add_row(vec![
            Cell::new(row.section),
            Cell::new(row.groups),
            Cell::new(clock(row.time_spent)),
            Cell::new(match row.mode {
                SubmitMode::Manual => "manual",
                SubmitMode::Auto => "auto (expired)",
            }),
        ]);
    }

    eprintln!("\n{table}");
    eprintln!("Total wall time: {}", clock(total.num_seconds().max(0) as u64));
}
