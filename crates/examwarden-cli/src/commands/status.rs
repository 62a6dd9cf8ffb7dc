//! The `examwarden status` command.

use std::path::PathBuf;

use anyhow::Result;
use comfy_table::Table;

use examwarden_client::load_config_from;
use examwarden_core::traits::AssessmentBackend;

use super::clock;
use crate::Format;

pub async fn execute(session_id: i64, format: Format, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;
    let backend = config.create_backend()?;
    let credentials = config.credentials()?;

    let state = backend.timer_state(&credentials, session_id).await?;

    if format == Format::Json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    let remaining = u64::try_from(state.time_remaining).unwrap_or(0);
    let started = state
        .section_started_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".into());

    let mut table = Table::new();
    table.set_header(vec!["Session", "Section", "Elapsed", "Remaining", "Expired", "Started"]);
    table.add_row(vec![
        session_id.to_string(),
        state.current_section.to_string(),
        clock(state.elapsed_time),
        clock(remaining),
        if state.is_expired || remaining == 0 { "yes" } else { "no" }.to_string(),
        started,
    ]);
    println!("{table}");

    Ok(())
}
