//! The `examwarden eligibility` command.

use std::path::PathBuf;

use anyhow::Result;
use comfy_table::Table;

use examwarden_client::load_config_from;
use examwarden_core::traits::AssessmentBackend;

use crate::Format;

pub async fn execute(set_id: i64, format: Format, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;
    let backend = config.create_backend()?;
    let credentials = config.credentials()?;

    let reply = backend.eligibility(&credentials, set_id).await?;

    if format == Format::Json {
        println!("{}", serde_json::to_string_pretty(&reply)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Set", "Eligible", "Reason", "Incomplete session", "Section"]);
    let (session, section) = match &reply.incomplete_session {
        Some(s) if reply.has_incomplete => (
            s.id.to_string(),
            s.current_section.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
        ),
        _ => ("-".into(), "-".into()),
    };
    table.add_row(vec![
        set_id.to_string(),
        if reply.eligible { "yes" } else { "no" }.to_string(),
        reply.reason.clone().unwrap_or_else(|| "-".into()),
        session,
        section,
    ]);
    println!("{table}");

    Ok(())
}
