//! The `examwarden validate` command.

use std::path::PathBuf;

use anyhow::Result;

use examwarden_core::sheet;

pub fn execute(answers_path: PathBuf) -> Result<()> {
    let parsed = sheet::parse_answer_sheet(&answers_path)?;
    let name = if parsed.name.is_empty() {
        answers_path.display().to_string()
    } else {
        parsed.name.clone()
    };
    println!(
        "Answer sheet: {name} (set {}, {} answers)",
        parsed.set_id,
        parsed.entries.len()
    );
    if let Some(fallback) = parsed.fallback {
        println!("  Fallback choice: {fallback}");
    }

    let warnings = sheet::validate_answer_sheet(&parsed);
    for w in &warnings {
        let prefix = w
            .question_id
            .map(|id| format!("  [{id}]"))
            .unwrap_or_else(|| "  ".to_string());
        println!("{prefix} WARNING: {}", w.message);
    }

    if warnings.is_empty() {
        println!("Answer sheet valid.");
    } else {
        println!("\n{} warning(s) found.", warnings.len());
    }

    Ok(())
}
