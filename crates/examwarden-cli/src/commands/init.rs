//! The `examwarden init` command.

use std::path::Path;

use anyhow::Result;

pub fn execute() -> Result<()> {
    if Path::new("examwarden.toml").exists() {
        println!("examwarden.toml already exists, skipping.");
    } else {
        std::fs::write("examwarden.toml", SAMPLE_CONFIG)?;
        println!("Created examwarden.toml");
    }

    std::fs::create_dir_all("answers")?;
    let example_path = Path::new("answers/example.toml");
    if example_path.exists() {
        println!("answers/example.toml already exists, skipping.");
    } else {
        std::fs::write(example_path, EXAMPLE_SHEET)?;
        println!("Created answers/example.toml");
    }

    println!("\nNext steps:");
    println!("  1. Set EXAMWARDEN_TOKEN or edit examwarden.toml");
    println!("  2. Run: examwarden validate --answers answers/example.toml");
    println!("  3. Run: examwarden take --answers answers/example.toml");

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# examwarden configuration

# Section reloads allowed when the backend reports another section
desync_reload_limit = 2

[backend]
base_url = "http://localhost:8000/api/assessment"
token = "${EXAMWARDEN_TOKEN}"
timeout_secs = 30
# Attempts for the timer flush on exit
guaranteed_attempts = 5
retry_delay_ms = 500

[timer]
tick_ms = 1000
sync_secs = 15
min_sync_delta_secs = 5

[audio]
autoplay_delay_ms = 1000
"#;

const EXAMPLE_SHEET: &str = r#"[sheet]
set_id = 1
name = "Example practice test"
# Used for every question not listed below
fallback = "A"

[[answers]]
question_id = 1
choice = "B"

[[answers]]
question_id = 2
choice = "D"
"#;
