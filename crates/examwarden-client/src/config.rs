//! Configuration loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use examwarden_core::controller::ControllerSettings;
use examwarden_core::model::Credentials;
use examwarden_core::timer::TimerSettings;

use crate::http::HttpBackend;

/// Where and how to reach the assessment backend.
///
/// Note: Custom Debug impl masks the token to prevent accidental exposure in logs.
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token; `${VAR}` references are resolved from the environment.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Attempts for hide/unload timer flushes.
    #[serde(default = "default_guaranteed_attempts")]
    pub guaranteed_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("token", &"***")
            .field("timeout_secs", &self.timeout_secs)
            .field("guaranteed_attempts", &self.guaranteed_attempts)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .finish()
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: String::new(),
            timeout_secs: default_timeout(),
            guaranteed_attempts: default_guaranteed_attempts(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

/// Timer intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_sync_secs")]
    pub sync_secs: u64,
    #[serde(default = "default_min_sync_delta")]
    pub min_sync_delta_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            sync_secs: default_sync_secs(),
            min_sync_delta_secs: default_min_sync_delta(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_autoplay_delay")]
    pub autoplay_delay_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            autoplay_delay_ms: default_autoplay_delay(),
        }
    }
}

/// Top-level examwarden configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamwardenConfig {
    /// Section reloads allowed when the backend reports another section.
    #[serde(default = "default_desync_reload_limit")]
    pub desync_reload_limit: u32,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub audio: AudioConfig,
}

impl Default for ExamwardenConfig {
    fn default() -> Self {
        Self {
            desync_reload_limit: default_desync_reload_limit(),
            backend: BackendConfig::default(),
            timer: TimerConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000/api/assessment".to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_guaranteed_attempts() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    500
}
fn default_tick_ms() -> u64 {
    1000
}
fn default_sync_secs() -> u64 {
    15
}
fn default_min_sync_delta() -> u64 {
    5
}
fn default_autoplay_delay() -> u64 {
    1000
}
fn default_desync_reload_limit() -> u32 {
    2
}

impl ExamwardenConfig {
    /// Engine settings derived from the `[timer]` and `[audio]` tables.
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            timer: TimerSettings {
                tick_interval: Duration::from_millis(self.timer.tick_ms.max(1)),
                sync_interval: Duration::from_secs(self.timer.sync_secs.max(1)),
                min_sync_delta_secs: self.timer.min_sync_delta_secs,
            },
            autoplay_delay: Duration::from_millis(self.audio.autoplay_delay_ms),
            desync_reload_limit: self.desync_reload_limit,
        }
    }

    /// The configured bearer credential.
    pub fn credentials(&self) -> Result<Credentials> {
        if self.backend.token.trim().is_empty() {
            anyhow::bail!("no backend token configured; set [backend] token or EXAMWARDEN_TOKEN");
        }
        Ok(Credentials::bearer(self.backend.token.trim()))
    }

    /// Build the HTTP backend described by `[backend]`.
    pub fn create_backend(&self) -> Result<HttpBackend> {
        let backend = HttpBackend::new(
            &self.backend.base_url,
            Some(Duration::from_secs(self.backend.timeout_secs)),
        )
        .context("failed to create HTTP backend")?;
        Ok(backend.with_guaranteed_delivery(
            self.backend.guaranteed_attempts,
            Duration::from_millis(self.backend.retry_delay_ms),
        ))
    }
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
fn resolve_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    while let Some(start) = result.find("${") {
        let Some(len) = result[start..].find('}') else {
            break;
        };
        let value = std::env::var(&result[start + 2..start + len]).unwrap_or_default();
        result.replace_range(start..=start + len, &value);
    }
    result
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `examwarden.toml` in the current directory
/// 2. `~/.config/examwarden/config.toml`
///
/// Environment variable overrides: `EXAMWARDEN_TOKEN`, `EXAMWARDEN_BASE_URL`.
pub fn load_config() -> Result<ExamwardenConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<ExamwardenConfig> {
    let config_path = match path {
        Some(p) if p.exists() => Some(p.to_path_buf()),
        Some(p) => anyhow::bail!("config file not found: {}", p.display()),
        None => {
            let local = PathBuf::from("examwarden.toml");
            if local.exists() {
                Some(local)
            } else {
                config_dir()
                    .map(|dir| dir.join("config.toml"))
                    .filter(|global| global.exists())
            }
        }
    };

    let mut config = match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            let config = toml::from_str::<ExamwardenConfig>(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?;
            tracing::debug!(path = %path.display(), "loaded config");
            config
        }
        None => ExamwardenConfig::default(),
    };

    if let Ok(token) = std::env::var("EXAMWARDEN_TOKEN") {
        config.backend.token = token;
    }
    if let Ok(url) = std::env::var("EXAMWARDEN_BASE_URL") {
        config.backend.base_url = url;
    }

    config.backend.token = resolve_env_vars(&config.backend.token);
    config.backend.base_url = resolve_env_vars(&config.backend.base_url);

    Ok(config)
}

fn config_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("examwarden"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_env_vars_basic() {
        std::env::set_var("_EXAMWARDEN_TEST_VAR", "hello");
        assert_eq!(resolve_env_vars("${_EXAMWARDEN_TEST_VAR}"), "hello");
        assert_eq!(
            resolve_env_vars("prefix_${_EXAMWARDEN_TEST_VAR}_suffix"),
            "prefix_hello_suffix"
        );
        assert_eq!(resolve_env_vars("${_EXAMWARDEN_UNSET_VAR}"), "");
        assert_eq!(resolve_env_vars("${unterminated"), "${unterminated");
        std::env::remove_var("_EXAMWARDEN_TEST_VAR");
    }

    #[test]
    fn default_config() {
        let config = ExamwardenConfig::default();
        assert_eq!(config.backend.timeout_secs, 30);
        assert_eq!(config.timer.sync_secs, 15);
        assert_eq!(config.audio.autoplay_delay_ms, 1000);
        assert_eq!(config.desync_reload_limit, 2);
        assert!(config.credentials().is_err());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
desync_reload_limit = 4

[backend]
base_url = "https://exams.example/api/assessment"
token = "abc"
guaranteed_attempts = 2

[timer]
tick_ms = 250
min_sync_delta_secs = 10

[audio]
autoplay_delay_ms = 0
"#;
        let config: ExamwardenConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend.guaranteed_attempts, 2);
        assert_eq!(config.backend.timeout_secs, 30);

        let settings = config.controller_settings();
        assert_eq!(settings.timer.tick_interval, Duration::from_millis(250));
        assert_eq!(settings.timer.sync_interval, Duration::from_secs(15));
        assert_eq!(settings.timer.min_sync_delta_secs, 10);
        assert_eq!(settings.autoplay_delay, Duration::ZERO);
        assert_eq!(settings.desync_reload_limit, 4);
        assert_eq!(config.credentials().unwrap().token(), "abc");
    }

    #[test]
    fn debug_masks_token() {
        let config = BackendConfig {
            token: "super-secret".into(),
            ..BackendConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn load_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("examwarden.toml");
        std::fs::write(&path, "[backend]\ntoken = \"${_EXAMWARDEN_CFG_TOKEN}\"\n").unwrap();
        std::env::set_var("_EXAMWARDEN_CFG_TOKEN", "from-env");

        let config = load_config_from(Some(&path)).unwrap();
        if std::env::var("EXAMWARDEN_TOKEN").is_err() {
            assert_eq!(config.backend.token, "from-env");
        }
        std::env::remove_var("_EXAMWARDEN_CFG_TOKEN");
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        assert!(load_config_from(Some(Path::new("/nonexistent/examwarden.toml"))).is_err());
    }
}
