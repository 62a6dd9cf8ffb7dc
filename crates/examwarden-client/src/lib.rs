//! examwarden-client — HTTP backend and configuration.
//!
//! Implements `AssessmentBackend` over the assessment REST API and loads the
//! `examwarden.toml` configuration the CLI runs with.

pub mod config;
pub mod http;

pub use config::{load_config, load_config_from, ExamwardenConfig};
pub use http::HttpBackend;
