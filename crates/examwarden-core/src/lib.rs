//! examwarden-core — Timed, sectioned assessment engine.
//!
//! This crate defines the data model, the backend contract, and the engine
//! components that run a multi-section timed exam: the question organizer,
//! the timer coordinator, the audio playback guard, and the session controller.

pub mod audio;
pub mod clock;
pub mod controller;
pub mod error;
pub mod mock;
pub mod model;
pub mod organizer;
pub mod sheet;
pub mod state;
pub mod timer;
pub mod traits;

mod sync;
