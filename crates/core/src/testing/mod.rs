//! Shared test utilities for stagegen-core.
//!
//! A scripted [`MockBackend`] stands in for real sub-model sessions and
//! [`tiny_config`] builds small, validated generator configurations.

mod mock_backend;
mod tiny_config;

pub use mock_backend::{MockBackend, StageCall};
pub use tiny_config::{tiny_config, TINY_EOS, TINY_VOCAB};
