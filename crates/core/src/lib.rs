//! Staged generation core: a pipeline of sub-model stages driven by a
//! token search strategy.

pub mod config;
pub mod device;
pub mod error;
pub mod generator;
pub mod logging;
pub mod pipeline;
pub mod search;
pub mod state;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{GeneratorConfig, SearchConfig, StageConfig};
pub use device::{DeviceId, DevicePlacement, DeviceRegistry};
pub use error::{GenerationError, Result};
pub use generator::{Generator, GeneratorParams};
pub use pipeline::{InferenceBackend, NamedTensors, NamedValuePool, PipelineExecutor};
pub use search::{CandidateCheck, Search, SearchKind};
pub use state::GenerationSession;
