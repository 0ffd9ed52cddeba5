//! Generation session: managed buffers plus the stage pipeline.

mod kv_cache;
mod managed;
mod positions;

use candle_core::Tensor;
use tracing::info;

use crate::config::GeneratorConfig;
use crate::device::{DevicePlacement, DeviceRegistry};
use crate::error::Result;
use crate::generator::GeneratorParams;
use crate::pipeline::{InferenceBackend, PipelineExecutor, StepPhase};

pub use kv_cache::KvCache;
pub use managed::ManagedState;
pub use positions::PositionInputs;

/// Owns everything that persists between steps of one generation.
///
/// Dropping the session releases every managed buffer. After any error the
/// session must be discarded; it makes no attempt to restore a consistent
/// state.
pub struct GenerationSession<B> {
    backend: B,
    executor: PipelineExecutor,
    state: ManagedState,
    first_run: bool,
}

impl<B: InferenceBackend> GenerationSession<B> {
    pub fn new(
        config: &GeneratorConfig,
        params: &GeneratorParams,
        backend: B,
        placement: DevicePlacement,
        registry: &DeviceRegistry,
    ) -> Result<Self> {
        let decoder = &config.model.decoder;
        let executor = PipelineExecutor::new(
            &decoder.pipeline,
            placement.id.clone(),
            registry,
            decoder.outputs.logits.clone(),
        )?;
        let state = ManagedState::new(config, params, executor.stages(), placement)?;
        executor.validate_dataflow(&state)?;

        info!(
            stages = executor.stages().len(),
            rows = state.rows(),
            primary = %executor.primary(),
            "generation session created"
        );

        Ok(Self {
            backend,
            executor,
            state,
            first_run: true,
        })
    }

    /// Run one step and return the logits.
    ///
    /// On every step but the first, managed inputs are advanced from
    /// `next_tokens` and the KV cache is reordered by `next_indices`.
    pub fn run(
        &mut self,
        current_length: usize,
        next_tokens: &[u32],
        next_indices: &[u32],
    ) -> Result<Tensor> {
        let phase = if self.first_run {
            StepPhase::Prompt
        } else {
            self.state
                .update(next_tokens, next_indices, current_length)?;
            StepPhase::TokenGeneration
        };
        self.first_run = false;

        self.executor
            .run_step(&self.backend, &mut self.state, phase)
    }

    /// Drop the last `n` positions from the managed state.
    pub fn rollback(&mut self, n: usize) -> Result<()> {
        self.state.rollback(n)
    }

    pub fn is_first_run(&self) -> bool {
        self.first_run
    }

    pub fn state(&self) -> &ManagedState {
        &self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}
