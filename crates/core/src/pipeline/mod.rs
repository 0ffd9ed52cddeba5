//! Staged execution of one generation step.
//!
//! A decoder may be split into several sub-models ("stages") that run in a
//! fixed order. Each step, every stage is wired up from two sources:
//!
//! ```text
//!   managed state ──┐
//!                   ├──► stage 0 ──► pool ──┐
//!                   │                       ├──► stage 1 ──► ... ──► logits
//!                   └───────────────────────┘
//! ```
//!
//! Managed tensors (token ids, positions, mask, KV cache, logits) are owned by
//! the session and survive across steps. Everything else a stage produces goes
//! into a [`NamedValuePool`] that lives for one step only. When a stage
//! declares an input that exists in both places, the managed tensor wins.

mod backend;
mod pool;
mod stage;

use std::collections::HashSet;

use candle_core::Tensor;
use tracing::{debug, trace, warn};

use crate::config::StageConfig;
use crate::device::{DeviceId, DeviceRegistry};
use crate::error::{BindingDirection, GenerationError, Result};

pub use backend::{InferenceBackend, NamedTensors};
pub use pool::NamedValuePool;
pub use stage::{StageBinding, StepPhase};

/// Tensors the session creates and updates itself between steps.
pub trait ManagedTensors {
    /// Managed input names in binding order.
    fn managed_input_names(&self) -> &[String];

    fn managed_input(&self, name: &str) -> Option<Tensor>;

    fn is_managed_output(&self, name: &str) -> bool;

    fn managed_output_names(&self) -> &[String];

    /// Accept a managed output produced by a stage.
    fn store_output(&mut self, name: &str, tensor: Tensor) -> Result<()>;

    fn managed_output(&self, name: &str) -> Option<&Tensor>;

    fn is_managed_input(&self, name: &str) -> bool {
        self.managed_input_names().iter().any(|n| n == name)
    }
}

/// Runs the configured stages in order for one step.
#[derive(Debug)]
pub struct PipelineExecutor {
    stages: Vec<StageBinding>,
    primary: DeviceId,
    logits_name: String,
}

impl PipelineExecutor {
    pub fn new(
        configs: &[StageConfig],
        primary: DeviceId,
        registry: &DeviceRegistry,
        logits_name: impl Into<String>,
    ) -> Result<Self> {
        registry.ensure_supported(&primary)?;
        if configs.is_empty() {
            return Err(GenerationError::InvalidPipeline(
                "pipeline has no stages".into(),
            ));
        }

        let logits_name = logits_name.into();
        let stages: Vec<StageBinding> = configs.iter().map(StageBinding::new).collect();
        if !stages.iter().any(|s| s.has_output(&logits_name)) {
            return Err(GenerationError::InvalidPipeline(format!(
                "no stage produces {logits_name}"
            )));
        }

        Ok(Self {
            stages,
            primary,
            logits_name,
        })
    }

    pub fn stages(&self) -> &[StageBinding] {
        &self.stages
    }

    pub fn primary(&self) -> &DeviceId {
        &self.primary
    }

    pub fn logits_name(&self) -> &str {
        &self.logits_name
    }

    /// Reject pipelines where a stage consumes a name that only a later stage
    /// produces. Such an input could never be bound in a single pass.
    pub fn validate_dataflow<M: ManagedTensors + ?Sized>(&self, managed: &M) -> Result<()> {
        let mut available: HashSet<&str> = HashSet::new();
        for (idx, stage) in self.stages.iter().enumerate() {
            for input in stage.declared_inputs() {
                if managed.is_managed_input(input) || available.contains(input) {
                    continue;
                }
                if let Some(later) = self.stages[idx + 1..].iter().find(|s| s.produces(input)) {
                    return Err(GenerationError::InvalidPipeline(format!(
                        "stage {} consumes {input}, which is only produced by later stage {}",
                        stage.id(),
                        later.id()
                    )));
                }
            }
            for output in stage.declared_outputs() {
                available.insert(stage.forwarded_name(output));
            }
        }
        Ok(())
    }

    /// Run every stage for this step and return the managed logits.
    pub fn run_step<B, M>(&mut self, backend: &B, managed: &mut M, phase: StepPhase) -> Result<Tensor>
    where
        B: InferenceBackend + ?Sized,
        M: ManagedTensors + ?Sized,
    {
        let mut pool = NamedValuePool::new();

        for stage in self.stages.iter_mut() {
            stage.clear_io();
            if !stage.runs_in(phase) {
                debug!(stage = stage.id(), ?phase, "skipping pipeline stage");
                continue;
            }
            let supported = stage.supports_primary_device(&self.primary);

            for name in managed.managed_input_names() {
                if !stage.has_input(name) {
                    continue;
                }
                if !supported {
                    return Err(device_mismatch(stage, name, BindingDirection::Input, &self.primary));
                }
                if let Some(tensor) = managed.managed_input(name) {
                    stage.bind_input(name, tensor);
                }
            }

            for (name, tensor) in pool.iter() {
                if stage.has_input(name) && !stage.is_bound(name) {
                    stage.bind_input(name, tensor.clone());
                }
            }

            for name in managed.managed_output_names() {
                if !stage.has_output(name) {
                    continue;
                }
                if !supported {
                    return Err(device_mismatch(stage, name, BindingDirection::Output, &self.primary));
                }
                stage.request_output(name);
            }
            stage.request_remaining_outputs();

            debug!(
                stage = stage.id(),
                inputs = stage.bound_inputs().len(),
                outputs = stage.requested_outputs().len(),
                "running pipeline stage"
            );
            let mut outputs = backend
                .run_stage(stage.id(), stage.bound_inputs(), stage.requested_outputs())
                .map_err(|source| GenerationError::Backend {
                    stage: stage.id().to_string(),
                    source,
                })?;

            for name in stage.requested_outputs() {
                let tensor = outputs
                    .remove(name)
                    .ok_or_else(|| GenerationError::MissingOutput {
                        stage: stage.id().to_string(),
                        output: name.clone(),
                    })?;
                if managed.is_managed_output(name) {
                    managed.store_output(name, tensor)?;
                } else {
                    pool.insert(stage.forwarded_name(name), tensor);
                }
            }
            for extra in outputs.keys() {
                warn!(stage = stage.id(), output = %extra, "dropping unrequested stage output");
            }
        }

        trace!(pooled = ?pool.iter().map(|(n, _)| n).collect::<Vec<_>>(), "step finished");

        managed
            .managed_output(&self.logits_name)
            .cloned()
            .ok_or_else(|| GenerationError::MissingOutput {
                stage: "pipeline".to_string(),
                output: self.logits_name.clone(),
            })
    }
}

fn device_mismatch(
    stage: &StageBinding,
    tensor: &str,
    direction: BindingDirection,
    primary: &DeviceId,
) -> GenerationError {
    GenerationError::DeviceMismatch {
        stage: stage.id().to_string(),
        tensor: tensor.to_string(),
        direction,
        device: primary.to_string(),
    }
}
