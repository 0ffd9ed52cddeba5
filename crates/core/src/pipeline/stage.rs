//! Per-stage I/O binding.

use std::collections::{HashMap, HashSet};

use candle_core::Tensor;

use crate::config::{SessionOptions, StageConfig};
use crate::device::DeviceId;

use super::backend::NamedTensors;

/// Which generation step a stage is being run for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    /// First step, processing the whole prompt.
    Prompt,
    /// Any later step, processing the tokens chosen by search.
    TokenGeneration,
}

/// Binds named tensors to one sub-model invocation.
///
/// The declared input/output sets come from configuration and never change.
/// The bound inputs and requested outputs are rebuilt on every step; call
/// [`StageBinding::clear_io`] before reuse.
#[derive(Debug)]
pub struct StageBinding {
    id: String,
    declared_inputs: HashSet<String>,
    declared_outputs: Vec<String>,
    declared_output_set: HashSet<String>,
    session_options: Option<SessionOptions>,
    run_on_prompt: bool,
    run_on_token_gen: bool,
    output_names_forwarder: HashMap<String, String>,

    bound_inputs: NamedTensors,
    requested_outputs: Vec<String>,
}

impl StageBinding {
    pub fn new(config: &StageConfig) -> Self {
        Self {
            id: config.model_id.clone(),
            declared_inputs: config.inputs.iter().cloned().collect(),
            declared_output_set: config.outputs.iter().cloned().collect(),
            declared_outputs: config.outputs.clone(),
            session_options: config.session_options.clone(),
            run_on_prompt: config.run_on_prompt,
            run_on_token_gen: config.run_on_token_gen,
            output_names_forwarder: config.output_names_forwarder.clone(),
            bound_inputs: NamedTensors::new(),
            requested_outputs: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.declared_inputs.contains(name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.declared_output_set.contains(name)
    }

    pub fn declared_inputs(&self) -> impl Iterator<Item = &str> {
        self.declared_inputs.iter().map(String::as_str)
    }

    /// Declared outputs in configuration order.
    pub fn declared_outputs(&self) -> &[String] {
        &self.declared_outputs
    }

    /// Whether the primary device's managed buffers may be bound here.
    ///
    /// The host device is always accepted. Otherwise a stage without session
    /// options inherits the session defaults and is accepted, and a stage
    /// with session options must list the primary device among its
    /// providers.
    pub fn supports_primary_device(&self, primary: &DeviceId) -> bool {
        if primary.is_host() {
            return true;
        }
        match &self.session_options {
            None => true,
            Some(options) => options.lists_provider(primary.as_str()),
        }
    }

    pub fn runs_in(&self, phase: StepPhase) -> bool {
        match phase {
            StepPhase::Prompt => self.run_on_prompt,
            StepPhase::TokenGeneration => self.run_on_token_gen,
        }
    }

    /// Name under which a non-managed output is handed to later stages.
    pub fn forwarded_name<'a>(&'a self, output: &'a str) -> &'a str {
        self.output_names_forwarder
            .get(output)
            .map(String::as_str)
            .unwrap_or(output)
    }

    pub fn clear_io(&mut self) {
        self.bound_inputs.clear();
        self.requested_outputs.clear();
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bound_inputs.contains_key(name)
    }

    pub(crate) fn bind_input(&mut self, name: &str, tensor: Tensor) {
        self.bound_inputs.insert(name.to_string(), tensor);
    }

    pub(crate) fn request_output(&mut self, name: &str) {
        if !self.requested_outputs.iter().any(|n| n == name) {
            self.requested_outputs.push(name.to_string());
        }
    }

    /// Request every declared output not already requested.
    pub(crate) fn request_remaining_outputs(&mut self) {
        for name in &self.declared_outputs {
            if !self.requested_outputs.contains(name) {
                self.requested_outputs.push(name.clone());
            }
        }
    }

    /// Whether this stage hands `name` to later stages or managed state.
    pub fn produces(&self, name: &str) -> bool {
        self.declared_outputs
            .iter()
            .any(|output| output == name || self.forwarded_name(output) == name)
    }

    pub fn bound_inputs(&self) -> &NamedTensors {
        &self.bound_inputs
    }

    pub fn requested_outputs(&self) -> &[String] {
        &self.requested_outputs
    }
}
