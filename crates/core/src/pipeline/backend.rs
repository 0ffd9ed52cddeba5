//! Inference backend trait for stage execution.

use std::collections::HashMap;

use candle_core::Tensor;

/// Tensors keyed by graph input/output name.
pub type NamedTensors = HashMap<String, Tensor>;

/// Runs the forward pass of one pipeline stage.
///
/// Implementations own whatever sessions back each stage id. The executor
/// passes every input it could bind and the full list of outputs the stage
/// declared; the backend must return a tensor for each requested output.
pub trait InferenceBackend: Send {
    fn run_stage(
        &self,
        stage_id: &str,
        inputs: &NamedTensors,
        output_names: &[String],
    ) -> candle_core::Result<NamedTensors>;
}

impl<B: InferenceBackend + Sync + ?Sized> InferenceBackend for &B {
    fn run_stage(
        &self,
        stage_id: &str,
        inputs: &NamedTensors,
        output_names: &[String],
    ) -> candle_core::Result<NamedTensors> {
        (**self).run_stage(stage_id, inputs, output_names)
    }
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for Box<B> {
    fn run_stage(
        &self,
        stage_id: &str,
        inputs: &NamedTensors,
        output_names: &[String],
    ) -> candle_core::Result<NamedTensors> {
        (**self).run_stage(stage_id, inputs, output_names)
    }
}
