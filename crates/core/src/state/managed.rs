use candle_core::{DType, Tensor};

use crate::config::GeneratorConfig;
use crate::device::DevicePlacement;
use crate::error::{GenerationError, Result};
use crate::generator::GeneratorParams;
use crate::pipeline::{ManagedTensors, NamedTensors, StageBinding};

use super::kv_cache::KvCache;
use super::positions::PositionInputs;

/// Buffers the session owns and updates between steps.
///
/// Inputs are only registered when some stage declares them, so a pipeline
/// that never looks at the attention mask never pays for one.
#[derive(Debug)]
pub struct ManagedState {
    rows: usize,
    input_ids_name: String,
    input_ids: Tensor,
    positions: Option<PositionInputs>,
    position_ids_name: String,
    attention_mask_name: String,
    kv_cache: Option<KvCache>,
    extra_inputs: NamedTensors,
    logits_name: String,
    logits: Option<Tensor>,

    input_names: Vec<String>,
    output_names: Vec<String>,
    placement: DevicePlacement,
}

impl ManagedState {
    pub fn new(
        config: &GeneratorConfig,
        params: &GeneratorParams,
        stages: &[StageBinding],
        placement: DevicePlacement,
    ) -> Result<Self> {
        let decoder = &config.model.decoder;
        let names = &decoder.inputs;
        let declared = |name: &str| stages.iter().any(|s| s.has_input(name));
        let rows = params.batch_beam_size();
        let device = &placement.device;

        let prompt = params.expanded_input_ids();
        let input_ids = ids_tensor(&prompt, rows, &placement)?;
        let mut input_names = vec![names.input_ids.clone()];

        let wants_positions = declared(&names.position_ids) || declared(&names.attention_mask);
        let positions = if wants_positions {
            Some(PositionInputs::new(&prompt, rows, params.pad_token_id, device)?)
        } else {
            None
        };
        if declared(&names.position_ids) {
            input_names.push(names.position_ids.clone());
        }
        if declared(&names.attention_mask) {
            input_names.push(names.attention_mask.clone());
        }

        let mut output_names = vec![decoder.outputs.logits.clone()];

        let first_past = crate::config::layer_name(&names.past_key_names, 0);
        let kv_cache = if decoder.num_hidden_layers > 0 && declared(&first_past) {
            let cache = KvCache::new(decoder, rows, device)?;
            input_names.extend(cache.past_names().iter().cloned());
            output_names.extend(cache.present_names().iter().cloned());
            Some(cache)
        } else {
            None
        };

        let mut extra_inputs = NamedTensors::new();
        for (name, tensor) in &params.extra_inputs {
            input_names.push(name.clone());
            extra_inputs.insert(name.clone(), tensor.to_device(device)?);
        }

        Ok(Self {
            rows,
            input_ids_name: names.input_ids.clone(),
            input_ids,
            positions,
            position_ids_name: names.position_ids.clone(),
            attention_mask_name: names.attention_mask.clone(),
            kv_cache,
            extra_inputs,
            logits_name: decoder.outputs.logits.clone(),
            logits: None,
            input_names,
            output_names,
            placement,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn input_ids(&self) -> &Tensor {
        &self.input_ids
    }

    pub fn positions(&self) -> Option<&PositionInputs> {
        self.positions.as_ref()
    }

    pub fn kv_cache(&self) -> Option<&KvCache> {
        self.kv_cache.as_ref()
    }

    pub fn logits(&self) -> Option<&Tensor> {
        self.logits.as_ref()
    }

    /// Prepare inputs for the next step from the tokens search chose.
    ///
    /// `next_tokens` holds the same number of tokens for every row;
    /// `beam_indices` is empty unless beam search reordered the rows.
    pub fn update(
        &mut self,
        next_tokens: &[u32],
        beam_indices: &[u32],
        current_length: usize,
    ) -> Result<()> {
        if next_tokens.is_empty() || next_tokens.len() % self.rows != 0 {
            return Err(GenerationError::shape(
                format!("a multiple of {} next tokens", self.rows),
                next_tokens.len().to_string(),
            ));
        }
        let per_row = next_tokens.len() / self.rows;

        self.input_ids = ids_tensor(next_tokens, self.rows, &self.placement)?;
        if let Some(positions) = self.positions.as_mut() {
            positions.update(per_row, current_length)?;
        }
        if let Some(cache) = self.kv_cache.as_mut() {
            let indices = (!beam_indices.is_empty()).then_some(beam_indices);
            cache.update(indices)?;
        }
        self.logits = None;
        Ok(())
    }

    /// Forget the last `n` positions written by the latest step.
    pub fn rollback(&mut self, n: usize) -> Result<()> {
        if let Some(positions) = self.positions.as_mut() {
            positions.rollback(n)?;
        }
        if let Some(cache) = self.kv_cache.as_mut() {
            cache.rollback(n)?;
        }
        Ok(())
    }
}

fn ids_tensor(ids: &[u32], rows: usize, placement: &DevicePlacement) -> Result<Tensor> {
    let cols = ids.len() / rows.max(1);
    let data: Vec<i64> = ids.iter().map(|&t| t as i64).collect();
    Ok(Tensor::from_vec(data, (rows, cols), &placement.device)?)
}

impl ManagedTensors for ManagedState {
    fn managed_input_names(&self) -> &[String] {
        &self.input_names
    }

    fn managed_input(&self, name: &str) -> Option<Tensor> {
        if name == self.input_ids_name {
            return Some(self.input_ids.clone());
        }
        if let Some(positions) = &self.positions {
            if name == self.position_ids_name {
                return Some(positions.position_ids().clone());
            }
            if name == self.attention_mask_name {
                return Some(positions.attention_mask().clone());
            }
        }
        if let Some(past) = self.kv_cache.as_ref().and_then(|c| c.past(name)) {
            return Some(past.clone());
        }
        self.extra_inputs.get(name).cloned()
    }

    fn is_managed_output(&self, name: &str) -> bool {
        self.output_names.iter().any(|n| n == name)
    }

    fn managed_output_names(&self) -> &[String] {
        &self.output_names
    }

    fn store_output(&mut self, name: &str, tensor: Tensor) -> Result<()> {
        if name == self.logits_name {
            self.logits = Some(tensor.to_dtype(DType::F32)?);
            return Ok(());
        }
        match self
            .kv_cache
            .as_mut()
            .map(|cache| cache.store_present(name, tensor))
        {
            Some(true) => Ok(()),
            _ => Err(GenerationError::InvalidPipeline(format!(
                "{name} is not a managed output"
            ))),
        }
    }

    fn managed_output(&self, name: &str) -> Option<&Tensor> {
        if name == self.logits_name {
            return self.logits.as_ref();
        }
        self.kv_cache.as_ref().and_then(|c| c.present(name))
    }
}
