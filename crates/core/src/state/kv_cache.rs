//! Per-layer key/value cache handed from one step to the next.
//!
//! Each layer has a `past` input and a `present` output for keys and for
//! values, shaped `[batch_beam, kv_heads, seq, head_size]`. The first step
//! binds empty pasts. After every step the presents become the next pasts,
//! reordered along the batch-beam dimension when beam search picked new
//! parents.

use candle_core::{DType, Device, Tensor};

use crate::config::{layer_name, DecoderConfig};
use crate::error::{GenerationError, Result};

#[derive(Debug)]
pub struct KvCache {
    past_names: Vec<String>,
    present_names: Vec<String>,
    pasts: Vec<Tensor>,
    presents: Vec<Option<Tensor>>,
}

impl KvCache {
    pub fn new(decoder: &DecoderConfig, rows: usize, device: &Device) -> Result<Self> {
        let dtype = decoder.kv_dtype()?;
        let layers = decoder.num_hidden_layers;

        let mut past_names = Vec::with_capacity(layers * 2);
        let mut present_names = Vec::with_capacity(layers * 2);
        for layer in 0..layers {
            past_names.push(layer_name(&decoder.inputs.past_key_names, layer));
            past_names.push(layer_name(&decoder.inputs.past_value_names, layer));
            present_names.push(layer_name(&decoder.outputs.present_key_names, layer));
            present_names.push(layer_name(&decoder.outputs.present_value_names, layer));
        }

        let empty = empty_past(
            rows,
            decoder.num_key_value_heads,
            decoder.head_size,
            dtype,
            device,
        )?;
        let pasts = vec![empty; past_names.len()];
        let presents = vec![None; present_names.len()];

        Ok(Self {
            past_names,
            present_names,
            pasts,
            presents,
        })
    }

    pub fn past_names(&self) -> &[String] {
        &self.past_names
    }

    pub fn present_names(&self) -> &[String] {
        &self.present_names
    }

    pub fn past(&self, name: &str) -> Option<&Tensor> {
        self.past_names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.pasts[i])
    }

    pub fn present(&self, name: &str) -> Option<&Tensor> {
        self.present_names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.presents[i].as_ref())
    }

    /// Returns false if `name` is not a present output of this cache.
    pub fn store_present(&mut self, name: &str, tensor: Tensor) -> bool {
        match self.present_names.iter().position(|n| n == name) {
            Some(i) => {
                self.presents[i] = Some(tensor);
                true
            }
            None => false,
        }
    }

    /// Current sequence length held by the cache.
    pub fn past_len(&self) -> Result<usize> {
        match self.pasts.first() {
            Some(t) => Ok(t.dim(2)?),
            None => Ok(0),
        }
    }

    /// Move presents into pasts, picking rows by `beam_indices` when given.
    pub fn update(&mut self, beam_indices: Option<&[u32]>) -> Result<()> {
        let indices = match beam_indices {
            Some(idx) if !idx.is_empty() => {
                let device = self.pasts.first().map(|t| t.device().clone());
                match device {
                    Some(device) => Some(Tensor::new(idx, &device)?),
                    None => None,
                }
            }
            _ => None,
        };

        for (i, slot) in self.presents.iter_mut().enumerate() {
            let present = slot.take().ok_or_else(|| GenerationError::MissingOutput {
                stage: "kv_cache".to_string(),
                output: self.present_names[i].clone(),
            })?;
            self.pasts[i] = match &indices {
                Some(indices) => present.index_select(indices, 0)?,
                None => present,
            };
        }
        Ok(())
    }

    /// Drop the last `n` positions from the presents of the latest step.
    pub fn rollback(&mut self, n: usize) -> Result<()> {
        for (i, slot) in self.presents.iter_mut().enumerate() {
            let Some(present) = slot.as_ref() else {
                return Err(GenerationError::MissingOutput {
                    stage: "kv_cache".to_string(),
                    output: self.present_names[i].clone(),
                });
            };
            let len = present.dim(2)?;
            if n > len {
                return Err(GenerationError::InvalidRollback {
                    requested: n,
                    available: len,
                });
            }
            *slot = Some(present.narrow(2, 0, len - n)?);
        }
        Ok(())
    }
}

fn empty_past(
    rows: usize,
    kv_heads: usize,
    head_size: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    Ok(Tensor::zeros((rows, kv_heads, 0, head_size), dtype, device)?)
}
