//! Position ids and attention mask for left-padded batches.

use candle_core::{DType, Device, Tensor};

use crate::error::{GenerationError, Result};

/// Tracks where each row's next token sits.
///
/// Pad tokens get position 0 and a mask value of 0; every real token gets
/// the running count of real tokens before it.
#[derive(Debug)]
pub struct PositionInputs {
    position_ids: Tensor,
    attention_mask: Tensor,
    next_position: Vec<i64>,
    device: Device,
}

impl PositionInputs {
    /// Build from prompt token ids laid out as `rows × prompt_len`.
    pub fn new(tokens: &[u32], rows: usize, pad_token_id: u32, device: &Device) -> Result<Self> {
        if rows == 0 || tokens.is_empty() || tokens.len() % rows != 0 {
            return Err(GenerationError::shape(
                format!("a multiple of {rows} prompt tokens"),
                tokens.len().to_string(),
            ));
        }
        let prompt_len = tokens.len() / rows;

        let mut positions: Vec<i64> = Vec::with_capacity(tokens.len());
        let mut mask: Vec<i64> = Vec::with_capacity(tokens.len());
        let mut next_position = Vec::with_capacity(rows);
        for row in tokens.chunks(prompt_len) {
            let mut pos = 0i64;
            for &token in row {
                if token == pad_token_id {
                    positions.push(0);
                    mask.push(0);
                } else {
                    positions.push(pos);
                    mask.push(1);
                    pos += 1;
                }
            }
            next_position.push(pos);
        }

        Ok(Self {
            position_ids: Tensor::from_vec(positions, (rows, prompt_len), device)?,
            attention_mask: Tensor::from_vec(mask, (rows, prompt_len), device)?,
            next_position,
            device: device.clone(),
        })
    }

    pub fn position_ids(&self) -> &Tensor {
        &self.position_ids
    }

    pub fn attention_mask(&self) -> &Tensor {
        &self.attention_mask
    }

    /// Per-row count of real (non-pad) tokens seen so far.
    pub fn sequence_lengths(&self) -> &[i64] {
        &self.next_position
    }

    /// Advance by `new_tokens` per row; the mask must end up `current_length` wide.
    pub fn update(&mut self, new_tokens: usize, current_length: usize) -> Result<()> {
        let rows = self.next_position.len();
        let mut positions = Vec::with_capacity(rows * new_tokens);
        for next in self.next_position.iter_mut() {
            for i in 0..new_tokens as i64 {
                positions.push(*next + i);
            }
            *next += new_tokens as i64;
        }
        self.position_ids = Tensor::from_vec(positions, (rows, new_tokens), &self.device)?;

        let ones = Tensor::ones((rows, new_tokens), DType::I64, &self.device)?;
        let mask = Tensor::cat(&[&self.attention_mask, &ones], 1)?;
        let width = mask.dim(1)?;
        if width != current_length {
            return Err(GenerationError::shape(
                format!("attention mask of width {current_length}"),
                width.to_string(),
            ));
        }
        self.attention_mask = mask;
        Ok(())
    }

    /// Forget the last `n` positions of every row.
    pub fn rollback(&mut self, n: usize) -> Result<()> {
        let width = self.attention_mask.dim(1)?;
        let min_next = self.next_position.iter().copied().min().unwrap_or(0);
        if n > width || n as i64 > min_next {
            return Err(GenerationError::InvalidRollback {
                requested: n,
                available: width.min(min_next.max(0) as usize),
            });
        }
        self.attention_mask = self.attention_mask.narrow(1, 0, width - n)?;
        for next in self.next_position.iter_mut() {
            *next -= n as i64;
        }
        Ok(())
    }
}
