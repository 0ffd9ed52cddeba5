use crate::error::{GenerationError, Result};

/// Token history of every batch-beam row.
///
/// Rows share one length and one fixed capacity (`max_length`). Storage is a
/// single flat buffer; beam reordering swaps it with a scratch buffer of the
/// same size.
#[derive(Debug, Clone)]
pub struct Sequences {
    tokens: Vec<u32>,
    scratch: Vec<u32>,
    rows: usize,
    max_length: usize,
    prompt_length: usize,
    current_length: usize,
}

impl Sequences {
    /// `input_ids` is `batch_size × prompt_len`; each batch entry is copied
    /// into `num_beams` consecutive rows.
    pub fn new(
        input_ids: &[u32],
        batch_size: usize,
        num_beams: usize,
        max_length: usize,
    ) -> Result<Self> {
        if batch_size == 0 || input_ids.len() % batch_size != 0 {
            return Err(GenerationError::shape(
                format!("a multiple of {batch_size} input ids"),
                input_ids.len().to_string(),
            ));
        }
        let prompt_len = input_ids.len() / batch_size;
        if prompt_len > max_length {
            return Err(GenerationError::SequenceOverflow {
                capacity: max_length,
            });
        }

        let rows = batch_size * num_beams;
        let mut tokens = vec![0u32; rows * max_length];
        for (b, prompt) in input_ids.chunks(prompt_len.max(1)).enumerate() {
            for beam in 0..num_beams {
                let row = b * num_beams + beam;
                tokens[row * max_length..row * max_length + prompt_len].copy_from_slice(prompt);
            }
        }

        Ok(Self {
            scratch: vec![0u32; tokens.len()],
            tokens,
            rows,
            max_length,
            prompt_length: prompt_len,
            current_length: prompt_len,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn current_length(&self) -> usize {
        self.current_length
    }

    pub fn prompt_length(&self) -> usize {
        self.prompt_length
    }

    pub fn is_full(&self) -> bool {
        self.current_length >= self.max_length
    }

    pub fn sequence(&self, row: usize) -> &[u32] {
        let start = row * self.max_length;
        &self.tokens[start..start + self.current_length]
    }

    /// Tokens of `row` after the prompt.
    pub fn generated(&self, row: usize) -> &[u32] {
        let prompt = self.prompt_length.min(self.current_length);
        &self.sequence(row)[prompt..]
    }

    /// Per-row length without the prompt's pad tokens. Every generated token
    /// counts, including padding after an end token.
    pub fn real_lengths(&self, pad_token_id: u32) -> Vec<usize> {
        let prompt = self.prompt_length.min(self.current_length);
        (0..self.rows)
            .map(|row| {
                let seq = self.sequence(row);
                let real_prompt = seq[..prompt].iter().filter(|&&t| t != pad_token_id).count();
                real_prompt + seq.len() - prompt
            })
            .collect()
    }

    /// Append one token per row.
    pub fn append_next_tokens(&mut self, next_tokens: &[u32]) -> Result<()> {
        self.check_row_count(next_tokens.len())?;
        self.ensure_capacity(1)?;
        for (row, &token) in next_tokens.iter().enumerate() {
            self.tokens[row * self.max_length + self.current_length] = token;
        }
        self.current_length += 1;
        Ok(())
    }

    /// Rebuild every row from its parent row, then append one token per row.
    pub fn append_with_parents(&mut self, parents: &[u32], next_tokens: &[u32]) -> Result<()> {
        self.check_row_count(parents.len())?;
        self.check_row_count(next_tokens.len())?;
        self.ensure_capacity(1)?;

        let len = self.current_length;
        for (row, (&parent, &token)) in parents.iter().zip(next_tokens).enumerate() {
            let parent = parent as usize;
            if parent >= self.rows {
                return Err(GenerationError::shape(
                    format!("parent row below {}", self.rows),
                    parent.to_string(),
                ));
            }
            let src = parent * self.max_length;
            let dst = row * self.max_length;
            self.scratch[dst..dst + len].copy_from_slice(&self.tokens[src..src + len]);
            self.scratch[dst + len] = token;
        }
        std::mem::swap(&mut self.tokens, &mut self.scratch);
        self.current_length += 1;
        Ok(())
    }

    /// Append a run of tokens to a single-row history.
    pub fn append_run(&mut self, tokens: &[u32]) -> Result<()> {
        if self.rows != 1 {
            return Err(GenerationError::shape("a single row", self.rows.to_string()));
        }
        self.ensure_capacity(tokens.len())?;
        let start = self.current_length;
        self.tokens[start..start + tokens.len()].copy_from_slice(tokens);
        self.current_length += tokens.len();
        Ok(())
    }

    pub fn drop_last_tokens(&mut self, n: usize) -> Result<()> {
        if n > self.current_length {
            return Err(GenerationError::InvalidRollback {
                requested: n,
                available: self.current_length,
            });
        }
        self.current_length -= n;
        Ok(())
    }

    fn check_row_count(&self, count: usize) -> Result<()> {
        if count != self.rows {
            return Err(GenerationError::shape(
                format!("{} rows", self.rows),
                count.to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_capacity(&self, extra: usize) -> Result<()> {
        if self.current_length + extra > self.max_length {
            return Err(GenerationError::SequenceOverflow {
                capacity: self.max_length,
            });
        }
        Ok(())
    }
}
