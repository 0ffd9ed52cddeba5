use candle_core::Tensor;
use tracing::trace;

use crate::error::{GenerationError, Result};

use super::sampling::{self, SamplerState};
use super::{
    constrain_min_length, constrain_repetition, LogitsBuffer, Search, SearchKind, SearchParams,
    Sequences,
};

/// One row per batch entry; picks the argmax or samples.
///
/// A row that has emitted an end token keeps emitting the pad token so the
/// batch stays rectangular.
#[derive(Debug)]
pub struct GreedySearch {
    params: SearchParams,
    sequences: Sequences,
    logits: LogitsBuffer,
    keep_positions: bool,
    next_tokens: Vec<u32>,
    eos_seen: Vec<bool>,
    not_done_count: usize,
    reached_max_length: bool,
    done: bool,
    sampler: SamplerState,
}

impl GreedySearch {
    pub fn new(params: SearchParams, input_ids: &[u32]) -> Result<Self> {
        Self::with_positions(params, input_ids, false)
    }

    pub(crate) fn with_positions(
        mut params: SearchParams,
        input_ids: &[u32],
        keep_positions: bool,
    ) -> Result<Self> {
        params.num_beams = 1;
        let rows = params.batch_size;
        let sequences = Sequences::new(input_ids, rows, 1, params.max_length)?;
        let sampler = SamplerState::new(params.random_seed);
        Ok(Self {
            reached_max_length: sequences.is_full(),
            done: sequences.is_full(),
            sequences,
            logits: LogitsBuffer::default(),
            keep_positions,
            next_tokens: vec![params.pad_token_id; rows],
            eos_seen: vec![false; rows],
            not_done_count: rows,
            sampler,
            params,
        })
    }

    pub(crate) fn params(&self) -> &SearchParams {
        &self.params
    }

    pub(crate) fn logits(&self) -> &LogitsBuffer {
        &self.logits
    }

    pub(crate) fn logits_mut(&mut self) -> &mut LogitsBuffer {
        &mut self.logits
    }

    pub fn eos_seen(&self, row: usize) -> bool {
        self.eos_seen[row]
    }

    /// One slot per row; a run committed by `set_next_tokens` may have left more.
    fn reset_next_tokens(&mut self) {
        self.next_tokens.clear();
        self.next_tokens
            .resize(self.params.batch_size, self.params.pad_token_id);
    }

    /// Pad rows that already finished, track new end tokens, append.
    fn commit_selection(&mut self) -> Result<()> {
        for row in 0..self.params.batch_size {
            let token = &mut self.next_tokens[row];
            if self.eos_seen[row] {
                *token = self.params.pad_token_id;
            } else if self.params.eos_token_ids.contains(token) {
                self.eos_seen[row] = true;
                self.not_done_count -= 1;
            }
        }
        self.sequences.append_next_tokens(&self.next_tokens)?;
        self.logits.consume();
        self.update_done();
        trace!(tokens = ?self.next_tokens, remaining = self.not_done_count, "greedy step");
        Ok(())
    }

    /// Reaching `max_length` finishes the search for good; end tokens can be
    /// taken back by `drop_last_tokens`.
    fn update_done(&mut self) {
        self.reached_max_length |= self.sequences.is_full();
        self.done = self.reached_max_length || self.not_done_count == 0;
    }

    fn sample(&mut self, top_k: Option<usize>, top_p: Option<f32>, temperature: f32) -> Result<()> {
        self.logits.require_fresh()?;
        self.reset_next_tokens();
        for row in 0..self.params.batch_size {
            let token = sampling::sample_row(
                self.logits.row(row),
                top_k,
                top_p,
                temperature,
                self.sampler.rng_mut(),
            );
            self.next_tokens[row] = token;
        }
        self.commit_selection()
    }
}

impl Search for GreedySearch {
    fn kind(&self) -> SearchKind {
        SearchKind::Greedy
    }

    fn set_logits(&mut self, logits: &Tensor) -> Result<()> {
        self.logits.load(
            logits,
            self.params.batch_size,
            self.params.vocab_size,
            self.keep_positions,
        )
    }

    fn sequences(&self) -> &Sequences {
        &self.sequences
    }

    fn next_tokens(&self) -> &[u32] {
        &self.next_tokens
    }

    fn sequence(&mut self, index: usize) -> Result<Vec<u32>> {
        if index >= self.sequences.rows() {
            return Err(GenerationError::shape(
                format!("index below {}", self.sequences.rows()),
                index.to_string(),
            ));
        }
        Ok(self.sequences.sequence(index).to_vec())
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn select_top(&mut self) -> Result<()> {
        self.logits.require_fresh()?;
        self.reset_next_tokens();
        for row in 0..self.params.batch_size {
            self.next_tokens[row] = sampling::argmax(self.logits.row(row));
        }
        self.commit_selection()
    }

    fn sample_top_k(&mut self, k: usize, temperature: f32) -> Result<()> {
        self.sample(Some(k), None, temperature)
    }

    fn sample_top_p(&mut self, p: f32, temperature: f32) -> Result<()> {
        self.sample(None, Some(p), temperature)
    }

    fn sample_top_k_top_p(&mut self, k: usize, p: f32, temperature: f32) -> Result<()> {
        self.sample(Some(k), Some(p), temperature)
    }

    fn apply_min_length(&mut self, min_length: usize) -> Result<()> {
        constrain_min_length(
            &mut self.logits,
            &self.sequences,
            &self.params.eos_token_ids,
            min_length,
        )
    }

    fn apply_repetition_penalty(&mut self, penalty: f32) -> Result<()> {
        constrain_repetition(&mut self.logits, &self.sequences, penalty)
    }

    fn sequence_lengths(&self) -> Vec<usize> {
        self.sequences.real_lengths(self.params.pad_token_id)
    }

    /// Forget the last `n` tokens of every row. A row whose end token is
    /// dropped is unfinished again.
    fn drop_last_tokens(&mut self, n: usize) -> Result<()> {
        self.sequences.drop_last_tokens(n)?;
        for row in 0..self.params.batch_size {
            let finished = self
                .sequences
                .generated(row)
                .iter()
                .any(|t| self.params.is_eos(*t));
            self.eos_seen[row] = finished;
        }
        self.not_done_count = self.eos_seen.iter().filter(|seen| !**seen).count();
        self.update_done();
        Ok(())
    }

    /// Commit a run of tokens to the single row, stopping after an end token.
    fn set_next_tokens(&mut self, tokens: &[u32]) -> Result<()> {
        if self.params.batch_size != 1 {
            return Err(GenerationError::shape("a single row", self.params.batch_size.to_string()));
        }
        if self.eos_seen[0] {
            return Ok(());
        }
        let run = match tokens.iter().position(|t| self.params.is_eos(*t)) {
            Some(eos_at) => {
                self.eos_seen[0] = true;
                self.not_done_count = 0;
                &tokens[..=eos_at]
            }
            None => tokens,
        };
        self.sequences.append_run(run)?;
        self.next_tokens = run.to_vec();
        self.logits.consume();
        self.update_done();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn params(batch_size: usize, max_length: usize) -> SearchParams {
        SearchParams {
            batch_size,
            num_beams: 1,
            num_return_sequences: 1,
            max_length,
            vocab_size: 4,
            pad_token_id: 0,
            eos_token_ids: vec![3],
            length_penalty: 1.0,
            early_stopping: true,
            random_seed: Some(7),
            min_length: 0,
            repetition_penalty: 1.0,
        }
    }

    fn logits(rows: &[[f32; 4]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn select_top_is_argmax() {
        let mut search = GreedySearch::new(params(2, 8), &[1, 2]).unwrap();
        search
            .set_logits(&logits(&[[0.1, 0.9, 0.0, 0.0], [0.0, 0.0, 2.0, 1.0]]))
            .unwrap();
        search.select_top().unwrap();
        assert_eq!(search.next_tokens(), &[1, 2]);
        assert_eq!(search.sequence(0).unwrap(), vec![1, 1]);
        assert_eq!(search.sequence(1).unwrap(), vec![2, 2]);
        assert!(!search.is_done());
    }

    #[test]
    fn finished_row_is_padded() {
        let mut search = GreedySearch::new(params(2, 8), &[1, 1]).unwrap();
        search
            .set_logits(&logits(&[[0.0, 0.0, 0.0, 5.0], [0.0, 5.0, 0.0, 0.0]]))
            .unwrap();
        search.select_top().unwrap();
        assert!(search.eos_seen(0));
        assert!(!search.is_done());

        search
            .set_logits(&logits(&[[0.0, 0.0, 5.0, 0.0], [0.0, 0.0, 0.0, 5.0]]))
            .unwrap();
        search.select_top().unwrap();
        assert_eq!(search.next_tokens(), &[0, 3]);
        assert!(search.is_done());
    }

    #[test]
    fn done_at_max_length() {
        let mut search = GreedySearch::new(params(1, 2), &[1]).unwrap();
        search.set_logits(&logits(&[[0.0, 1.0, 0.0, 0.0]])).unwrap();
        search.select_top().unwrap();
        assert!(search.is_done());
    }

    #[test]
    fn min_length_masks_eos() {
        let mut search = GreedySearch::new(params(1, 8), &[1]).unwrap();
        search.set_logits(&logits(&[[0.0, 1.0, 0.0, 9.0]])).unwrap();
        search.apply_min_length(3).unwrap();
        assert_eq!(search.logits().row(0)[3], f32::NEG_INFINITY);
        search.select_top().unwrap();
        assert_eq!(search.next_tokens(), &[1]);
    }

    #[test]
    fn min_length_reached_leaves_eos() {
        let mut search = GreedySearch::new(params(1, 8), &[1, 1, 1]).unwrap();
        search.set_logits(&logits(&[[0.0, 1.0, 0.0, 9.0]])).unwrap();
        search.apply_min_length(3).unwrap();
        assert_eq!(search.logits().row(0)[3], 9.0);
    }

    #[test]
    fn repetition_penalty_applies_to_history() {
        let mut search = GreedySearch::new(params(1, 8), &[1, 2, 1]).unwrap();
        search.set_logits(&logits(&[[4.0, 4.0, -2.0, 1.0]])).unwrap();
        search.apply_repetition_penalty(2.0).unwrap();
        assert_eq!(search.logits().row(0), &[4.0, 2.0, -4.0, 1.0]);
    }

    #[test]
    fn selecting_without_logits_fails() {
        let mut search = GreedySearch::new(params(1, 8), &[1]).unwrap();
        assert!(matches!(
            search.select_top(),
            Err(GenerationError::LogitsNotComputed)
        ));
        search.set_logits(&logits(&[[0.0, 1.0, 0.0, 0.0]])).unwrap();
        search.select_top().unwrap();
        assert!(matches!(
            search.select_top(),
            Err(GenerationError::LogitsNotComputed)
        ));
    }

    #[test]
    fn seeded_sampling_reproducible() {
        let run = || {
            let mut search = GreedySearch::new(params(1, 16), &[1]).unwrap();
            let mut out = Vec::new();
            for _ in 0..8 {
                search.set_logits(&logits(&[[1.0, 1.1, 0.9, -5.0]])).unwrap();
                search.sample_top_k_top_p(3, 0.95, 0.8).unwrap();
                out.push(search.next_tokens()[0]);
            }
            out
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn set_next_tokens_stops_after_eos() {
        let mut search = GreedySearch::new(params(1, 8), &[1]).unwrap();
        search.set_next_tokens(&[2, 3, 2]).unwrap();
        assert_eq!(search.sequence(0).unwrap(), vec![1, 2, 3]);
        assert!(search.is_done());
    }

    #[test]
    fn drop_last_tokens_truncates() {
        let mut search = GreedySearch::new(params(1, 8), &[1]).unwrap();
        search.set_next_tokens(&[2, 2, 2]).unwrap();
        search.drop_last_tokens(1).unwrap();
        assert_eq!(search.sequence_length(), 3);
    }

    #[test]
    fn done_at_max_length_survives_drop() {
        let mut search = GreedySearch::new(params(1, 2), &[1]).unwrap();
        search.set_logits(&logits(&[[0.0, 1.0, 0.0, 0.0]])).unwrap();
        search.select_top().unwrap();
        assert!(search.is_done());

        search.drop_last_tokens(1).unwrap();
        assert_eq!(search.sequence_length(), 1);
        assert!(search.is_done());
    }

    #[test]
    fn dropping_eos_reopens_row() {
        let mut search = GreedySearch::new(params(1, 8), &[1]).unwrap();
        search.set_next_tokens(&[2, 3]).unwrap();
        assert!(search.is_done());
        assert!(search.eos_seen(0));

        search.drop_last_tokens(1).unwrap();
        assert_eq!(search.sequence(0).unwrap(), vec![1, 2]);
        assert!(!search.eos_seen(0));
        assert!(!search.is_done());

        search.set_logits(&logits(&[[0.0, 0.0, 5.0, 0.0]])).unwrap();
        search.select_top().unwrap();
        assert_eq!(search.sequence(0).unwrap(), vec![1, 2, 2]);
    }

    #[test]
    fn selection_after_committed_run_is_one_per_row() {
        let mut search = GreedySearch::new(params(1, 8), &[1]).unwrap();
        search.set_next_tokens(&[2, 2]).unwrap();
        assert_eq!(search.next_tokens(), &[2, 2]);

        search.set_logits(&logits(&[[0.0, 5.0, 0.0, 0.0]])).unwrap();
        search.select_top().unwrap();
        assert_eq!(search.next_tokens(), &[1]);
        assert_eq!(search.sequence(0).unwrap(), vec![1, 2, 2, 1]);
    }

    #[test]
    fn sequence_lengths_skip_left_padding() {
        let mut search = GreedySearch::new(params(2, 8), &[0, 0, 1, 1, 2, 2]).unwrap();
        search
            .set_logits(&logits(&[[0.0, 5.0, 0.0, 0.0], [0.0, 5.0, 0.0, 0.0]]))
            .unwrap();
        search.select_top().unwrap();
        assert_eq!(search.sequence_length(), 4);
        assert_eq!(search.sequence_lengths(), vec![2, 4]);
    }
}
