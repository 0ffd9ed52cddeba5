//! Greedy search with draft-token verification.
//!
//! The session runs the last committed token followed by `k` draft tokens in
//! one step, producing logits for `k + 1` positions. Position `i` holds the
//! authoritative prediction for draft token `i`; position `k` predicts the
//! token after the whole draft.

use candle_core::Tensor;
use tracing::debug;

use crate::error::{GenerationError, Result};

use super::greedy::GreedySearch;
use super::sampling;
use super::{CandidateCheck, Search, SearchKind, SearchParams, Sequences};

/// Which constraints a logits position already carries.
#[derive(Debug, Clone, Copy, Default)]
struct Constrained {
    min_length: bool,
    penalty: bool,
}

#[derive(Debug)]
pub struct SpeculativeGreedySearch {
    inner: GreedySearch,
    constrained: Vec<Constrained>,
}

impl SpeculativeGreedySearch {
    pub fn new(params: SearchParams, input_ids: &[u32]) -> Result<Self> {
        if params.batch_beam_size() != 1 {
            return Err(GenerationError::Config(
                "speculative search drives a single sequence".into(),
            ));
        }
        Ok(Self {
            inner: GreedySearch::with_positions(params, input_ids, true)?,
            constrained: Vec::new(),
        })
    }

    fn position_count(&self) -> usize {
        self.inner.logits().positions()
    }

    fn check_position(&self, token_idx: usize) -> Result<()> {
        self.inner.logits().require_fresh()?;
        let positions = self.position_count();
        if token_idx >= positions {
            return Err(GenerationError::shape(
                format!("token index below {positions}"),
                token_idx.to_string(),
            ));
        }
        Ok(())
    }

    /// Suppress end tokens at `token_idx` when its token would land before
    /// `min_length`. Each position is constrained at most once per load.
    fn min_length_at(&mut self, history_len: usize, min_length: usize, token_idx: usize) {
        if self.constrained[token_idx].min_length {
            return;
        }
        self.constrained[token_idx].min_length = true;
        if history_len >= min_length {
            return;
        }
        let eos = self.inner.params().eos_token_ids.clone();
        sampling::suppress_tokens(self.inner.logits_mut().row_at_mut(0, token_idx), &eos);
    }

    /// Penalize `history` at `token_idx`, once per position and load.
    fn penalty_at(&mut self, history: &[u32], penalty: f32, token_idx: usize) {
        if self.constrained[token_idx].penalty {
            return;
        }
        self.constrained[token_idx].penalty = true;
        if penalty == 1.0 {
            return;
        }
        sampling::apply_repetition_penalty(
            self.inner.logits_mut().row_at_mut(0, token_idx),
            history,
            penalty,
        );
    }

    /// Apply the configured constraints to position `token_idx`, whose token
    /// follows `history`.
    fn constrain_position(&mut self, history: &[u32], token_idx: usize) {
        let min_length = self.inner.params().min_length;
        let penalty = self.inner.params().repetition_penalty;
        self.min_length_at(history.len(), min_length, token_idx);
        self.penalty_at(history, penalty, token_idx);
    }
}

impl Search for SpeculativeGreedySearch {
    fn kind(&self) -> SearchKind {
        SearchKind::SpeculativeGreedy
    }

    fn set_logits(&mut self, logits: &Tensor) -> Result<()> {
        self.inner.set_logits(logits)?;
        self.constrained = vec![Constrained::default(); self.position_count()];
        Ok(())
    }

    fn sequences(&self) -> &Sequences {
        self.inner.sequences()
    }

    fn next_tokens(&self) -> &[u32] {
        self.inner.next_tokens()
    }

    fn sequence(&mut self, index: usize) -> Result<Vec<u32>> {
        self.inner.sequence(index)
    }

    fn sequence_lengths(&self) -> Vec<usize> {
        self.inner.sequence_lengths()
    }

    fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    fn select_top(&mut self) -> Result<()> {
        self.inner.select_top()
    }

    fn sample_top_k(&mut self, k: usize, temperature: f32) -> Result<()> {
        self.inner.sample_top_k(k, temperature)
    }

    fn sample_top_p(&mut self, p: f32, temperature: f32) -> Result<()> {
        self.inner.sample_top_p(p, temperature)
    }

    fn sample_top_k_top_p(&mut self, k: usize, p: f32, temperature: f32) -> Result<()> {
        self.inner.sample_top_k_top_p(k, p, temperature)
    }

    fn apply_min_length(&mut self, min_length: usize) -> Result<()> {
        self.inner.apply_min_length(min_length)
    }

    fn apply_repetition_penalty(&mut self, penalty: f32) -> Result<()> {
        self.inner.apply_repetition_penalty(penalty)
    }

    fn drop_last_tokens(&mut self, n: usize) -> Result<()> {
        self.inner.drop_last_tokens(n)
    }

    fn set_next_tokens(&mut self, tokens: &[u32]) -> Result<()> {
        self.inner.set_next_tokens(tokens)
    }

    /// Verify the last `candidate_length` tokens of `sequence`.
    ///
    /// Acceptance stops at the first disagreement, whose authoritative token
    /// becomes the correction, or right after an accepted end token. When the
    /// whole draft is accepted and a bonus position exists, its argmax is the
    /// correction.
    fn check_candidates(&mut self, sequence: &[u32], candidate_length: usize) -> Result<CandidateCheck> {
        self.inner.logits().require_fresh()?;
        if candidate_length > sequence.len() || candidate_length > self.position_count() {
            return Err(GenerationError::shape(
                format!(
                    "at most {} candidates",
                    self.position_count().min(sequence.len())
                ),
                candidate_length.to_string(),
            ));
        }
        let prefix_len = sequence.len() - candidate_length;
        let mut check = CandidateCheck::default();

        for i in 0..candidate_length {
            let history = &sequence[..prefix_len + i];
            self.constrain_position(history, i);
            let target = sampling::argmax(self.inner.logits().row_at(0, i));
            let draft = sequence[prefix_len + i];
            if target != draft {
                check.correction = Some(target);
                break;
            }
            check.accepted.push(draft);
            if self.inner.params().is_eos(draft) {
                break;
            }
        }

        let all_accepted = check.accepted.len() == candidate_length;
        let ended = check
            .accepted
            .last()
            .is_some_and(|&t| self.inner.params().is_eos(t));
        if all_accepted && !ended && candidate_length < self.position_count() {
            self.constrain_position(sequence, candidate_length);
            check.correction = Some(sampling::argmax(
                self.inner.logits().row_at(0, candidate_length),
            ));
        }

        debug!(
            candidates = candidate_length,
            accepted = check.accepted.len(),
            correction = ?check.correction,
            "checked speculative candidates"
        );
        Ok(check)
    }

    /// Suppress end tokens at `token_idx` when the committed sequence plus
    /// `token_idx` draft tokens is shorter than `min_length`. A position
    /// constrained here is left alone by [`Search::check_candidates`].
    fn apply_min_length_at(&mut self, min_length: usize, token_idx: usize) -> Result<()> {
        self.check_position(token_idx)?;
        let history_len = self.inner.sequences().current_length() + token_idx;
        self.min_length_at(history_len, min_length, token_idx);
        Ok(())
    }

    /// Penalize tokens of the committed sequence at position `token_idx`.
    /// A position penalized here is left alone by [`Search::check_candidates`].
    fn apply_repetition_penalty_at(&mut self, penalty: f32, token_idx: usize) -> Result<()> {
        self.check_position(token_idx)?;
        let history = self.inner.sequences().sequence(0).to_vec();
        self.penalty_at(&history, penalty, token_idx);
        Ok(())
    }
}
