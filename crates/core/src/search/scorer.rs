//! Finished-hypothesis bookkeeping for beam search.

use super::{FinalSequence, SearchParams, Sequences};
use crate::error::{GenerationError, Result};

/// Best finished hypotheses of one batch entry.
///
/// Keeps at most `num_beams` entries in completion order. A hypothesis is
/// scored as `sum_logprobs / len^length_penalty`.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    num_beams: usize,
    length_penalty: f32,
    early_stopping: bool,
    beams: Vec<FinalSequence>,
    worst_score: f32,
}

impl BeamHypotheses {
    pub fn new(num_beams: usize, length_penalty: f32, early_stopping: bool) -> Self {
        Self {
            num_beams,
            length_penalty,
            early_stopping,
            beams: Vec::with_capacity(num_beams + 1),
            worst_score: f32::INFINITY,
        }
    }

    pub fn len(&self) -> usize {
        self.beams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beams.is_empty()
    }

    fn normalized(&self, sum_logprobs: f32, len: usize) -> f32 {
        sum_logprobs / (len.max(1) as f32).powf(self.length_penalty)
    }

    pub fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32) {
        let score = self.normalized(sum_logprobs, tokens.len());
        if self.beams.len() >= self.num_beams && score <= self.worst_score {
            return;
        }
        self.beams.push(FinalSequence { tokens, score });
        if self.beams.len() > self.num_beams {
            // Evict the lowest score; among equals the latest completion goes.
            let mut worst = 0;
            for (i, beam) in self.beams.iter().enumerate() {
                if beam.score <= self.beams[worst].score {
                    worst = i;
                }
            }
            self.beams.remove(worst);
        }
        self.worst_score = self
            .beams
            .iter()
            .map(|b| b.score)
            .fold(f32::INFINITY, f32::min);
    }

    /// Whether no running beam can still beat the finished ones.
    pub fn is_done(&self, best_sum_logprobs: f32, cur_len: usize) -> bool {
        if self.beams.len() < self.num_beams {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        self.worst_score >= self.normalized(best_sum_logprobs, cur_len)
    }

    /// Hypotheses sorted by descending score; ties keep completion order.
    pub fn ranked(&self) -> Vec<FinalSequence> {
        let mut sorted = self.beams.clone();
        sorted.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted
    }
}

/// One candidate extension: row `beam` (within its batch) plus `token`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredCandidate {
    pub score: f32,
    pub token: u32,
    pub beam: usize,
}

/// Per-batch selection after one step.
#[derive(Debug, Clone, Default)]
pub struct ScorerStep {
    pub scores: Vec<f32>,
    pub tokens: Vec<u32>,
    /// Global parent row of each next row.
    pub indices: Vec<u32>,
}

#[derive(Debug)]
pub struct BeamSearchScorer {
    batch_size: usize,
    num_beams: usize,
    pad_token_id: u32,
    eos_token_ids: Vec<u32>,
    hypotheses: Vec<BeamHypotheses>,
    done: Vec<bool>,
}

impl BeamSearchScorer {
    pub fn new(params: &SearchParams) -> Self {
        let hypotheses = (0..params.batch_size)
            .map(|_| {
                BeamHypotheses::new(params.num_beams, params.length_penalty, params.early_stopping)
            })
            .collect();
        Self {
            batch_size: params.batch_size,
            num_beams: params.num_beams,
            pad_token_id: params.pad_token_id,
            eos_token_ids: params.eos_token_ids.clone(),
            hypotheses,
            done: vec![false; params.batch_size],
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.iter().all(|&d| d)
    }

    pub fn batch_done(&self, batch: usize) -> bool {
        self.done[batch]
    }

    pub fn hypotheses(&self, batch: usize) -> &BeamHypotheses {
        &self.hypotheses[batch]
    }

    /// Choose `num_beams` survivors per batch from candidates sorted best
    /// first. End-token candidates ranked within the top `num_beams` become
    /// finished hypotheses instead of surviving.
    pub fn process(
        &mut self,
        sequences: &Sequences,
        candidates: &[Vec<ScoredCandidate>],
    ) -> Result<ScorerStep> {
        let nb = self.num_beams;
        let rows = self.batch_size * nb;
        let mut step = ScorerStep {
            scores: vec![0.0; rows],
            tokens: vec![self.pad_token_id; rows],
            indices: vec![0; rows],
        };
        let cur_len = sequences.current_length();

        for (batch, batch_candidates) in candidates.iter().enumerate() {
            let base = batch * nb;
            if self.done[batch] {
                for j in 0..nb {
                    step.indices[base + j] = (base + j) as u32;
                }
                continue;
            }

            let mut filled = 0;
            for (rank, cand) in batch_candidates.iter().enumerate() {
                let row = base + cand.beam;
                if self.eos_token_ids.contains(&cand.token) {
                    if rank >= nb {
                        continue;
                    }
                    let mut tokens = sequences.sequence(row).to_vec();
                    tokens.push(cand.token);
                    self.hypotheses[batch].add(tokens, cand.score);
                } else {
                    step.scores[base + filled] = cand.score;
                    step.tokens[base + filled] = cand.token;
                    step.indices[base + filled] = row as u32;
                    filled += 1;
                }
                if filled == nb {
                    break;
                }
            }
            if filled < nb {
                return Err(GenerationError::shape(
                    format!("{nb} surviving beams"),
                    filled.to_string(),
                ));
            }

            let best = batch_candidates
                .first()
                .map(|c| c.score)
                .unwrap_or(f32::NEG_INFINITY);
            self.done[batch] = self.hypotheses[batch].is_done(best, cur_len + 1);
        }
        Ok(step)
    }

    /// Top `num_return_sequences` per batch. Live beams of unfinished
    /// batches compete with the finished hypotheses.
    pub fn finalize(
        &mut self,
        sequences: &Sequences,
        beam_scores: &[f32],
        num_return_sequences: usize,
    ) -> Vec<FinalSequence> {
        let mut out = Vec::with_capacity(self.batch_size * num_return_sequences);
        for batch in 0..self.batch_size {
            if !self.done[batch] {
                for beam in 0..self.num_beams {
                    let row = batch * self.num_beams + beam;
                    self.hypotheses[batch].add(sequences.sequence(row).to_vec(), beam_scores[row]);
                }
            }
            out.extend(
                self.hypotheses[batch]
                    .ranked()
                    .into_iter()
                    .take(num_return_sequences),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hypotheses_keep_best_n() {
        let mut hyps = BeamHypotheses::new(2, 1.0, false);
        hyps.add(vec![1, 2], -4.0); // -2.0
        hyps.add(vec![1, 2], -2.0); // -1.0
        hyps.add(vec![1, 2], -6.0); // -3.0, rejected
        hyps.add(vec![1, 2, 3, 4], -4.0); // -1.0, evicts -2.0

        let ranked = hyps.ranked();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].score, -1.0);
        assert_eq!(ranked[1].score, -1.0);
        assert_eq!(ranked[0].tokens, vec![1, 2]);
    }

    #[test]
    fn ties_rank_by_completion_order() {
        let mut hyps = BeamHypotheses::new(3, 0.0, true);
        hyps.add(vec![7], -1.0);
        hyps.add(vec![8], -1.0);
        hyps.add(vec![9], -0.5);
        let ranked: Vec<Vec<u32>> = hyps.ranked().into_iter().map(|h| h.tokens).collect();
        assert_eq!(ranked, vec![vec![9], vec![7], vec![8]]);
    }

    #[test]
    fn is_done_rules() {
        let mut hyps = BeamHypotheses::new(1, 1.0, false);
        assert!(!hyps.is_done(0.0, 4));
        hyps.add(vec![1, 2], -2.0); // -1.0
        assert!(hyps.is_done(-8.0, 4)); // running best -2.0
        assert!(!hyps.is_done(-1.0, 4)); // running best -0.25

        let mut early = BeamHypotheses::new(1, 1.0, true);
        early.add(vec![1], -10.0);
        assert!(early.is_done(0.0, 1));
    }

    #[test]
    fn process_routes_eos_to_hypotheses() {
        let params = SearchParams {
            batch_size: 1,
            num_beams: 2,
            num_return_sequences: 2,
            max_length: 8,
            vocab_size: 8,
            pad_token_id: 0,
            eos_token_ids: vec![3],
            length_penalty: 1.0,
            early_stopping: false,
            random_seed: None,
            min_length: 0,
            repetition_penalty: 1.0,
        };
        let sequences = Sequences::new(&[5], 1, 2, 8).unwrap();
        let mut scorer = BeamSearchScorer::new(&params);
        let candidates = vec![vec![
            ScoredCandidate { score: -0.1, token: 3, beam: 0 },
            ScoredCandidate { score: -0.2, token: 4, beam: 0 },
            ScoredCandidate { score: -0.3, token: 3, beam: 1 },
            ScoredCandidate { score: -0.4, token: 6, beam: 1 },
        ]];
        let step = scorer.process(&sequences, &candidates).unwrap();

        assert_eq!(step.tokens, vec![4, 6]);
        assert_eq!(step.indices, vec![0, 1]);
        assert_eq!(step.scores, vec![-0.2, -0.4]);
        // Only the top-ranked end token became a hypothesis.
        assert_eq!(scorer.hypotheses(0).len(), 1);
        assert!(!scorer.is_done());
    }
}
