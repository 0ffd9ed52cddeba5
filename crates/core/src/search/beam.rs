//! Beam search decoding.
//!
//! Each batch entry owns `num_beams` consecutive rows. Every step expands all
//! rows by all tokens, ranks the expansions by cumulative log probability and
//! lets the [`BeamSearchScorer`] keep `num_beams` survivors. Survivors may
//! descend from any row of their batch; [`Search::next_indices`] tells the
//! session which cache rows to carry forward.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use candle_core::Tensor;
use tracing::debug;

use crate::error::{GenerationError, Result};

use super::sampling::log_softmax;
use super::scorer::{BeamSearchScorer, ScoredCandidate};
use super::{
    constrain_min_length, constrain_repetition, FinalSequence, LogitsBuffer, Search, SearchKind,
    SearchParams, Sequences,
};

/// Initial score of every beam but the first, so step one expands one row.
const INACTIVE_BEAM_SCORE: f32 = -1e9;

/// Candidate for beam expansion, ordered worst-first for a bounded heap.
#[derive(Debug, Clone, Copy)]
struct BeamCandidate {
    score: f32,
    /// `beam * vocab + token`; lower wins among equal scores.
    flat_index: usize,
}

impl PartialEq for BeamCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BeamCandidate {}

impl PartialOrd for BeamCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BeamCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Greater means worse, so the heap top is the first to evict.
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.flat_index.cmp(&other.flat_index))
    }
}

/// Best `k` of `(score, flat_index)` pairs, best first.
fn top_k_candidates(scores: impl Iterator<Item = (usize, f32)>, k: usize) -> Vec<BeamCandidate> {
    let mut heap = BinaryHeap::with_capacity(k + 1);
    for (flat_index, score) in scores {
        heap.push(BeamCandidate { score, flat_index });
        if heap.len() > k {
            heap.pop();
        }
    }
    heap.into_sorted_vec()
}

#[derive(Debug)]
pub struct BeamSearch {
    params: SearchParams,
    sequences: Sequences,
    logits: LogitsBuffer,
    beam_scores: Vec<f32>,
    scorer: BeamSearchScorer,
    next_tokens: Vec<u32>,
    next_indices: Vec<u32>,
    done: bool,
    finalized: Option<Vec<FinalSequence>>,
}

impl BeamSearch {
    pub fn new(params: SearchParams, input_ids: &[u32]) -> Result<Self> {
        if params.num_beams == 0 {
            return Err(GenerationError::Config("num_beams must be at least 1".into()));
        }
        let rows = params.batch_beam_size();
        let sequences = Sequences::new(
            input_ids,
            params.batch_size,
            params.num_beams,
            params.max_length,
        )?;
        let beam_scores = (0..rows)
            .map(|row| {
                if row % params.num_beams == 0 {
                    0.0
                } else {
                    INACTIVE_BEAM_SCORE
                }
            })
            .collect();
        Ok(Self {
            scorer: BeamSearchScorer::new(&params),
            done: sequences.is_full(),
            sequences,
            logits: LogitsBuffer::default(),
            beam_scores,
            next_tokens: vec![params.pad_token_id; rows],
            next_indices: (0..rows as u32).collect(),
            finalized: None,
            params,
        })
    }

    pub fn beam_scores(&self) -> &[f32] {
        &self.beam_scores
    }

    pub fn scorer(&self) -> &BeamSearchScorer {
        &self.scorer
    }

    /// Ranked expansions of every batch entry, best first.
    fn rank_candidates(&self) -> Vec<Vec<ScoredCandidate>> {
        let nb = self.params.num_beams;
        let vocab = self.logits.vocab();
        let k = nb * (1 + self.params.eos_token_ids.len().max(1));

        (0..self.params.batch_size)
            .map(|batch| {
                let per_beam: Vec<Vec<f32>> = (0..nb)
                    .map(|beam| {
                        let row = batch * nb + beam;
                        let base = self.beam_scores[row];
                        log_softmax(self.logits.row(row))
                            .into_iter()
                            .map(|lp| lp + base)
                            .collect()
                    })
                    .collect();
                let flat = per_beam
                    .iter()
                    .flat_map(|scores| scores.iter().copied())
                    .enumerate();
                top_k_candidates(flat, k)
                    .into_iter()
                    .map(|c| ScoredCandidate {
                        score: c.score,
                        token: (c.flat_index % vocab) as u32,
                        beam: c.flat_index / vocab,
                    })
                    .collect()
            })
            .collect()
    }
}

impl Search for BeamSearch {
    fn kind(&self) -> SearchKind {
        SearchKind::Beam
    }

    fn set_logits(&mut self, logits: &Tensor) -> Result<()> {
        self.logits.load(
            logits,
            self.params.batch_beam_size(),
            self.params.vocab_size,
            false,
        )
    }

    fn sequences(&self) -> &Sequences {
        &self.sequences
    }

    fn next_tokens(&self) -> &[u32] {
        &self.next_tokens
    }

    fn next_indices(&self) -> &[u32] {
        &self.next_indices
    }

    fn sequence_lengths(&self) -> Vec<usize> {
        self.sequences.real_lengths(self.params.pad_token_id)
    }

    fn sequence(&mut self, index: usize) -> Result<Vec<u32>> {
        let num_return = self.params.num_return_sequences;
        let finals = self.finalize(num_return)?;
        finals
            .get(index)
            .map(|f| f.tokens.clone())
            .ok_or_else(|| {
                GenerationError::shape(format!("index below {}", finals.len()), index.to_string())
            })
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn select_top(&mut self) -> Result<()> {
        self.logits.require_fresh()?;
        if self.finalized.is_some() {
            return Err(GenerationError::UnsupportedOperation {
                strategy: SearchKind::Beam.name(),
                operation: "select_top after finalize",
            });
        }

        let candidates = self.rank_candidates();
        let step = self.scorer.process(&self.sequences, &candidates)?;

        self.sequences
            .append_with_parents(&step.indices, &step.tokens)?;
        self.beam_scores = step.scores;
        self.next_tokens = step.tokens;
        self.next_indices = step.indices;
        self.logits.consume();
        self.done = self.scorer.is_done() || self.sequences.is_full();

        debug!(
            length = self.sequences.current_length(),
            done = self.done,
            "beam step"
        );
        Ok(())
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

    /// Runs once; later calls return the same results.
    fn finalize(&mut self, num_return_sequences: usize) -> Result<Vec<FinalSequence>> {
        if let Some(finals) = &self.finalized {
            return Ok(finals.clone());
        }
        if num_return_sequences == 0 || num_return_sequences > self.params.num_beams {
            return Err(GenerationError::Config(format!(
                "num_return_sequences must be in 1..={}",
                self.params.num_beams
            )));
        }
        let finals =
            self.scorer
                .finalize(&self.sequences, &self.beam_scores, num_return_sequences);
        self.finalized = Some(finals.clone());
        self.done = true;
        Ok(finals)
    }
}
