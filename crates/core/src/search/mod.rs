//! Token search: turns logits into committed tokens.
//!
//! # Strategies
//!
//! - [`GreedySearch`]: argmax or sampling per row, one row per batch entry.
//! - [`BeamSearch`]: `num_beams` rows per batch entry, ranked by cumulative
//!   log probability through a [`BeamSearchScorer`].
//! - [`SpeculativeGreedySearch`]: greedy search that can also verify a run of
//!   draft tokens against logits for several positions at once.
//!
//! All strategies sit behind the object-safe [`Search`] trait. Operations a
//! strategy does not implement return
//! [`GenerationError::UnsupportedOperation`] instead of silently doing
//! nothing.
//!
//! # Step contract
//!
//! ```text
//! set_logits ─► apply_min_length / apply_repetition_penalty ─► select_top | sample_*
//!                                                              │
//!                                      next_tokens / next_indices ◄┘
//! ```

mod beam;
mod greedy;
pub(crate) mod sampling;
mod scorer;
mod sequences;
mod speculative;

use candle_core::{DType, Device, Tensor};

use crate::error::{GenerationError, Result};

pub use beam::BeamSearch;
pub use greedy::GreedySearch;
pub use sampling::{argmax, log_softmax, SamplerState};
pub use scorer::{BeamHypotheses, BeamSearchScorer};
pub use sequences::Sequences;
pub use speculative::SpeculativeGreedySearch;

// ─── Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Greedy,
    Beam,
    SpeculativeGreedy,
}

impl SearchKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Greedy => "greedy",
            Self::Beam => "beam",
            Self::SpeculativeGreedy => "speculative greedy",
        }
    }
}

/// Everything a strategy needs to know about the batch it drives.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub batch_size: usize,
    pub num_beams: usize,
    pub num_return_sequences: usize,
    pub max_length: usize,
    pub vocab_size: usize,
    pub pad_token_id: u32,
    pub eos_token_ids: Vec<u32>,
    pub length_penalty: f32,
    pub early_stopping: bool,
    pub random_seed: Option<u64>,
    /// Constraints the speculative strategy applies while verifying drafts.
    pub min_length: usize,
    pub repetition_penalty: f32,
}

impl SearchParams {
    pub fn batch_beam_size(&self) -> usize {
        self.batch_size * self.num_beams
    }

    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_token_ids.contains(&token)
    }
}

/// Outcome of verifying draft tokens.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CandidateCheck {
    /// Longest draft prefix the authoritative logits agree with.
    pub accepted: Vec<u32>,
    /// Authoritative token after the accepted prefix, if one is known.
    pub correction: Option<u32>,
}

impl CandidateCheck {
    pub fn accepted_len(&self) -> usize {
        self.accepted.len()
    }

    /// Tokens to commit: the accepted prefix plus the correction.
    pub fn committed(&self) -> Vec<u32> {
        let mut tokens = self.accepted.clone();
        tokens.extend(self.correction);
        tokens
    }
}

/// A finished beam hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalSequence {
    pub tokens: Vec<u32>,
    pub score: f32,
}

// ─── Search trait ────────────────────────────────────────────────────────

pub trait Search: Send {
    fn kind(&self) -> SearchKind;

    /// Load logits shaped `[rows, vocab]` or `[rows, positions, vocab]`.
    fn set_logits(&mut self, logits: &Tensor) -> Result<()>;

    fn sequences(&self) -> &Sequences;

    /// Tokens chosen by the latest selection, one per row unless a run of
    /// tokens was committed through [`Search::set_next_tokens`].
    fn next_tokens(&self) -> &[u32];

    /// Parent row of every row after the latest selection. Empty unless the
    /// strategy reorders rows.
    fn next_indices(&self) -> &[u32] {
        &[]
    }

    fn sequence_length(&self) -> usize {
        self.sequences().current_length()
    }

    /// Per-row lengths. Defaults to the shared padded length; strategies
    /// that know the pad token leave the prompt's padding out.
    fn sequence_lengths(&self) -> Vec<usize> {
        vec![self.sequence_length(); self.sequences().rows()]
    }

    /// Tokens of result `index`. For beam search this finalizes the search.
    fn sequence(&mut self, index: usize) -> Result<Vec<u32>>;

    fn is_done(&self) -> bool;

    fn select_top(&mut self) -> Result<()>;

    fn sample_top_k(&mut self, k: usize, temperature: f32) -> Result<()> {
        let _ = (k, temperature);
        Err(unsupported(self.kind(), "sample_top_k"))
    }

    fn sample_top_p(&mut self, p: f32, temperature: f32) -> Result<()> {
        let _ = (p, temperature);
        Err(unsupported(self.kind(), "sample_top_p"))
    }

    fn sample_top_k_top_p(&mut self, k: usize, p: f32, temperature: f32) -> Result<()> {
        let _ = (k, p, temperature);
        Err(unsupported(self.kind(), "sample_top_k_top_p"))
    }

    /// Forbid every end token while the sequence is shorter than `min_length`.
    fn apply_min_length(&mut self, min_length: usize) -> Result<()>;

    fn apply_repetition_penalty(&mut self, penalty: f32) -> Result<()>;

    fn drop_last_tokens(&mut self, n: usize) -> Result<()> {
        let _ = n;
        Err(unsupported(self.kind(), "drop_last_tokens"))
    }

    fn set_next_tokens(&mut self, tokens: &[u32]) -> Result<()> {
        let _ = tokens;
        Err(unsupported(self.kind(), "set_next_tokens"))
    }

    fn check_candidates(&mut self, sequence: &[u32], candidate_length: usize) -> Result<CandidateCheck> {
        let _ = (sequence, candidate_length);
        Err(unsupported(self.kind(), "check_candidates"))
    }

    fn apply_min_length_at(&mut self, min_length: usize, token_idx: usize) -> Result<()> {
        let _ = (min_length, token_idx);
        Err(unsupported(self.kind(), "apply_min_length_at"))
    }

    fn apply_repetition_penalty_at(&mut self, penalty: f32, token_idx: usize) -> Result<()> {
        let _ = (penalty, token_idx);
        Err(unsupported(self.kind(), "apply_repetition_penalty_at"))
    }

    fn finalize(&mut self, num_return_sequences: usize) -> Result<Vec<FinalSequence>> {
        let _ = num_return_sequences;
        Err(unsupported(self.kind(), "finalize"))
    }
}

pub(crate) fn unsupported(kind: SearchKind, operation: &'static str) -> GenerationError {
    GenerationError::UnsupportedOperation {
        strategy: kind.name(),
        operation,
    }
}

/// Build the strategy the parameters call for.
pub fn create_search(
    params: SearchParams,
    input_ids: &[u32],
    speculative: bool,
) -> Result<Box<dyn Search>> {
    if speculative {
        return Ok(Box::new(SpeculativeGreedySearch::new(params, input_ids)?));
    }
    if params.num_beams > 1 {
        Ok(Box::new(BeamSearch::new(params, input_ids)?))
    } else {
        Ok(Box::new(GreedySearch::new(params, input_ids)?))
    }
}

// ─── Logits buffer ───────────────────────────────────────────────────────

/// Host copy of the latest logits, `rows × positions × vocab`.
#[derive(Debug, Default)]
pub(crate) struct LogitsBuffer {
    data: Vec<f32>,
    rows: usize,
    positions: usize,
    vocab: usize,
    fresh: bool,
}

impl LogitsBuffer {
    /// Copy `logits` to host. Unless `keep_positions` is set only the last
    /// position of a 3-D tensor is kept.
    pub fn load(
        &mut self,
        logits: &Tensor,
        rows: usize,
        vocab: usize,
        keep_positions: bool,
    ) -> Result<()> {
        let logits = match logits.dims() {
            [_, _] => logits.unsqueeze(1)?,
            [_, seq, _] if !keep_positions && *seq > 1 => logits.narrow(1, seq - 1, 1)?,
            [_, _, _] => logits.clone(),
            dims => {
                return Err(GenerationError::shape(
                    "logits of rank 2 or 3",
                    format!("{dims:?}"),
                ))
            }
        };
        let (r, positions, v) = logits.dims3()?;
        if r != rows || (vocab > 0 && v != vocab) || positions == 0 {
            return Err(GenerationError::shape(
                format!("[{rows}, _, {vocab}]"),
                format!("{:?}", logits.dims()),
            ));
        }
        self.data = logits
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        self.rows = r;
        self.positions = positions;
        self.vocab = v;
        self.fresh = true;
        Ok(())
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn consume(&mut self) {
        self.fresh = false;
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn positions(&self) -> usize {
        self.positions
    }

    pub fn vocab(&self) -> usize {
        self.vocab
    }

    /// Scores for `row` at its last position.
    pub fn row(&self, row: usize) -> &[f32] {
        self.row_at(row, self.positions.saturating_sub(1))
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [f32] {
        self.row_at_mut(row, self.positions.saturating_sub(1))
    }

    pub fn row_at(&self, row: usize, position: usize) -> &[f32] {
        let start = (row * self.positions + position) * self.vocab;
        &self.data[start..start + self.vocab]
    }

    pub fn row_at_mut(&mut self, row: usize, position: usize) -> &mut [f32] {
        let start = (row * self.positions + position) * self.vocab;
        &mut self.data[start..start + self.vocab]
    }

    pub fn require_fresh(&self) -> Result<()> {
        if self.fresh {
            Ok(())
        } else {
            Err(GenerationError::LogitsNotComputed)
        }
    }
}

/// Min-length and repetition constraints shared by the row-based strategies.
pub(crate) fn constrain_min_length(
    logits: &mut LogitsBuffer,
    sequences: &Sequences,
    eos_token_ids: &[u32],
    min_length: usize,
) -> Result<()> {
    logits.require_fresh()?;
    if sequences.current_length() >= min_length {
        return Ok(());
    }
    for row in 0..logits.rows() {
        sampling::suppress_tokens(logits.row_mut(row), eos_token_ids);
    }
    Ok(())
}

pub(crate) fn constrain_repetition(
    logits: &mut LogitsBuffer,
    sequences: &Sequences,
    penalty: f32,
) -> Result<()> {
    logits.require_fresh()?;
    if penalty == 1.0 {
        return Ok(());
    }
    for row in 0..logits.rows() {
        sampling::apply_repetition_penalty(logits.row_mut(row), sequences.sequence(row), penalty);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SearchParams {
        SearchParams {
            batch_size: 1,
            num_beams: 1,
            num_return_sequences: 1,
            max_length: 8,
            vocab_size: 4,
            pad_token_id: 0,
            eos_token_ids: vec![3],
            length_penalty: 1.0,
            early_stopping: true,
            random_seed: Some(0),
            min_length: 0,
            repetition_penalty: 1.0,
        }
    }

    #[test]
    fn buffer_keeps_last_position_by_default() {
        let t = Tensor::new(&[[[1f32, 2., 3., 4.], [5., 6., 7., 8.]]], &Device::Cpu).unwrap();
        let mut buf = LogitsBuffer::default();
        buf.load(&t, 1, 4, false).unwrap();
        assert_eq!(buf.positions(), 1);
        assert_eq!(buf.row(0), &[5., 6., 7., 8.]);

        buf.load(&t, 1, 4, true).unwrap();
        assert_eq!(buf.positions(), 2);
        assert_eq!(buf.row_at(0, 0), &[1., 2., 3., 4.]);
    }

    #[test]
    fn buffer_rejects_wrong_rows() {
        let t = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let mut buf = LogitsBuffer::default();
        assert!(matches!(
            buf.load(&t, 3, 4, false),
            Err(GenerationError::Shape { .. })
        ));
    }

    #[test]
    fn beam_strategy_rejects_sampling() {
        let mut p = params();
        p.num_beams = 2;
        p.num_return_sequences = 2;
        let mut search = create_search(p, &[1], false).unwrap();
        assert_eq!(search.kind(), SearchKind::Beam);
        let err = search.sample_top_p(0.9, 1.0).unwrap_err();
        assert_eq!(err.to_string(), "beam search does not support sample_top_p");
        assert!(search.check_candidates(&[1], 1).is_err());
    }

    #[test]
    fn greedy_rejects_candidate_checks() {
        let mut search = create_search(params(), &[1], false).unwrap();
        assert_eq!(search.kind(), SearchKind::Greedy);
        assert!(matches!(
            search.check_candidates(&[1, 2], 1),
            Err(GenerationError::UnsupportedOperation { .. })
        ));
        assert!(search.finalize(1).is_err());
    }

    #[test]
    fn candidate_check_committed_tokens() {
        let check = CandidateCheck {
            accepted: vec![4, 5],
            correction: Some(9),
        };
        assert_eq!(check.committed(), vec![4, 5, 9]);
        assert_eq!(check.accepted_len(), 2);
    }
}
