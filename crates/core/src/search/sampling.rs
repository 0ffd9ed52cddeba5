//! Per-row logit transforms and token draws shared by the strategies.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// RNG owned by one search instance.
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

impl std::fmt::Debug for SamplerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerState").finish_non_exhaustive()
    }
}

/// Divide positive scores by `penalty`, multiply non-positive ones.
///
/// Each distinct token is penalized once no matter how often it occurs.
pub(crate) fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    let mut seen = std::collections::HashSet::with_capacity(history.len());
    for &token_id in history {
        if !seen.insert(token_id) {
            continue;
        }
        let idx = token_id as usize;
        if idx < logits.len() {
            if logits[idx] > 0.0 {
                logits[idx] /= penalty;
            } else {
                logits[idx] *= penalty;
            }
        }
    }
}

pub(crate) fn suppress_tokens(logits: &mut [f32], tokens: &[u32]) {
    for &token_id in tokens {
        let idx = token_id as usize;
        if idx < logits.len() {
            logits[idx] = f32::NEG_INFINITY;
        }
    }
}

/// Softmax of `logits / temperature`; non-positive temperatures act as 1.
pub(crate) fn tempered_softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let t = if temperature > 0.0 { temperature } else { 1.0 };
    if t == 1.0 {
        return softmax(logits);
    }
    let scaled: Vec<f32> = logits.iter().map(|&l| l / t).collect();
    softmax(&scaled)
}

pub(crate) fn apply_top_k(probs: &mut [f32], k: usize) {
    if k == 0 || k >= probs.len() {
        return;
    }
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    for &(idx, _) in &indexed[k..] {
        probs[idx] = 0.0;
    }
}

pub(crate) fn apply_top_p(probs: &mut [f32], top_p: f32) {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let total: f32 = indexed.iter().map(|&(_, p)| p).sum();
    let mut cumsum = 0.0f32;
    let mut cutoff_idx = indexed.len();
    for (i, &(_, p)) in indexed.iter().enumerate() {
        cumsum += p;
        if cumsum >= top_p * total {
            cutoff_idx = i + 1;
            break;
        }
    }

    for &(idx, _) in &indexed[cutoff_idx..] {
        probs[idx] = 0.0;
    }
}

pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max_logit == f32::NEG_INFINITY {
        return vec![0.0; logits.len()];
    }
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

/// Compute log-softmax in a numerically stable way.
/// log_softmax(x_i) = x_i - max(x) - log(sum(exp(x_j - max(x))))
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum_ln = logits
        .iter()
        .map(|&x| (x - max_logit).exp())
        .sum::<f32>()
        .ln();
    logits.iter().map(|&x| x - max_logit - exp_sum_ln).collect()
}

/// Index of the largest value; the lowest index wins ties.
pub fn argmax(values: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best as u32
}

/// Draw from an unnormalized distribution.
pub(crate) fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> u32 {
    let total: f32 = probs.iter().sum();
    if total <= 0.0 {
        return argmax(probs);
    }
    let r: f32 = rng.gen::<f32>() * total;
    let mut cumsum = 0.0f32;
    let mut last_nonzero = 0usize;
    for (i, &p) in probs.iter().enumerate() {
        if p > 0.0 {
            last_nonzero = i;
        }
        cumsum += p;
        if r < cumsum {
            return i as u32;
        }
    }
    last_nonzero as u32
}

/// Full sampling path for one row: temperature, truncation, draw.
pub(crate) fn sample_row(
    logits: &[f32],
    top_k: Option<usize>,
    top_p: Option<f32>,
    temperature: f32,
    rng: &mut StdRng,
) -> u32 {
    let mut probs = tempered_softmax(logits, temperature);
    if let Some(k) = top_k {
        apply_top_k(&mut probs, k);
    }
    if let Some(p) = top_p {
        apply_top_p(&mut probs, p);
    }
    sample_from_probs(&probs, rng)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_prefers_lowest_index_on_tie() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, 2.0]), 1);
        assert_eq!(argmax(&[5.0]), 0);
    }

    #[test]
    fn repetition_penalty_divides_and_multiplies() {
        let mut logits = vec![2.0, -2.0, 1.0];
        apply_repetition_penalty(&mut logits, &[0, 1, 0, 0], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 1.0]);
    }

    #[test]
    fn repetition_penalty_ignores_out_of_range() {
        let mut logits = vec![1.0];
        apply_repetition_penalty(&mut logits, &[7], 2.0);
        assert_eq!(logits, vec![1.0]);
    }

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn log_softmax_matches_softmax() {
        let logits = [0.5, 1.5, -1.0];
        let lp = log_softmax(&logits);
        let p = softmax(&logits);
        for (a, b) in lp.iter().zip(p.iter()) {
            assert!((a.exp() - b).abs() < 1e-6);
        }
    }

    #[test]
    fn zero_temperature_acts_as_one() {
        let logits = [1.0, 2.0];
        assert_eq!(tempered_softmax(&logits, 0.0), softmax(&logits));
        assert_eq!(tempered_softmax(&logits, -3.0), softmax(&logits));
    }

    #[test]
    fn top_k_keeps_k_largest() {
        let mut probs = vec![0.1, 0.4, 0.2, 0.3];
        apply_top_k(&mut probs, 2);
        assert_eq!(probs, vec![0.0, 0.4, 0.0, 0.3]);
    }

    #[test]
    fn top_p_keeps_smallest_covering_set() {
        let mut probs = vec![0.1, 0.5, 0.15, 0.25];
        apply_top_p(&mut probs, 0.7);
        assert_eq!(probs, vec![0.0, 0.5, 0.0, 0.25]);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let logits: Vec<f32> = (0..32).map(|i| (i as f32 * 0.37).sin()).collect();
        let draw = |seed| {
            let mut state = SamplerState::new(Some(seed));
            (0..16)
                .map(|_| sample_row(&logits, Some(8), Some(0.9), 0.7, state.rng_mut()))
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
    }

    #[test]
    fn sampling_respects_top_k_one() {
        let logits = [0.0, 4.0, 1.0];
        let mut state = SamplerState::new(Some(1));
        for _ in 0..20 {
            assert_eq!(sample_row(&logits, Some(1), None, 1.0, state.rng_mut()), 1);
        }
    }
}
