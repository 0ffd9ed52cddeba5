use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use candle_core::{DType, Device, Tensor};

use crate::pipeline::{InferenceBackend, NamedTensors};

const PAST_PREFIX: &str = "past_key_values.";
const PRESENT_PREFIX: &str = "present.";
const LOGITS: &str = "logits";
const HIDDEN: usize = 8;
const HOT: f32 = 10.0;

/// What a stage saw when it was invoked.
#[derive(Debug, Clone, PartialEq)]
pub struct StageCall {
    pub stage: String,
    /// Bound input names, sorted.
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    pub input_ids: Option<Vec<Vec<i64>>>,
    /// Sequence length of `past_key_values.0.key`, when bound.
    pub past_len: Option<usize>,
}

enum Scripted {
    Logits(Tensor),
    /// One token per row, predicted at every position.
    Rows(Vec<u32>),
    /// Single row; position `i` predicts token `i`, the last entry repeats.
    Positions(Vec<u32>),
}

#[derive(Default)]
struct Inner {
    script: VecDeque<Scripted>,
    calls: Vec<StageCall>,
    failing_stage: Option<String>,
}

/// A scripted stand-in for the sub-model sessions of a pipeline.
///
/// Every stage returns exactly the outputs it is asked for:
/// - `logits`: the next scripted entry, or zeros shaped `[rows, n, vocab]`;
/// - `present.*`: the matching `past_key_values.*` input extended by `n`
///   positions filled with the row index, so reordering is observable;
/// - anything else: zeros shaped `[rows, n, 8]`.
///
/// `rows` and `n` come from `input_ids`, or `inputs_embeds` when no ids are
/// bound.
pub struct MockBackend {
    vocab_size: usize,
    kv_heads: usize,
    head_size: usize,
    inner: Mutex<Inner>,
}

impl MockBackend {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            kv_heads: 1,
            head_size: 1,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Shape used for presents when no past input is bound.
    pub fn with_kv_cache(mut self, kv_heads: usize, head_size: usize) -> Self {
        self.kv_heads = kv_heads;
        self.head_size = head_size;
        self
    }

    pub fn push_logits(&self, logits: Tensor) {
        self.lock().script.push_back(Scripted::Logits(logits));
    }

    /// Next logits make row `r` pick `tokens[r]`.
    pub fn push_argmax(&self, tokens: &[u32]) {
        self.lock().script.push_back(Scripted::Rows(tokens.to_vec()));
    }

    /// Next logits make position `i` of the single row pick `tokens[i]`.
    pub fn push_position_argmax(&self, tokens: &[u32]) {
        self.lock()
            .script
            .push_back(Scripted::Positions(tokens.to_vec()));
    }

    /// Make every later invocation of `stage` fail.
    pub fn fail_stage(&self, stage: &str) {
        self.lock().failing_stage = Some(stage.to_string());
    }

    pub fn calls(&self) -> Vec<StageCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn logits(&self, script: Option<Scripted>, rows: usize, n: usize) -> candle_core::Result<Tensor> {
        let vocab = self.vocab_size;
        let mut data = vec![0f32; rows * n * vocab];
        let mut hot = |row: usize, pos: usize, token: u32| {
            let token = token as usize;
            if token < vocab {
                data[(row * n + pos) * vocab + token] = HOT;
            }
        };
        match script {
            Some(Scripted::Logits(t)) => return Ok(t),
            Some(Scripted::Rows(tokens)) if !tokens.is_empty() => {
                for row in 0..rows {
                    for pos in 0..n {
                        hot(row, pos, tokens[row % tokens.len()]);
                    }
                }
            }
            Some(Scripted::Positions(tokens)) if !tokens.is_empty() => {
                for row in 0..rows {
                    for pos in 0..n {
                        hot(row, pos, tokens[pos.min(tokens.len() - 1)]);
                    }
                }
            }
            _ => {}
        }
        Tensor::from_vec(data, (rows, n, vocab), &Device::Cpu)
    }

    fn present(
        &self,
        past: Option<&Tensor>,
        rows: usize,
        n: usize,
        device: &Device,
    ) -> candle_core::Result<Tensor> {
        let (heads, head, dtype) = match past {
            Some(p) => {
                let (_, heads, _, head) = p.dims4()?;
                (heads, head, p.dtype())
            }
            None => (self.kv_heads, self.head_size, DType::F32),
        };
        let data: Vec<f32> = (0..rows)
            .flat_map(|r| std::iter::repeat(r as f32).take(heads * n * head))
            .collect();
        let fresh = Tensor::from_vec(data, (rows, heads, n, head), device)?.to_dtype(dtype)?;
        match past {
            Some(p) => Tensor::cat(&[p, &fresh], 2),
            None => Ok(fresh),
        }
    }
}

fn batch_shape(inputs: &NamedTensors) -> candle_core::Result<(usize, usize)> {
    if let Some(ids) = inputs.get("input_ids") {
        return ids.dims2();
    }
    if let Some(embeds) = inputs.get("inputs_embeds") {
        let (rows, n, _) = embeds.dims3()?;
        return Ok((rows, n));
    }
    match inputs.values().next() {
        Some(t) if t.rank() > 0 => Ok((t.dim(0)?, 1)),
        _ => Ok((1, 1)),
    }
}

impl InferenceBackend for MockBackend {
    fn run_stage(
        &self,
        stage_id: &str,
        inputs: &NamedTensors,
        output_names: &[String],
    ) -> candle_core::Result<NamedTensors> {
        let mut input_names: Vec<String> = inputs.keys().cloned().collect();
        input_names.sort();
        let input_ids = match inputs.get("input_ids") {
            Some(ids) => Some(ids.to_dtype(DType::I64)?.to_vec2::<i64>()?),
            None => None,
        };
        let past_len = match inputs.get("past_key_values.0.key") {
            Some(past) => Some(past.dim(2)?),
            None => None,
        };

        let script = {
            let mut inner = self.lock();
            inner.calls.push(StageCall {
                stage: stage_id.to_string(),
                input_names,
                output_names: output_names.to_vec(),
                input_ids,
                past_len,
            });
            if inner.failing_stage.as_deref() == Some(stage_id) {
                return Err(candle_core::Error::Msg(format!("{stage_id} exploded")));
            }
            if output_names.iter().any(|n| n == LOGITS) {
                inner.script.pop_front()
            } else {
                None
            }
        };

        let (rows, n) = batch_shape(inputs)?;
        let device = inputs
            .values()
            .next()
            .map(|t| t.device().clone())
            .unwrap_or(Device::Cpu);

        let mut script = script;
        let mut outputs = NamedTensors::new();
        for name in output_names {
            let tensor = if name == LOGITS {
                self.logits(script.take(), rows, n)?
            } else if let Some(rest) = name.strip_prefix(PRESENT_PREFIX) {
                let past = inputs.get(&format!("{PAST_PREFIX}{rest}"));
                self.present(past, rows, n, &device)?
            } else {
                Tensor::zeros((rows, n, HIDDEN), DType::F32, &device)?
            };
            outputs.insert(name.clone(), tensor);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(rows: &[&[i64]]) -> Tensor {
        let n = rows[0].len();
        let flat: Vec<i64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), n), &Device::Cpu).unwrap()
    }

    #[test]
    fn default_logits_are_zero() {
        let backend = MockBackend::new(5);
        let mut inputs = NamedTensors::new();
        inputs.insert("input_ids".into(), ids(&[&[1, 2, 3]]));
        let out = backend
            .run_stage("decoder", &inputs, &["logits".to_string()])
            .unwrap();
        assert_eq!(out["logits"].dims(), &[1, 3, 5]);
        assert_eq!(backend.calls()[0].input_ids, Some(vec![vec![1, 2, 3]]));
    }

    #[test]
    fn scripted_rows_pick_tokens() {
        let backend = MockBackend::new(4);
        backend.push_argmax(&[3, 1]);
        let mut inputs = NamedTensors::new();
        inputs.insert("input_ids".into(), ids(&[&[0], &[0]]));
        let out = backend
            .run_stage("decoder", &inputs, &["logits".to_string()])
            .unwrap();
        let rows = out["logits"].squeeze(1).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[0][3], HOT);
        assert_eq!(rows[1][1], HOT);
    }

    #[test]
    fn present_extends_past() {
        let backend = MockBackend::new(4);
        let mut inputs = NamedTensors::new();
        inputs.insert("input_ids".into(), ids(&[&[5, 6]]));
        inputs.insert(
            "past_key_values.0.key".into(),
            Tensor::zeros((1, 2, 3, 4), DType::F32, &Device::Cpu).unwrap(),
        );
        let out = backend
            .run_stage("decoder", &inputs, &["present.0.key".to_string()])
            .unwrap();
        assert_eq!(out["present.0.key"].dims(), &[1, 2, 5, 4]);
        assert_eq!(backend.calls()[0].past_len, Some(3));
    }

    #[test]
    fn failing_stage_reports_error() {
        let backend = MockBackend::new(4);
        backend.fail_stage("embeds");
        let mut inputs = NamedTensors::new();
        inputs.insert("input_ids".into(), ids(&[&[1]]));
        assert!(backend.run_stage("embeds", &inputs, &[]).is_err());
        assert!(backend.run_stage("decoder", &inputs, &[]).is_ok());
    }
}
