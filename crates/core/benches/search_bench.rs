//! Criterion benchmarks for token search.
//!
//! Covers the scalar helpers (`log_softmax`, `argmax`) and one full
//! `set_logits` + selection step for greedy, sampled and beam search.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

use candle_core::{Device, Tensor};
use stagegen_core::search::{argmax, log_softmax, BeamSearch, GreedySearch, Search, SearchParams};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_logits(vocab_size: usize) -> Vec<f32> {
    (0..vocab_size)
        .map(|i| (i as f32 * 0.017).sin() * 5.0)
        .collect()
}

/// Build a 2-D logits tensor [rows, vocab_size] on CPU.
fn make_logits_tensor(rows: usize, vocab_size: usize) -> Tensor {
    let data: Vec<f32> = (0..rows * vocab_size)
        .map(|i| (i as f32 * 0.013).sin() * 5.0)
        .collect();
    Tensor::from_vec(data, (rows, vocab_size), &Device::Cpu)
        .expect("failed to create logits tensor")
}

fn params(batch_size: usize, num_beams: usize, vocab_size: usize) -> SearchParams {
    SearchParams {
        batch_size,
        num_beams,
        num_return_sequences: 1,
        max_length: 64,
        vocab_size,
        pad_token_id: 0,
        eos_token_ids: vec![2],
        length_penalty: 1.0,
        early_stopping: true,
        random_seed: Some(0),
        min_length: 0,
        repetition_penalty: 1.0,
    }
}

fn prompt(rows: usize) -> Vec<u32> {
    (0..rows as u32 * 8).map(|i| 3 + i % 50).collect()
}

// ---------------------------------------------------------------------------
// Scalar helpers
// ---------------------------------------------------------------------------

fn bench_log_softmax(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_softmax");
    for &vocab_size in &[32_000, 128_000] {
        let logits = make_logits(vocab_size);
        group.bench_with_input(BenchmarkId::new("vocab", vocab_size), &vocab_size, |b, _| {
            b.iter(|| log_softmax(black_box(&logits)));
        });
    }
    group.finish();
}

fn bench_argmax(c: &mut Criterion) {
    let mut group = c.benchmark_group("argmax");
    for &vocab_size in &[32_000, 128_000] {
        let logits = make_logits(vocab_size);
        group.bench_with_input(BenchmarkId::new("vocab", vocab_size), &vocab_size, |b, _| {
            b.iter(|| argmax(black_box(&logits)));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Search steps
// ---------------------------------------------------------------------------

fn bench_greedy_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("greedy_step");
    let vocab_size = 32_000;
    for &batch in &[1, 8] {
        let logits = make_logits_tensor(batch, vocab_size);
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &batch| {
            b.iter_batched(
                || GreedySearch::new(params(batch, 1, vocab_size), &prompt(batch)).expect("search"),
                |mut search| {
                    search.set_logits(&logits).expect("set_logits");
                    search.select_top().expect("select_top");
                    search
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_sampled_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampled_step");
    let vocab_size = 32_000;
    let logits = make_logits_tensor(1, vocab_size);
    for &top_k in &[1, 50, 500] {
        group.bench_with_input(BenchmarkId::new("top_k", top_k), &top_k, |b, &top_k| {
            b.iter_batched(
                || GreedySearch::new(params(1, 1, vocab_size), &prompt(1)).expect("search"),
                |mut search| {
                    search.set_logits(&logits).expect("set_logits");
                    search
                        .sample_top_k_top_p(top_k, 0.9, 0.8)
                        .expect("sample_top_k_top_p");
                    search
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_beam_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("beam_step");
    let vocab_size = 32_000;
    for &num_beams in &[2, 4, 8] {
        let logits = make_logits_tensor(num_beams, vocab_size);
        group.bench_with_input(
            BenchmarkId::new("beams", num_beams),
            &num_beams,
            |b, &num_beams| {
                b.iter_batched(
                    || {
                        BeamSearch::new(params(1, num_beams, vocab_size), &prompt(1))
                            .expect("search")
                    },
                    |mut search| {
                        search.set_logits(&logits).expect("set_logits");
                        search.select_top().expect("select_top");
                        search
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

criterion_group!(helpers, bench_log_softmax, bench_argmax);
criterion_group!(steps, bench_greedy_step, bench_sampled_step, bench_beam_step);
criterion_main!(helpers, steps);
