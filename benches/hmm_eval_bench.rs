//! Viterbi evaluation throughput for the HMM topologies the decoder uses.

use std::sync::Arc;

use amira_multipass_decoder::hmm::{Hmm, HmmContext, LogMath, TransitionMatrix};
use amira_multipass_decoder::types::{SenoneSeqId, TmatId};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Left-to-right matrix with self-loop, next and skip transitions.
fn bakis(n: usize) -> Vec<Vec<f64>> {
    (0..n)
        .map(|from| {
            let mut row = vec![0.0; n + 1];
            row[from] = 0.5;
            if from + 2 <= n {
                row[from + 1] = 0.4;
                row[from + 2] = 0.1;
            } else {
                row[from + 1] = 0.5;
            }
            row
        })
        .collect()
}

/// Context with one matrix and `n_seq` senone sequences over distinct senones.
fn context(n: usize, n_seq: usize) -> HmmContext {
    let logmath = LogMath::default();
    let tmat = TransitionMatrix::from_probs(&bakis(n), &logmath).unwrap();
    let sseq: Vec<Box<[u32]>> = (0..n_seq)
        .map(|s| (0..n).map(|k| (s * n + k) as u32).collect())
        .collect();
    let mut ctx = HmmContext::new(n, Arc::from(vec![tmat]), Arc::from(sseq), n * n_seq).unwrap();
    for (i, score) in ctx.scores_mut().iter_mut().enumerate() {
        *score = -((i % 97) as i32) * 10;
    }
    ctx
}

fn bench_single_hmm(c: &mut Criterion) {
    let mut group = c.benchmark_group("vit_eval");
    for n in [3usize, 5, 7] {
        let ctx = context(n, 1);
        group.bench_with_input(BenchmarkId::new("simple", n), &n, |b, &n| {
            let mut hmm = Hmm::new(n, SenoneSeqId(0), TmatId(0));
            hmm.enter(0, None, 0);
            b.iter(|| {
                let best = hmm.vit_eval(black_box(&ctx));
                // Keep scores from drifting out of range between iterations.
                hmm.normalize(best);
                black_box(best)
            });
        });
        group.bench_with_input(BenchmarkId::new("multiplexed", n), &n, |b, &n| {
            let mut hmm = Hmm::new_multiplexed(n, SenoneSeqId(0), TmatId(0));
            hmm.enter(0, None, 0);
            b.iter(|| {
                let best = hmm.vit_eval(black_box(&ctx));
                hmm.normalize(best);
                black_box(best)
            });
        });
    }
    group.finish();
}

fn bench_active_frame(c: &mut Criterion) {
    let ctx = context(3, 512);
    let mut hmms: Vec<Hmm> = (0..2048)
        .map(|i| {
            let mut hmm = Hmm::new(3, SenoneSeqId((i % 512) as u32), TmatId(0));
            hmm.enter(-(i as i32), None, 0);
            hmm
        })
        .collect();

    c.bench_function("frame_2048_hmms", |b| {
        b.iter(|| {
            let mut best = i32::MIN;
            for hmm in hmms.iter_mut() {
                best = best.max(hmm.vit_eval(&ctx));
            }
            for hmm in hmms.iter_mut() {
                hmm.normalize(best);
            }
            black_box(best)
        });
    });
}

criterion_group!(benches, bench_single_hmm, bench_active_frame);
criterion_main!(benches);
