// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, Criterion};
use mvstm::Stm;

/// Uncontended single-var transactions.
pub fn bnc_assign(c: &mut Criterion) {
    c.bench_function("bench_assign", |b| {
        let stm = Stm::default();
        let var = stm.create(0usize);

        b.iter(|| {
            stm.transactionally(|tx| var.alter(tx, |v| v + 1))
                .expect("Transaction failed");
        })
    });
}

/// Counter updates through the commute path.
pub fn bnc_commute(c: &mut Criterion) {
    c.bench_function("bench_commute", |b| {
        let stm = Stm::default();
        let var = stm.create(0usize);

        b.iter(|| {
            stm.transactionally(|tx| var.commute(tx, |v| v + 1))
                .expect("Transaction failed");
        })
    });
}

/// Contended counter: worker threads keep the var busy while the measured
/// thread transacts against it.
pub fn bnc_contended_read(c: &mut Criterion) {
    c.bench_function("bench_contended_read", |b| {
        let stm = Stm::default();
        let var = stm.create(0usize);

        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let stm = stm.clone();
                let var = var.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                        stm.transactionally(|tx| var.alter(tx, |v| v + 1))
                            .expect("Transaction failed");
                    }
                })
            })
            .collect();

        b.iter(|| {
            stm.transactionally(|tx| var.read(tx)).expect("Transaction failed");
        });

        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for worker in workers {
            worker.join().expect("Failed to join worker thread");
        }
    });
}

criterion_group!(benches, bnc_assign, bnc_commute, bnc_contended_read);
criterion_main!(benches);
