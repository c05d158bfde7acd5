// Gossip sizing and block hashing benchmarks.
//
// Covers gossip group sizing and sampling at several network sizes, block
// hashing/verification, and the majority tally threshold.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

use tessera_protocol::crypto::keys::Wallet;
use tessera_protocol::network::{gossip_fanout, majority_threshold, select_gossip_group};
use tessera_protocol::storage::{
    Block, ProcessedTransaction, StateChange, Transaction, TransactionPayload,
};

fn bench_gossip_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("gossip/fanout");
    for n in [10usize, 26, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| gossip_fanout(black_box(n)));
        });
    }
    group.finish();
}

fn bench_select_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("gossip/select_group");
    for n in [25usize, 100, 1_000] {
        let peers: Vec<String> = (0..n).map(|i| format!("peer-{i:04}")).collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &peers, |b, peers| {
            b.iter(|| select_gossip_group(peers));
        });
    }
    group.finish();
}

fn sample_block(producer: &Wallet) -> Block {
    let genesis = Block::genesis("2026-03-01T12:00:00.000000000Z_0", vec![]);
    let processed = ProcessedTransaction {
        transaction: Transaction {
            payload: TransactionPayload {
                sender: "alice".into(),
                processor: producer.verifying_key(),
                nonce: 7,
                contract: "currency".into(),
                function: "transfer".into(),
                kwargs: json!({"to": "bob", "amount": 250}),
            },
            signature: String::new(),
        },
        state: (0..16)
            .map(|i| StateChange::new(format!("currency.balances:acct{i}"), json!(i * 100)))
            .collect(),
        status: 0,
        stamps_used: 12,
    };
    let mut block = Block::new(
        &genesis,
        "2026-03-01T12:00:01.000000000Z_0",
        Some(processed),
        vec![StateChange::new("rewards:producer", json!(1))],
    );
    block.sign(producer);
    block
}

fn bench_block_hash(c: &mut Criterion) {
    let producer = Wallet::generate();
    let block = sample_block(&producer);

    c.bench_function("block/compute_hash", |b| {
        b.iter(|| block.compute_hash());
    });
    c.bench_function("block/verify", |b| {
        b.iter(|| block.verify());
    });
}

fn bench_majority(c: &mut Criterion) {
    c.bench_function("catchup/majority_threshold", |b| {
        b.iter(|| (1..=256usize).map(majority_threshold).sum::<usize>());
    });
}

criterion_group!(
    benches,
    bench_gossip_fanout,
    bench_select_group,
    bench_block_hash,
    bench_majority
);
criterion_main!(benches);
