//! Commit Release Benchmark
//!
//! Measures the primary's commit path:
//! - Ledger acknowledgment cost as the replica set grows
//! - Full sync round trip (broadcast, applied acks, release) per batch
//! - Async broadcast cost

use commitgate_core::replication::{
    BatchOfCommitCallbacks, BufferPool, BuiltinCallback, CommitCallback, CommitLedger,
    PrimaryCoordinator, RecordsBuffer, ReplicaEndpoint, ReplicaId, ReplicationConfig,
    ReplicationPolicy, Transport, TxnTimestamp, next_message_id,
};
use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;

const BATCH_SIZE: u64 = 16;

/// Accepts every frame and keeps nothing
struct DiscardTransport;

impl Transport for DiscardTransport {
    fn send(
        &self,
        _destination: &ReplicaId,
        frame: Bytes,
        _remote_callback: BuiltinCallback,
    ) -> commitgate_core::Result<()> {
        black_box(frame);
        Ok(())
    }
}

fn replica_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("replica{}", i)).collect()
}

fn create_coordinator(replicas: usize) -> (PrimaryCoordinator, Vec<ReplicaId>) {
    let names = replica_names(replicas);
    let mut config = ReplicationConfig::primary("primary", 9022);
    for (i, name) in names.iter().enumerate() {
        config =
            config.with_replica(ReplicaEndpoint::new(name.as_str(), "localhost", 9100 + i as u16));
    }
    let coordinator =
        PrimaryCoordinator::new(config, Arc::new(DiscardTransport), BufferPool::new(64))
            .expect("Failed to create coordinator");
    let ids = names.into_iter().map(ReplicaId::new).collect();
    (coordinator, ids)
}

/// Benchmark ledger acknowledgments for one batch
fn benchmark_ledger_acknowledge(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_acknowledge");

    for replicas in [1usize, 3, 5] {
        let ids: Vec<ReplicaId> = replica_names(replicas)
            .into_iter()
            .map(ReplicaId::new)
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(replicas), &ids, |b, ids| {
            b.iter(|| {
                let ledger = CommitLedger::new();
                let callbacks = (1..=BATCH_SIZE)
                    .map(|txn| CommitCallback::new(txn, || {}))
                    .collect();
                ledger.enqueue(BatchOfCommitCallbacks::new(callbacks, true));

                let mut released = 0;
                for txn in 1..=BATCH_SIZE {
                    for id in ids {
                        released += ledger.acknowledge(TxnTimestamp(txn), id.clone(), ids.len());
                    }
                }
                black_box(released)
            });
        });
    }

    group.finish();
}

/// Benchmark a full sync commit: broadcast, acks from every replica, release
fn benchmark_sync_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_round_trip");
    let payload = vec![0u8; 4096];

    for replicas in [1usize, 3] {
        let (coordinator, ids) = create_coordinator(replicas);
        let mut next_txn = 0u64;

        group.bench_function(BenchmarkId::from_parameter(replicas), |b| {
            b.iter(|| {
                let first = next_txn + 1;
                next_txn += BATCH_SIZE;
                let callbacks = (first..=next_txn)
                    .map(|txn| CommitCallback::new(txn, || {}))
                    .collect();
                coordinator.replicate_batch_of_records(
                    Some(RecordsBuffer::filled(&payload, 1)),
                    callbacks,
                    ReplicationPolicy::Sync,
                );
                for txn in first..=next_txn {
                    for id in &ids {
                        let _ = coordinator.handle_txn_applied(
                            id,
                            next_message_id(),
                            TxnTimestamp(txn),
                        );
                    }
                }
                black_box(coordinator.pending_callbacks())
            });
        });
    }

    group.finish();
}

/// Benchmark async broadcast of a flushed buffer
fn benchmark_async_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("async_broadcast");
    group.sample_size(50);

    for size in [1024usize, 64 * 1024] {
        let (coordinator, _) = create_coordinator(3);
        let payload = vec![0u8; size];

        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                black_box(coordinator.replicate_batch_of_records(
                    Some(RecordsBuffer::filled(payload, 1)),
                    Vec::new(),
                    ReplicationPolicy::Async,
                ))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_ledger_acknowledge,
    benchmark_sync_round_trip,
    benchmark_async_broadcast
);
criterion_main!(benches);
