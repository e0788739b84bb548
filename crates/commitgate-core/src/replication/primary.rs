//! Primary replication coordinator
//!
//! The primary:
//! - Broadcasts every flushed WAL buffer to all replicas as a records batch
//! - Releases commit callbacks immediately under the async policy
//! - Parks commit callbacks under the sync policy until every replica reports
//!   the transaction applied, then releases them in commit order
//! - Returns fully consumed buffers to the shared pool

use crate::replication::buffer::{BufferPool, RecordsBuffer};
use crate::replication::config::{ReplicaEndpoint, ReplicationConfig, ReplicationPolicy};
use crate::replication::ids::{MessageId, ReplicaId, TxnTimestamp, next_batch_id, next_message_id};
use crate::replication::ledger::{BatchOfCommitCallbacks, CommitCallback, CommitLedger};
use crate::replication::manager::ReplicationManager;
use crate::replication::protocol::{ReplicationMessage, ReplicationMessageMetadata};
use crate::replication::transport::{BuiltinCallback, InboundMessage, Transport, noop_reply};
use crate::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

/// Primary coordinator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Records batches broadcast
    pub batches_replicated: u64,
    /// Payload bytes handed to the transport, summed over replicas
    pub bytes_replicated: u64,
    /// Sends the transport rejected
    pub send_failures: u64,
    /// Callbacks parked in the ledger
    pub callbacks_parked: u64,
    /// Parked callbacks released after replica acknowledgment
    pub callbacks_released: u64,
    /// Callbacks fired without waiting (async policy or read-only)
    pub callbacks_bypassed: u64,
    /// Applied acknowledgments received
    pub acks_received: u64,
    /// Buffers returned to the pool
    pub buffers_reclaimed: u64,
}

/// Primary-side replication coordinator
pub struct PrimaryCoordinator {
    /// Shared send/ack/dispatch machinery and the replica set
    manager: ReplicationManager,
    /// Parked commit callbacks
    ledger: CommitLedger,
    /// Statistics
    stats: Mutex<CoordinatorStats>,
}

impl PrimaryCoordinator {
    /// Create a coordinator
    pub fn new(
        config: ReplicationConfig,
        transport: Arc<dyn Transport>,
        buffer_pool: BufferPool,
    ) -> Result<Self> {
        Ok(Self {
            manager: ReplicationManager::new(config, transport, buffer_pool)?,
            ledger: CommitLedger::new(),
            stats: Mutex::new(CoordinatorStats::default()),
        })
    }

    /// Create a coordinator with its own buffer pool, sized from
    /// `buffer_pool_capacity`
    pub fn from_config(config: ReplicationConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let buffer_pool = BufferPool::new(config.buffer_pool_capacity);
        Self::new(config, transport, buffer_pool)
    }

    /// Underlying replication manager.
    ///
    /// Membership changes go through the coordinator so the ledger sees them.
    pub fn manager(&self) -> &ReplicationManager {
        &self.manager
    }

    /// Policy configured for commits that do not pick one
    pub fn default_policy(&self) -> ReplicationPolicy {
        self.manager.config().policy
    }

    /// Replicate a flushed buffer and route its commit callbacks.
    ///
    /// `records` is `None` when the flushed transactions were read-only and
    /// produced no log records; their callbacks are still owed a release.
    ///
    /// Returns the buffer when some other consumer still needs it; `None`
    /// when it went back to the pool or no buffer was given.
    ///
    /// # Panics
    ///
    /// Panics if `policy` is [`ReplicationPolicy::Disable`].
    pub fn replicate_batch_of_records(
        &self,
        records: Option<RecordsBuffer>,
        callbacks: Vec<CommitCallback>,
        policy: ReplicationPolicy,
    ) -> Option<RecordsBuffer> {
        assert!(
            policy != ReplicationPolicy::Disable,
            "replicate_batch_of_records called with replication disabled"
        );

        let has_records = records.is_some();
        let txns: Vec<TxnTimestamp> =
            callbacks.iter().map(CommitCallback::txn_start_time).collect();

        if policy == ReplicationPolicy::Async || !has_records {
            let count = callbacks.len() as u64;
            for callback in callbacks {
                callback.fire();
            }
            self.stats.lock().callbacks_bypassed += count;
        } else if !callbacks.is_empty() {
            let count = callbacks.len() as u64;
            let released = {
                let mut ledger = self.ledger.lock();
                ledger.enqueue(BatchOfCommitCallbacks::new(callbacks, has_records));
                // Nobody to wait for
                if self.manager.replica_count() == 0 {
                    ledger.drain_ready(0)
                } else {
                    0
                }
            };

            let mut stats = self.stats.lock();
            stats.callbacks_parked += count;
            stats.callbacks_released += released as u64;
        }

        let mut buffer = records?;
        self.broadcast(&buffer, &txns);

        if buffer.mark_serialized() {
            match self.manager.buffer_pool().enqueue(buffer) {
                Ok(()) => {
                    self.stats.lock().buffers_reclaimed += 1;
                    None
                }
                Err(buffer) => Some(buffer),
            }
        } else {
            Some(buffer)
        }
    }

    /// Send one records batch to every replica, fire-and-forget
    fn broadcast(&self, buffer: &RecordsBuffer, txns: &[TxnTimestamp]) {
        let message_id = next_message_id();
        let batch_id = next_batch_id();
        let message = ReplicationMessage::RecordsBatch {
            metadata: ReplicationMessageMetadata::new(message_id),
            batch_id,
            payload: buffer.as_bytes().to_vec(),
        };

        let frame = match message.encode() {
            Ok(frame) => Bytes::from(frame),
            Err(e) => {
                tracing::error!("Failed to encode batch {}: {}", batch_id, e);
                self.stats.lock().send_failures += 1;
                return;
            }
        };

        let replicas = self.manager.replica_ids();
        tracing::debug!(
            "BATCH {} ({} bytes) TXNS {:?} to {} replica(s)",
            batch_id,
            buffer.len(),
            txns,
            replicas.len()
        );

        let mut sent = 0u64;
        let mut failed = 0u64;
        for replica in &replicas {
            let result = self.manager.send_frame(
                replica,
                message_id,
                frame.clone(),
                noop_reply(),
                BuiltinCallback::Noop,
                true,
            );
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!("Failed to send batch {} to {}: {}", batch_id, replica, e);
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.batches_replicated += 1;
        stats.bytes_replicated += sent * buffer.len() as u64;
        stats.send_failures += failed;
    }

    /// Route a decoded message: applied acknowledgments are handled here,
    /// everything else goes to the base manager
    pub fn dispatch(&self, sender: &ReplicaId, message: ReplicationMessage) -> Result<()> {
        match message {
            ReplicationMessage::TxnApplied {
                metadata,
                applied_txn_id,
            } => self.handle_txn_applied(sender, metadata.message_id, applied_txn_id),
            other => self.manager.dispatch(sender, other),
        }
    }

    /// Decode and dispatch a raw inbound frame
    pub fn handle_inbound(&self, inbound: &InboundMessage) -> Result<()> {
        let message = self.manager.decode_inbound(inbound)?;
        self.dispatch(&inbound.sender, message)
    }

    /// A replica applied `txn`
    pub fn handle_txn_applied(
        &self,
        sender: &ReplicaId,
        message_id: MessageId,
        txn: TxnTimestamp,
    ) -> Result<()> {
        tracing::trace!("[RECV] TxnApplied from {}: ID {} TXN {}", sender, message_id, txn);

        // Protocol-level ack, independent of commit release
        let applied = ReplicationMessage::TxnApplied {
            metadata: ReplicationMessageMetadata::new(message_id),
            applied_txn_id: txn,
        };
        if let Err(e) = self.manager.send_ack_for_message(sender, &applied) {
            tracing::warn!("Failed to ack message {} from {}: {}", message_id, sender, e);
        }

        self.stats.lock().acks_received += 1;

        // Membership is read under the ledger lock; every membership change
        // takes the ledger lock first
        let released = {
            let mut ledger = self.ledger.lock();
            if !self.manager.contains(sender) {
                tracing::warn!("Ignoring TxnApplied for {} from unknown replica {}", txn, sender);
                return Ok(());
            }

            let replica_count = self.manager.replica_count();
            if ledger.record_applied(txn, sender.clone(), replica_count) {
                ledger.drain_ready(replica_count)
            } else {
                0
            }
        };

        if released > 0 {
            self.stats.lock().callbacks_released += released as u64;
        }
        Ok(())
    }

    /// Add a replica to the replica set
    pub fn add_replica(&self, endpoint: ReplicaEndpoint) -> bool {
        let _ledger = self.ledger.lock();
        self.manager.add_replica(endpoint)
    }

    /// Remove a replica; callbacks that were only waiting on it are released
    pub fn remove_replica(&self, id: &ReplicaId) -> bool {
        let released = {
            let mut ledger = self.ledger.lock();
            if !self.manager.remove_replica(id) {
                return false;
            }
            ledger.forget_replica(id);
            ledger.drain_ready(self.manager.replica_count())
        };

        if released > 0 {
            tracing::info!("Released {} callback(s) after removing replica {}", released, id);
            self.stats.lock().callbacks_released += released as u64;
        }
        true
    }

    /// Callbacks still waiting for replicas
    pub fn pending_callbacks(&self) -> usize {
        self.ledger.pending_callbacks()
    }

    /// Get statistics
    pub fn stats(&self) -> CoordinatorStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::transport::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn create_test_coordinator(
        replicas: &[&str],
    ) -> (PrimaryCoordinator, Arc<MemoryTransport>, BufferPool) {
        let mut config = ReplicationConfig::primary("primary", 9022);
        for (i, name) in replicas.iter().enumerate() {
            config = config.with_replica(ReplicaEndpoint::new(*name, "localhost", 9023 + i as u16));
        }
        let transport = Arc::new(MemoryTransport::new());
        let pool = BufferPool::new(8);
        let coordinator = PrimaryCoordinator::new(config, transport.clone(), pool.clone()).unwrap();
        (coordinator, transport, pool)
    }

    fn counting_callback(txn: u64, counter: &Arc<AtomicUsize>) -> CommitCallback {
        let counter = counter.clone();
        CommitCallback::new(txn, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn applied_ack(coordinator: &PrimaryCoordinator, replica: &str, txn: u64) {
        coordinator
            .handle_txn_applied(&ReplicaId::new(replica), next_message_id(), TxnTimestamp(txn))
            .unwrap();
    }

    #[test]
    fn test_async_fires_immediately_and_broadcasts() {
        let (coordinator, transport, pool) = create_test_coordinator(&["r1", "r2", "r3"]);
        let fired = Arc::new(AtomicUsize::new(0));

        let leftover = coordinator.replicate_batch_of_records(
            Some(RecordsBuffer::filled(b"log records", 1)),
            vec![counting_callback(1, &fired), counting_callback(2, &fired)],
            ReplicationPolicy::Async,
        );

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.pending_callbacks(), 0);
        assert!(leftover.is_none());
        assert_eq!(pool.len(), 1);

        for name in ["r1", "r2", "r3"] {
            let frames = transport.sent_to(&ReplicaId::new(name));
            assert_eq!(frames.len(), 1);
            match frames[0].decode().unwrap() {
                ReplicationMessage::RecordsBatch { payload, batch_id, .. } => {
                    assert_eq!(payload, b"log records".to_vec());
                    assert!(batch_id.is_valid());
                }
                other => panic!("Expected RecordsBatch, got {:?}", other),
            }
        }

        let stats = coordinator.stats();
        assert_eq!(stats.batches_replicated, 1);
        assert_eq!(stats.callbacks_bypassed, 2);
        assert_eq!(stats.buffers_reclaimed, 1);
        assert_eq!(stats.bytes_replicated, 3 * 11);
    }

    #[test]
    fn test_sync_waits_for_every_replica() {
        let (coordinator, _, _) = create_test_coordinator(&["r1", "r2", "r3"]);
        let fired = Arc::new(AtomicUsize::new(0));

        coordinator.replicate_batch_of_records(
            Some(RecordsBuffer::filled(b"x", 1)),
            vec![counting_callback(1, &fired)],
            ReplicationPolicy::Sync,
        );
        assert_eq!(coordinator.pending_callbacks(), 1);

        applied_ack(&coordinator, "r1", 1);
        applied_ack(&coordinator, "r2", 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        applied_ack(&coordinator, "r3", 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.pending_callbacks(), 0);

        let stats = coordinator.stats();
        assert_eq!(stats.callbacks_parked, 1);
        assert_eq!(stats.callbacks_released, 1);
        assert_eq!(stats.acks_received, 3);
    }

    #[test]
    fn test_read_only_commits_skip_replication() {
        let (coordinator, transport, _) = create_test_coordinator(&["r1"]);
        let fired = Arc::new(AtomicUsize::new(0));

        let leftover = coordinator.replicate_batch_of_records(
            None,
            vec![counting_callback(1, &fired)],
            ReplicationPolicy::Sync,
        );

        assert!(leftover.is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(transport.sent().is_empty());
        assert_eq!(coordinator.stats().batches_replicated, 0);
    }

    #[test]
    #[should_panic(expected = "replication disabled")]
    fn test_disable_policy_panics() {
        let (coordinator, _, _) = create_test_coordinator(&["r1"]);
        coordinator.replicate_batch_of_records(None, Vec::new(), ReplicationPolicy::Disable);
    }

    #[test]
    fn test_buffer_handed_back_while_other_consumers_remain() {
        let (coordinator, _, pool) = create_test_coordinator(&["r1"]);

        // Disk flusher and replication both consume the buffer
        let leftover = coordinator.replicate_batch_of_records(
            Some(RecordsBuffer::filled(b"abc", 2)),
            Vec::new(),
            ReplicationPolicy::Async,
        );

        let mut buffer = leftover.expect("buffer still owned by the disk flusher");
        assert_eq!(buffer.pending_consumers(), 1);
        assert!(pool.is_empty());

        assert!(buffer.mark_serialized());
        pool.enqueue(buffer).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_send_failure_is_not_fatal() {
        let (coordinator, transport, _) = create_test_coordinator(&["r1", "r2"]);
        transport.set_unreachable(&ReplicaId::new("r2"), true);
        let fired = Arc::new(AtomicUsize::new(0));

        coordinator.replicate_batch_of_records(
            Some(RecordsBuffer::filled(b"abc", 1)),
            vec![counting_callback(1, &fired)],
            ReplicationPolicy::Sync,
        );

        assert_eq!(transport.sent_to(&ReplicaId::new("r1")).len(), 1);
        assert_eq!(coordinator.stats().send_failures, 1);

        // r2 never got the batch, so the callback stays parked
        applied_ack(&coordinator, "r1", 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // until r2 leaves the replica set
        assert!(coordinator.remove_replica(&ReplicaId::new("r2")));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_applied_ack_is_acknowledged() {
        let (coordinator, transport, _) = create_test_coordinator(&["r1"]);
        let message = ReplicationMessage::TxnApplied {
            metadata: ReplicationMessageMetadata::new(MessageId(77)),
            applied_txn_id: TxnTimestamp(5),
        };
        let inbound = InboundMessage::from_message("r1", &message).unwrap();
        coordinator.handle_inbound(&inbound).unwrap();

        let frames = transport.sent_to(&ReplicaId::new("r1"));
        assert_eq!(frames.len(), 1);
        match frames[0].decode().unwrap() {
            ReplicationMessage::Ack {
                acked_message_id, ..
            } => assert_eq!(acked_message_id, MessageId(77)),
            other => panic!("Expected Ack, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_sender_is_ignored() {
        let (coordinator, transport, _) = create_test_coordinator(&["r1"]);
        let fired = Arc::new(AtomicUsize::new(0));
        coordinator.replicate_batch_of_records(
            Some(RecordsBuffer::filled(b"abc", 1)),
            vec![counting_callback(1, &fired)],
            ReplicationPolicy::Sync,
        );
        transport.clear();

        applied_ack(&coordinator, "intruder", 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // Still acknowledged at the protocol level
        assert_eq!(transport.sent_to(&ReplicaId::new("intruder")).len(), 1);

        applied_ack(&coordinator, "r1", 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sync_without_replicas_releases_immediately() {
        let (coordinator, transport, _) = create_test_coordinator(&[]);
        let fired = Arc::new(AtomicUsize::new(0));
        coordinator.replicate_batch_of_records(
            Some(RecordsBuffer::filled(b"abc", 1)),
            vec![counting_callback(1, &fired)],
            ReplicationPolicy::Sync,
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_from_config_sizes_pool() {
        let config = ReplicationConfig::primary("primary", 9022)
            .with_policy(ReplicationPolicy::Sync)
            .with_buffer_pool_capacity(2)
            .with_replica(ReplicaEndpoint::new("r1", "localhost", 9023));
        let coordinator =
            PrimaryCoordinator::from_config(config, Arc::new(MemoryTransport::new())).unwrap();
        assert_eq!(coordinator.default_policy(), ReplicationPolicy::Sync);

        for _ in 0..3 {
            let leftover = coordinator.replicate_batch_of_records(
                Some(RecordsBuffer::filled(b"abc", 1)),
                Vec::new(),
                coordinator.default_policy(),
            );
            assert!(leftover.is_none());
        }
        // Third buffer was dropped: the pool holds at most two
        assert_eq!(coordinator.manager().buffer_pool().len(), 2);
    }

    #[test]
    fn test_removal_between_acks_releases_on_next_ack() {
        let (coordinator, _, _) = create_test_coordinator(&["a", "b", "c"]);
        let fired = Arc::new(AtomicUsize::new(0));
        coordinator.replicate_batch_of_records(
            Some(RecordsBuffer::filled(b"abc", 1)),
            vec![counting_callback(1, &fired)],
            ReplicationPolicy::Sync,
        );

        applied_ack(&coordinator, "a", 1);
        assert!(coordinator.remove_replica(&ReplicaId::new("c")));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        applied_ack(&coordinator, "b", 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.pending_callbacks(), 0);
    }

    #[test]
    fn test_ack_from_removed_replica_does_not_count() {
        let (coordinator, _, _) = create_test_coordinator(&["a", "b", "c"]);
        let fired = Arc::new(AtomicUsize::new(0));
        coordinator.replicate_batch_of_records(
            Some(RecordsBuffer::filled(b"abc", 1)),
            vec![counting_callback(1, &fired)],
            ReplicationPolicy::Sync,
        );

        applied_ack(&coordinator, "a", 1);
        assert!(coordinator.remove_replica(&ReplicaId::new("c")));
        applied_ack(&coordinator, "c", 1);
        // b has not applied txn 1
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.pending_callbacks(), 1);
    }

    #[test]
    fn test_records_batch_reaching_primary_is_protocol_error() {
        let (coordinator, _, _) = create_test_coordinator(&["r1"]);
        let message = ReplicationMessage::RecordsBatch {
            metadata: ReplicationMessageMetadata::new(next_message_id()),
            batch_id: next_batch_id(),
            payload: Vec::new(),
        };
        let result = coordinator.dispatch(&ReplicaId::new("r1"), message);
        assert!(matches!(result, Err(crate::Error::Protocol(_))));
    }
}
