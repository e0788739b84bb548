//! Primary-side replication
//!
//! This module implements commit replication from a primary with:
//! - Fire-and-forget broadcast of WAL record batches to every replica
//! - Optional sync replication: commits wait for every replica to apply
//! - Head-of-line release of commit callbacks in commit order
//! - Buffer recycling through a shared pool
//!
//! # Message flow
//!
//! ```text
//! ┌─────────────────┐    RecordsBatch     ┌─────────────────┐
//! │     Primary     │ ──────────────────► │    Replica 1    │
//! │                 │ ◄────────────────── │                 │
//! │  CommitLedger   │     TxnApplied      └─────────────────┘
//! │                 │        Ack
//! │                 │ ──────────────────► (to the TxnApplied sender)
//! └─────────────────┘
//! ```
//!
//! # Replication Policies
//!
//! - **Async**: callbacks fire before the batch is sent (default)
//! - **Sync**: callbacks fire once all replicas report the txn applied
//! - **Disable**: the coordinator is never called
//!
//! # Wire Protocol
//!
//! All messages use bincode serialization with CRC32 validation:
//!
//! ```text
//! [message_type:1][length:4][payload:N][crc32:4]
//! ```

pub mod buffer;
pub mod config;
pub mod ids;
pub mod ledger;
pub mod manager;
pub mod primary;
pub mod protocol;
pub mod transport;

pub use buffer::{BufferPool, RecordsBuffer};
pub use config::{ReplicaEndpoint, ReplicationConfig, ReplicationPolicy, load_replica_hosts};
pub use ids::{BatchId, MessageId, ReplicaId, TxnTimestamp, next_batch_id, next_message_id};
pub use ledger::{BatchOfCommitCallbacks, CommitCallback, CommitLedger, LedgerState};
pub use manager::{ConnectionState, ReplicaInfo, ReplicationManager};
pub use primary::{CoordinatorStats, PrimaryCoordinator};
pub use protocol::{ReplicationMessage, ReplicationMessageMetadata, ReplicationMessageType};
pub use transport::{
    BuiltinCallback, InboundMessage, MemoryTransport, ReplyCallback, SentFrame, Transport,
};

/// Default replication port
pub const DEFAULT_REPLICATION_PORT: u16 = 15445;

/// Default number of empty buffers kept for reuse
pub const DEFAULT_BUFFER_POOL_CAPACITY: usize = 100;
