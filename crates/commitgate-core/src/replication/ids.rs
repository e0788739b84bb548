//! Identifiers used by the replication protocol
//!
//! Message and batch ids come from process-wide monotonic counters. The
//! value `0` is reserved as the invalid sentinel and is never handed out,
//! including after the counter wraps around.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel value that no generator ever returns
pub const INVALID_ID: u64 = 0;

/// Identifier of a replication message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl MessageId {
    /// The invalid message id
    pub const INVALID: Self = Self(INVALID_ID);

    /// Whether this id is a real, issued id
    pub fn is_valid(&self) -> bool {
        self.0 != INVALID_ID
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a batch of log records shipped to replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl BatchId {
    /// The invalid batch id
    pub const INVALID: Self = Self(INVALID_ID);

    /// Whether this id is a real, issued id
    pub fn is_valid(&self) -> bool {
        self.0 != INVALID_ID
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical start timestamp of a transaction; doubles as its identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnTimestamp(pub u64);

impl fmt::Display for TxnTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TxnTimestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Network identity of a replica (its messenger routing name)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Create a replica id
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ReplicaId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Monotonic, wraparound-safe id counter
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator whose first id is 1
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(INVALID_ID + 1),
        }
    }

    /// Create a generator that will next hand out `start` (or the value after
    /// it, if `start` is the sentinel)
    pub const fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Issue the next id
    pub fn next_id(&self) -> u64 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != INVALID_ID {
                return id;
            }
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static MESSAGE_IDS: IdGenerator = IdGenerator::new();
static BATCH_IDS: IdGenerator = IdGenerator::new();

/// Next process-wide message id
pub fn next_message_id() -> MessageId {
    MessageId(MESSAGE_IDS.next_id())
}

/// Next process-wide batch id
pub fn next_batch_id() -> BatchId {
    BatchId(BATCH_IDS.next_id())
}
