//! commitgate - primary-side commit replication
//!
//! This crate decides when a transaction's commit may become externally
//! visible on the primary, given a replication durability policy:
//! - WAL record buffers are wrapped into batches and broadcast to every replica
//! - Replicas report which transactions they have applied
//! - Commit callbacks are released in commit order once every replica has
//!   applied the transaction (synchronous policy), or immediately (asynchronous)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  buffer + callbacks   ┌──────────────────────┐
//! │  WAL writer  │ ────────────────────► │  PrimaryCoordinator  │
//! └──────────────┘                       │  ┌────────────────┐  │   RecordsBatch
//!        ▲                               │  │  CommitLedger  │  │ ───────────────► replicas
//!        │  empty buffers                │  └────────────────┘  │
//! ┌──────┴───────┐                       │  ReplicationManager  │ ◄─────────────── TxnApplied
//! │  BufferPool  │ ◄──────────────────── └──────────────────────┘
//! └──────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod replication;

pub use error::{Error, Result};
