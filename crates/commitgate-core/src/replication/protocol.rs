//! Replication wire protocol
//!
//! All messages are serialized with bincode and validated with CRC32.
//!
//! Format: [message_type:1][length:4][payload:N][crc32:4]

use crate::replication::ids::{BatchId, MessageId, TxnTimestamp};
use crate::{Error, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

/// Size of the type + length header
const HEADER_LEN: usize = 5;
/// Size of the trailing checksum
const CRC_LEN: usize = 4;

/// Replication message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMessageType {
    /// Protocol-level acknowledgment of a received message
    Ack = 0x01,
    /// Batch of serialized log records from the primary
    RecordsBatch = 0x20,
    /// A replica has applied a transaction
    TxnApplied = 0x21,
}

impl TryFrom<u8> for ReplicationMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Ack),
            0x20 => Ok(Self::RecordsBatch),
            0x21 => Ok(Self::TxnApplied),
            _ => Err(Error::protocol(format!("Unknown message type: {:#04x}", value))),
        }
    }
}

/// Header carried by every replication message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationMessageMetadata {
    /// Id of this message
    pub message_id: MessageId,
}

impl ReplicationMessageMetadata {
    /// Create metadata for a message
    pub fn new(message_id: MessageId) -> Self {
        Self { message_id }
    }
}

/// Replication messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Protocol acknowledgment for `acked_message_id`
    Ack {
        /// Message header
        metadata: ReplicationMessageMetadata,
        /// Message being acknowledged
        acked_message_id: MessageId,
    },

    /// Serialized log records; `batch_id` plus the length-prefixed payload
    /// mark the batch boundary for the receiver
    RecordsBatch {
        /// Message header
        metadata: ReplicationMessageMetadata,
        /// Batch id
        batch_id: BatchId,
        /// Serialized log records
        payload: Vec<u8>,
    },

    /// Replica finished applying the transaction that started at `applied_txn_id`
    TxnApplied {
        /// Message header
        metadata: ReplicationMessageMetadata,
        /// Start timestamp of the applied transaction
        applied_txn_id: TxnTimestamp,
    },
}

impl ReplicationMessage {
    /// Get message type
    pub fn message_type(&self) -> ReplicationMessageType {
        match self {
            Self::Ack { .. } => ReplicationMessageType::Ack,
            Self::RecordsBatch { .. } => ReplicationMessageType::RecordsBatch,
            Self::TxnApplied { .. } => ReplicationMessageType::TxnApplied,
        }
    }

    /// Get message metadata
    pub fn metadata(&self) -> &ReplicationMessageMetadata {
        match self {
            Self::Ack { metadata, .. }
            | Self::RecordsBatch { metadata, .. }
            | Self::TxnApplied { metadata, .. } => metadata,
        }
    }

    /// Get message id
    pub fn message_id(&self) -> MessageId {
        self.metadata().message_id
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::protocol(format!("Serialization failed: {}", e)))?;

        let length = u32::try_from(payload.len())
            .map_err(|_| Error::protocol(format!("Message too large: {} bytes", payload.len())))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of type + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Decode message from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN + CRC_LEN {
            return Err(Error::protocol("Message too short"));
        }

        // Verify CRC
        let crc_offset = buf.len() - CRC_LEN;
        let stored_crc = read_u32(&buf[crc_offset..]);

        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(Error::protocol(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        let msg_type = ReplicationMessageType::try_from(buf[0])?;

        let length = read_u32(&buf[1..HEADER_LEN]) as usize;
        if buf.len() != HEADER_LEN + length + CRC_LEN {
            return Err(Error::protocol(format!(
                "Length mismatch: header says {} bytes, frame carries {}",
                length,
                buf.len() - HEADER_LEN - CRC_LEN
            )));
        }

        let payload = &buf[HEADER_LEN..HEADER_LEN + length];
        let message: Self = bincode::deserialize(payload)
            .map_err(|e| Error::protocol(format!("Deserialization failed: {}", e)))?;

        if message.message_type() != msg_type {
            return Err(Error::protocol(format!(
                "Type tag {:?} does not match payload {:?}",
                msg_type,
                message.message_type()
            )));
        }

        Ok(message)
    }

    /// Read the message type of an encoded frame without decoding the payload
    pub fn peek_type(buf: &[u8]) -> Result<ReplicationMessageType> {
        match buf.first() {
            Some(tag) => ReplicationMessageType::try_from(*tag),
            None => Err(Error::protocol("Empty frame")),
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}
