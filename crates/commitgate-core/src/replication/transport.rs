//! Messaging transport contract
//!
//! The coordinator never talks to sockets. It hands encoded frames to a
//! [`Transport`], and the transport feeds replies back through
//! [`InboundMessage`]s delivered to the coordinator's dispatch path.

use crate::replication::ids::ReplicaId;
use crate::replication::protocol::ReplicationMessage;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Callback the destination runs when the frame arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinCallback {
    /// Do nothing
    Noop,
    /// Send the payload straight back
    Echo,
}

/// Invoked on the sending side when the destination acknowledges a message
pub type ReplyCallback = Box<dyn FnOnce(&ReplicaId, &ReplicationMessage) + Send>;

/// A reply callback that does nothing
pub fn noop_reply() -> Option<ReplyCallback> {
    None
}

/// A raw frame received from a replica
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Identity of the sender
    pub sender: ReplicaId,
    /// Encoded [`ReplicationMessage`]
    pub frame: Bytes,
}

impl InboundMessage {
    /// Create an inbound message
    pub fn new(sender: impl Into<ReplicaId>, frame: impl Into<Bytes>) -> Self {
        Self {
            sender: sender.into(),
            frame: frame.into(),
        }
    }

    /// Encode `message` as if it arrived from `sender`
    pub fn from_message(
        sender: impl Into<ReplicaId>,
        message: &ReplicationMessage,
    ) -> Result<Self> {
        Ok(Self::new(sender, message.encode()?))
    }
}

/// Delivers frames to named endpoints
pub trait Transport: Send + Sync {
    /// Send `frame` to `destination`.
    ///
    /// Delivery is best effort; an error means the transport already knows
    /// the frame did not go out.
    fn send(&self, destination: &ReplicaId, frame: Bytes, remote_callback: BuiltinCallback)
    -> Result<()>;
}

/// A frame captured by [`MemoryTransport`]
#[derive(Debug, Clone)]
pub struct SentFrame {
    /// Where the frame was addressed
    pub destination: ReplicaId,
    /// Encoded message
    pub frame: Bytes,
    /// Callback requested on the destination
    pub remote_callback: BuiltinCallback,
}

impl SentFrame {
    /// Decode the captured frame
    pub fn decode(&self) -> Result<ReplicationMessage> {
        ReplicationMessage::decode(&self.frame)
    }
}

/// In-process transport that records every frame it is asked to send
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<SentFrame>>,
    unreachable: Mutex<HashSet<ReplicaId>>,
}

impl MemoryTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sends to `destination` fail (or succeed again)
    pub fn set_unreachable(&self, destination: &ReplicaId, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(destination.clone());
        } else {
            set.remove(destination);
        }
    }

    /// Every frame sent so far, in send order
    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().clone()
    }

    /// Frames sent to `destination`
    pub fn sent_to(&self, destination: &ReplicaId) -> Vec<SentFrame> {
        self.sent
            .lock()
            .iter()
            .filter(|f| &f.destination == destination)
            .cloned()
            .collect()
    }

    /// Number of frames per destination
    pub fn counts(&self) -> HashMap<ReplicaId, usize> {
        let mut counts = HashMap::new();
        for frame in self.sent.lock().iter() {
            *counts.entry(frame.destination.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Drop captured frames
    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Transport for MemoryTransport {
    fn send(
        &self,
        destination: &ReplicaId,
        frame: Bytes,
        remote_callback: BuiltinCallback,
    ) -> Result<()> {
        if self.unreachable.lock().contains(destination) {
            return Err(Error::transport(format!("{} is unreachable", destination)));
        }

        self.sent.lock().push(SentFrame {
            destination: destination.clone(),
            frame,
            remote_callback,
        });
        Ok(())
    }
}
