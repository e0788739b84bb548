//! Base replication manager
//!
//! Shared send/acknowledge/dispatch machinery used by the primary
//! coordinator:
//! - Owns the replica set and each replica's connection state
//! - Encodes messages and hands them to the transport
//! - Tracks reply callbacks and unacknowledged frames until the
//!   destination acknowledges them
//! - Dispatches the message kinds every role understands (acks); anything
//!   else reaching it is a protocol error

use crate::replication::buffer::BufferPool;
use crate::replication::config::{ReplicaEndpoint, ReplicationConfig};
use crate::replication::ids::{MessageId, ReplicaId, next_message_id};
use crate::replication::protocol::{ReplicationMessage, ReplicationMessageMetadata};
use crate::replication::transport::{BuiltinCallback, InboundMessage, ReplyCallback, Transport};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Connection state of a replica as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reachable
    Connected,
    /// Known but currently unreachable
    Disconnected,
}

/// Information about a replica in the replica set
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    /// Replica ID
    pub id: ReplicaId,
    /// Where the replica listens
    pub endpoint: ReplicaEndpoint,
    /// Connection state
    pub state: ConnectionState,
    /// When the replica joined the set
    pub added_at: Instant,
    /// Last time a message from this replica was decoded
    pub last_message_at: Option<Instant>,
}

impl ReplicaInfo {
    fn new(endpoint: ReplicaEndpoint) -> Self {
        Self {
            id: endpoint.replica_id(),
            endpoint,
            state: ConnectionState::Connected,
            added_at: Instant::now(),
            last_message_at: None,
        }
    }
}

/// A frame sent without fire-and-forget, kept until acknowledged
struct OutstandingFrame {
    frame: Bytes,
    remote_callback: BuiltinCallback,
    attempts: u32,
}

type PendingKey = (ReplicaId, MessageId);

/// Send/ack/dispatch machinery shared by replication roles
pub struct ReplicationManager {
    /// This node's identity
    identity: ReplicaId,
    /// Configuration
    config: ReplicationConfig,
    /// Messaging transport
    transport: Arc<dyn Transport>,
    /// Empty-buffer pool shared with the WAL writer
    buffer_pool: BufferPool,
    /// Replica set
    replicas: RwLock<HashMap<ReplicaId, ReplicaInfo>>,
    /// Reply callbacks awaiting an ack
    replies: Mutex<HashMap<PendingKey, ReplyCallback>>,
    /// Frames awaiting an ack, for retransmission
    outstanding: Mutex<HashMap<PendingKey, OutstandingFrame>>,
}

impl ReplicationManager {
    /// Create a manager from configuration
    pub fn new(
        config: ReplicationConfig,
        transport: Arc<dyn Transport>,
        buffer_pool: BufferPool,
    ) -> Result<Self> {
        config.validate().map_err(Error::config)?;

        let replicas: HashMap<ReplicaId, ReplicaInfo> = config
            .resolved_replicas()?
            .into_iter()
            .map(|endpoint| {
                let info = ReplicaInfo::new(endpoint);
                (info.id.clone(), info)
            })
            .collect();

        tracing::info!(
            "Replication manager {} starting with {} replica(s)",
            config.identity,
            replicas.len()
        );

        Ok(Self {
            identity: ReplicaId::new(config.identity.clone()),
            config,
            transport,
            buffer_pool,
            replicas: RwLock::new(replicas),
            replies: Mutex::new(HashMap::new()),
            outstanding: Mutex::new(HashMap::new()),
        })
    }

    /// This node's identity
    pub fn identity(&self) -> &ReplicaId {
        &self.identity
    }

    /// Configuration
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Shared empty-buffer pool
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    /// Encode `message` and send it to `destination`.
    ///
    /// `reply` runs when the destination acknowledges the message. Unless
    /// `fire_and_forget` is set, the frame is also kept for
    /// [`resend_outstanding`](Self::resend_outstanding) until acknowledged.
    pub fn send(
        &self,
        destination: &ReplicaId,
        message: &ReplicationMessage,
        reply: Option<ReplyCallback>,
        remote_callback: BuiltinCallback,
        fire_and_forget: bool,
    ) -> Result<()> {
        let frame = Bytes::from(message.encode()?);
        self.send_frame(
            destination,
            message.message_id(),
            frame,
            reply,
            remote_callback,
            fire_and_forget,
        )
    }

    /// Send an already encoded frame carrying `message_id`
    pub fn send_frame(
        &self,
        destination: &ReplicaId,
        message_id: MessageId,
        frame: Bytes,
        reply: Option<ReplyCallback>,
        remote_callback: BuiltinCallback,
        fire_and_forget: bool,
    ) -> Result<()> {
        let key = (destination.clone(), message_id);

        // Register before sending so a fast ack finds its entry
        if let Some(reply) = reply {
            self.replies.lock().insert(key.clone(), reply);
        }
        if !fire_and_forget {
            self.outstanding.lock().insert(
                key.clone(),
                OutstandingFrame {
                    frame: frame.clone(),
                    remote_callback,
                    attempts: 1,
                },
            );
        }

        tracing::trace!("[SEND] message {} to {}", message_id, destination);

        if let Err(e) = self.transport.send(destination, frame, remote_callback) {
            if fire_and_forget {
                self.replies.lock().remove(&key);
            }
            return Err(e);
        }

        Ok(())
    }

    /// Acknowledge `originating` back to `sender`
    pub fn send_ack_for_message(
        &self,
        sender: &ReplicaId,
        originating: &ReplicationMessage,
    ) -> Result<()> {
        let ack = ReplicationMessage::Ack {
            metadata: ReplicationMessageMetadata::new(next_message_id()),
            acked_message_id: originating.message_id(),
        };
        self.send(sender, &ack, None, BuiltinCallback::Noop, true)
    }

    /// Decode an inbound frame, noting activity for known senders
    pub fn decode_inbound(&self, inbound: &InboundMessage) -> Result<ReplicationMessage> {
        let message = match ReplicationMessage::decode(&inbound.frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("Dropping undecodable frame from {}: {}", inbound.sender, e);
                return Err(e);
            }
        };

        if let Some(info) = self.replicas.write().get_mut(&inbound.sender) {
            info.last_message_at = Some(Instant::now());
            info.state = ConnectionState::Connected;
        }

        tracing::trace!(
            "[RECV] {:?} from {}: ID {}",
            message.message_type(),
            inbound.sender,
            message.message_id()
        );
        Ok(message)
    }

    /// Generic dispatch for message kinds every role handles
    pub fn dispatch(&self, sender: &ReplicaId, message: ReplicationMessage) -> Result<()> {
        match message {
            ReplicationMessage::Ack {
                acked_message_id, ..
            } => {
                self.handle_ack(sender, acked_message_id, &message);
                Ok(())
            }
            other => {
                tracing::error!(
                    "Unexpected {:?} message {} from {}",
                    other.message_type(),
                    other.message_id(),
                    sender
                );
                Err(Error::protocol(format!(
                    "Unexpected {:?} message from {}",
                    other.message_type(),
                    sender
                )))
            }
        }
    }

    fn handle_ack(&self, sender: &ReplicaId, acked: MessageId, ack: &ReplicationMessage) {
        let key = (sender.clone(), acked);
        let was_outstanding = self.outstanding.lock().remove(&key).is_some();
        let reply = self.replies.lock().remove(&key);

        match reply {
            Some(reply) => reply(sender, ack),
            None if !was_outstanding => {
                tracing::trace!("Ack from {} for message {} with nothing pending", sender, acked);
            }
            None => {}
        }
    }

    /// Retransmit every frame still waiting for an ack; returns how many
    /// went out
    pub fn resend_outstanding(&self) -> usize {
        let pending: Vec<(PendingKey, Bytes, BuiltinCallback, u32)> = {
            let mut outstanding = self.outstanding.lock();
            outstanding
                .iter_mut()
                .map(|(key, entry)| {
                    entry.attempts += 1;
                    (
                        key.clone(),
                        entry.frame.clone(),
                        entry.remote_callback,
                        entry.attempts,
                    )
                })
                .collect()
        };

        let mut resent = 0;
        for ((destination, message_id), frame, remote_callback, attempt) in pending {
            match self.transport.send(&destination, frame, remote_callback) {
                Ok(()) => resent += 1,
                Err(e) => {
                    tracing::warn!(
                        "Resend of message {} to {} failed (attempt {}): {}",
                        message_id,
                        destination,
                        attempt,
                        e
                    );
                }
            }
        }
        resent
    }

    /// Number of frames waiting for an ack
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Add a replica; returns false if it was already known
    pub(crate) fn add_replica(&self, endpoint: ReplicaEndpoint) -> bool {
        let info = ReplicaInfo::new(endpoint);
        let id = info.id.clone();
        let mut replicas = self.replicas.write();
        if replicas.contains_key(&id) {
            return false;
        }
        replicas.insert(id.clone(), info);
        tracing::info!("Replica {} added ({} total)", id, replicas.len());
        true
    }

    /// Remove a replica and drop everything pending for it
    pub(crate) fn remove_replica(&self, id: &ReplicaId) -> bool {
        let removed = {
            let mut replicas = self.replicas.write();
            let removed = replicas.remove(id).is_some();
            if removed {
                tracing::info!("Replica {} removed ({} left)", id, replicas.len());
            }
            removed
        };

        if removed {
            self.replies.lock().retain(|(dest, _), _| dest != id);
            self.outstanding.lock().retain(|(dest, _), _| dest != id);
        }
        removed
    }

    /// Update a replica's connection state
    pub fn set_connection_state(&self, id: &ReplicaId, state: ConnectionState) -> bool {
        match self.replicas.write().get_mut(id) {
            Some(info) => {
                info.state = state;
                true
            }
            None => false,
        }
    }

    /// Whether `id` is in the replica set
    pub fn contains(&self, id: &ReplicaId) -> bool {
        self.replicas.read().contains_key(id)
    }

    /// Size of the replica set
    pub fn replica_count(&self) -> usize {
        self.replicas.read().len()
    }

    /// Replica ids, sorted
    pub fn replica_ids(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<ReplicaId> = self.replicas.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Get replica info
    pub fn get_replica(&self, id: &ReplicaId) -> Option<ReplicaInfo> {
        self.replicas.read().get(id).cloned()
    }

    /// Get all replicas
    pub fn replicas(&self) -> Vec<ReplicaInfo> {
        self.replicas.read().values().cloned().collect()
    }
}
