//! Replication configuration

use crate::replication::ids::ReplicaId;
use crate::replication::{DEFAULT_BUFFER_POOL_CAPACITY, DEFAULT_REPLICATION_PORT};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Replication durability policy, chosen per commit batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationPolicy {
    /// Replication is off; the coordinator must not be called
    Disable,
    /// Ship records but release commits immediately
    Async,
    /// Release commits only once every replica has applied them
    Sync,
}

impl ReplicationPolicy {
    /// Whether records should be replicated at all
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disable)
    }
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self::Async
    }
}

/// Where a replica can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaEndpoint {
    /// Network identity of the replica
    pub identity: String,
    /// Host name or address
    pub hostname: String,
    /// Messaging port
    pub port: u16,
}

impl ReplicaEndpoint {
    /// Create an endpoint
    pub fn new(identity: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            identity: identity.into(),
            hostname: hostname.into(),
            port,
        }
    }

    /// Replica id of this endpoint
    pub fn replica_id(&self) -> ReplicaId {
        ReplicaId::new(self.identity.clone())
    }

    /// `hostname:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// This node's network identity
    pub identity: String,

    /// Messaging port
    pub port: u16,

    /// JSON file listing replica endpoints
    pub replica_hosts_path: Option<PathBuf>,

    /// Replicas configured inline
    pub replicas: Vec<ReplicaEndpoint>,

    /// Default durability policy for commits
    pub policy: ReplicationPolicy,

    /// Maximum number of empty buffers kept for reuse
    pub buffer_pool_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            identity: "primary".to_string(),
            port: DEFAULT_REPLICATION_PORT,
            replica_hosts_path: None,
            replicas: Vec::new(),
            policy: ReplicationPolicy::Async,
            buffer_pool_capacity: DEFAULT_BUFFER_POOL_CAPACITY,
        }
    }
}

impl ReplicationConfig {
    /// Create a primary configuration
    pub fn primary(identity: impl Into<String>, port: u16) -> Self {
        Self {
            identity: identity.into(),
            port,
            ..Default::default()
        }
    }

    /// Set default policy
    pub fn with_policy(mut self, policy: ReplicationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Add a replica
    pub fn with_replica(mut self, replica: ReplicaEndpoint) -> Self {
        self.replicas.push(replica);
        self
    }

    /// Read additional replicas from a hosts file
    pub fn with_hosts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.replica_hosts_path = Some(path.into());
        self
    }

    /// Set buffer pool capacity
    pub fn with_buffer_pool_capacity(mut self, capacity: usize) -> Self {
        self.buffer_pool_capacity = capacity;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.identity.trim().is_empty() {
            return Err("identity must not be empty".into());
        }

        if self.port == 0 {
            return Err("port must be non-zero".into());
        }

        if self.buffer_pool_capacity == 0 {
            return Err("buffer_pool_capacity must be at least 1".into());
        }

        let mut seen = HashSet::new();
        for replica in &self.replicas {
            if replica.identity == self.identity {
                return Err(format!(
                    "replica {} has the same identity as this node",
                    replica.identity
                ));
            }
            if !seen.insert(replica.identity.as_str()) {
                return Err(format!("duplicate replica identity {}", replica.identity));
            }
        }

        Ok(())
    }

    /// Inline replicas merged with the hosts file, if any.
    ///
    /// Inline entries win when both name the same identity; entries naming
    /// this node are skipped.
    pub fn resolved_replicas(&self) -> Result<Vec<ReplicaEndpoint>> {
        let mut replicas = self.replicas.clone();

        if let Some(path) = &self.replica_hosts_path {
            for endpoint in load_replica_hosts(path)? {
                if endpoint.identity == self.identity {
                    continue;
                }
                if replicas.iter().any(|r| r.identity == endpoint.identity) {
                    tracing::debug!(
                        "Replica {} listed inline and in {}, keeping inline entry",
                        endpoint.identity,
                        path.display()
                    );
                    continue;
                }
                replicas.push(endpoint);
            }
        }

        Ok(replicas)
    }
}

/// Read a JSON array of [`ReplicaEndpoint`]s
pub fn load_replica_hosts(path: &Path) -> Result<Vec<ReplicaEndpoint>> {
    let contents = std::fs::read_to_string(path)?;
    let endpoints: Vec<ReplicaEndpoint> = serde_json::from_str(&contents)?;

    for endpoint in &endpoints {
        if endpoint.identity.trim().is_empty() {
            return Err(Error::config(format!(
                "{}: replica entry with empty identity",
                path.display()
            )));
        }
    }

    Ok(endpoints)
}
