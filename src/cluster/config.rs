use crate::balancer::BalancerKind;
use crate::core::{DbError, Result};
use crate::strategy::AggregateSelection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Per-replica options recognized by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Unique replica identifier
    pub id: String,

    /// Relative share of reads; 0 keeps the replica out of read selection
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Preferred source of broadcast results
    #[serde(default)]
    pub local: bool,

    /// Whether the replica starts in the active set
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl ReplicaConfig {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            weight: default_weight(),
            local: false,
            active: true,
        }
    }

    /// Set the balancer weight
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Mark as the local (primary) replica
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Start outside the active set
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Cluster configuration
///
/// Mirrors what the registry layer resolves for one logical database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Logical cluster name
    pub id: String,

    /// Known replicas
    pub replicas: Vec<ReplicaConfig>,

    /// Read selection policy
    pub balancer: BalancerKind,

    /// Worker count for broadcasts issued inside a transaction
    pub transactional_pool_size: usize,

    /// Worker count for broadcasts issued outside a transaction
    pub non_transactional_pool_size: usize,

    /// Per-replica task timeout in milliseconds
    pub replica_timeout_ms: Option<u64>,

    /// Minimum number of replicas that must succeed for a broadcast to count
    pub min_surviving_replicas: usize,

    /// Canonical value selection for aggregate invocations
    pub aggregate_selection: AggregateSelection,

    /// Lock sequences referenced by statements
    pub detect_sequences: bool,

    /// Capacity of the SQL classification cache
    pub sql_cache_size: usize,
}

impl ClusterConfig {
    /// Create a new cluster configuration
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            replicas: Vec::new(),
            balancer: BalancerKind::default(),
            transactional_pool_size: 8,
            non_transactional_pool_size: 16,
            replica_timeout_ms: None,
            min_surviving_replicas: 1,
            aggregate_selection: AggregateSelection::default(),
            detect_sequences: true,
            sql_cache_size: 256,
        }
    }

    /// Add a replica
    pub fn replica(mut self, replica: ReplicaConfig) -> Self {
        self.replicas.push(replica);
        self
    }

    /// Set the balancer policy
    pub fn balancer(mut self, balancer: BalancerKind) -> Self {
        self.balancer = balancer;
        self
    }

    /// Set transactional pool size
    pub fn transactional_pool_size(mut self, size: usize) -> Self {
        self.transactional_pool_size = size;
        self
    }

    /// Set non-transactional pool size
    pub fn non_transactional_pool_size(mut self, size: usize) -> Self {
        self.non_transactional_pool_size = size;
        self
    }

    /// Set per-replica timeout
    pub fn replica_timeout(mut self, timeout: Duration) -> Self {
        self.replica_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set minimum surviving replicas
    pub fn min_surviving_replicas(mut self, min: usize) -> Self {
        self.min_surviving_replicas = min;
        self
    }

    /// Set aggregate selection
    pub fn aggregate_selection(mut self, selection: AggregateSelection) -> Self {
        self.aggregate_selection = selection;
        self
    }

    /// Toggle sequence detection
    pub fn detect_sequences(mut self, detect: bool) -> Self {
        self.detect_sequences = detect;
        self
    }

    pub fn replica_timeout_duration(&self) -> Option<Duration> {
        self.replica_timeout_ms.map(Duration::from_millis)
    }

    /// Parse from a JSON document
    ///
    /// ```ignore
    /// let config = ClusterConfig::from_json_str(r#"{
    ///     "id": "orders",
    ///     "replicas": [{"id": "db1", "local": true}, {"id": "db2", "weight": 2}]
    /// }"#)?;
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| DbError::ConfigError(e.to_string()))?;
        config.validate().map_err(DbError::ConfigError)?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Cluster id cannot be empty".to_string());
        }

        if self.replicas.is_empty() {
            return Err("At least one replica must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for replica in &self.replicas {
            if replica.id.trim().is_empty() {
                return Err("Replica id cannot be empty".to_string());
            }
            if !seen.insert(replica.id.as_str()) {
                return Err(format!("Duplicate replica id '{}'", replica.id));
            }
        }

        if self.replicas.iter().filter(|r| r.local).count() > 1 {
            return Err("At most one replica can be local".to_string());
        }

        if self.transactional_pool_size == 0 {
            return Err("transactional_pool_size must be > 0".to_string());
        }

        if self.non_transactional_pool_size == 0 {
            return Err("non_transactional_pool_size must be > 0".to_string());
        }

        if self.min_surviving_replicas == 0 {
            return Err("min_surviving_replicas must be >= 1".to_string());
        }

        if self.sql_cache_size == 0 {
            return Err("sql_cache_size must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::new("cluster")
    }
}
