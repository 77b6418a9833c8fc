//! Session and node configuration

use crate::error::{BlockchatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bootstrap address every node knows in advance
pub const DEFAULT_BOOTSTRAP_ADDRESS: &str = "127.0.0.1:9876";

/// Default block capacity
pub const DEFAULT_BLOCK_CAPACITY: usize = 5;

/// Session-wide constants fixed by the bootstrap node.
///
/// Every node must hold the same values, otherwise chain hashes diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Number of nodes expected in the ring, bootstrap included
    pub total_nodes: usize,
    /// Maximum number of transactions per non-genesis block
    pub block_capacity: usize,
}

impl SessionConfig {
    pub fn new(total_nodes: usize, block_capacity: usize) -> Result<Self> {
        let session = Self {
            total_nodes,
            block_capacity,
        };
        session.validate()?;
        Ok(session)
    }

    /// Reject values no session can run with
    pub fn validate(&self) -> Result<()> {
        if self.total_nodes == 0 {
            return Err(BlockchatError::config("total_nodes must be at least 1"));
        }
        if self.block_capacity == 0 {
            return Err(BlockchatError::config("block_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Per-process node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address advertised to the ring
    pub ip: String,

    /// Port advertised to the ring
    pub port: u16,

    /// Where the bootstrap node listens
    pub bootstrap_address: String,

    /// Per-peer bound on a validation request
    pub validation_timeout: Duration,

    /// Extra attempts after a transport failure during validation
    pub validation_retries: u32,

    /// Starting wallet balance
    pub initial_balance: i64,
}

impl NodeConfig {
    /// `ip:port` as advertised in the ring
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 9876,
            bootstrap_address: DEFAULT_BOOTSTRAP_ADDRESS.to_string(),
            validation_timeout: Duration::from_secs(5),
            validation_retries: 0,
            initial_balance: 0,
        }
    }
}
