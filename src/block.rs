//! Capacity-bounded, content-addressed blocks of transactions

use crate::crypto::content_hash;
use crate::error::{BlockchatError, Result};
use crate::ring::NodeId;
use crate::transaction::Transaction;
use crate::utils::current_time_millis;
use serde::{Deserialize, Serialize};

/// Previous-hash sentinel of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "1";

#[derive(Serialize)]
struct HashedFields<'a> {
    index: Option<u64>,
    previous_hash: Option<&'a str>,
    transactions: Vec<&'a str>,
    validator: NodeId,
    timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub(crate) index: Option<u64>,
    pub(crate) previous_hash: Option<String>,
    pub(crate) transactions: Vec<Transaction>,
    validator_id: NodeId,
    timestamp: u64,
    pub(crate) hash: String,
}

impl Block {
    /// Start an empty block assembled by `validator_id`
    pub fn new(validator_id: NodeId) -> Result<Self> {
        Self::build(validator_id, None, None)
    }

    /// The first block of every chain
    pub fn genesis(validator_id: NodeId) -> Result<Self> {
        Self::build(validator_id, Some(0), Some(GENESIS_PREVIOUS_HASH.to_string()))
    }

    fn build(validator_id: NodeId, index: Option<u64>, previous_hash: Option<String>) -> Result<Self> {
        let mut block = Self {
            index,
            previous_hash,
            transactions: Vec::new(),
            validator_id,
            timestamp: current_time_millis(),
            hash: String::new(),
        };
        block.rehash()?;
        Ok(block)
    }

    /// Content hash of the current field values
    pub fn compute_hash(&self) -> Result<String> {
        content_hash(&HashedFields {
            index: self.index,
            previous_hash: self.previous_hash.as_deref(),
            transactions: self.transactions.iter().map(Transaction::hash).collect(),
            validator: self.validator_id,
            timestamp: self.timestamp,
        })
    }

    /// Store a fresh hash. Call after any structural change.
    pub fn rehash(&mut self) -> Result<()> {
        self.hash = self.compute_hash()?;
        Ok(())
    }

    /// Append a transaction if there is room.
    pub fn add_transaction(&mut self, transaction: Transaction, capacity: usize) -> Result<()> {
        if self.is_full(capacity) {
            return Err(BlockchatError::BlockCapacityExceeded { capacity });
        }
        self.transactions.push(transaction);
        self.rehash()
    }

    pub fn is_full(&self, capacity: usize) -> bool {
        self.transactions.len() >= capacity
    }

    pub fn is_genesis(&self) -> bool {
        self.index == Some(0) && self.previous_hash.as_deref() == Some(GENESIS_PREVIOUS_HASH)
    }

    /// Place this block after a chain tip and refresh its hash
    pub(crate) fn link_to(&mut self, tip: &Block) -> Result<()> {
        self.index = Some(tip.index.unwrap_or(0) + 1);
        self.previous_hash = Some(tip.hash.clone());
        self.rehash()
    }

    /// Self-contained checks: stored hash, capacity, and every transaction's
    /// hash and signature.
    pub fn validate(&self, capacity: usize) -> std::result::Result<(), String> {
        let recomputed = self.compute_hash().map_err(|e| e.to_string())?;
        if recomputed != self.hash {
            return Err("stored hash does not match contents".to_string());
        }
        if !self.is_genesis() && self.transactions.len() > capacity {
            return Err(format!(
                "{} transactions exceed capacity {}",
                self.transactions.len(),
                capacity
            ));
        }
        for transaction in &self.transactions {
            transaction
                .verify_signature()
                .map_err(|e| format!("transaction {}: {}", transaction.hash(), e))?;
        }
        Ok(())
    }

    pub fn index(&self) -> Option<u64> {
        self.index
    }

    pub fn previous_hash(&self) -> Option<&str> {
        self.previous_hash.as_deref()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn validator_id(&self) -> NodeId {
        self.validator_id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}
