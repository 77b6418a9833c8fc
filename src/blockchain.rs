//! Append-only chain of blocks

use crate::block::Block;
use crate::error::{BlockchatError, Result};
use crate::ring::NodeId;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Blockchain {
    blocks: Vec<Block>,
    capacity: usize,
}

impl Blockchain {
    /// Create a chain holding only the genesis block. Only the bootstrap
    /// node may do this.
    pub fn new(creator: NodeId, capacity: usize) -> Result<Self> {
        if !creator.is_bootstrap() {
            return Err(BlockchatError::NotBootstrap);
        }
        Ok(Self {
            blocks: vec![Block::genesis(creator)?],
            capacity,
        })
    }

    /// Adopt a chain received from a peer after checking it end to end
    pub fn from_blocks(blocks: Vec<Block>, capacity: usize) -> Result<Self> {
        let chain = Self { blocks, capacity };
        chain.validate()?;
        Ok(chain)
    }

    /// Link `block` after the tip and append it if it validates.
    ///
    /// On failure the block's index, previous hash and hash are restored and
    /// the chain is unchanged.
    pub fn append(&mut self, block: &mut Block) -> Result<()> {
        let saved = (block.index, block.previous_hash.clone(), block.hash.clone());
        let tip = self.tip();

        let outcome = block.link_to(tip).and_then(|_| {
            block.validate(self.capacity).map_err(|reason| {
                BlockchatError::ChainIntegrityViolation {
                    index: self.blocks.len(),
                    reason,
                }
            })
        });

        match outcome {
            Ok(()) => {
                info!(
                    "Appended block {} ({} transactions, hash {})",
                    self.blocks.len(),
                    block.len(),
                    block.hash()
                );
                self.blocks.push(block.clone());
                Ok(())
            },
            Err(e) => {
                warn!("Rejected block: {}", e);
                (block.index, block.previous_hash, block.hash) = saved;
                Err(e)
            },
        }
    }

    /// Diagnostic walk over the chain; logs the first failing index.
    pub fn is_valid(&self) -> bool {
        match self.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", e);
                false
            },
        }
    }

    /// Full check: genesis shape, then per block hash recomputation, linkage,
    /// capacity and transaction signatures.
    pub fn validate(&self) -> Result<()> {
        let genesis = self.blocks.first().ok_or(BlockchatError::ChainIntegrityViolation {
            index: 0,
            reason: "chain is empty".to_string(),
        })?;
        if !genesis.is_genesis() {
            return Err(BlockchatError::ChainIntegrityViolation {
                index: 0,
                reason: "first block is not a genesis block".to_string(),
            });
        }

        for (i, pair) in self.blocks.windows(2).enumerate() {
            let (previous, current) = (&pair[0], &pair[1]);
            let index = i + 1;
            let violation = |reason: String| BlockchatError::ChainIntegrityViolation { index, reason };

            if current.compute_hash()? != current.hash() {
                return Err(violation("invalid hash".to_string()));
            }
            if current.previous_hash() != Some(previous.hash()) {
                return Err(violation("mismatched previous hash".to_string()));
            }
            if current.index() != Some(index as u64) {
                return Err(violation(format!("stored index {:?}", current.index())));
            }
            current.validate(self.capacity).map_err(violation)?;
        }
        Ok(())
    }

    /// Succeeds when every block of this chain appears, in order, at the
    /// start of `other`. Chains only grow, so anything else is a conflict.
    pub fn check_extended_by(&self, other: &Blockchain) -> Result<()> {
        for (index, local) in self.blocks.iter().enumerate() {
            match other.blocks.get(index) {
                Some(block) if block.hash() == local.hash() => {},
                Some(_) => {
                    return Err(BlockchatError::ChainIntegrityViolation {
                        index,
                        reason: "received chain diverges from the local chain".to_string(),
                    })
                },
                None => {
                    return Err(BlockchatError::ChainIntegrityViolation {
                        index,
                        reason: format!(
                            "received chain of {} blocks is shorter than the local chain of {}",
                            other.len(),
                            self.len()
                        ),
                    })
                },
            }
        }
        Ok(())
    }

    pub fn tip(&self) -> &Block {
        // Never empty: construction always goes through genesis or validate().
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use crate::wallet::Wallet;

    fn filled_block(sender: &Wallet, count: u64) -> Block {
        let recipient = Wallet::new(0);
        let mut block = Block::new(NodeId(0)).unwrap();
        for amount in 1..=count {
            let mut tx = Transaction::new(
                sender.public_key().clone(),
                NodeId(1),
                recipient.public_key().clone(),
                Some(amount),
                None,
            )
            .unwrap();
            tx.sign(sender).unwrap();
            block.add_transaction(tx, 5).unwrap();
        }
        block
    }

    #[test]
    fn test_only_bootstrap_creates_genesis() {
        assert!(matches!(Blockchain::new(NodeId(1), 5), Err(BlockchatError::NotBootstrap)));
        let chain = Blockchain::new(NodeId(0), 5).unwrap();
        assert_eq!(chain.len(), 1);
        assert!(chain.tip().is_genesis());
    }

    #[test]
    fn test_appends_preserve_linkage() {
        let sender = Wallet::new(0);
        let mut chain = Blockchain::new(NodeId(0), 5).unwrap();
        for _ in 0..4 {
            let mut block = filled_block(&sender, 5);
            chain.append(&mut block).unwrap();
        }
        assert_eq!(chain.len(), 5);
        for k in 1..chain.len() {
            assert_eq!(chain.blocks()[k].previous_hash(), Some(chain.blocks()[k - 1].hash()));
            assert_eq!(chain.blocks()[k].index(), Some(k as u64));
        }
        assert!(chain.is_valid());
    }

    #[test]
    fn test_failed_append_rolls_back_block() {
        let sender = Wallet::new(0);
        let mut chain = Blockchain::new(NodeId(0), 5).unwrap();
        let mut block = filled_block(&sender, 2);
        // Break a signature so validation fails after linking.
        let other = Wallet::new(0);
        let mut forged = Transaction::new(
            sender.public_key().clone(),
            NodeId(1),
            other.public_key().clone(),
            Some(9),
            None,
        )
        .unwrap();
        forged.sign(&sender).unwrap();
        let mut bad_copy = serde_json::to_value(&forged).unwrap();
        bad_copy["amount"] = serde_json::json!(9000);
        block.transactions.push(serde_json::from_value(bad_copy).unwrap());
        block.rehash().unwrap();

        let before = (block.index(), block.previous_hash().map(str::to_string), block.hash().to_string());
        let err = chain.append(&mut block).unwrap_err();
        assert!(matches!(err, BlockchatError::ChainIntegrityViolation { index: 1, .. }));
        assert_eq!(chain.len(), 1);
        assert_eq!(
            (block.index(), block.previous_hash().map(str::to_string), block.hash().to_string()),
            before
        );
    }

    #[test]
    fn test_tampering_detected_at_block_index() {
        let sender = Wallet::new(0);
        let mut chain = Blockchain::new(NodeId(0), 5).unwrap();
        for _ in 0..3 {
            let mut block = filled_block(&sender, 2);
            chain.append(&mut block).unwrap();
        }
        assert!(chain.is_valid());

        chain.blocks[2].transactions.pop();
        assert!(!chain.is_valid());
        assert!(matches!(
            chain.validate(),
            Err(BlockchatError::ChainIntegrityViolation { index: 2, .. })
        ));
    }

    #[test]
    fn test_relinking_detected() {
        let sender = Wallet::new(0);
        let mut chain = Blockchain::new(NodeId(0), 5).unwrap();
        for _ in 0..2 {
            let mut block = filled_block(&sender, 1);
            chain.append(&mut block).unwrap();
        }
        chain.blocks[2].previous_hash = Some("f".repeat(64));
        chain.blocks[2].rehash().unwrap();
        assert!(matches!(
            chain.validate(),
            Err(BlockchatError::ChainIntegrityViolation { index: 2, .. })
        ));
    }

    #[test]
    fn test_extension_requires_local_prefix() {
        let sender = Wallet::new(0);
        let mut chain = Blockchain::new(NodeId(0), 5).unwrap();
        let genesis_only = chain.clone();
        let mut block = filled_block(&sender, 2);
        chain.append(&mut block).unwrap();

        assert!(genesis_only.check_extended_by(&chain).is_ok());
        assert!(chain.check_extended_by(&chain).is_ok());
        assert!(matches!(
            chain.check_extended_by(&genesis_only),
            Err(BlockchatError::ChainIntegrityViolation { index: 1, .. })
        ));

        let mut fork = genesis_only.clone();
        let mut other = filled_block(&sender, 1);
        fork.append(&mut other).unwrap();
        assert!(matches!(
            chain.check_extended_by(&fork),
            Err(BlockchatError::ChainIntegrityViolation { index: 1, .. })
        ));
    }

    #[test]
    fn test_from_blocks_checks_everything() {
        let sender = Wallet::new(0);
        let mut chain = Blockchain::new(NodeId(0), 5).unwrap();
        let mut block = filled_block(&sender, 3);
        chain.append(&mut block).unwrap();

        let copy = Blockchain::from_blocks(chain.blocks().to_vec(), 5).unwrap();
        assert_eq!(copy.len(), 2);
        assert!(Blockchain::from_blocks(Vec::new(), 5).is_err());
        assert!(Blockchain::from_blocks(chain.blocks().to_vec(), 2).is_err());
    }
}
