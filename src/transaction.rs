//! Signed transfers of coins and/or messages between wallets

use crate::crypto::{content_hash, PublicKey, Signature};
use crate::error::{BlockchatError, CryptoError, Result};
use crate::ring::NodeId;
use crate::utils::current_time_millis;
use crate::wallet::Wallet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Surcharge on coin transfers, in percent of the amount
pub const TRANSFER_FEE_PERCENT: u64 = 3;

/// Transaction type. A transaction carrying coins is `Coins` even when it
/// also carries a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Coins,
    Message,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Coins => write!(f, "coins"),
            TransactionKind::Message => write!(f, "message"),
        }
    }
}

fn out_of_range(what: impl std::fmt::Display) -> BlockchatError {
    BlockchatError::AmountOutOfRange(what.to_string())
}

/// Sender-side cost of moving `amount` coins: the amount plus the surcharge,
/// rounded up to a whole coin. Fails when the cost does not fit an `i64`.
pub fn transfer_cost(amount: u64) -> Result<i64> {
    let fee = amount
        .checked_mul(TRANSFER_FEE_PERCENT)
        .ok_or_else(|| out_of_range(format!("fee on {}", amount)))?
        .div_ceil(100);
    let cost = amount
        .checked_add(fee)
        .ok_or_else(|| out_of_range(format!("cost of {}", amount)))?;
    i64::try_from(cost).map_err(|_| out_of_range(format!("cost of {}", amount)))
}

/// One unit per character of the trimmed message
pub fn message_cost(message: &str) -> Result<i64> {
    let chars = message.trim().chars().count();
    i64::try_from(chars).map_err(|_| out_of_range(format!("message of {} characters", chars)))
}

/// Total debit for a transaction carrying the given payload
pub fn total_cost(amount: Option<u64>, message: Option<&str>) -> Result<i64> {
    let coins = amount.map(transfer_cost).transpose()?.unwrap_or(0);
    let text = message.map(message_cost).transpose()?.unwrap_or(0);
    coins
        .checked_add(text)
        .ok_or_else(|| out_of_range("total cost"))
}

/// Fields covered by the content hash. Nonce and signature are excluded so the
/// hash stays valid after settlement.
#[derive(Serialize)]
struct HashedFields<'a> {
    sender_public_key: &'a PublicKey,
    recipient_id: NodeId,
    recipient_public_key: &'a PublicKey,
    kind: TransactionKind,
    amount: Option<u64>,
    message: Option<&'a str>,
    timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    sender_public_key: PublicKey,
    recipient_id: NodeId,
    recipient_public_key: PublicKey,
    amount: Option<u64>,
    message: Option<String>,
    kind: TransactionKind,
    timestamp: u64,
    nonce: Option<u64>,
    hash: String,
    signature: Option<Signature>,
}

impl Transaction {
    /// Draft and hash a new transaction.
    ///
    /// A zero amount and an empty message count as absent; with neither
    /// present this fails with `MissingPayload`.
    pub fn new(
        sender_public_key: PublicKey,
        recipient_id: NodeId,
        recipient_public_key: PublicKey,
        amount: Option<u64>,
        message: Option<String>,
    ) -> Result<Self> {
        Self::with_timestamp(
            sender_public_key,
            recipient_id,
            recipient_public_key,
            amount,
            message,
            current_time_millis(),
        )
    }

    pub fn with_timestamp(
        sender_public_key: PublicKey,
        recipient_id: NodeId,
        recipient_public_key: PublicKey,
        amount: Option<u64>,
        message: Option<String>,
        timestamp: u64,
    ) -> Result<Self> {
        let amount = amount.filter(|a| *a > 0);
        let message = message.filter(|m| !m.is_empty());
        let kind = match (&amount, &message) {
            (Some(_), _) => TransactionKind::Coins,
            (None, Some(_)) => TransactionKind::Message,
            (None, None) => return Err(BlockchatError::MissingPayload),
        };

        total_cost(amount, message.as_deref())?;

        let mut transaction = Self {
            sender_public_key,
            recipient_id,
            recipient_public_key,
            amount,
            message,
            kind,
            timestamp,
            nonce: None,
            hash: String::new(),
            signature: None,
        };
        transaction.hash = transaction.compute_hash()?;
        Ok(transaction)
    }

    /// Recompute the content hash from the identifying fields
    pub fn compute_hash(&self) -> Result<String> {
        content_hash(&HashedFields {
            sender_public_key: &self.sender_public_key,
            recipient_id: self.recipient_id,
            recipient_public_key: &self.recipient_public_key,
            kind: self.kind,
            amount: self.amount,
            message: self.message.as_deref(),
            timestamp: self.timestamp,
        })
    }

    /// Sign the stored hash. Signing twice keeps the first signature.
    pub fn sign(&mut self, wallet: &Wallet) -> Result<()> {
        if self.signature.is_some() {
            return Ok(());
        }
        if wallet.public_key() != &self.sender_public_key {
            return Err(CryptoError::InvalidPublicKey {
                reason: "signing wallet is not the sender".to_string(),
            }
            .into());
        }
        self.signature = Some(wallet.sign(&self.hash));
        Ok(())
    }

    /// Check the signature against a freshly recomputed hash.
    ///
    /// The transmitted hash is only compared, never trusted.
    pub fn verify_signature(&self) -> Result<()> {
        let signature = self
            .signature
            .as_ref()
            .ok_or(CryptoError::MissingSignature)?;
        let recomputed = self.compute_hash()?;
        if recomputed != self.hash
            || !Wallet::verify(&recomputed, signature, &self.sender_public_key)
        {
            return Err(CryptoError::InvalidSignature.into());
        }
        Ok(())
    }

    /// Set the nonce after network-wide acceptance. Does not touch the hash.
    pub fn assign_nonce(&mut self, nonce: u64) {
        if self.nonce.is_none() {
            self.nonce = Some(nonce);
        }
    }

    /// What the sender is debited
    pub fn cost(&self) -> Result<i64> {
        total_cost(self.amount, self.message.as_deref())
    }

    pub fn sender_public_key(&self) -> &PublicKey {
        &self.sender_public_key
    }

    pub fn recipient_id(&self) -> NodeId {
        self.recipient_id
    }

    pub fn recipient_public_key(&self) -> &PublicKey {
        &self.recipient_public_key
    }

    pub fn amount(&self) -> Option<u64> {
        self.amount
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn nonce(&self) -> Option<u64> {
        self.nonce
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}
