//! Error types for the BlockChat library

use crate::ring::NodeId;
use thiserror::Error;

/// Result type alias for BlockChat operations
pub type Result<T> = std::result::Result<T, BlockchatError>;

/// Main error type for BlockChat operations
#[derive(Error, Debug)]
pub enum BlockchatError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Cryptographic errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// A transaction was built with neither an amount nor a message
    #[error("Transaction needs at least one of: amount, message")]
    MissingPayload,

    /// A debit would leave the balance negative
    #[error("Insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: i64, required: i64 },

    /// An amount, cost or balance does not fit the ledger's integer range
    #[error("Amount out of range: {0}")]
    AmountOutOfRange(String),

    /// At least one peer rejected the transaction during broadcast
    #[error("Transaction validation failed: {}", rejections.join("; "))]
    TransactionValidationFailed { rejections: Vec<String> },

    /// The block already holds `capacity` transactions
    #[error("Block capacity of {capacity} exceeded")]
    BlockCapacityExceeded { capacity: usize },

    /// Hash or linkage mismatch inside the chain
    #[error("Chain integrity violation at block {index}: {reason}")]
    ChainIntegrityViolation { index: usize, reason: String },

    /// Bootstrap-only operation attempted by another node
    #[error("Operation is reserved for the bootstrap node")]
    NotBootstrap,

    /// No ring entry for this id or key
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// The node has not been assigned an id yet
    #[error("Node is not registered in the ring")]
    NotRegistered,

    /// The node has not received a chain yet
    #[error("Node has no blockchain yet")]
    ChainUnavailable,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network-specific error types
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Transport failure talking to a peer
    #[error("Peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    /// Timeout occurred
    #[error("Request to {peer} timed out after {duration:?}")]
    Timeout {
        peer: String,
        duration: std::time::Duration,
    },

    /// The peer answered with something other than what was asked for
    #[error("Unexpected response: {reason}")]
    UnexpectedResponse { reason: String },

    /// The peer answered with a failure status
    #[error("Peer refused request: {reason}")]
    Refused { reason: String },

    /// The ring is already complete
    #[error("Ring is full ({total} nodes)")]
    RingFull { total: usize },
}

/// Cryptographic error types
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Signature does not verify against the recomputed hash
    #[error("Invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("Invalid public key: {reason}")]
    InvalidPublicKey { reason: String },

    /// Invalid private key
    #[error("Invalid private key: {reason}")]
    InvalidPrivateKey { reason: String },

    /// Transaction carries no signature
    #[error("Transaction is not signed")]
    MissingSignature,
}

/// Serialization error types
#[derive(Error, Debug)]
pub enum SerializationError {
    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    Binary(#[from] bincode::Error),

    /// Invalid key file or frame format
    #[error("Invalid format: {reason}")]
    InvalidFormat { reason: String },
}

impl BlockchatError {
    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        BlockchatError::Config(msg.into())
    }

    /// Create an unknown-peer error for a ring id
    pub fn unknown_peer(id: NodeId) -> Self {
        BlockchatError::UnknownPeer(id.to_string())
    }

    /// True for the failures a broadcast round counts as a rejection
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            BlockchatError::Network(NetworkError::PeerUnreachable { .. })
                | BlockchatError::Network(NetworkError::Timeout { .. })
        )
    }
}

impl From<serde_json::Error> for BlockchatError {
    fn from(err: serde_json::Error) -> Self {
        BlockchatError::Serialization(SerializationError::Json(err))
    }
}

impl From<bincode::Error> for BlockchatError {
    fn from(err: bincode::Error) -> Self {
        BlockchatError::Serialization(SerializationError::Binary(err))
    }
}
