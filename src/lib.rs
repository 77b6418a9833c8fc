//! BlockChat - A minimal peer-to-peer ledger
//! Rust implementation

// Modules
pub mod block;
pub mod blockchain;
pub mod config;
pub mod crypto;
pub mod error;
pub mod network;
pub mod node;
pub mod ring;
pub mod transaction;
pub mod utils;
pub mod wallet;

// Re-exports
pub use block::Block;
pub use blockchain::Blockchain;
pub use config::{NodeConfig, SessionConfig};
pub use error::{BlockchatError, Result};
pub use network::{LocalTransport, PeerRequest, PeerResponse, PeerTransport, TcpTransport};
pub use node::{Node, NodeBuilder};
pub use ring::{NodeId, Ring};
pub use transaction::Transaction;
pub use wallet::Wallet;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Default port of a BlockChat node
pub const DEFAULT_PORT: u16 = 9876;
