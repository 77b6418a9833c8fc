//! RPC model and transports for peer-to-peer communication
//!
//! The core only depends on [`PeerTransport`] (outgoing requests) and
//! [`RequestHandler`] (incoming requests). Two transports are provided:
//! [`LocalTransport`] routes requests between nodes living in one process,
//! [`TcpTransport`] carries newline-delimited JSON over TCP.

use crate::block::Block;
use crate::config::SessionConfig;
use crate::crypto::PublicKey;
use crate::error::{BlockchatError, NetworkError, Result};
use crate::ring::{NodeId, Ring};
use crate::transaction::Transaction;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

/// Longest accepted JSON line; a full chain travels in one line.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Requests exchanged between nodes and from external callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Joiner asks the bootstrap node for an id
    RegisterNode {
        ip: String,
        port: u16,
        public_key: PublicKey,
    },
    /// Fetch the bootstrap node's ring
    GetRing,
    /// Bootstrap node pushes the final ring and session constants
    PostRing { ring: Ring, session: SessionConfig },
    /// Ask the bootstrap node to post its chain to `requester`
    AskChain { requester: NodeId },
    /// Replace the receiver's chain with this copy
    PostChain { blocks: Vec<Block> },
    /// Check a transaction without side effects
    ValidateTransaction { transaction: Transaction },
    /// Originate a transaction from the receiving node's wallet
    MakeTransaction {
        recipient_id: NodeId,
        amount: Option<u64>,
        message: Option<String>,
    },
    /// Settlement credit (or any delta) applied to the receiver's wallet
    UpdateBalance { delta: i64 },
    /// Read the receiver's balance
    GetBalance,
}

impl PeerRequest {
    pub fn name(&self) -> &'static str {
        match self {
            PeerRequest::RegisterNode { .. } => "RegisterNode",
            PeerRequest::GetRing => "GetRing",
            PeerRequest::PostRing { .. } => "PostRing",
            PeerRequest::AskChain { .. } => "AskChain",
            PeerRequest::PostChain { .. } => "PostChain",
            PeerRequest::ValidateTransaction { .. } => "ValidateTransaction",
            PeerRequest::MakeTransaction { .. } => "MakeTransaction",
            PeerRequest::UpdateBalance { .. } => "UpdateBalance",
            PeerRequest::GetBalance => "GetBalance",
        }
    }
}

/// Verdict of a peer asked to validate a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl ValidationOutcome {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// What the originating node reports after settlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub hash: String,
    pub nonce: u64,
    pub cost: i64,
    /// False when the recipient could not be reached for the credit step
    pub recipient_credited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerResponse {
    Registered { id: NodeId, session: SessionConfig },
    Ring { ring: Ring },
    Ack,
    Validation(ValidationOutcome),
    TransactionMade(TransactionReceipt),
    Balance { balance: i64 },
    /// Any error, reduced to its human-readable reason
    Failure { reason: String },
}

impl PeerResponse {
    pub fn failure(err: &BlockchatError) -> Self {
        PeerResponse::Failure {
            reason: err.to_string(),
        }
    }

    /// Turn a `Failure` into an error, pass anything else through
    pub fn into_result(self) -> Result<PeerResponse> {
        match self {
            PeerResponse::Failure { reason } => Err(NetworkError::Refused { reason }.into()),
            other => Ok(other),
        }
    }
}

/// Receiving side of the RPC boundary
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: PeerRequest) -> PeerResponse;
}

/// Sending side of the RPC boundary
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver `request` to the node listening at `address` and wait for its
    /// answer. Transport failures surface as `NetworkError::PeerUnreachable`.
    async fn send(&self, address: &str, request: PeerRequest) -> Result<PeerResponse>;
}

fn unreachable(peer: &str, reason: impl ToString) -> BlockchatError {
    NetworkError::PeerUnreachable {
        peer: peer.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// In-process transport for tests and single-process networks.
///
/// Requests and responses are bincode-encoded on the way through, so nodes
/// only ever see copies. A peer can be marked unreachable to simulate a
/// failed process.
#[derive(Default)]
pub struct LocalTransport {
    handlers: DashMap<String, Weak<dyn RequestHandler>>,
    unreachable: DashSet<String>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route requests for `address` to `handler`
    pub fn register<H: RequestHandler + 'static>(&self, address: impl Into<String>, handler: &Arc<H>) {
        let handler: Arc<dyn RequestHandler> = handler.clone();
        self.handlers.insert(address.into(), Arc::downgrade(&handler));
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if reachable {
            self.unreachable.remove(address);
        } else {
            self.unreachable.insert(address.to_string());
        }
    }
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn send(&self, address: &str, request: PeerRequest) -> Result<PeerResponse> {
        if self.unreachable.contains(address) {
            return Err(unreachable(address, "peer is down"));
        }
        let handler = self
            .handlers
            .get(address)
            .and_then(|entry| entry.value().upgrade())
            .ok_or_else(|| unreachable(address, "no such peer"))?;

        let request: PeerRequest = bincode::deserialize(&bincode::serialize(&request)?)?;
        let response = handler.handle(request).await;
        Ok(bincode::deserialize(&bincode::serialize(&response)?)?)
    }
}

/// Newline-delimited JSON over TCP, one connection per request
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn send(&self, address: &str, request: PeerRequest) -> Result<PeerResponse> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| unreachable(address, e))?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));

        framed
            .send(serde_json::to_string(&request)?)
            .await
            .map_err(|e| unreachable(address, e))?;

        let line = framed
            .next()
            .await
            .ok_or_else(|| unreachable(address, "connection closed"))?
            .map_err(|e| unreachable(address, e))?;
        Ok(serde_json::from_str(&line)?)
    }
}

/// Accept connections forever, answering each request line with `handler`.
pub async fn serve(listener: TcpListener, handler: Arc<dyn RequestHandler>) -> Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, handler).await {
                warn!("Connection from {} failed: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
) -> std::result::Result<(), LinesCodecError> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    while let Some(line) = framed.next().await {
        let response = match serde_json::from_str::<PeerRequest>(&line?) {
            Ok(request) => {
                debug!("Handling {}", request.name());
                handler.handle(request).await
            },
            Err(e) => PeerResponse::Failure {
                reason: format!("malformed request: {}", e),
            },
        };
        let encoded = serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(r#"{{"Failure":{{"reason":"unencodable response: {}"}}}}"#, e)
        });
        framed.send(encoded).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: PeerRequest) -> PeerResponse {
            match request {
                PeerRequest::UpdateBalance { delta } => PeerResponse::Balance { balance: delta },
                other => PeerResponse::Failure {
                    reason: format!("unsupported {}", other.name()),
                },
            }
        }
    }

    #[tokio::test]
    async fn test_local_routing_and_reachability() -> Result<()> {
        let transport = LocalTransport::new();
        let echo = Arc::new(Echo);
        transport.register("a:1", &echo);

        match transport.send("a:1", PeerRequest::UpdateBalance { delta: 7 }).await? {
            PeerResponse::Balance { balance } => assert_eq!(balance, 7),
            other => panic!("unexpected {:?}", other),
        }

        transport.set_reachable("a:1", false);
        let err = transport.send("a:1", PeerRequest::GetBalance).await.unwrap_err();
        assert!(err.is_transport_failure());

        transport.set_reachable("a:1", true);
        assert!(transport.send("a:1", PeerRequest::GetBalance).await?.into_result().is_err());

        let err = transport.send("b:2", PeerRequest::GetBalance).await.unwrap_err();
        assert!(err.is_transport_failure());
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_handler_is_unreachable() {
        let transport = LocalTransport::new();
        let echo = Arc::new(Echo);
        transport.register("a:1", &echo);
        drop(echo);
        assert!(transport
            .send("a:1", PeerRequest::GetBalance)
            .await
            .unwrap_err()
            .is_transport_failure());
    }

    #[tokio::test]
    async fn test_tcp_round_trip() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        tokio::spawn(serve(listener, Arc::new(Echo)));

        let transport = TcpTransport::new();
        match transport.send(&address, PeerRequest::UpdateBalance { delta: -3 }).await? {
            PeerResponse::Balance { balance } => assert_eq!(balance, -3),
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_tcp_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = TcpTransport::new()
            .send(&address, PeerRequest::GetBalance)
            .await
            .unwrap_err();
        assert!(err.is_transport_failure());
    }
}
