//! BlockChat node implementation
//!
//! A node owns one wallet, one view of the ring, one chain and at most one
//! block under assembly. It turns local transfer requests into network-wide
//! settled transactions by asking every ring member to validate them and
//! settling only on unanimous acceptance.

use crate::{
    block::Block,
    blockchain::Blockchain,
    config::{NodeConfig, SessionConfig},
    crypto::PublicKey,
    error::{BlockchatError, NetworkError, Result},
    network::{
        PeerRequest, PeerResponse, PeerTransport, RequestHandler, TcpTransport, TransactionReceipt,
        ValidationOutcome,
    },
    ring::{NodeId, Ring, RingEntry},
    transaction::Transaction,
    wallet::Wallet,
};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Main node structure for a BlockChat network
pub struct Node {
    /// Ring position, known once registered
    id: RwLock<Option<NodeId>>,

    /// Copy of the wallet's public key
    public_key: PublicKey,

    /// Wallet; its mutex serializes every balance and nonce change
    wallet: Mutex<Wallet>,

    /// Session constants, known once registered
    session: RwLock<Option<SessionConfig>>,

    /// This node's view of the ring
    ring: RwLock<Ring>,

    /// Local chain, created by genesis or received from the bootstrap node
    chain: RwLock<Option<Blockchain>>,

    /// Block being filled with this node's settled transactions
    current_block: Mutex<Option<Block>>,

    /// Outgoing RPCs
    transport: Arc<dyn PeerTransport>,

    /// Node configuration
    config: NodeConfig,
}

impl Node {
    /// Create a joining node. It learns its id and the session constants by
    /// registering with the bootstrap node.
    pub fn new(config: NodeConfig, wallet: Wallet, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            id: RwLock::new(None),
            public_key: wallet.public_key().clone(),
            wallet: Mutex::new(wallet),
            session: RwLock::new(None),
            ring: RwLock::new(Ring::new()),
            chain: RwLock::new(None),
            current_block: Mutex::new(None),
            transport,
            config,
        }
    }

    /// Create the bootstrap node: id 0, a ring holding itself, and the
    /// genesis chain.
    pub fn bootstrap(
        config: NodeConfig,
        session: SessionConfig,
        wallet: Wallet,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        session.validate()?;
        let mut ring = Ring::new();
        let id = ring.register(config.ip.clone(), config.port, wallet.public_key().clone());
        let chain = Blockchain::new(id, session.block_capacity)?;
        info!("Bootstrap node ready, expecting {} nodes", session.total_nodes);

        let node = Self::new(config, wallet, transport);
        Ok(Self {
            id: RwLock::new(Some(id)),
            session: RwLock::new(Some(session)),
            ring: RwLock::new(ring),
            chain: RwLock::new(Some(chain)),
            ..node
        })
    }

    /// Create a builder for this node
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    pub async fn id(&self) -> Option<NodeId> {
        *self.id.read().await
    }

    async fn require_id(&self) -> Result<NodeId> {
        self.id().await.ok_or(BlockchatError::NotRegistered)
    }

    async fn require_session(&self) -> Result<SessionConfig> {
        self.session().await.ok_or(BlockchatError::NotRegistered)
    }

    pub async fn is_bootstrap(&self) -> bool {
        self.id().await.map(|id| id.is_bootstrap()).unwrap_or(false)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// `ip:port` this node advertises
    pub fn address(&self) -> String {
        self.config.address()
    }

    pub async fn session(&self) -> Option<SessionConfig> {
        *self.session.read().await
    }

    pub async fn balance(&self) -> i64 {
        self.wallet.lock().await.balance()
    }

    /// Settled transactions originated by this node, oldest first
    pub async fn transactions(&self) -> Vec<Transaction> {
        self.wallet.lock().await.transactions().to_vec()
    }

    pub async fn ring(&self) -> Ring {
        self.ring.read().await.clone()
    }

    pub async fn chain(&self) -> Option<Blockchain> {
        self.chain.read().await.clone()
    }

    pub async fn current_block(&self) -> Option<Block> {
        self.current_block.lock().await.clone()
    }

    /// Apply a balance delta to this node's wallet
    pub async fn update_balance(&self, delta: i64) -> Result<i64> {
        self.wallet.lock().await.update_balance(delta)
    }

    // ---------------------------------------------------------------------
    // Registration and session setup
    // ---------------------------------------------------------------------

    /// Register with the bootstrap node. The bootstrap node is already
    /// registered and returns its own id.
    pub async fn join(&self) -> Result<NodeId> {
        if let Some(id) = self.id().await {
            return Ok(id);
        }

        let request = PeerRequest::RegisterNode {
            ip: self.config.ip.clone(),
            port: self.config.port,
            public_key: self.public_key.clone(),
        };
        let response = self
            .transport
            .send(&self.config.bootstrap_address, request)
            .await?
            .into_result()?;

        match response {
            PeerResponse::Registered { id, session } => {
                session.validate()?;
                *self.id.write().await = Some(id);
                let mut current = self.session.write().await;
                if current.is_none() {
                    *current = Some(session);
                }
                info!("Registered with bootstrap node as node {}", id);
                Ok(id)
            },
            other => Err(NetworkError::UnexpectedResponse {
                reason: format!("RegisterNode answered with {:?}", other),
            }
            .into()),
        }
    }

    /// Bootstrap side of `RegisterNode`. Once the ring is complete the ring
    /// and chain are pushed to every peer.
    pub async fn register_node(
        &self,
        ip: String,
        port: u16,
        public_key: PublicKey,
    ) -> Result<(NodeId, SessionConfig)> {
        if !self.is_bootstrap().await {
            return Err(BlockchatError::NotBootstrap);
        }
        let session = self.require_session().await?;

        let (id, complete) = {
            let mut ring = self.ring.write().await;
            let id = ring.register_bounded(ip, port, public_key, session.total_nodes)?;
            (id, ring.is_complete(session.total_nodes))
        };
        info!("Registered node {} ({}/{})", id, id.0 + 1, session.total_nodes);

        if complete {
            if let Err(e) = self.distribute().await {
                warn!("Ring distribution incomplete: {}", e);
            }
        }
        Ok((id, session))
    }

    /// Push the ring and the chain to every other node
    pub async fn distribute(&self) -> Result<()> {
        if !self.is_bootstrap().await {
            return Err(BlockchatError::NotBootstrap);
        }
        let session = self.require_session().await?;
        let ring = self.ring().await;
        let blocks = self
            .chain()
            .await
            .ok_or(BlockchatError::ChainUnavailable)?
            .into_blocks();

        let peers: Vec<RingEntry> = ring.iter().filter(|e| !e.id.is_bootstrap()).cloned().collect();
        let posts = peers.iter().map(|peer| {
            let ring = ring.clone();
            let blocks = blocks.clone();
            async move {
                let address = peer.address();
                self.transport
                    .send(&address, PeerRequest::PostRing { ring, session })
                    .await?
                    .into_result()?;
                self.transport
                    .send(&address, PeerRequest::PostChain { blocks })
                    .await?
                    .into_result()?;
                Ok::<_, BlockchatError>(())
            }
        });

        let failures: Vec<String> = join_all(posts)
            .await
            .into_iter()
            .zip(&peers)
            .filter_map(|(result, peer)| result.err().map(|e| format!("node {}: {}", peer.id, e)))
            .collect();

        if failures.is_empty() {
            info!("Ring of {} nodes distributed", ring.len());
            Ok(())
        } else {
            Err(NetworkError::PeerUnreachable {
                peer: "ring".to_string(),
                reason: failures.join("; "),
            }
            .into())
        }
    }

    /// Peer side of `PostRing`: adopt the bootstrap's ring and constants
    pub async fn receive_ring(&self, ring: Ring, session: SessionConfig) -> Result<()> {
        if self.is_bootstrap().await {
            return Err(BlockchatError::config("bootstrap node owns the ring"));
        }
        session.validate()?;
        let own = ring
            .find_by_public_key(&self.public_key)
            .map(|entry| entry.id)
            .ok_or_else(|| BlockchatError::UnknownPeer("self missing from ring".to_string()))?;

        {
            let mut id = self.id.write().await;
            if matches!(*id, Some(known) if known != own) {
                warn!("Ring places this node at {} instead of {:?}", own, *id);
            }
            *id = Some(own);
        }
        *self.session.write().await = Some(session);
        *self.ring.write().await = ring;
        Ok(())
    }

    /// Peer side of `PostChain`: adopt a validated copy of the chain.
    ///
    /// A node without a chain takes the copy as is. Otherwise the local chain
    /// must be a prefix of the copy; a shorter or diverging copy is refused
    /// and the local chain is left untouched.
    pub async fn receive_chain(&self, blocks: Vec<Block>) -> Result<()> {
        if self.is_bootstrap().await {
            return Err(BlockchatError::config("bootstrap node owns the chain"));
        }
        let session = self.require_session().await?;
        let received = Blockchain::from_blocks(blocks, session.block_capacity)?;

        let mut chain = self.chain.write().await;
        if let Some(local) = chain.as_ref() {
            local.check_extended_by(&received)?;
        }
        info!("Adopted chain of {} blocks", received.len());
        *chain = Some(received);
        Ok(())
    }

    /// Fetch the bootstrap node's current ring without adopting it
    pub async fn fetch_ring(&self) -> Result<Ring> {
        let response = self
            .transport
            .send(&self.config.bootstrap_address, PeerRequest::GetRing)
            .await?
            .into_result()?;
        match response {
            PeerResponse::Ring { ring } => Ok(ring),
            other => Err(NetworkError::UnexpectedResponse {
                reason: format!("GetRing answered with {:?}", other),
            }
            .into()),
        }
    }

    /// Ask the bootstrap node to post its chain to this node
    pub async fn ask_chain(&self) -> Result<()> {
        let requester = self.require_id().await?;
        self.transport
            .send(&self.config.bootstrap_address, PeerRequest::AskChain { requester })
            .await?
            .into_result()?;
        Ok(())
    }

    /// Bootstrap side of `AskChain`
    pub async fn share_chain(&self, requester: NodeId) -> Result<()> {
        if !self.is_bootstrap().await {
            return Err(BlockchatError::NotBootstrap);
        }
        let peer = self
            .ring
            .read()
            .await
            .get(requester)
            .cloned()
            .ok_or_else(|| BlockchatError::unknown_peer(requester))?;
        let blocks = self
            .chain()
            .await
            .ok_or(BlockchatError::ChainUnavailable)?
            .into_blocks();
        self.transport
            .send(&peer.address(), PeerRequest::PostChain { blocks })
            .await?
            .into_result()?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Transaction lifecycle
    // ---------------------------------------------------------------------

    /// Originate, broadcast and settle a transaction from this node's wallet.
    ///
    /// The cost is debited before broadcasting and credited back if any peer
    /// rejects. On acceptance the transaction gets the next nonce, is
    /// recorded in the wallet and added to the current block, and the
    /// recipient is credited with the bare amount.
    pub async fn make_transaction(
        &self,
        recipient_id: NodeId,
        amount: Option<u64>,
        message: Option<String>,
    ) -> Result<TransactionReceipt> {
        let own_id = self.require_id().await?;
        let recipient = self
            .ring
            .read()
            .await
            .get(recipient_id)
            .cloned()
            .ok_or_else(|| BlockchatError::unknown_peer(recipient_id))?;

        let mut transaction = Transaction::new(
            self.public_key.clone(),
            recipient_id,
            recipient.public_key.clone(),
            amount,
            message,
        )?;
        let cost = transaction.cost()?;
        let credit = transaction
            .amount()
            .map(i64::try_from)
            .transpose()
            .map_err(|e| BlockchatError::AmountOutOfRange(e.to_string()))?;

        {
            let mut wallet = self.wallet.lock().await;
            transaction.sign(&wallet)?;
            wallet.update_balance(-cost)?;
        }
        debug!("Debited {} for transaction {}", cost, transaction.hash());

        let rejections = self.broadcast_validation(&transaction).await;
        if !rejections.is_empty() {
            self.wallet.lock().await.update_balance(cost)?;
            warn!(
                "Transaction {} rejected, {} credited back: {}",
                transaction.hash(),
                cost,
                rejections.join("; ")
            );
            return Err(BlockchatError::TransactionValidationFailed { rejections });
        }

        let nonce = {
            let mut wallet = self.wallet.lock().await;
            let nonce = wallet.next_nonce();
            transaction.assign_nonce(nonce);
            wallet.record(transaction.clone());
            nonce
        };

        let recipient_credited = match credit {
            Some(amount) => self.credit_recipient(own_id, &recipient, amount).await,
            None => true,
        };

        let receipt = TransactionReceipt {
            hash: transaction.hash().to_string(),
            nonce,
            cost,
            recipient_credited,
        };
        info!(
            "Settled transaction {} to node {} (nonce {}, cost {})",
            receipt.hash, recipient_id, nonce, cost
        );

        // Settled either way; a block-assembly failure only affects the chain.
        if let Err(e) = self.add_to_block(transaction).await {
            error!("Could not add transaction {} to a block: {}", receipt.hash, e);
        }
        Ok(receipt)
    }

    async fn credit_recipient(&self, own_id: NodeId, recipient: &RingEntry, amount: i64) -> bool {
        let outcome = if recipient.id == own_id {
            self.update_balance(amount).await.map(|_| ())
        } else {
            let request = PeerRequest::UpdateBalance { delta: amount };
            match tokio::time::timeout(
                self.config.validation_timeout,
                self.transport.send(&recipient.address(), request),
            )
            .await
            {
                Ok(sent) => sent.and_then(PeerResponse::into_result).map(|_| ()),
                Err(_) => Err(NetworkError::Timeout {
                    peer: recipient.address(),
                    duration: self.config.validation_timeout,
                }
                .into()),
            }
        };

        match outcome {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not credit node {} with {}: {}", recipient.id, amount, e);
                false
            },
        }
    }

    /// Ask every ring member, this node included, to validate `transaction`.
    ///
    /// One task per peer; all of them are joined before deciding. Returns the
    /// rejection reasons, empty when every peer accepted.
    pub async fn broadcast_validation(&self, transaction: &Transaction) -> Vec<String> {
        let peers = self.ring().await.entries();
        if peers.is_empty() {
            return vec!["ring is empty".to_string()];
        }

        let handles: Vec<_> = peers
            .iter()
            .map(|peer| {
                let transport = self.transport.clone();
                let address = peer.address();
                let transaction = transaction.clone();
                let timeout = self.config.validation_timeout;
                let retries = self.config.validation_retries;
                tokio::spawn(async move {
                    request_validation(transport, address, transaction, timeout, retries).await
                })
            })
            .collect();

        let mut rejections = Vec::new();
        for (peer, joined) in peers.iter().zip(join_all(handles).await) {
            let verdict = match joined {
                Ok(Ok(outcome)) if outcome.accepted => None,
                Ok(Ok(outcome)) => Some(outcome.reason.unwrap_or_else(|| "rejected".to_string())),
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("validation task failed: {}", e)),
            };
            match verdict {
                None => debug!("Node {} accepted {}", peer.id, transaction.hash()),
                Some(reason) => {
                    debug!("Node {} rejected {}: {}", peer.id, transaction.hash(), reason);
                    rejections.push(format!("node {}: {}", peer.id, reason));
                },
            }
        }
        rejections
    }

    /// Peer-side check of an incoming transaction. Never mutates state.
    pub async fn validate_transaction(&self, transaction: &Transaction) -> ValidationOutcome {
        if let Err(e) = transaction.verify_signature() {
            return ValidationOutcome::reject(e.to_string());
        }
        let cost = match transaction.cost() {
            Ok(cost) => cost,
            Err(e) => return ValidationOutcome::reject(e.to_string()),
        };

        {
            let ring = self.ring.read().await;
            if ring.find_by_public_key(transaction.sender_public_key()).is_none() {
                return ValidationOutcome::reject(
                    BlockchatError::UnknownPeer("sender is not in the ring".to_string()).to_string(),
                );
            }
            match ring.get(transaction.recipient_id()) {
                Some(entry) if &entry.public_key == transaction.recipient_public_key() => {},
                _ => {
                    return ValidationOutcome::reject(
                        BlockchatError::UnknownPeer(format!(
                            "recipient {} does not match the ring",
                            transaction.recipient_id()
                        ))
                        .to_string(),
                    )
                },
            }
        }

        // Only the sender's own node knows the sender's balance; it has
        // already debited the cost, so a negative balance means inconsistency.
        if transaction.sender_public_key() == &self.public_key {
            let balance = self.balance().await;
            if balance < 0 {
                return ValidationOutcome::reject(
                    BlockchatError::InsufficientBalance {
                        balance,
                        required: cost,
                    }
                    .to_string(),
                );
            }
        }

        ValidationOutcome::accept()
    }

    // ---------------------------------------------------------------------
    // Block assembly
    // ---------------------------------------------------------------------

    /// Add a settled transaction to the current block. A block is appended to
    /// the chain as soon as it reaches capacity.
    pub async fn add_to_block(&self, transaction: Transaction) -> Result<()> {
        let id = self.require_id().await?;
        let capacity = self.require_session().await?.block_capacity;
        let mut current = self.current_block.lock().await;

        let mut block = match current.take() {
            Some(block) => block,
            None => Block::new(id)?,
        };
        match block.add_transaction(transaction.clone(), capacity) {
            Ok(()) => {},
            Err(BlockchatError::BlockCapacityExceeded { .. }) => {
                self.finalize_block(block).await;
                block = Block::new(id)?;
                block.add_transaction(transaction, capacity)?;
            },
            Err(e) => return Err(e),
        }

        if block.is_full(capacity) {
            self.finalize_block(block).await;
        } else {
            *current = Some(block);
        }
        Ok(())
    }

    /// Hand a block to the chain. A block that fails is discarded.
    async fn finalize_block(&self, mut block: Block) {
        let mut chain = self.chain.write().await;
        let outcome = match chain.as_mut() {
            Some(chain) => chain.append(&mut block),
            None => Err(BlockchatError::ChainUnavailable),
        };
        if let Err(e) = outcome {
            error!("Discarding block of {} transactions: {}", block.len(), e);
        }
    }

    // ---------------------------------------------------------------------
    // RPC dispatch
    // ---------------------------------------------------------------------

    async fn dispatch(&self, request: PeerRequest) -> Result<PeerResponse> {
        Ok(match request {
            PeerRequest::RegisterNode {
                ip,
                port,
                public_key,
            } => {
                let (id, session) = self.register_node(ip, port, public_key).await?;
                PeerResponse::Registered { id, session }
            },
            PeerRequest::GetRing => {
                if !self.is_bootstrap().await {
                    return Err(BlockchatError::NotBootstrap);
                }
                PeerResponse::Ring {
                    ring: self.ring().await,
                }
            },
            PeerRequest::PostRing { ring, session } => {
                self.receive_ring(ring, session).await?;
                PeerResponse::Ack
            },
            PeerRequest::AskChain { requester } => {
                self.share_chain(requester).await?;
                PeerResponse::Ack
            },
            PeerRequest::PostChain { blocks } => {
                self.receive_chain(blocks).await?;
                PeerResponse::Ack
            },
            PeerRequest::ValidateTransaction { transaction } => {
                PeerResponse::Validation(self.validate_transaction(&transaction).await)
            },
            PeerRequest::MakeTransaction {
                recipient_id,
                amount,
                message,
            } => PeerResponse::TransactionMade(
                self.make_transaction(recipient_id, amount, message).await?,
            ),
            PeerRequest::UpdateBalance { delta } => PeerResponse::Balance {
                balance: self.update_balance(delta).await?,
            },
            PeerRequest::GetBalance => PeerResponse::Balance {
                balance: self.balance().await,
            },
        })
    }
}

#[async_trait]
impl RequestHandler for Node {
    async fn handle(&self, request: PeerRequest) -> PeerResponse {
        let name = request.name();
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("{} failed: {}", name, e);
                PeerResponse::failure(&e)
            },
        }
    }
}

/// Single peer's validation round trip with timeout and bounded retries.
/// Timeouts and transport failures are retried, then reported as errors.
async fn request_validation(
    transport: Arc<dyn PeerTransport>,
    address: String,
    transaction: Transaction,
    timeout: Duration,
    retries: u32,
) -> Result<ValidationOutcome> {
    let mut attempt = 0;
    loop {
        let request = PeerRequest::ValidateTransaction {
            transaction: transaction.clone(),
        };
        let result = match tokio::time::timeout(timeout, transport.send(&address, request)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout {
                peer: address.clone(),
                duration: timeout,
            }
            .into()),
        };

        match result {
            Ok(PeerResponse::Validation(outcome)) => return Ok(outcome),
            Ok(PeerResponse::Failure { reason }) => return Ok(ValidationOutcome::reject(reason)),
            Ok(other) => {
                return Err(NetworkError::UnexpectedResponse {
                    reason: format!("ValidateTransaction answered with {:?}", other),
                }
                .into())
            },
            Err(e) if e.is_transport_failure() && attempt < retries => {
                attempt += 1;
                warn!("Validation request to {} failed ({}), retry {}/{}", address, e, attempt, retries);
            },
            Err(e) => return Err(e),
        }
    }
}

/// Builder for BlockChat nodes
pub struct NodeBuilder {
    config: NodeConfig,
    session: Option<SessionConfig>,
    wallet: Option<Wallet>,
    transport: Option<Arc<dyn PeerTransport>>,
}

impl NodeBuilder {
    /// Create a new node builder
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            session: None,
            wallet: None,
            transport: None,
        }
    }

    /// Set the node configuration
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Make this the bootstrap node of a session
    pub fn bootstrap(mut self, session: SessionConfig) -> Self {
        self.session = Some(session);
        self
    }

    /// Use an existing wallet instead of generating one
    pub fn with_wallet(mut self, wallet: Wallet) -> Self {
        self.wallet = Some(wallet);
        self
    }

    /// Set the outgoing transport
    pub fn with_transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the advertised address
    pub fn address(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.config.ip = ip.into();
        self.config.port = port;
        self
    }

    /// Set where the bootstrap node listens
    pub fn bootstrap_address(mut self, address: impl Into<String>) -> Self {
        self.config.bootstrap_address = address.into();
        self
    }

    /// Set the starting balance of a generated wallet
    pub fn initial_balance(mut self, balance: i64) -> Self {
        self.config.initial_balance = balance;
        self
    }

    /// Set the per-peer validation timeout
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.config.validation_timeout = timeout;
        self
    }

    /// Set the number of retries after a transport failure
    pub fn validation_retries(mut self, retries: u32) -> Self {
        self.config.validation_retries = retries;
        self
    }

    /// Build the node
    pub fn build(self) -> Result<Node> {
        let wallet = self
            .wallet
            .unwrap_or_else(|| Wallet::new(self.config.initial_balance));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TcpTransport::new()));

        match self.session {
            Some(session) => Node::bootstrap(self.config, session, wallet, transport),
            None => Ok(Node::new(self.config, wallet, transport)),
        }
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
