use blockchat_rust::{
    error::Result,
    network::{serve, RequestHandler},
    BlockchatError, Blockchain, LocalTransport, Node, NodeId, PeerRequest, PeerResponse,
    PeerTransport, SessionConfig, TcpTransport,
};
use std::sync::Arc;
use tokio::net::TcpListener;

async fn local_bootstrap(
    transport: &Arc<LocalTransport>,
    session: SessionConfig,
    balance: i64,
) -> Result<Arc<Node>> {
    let node = Arc::new(
        Node::builder()
            .address("127.0.0.1", 8000)
            .bootstrap_address("127.0.0.1:8000")
            .initial_balance(balance)
            .with_transport(transport.clone())
            .bootstrap(session)
            .build()?,
    );
    transport.register(node.address(), &node);
    Ok(node)
}

async fn local_peer(transport: &Arc<LocalTransport>, port: u16, balance: i64) -> Result<Arc<Node>> {
    let node = Arc::new(
        Node::builder()
            .address("127.0.0.1", port)
            .bootstrap_address("127.0.0.1:8000")
            .initial_balance(balance)
            .with_transport(transport.clone())
            .build()?,
    );
    transport.register(node.address(), &node);
    Ok(node)
}

#[tokio::test]
async fn test_ring_distributed_once_complete() -> Result<()> {
    let transport = LocalTransport::new();
    let bootstrap = local_bootstrap(&transport, SessionConfig::new(3, 5)?, 0).await?;
    let first = local_peer(&transport, 8001, 0).await?;
    let second = local_peer(&transport, 8002, 0).await?;

    assert_eq!(first.join().await?, NodeId(1));
    // Ring not complete yet, nothing has been pushed.
    assert_eq!(first.ring().await.len(), 0);
    assert!(first.chain().await.is_none());

    assert_eq!(second.join().await?, NodeId(2));
    let ring = bootstrap.ring().await;
    assert_eq!(ring.len(), 3);
    for node in [&first, &second] {
        assert_eq!(node.ring().await, ring);
        assert_eq!(node.session().await, bootstrap.session().await);
        let chain = node.chain().await.expect("chain posted");
        assert_eq!(chain.len(), 1);
        assert!(chain.tip().is_genesis());
    }
    assert_eq!(ring.get(NodeId(2)).map(|e| e.port), Some(8002));

    let late = local_peer(&transport, 8003, 0).await?;
    assert!(late.join().await.is_err());
    assert_eq!(bootstrap.ring().await.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_genesis_reserved_for_bootstrap() -> Result<()> {
    assert!(matches!(Blockchain::new(NodeId(1), 5), Err(BlockchatError::NotBootstrap)));

    let transport = LocalTransport::new();
    let _bootstrap = local_bootstrap(&transport, SessionConfig::new(2, 5)?, 0).await?;
    let peer = local_peer(&transport, 8001, 0).await?;
    peer.join().await?;
    assert!(matches!(peer.distribute().await, Err(BlockchatError::NotBootstrap)));
    assert!(matches!(peer.share_chain(NodeId(0)).await, Err(BlockchatError::NotBootstrap)));
    Ok(())
}

#[tokio::test]
async fn test_ask_chain_refreshes_copy() -> Result<()> {
    let transport = LocalTransport::new();
    let bootstrap = local_bootstrap(&transport, SessionConfig::new(2, 2)?, 1000).await?;
    let peer = local_peer(&transport, 8001, 0).await?;
    peer.join().await?;

    for _ in 0..2 {
        bootstrap.make_transaction(NodeId(1), Some(5), None).await?;
    }
    assert_eq!(bootstrap.chain().await.map(|c| c.len()), Some(2));
    assert_eq!(peer.chain().await.map(|c| c.len()), Some(1));

    peer.ask_chain().await?;
    let copy = peer.chain().await.expect("chain");
    assert_eq!(copy.len(), 2);
    assert!(copy.is_valid());
    assert_eq!(copy.tip().hash(), bootstrap.chain().await.expect("chain").tip().hash());
    Ok(())
}

#[tokio::test]
async fn test_tampered_chain_refused() -> Result<()> {
    let transport = LocalTransport::new();
    let bootstrap = local_bootstrap(&transport, SessionConfig::new(2, 1)?, 1000).await?;
    let peer = local_peer(&transport, 8001, 0).await?;
    peer.join().await?;
    bootstrap.make_transaction(NodeId(1), Some(5), None).await?;

    let mut blocks = bootstrap.chain().await.expect("chain").into_blocks();
    blocks.swap(0, 1);
    match peer.handle(PeerRequest::PostChain { blocks }).await {
        PeerResponse::Failure { reason } => assert!(reason.contains("Chain integrity")),
        other => panic!("unexpected response {:?}", other),
    }
    assert_eq!(peer.chain().await.map(|c| c.len()), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_nodes_over_tcp() -> Result<()> {
    let bootstrap_listener = TcpListener::bind("127.0.0.1:0").await?;
    let peer_listener = TcpListener::bind("127.0.0.1:0").await?;
    let bootstrap_address = bootstrap_listener.local_addr()?;
    let peer_address = peer_listener.local_addr()?;

    let bootstrap = Arc::new(
        Node::builder()
            .address("127.0.0.1", bootstrap_address.port())
            .bootstrap_address(bootstrap_address.to_string())
            .initial_balance(1000)
            .bootstrap(SessionConfig::new(2, 5)?)
            .build()?,
    );
    let peer = Arc::new(
        Node::builder()
            .address("127.0.0.1", peer_address.port())
            .bootstrap_address(bootstrap_address.to_string())
            .initial_balance(1000)
            .build()?,
    );
    tokio::spawn(serve(bootstrap_listener, bootstrap.clone()));
    tokio::spawn(serve(peer_listener, peer.clone()));

    assert_eq!(peer.join().await?, NodeId(1));
    assert_eq!(peer.ring().await, bootstrap.ring().await);

    let client = TcpTransport::new();
    let request = PeerRequest::MakeTransaction {
        recipient_id: NodeId(1),
        amount: Some(100),
        message: Some("rent".to_string()),
    };
    match client.send(&bootstrap_address.to_string(), request).await?.into_result()? {
        PeerResponse::TransactionMade(receipt) => {
            assert_eq!(receipt.nonce, 1);
            assert_eq!(receipt.cost, 107);
            assert!(receipt.recipient_credited);
        },
        other => panic!("unexpected response {:?}", other),
    }

    assert_eq!(bootstrap.balance().await, 893);
    match client.send(&peer_address.to_string(), PeerRequest::GetBalance).await? {
        PeerResponse::Balance { balance } => assert_eq!(balance, 1100),
        other => panic!("unexpected response {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_ask_chain_keeps_longer_local_chain() -> Result<()> {
    let transport = LocalTransport::new();
    let bootstrap = local_bootstrap(&transport, SessionConfig::new(2, 1)?, 0).await?;
    let peer = local_peer(&transport, 8001, 1000).await?;
    peer.join().await?;

    for _ in 0..3 {
        peer.make_transaction(NodeId(0), Some(1), None).await?;
    }
    assert_eq!(peer.chain().await.map(|c| c.len()), Some(4));
    assert_eq!(bootstrap.chain().await.map(|c| c.len()), Some(1));

    assert!(peer.ask_chain().await.is_err());
    let chain = peer.chain().await.expect("chain");
    assert_eq!(chain.len(), 4);
    assert!(chain.is_valid());
    Ok(())
}

#[tokio::test]
async fn test_bootstrap_refuses_posted_chain() -> Result<()> {
    let transport = LocalTransport::new();
    let bootstrap = local_bootstrap(&transport, SessionConfig::new(2, 1)?, 1000).await?;
    let peer = local_peer(&transport, 8001, 0).await?;
    peer.join().await?;
    for _ in 0..2 {
        bootstrap.make_transaction(NodeId(1), Some(5), None).await?;
    }

    let chain = bootstrap.chain().await.expect("chain");
    assert_eq!(chain.len(), 3);
    let genesis_only = chain.blocks()[..1].to_vec();
    match bootstrap.handle(PeerRequest::PostChain { blocks: genesis_only }).await {
        PeerResponse::Failure { reason } => assert!(reason.contains("owns the chain")),
        other => panic!("unexpected response {:?}", other),
    }
    assert_eq!(bootstrap.chain().await.map(|c| c.len()), Some(3));
    Ok(())
}

#[tokio::test]
async fn test_peer_refuses_shorter_chain() -> Result<()> {
    let transport = LocalTransport::new();
    let bootstrap = local_bootstrap(&transport, SessionConfig::new(2, 1)?, 1000).await?;
    let peer = local_peer(&transport, 8001, 0).await?;
    peer.join().await?;
    bootstrap.make_transaction(NodeId(1), Some(5), None).await?;
    peer.ask_chain().await?;
    assert_eq!(peer.chain().await.map(|c| c.len()), Some(2));

    let genesis_only = bootstrap.chain().await.expect("chain").blocks()[..1].to_vec();
    match peer.handle(PeerRequest::PostChain { blocks: genesis_only }).await {
        PeerResponse::Failure { reason } => assert!(reason.contains("shorter")),
        other => panic!("unexpected response {:?}", other),
    }
    assert_eq!(peer.chain().await.map(|c| c.len()), Some(2));
    Ok(())
}
