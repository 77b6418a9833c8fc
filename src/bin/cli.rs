//! BlockChat CLI application

use anyhow::{bail, Context};
use blockchat_rust::{
    config::{DEFAULT_BLOCK_CAPACITY, DEFAULT_BOOTSTRAP_ADDRESS},
    crypto::KeyType,
    network::serve,
    Node, NodeConfig, NodeId, PeerRequest, PeerResponse, PeerTransport, SessionConfig,
    TcpTransport, Wallet,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "blockchat-cli")]
#[command(about = "A minimal peer-to-peer ledger with unanimous broadcast validation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a BlockChat node
    Start {
        /// Address to advertise and listen on
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,

        /// Port to listen on
        #[arg(short, long, default_value_t = blockchat_rust::DEFAULT_PORT)]
        port: u16,

        /// Run as the bootstrap node of a new session
        #[arg(short, long)]
        bootstrap: bool,

        /// Total number of nodes in the session (bootstrap only)
        #[arg(short = 'n', long, default_value_t = 1)]
        nodes: usize,

        /// Transactions per block (bootstrap only)
        #[arg(short, long, default_value_t = DEFAULT_BLOCK_CAPACITY)]
        capacity: usize,

        /// Where the bootstrap node listens
        #[arg(long, default_value = DEFAULT_BOOTSTRAP_ADDRESS)]
        bootstrap_address: String,

        /// Starting wallet balance
        #[arg(long, default_value_t = 0)]
        balance: i64,

        /// Private key file; a fresh key is generated when omitted
        #[arg(short, long)]
        key: Option<PathBuf>,

        /// Per-peer validation timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,

        /// Retries after a failed validation request
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
    /// Ask a running node to send coins and/or a message
    Send {
        /// Address of the sending node
        #[arg(long, default_value = DEFAULT_BOOTSTRAP_ADDRESS)]
        node: String,

        /// Recipient node id
        #[arg(short, long)]
        to: u32,

        /// Coins to transfer
        #[arg(short, long)]
        amount: Option<u64>,

        /// Message to deliver
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Show the balance of a running node
    Balance {
        /// Address of the node
        #[arg(long, default_value = DEFAULT_BOOTSTRAP_ADDRESS)]
        node: String,
    },
    /// Generate a new private key file
    Keygen {
        /// Output file
        #[arg(short, long)]
        out: PathBuf,

        /// ed25519 or secp256k1
        #[arg(long, default_value = "ed25519")]
        key_type: KeyType,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Start {
            ip,
            port,
            bootstrap,
            nodes,
            capacity,
            bootstrap_address,
            balance,
            key,
            timeout_ms,
            retries,
        } => {
            let wallet = match key {
                Some(path) => Wallet::load_key(&path, balance)
                    .with_context(|| format!("loading key from {}", path.display()))?,
                None => Wallet::new(balance),
            };
            let config = NodeConfig {
                ip,
                port,
                bootstrap_address,
                validation_timeout: Duration::from_millis(timeout_ms),
                validation_retries: retries,
                initial_balance: balance,
            };

            let mut builder = Node::builder()
                .with_config(config)
                .with_wallet(wallet)
                .with_transport(Arc::new(TcpTransport::new()));
            if bootstrap {
                builder = builder.bootstrap(SessionConfig::new(nodes, capacity)?);
            }
            let node = Arc::new(builder.build()?);

            let listener = TcpListener::bind(("0.0.0.0", port)).await?;
            let server = tokio::spawn(serve(listener, node.clone()));

            let id = node.join().await?;
            info!("Node {} listening on {}", id, node.address());

            tokio::select! {
                result = server => {
                    if let Ok(Err(e)) = result {
                        error!("Server stopped: {}", e);
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down node...");
                },
            }
        },
        Commands::Send {
            node,
            to,
            amount,
            message,
        } => {
            let request = PeerRequest::MakeTransaction {
                recipient_id: NodeId(to),
                amount,
                message,
            };
            match TcpTransport::new().send(&node, request).await?.into_result()? {
                PeerResponse::TransactionMade(receipt) => {
                    println!("Transaction {}", receipt.hash);
                    println!("Nonce: {}", receipt.nonce);
                    println!("Cost: {}", receipt.cost);
                    if !receipt.recipient_credited {
                        println!("Warning: recipient could not be credited");
                    }
                },
                other => bail!("unexpected response {:?}", other),
            }
        },
        Commands::Balance { node } => {
            match TcpTransport::new()
                .send(&node, PeerRequest::GetBalance)
                .await?
                .into_result()?
            {
                PeerResponse::Balance { balance } => println!("Balance: {}", balance),
                other => bail!("unexpected response {:?}", other),
            }
        },
        Commands::Keygen { out, key_type } => {
            let wallet = Wallet::with_key_type(key_type, 0);
            wallet.save_key(&out)?;
            println!("Generated new {} key in {}", key_type.as_str(), out.display());
            println!("Public key: {}", wallet.public_key().to_hex());
        },
        Commands::Version => {
            println!("BlockChat Rust v{}", blockchat_rust::VERSION);
        },
    }

    Ok(())
}
