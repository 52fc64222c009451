//! Cosigner CLI Application
//!
//! A command-line interface for shared multisignature wallets.

use clap::{Parser, Subcommand};
use cosigner::cli::{self, AppState, CreateArgs, Decision, NodeArgs};
use cosigner::multisig::NetworkKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cosigner")]
#[command(version)]
#[command(about = "Coordinate M-of-N multisignature wallets between copayers", long_about = None)]
struct Cli {
    /// Data directory for wallet files
    #[arg(short, long, default_value = ".cosigner_data")]
    data_dir: PathBuf,

    /// Insight-compatible blockchain API
    #[arg(long, default_value = "http://localhost:3001")]
    insight_url: String,

    /// Refuse wallets on any other network
    #[arg(long)]
    force_network: Option<NetworkKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a wallet, or this copayer's copy of a shared one
    Create {
        /// Wallet id shared by all copayers (random if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Wallet name
        #[arg(long)]
        name: Option<String>,

        /// Our nickname as seen by the other copayers
        #[arg(long)]
        nickname: Option<String>,

        /// livenet or testnet
        #[arg(long, default_value = "testnet")]
        network: NetworkKind,

        /// Signatures required
        #[arg(short, default_value = "2")]
        m: u8,

        /// Total copayers
        #[arg(short, default_value = "3")]
        n: u8,

        /// Allow spending unconfirmed outputs
        #[arg(long)]
        spend_unconfirmed: bool,
    },

    /// List stored wallets
    List,

    /// Show wallet details
    Info {
        /// Wallet id
        wallet: String,
    },

    /// Generate or list addresses
    Address {
        /// Wallet id
        wallet: String,

        /// Generate a change address
        #[arg(long)]
        change: bool,

        /// List known addresses instead
        #[arg(short, long)]
        list: bool,
    },

    /// Show the balance
    Balance {
        /// Wallet id
        wallet: String,
    },

    /// Propose a payment
    Propose {
        /// Wallet id
        wallet: String,

        /// Recipient address
        #[arg(short, long)]
        to: String,

        /// Amount in satoshis
        #[arg(short, long)]
        amount: u64,

        /// Note for the other copayers
        #[arg(short, long)]
        comment: Option<String>,

        /// Pay change here instead of a fresh change address
        #[arg(long)]
        change: Option<String>,
    },

    /// List transaction proposals
    Proposals {
        /// Wallet id
        wallet: String,
    },

    /// Sign a proposal
    Sign { wallet: String, ntxid: String },

    /// Reject a proposal
    Reject { wallet: String, ntxid: String },

    /// Broadcast a fully signed proposal
    Send { wallet: String, ntxid: String },

    /// Export a wallet backup
    Export {
        /// Wallet id
        wallet: String,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Run the wallet and sync with copayers over TCP
    Node {
        /// Wallet id
        wallet: String,

        /// Port to listen on
        #[arg(short, long, default_value = "8333")]
        port: u16,

        /// Copayer address as copayer_id=host:port (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Join secret of the copayer who invited us
        #[arg(long)]
        join: Option<String>,

        /// Address of the inviting copayer
        #[arg(long, requires = "join")]
        join_addr: Option<String>,
    },

    /// Run a 2-of-3 wallet between three in-process copayers
    Demo,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    if let Commands::Demo = cli.command {
        return rt.block_on(cli::cmd_demo());
    }

    let state = AppState::new(cli.data_dir.clone(), cli.insight_url.clone(), cli.force_network)?;

    rt.block_on(async {
        match cli.command {
            Commands::Demo => unreachable!(),

            Commands::Create {
                id,
                name,
                nickname,
                network,
                m,
                n,
                spend_unconfirmed,
            } => {
                cli::cmd_create(
                    &state,
                    CreateArgs {
                        id,
                        name,
                        nickname,
                        network,
                        required: m,
                        total: n,
                        spend_unconfirmed,
                    },
                )
                .await
            }

            Commands::List => cli::cmd_list(&state),

            Commands::Info { wallet } => cli::cmd_info(&state, &wallet).await,

            Commands::Address {
                wallet,
                change,
                list,
            } => cli::cmd_address(&state, &wallet, change, list).await,

            Commands::Balance { wallet } => cli::cmd_balance(&state, &wallet).await,

            Commands::Propose {
                wallet,
                to,
                amount,
                comment,
                change,
            } => cli::cmd_propose(&state, &wallet, &to, amount, comment, change).await,

            Commands::Proposals { wallet } => cli::cmd_proposals(&state, &wallet).await,

            Commands::Sign { wallet, ntxid } => {
                cli::cmd_decide(&state, &wallet, &ntxid, Decision::Sign).await
            }

            Commands::Reject { wallet, ntxid } => {
                cli::cmd_decide(&state, &wallet, &ntxid, Decision::Reject).await
            }

            Commands::Send { wallet, ntxid } => {
                cli::cmd_decide(&state, &wallet, &ntxid, Decision::Send).await
            }

            Commands::Export { wallet, output } => cli::cmd_export(&state, &wallet, &output).await,

            Commands::Node {
                wallet,
                port,
                peers,
                join,
                join_addr,
            } => {
                cli::cmd_node(
                    &state,
                    &wallet,
                    NodeArgs {
                        port,
                        peers,
                        join,
                        join_addr,
                    },
                )
                .await
            }
        }
    })
}
