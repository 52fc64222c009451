//! CLI commands for the wallet engine
//!
//! Implements all command handlers for the CLI interface.

use crate::blockchain::{InsightClient, MemoryChain, UnspentOutput};
use crate::multisig::{Address, CopayerSigner, NetworkKind};
use crate::network::{MemoryHub, MemoryNetwork, Network, TcpConfig, TcpNetwork};
use crate::storage::{FileStorage, MemoryStorage, Storage, StorageConfig};
use crate::wallet::{
    Collaborators, EngineConfig, Wallet, WalletEvent, WalletHandle, WalletInfo, WalletOptions,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Application state
pub struct AppState {
    pub data_dir: PathBuf,
    pub storage: Arc<FileStorage>,
    pub insight_url: String,
    pub config: EngineConfig,
}

impl AppState {
    pub fn new(data_dir: PathBuf, insight_url: String, network: Option<NetworkKind>) -> CliResult<Self> {
        let storage = FileStorage::new(StorageConfig {
            data_dir: data_dir.clone(),
            ..Default::default()
        })?;
        let config = EngineConfig {
            force_network: network,
            ..Default::default()
        };

        Ok(Self {
            data_dir,
            storage: Arc::new(storage),
            insight_url,
            config,
        })
    }

    /// File storage and the Insight service behind `network`
    fn collaborators(&self, network: Arc<dyn Network>) -> CliResult<Collaborators> {
        Ok(Collaborators {
            network,
            blockchain: Arc::new(InsightClient::new(&self.insight_url)?),
            storage: self.storage.clone(),
        })
    }

    /// Collaborators for commands that never go online
    fn offline(&self) -> CliResult<Collaborators> {
        self.collaborators(Arc::new(MemoryNetwork::new(MemoryHub::new())))
    }

    async fn load(&self, wallet_id: &str) -> CliResult<Wallet> {
        Ok(Wallet::load(wallet_id, self.config.clone(), self.offline()?).await?)
    }
}

/// Options of `create`
pub struct CreateArgs {
    pub id: Option<String>,
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub network: NetworkKind,
    pub required: u8,
    pub total: u8,
    pub spend_unconfirmed: bool,
}

/// Create a new wallet, or this copayer's replica of an existing one
pub async fn cmd_create(state: &AppState, args: CreateArgs) -> CliResult<()> {
    let mut options = WalletOptions::new()
        .network(args.network)
        .copayers(args.required, args.total)
        .spend_unconfirmed(args.spend_unconfirmed)
        .version(env!("CARGO_PKG_VERSION"))
        .reconnect_delay(Duration::from_millis(
            crate::wallet::DEFAULT_RECONNECT_DELAY_MS,
        ))
        .signer(CopayerSigner::generate());
    if let Some(id) = args.id {
        options = options.id(id);
    }
    if let Some(name) = args.name {
        options = options.name(name);
    }
    if let Some(nickname) = args.nickname {
        options = options.nickname(nickname);
    }

    let wallet = Wallet::create(options, state.config.clone(), state.offline()?).await?;

    println!("🔐 New wallet created!");
    println!("   🆔 Wallet id: {}", wallet.id());
    println!(
        "   👥 Copayers: {}-of-{} on {}",
        wallet.keyring().required(),
        wallet.keyring().total(),
        wallet.network_kind()
    );
    println!("   🔑 Copayer id: {}", wallet.copayer_id());
    println!("   🤝 Join secret: {}", wallet.secret());
    println!("   📁 Data directory: {:?}", state.data_dir);
    println!("\n   ⚠️  IMPORTANT: The wallet file holds your private key.");
    println!("   Back up the data directory to avoid losing access to your funds!");

    Ok(())
}

fn print_info(info: &WalletInfo) {
    println!("👛 Wallet {} ({})", info.name, info.id);
    println!("   ├─ Network: {}", info.network);
    println!("   ├─ Copayers: {}-of-{}", info.required, info.total);
    println!("   ├─ Complete: {}", info.complete);
    println!("   ├─ Backed up: {}", info.ready);
    println!("   ├─ Copayer id: {}", info.copayer_id);
    println!("   └─ Join secret: {}", info.secret);

    println!("\n   Copayers:");
    for copayer in &info.copayers {
        let marker = if copayer.copayer_id == info.copayer_id { " (me)" } else { "" };
        println!(
            "   └─ #{} {} {}{}",
            copayer.index,
            copayer.nickname.as_deref().unwrap_or("-"),
            copayer.copayer_id,
            marker
        );
    }
    if !info.online_peers.is_empty() {
        println!("\n   Online peers: {}", info.online_peers.join(", "));
    }
}

/// List stored wallets
pub fn cmd_list(state: &AppState) -> CliResult<()> {
    let ids = state.storage.list()?;
    if ids.is_empty() {
        println!("📭 No wallets found. Create one with: cosigner create");
        return Ok(());
    }

    println!("📋 Wallets:");
    for id in &ids {
        let snapshot = state.storage.load(id)?;
        println!(
            "   {} ({}) - {}-of-{}",
            id,
            snapshot.opts.display_name(),
            snapshot.opts.required_copayers,
            snapshot.opts.total_copayers
        );
    }
    Ok(())
}

/// Show wallet details
pub async fn cmd_info(state: &AppState, wallet_id: &str) -> CliResult<()> {
    let wallet = state.load(wallet_id).await?;
    print_info(&wallet.info().await);
    Ok(())
}

/// Generate a new address, or list the known ones
pub async fn cmd_address(state: &AppState, wallet_id: &str, change: bool, list: bool) -> CliResult<()> {
    let mut wallet = state.load(wallet_id).await?;

    if list {
        let addresses = wallet.addresses_info()?;
        if addresses.is_empty() {
            println!("📭 No addresses yet (addresses need a complete key ring)");
        }
        for info in addresses {
            println!(
                "   {} {} {}{}",
                info.path,
                info.address,
                if info.is_change { "change" } else { "receive" },
                if info.owned { "" } else { " (copayer)" }
            );
        }
        return Ok(());
    }

    let address = wallet.generate_address(change).await?;
    println!("📍 New {} address: {}", if change { "change" } else { "receive" }, address);
    Ok(())
}

/// List transaction proposals
pub async fn cmd_proposals(state: &AppState, wallet_id: &str) -> CliResult<()> {
    let wallet = state.load(wallet_id).await?;
    let views = wallet.proposals_view();
    if views.is_empty() {
        println!("📭 No transaction proposals");
        return Ok(());
    }

    println!("📋 Proposals ({}):", views.len());
    for view in views {
        let tx = &view.proposal.tx;
        println!("\n   {} [{:?}]", view.ntxid, view.status);
        println!("   ├─ Creator: {}", view.proposal.creator);
        for output in &tx.outputs {
            println!("   ├─ Pays {} to {}", output.amount, output.address);
        }
        println!("   ├─ Fee: {}", tx.fee());
        if let Some(comment) = &view.proposal.comment {
            println!("   ├─ Comment: {}", comment);
        }
        println!(
            "   ├─ Signed by {} / rejected by {}",
            view.proposal.signed_by.len(),
            view.proposal.rejected_by.len()
        );
        println!(
            "   └─ Signed by me: {}, rejected by me: {}",
            view.signed_by_us, view.rejected_by_us
        );
    }
    Ok(())
}

/// Show the wallet balance
pub async fn cmd_balance(state: &AppState, wallet_id: &str) -> CliResult<()> {
    let mut wallet = state.load(wallet_id).await?;
    let balance = wallet.get_balance().await?;

    println!("💰 Balance of {}", wallet_id);
    println!("   ├─ Total: {} sat", balance.total);
    println!("   └─ Spendable: {} sat", balance.safe);
    for (address, amount) in &balance.by_address {
        println!("      {} {}", address, amount);
    }
    Ok(())
}

/// Draft a payment; copayers receive it the next time the node runs
pub async fn cmd_propose(
    state: &AppState,
    wallet_id: &str,
    to: &str,
    amount: u64,
    comment: Option<String>,
    change: Option<String>,
) -> CliResult<()> {
    let change = change.as_deref().map(Address::parse).transpose()?;
    let mut wallet = state.load(wallet_id).await?;
    let ntxid = wallet.create_tx_with_change(to, amount, comment, change).await?;
    println!("📝 Proposal {} created ({} sat to {})", ntxid, amount, to);
    Ok(())
}

/// Sign, reject or broadcast a proposal
pub async fn cmd_decide(state: &AppState, wallet_id: &str, ntxid: &str, decision: Decision) -> CliResult<()> {
    let mut wallet = state.load(wallet_id).await?;
    match decision {
        Decision::Sign => {
            if wallet.sign(ntxid).await? {
                println!("✍️  Signed {}", ntxid);
            } else {
                println!("ℹ️  Already signed {}", ntxid);
            }
        }
        Decision::Reject => {
            wallet.reject(ntxid).await?;
            println!("🚫 Rejected {}", ntxid);
        }
        Decision::Send => match wallet.send_tx(ntxid).await? {
            Some(txid) => println!("🚀 Broadcast as {}", txid),
            None => println!("⚠️  The blockchain service did not accept {}", ntxid),
        },
    }
    Ok(())
}

/// What to do with a proposal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Sign,
    Reject,
    Send,
}

/// Write a wallet backup
pub async fn cmd_export(state: &AppState, wallet_id: &str, output: &Path) -> CliResult<()> {
    let wallet = state.load(wallet_id).await?;
    let data = wallet.export().await?;
    std::fs::write(output, &data)?;
    println!("💾 Exported wallet {} to {:?} ({} bytes)", wallet_id, output, data.len());
    Ok(())
}

/// Options of `node`
pub struct NodeArgs {
    pub port: u16,
    /// `copayer_id=host:port`
    pub peers: Vec<String>,
    pub join: Option<String>,
    pub join_addr: Option<String>,
}

/// Run a wallet on the TCP transport until Ctrl+C
pub async fn cmd_node(state: &AppState, wallet_id: &str, args: NodeArgs) -> CliResult<()> {
    let mut peer_addrs = BTreeMap::new();
    for peer in &args.peers {
        let (id, addr) = peer
            .split_once('=')
            .ok_or_else(|| format!("peer must be copayer_id=host:port, got {}", peer))?;
        peer_addrs.insert(id.to_string(), addr.to_string());
    }
    let inviter = match &args.join {
        Some(secret) => {
            let copayer_id = Wallet::decode_secret(secret)?;
            if let Some(addr) = &args.join_addr {
                peer_addrs.insert(copayer_id.clone(), addr.clone());
            }
            Some(copayer_id)
        }
        None => None,
    };

    let network = Arc::new(TcpNetwork::new(TcpConfig {
        listen_port: args.port,
        peer_addrs,
    }));
    let mut wallet = Wallet::load(wallet_id, state.config.clone(), state.collaborators(network.clone())?).await?;
    if let Some(inviter) = inviter {
        wallet.seed_copayer(inviter);
    }

    let (handle, task) = wallet.spawn().await?;
    let port = network.local_port().await.unwrap_or(args.port);
    println!("🌐 Wallet {} listening on port {}", wallet_id, port);
    println!("   Press Ctrl+C to stop");

    let mut events = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log_event(&event);
        }
    });

    tokio::signal::ctrl_c().await?;
    println!("\n📴 Shutting down...");
    handle.shutdown().await?;
    task.await?;
    Ok(())
}

fn log_event(event: &WalletEvent) {
    match event {
        WalletEvent::BadMessage { sender, violation }
        | WalletEvent::ConnectionError { sender, violation }
        | WalletEvent::CorruptProposal { sender, violation }
        | WalletEvent::ProtocolViolation { sender, violation } => {
            log::warn!("{}: {}", sender, violation)
        }
        other => log::info!("{:?}", other),
    }
}

async fn demo_wallet(hub: &MemoryHub, chain: &MemoryChain, nickname: &str) -> CliResult<Wallet> {
    let options = WalletOptions::new()
        .id("de300000")
        .name("demo")
        .nickname(nickname)
        .network(NetworkKind::Testnet)
        .copayers(2, 3)
        .spend_unconfirmed(false)
        .version(env!("CARGO_PKG_VERSION"))
        .reconnect_delay(Duration::from_millis(100))
        .signer(CopayerSigner::generate());
    let collaborators = Collaborators {
        network: Arc::new(MemoryNetwork::new(hub.clone())),
        blockchain: Arc::new(chain.clone()),
        storage: Arc::new(MemoryStorage::new()),
    };
    Ok(Wallet::create(options, EngineConfig::default(), collaborators).await?)
}

async fn wait_for<F, Fut>(what: &str, mut check: F) -> CliResult<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = CliResult<bool>>,
{
    for _ in 0..500 {
        if check().await? {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err(format!("timed out waiting for {}", what).into())
}

/// In-process 2-of-3 round trip
pub async fn cmd_demo() -> CliResult<()> {
    let hub = MemoryHub::new();
    let chain = MemoryChain::new();

    println!("🧪 Creating a 2-of-3 wallet with three copayers...");
    let alice = demo_wallet(&hub, &chain, "alice").await?;
    let secret = alice.secret();
    let inviter = Wallet::decode_secret(&secret)?;
    let (alice, alice_task) = alice.spawn().await?;

    let mut handles: Vec<WalletHandle> = vec![alice];
    let mut tasks = vec![alice_task];
    for nickname in ["bob", "carol"] {
        let mut wallet = demo_wallet(&hub, &chain, nickname).await?;
        wallet.seed_copayer(inviter.clone());
        let (handle, task) = wallet.spawn().await?;
        handles.push(handle);
        tasks.push(task);
    }

    let copayers = &handles;
    wait_for("key ring exchange", move || async move {
        for handle in copayers {
            if !handle.info().await?.complete {
                return Ok(false);
            }
        }
        Ok::<_, Box<dyn std::error::Error>>(true)
    })
    .await?;
    print_info(&handles[0].info().await?);

    let address = handles[0].generate_address(false).await?;
    chain
        .add_unspent(UnspentOutput {
            address: address.clone(),
            txid: "d3".repeat(32),
            vout: 0,
            amount: 0.1,
            confirmations: 6,
            script_pub_key: None,
        })
        .await;
    let balance = handles[0].balance().await?;
    println!("\n💰 Funded {} with {} satoshis", address, balance.total);

    let to = handles[2].generate_address(false).await?;
    let ntxid = handles[0]
        .create_tx(to.clone(), 2_500_000, Some("demo payment".to_string()))
        .await?;
    println!("📝 Alice proposed {} (2 500 000 sat to {})", ntxid, to);

    let bob = &handles[1];
    let id = &ntxid;
    wait_for("the proposal to reach bob", move || async move {
        let views = bob.proposals().await?;
        Ok::<_, Box<dyn std::error::Error>>(views.iter().any(|view| view.ntxid == *id))
    })
    .await?;
    bob.sign(ntxid.clone()).await?;
    println!("✍️  Bob signed");

    let txid = bob.send_tx(ntxid.clone()).await?;
    match &txid {
        Some(txid) => println!("🚀 Broadcast as {}", txid),
        None => println!("⚠️  The chain did not return a transaction id"),
    }
    if let Some(raw) = chain.broadcasts().await.last() {
        println!("   Raw transaction: {}...", &raw[..raw.len().min(64)]);
    }

    let carol = &handles[2];
    wait_for("carol to see the transaction sent", move || async move {
        let views = carol.proposals().await?;
        Ok::<_, Box<dyn std::error::Error>>(
            views
                .iter()
                .any(|view| view.ntxid == *id && view.proposal.is_sent()),
        )
    })
    .await?;
    println!("✅ All copayers agree the proposal was sent");

    for handle in &handles {
        handle.shutdown().await?;
    }
    for task in tasks {
        task.await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_and_load() {
        let dir = TempDir::new().unwrap();
        let state = AppState::new(
            dir.path().to_path_buf(),
            "http://localhost:3001".to_string(),
            None,
        )
        .unwrap();

        cmd_create(
            &state,
            CreateArgs {
                id: Some("c0ffee00".to_string()),
                name: Some("office".to_string()),
                nickname: None,
                network: NetworkKind::Testnet,
                required: 2,
                total: 3,
                spend_unconfirmed: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(state.storage.list().unwrap(), vec!["c0ffee00".to_string()]);
        let wallet = state.load("c0ffee00").await.unwrap();
        assert_eq!(wallet.identity().display_name(), "office");

        let output = dir.path().join("backup.json");
        cmd_export(&state, "c0ffee00", &output).await.unwrap();
        assert!(output.exists());
    }

    #[tokio::test]
    async fn test_demo() {
        cmd_demo().await.unwrap();
    }
}
