//! Wallet actor
//!
//! A running wallet owns its state on a single task. Transport events,
//! user commands and timers are handled one at a time, so no handler ever
//! observes another one halfway through.

use crate::multisig::{Address, NetworkKind};
use crate::network::NetworkEvent;
use crate::wallet::balance::Balance;
use crate::wallet::connection::CopayerInfo;
use crate::wallet::error::WalletError;
use crate::wallet::events::WalletEvent;
use crate::wallet::lifecycle::{AddressInfo, ProposalView};
use crate::wallet::wallet::Wallet;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Capacity of the command queue
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, WalletError>>;

/// Requests served by a running wallet
pub enum WalletCommand {
    CreateTx {
        to: String,
        amount: u64,
        comment: Option<String>,
        change: Option<Address>,
        reply: Reply<String>,
    },
    Sign {
        ntxid: String,
        reply: Reply<bool>,
    },
    Reject {
        ntxid: String,
        reply: Reply<()>,
    },
    SendTx {
        ntxid: String,
        reply: Reply<Option<String>>,
    },
    GenerateAddress {
        change: bool,
        reply: Reply<String>,
    },
    SetAddressBook {
        address: String,
        label: String,
        reply: Reply<()>,
    },
    ToggleAddressBookEntry {
        address: String,
        reply: Reply<bool>,
    },
    SetBackupReady {
        reply: Reply<()>,
    },
    UpdateIndexes {
        reply: Reply<bool>,
    },
    Balance {
        reply: Reply<Balance>,
    },
    Proposals {
        reply: Reply<Vec<ProposalView>>,
    },
    Addresses {
        reply: Reply<Vec<AddressInfo>>,
    },
    Export {
        reply: Reply<Vec<u8>>,
    },
    Info {
        reply: Reply<WalletInfo>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Summary of a wallet for display
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletInfo {
    pub id: String,
    pub name: String,
    pub copayer_id: String,
    pub network: NetworkKind,
    pub required: u8,
    pub total: u8,
    pub copayers: Vec<CopayerInfo>,
    pub complete: bool,
    pub ready: bool,
    pub secret: String,
    pub online_peers: Vec<String>,
}

impl Wallet {
    pub async fn info(&self) -> WalletInfo {
        WalletInfo {
            id: self.identity.id.clone(),
            name: self.identity.display_name().to_string(),
            copayer_id: self.copayer_id.clone(),
            network: self.keyring.network(),
            required: self.keyring.required(),
            total: self.keyring.total(),
            copayers: self.registered_peer_ids(),
            complete: self.keyring.is_complete(),
            ready: self.is_ready(),
            secret: self.secret(),
            online_peers: self.online_peer_ids().await,
        }
    }

    /// Start the transport and run the wallet on its own task
    ///
    /// The task hands the wallet back once it shuts down.
    pub async fn spawn(mut self) -> Result<(WalletHandle, JoinHandle<Wallet>), WalletError> {
        let network_events = self.start_network().await?;
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = WalletHandle {
            wallet_id: self.identity.id.clone(),
            copayer_id: self.copayer_id.clone(),
            commands,
            events: self.events.clone(),
        };
        let task = tokio::spawn(self.run(network_events, command_rx));
        Ok((handle, task))
    }

    /// Event loop of a started wallet
    pub async fn run(
        mut self,
        mut network_events: mpsc::Receiver<NetworkEvent>,
        mut commands: mpsc::Receiver<WalletCommand>,
    ) -> Self {
        let grace = sleep(self.config.grace);
        tokio::pin!(grace);
        let mut grace_pending = true;

        let reconnect = sleep(Duration::ZERO);
        tokio::pin!(reconnect);
        let mut reconnect_armed = false;
        let mut network_open = true;

        loop {
            tokio::select! {
                _ = &mut grace, if grace_pending => {
                    grace_pending = false;
                    self.after_grace();
                    if let Some(delay) = self.reconnect_round().await {
                        reconnect.as_mut().reset(Instant::now() + delay);
                        reconnect_armed = true;
                    }
                }
                _ = &mut reconnect, if reconnect_armed => {
                    reconnect_armed = false;
                    if let Some(delay) = self.reconnect_round().await {
                        reconnect.as_mut().reset(Instant::now() + delay);
                        reconnect_armed = true;
                    } else {
                        log::info!("Wallet {} offline, reconnection stopped", self.identity.id);
                    }
                }
                event = network_events.recv(), if network_open => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_network_event(event).await {
                            log::error!("Failed to handle network event: {}", e);
                        }
                    }
                    None => network_open = false,
                },
                command = commands.recv() => match command {
                    Some(WalletCommand::Shutdown { reply }) => {
                        self.disconnect().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.disconnect().await;
                        break;
                    }
                },
            }
        }
        log::info!("Wallet {} stopped", self.identity.id);
        self
    }

    async fn handle_command(&mut self, command: WalletCommand) {
        match command {
            WalletCommand::CreateTx {
                to,
                amount,
                comment,
                change,
                reply,
            } => {
                let _ = reply.send(
                    self.create_tx_with_change(&to, amount, comment, change)
                        .await,
                );
            }
            WalletCommand::Sign { ntxid, reply } => {
                let _ = reply.send(self.sign(&ntxid).await);
            }
            WalletCommand::Reject { ntxid, reply } => {
                let _ = reply.send(self.reject(&ntxid).await);
            }
            WalletCommand::SendTx { ntxid, reply } => {
                let _ = reply.send(self.send_tx(&ntxid).await);
            }
            WalletCommand::GenerateAddress { change, reply } => {
                let _ = reply.send(self.generate_address(change).await);
            }
            WalletCommand::SetAddressBook {
                address,
                label,
                reply,
            } => {
                let _ = reply.send(self.set_address_book(&address, &label).await);
            }
            WalletCommand::ToggleAddressBookEntry { address, reply } => {
                let _ = reply.send(self.toggle_address_book_entry(&address).await);
            }
            WalletCommand::SetBackupReady { reply } => {
                let _ = reply.send(self.set_backup_ready().await);
            }
            WalletCommand::UpdateIndexes { reply } => {
                let _ = reply.send(self.update_indexes().await);
            }
            WalletCommand::Balance { reply } => {
                let _ = reply.send(self.get_balance().await);
            }
            WalletCommand::Proposals { reply } => {
                let _ = reply.send(Ok(self.proposals_view()));
            }
            WalletCommand::Addresses { reply } => {
                let _ = reply.send(self.addresses_info());
            }
            WalletCommand::Export { reply } => {
                let _ = reply.send(self.export().await);
            }
            WalletCommand::Info { reply } => {
                let _ = reply.send(Ok(self.info().await));
            }
            WalletCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

/// Cloneable front end of a running wallet
#[derive(Clone)]
pub struct WalletHandle {
    wallet_id: String,
    copayer_id: String,
    commands: mpsc::Sender<WalletCommand>,
    events: broadcast::Sender<WalletEvent>,
}

impl WalletHandle {
    pub fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    pub fn copayer_id(&self) -> &str {
        &self.copayer_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> WalletCommand,
    ) -> Result<T, WalletError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| WalletError::Stopped)?;
        response.await.map_err(|_| WalletError::Stopped)?
    }

    pub async fn create_tx(
        &self,
        to: impl Into<String>,
        amount: u64,
        comment: Option<String>,
    ) -> Result<String, WalletError> {
        self.create_tx_with_change(to, amount, comment, None).await
    }

    pub async fn create_tx_with_change(
        &self,
        to: impl Into<String>,
        amount: u64,
        comment: Option<String>,
        change: Option<Address>,
    ) -> Result<String, WalletError> {
        let to = to.into();
        self.request(|reply| WalletCommand::CreateTx {
            to,
            amount,
            comment,
            change,
            reply,
        })
        .await
    }

    pub async fn sign(&self, ntxid: impl Into<String>) -> Result<bool, WalletError> {
        let ntxid = ntxid.into();
        self.request(|reply| WalletCommand::Sign { ntxid, reply }).await
    }

    pub async fn reject(&self, ntxid: impl Into<String>) -> Result<(), WalletError> {
        let ntxid = ntxid.into();
        self.request(|reply| WalletCommand::Reject { ntxid, reply }).await
    }

    pub async fn send_tx(&self, ntxid: impl Into<String>) -> Result<Option<String>, WalletError> {
        let ntxid = ntxid.into();
        self.request(|reply| WalletCommand::SendTx { ntxid, reply }).await
    }

    pub async fn generate_address(&self, change: bool) -> Result<String, WalletError> {
        self.request(|reply| WalletCommand::GenerateAddress { change, reply })
            .await
    }

    pub async fn set_address_book(
        &self,
        address: impl Into<String>,
        label: impl Into<String>,
    ) -> Result<(), WalletError> {
        let (address, label) = (address.into(), label.into());
        self.request(|reply| WalletCommand::SetAddressBook {
            address,
            label,
            reply,
        })
        .await
    }

    pub async fn toggle_address_book_entry(
        &self,
        address: impl Into<String>,
    ) -> Result<bool, WalletError> {
        let address = address.into();
        self.request(|reply| WalletCommand::ToggleAddressBookEntry { address, reply })
            .await
    }

    pub async fn set_backup_ready(&self) -> Result<(), WalletError> {
        self.request(|reply| WalletCommand::SetBackupReady { reply })
            .await
    }

    pub async fn update_indexes(&self) -> Result<bool, WalletError> {
        self.request(|reply| WalletCommand::UpdateIndexes { reply })
            .await
    }

    pub async fn balance(&self) -> Result<Balance, WalletError> {
        self.request(|reply| WalletCommand::Balance { reply }).await
    }

    pub async fn proposals(&self) -> Result<Vec<ProposalView>, WalletError> {
        self.request(|reply| WalletCommand::Proposals { reply }).await
    }

    pub async fn addresses(&self) -> Result<Vec<AddressInfo>, WalletError> {
        self.request(|reply| WalletCommand::Addresses { reply }).await
    }

    pub async fn export(&self) -> Result<Vec<u8>, WalletError> {
        self.request(|reply| WalletCommand::Export { reply }).await
    }

    pub async fn info(&self) -> Result<WalletInfo, WalletError> {
        self.request(|reply| WalletCommand::Info { reply }).await
    }

    /// Disconnect and stop the wallet task
    pub async fn shutdown(&self) -> Result<(), WalletError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(WalletCommand::Shutdown { reply })
            .await
            .map_err(|_| WalletError::Stopped)?;
        done.await.map_err(|_| WalletError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{MemoryChain, UnspentOutput};
    use crate::multisig::ProposalStatus;
    use crate::network::MemoryHub;
    use crate::wallet::events::ProposalEventKind;
    use crate::wallet::wallet::tests::{options, test_wallet};
    use tokio::time::timeout;

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        timeout(Duration::from_secs(5), async {
            while !check().await {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_join_and_spend() {
        let hub = MemoryHub::new();
        let chain = MemoryChain::new();
        let alice = test_wallet(&hub, &chain, options("cafe0001", 2, 2)).await;
        let mut bob = test_wallet(&hub, &chain, options("cafe0001", 2, 2)).await;

        let (alice_handle, alice_task) = alice.wallet.spawn().await.unwrap();
        let secret = alice_handle.info().await.unwrap().secret;
        bob.wallet
            .seed_copayer(Wallet::decode_secret(&secret).unwrap());
        let (bob_handle, bob_task) = bob.wallet.spawn().await.unwrap();
        let mut bob_events = bob_handle.subscribe();
        let (a, b) = (&alice_handle, &bob_handle);

        wait_until(move || async move {
            a.info().await.unwrap().complete && b.info().await.unwrap().complete
        })
        .await;
        assert_eq!(bob_handle.info().await.unwrap().copayers.len(), 2);

        let address = alice_handle.generate_address(false).await.unwrap();
        chain
            .add_unspent(UnspentOutput {
                address: address.clone(),
                txid: "ef".repeat(32),
                vout: 0,
                amount: 0.05,
                confirmations: 2,
                script_pub_key: None,
            })
            .await;
        let ntxid = alice_handle
            .create_tx(address.clone(), 1_000_000, Some("test".to_string()))
            .await
            .unwrap();

        let id = &ntxid;
        wait_until(move || async move {
            b.proposals()
                .await
                .unwrap()
                .iter()
                .any(|view| view.ntxid == *id)
        })
        .await;
        assert!(bob_handle.sign(ntxid.clone()).await.unwrap());
        let txid = bob_handle.send_tx(ntxid.clone()).await.unwrap().unwrap();

        // Alice learns the proposal went out
        wait_until(move || async move {
            a.proposals().await.unwrap()[0].status == ProposalStatus::Sent
        })
        .await;
        let views = alice_handle.proposals().await.unwrap();
        assert_eq!(views[0].proposal.sent_txid.as_deref(), Some(txid.as_str()));

        let mut saw_new = false;
        while let Ok(event) = bob_events.try_recv() {
            if let WalletEvent::TxProposalEvent {
                kind: ProposalEventKind::New,
                ..
            } = event
            {
                saw_new = true;
            }
        }
        assert!(saw_new);

        alice_handle.shutdown().await.unwrap();
        bob_handle.shutdown().await.unwrap();
        let alice = alice_task.await.unwrap();
        assert!(alice.proposals().get(&ntxid).unwrap().is_sent());
        bob_task.await.unwrap();

        assert!(matches!(
            alice_handle.info().await,
            Err(WalletError::Stopped)
        ));
    }
}
