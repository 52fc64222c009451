//! TCP transport
//!
//! Copayers dial each other directly using a static copayer id to address
//! map, extended with the listen ports learned from inbound handshakes.

use crate::network::message::{Frame, WireMessage};
use crate::network::nonce::NetworkNonces;
use crate::network::peer::PeerManager;
use crate::network::server::{connect_to_peer, handle_connection, ConnectionContext, Server};
use crate::network::transport::{
    peer_id_for, Network, NetworkError, NetworkEvent, Recipients, StartOptions,
    EVENT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// TCP transport configuration
#[derive(Debug, Clone, Default)]
pub struct TcpConfig {
    /// Port to listen on, 0 for any
    pub listen_port: u16,
    /// Known copayer addresses, `host:port` by copayer id
    pub peer_addrs: BTreeMap<String, String>,
}

struct Session {
    ctx: ConnectionContext,
    port: u16,
    accept_task: JoinHandle<()>,
}

pub struct TcpNetwork {
    config: TcpConfig,
    nonces: Arc<RwLock<NetworkNonces>>,
    allowed: Arc<RwLock<Option<BTreeSet<String>>>>,
    addrs: Arc<RwLock<BTreeMap<String, String>>>,
    session: RwLock<Option<Session>>,
}

impl TcpNetwork {
    /// Create a new, stopped transport
    pub fn new(config: TcpConfig) -> Self {
        let addrs = Arc::new(RwLock::new(config.peer_addrs.clone()));
        Self {
            config,
            nonces: Arc::new(RwLock::new(NetworkNonces::new())),
            allowed: Arc::new(RwLock::new(None)),
            addrs,
            session: RwLock::new(None),
        }
    }

    /// Port actually bound, once started
    pub async fn local_port(&self) -> Option<u16> {
        self.session.read().await.as_ref().map(|s| s.port)
    }

    pub async fn add_peer_address(&self, copayer_id: &str, addr: &str) {
        self.addrs
            .write()
            .await
            .insert(copayer_id.to_string(), addr.to_string());
    }

    async fn context(&self) -> Result<ConnectionContext, NetworkError> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.ctx.clone())
            .ok_or(NetworkError::NotStarted)
    }
}

#[async_trait]
impl Network for TcpNetwork {
    async fn start(
        &self,
        options: StartOptions,
    ) -> Result<mpsc::Receiver<NetworkEvent>, NetworkError> {
        let mut session = self.session.write().await;
        if session.is_some() {
            return Err(NetworkError::AlreadyStarted);
        }

        let server = Server::bind(self.config.listen_port).await?;
        let port = server.port();
        if options.identity.public_key_hex() != options.copayer_id {
            return Err(NetworkError::Signing(
                "identity key does not match copayer id".to_string(),
            ));
        }

        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let ctx = ConnectionContext {
            peers: Arc::new(PeerManager::new(options.max_peers)),
            identity: options.identity.clone(),
            copayer_id: options.copayer_id.clone(),
            listen_port: port,
            events,
            nonces: self.nonces.clone(),
            allowed: self.allowed.clone(),
            addrs: self.addrs.clone(),
        };

        let accept_ctx = ctx.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match server.accept().await {
                    Ok((stream, addr)) => {
                        log::debug!("Incoming connection from {}", addr);
                        let ctx = accept_ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, ctx, None).await {
                                log::warn!("Connection error with {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("Accept error: {}", e);
                        let _ = accept_ctx
                            .events
                            .send(NetworkEvent::ServerError(e.to_string()))
                            .await;
                    }
                }
            }
        });

        log::info!(
            "Transport started on port {} for copayer {}",
            port,
            options.copayer_id
        );
        *session = Some(Session {
            ctx,
            port,
            accept_task,
        });
        Ok(rx)
    }

    async fn connect_to_peers(&self, copayer_ids: &[String]) -> Result<(), NetworkError> {
        let ctx = self.context().await?;

        for copayer_id in copayer_ids {
            if *copayer_id == ctx.copayer_id || ctx.peers.is_connected(copayer_id).await {
                continue;
            }
            let Some(addr) = self.addrs.read().await.get(copayer_id).cloned() else {
                log::debug!("No known address for copayer {}", copayer_id);
                continue;
            };

            let ctx = ctx.clone();
            let copayer_id = copayer_id.clone();
            tokio::spawn(async move {
                match connect_to_peer(&addr).await {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) =
                            handle_connection(stream, peer_addr, ctx, Some(copayer_id.clone()))
                                .await
                        {
                            log::warn!("Session with {} at {} failed: {}", copayer_id, addr, e);
                        }
                    }
                    Err(e) => log::debug!("Could not reach {} at {}: {}", copayer_id, addr, e),
                }
            });
        }
        Ok(())
    }

    async fn send(
        &self,
        recipients: Recipients,
        message: &WireMessage,
    ) -> Result<(), NetworkError> {
        let ctx = self.context().await?;
        let frame = Frame::Data(message.clone());

        match recipients {
            Recipients::All => ctx.peers.broadcast(frame).await,
            Recipients::Copayers(ids) => {
                for id in ids {
                    if let Err(e) = ctx.peers.send_to(&id, frame.clone()).await {
                        log::debug!("Dropping {} for {}: {}", message.type_name(), id, e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn restrict_inbound_to(&self, copayer_ids: &[String]) {
        *self.allowed.write().await = Some(copayer_ids.iter().cloned().collect());
    }

    async fn disconnect(&self) {
        let Some(session) = self.session.write().await.take() else {
            return;
        };
        session.accept_task.abort();
        session.ctx.peers.disconnect_all().await;
        let _ = session.ctx.events.try_send(NetworkEvent::Closed);
        log::info!("Transport on port {} stopped", session.port);
    }

    async fn is_online(&self) -> bool {
        self.session.read().await.is_some()
    }

    async fn online_peer_ids(&self) -> Vec<String> {
        match self.context().await {
            Ok(ctx) => ctx
                .peers
                .get_peers()
                .await
                .iter()
                .map(|id| peer_id_for(id))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn nonces(&self) -> NetworkNonces {
        self.nonces.read().await.clone()
    }

    async fn set_nonces(&self, nonces: NetworkNonces) {
        *self.nonces.write().await = nonces;
    }
}
