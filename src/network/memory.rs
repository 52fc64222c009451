//! In-process transport
//!
//! Copayers registered on the same `MemoryHub` reach each other without
//! sockets. Used by the demo command and by wallet tests.

use crate::network::message::WireMessage;
use crate::network::nonce::NetworkNonces;
use crate::network::transport::{
    peer_id_for, Network, NetworkError, NetworkEvent, Recipients, StartOptions,
    EVENT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

struct Slot {
    events: mpsc::Sender<NetworkEvent>,
    nonces: Arc<RwLock<NetworkNonces>>,
    allowed: Option<BTreeSet<String>>,
    max_peers: usize,
    links: BTreeSet<String>,
}

/// Shared registry of online copayers
#[derive(Clone, Default)]
pub struct MemoryHub {
    slots: Arc<Mutex<BTreeMap<String, Slot>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn online(&self) -> Vec<String> {
        self.slots.lock().await.keys().cloned().collect()
    }

    /// Link two online copayers, emitting `PeerConnected` on both sides
    async fn link(&self, from: &str, to: &str) -> bool {
        let mut slots = self.slots.lock().await;
        let (Some(a), Some(b)) = (slots.get(from), slots.get(to)) else {
            return false;
        };
        if a.links.contains(to) {
            return false;
        }
        if let Some(allowed) = &b.allowed {
            if !allowed.contains(from) {
                log::debug!("{} refuses inbound session from {}", to, from);
                return false;
            }
        }
        if a.links.len() >= a.max_peers || b.links.len() >= b.max_peers {
            return false;
        }

        let (a_nonces, b_nonces) = (a.nonces.clone(), b.nonces.clone());
        let mut a_nonces = a_nonces.write().await;
        let mut b_nonces = b_nonces.write().await;
        let a_is_new = !a_nonces.is_seeded(to);
        let b_is_new = !b_nonces.is_seeded(from);
        let (a_nonce, b_nonce) = (a_nonces.bump_own(), b_nonces.bump_own());
        if !a_nonces.observe(to, b_nonce) || !b_nonces.observe(from, a_nonce) {
            log::warn!("Stale session nonce between {} and {}", from, to);
            return false;
        }
        drop((a_nonces, b_nonces));

        for (me, other, is_new) in [(from, to, a_is_new), (to, from, b_is_new)] {
            if let Some(slot) = slots.get_mut(me) {
                slot.links.insert(other.to_string());
                let _ = slot.events.try_send(NetworkEvent::PeerConnected {
                    copayer_id: other.to_string(),
                    is_new,
                });
            }
        }
        true
    }

    async fn deliver(&self, from: &str, to: &str, message: &WireMessage) {
        let slots = self.slots.lock().await;
        let linked = slots.get(from).map_or(false, |s| s.links.contains(to));
        match slots.get(to) {
            Some(slot) if linked => {
                let event = NetworkEvent::Data {
                    sender: from.to_string(),
                    message: message.clone(),
                };
                if slot.events.try_send(event).is_err() {
                    log::warn!("Event queue of {} is full, dropping message", to);
                }
            }
            _ => log::debug!("Dropping {} for offline copayer {}", message.type_name(), to),
        }
    }

    async fn unregister(&self, copayer_id: &str) {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.remove(copayer_id) else {
            return;
        };
        for peer in &slot.links {
            if let Some(other) = slots.get_mut(peer) {
                other.links.remove(copayer_id);
                let _ = other.events.try_send(NetworkEvent::PeerDisconnected {
                    peer_id: peer_id_for(copayer_id),
                });
            }
        }
        let _ = slot.events.try_send(NetworkEvent::Closed);
    }
}

/// One copayer's endpoint on a `MemoryHub`
pub struct MemoryNetwork {
    hub: MemoryHub,
    copayer_id: RwLock<Option<String>>,
    nonces: Arc<RwLock<NetworkNonces>>,
    sent: Mutex<Vec<(Recipients, WireMessage)>>,
}

impl MemoryNetwork {
    pub fn new(hub: MemoryHub) -> Self {
        Self {
            hub,
            copayer_id: RwLock::new(None),
            nonces: Arc::new(RwLock::new(NetworkNonces::new())),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Every message handed to `send`, in order
    pub async fn sent(&self) -> Vec<(Recipients, WireMessage)> {
        self.sent.lock().await.clone()
    }

    async fn me(&self) -> Result<String, NetworkError> {
        self.copayer_id
            .read()
            .await
            .clone()
            .ok_or(NetworkError::NotStarted)
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    async fn start(
        &self,
        options: StartOptions,
    ) -> Result<mpsc::Receiver<NetworkEvent>, NetworkError> {
        let mut me = self.copayer_id.write().await;
        let mut slots = self.hub.slots.lock().await;
        if me.is_some() || slots.contains_key(&options.copayer_id) {
            return Err(NetworkError::AlreadyStarted);
        }

        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        slots.insert(
            options.copayer_id.clone(),
            Slot {
                events,
                nonces: self.nonces.clone(),
                allowed: None,
                max_peers: options.max_peers,
                links: BTreeSet::new(),
            },
        );
        *me = Some(options.copayer_id);
        Ok(rx)
    }

    async fn connect_to_peers(&self, copayer_ids: &[String]) -> Result<(), NetworkError> {
        let me = self.me().await?;
        for id in copayer_ids.iter().filter(|id| **id != me) {
            if self.hub.link(&me, id).await {
                log::debug!("{} linked to {}", me, id);
            }
        }
        Ok(())
    }

    async fn send(
        &self,
        recipients: Recipients,
        message: &WireMessage,
    ) -> Result<(), NetworkError> {
        let me = self.me().await?;
        self.sent
            .lock()
            .await
            .push((recipients.clone(), message.clone()));

        let targets = match recipients {
            Recipients::All => self
                .hub
                .slots
                .lock()
                .await
                .get(&me)
                .map(|s| s.links.iter().cloned().collect())
                .unwrap_or_default(),
            Recipients::Copayers(ids) => ids,
        };
        for to in targets {
            self.hub.deliver(&me, &to, message).await;
        }
        Ok(())
    }

    async fn restrict_inbound_to(&self, copayer_ids: &[String]) {
        let Ok(me) = self.me().await else {
            return;
        };
        if let Some(slot) = self.hub.slots.lock().await.get_mut(&me) {
            slot.allowed = Some(copayer_ids.iter().cloned().collect());
        }
    }

    async fn disconnect(&self) {
        if let Some(me) = self.copayer_id.write().await.take() {
            self.hub.unregister(&me).await;
        }
    }

    async fn is_online(&self) -> bool {
        self.copayer_id.read().await.is_some()
    }

    async fn online_peer_ids(&self) -> Vec<String> {
        let Ok(me) = self.me().await else {
            return Vec::new();
        };
        self.hub
            .slots
            .lock()
            .await
            .get(&me)
            .map(|s| s.links.iter().map(|id| peer_id_for(id)).collect())
            .unwrap_or_default()
    }

    async fn nonces(&self) -> NetworkNonces {
        self.nonces.read().await.clone()
    }

    async fn set_nonces(&self, nonces: NetworkNonces) {
        *self.nonces.write().await = nonces;
    }
}
