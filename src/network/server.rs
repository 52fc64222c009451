//! TCP server and connection handling
//!
//! Accepts incoming copayer connections, authenticates both directions with
//! signed `Hello` frames and pumps frames between the socket and the
//! transport.

use crate::crypto::KeyPair;
use crate::network::message::{Frame, Hello, MAGIC, MAX_FRAME_SIZE};
use crate::network::nonce::NetworkNonces;
use crate::network::peer::{PeerError, PeerHandle, PeerInfo, PeerManager};
use crate::network::transport::{peer_id_for, NetworkEvent};
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Time allowed for the peer's `Hello`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Frame codec for length-prefixed framing
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item
            .to_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        // Magic (4) + Length (4) + Data
        dst.reserve(8 + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 8 {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Frame too large: {} bytes", len),
            ));
        }

        if src.len() < 8 + len {
            src.reserve(8 + len - src.len());
            return Ok(None);
        }

        src.advance(8);
        let data = src.split_to(len);

        let frame = Frame::from_bytes(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        Ok(Some(frame))
    }
}

/// TCP server for accepting copayer connections
pub struct Server {
    listener: TcpListener,
    port: u16,
}

impl Server {
    /// Bind to a port and create the server
    pub async fn bind(port: u16) -> Result<Self, std::io::Error> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        log::info!("Server listening on 0.0.0.0:{}", port);

        Ok(Self { listener, port })
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }
}

/// Connect to a copayer
pub async fn connect_to_peer(addr: &str) -> Result<(TcpStream, SocketAddr), PeerError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

    let peer_addr = stream
        .peer_addr()
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

    Ok((stream, peer_addr))
}

/// Transport state shared by every connection task
#[derive(Clone)]
pub struct ConnectionContext {
    pub peers: Arc<PeerManager>,
    /// Key our handshakes are signed with
    pub identity: KeyPair,
    pub copayer_id: String,
    pub listen_port: u16,
    pub events: mpsc::Sender<NetworkEvent>,
    pub nonces: Arc<RwLock<NetworkNonces>>,
    /// Copayers allowed to connect in, `None` for anyone
    pub allowed: Arc<RwLock<Option<BTreeSet<String>>>>,
    /// Known copayer addresses
    pub addrs: Arc<RwLock<BTreeMap<String, String>>>,
}

impl ConnectionContext {
    /// Our handshake for a new connection, under a fresh session nonce
    async fn next_hello(&self) -> Result<Hello, PeerError> {
        let nonce = self.nonces.write().await.bump_own();
        Hello::signed(&self.identity, nonce, self.listen_port)
            .map_err(|e| PeerError::InvalidHandshake(e.to_string()))
    }

    /// Validate the peer's handshake, returning whether the copayer is new
    async fn accept_hello(
        &self,
        hello: &Hello,
        addr: SocketAddr,
        expected: Option<&str>,
    ) -> Result<bool, PeerError> {
        if !hello.verify() {
            return Err(PeerError::InvalidHandshake("bad signature".to_string()));
        }
        if hello.copayer_id == self.copayer_id {
            return Err(PeerError::InvalidHandshake("connected to self".to_string()));
        }
        match expected {
            Some(id) if id != hello.copayer_id => {
                return Err(PeerError::InvalidHandshake(format!(
                    "expected {}, got {}",
                    id, hello.copayer_id
                )));
            }
            Some(_) => {}
            None => {
                let allowed = self.allowed.read().await;
                if let Some(allowed) = allowed.as_ref() {
                    if !allowed.contains(&hello.copayer_id) {
                        return Err(PeerError::NotAllowed(hello.copayer_id.clone()));
                    }
                }
            }
        }

        let mut nonces = self.nonces.write().await;
        let is_new = !nonces.is_seeded(&hello.copayer_id);
        if !nonces.observe(&hello.copayer_id, hello.nonce) {
            return Err(PeerError::StaleNonce(hello.copayer_id.clone()));
        }
        drop(nonces);

        if expected.is_none() && hello.listen_port != 0 {
            let advertised = SocketAddr::new(addr.ip(), hello.listen_port).to_string();
            self.addrs
                .write()
                .await
                .entry(hello.copayer_id.clone())
                .or_insert(advertised);
        }
        Ok(is_new)
    }
}

/// Handle a copayer connection (both inbound and outbound)
///
/// `expected` is the copayer an outbound connection was dialed for.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ConnectionContext,
    expected: Option<String>,
) -> Result<(), PeerError> {
    let framed = Framed::new(stream, FrameCodec);
    let (mut writer, mut reader) = framed.split();

    let own = ctx.next_hello().await?;
    writer
        .send(Frame::Hello(own))
        .await
        .map_err(PeerError::IoError)?;
    log::debug!("Sent hello to {}", addr);

    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next()).await {
        Ok(Some(Ok(Frame::Hello(hello)))) => hello,
        Ok(Some(Ok(Frame::Data(_)))) => {
            return Err(PeerError::InvalidHandshake("data before hello".to_string()))
        }
        Ok(Some(Err(e))) => return Err(PeerError::IoError(e)),
        Ok(None) => return Err(PeerError::Disconnected),
        Err(_) => return Err(PeerError::InvalidHandshake("timed out".to_string())),
    };
    let is_new = ctx.accept_hello(&hello, addr, expected.as_deref()).await?;
    let copayer_id = hello.copayer_id.clone();

    let (tx, mut rx) = mpsc::channel::<Frame>(100);
    let close = Arc::new(Notify::new());
    let info = PeerInfo {
        copayer_id: copayer_id.clone(),
        addr,
        outbound: expected.is_some(),
        nonce: hello.nonce,
    };
    ctx.peers
        .add_peer(
            info,
            PeerHandle {
                tx,
                close: close.clone(),
            },
        )
        .await?;

    let _ = ctx
        .events
        .send(NetworkEvent::PeerConnected {
            copayer_id: copayer_id.clone(),
            is_new,
        })
        .await;

    // Spawn writer task
    let write_handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.send(frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            next = reader.next() => match next {
                Some(Ok(Frame::Data(message))) => {
                    log::debug!("Received {} from {}", message.type_name(), copayer_id);
                    let event = NetworkEvent::Data {
                        sender: copayer_id.clone(),
                        message,
                    };
                    if ctx.events.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Frame::Hello(_))) => {
                    log::debug!("Ignoring repeated hello from {}", copayer_id);
                }
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", copayer_id, e);
                    break;
                }
                None => {
                    log::info!("Peer {} disconnected", copayer_id);
                    break;
                }
            },
            _ = close.notified() => break,
        }
    }

    write_handle.abort();
    ctx.peers.remove_peer(&copayer_id).await;
    let _ = ctx
        .events
        .send(NetworkEvent::PeerDisconnected {
            peer_id: peer_id_for(&copayer_id),
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::network::message::{Payload, WireMessage};

    #[test]
    fn test_frame_codec() {
        let mut codec = FrameCodec;
        let frame = Frame::Data(WireMessage::new(
            "w1",
            Payload::Seen {
                ntxid: "aa".to_string(),
            },
        ));

        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();

        // Partial frames wait for more bytes
        let mut partial = buf.split_to(10);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);

        match codec.decode(&mut partial).unwrap().unwrap() {
            Frame::Data(message) => assert_eq!(message.type_name(), "seen"),
            Frame::Hello(_) => panic!("Wrong frame type"),
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&b"XXXX\0\0\0\x02{}"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    fn context(identity: &KeyPair) -> (ConnectionContext, mpsc::Receiver<NetworkEvent>) {
        let (events, rx) = mpsc::channel(16);
        let ctx = ConnectionContext {
            peers: Arc::new(PeerManager::new(4)),
            identity: identity.clone(),
            copayer_id: identity.public_key_hex(),
            listen_port: 0,
            events,
            nonces: Arc::new(RwLock::new(NetworkNonces::new())),
            allowed: Arc::new(RwLock::new(None)),
            addrs: Arc::new(RwLock::new(BTreeMap::new())),
        };
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_hello_checks() {
        let (ctx, _rx) = context(&KeyPair::generate());
        let peer = KeyPair::generate();
        let addr: SocketAddr = "10.0.0.2:5000".parse().unwrap();

        let hello = Hello::signed(&peer, 3, 4100).unwrap();
        assert!(ctx.accept_hello(&hello, addr, None).await.unwrap());
        assert_eq!(
            ctx.addrs.read().await.get(&hello.copayer_id).cloned(),
            Some("10.0.0.2:4100".to_string())
        );

        // A replayed handshake carries no newer nonce
        assert!(matches!(
            ctx.accept_hello(&hello, addr, None).await,
            Err(PeerError::StaleNonce(_))
        ));
        let stale = Hello::signed(&peer, 2, 4100).unwrap();
        assert!(matches!(
            ctx.accept_hello(&stale, addr, None).await,
            Err(PeerError::StaleNonce(_))
        ));

        // Known copayer, later session
        let later = Hello::signed(&peer, 4, 4100).unwrap();
        assert!(!ctx.accept_hello(&later, addr, None).await.unwrap());

        *ctx.allowed.write().await = Some(BTreeSet::new());
        let stranger = Hello::signed(&KeyPair::generate(), 1, 0).unwrap();
        assert!(matches!(
            ctx.accept_hello(&stranger, addr, None).await,
            Err(PeerError::NotAllowed(_))
        ));

        let mut forged = Hello::signed(&peer, 9, 0).unwrap();
        forged.copayer_id = stranger.copayer_id.clone();
        assert!(matches!(
            ctx.accept_hello(&forged, addr, None).await,
            Err(PeerError::InvalidHandshake(_))
        ));
    }
}
