use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{HandshakeError, WireError};
use crate::transport::Connection;
use crate::wire::constants::{MAX_PAYLOAD_LEN, MIN_PROTOCOL_VERSION, STREAM_ONE, USER_AGENT};
use crate::wire::message::{Services, VersionMessage};
use crate::wire::{Message, build_version, read_message, send_message};

/// Where a connection is in its lifecycle.
///
/// `Idle` and `Dialing` exist before there is a [`Session`]; a session starts
/// in `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Dialing,
    Connected,
    VersionSent,
    VersionVerified,
    Active,
    Dropped,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dialed: our version goes first.
    Outbound,
    /// The peer dialed: we answer its version with ours.
    Inbound,
}

/// Local parameters announced in every `version` message.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub streams: Vec<u32>,
    pub user_agent: String,
    pub services: Services,
    pub max_payload_len: u32,
    pub listen_port: u16,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            streams: vec![STREAM_ONE],
            user_agent: USER_AGENT.to_string(),
            services: Services::NODE_NETWORK,
            max_payload_len: MAX_PAYLOAD_LEN,
            listen_port: crate::wire::constants::DEFAULT_PORT,
        }
    }
}

/// Nonces of every `version` message this node currently has outstanding.
///
/// A peer echoing one of them back is this node itself.
#[derive(Debug, Default)]
pub struct NonceRegistry {
    nonces: Mutex<HashSet<u64>>,
}

impl NonceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws a fresh non-zero nonce and records it.
    pub fn generate(&self) -> u64 {
        let mut nonces = self.nonces.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rng = rand::thread_rng();

        loop {
            let nonce: u64 = rng.r#gen();
            if nonce != 0 && nonces.insert(nonce) {
                return nonce;
            }
        }
    }

    pub fn contains(&self, nonce: u64) -> bool {
        self.nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&nonce)
    }

    pub fn release(&self, nonce: u64) {
        self.nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&nonce);
    }

    pub fn len(&self) -> usize {
        self.nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One peer connection: runs the version/verack exchange and afterwards
/// carries decoded messages.
///
/// The session owns the socket; dropping it closes the connection and
/// releases its nonce.
pub struct Session<C: Connection> {
    conn: C,
    remote: SocketAddr,
    role: Role,
    config: Arc<HandshakeConfig>,
    nonces: Arc<NonceRegistry>,
    nonce: u64,

    sent_version: bool,
    verified: bool,
    sent_verack: bool,
    got_verack: bool,
    dropped: bool,

    peer_version: Option<VersionMessage>,
    common_streams: Vec<u32>,
}

impl<C: Connection> Session<C> {
    pub fn new(
        conn: C,
        role: Role,
        config: Arc<HandshakeConfig>,
        nonces: Arc<NonceRegistry>,
    ) -> io::Result<Self> {
        let remote = conn.remote_endpoint()?;
        let nonce = nonces.generate();

        Ok(Self {
            conn,
            remote,
            role,
            config,
            nonces,
            nonce,
            sent_version: false,
            verified: false,
            sent_verack: false,
            got_verack: false,
            dropped: false,
            peer_version: None,
            common_streams: Vec::new(),
        })
    }

    pub fn state(&self) -> HandshakeState {
        if self.dropped {
            HandshakeState::Dropped
        } else if self.verified && self.sent_verack && self.got_verack {
            HandshakeState::Active
        } else if self.verified {
            HandshakeState::VersionVerified
        } else if self.sent_version {
            HandshakeState::VersionSent
        } else {
            HandshakeState::Connected
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The nonce carried in our `version` message.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn peer_version(&self) -> Option<&VersionMessage> {
        self.peer_version.as_ref()
    }

    /// Streams both sides announced, in our order. Empty until verified.
    pub fn common_streams(&self) -> &[u32] {
        &self.common_streams
    }

    /// Address the peer accepts connections on: its IP as seen by us and
    /// the port it announced in `addr_from`. `None` before the version
    /// arrives or when the peer announced port 0.
    pub fn peer_listen_addr(&self) -> Option<SocketAddr> {
        let version = self.peer_version.as_ref()?;
        if version.addr_from.port == 0 {
            return None;
        }
        Some(SocketAddr::new(self.remote.ip(), version.addr_from.port))
    }

    /// Runs the handshake to `Active`. Any failure leaves the session
    /// `Dropped`.
    pub async fn handshake(&mut self) -> Result<(), HandshakeError> {
        let result = self.exchange().await;
        if let Err(err) = &result {
            warn!(peer = %self.remote, stage = ?self.state(), error = %err, "handshake failed");
            self.dropped = true;
        }
        result
    }

    /// [`handshake`](Self::handshake) bounded by `deadline`.
    pub async fn handshake_within(&mut self, deadline: Duration) -> Result<(), HandshakeError> {
        match tokio::time::timeout(deadline, self.handshake()).await {
            Ok(result) => result,
            Err(_) => {
                self.dropped = true;
                warn!(peer = %self.remote, "handshake timed out");
                Err(HandshakeError::Timeout)
            }
        }
    }

    async fn exchange(&mut self) -> Result<(), HandshakeError> {
        if self.role == Role::Outbound {
            self.send_version().await?;
        }

        while self.state() != HandshakeState::Active {
            match self.next_message().await? {
                Message::Version(version) => {
                    if self.peer_version.is_some() {
                        return Err(self.unexpected("version"));
                    }
                    self.verify(&version)?;
                    self.peer_version = Some(version);

                    if !self.sent_version {
                        self.send_version().await?;
                    }
                    self.write(&Message::Verack).await?;
                    self.sent_verack = true;
                }
                Message::Verack => {
                    if !self.sent_version {
                        return Err(self.unexpected("verack"));
                    }
                    self.got_verack = true;
                }
                other => {
                    debug!(
                        peer = %self.remote,
                        command = %other.command(),
                        "ignored before handshake"
                    );
                }
            }
        }

        let user_agent = self
            .peer_version
            .as_ref()
            .map(|v| v.user_agent.as_str())
            .unwrap_or_default();
        info!(
            peer = %self.remote,
            streams = ?self.common_streams,
            user_agent,
            "handshake complete"
        );
        Ok(())
    }

    fn verify(&mut self, version: &VersionMessage) -> Result<(), HandshakeError> {
        if self.nonces.contains(version.nonce) {
            return Err(HandshakeError::SelfConnection {
                nonce: version.nonce,
            });
        }

        if version.version < MIN_PROTOCOL_VERSION {
            return Err(HandshakeError::VersionMismatch {
                peer: version.version,
                min: MIN_PROTOCOL_VERSION,
            });
        }

        let common: Vec<u32> = self
            .config
            .streams
            .iter()
            .copied()
            .filter(|s| version.streams.contains(s))
            .collect();
        if common.is_empty() {
            return Err(HandshakeError::NoCommonStream {
                peer: version.streams.clone(),
            });
        }

        self.common_streams = common;
        self.verified = true;
        Ok(())
    }

    async fn send_version(&mut self) -> Result<(), HandshakeError> {
        let version = build_version(
            self.config.services,
            self.remote,
            self.config.listen_port,
            self.nonce,
            &self.config.user_agent,
            &self.config.streams,
        );

        self.write(&Message::Version(version)).await?;
        self.sent_version = true;
        Ok(())
    }

    fn unexpected(&self, command: &str) -> HandshakeError {
        HandshakeError::UnexpectedMessage {
            command: command.to_string(),
            state: self.state(),
        }
    }

    async fn write(&mut self, msg: &Message) -> Result<(), HandshakeError> {
        let raw = msg.to_raw()?;
        send_message(&mut self.conn, &raw).await?;
        debug!(peer = %self.remote, command = %raw.command, len = raw.payload.len(), "sent");
        Ok(())
    }

    /// Next decodable message. Bad frames are logged and skipped; a payload
    /// that does not decode is a protocol violation.
    async fn next_message(&mut self) -> Result<Message, HandshakeError> {
        loop {
            let raw = match read_message(&mut self.conn, self.config.max_payload_len).await {
                Ok(raw) => raw,
                Err(WireError::Framing(err)) => {
                    warn!(peer = %self.remote, error = %err, "discarding frame");
                    continue;
                }
                Err(WireError::Io(err)) => return Err(HandshakeError::Io(err)),
            };

            let command = raw.command.clone();
            debug!(peer = %self.remote, %command, len = raw.payload.len(), "received");

            return Message::try_from(raw).map_err(|err| {
                warn!(peer = %self.remote, %command, error = %err, "malformed payload");
                HandshakeError::Malformed(err)
            });
        }
    }

    /// Sends a message on an active session.
    pub async fn send(&mut self, msg: &Message) -> Result<(), HandshakeError> {
        if self.dropped {
            return Err(HandshakeError::Closed);
        }

        let result = self.write(msg).await;
        if result.is_err() {
            self.dropped = true;
        }
        result
    }

    /// Receives the next message on an active session.
    pub async fn recv(&mut self) -> Result<Message, HandshakeError> {
        if self.dropped {
            return Err(HandshakeError::Closed);
        }

        let result = self.next_message().await;
        if result.is_err() {
            self.dropped = true;
        }
        result
    }

    /// Shuts the write side down. The socket is released when the session
    /// is dropped.
    pub async fn close(&mut self) {
        if let Err(err) = self.conn.shutdown().await {
            debug!(peer = %self.remote, error = %err, "shutdown");
        }
        self.dropped = true;
    }
}

impl<C: Connection> Drop for Session<C> {
    fn drop(&mut self) {
        self.nonces.release(self.nonce);
    }
}
