//! # Authenticated Transport
//!
//! Curve-authenticated, encrypted TCP streams. Both the router (request/reply)
//! and the publisher (broadcast) sit on top of this.
//!
//! ## Handshake
//!
//! ```text
//! client                                              server
//!   │ "TSRA" | ver | ed25519 vk | S_c | E_c  ───────►   │  S_c == curve(vk)?
//!   │                                                   │  authenticator("*", S_c)?
//!   │ ◄────────────────────────  0x00 (rejected, close) │
//!   │ ◄────────────────────────  0x01 | E_s             │
//!   │        both derive keys from ee | es | se         │
//!   │ enc(READY)  ─────────────────────────────────►    │
//!   │ ◄─────────────────────────────────  enc(READY)    │
//! ```
//!
//! The server learns the client's identity from the hello and checks it
//! against the authenticator before spending anything else on it. The client
//! already knows the server's static key (it is derived from the VK it dialed)
//! and proves nothing until the READY exchange, where a client that lied about
//! its static key, or a server that isn't who the client dialed, fails to
//! decrypt.
//!
//! ## Framing
//!
//! After the handshake every message is `[u32 BE length][AES-256-GCM frame]`.
//! Nonces are implicit per-direction counters (see [`crate::crypto::encryption`]).

use serde_json::Value;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{
    AES_TAG_LENGTH, HANDSHAKE_TIMEOUT, MAX_FRAME_BYTES, PROTOCOL_MAGIC, WIRE_PROTOCOL_VERSION,
};
use crate::crypto::encryption::{CipherState, EncryptionError};
use crate::crypto::keys::{curve_vk_from_vk, curve_vk_from_vk_bytes, KeyError, Wallet};
use crate::crypto::pfs::{
    derive_session_keys, diffie_hellman, EphemeralKeypair, HandshakeRole, PfsError, Transcript,
};

const HELLO_LEN: usize = 4 + 1 + 32 + 32 + 32;
const STATUS_ACCEPTED: u8 = 0x01;
const STATUS_REJECTED: u8 = 0x00;
const READY: &[u8] = b"READY";

/// Wire-level admission gate, consulted once per inbound connection.
pub trait Authenticator: Send + Sync {
    /// Should a client presenting this X25519 key be let in?
    fn authorize(&self, domain: &str, curve_key: &[u8; 32]) -> bool;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake timed out")]
    Timeout,

    #[error("not a Tessera peer (bad magic)")]
    BadMagic,

    #[error("unsupported wire protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("client curve key does not match its verifying key")]
    KeyMismatch,

    #[error("peer {0} is not authorized")]
    Unauthorized(String),

    #[error("server rejected the connection")]
    Rejected,

    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("crypto error: {0}")]
    Crypto(#[from] EncryptionError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("key exchange error: {0}")]
    Pfs(#[from] PfsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// Authorization failures are worth a warning; everything else is noise
    /// from flaky networks and scanners.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Unauthorized(_) | TransportError::KeyMismatch
        )
    }
}

// ---------------------------------------------------------------------------
// Framed halves
// ---------------------------------------------------------------------------

/// Decrypting half of a secure stream.
pub struct FrameReader {
    inner: OwnedReadHalf,
    cipher: CipherState,
}

impl FrameReader {
    fn new(inner: OwnedReadHalf, key: &[u8; 32]) -> Self {
        Self {
            inner,
            cipher: CipherState::new(key),
        }
    }

    /// Next decrypted frame. Any error leaves the stream unusable.
    pub async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let len = self.inner.read_u32().await? as usize;
        if len > MAX_FRAME_BYTES + AES_TAG_LENGTH {
            return Err(TransportError::FrameTooLarge(len));
        }
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        Ok(self.cipher.open(&buf)?)
    }
}

/// Encrypting half of a secure stream.
pub struct FrameWriter {
    inner: OwnedWriteHalf,
    cipher: CipherState,
}

impl FrameWriter {
    fn new(inner: OwnedWriteHalf, key: &[u8; 32]) -> Self {
        Self {
            inner,
            cipher: CipherState::new(key),
        }
    }

    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), TransportError> {
        if plaintext.len() > MAX_FRAME_BYTES {
            return Err(TransportError::FrameTooLarge(plaintext.len()));
        }
        let frame = self.cipher.seal(plaintext)?;
        self.inner.write_u32(frame.len() as u32).await?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn send_json(&mut self, msg: &Value) -> Result<(), TransportError> {
        self.send(&serde_json::to_vec(msg)?).await
    }
}

/// An established, authenticated session.
pub struct SecureStream {
    pub reader: FrameReader,
    pub writer: FrameWriter,
    /// Hex verifying key of the other end.
    pub remote_vk: String,
    pub remote_addr: SocketAddr,
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Dial `address` and authenticate to the node owning `server_vk`.
pub async fn connect(
    address: &str,
    wallet: &Wallet,
    server_vk: &str,
) -> Result<SecureStream, TransportError> {
    timeout(HANDSHAKE_TIMEOUT, connect_inner(address, wallet, server_vk))
        .await
        .map_err(|_| TransportError::Timeout)?
}

async fn connect_inner(
    address: &str,
    wallet: &Wallet,
    server_vk: &str,
) -> Result<SecureStream, TransportError> {
    let server_static = curve_vk_from_vk(server_vk)?;
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    let remote_addr = stream.peer_addr()?;
    let (mut rd, mut wr) = stream.into_split();

    let ephemeral = EphemeralKeypair::generate();
    let mut hello = Vec::with_capacity(HELLO_LEN);
    hello.extend_from_slice(&PROTOCOL_MAGIC);
    hello.push(WIRE_PROTOCOL_VERSION);
    hello.extend_from_slice(&wallet.verifying_key_bytes());
    hello.extend_from_slice(&wallet.curve_vk());
    hello.extend_from_slice(&ephemeral.public());
    wr.write_all(&hello).await?;

    if rd.read_u8().await? != STATUS_ACCEPTED {
        return Err(TransportError::Rejected);
    }
    let mut server_ephemeral = [0u8; 32];
    rd.read_exact(&mut server_ephemeral).await?;

    let ee = ephemeral.diffie_hellman(&server_ephemeral)?;
    let es = ephemeral.diffie_hellman(&server_static)?;
    let se = diffie_hellman(&wallet.curve_sk(), &server_ephemeral)?;
    let transcript = Transcript {
        client_static: wallet.curve_vk(),
        client_ephemeral: ephemeral.public(),
        server_static,
        server_ephemeral,
    };
    let keys = derive_session_keys(HandshakeRole::Initiator, &ee, &es, &se, &transcript);

    let mut reader = FrameReader::new(rd, &keys.recv);
    let mut writer = FrameWriter::new(wr, &keys.send);

    writer.send(READY).await?;
    let confirm = reader
        .recv()
        .await
        .map_err(|_| TransportError::Handshake("server failed key confirmation"))?;
    if confirm != READY {
        return Err(TransportError::Handshake("unexpected confirmation frame"));
    }

    Ok(SecureStream {
        reader,
        writer,
        remote_vk: server_vk.to_string(),
        remote_addr,
    })
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Run the server half of the handshake on an accepted socket.
pub async fn accept(
    stream: TcpStream,
    wallet: &Wallet,
    authenticator: &dyn Authenticator,
) -> Result<SecureStream, TransportError> {
    timeout(HANDSHAKE_TIMEOUT, accept_inner(stream, wallet, authenticator))
        .await
        .map_err(|_| TransportError::Timeout)?
}

async fn accept_inner(
    stream: TcpStream,
    wallet: &Wallet,
    authenticator: &dyn Authenticator,
) -> Result<SecureStream, TransportError> {
    stream.set_nodelay(true)?;
    let remote_addr = stream.peer_addr()?;
    let (mut rd, mut wr) = stream.into_split();

    let mut hello = [0u8; HELLO_LEN];
    rd.read_exact(&mut hello).await?;
    if hello[..4] != PROTOCOL_MAGIC {
        return Err(TransportError::BadMagic);
    }
    if hello[4] != WIRE_PROTOCOL_VERSION {
        return Err(TransportError::UnsupportedVersion(hello[4]));
    }
    let client_vk = take32(&hello[5..37]);
    let client_static = take32(&hello[37..69]);
    let client_ephemeral = take32(&hello[69..101]);
    let client_vk_hex = hex::encode(client_vk);

    let expected = curve_vk_from_vk_bytes(&client_vk)?;
    if expected != client_static {
        let _ = wr.write_all(&[STATUS_REJECTED]).await;
        return Err(TransportError::KeyMismatch);
    }
    if !authenticator.authorize("*", &client_static) {
        let _ = wr.write_all(&[STATUS_REJECTED]).await;
        return Err(TransportError::Unauthorized(client_vk_hex));
    }

    let ephemeral = EphemeralKeypair::generate();
    let mut reply = [0u8; 33];
    reply[0] = STATUS_ACCEPTED;
    reply[1..].copy_from_slice(&ephemeral.public());
    wr.write_all(&reply).await?;

    let ee = ephemeral.diffie_hellman(&client_ephemeral)?;
    let es = diffie_hellman(&wallet.curve_sk(), &client_ephemeral)?;
    let se = ephemeral.diffie_hellman(&client_static)?;
    let transcript = Transcript {
        client_static,
        client_ephemeral,
        server_static: wallet.curve_vk(),
        server_ephemeral: ephemeral.public(),
    };
    let keys = derive_session_keys(HandshakeRole::Responder, &ee, &es, &se, &transcript);

    let mut reader = FrameReader::new(rd, &keys.recv);
    let mut writer = FrameWriter::new(wr, &keys.send);

    let confirm = reader
        .recv()
        .await
        .map_err(|_| TransportError::Handshake("client failed key confirmation"))?;
    if confirm != READY {
        return Err(TransportError::Handshake("unexpected confirmation frame"));
    }
    writer.send(READY).await?;

    debug!(peer = %client_vk_hex, addr = %remote_addr, "transport session established");
    Ok(SecureStream {
        reader,
        writer,
        remote_vk: client_vk_hex,
        remote_addr,
    })
}

/// Log a failed inbound handshake at the level it deserves.
pub fn log_handshake_failure(addr: SocketAddr, err: &TransportError) {
    if err.is_auth_failure() {
        warn!(addr = %addr, error = %err, "rejected unauthorized connection");
    } else {
        debug!(addr = %addr, error = %err, "inbound handshake failed");
    }
}

fn take32(slice: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(slice);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    struct AllowList(HashSet<[u8; 32]>);

    impl Authenticator for AllowList {
        fn authorize(&self, _domain: &str, curve_key: &[u8; 32]) -> bool {
            self.0.contains(curve_key)
        }
    }

    async fn spawn_echo_server(
        server: Arc<Wallet>,
        auth: Arc<AllowList>,
    ) -> (SocketAddr, tokio::task::JoinHandle<Result<String, TransportError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut session = accept(stream, &server, auth.as_ref()).await?;
            let frame = session.reader.recv().await?;
            session.writer.send(&frame).await?;
            Ok(session.remote_vk)
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn authorized_client_round_trips() {
        let server = Arc::new(Wallet::generate());
        let client = Wallet::generate();
        let auth = Arc::new(AllowList([client.curve_vk()].into_iter().collect()));
        let (addr, handle) = spawn_echo_server(Arc::clone(&server), auth).await;

        let mut session = connect(&addr.to_string(), &client, &server.verifying_key())
            .await
            .unwrap();
        session.writer.send(b"ping").await.unwrap();
        assert_eq!(session.reader.recv().await.unwrap(), b"ping");

        let seen_vk = handle.await.unwrap().unwrap();
        assert_eq!(seen_vk, client.verifying_key());
    }

    #[tokio::test]
    async fn unauthorized_client_is_rejected() {
        let server = Arc::new(Wallet::generate());
        let client = Wallet::generate();
        let auth = Arc::new(AllowList(HashSet::new()));
        let (addr, handle) = spawn_echo_server(Arc::clone(&server), auth).await;

        let err = connect(&addr.to_string(), &client, &server.verifying_key())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Rejected));
        let server_err = handle.await.unwrap().unwrap_err();
        assert!(server_err.is_auth_failure());
    }

    #[tokio::test]
    async fn dialing_the_wrong_identity_fails() {
        let server = Arc::new(Wallet::generate());
        let impostor_target = Wallet::generate();
        let client = Wallet::generate();
        let auth = Arc::new(AllowList([client.curve_vk()].into_iter().collect()));
        let (addr, _handle) = spawn_echo_server(Arc::clone(&server), auth).await;

        // Client believes it is talking to `impostor_target`; the real server
        // can't complete key confirmation.
        let result = connect(&addr.to_string(), &client, &impostor_target.verifying_key()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn garbage_preamble_is_rejected() {
        let server = Arc::new(Wallet::generate());
        let auth = Arc::new(AllowList(HashSet::new()));
        let (addr, handle) = spawn_echo_server(server, auth).await;

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(&[0u8; HELLO_LEN]).await.unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::BadMagic));
    }
}
