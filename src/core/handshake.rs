//! Obfuscated2 handshake
//!
//! Packet layout (64 bytes, sent once at the start of a connection):
//! - `[0..8)`: random, never transformed
//! - `[8..64)`: key/IV material for both directions (see [`derive_cipher_pair`])
//! - `[56..60)`: magic `0xEFEFEFEF` (little-endian), encrypted
//! - `[60..62)`: datacenter number (i16 little-endian), encrypted
//! - `[62..64)`: random, encrypted
//!
//! Only the last 8 bytes are encrypted, but the keystream is advanced as if
//! the first 56 had been too. The relay keeps using the same cipher instances
//! for every byte that follows, so positions stay aligned on both ends.

use bytes::{Buf, Bytes, BytesMut};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::cipher::{KeystreamCipher, IV_LEN, KEY_LEN};

/// Total handshake packet length
pub const HANDSHAKE_LEN: usize = 64;
/// Start of the key/IV material
pub const KEY_IV_OFFSET: usize = 8;
/// Offset of the protocol magic; everything before it travels in clear
pub const MAGIC_OFFSET: usize = 56;
/// Offset of the datacenter number
pub const DC_OFFSET: usize = 60;
/// Magic identifying an obfuscated connection to a proxy
pub const PROXY_MAGIC: u32 = 0xEFEF_EFEF;

/// First byte of an abridged MTProto connection
const ABRIDGED_TAG: u8 = 0xFE;

/// First words that other protocols (HTTP methods, intermediate MTProto) start with
const RESERVED_PREFIXES: [u32; 5] = [
    0x4441_4548,
    0x5453_4f50,
    0x2054_4547,
    0x4954_504f,
    0xEEEE_EEEE,
];

/// Which end of the handshake this side plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// The side that generated the packet (proxy toward a peer)
    Client,
    /// The side that received the packet (proxy accepting a client)
    Server,
}

/// Handshake failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("bad protocol magic {0:#010x}")]
    BadMagic(u32),
    #[error("connection closed after {received} of {HANDSHAKE_LEN} handshake bytes")]
    UnexpectedEof { received: usize },
}

/// Ciphers for both directions of one connection
#[derive(Debug)]
pub struct CipherPair {
    /// Applied to bytes this side sends
    pub encrypt: KeystreamCipher,
    /// Applied to bytes this side receives
    pub decrypt: KeystreamCipher,
}

/// Derive the cipher pair from a handshake packet
///
/// With `K = packet[8..64)`: the forward cipher uses key `K[0..32)` and IV
/// `K[32..48)`; the reverse cipher uses `K[16..48)` and `K[0..16)`, both
/// byte-reversed. A secret replaces each key with `SHA-256(key || secret)`.
/// The client encrypts with forward and the server decrypts with it.
pub fn derive_cipher_pair(
    packet: &[u8; HANDSHAKE_LEN],
    secret: Option<&[u8]>,
    role: ConnectionRole,
) -> CipherPair {
    let material = &packet[KEY_IV_OFFSET..];

    let mut forward_key = [0u8; KEY_LEN];
    forward_key.copy_from_slice(&material[..KEY_LEN]);
    let mut forward_iv = [0u8; IV_LEN];
    forward_iv.copy_from_slice(&material[KEY_LEN..KEY_LEN + IV_LEN]);

    let mut reverse_key = [0u8; KEY_LEN];
    reverse_key.copy_from_slice(&material[IV_LEN..IV_LEN + KEY_LEN]);
    reverse_key.reverse();
    let mut reverse_iv = [0u8; IV_LEN];
    reverse_iv.copy_from_slice(&material[..IV_LEN]);
    reverse_iv.reverse();

    if let Some(secret) = secret {
        forward_key = mix_secret(&forward_key, secret);
        reverse_key = mix_secret(&reverse_key, secret);
    }

    let forward = KeystreamCipher::new(&forward_key, &forward_iv);
    let reverse = KeystreamCipher::new(&reverse_key, &reverse_iv);

    match role {
        ConnectionRole::Client => CipherPair {
            encrypt: forward,
            decrypt: reverse,
        },
        ConnectionRole::Server => CipherPair {
            encrypt: reverse,
            decrypt: forward,
        },
    }
}

fn mix_secret(key: &[u8; KEY_LEN], secret: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(secret);
    let digest = hasher.finalize();
    let mut mixed = [0u8; KEY_LEN];
    mixed.copy_from_slice(&digest);
    mixed
}

/// Whether a generated packet could be mistaken for another protocol
///
/// The first word is compared in both byte orders so the packet never reads
/// as an HTTP method or the intermediate-MTProto sentinel.
pub fn has_reserved_prefix(packet: &[u8; HANDSHAKE_LEN]) -> bool {
    if packet[0] == ABRIDGED_TAG {
        return true;
    }

    if u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]) == 0 {
        return true;
    }

    let head = [packet[0], packet[1], packet[2], packet[3]];
    let be = u32::from_be_bytes(head);
    let le = u32::from_le_bytes(head);
    RESERVED_PREFIXES
        .iter()
        .any(|&reserved| reserved == be || reserved == le)
}

// ========== Server role ==========

/// Server-role handshake accumulating the client's 64-byte packet
pub struct ServerHandshake {
    buffer: [u8; HANDSHAKE_LEN],
    filled: usize,
    secret: Option<Bytes>,
}

/// Progress of a server-role handshake
pub enum ServerProgress {
    /// Fewer than 64 bytes seen so far
    AwaitingBytes(ServerHandshake),
    /// Packet accepted
    Established(ServerEstablished),
}

/// Result of a successful server-role handshake
#[derive(Debug)]
pub struct ServerEstablished {
    /// Datacenter number requested by the client, as transmitted
    pub dc: i16,
    /// Ciphers for the rest of the connection
    pub ciphers: CipherPair,
}

impl ServerHandshake {
    /// Create a handshake expecting packets derived with `secret`
    pub fn new(secret: Option<Bytes>) -> Self {
        Self {
            buffer: [0u8; HANDSHAKE_LEN],
            filled: 0,
            secret,
        }
    }

    /// Bytes still needed to complete the packet
    pub fn remaining(&self) -> usize {
        HANDSHAKE_LEN - self.filled
    }

    /// Consume up to `remaining()` bytes from the front of `input`
    ///
    /// Bytes past the 64th are left in `input` untouched; they are stream
    /// data encrypted under the derived decrypt cipher.
    pub fn advance(mut self, input: &mut BytesMut) -> Result<ServerProgress, HandshakeError> {
        let take = self.remaining().min(input.len());
        self.buffer[self.filled..self.filled + take].copy_from_slice(&input[..take]);
        input.advance(take);
        self.filled += take;

        if self.filled < HANDSHAKE_LEN {
            return Ok(ServerProgress::AwaitingBytes(self));
        }

        self.finish().map(ServerProgress::Established)
    }

    fn finish(mut self) -> Result<ServerEstablished, HandshakeError> {
        let mut ciphers =
            derive_cipher_pair(&self.buffer, self.secret.as_deref(), ConnectionRole::Server);
        ciphers.decrypt.skip(MAGIC_OFFSET);
        ciphers.decrypt.apply(&mut self.buffer[MAGIC_OFFSET..]);

        let b = &self.buffer;
        let magic = u32::from_le_bytes([b[56], b[57], b[58], b[59]]);
        if magic != PROXY_MAGIC {
            return Err(HandshakeError::BadMagic(magic));
        }

        let dc = i16::from_le_bytes([b[DC_OFFSET], b[DC_OFFSET + 1]]);
        Ok(ServerEstablished { dc, ciphers })
    }
}

/// Read from `stream` until a server-role handshake completes
///
/// `input` may already hold bytes (e.g. from protocol detection). On success
/// it holds whatever arrived past the handshake packet.
pub async fn read_server_handshake<S>(
    stream: &mut S,
    input: &mut BytesMut,
    secret: Option<Bytes>,
    read_size: usize,
) -> crate::error::Result<ServerEstablished>
where
    S: AsyncRead + Unpin,
{
    let mut handshake = ServerHandshake::new(secret);

    loop {
        handshake = match handshake.advance(input)? {
            ServerProgress::Established(established) => return Ok(established),
            ServerProgress::AwaitingBytes(pending) => pending,
        };

        input.reserve(read_size);
        if stream.read_buf(input).await? == 0 {
            return Err(HandshakeError::UnexpectedEof {
                received: HANDSHAKE_LEN - handshake.remaining(),
            }
            .into());
        }
    }
}

// ========== Client role ==========

/// Client-role handshake toward an upstream peer
pub struct ClientHandshake {
    secret: Option<Bytes>,
    dc: i16,
}

impl ClientHandshake {
    /// `dc` is forwarded unmodified from the downstream client
    pub fn new(secret: Option<Bytes>, dc: i16) -> Self {
        Self { secret, dc }
    }

    /// Build the packet to send and the ciphers for the rest of the stream
    pub fn encode<R>(self, rng: &mut R) -> ([u8; HANDSHAKE_LEN], CipherPair)
    where
        R: RngCore + ?Sized,
    {
        let mut packet = [0u8; HANDSHAKE_LEN];
        loop {
            rng.fill_bytes(&mut packet);
            if !has_reserved_prefix(&packet) {
                break;
            }
        }

        packet[MAGIC_OFFSET..DC_OFFSET].copy_from_slice(&PROXY_MAGIC.to_le_bytes());
        packet[DC_OFFSET..DC_OFFSET + 2].copy_from_slice(&self.dc.to_le_bytes());

        let mut ciphers =
            derive_cipher_pair(&packet, self.secret.as_deref(), ConnectionRole::Client);
        ciphers.encrypt.skip(MAGIC_OFFSET);
        ciphers.encrypt.apply(&mut packet[MAGIC_OFFSET..]);

        (packet, ciphers)
    }
}

/// Send a client-role handshake; no reply is awaited
pub async fn write_client_handshake<S>(
    stream: &mut S,
    secret: Option<Bytes>,
    dc: i16,
) -> std::io::Result<CipherPair>
where
    S: AsyncWrite + Unpin,
{
    let (packet, ciphers) = ClientHandshake::new(secret, dc).encode(&mut rand::thread_rng());
    stream.write_all(&packet).await?;
    stream.flush().await?;
    Ok(ciphers)
}
