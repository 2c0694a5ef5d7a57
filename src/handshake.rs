use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::info_hash::InfoHash;
use crate::peer_id::PeerId;

/// The BitTorrent protocol identifier.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Length of the handshake message in bytes.
pub const HANDSHAKE_LEN: usize = 68;

/// Errors from decoding a handshake frame.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The frame was shorter than the fixed handshake length.
    #[error("invalid handshake length")]
    InvalidLength,
    /// The frame does not start with the BitTorrent protocol identifier.
    #[error("unknown protocol identifier")]
    UnknownProtocol,
}

/// Protocol extensions advertised in the reserved handshake bytes.
///
/// Bits in the reserved bytes indicate protocol extensions:
/// - Byte 5, bit 4: Extension protocol ([BEP-10])
/// - Byte 7, bit 0: DHT ([BEP-5])
/// - Byte 7, bit 2: Fast extension ([BEP-6])
///
/// [BEP-5]: http://bittorrent.org/beps/bep_0005.html
/// [BEP-6]: http://bittorrent.org/beps/bep_0006.html
/// [BEP-10]: http://bittorrent.org/beps/bep_0010.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extensions {
    /// Extension protocol (BEP-10).
    pub extended: bool,
    /// DHT port announcements (BEP-5).
    pub dht: bool,
    /// Fast extension (BEP-6).
    pub fast: bool,
}

impl Extensions {
    /// Decodes the extension bits from the reserved bytes.
    pub fn from_reserved(reserved: &[u8; 8]) -> Self {
        Self {
            extended: (reserved[5] & 0x10) != 0,
            dht: (reserved[7] & 0x01) != 0,
            fast: (reserved[7] & 0x04) != 0,
        }
    }

    /// Encodes the extension bits into reserved bytes.
    pub fn to_reserved(self) -> [u8; 8] {
        let mut reserved = [0u8; 8];
        if self.extended {
            reserved[5] |= 0x10;
        }
        if self.dht {
            reserved[7] |= 0x01;
        }
        if self.fast {
            reserved[7] |= 0x04;
        }
        reserved
    }
}

/// The BitTorrent handshake message.
///
/// The handshake is the first message exchanged between peers and includes:
/// - Protocol identifier ("BitTorrent protocol")
/// - Reserved bytes (8 bytes, used for capability flags)
/// - Info hash (20 bytes, identifies the torrent)
/// - Peer ID (20 bytes, identifies the client)
#[derive(Debug, Clone)]
pub struct Handshake {
    /// The torrent's info hash.
    pub info_hash: InfoHash,
    /// The sender's peer ID.
    pub peer_id: PeerId,
    /// Extensions advertised in the reserved bytes.
    pub extensions: Extensions,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, extensions: Extensions) -> Self {
        Self {
            info_hash,
            peer_id,
            extensions,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.extensions.to_reserved());
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(self.peer_id.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, HandshakeError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(HandshakeError::InvalidLength);
        }
        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(HandshakeError::UnknownProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash: InfoHash::from_bytes(info_hash),
            peer_id: PeerId(peer_id),
            extensions: Extensions::from_reserved(&reserved),
        })
    }
}
