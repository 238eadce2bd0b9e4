//! Wire-format definitions for mux datagrams.
//!
//! Every datagram exchanged between the client and the proxy is a
//! [`Datagram`]: a fixed header naming the logical connection and the message
//! type, followed by an opaque payload owned by the coder.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Destination Address                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Random Id           |         Payload Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            Checksum           |     Type      |  Payload ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 15 bytes.
//! sport(2) + dport(2) + daddr(4) + random_id(2) + payload_len(2) + checksum(2) + type(1)
//!
//! The checksum sits on a 16-bit boundary so a receiver can verify it by
//! summing the datagram in place.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 15;

/// Largest payload a single datagram may carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Largest UDP payload an IPv4 datagram can carry: 65535 minus the IP and
/// UDP headers.
pub const MAX_IPV4_DATAGRAM: usize = 65_507;

// Byte offsets of each field within the serialised header.
const OFF_SPORT: usize = 0;
const OFF_DPORT: usize = 2;
const OFF_DADDR: usize = 4;
const OFF_RANDOM_ID: usize = 8;
const OFF_PAYLOAD_LEN: usize = 10;
const OFF_CHECKSUM: usize = 12;
const OFF_TYPE: usize = 14;

/// Names one logical TCP connection for its whole lifetime.
///
/// The random component tells apart two connections that reuse the same
/// port pair in quick succession.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Port of the application that opened the connection.
    pub source_port: u16,
    /// Port of the original destination.
    pub dest_port: u16,
    /// IPv4 address of the original destination, host byte order.
    pub dest_addr: u32,
    /// Random disambiguator picked by the client at accept time.
    pub random_id: u16,
}

impl Identity {
    /// Build an identity for a connection headed to `destination`.
    pub fn new(source_port: u16, destination: SocketAddrV4, random_id: u16) -> Self {
        Self {
            source_port,
            dest_port: destination.port(),
            dest_addr: u32::from(*destination.ip()),
            random_id,
        }
    }

    /// The original destination this connection was headed to.
    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.dest_addr), self.dest_port)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ":{}→{}#{:04x}",
            self.source_port,
            self.destination(),
            self.random_id
        )
    }
}

/// The eight message kinds a mux datagram can carry.
///
/// Tag values are the on-wire byte; `0` and everything above `8` are invalid.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Coded application bytes.
    Data = 1,
    /// Coder acknowledgement for previously received `Data`.
    Ack = 2,
    /// Keep-alive sent while a connection is still simplex.
    Empty = 3,
    /// Terminal: the sender has dropped this connection.
    Close = 4,
    /// The sender will no longer deliver data to its local application.
    WriteClosed = 5,
    WriteClosedAck = 6,
    /// The sender has no unacknowledged data left for this connection.
    NoOutstandingData = 7,
    NoOutstandingDataAck = 8,
}

impl MessageType {
    /// Every message type, in tag order.
    pub const ALL: [MessageType; 8] = [
        MessageType::Data,
        MessageType::Ack,
        MessageType::Empty,
        MessageType::Close,
        MessageType::WriteClosed,
        MessageType::WriteClosedAck,
        MessageType::NoOutstandingData,
        MessageType::NoOutstandingDataAck,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => MessageType::Data,
            2 => MessageType::Ack,
            3 => MessageType::Empty,
            4 => MessageType::Close,
            5 => MessageType::WriteClosed,
            6 => MessageType::WriteClosedAck,
            7 => MessageType::NoOutstandingData,
            8 => MessageType::NoOutstandingDataAck,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Data => "DATA",
            MessageType::Ack => "ACK",
            MessageType::Empty => "EMPTY",
            MessageType::Close => "CLOSE",
            MessageType::WriteClosed => "WRITE_CLOSED",
            MessageType::WriteClosedAck => "WRITE_CLOSED_ACK",
            MessageType::NoOutstandingData => "NO_OUTSTANDING_DATA",
            MessageType::NoOutstandingDataAck => "NO_OUTSTANDING_DATA_ACK",
        };
        f.write_str(name)
    }
}

/// A complete mux datagram: header fields + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub identity: Identity,
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

impl Datagram {
    pub fn new(identity: Identity, kind: MessageType, payload: Vec<u8>) -> Self {
        Self {
            identity,
            kind,
            payload,
        }
    }

    /// A datagram with no payload, used for every control message.
    pub fn control(identity: Identity, kind: MessageType) -> Self {
        Self::new(identity, kind, Vec::new())
    }

    /// Serialise this datagram into a newly allocated byte vector.
    ///
    /// Returns [`PacketError::PayloadTooLarge`] if the payload does not fit
    /// the 16-bit length field.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload_len));
        }
        let mut buf = vec![0u8; HEADER_LEN + payload_len];
        let id = &self.identity;

        buf[OFF_SPORT..OFF_SPORT + 2].copy_from_slice(&id.source_port.to_be_bytes());
        buf[OFF_DPORT..OFF_DPORT + 2].copy_from_slice(&id.dest_port.to_be_bytes());
        buf[OFF_DADDR..OFF_DADDR + 4].copy_from_slice(&id.dest_addr.to_be_bytes());
        buf[OFF_RANDOM_ID..OFF_RANDOM_ID + 2].copy_from_slice(&id.random_id.to_be_bytes());
        buf[OFF_TYPE] = self.kind.to_u8();
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
            .copy_from_slice(&(payload_len as u16).to_be_bytes());
        // Checksum field stays zero while computing the checksum.
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        Ok(buf)
    }

    /// Parse a [`Datagram`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the type byte is not a known [`MessageType`],
    /// - the `payload_len` field disagrees with `buf.len()`, or
    /// - the checksum does not verify.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }

        let payload_len = usize::from(read_u16(buf, OFF_PAYLOAD_LEN));
        if buf.len() != HEADER_LEN + payload_len {
            return Err(PacketError::LengthMismatch);
        }

        // Verify checksum: summing the stored checksum in place folds to zero.
        if internet_checksum(buf) != 0 {
            return Err(PacketError::ChecksumFailed);
        }

        let kind =
            MessageType::from_u8(buf[OFF_TYPE]).ok_or(PacketError::UnknownType(buf[OFF_TYPE]))?;

        Ok(Datagram {
            identity: Identity {
                source_port: read_u16(buf, OFF_SPORT),
                dest_port: read_u16(buf, OFF_DPORT),
                dest_addr: u32::from_be_bytes([
                    buf[OFF_DADDR],
                    buf[OFF_DADDR + 1],
                    buf[OFF_DADDR + 2],
                    buf[OFF_DADDR + 3],
                ]),
                random_id: read_u16(buf, OFF_RANDOM_ID),
            },
            kind,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Errors that can arise when encoding or parsing a datagram.
///
/// Every decode variant means the same thing to the reactor: the datagram
/// is malformed and gets dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("payload_len field does not match remaining bytes")]
    LengthMismatch,
    #[error("checksum verification failed")]
    ChecksumFailed,
    #[error("payload of {0} bytes exceeds the datagram limit")]
    PayloadTooLarge(usize),
}

#[inline]
fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// Sum consecutive 16-bit big-endian words, fold the carry, return the
/// one's-complement.  Over a buffer whose checksum field already holds the
/// correct value the result is zero.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    // Odd trailing byte: pad with a zero on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
