//! GVSP datagram header decoding
//!
//! Every stream datagram starts with a fixed 8-byte header. Leader datagrams
//! additionally carry the capture timestamp at offset 12.
//!
//! # Wire Format
//!
//! All integers are big-endian:
//! ```text
//! [0..2]   status
//! [2..4]   block id
//! [4]      format (0 = error, 1 = leader, 2 = trailer, 3 = payload)
//! [5..8]   packet id (24 bit)
//! [8..]    payload bytes (payload datagrams)
//! [12..20] capture timestamp (leader datagrams)
//! ```

use thiserror::Error;

/// Size of the common datagram header in bytes
pub const HEADER_LEN: usize = 8;

/// Offset of the capture timestamp inside a leader datagram
pub const LEADER_TIMESTAMP_OFFSET: usize = 12;

/// Minimum leader length that still contains the capture timestamp
pub const LEADER_MIN_LEN: usize = LEADER_TIMESTAMP_OFFSET + 8;

/// Largest value the 24-bit packet id field can carry
pub const MAX_PACKET_ID: u32 = 0x00FF_FFFF;

/// Errors raised while decoding a datagram header
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Datagram is too short to contain the 8-byte header.
    #[error("malformed datagram: {len} bytes is shorter than the {HEADER_LEN}-byte header")]
    Malformed {
        /// Length of the rejected datagram.
        len: usize,
    },

    /// Leader datagram ends before the capture timestamp.
    #[error("truncated leader: {len} bytes, timestamp needs {LEADER_MIN_LEN}")]
    TruncatedLeader {
        /// Length of the leader datagram.
        len: usize,
    },
}

/// Role of a datagram within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketFormat {
    /// Camera-side error report (also used for unknown format bytes)
    Error,
    /// Start of a frame, carries the capture timestamp
    Leader,
    /// End of a frame
    Trailer,
    /// Chunk of pixel data
    Payload,
}

impl PacketFormat {
    /// Map the on-wire format byte; unknown values are treated as `Error`
    pub fn from_wire(value: u8) -> Self {
        match value {
            1 => Self::Leader,
            2 => Self::Trailer,
            3 => Self::Payload,
            _ => Self::Error,
        }
    }

    /// On-wire format byte
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Error => 0,
            Self::Leader => 1,
            Self::Trailer => 2,
            Self::Payload => 3,
        }
    }
}

/// Decoded datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Camera status code, propagated for diagnostics only
    pub status: u16,
    /// Frame this datagram belongs to
    pub block_id: u16,
    /// Datagram role
    pub format: PacketFormat,
    /// Ordering key within a frame (24 bit)
    pub packet_id: u32,
}

impl PacketHeader {
    /// Serialize the header into its 8-byte wire form
    ///
    /// Packet ids above 24 bits are truncated to the low 24 bits.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let status = self.status.to_be_bytes();
        let block = self.block_id.to_be_bytes();
        let id = (self.packet_id & MAX_PACKET_ID).to_be_bytes();
        [
            status[0],
            status[1],
            block[0],
            block[1],
            self.format.to_wire(),
            id[1],
            id[2],
            id[3],
        ]
    }
}

/// Decode the common header of a datagram
///
/// # Errors
///
/// Returns `HeaderError::Malformed` if the datagram is shorter than 8 bytes.
#[inline]
pub fn decode(datagram: &[u8]) -> Result<PacketHeader, HeaderError> {
    if datagram.len() < HEADER_LEN {
        return Err(HeaderError::Malformed {
            len: datagram.len(),
        });
    }

    Ok(PacketHeader {
        status: u16::from_be_bytes([datagram[0], datagram[1]]),
        block_id: u16::from_be_bytes([datagram[2], datagram[3]]),
        format: PacketFormat::from_wire(datagram[4]),
        packet_id: u32::from_be_bytes([0, datagram[5], datagram[6], datagram[7]]),
    })
}

/// Extract the 64-bit capture timestamp from a leader datagram
///
/// # Errors
///
/// Returns `HeaderError::TruncatedLeader` if the datagram ends before byte 20.
#[inline]
pub fn leader_timestamp(datagram: &[u8]) -> Result<u64, HeaderError> {
    let bytes: [u8; 8] = datagram
        .get(LEADER_TIMESTAMP_OFFSET..LEADER_MIN_LEN)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(HeaderError::TruncatedLeader {
            len: datagram.len(),
        })?;
    Ok(u64::from_be_bytes(bytes))
}

/// Payload bytes following the header (empty for short datagrams)
#[inline]
pub fn payload(datagram: &[u8]) -> &[u8] {
    datagram.get(HEADER_LEN..).unwrap_or(&[])
}
