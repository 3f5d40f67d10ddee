//! RTP fixed header (RFC 3550 §5.1): a zero-copy view for received packets
//! and a stateful writer for outbound ones.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! ST 2022-6 senders never use CSRCs or header extensions, so the payload
//! always starts at byte 12 and the marker bit flags the last packet of a
//! video frame.

use crate::error::{HbrmtError, Result};

pub const RTP_HEADER_LEN: usize = 12;

/// Dynamic payload type conventionally used for ST 2022-6.
pub const PAYLOAD_TYPE_ST2022_6: u8 = 98;

/// Read-only view over a received RTP packet.
#[derive(Debug, Clone, Copy)]
pub struct RtpPacket<'a> {
    buf: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// Wrap `buf`, which must hold at least the fixed header.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(HbrmtError::Malformed {
                unit: "RTP packet",
                len: buf.len(),
                min: RTP_HEADER_LEN,
            });
        }
        Ok(Self { buf })
    }

    pub fn version(&self) -> u8 {
        self.buf[0] >> 6
    }

    pub fn padding(&self) -> bool {
        self.buf[0] & 0x20 != 0
    }

    pub fn extension(&self) -> bool {
        self.buf[0] & 0x10 != 0
    }

    pub fn csrc_count(&self) -> u8 {
        self.buf[0] & 0x0f
    }

    pub fn marker(&self) -> bool {
        self.buf[1] & 0x80 != 0
    }

    pub fn payload_type(&self) -> u8 {
        self.buf[1] & 0x7f
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.buf[2], self.buf[3]])
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]])
    }

    /// The marker bit: last packet of a video frame.
    pub fn is_end_of_frame(&self) -> bool {
        self.marker()
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.buf[RTP_HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }
}

/// Read the sequence number of a raw packet without building a view.
pub fn sequence_of(buf: &[u8]) -> Option<u16> {
    (buf.len() >= RTP_HEADER_LEN).then(|| u16::from_be_bytes([buf[2], buf[3]]))
}

/// Serialize a fixed header with zero timestamp and SSRC.
pub fn write_header(marker: bool, payload_type: u8, sequence: u16) -> [u8; RTP_HEADER_LEN] {
    let mut header = [0u8; RTP_HEADER_LEN];
    header[0] = 2 << 6;
    header[1] = ((marker as u8) << 7) | (payload_type & 0x7f);
    header[2..4].copy_from_slice(&sequence.to_be_bytes());
    header
}

/// Outbound RTP header state: payload type, SSRC and a wrapping sequence
/// number advanced on every [`write`](Self::write).
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32, sequence: u16) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            sequence,
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence,
            timestamp: 0,
        }
    }

    /// Start from a random sequence number and SSRC (RFC 3550 §5.1, §8.1).
    pub fn with_random_state(pt: u8) -> Self {
        Self::new(pt, rand::random::<u32>(), rand::random::<u16>())
    }

    /// Sequence number the next [`write`](Self::write) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    /// Serialize a 12-byte header and advance the sequence number.
    pub fn write(&mut self, marker: bool) -> [u8; RTP_HEADER_LEN] {
        let mut header = write_header(marker, self.pt, self.sequence);
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}
