//! Wire formats of an ST 2022-6 stream.
//!
//! ## Layers
//!
//! Each datagram carries one RTP packet whose payload starts with an HBRMT
//! header followed by a slice of the SDI transport frame:
//!
//! ```text
//! +-----------------+----------------------+---------------------------+
//! | RTP header 12 B | HBRMT header 8/12 B  | SDI words (10-bit packed) |
//! +-----------------+----------------------+---------------------------+
//! ```
//!
//! - [`rtp`]: fixed RTP header (RFC 3550). Only the sequence number and the
//!   marker bit drive reception; the HBRMT timestamp is the media time.
//! - [`hbrmt`]: the HBRMT payload header and its FRAME/FRATE/SAMPLE tables.
//! - [`words`]: 10-bit words packed four to five bytes, big-endian.
//! - [`crc`]: SMPTE 292 line CRC-18.
//! - [`audio`]: SMPTE 299 embedded audio ancillary packets.
//! - [`packetizer`]: transport frame to RTP packets, for transmit.

pub mod audio;
pub mod crc;
pub mod hbrmt;
pub mod packetizer;
pub mod rtp;
pub mod words;
