//! HBRMT payload header (SMPTE ST 2022-6 §5.3).
//!
//! Carried right after the RTP header of every media packet:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Ext  |F|VSID |   FRCount     | R |S|S| FEC |  CF   |Reserved |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  MAP  |      FRAME    |     FRATE     |SAMPLE |   Reserved    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              Video timestamp (present when CF != 0)           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              Header extension (Ext x 4 bytes)                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! FRAME, FRATE and SAMPLE are codes into the tables at the bottom of this
//! module. Together with MAP they identify the video format, which
//! [`profile::resolve_from_header`](crate::profile::resolve_from_header)
//! turns into a [`SmpteProfile`](crate::profile::SmpteProfile).

use crate::error::{HbrmtError, Result, Stage};
use crate::profile::SmpteProfile;

/// Fixed part of the header.
pub const HBRMT_FIXED_LEN: usize = 8;
/// Fixed part plus video timestamp, as emitted by the packetizer.
pub const HBRMT_HEADER_LEN: usize = 12;
const TIMESTAMP_LEN: usize = 4;

/// Video timestamp clock (CF field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockFrequency {
    /// No video timestamp in the header.
    None,
    Mhz27,
    Mhz148_5,
    Mhz148_5Div1001,
    Mhz297,
    Mhz297Div1001,
    Reserved(u8),
}

impl ClockFrequency {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::None,
            1 => Self::Mhz27,
            2 => Self::Mhz148_5,
            3 => Self::Mhz148_5Div1001,
            4 => Self::Mhz297,
            5 => Self::Mhz297Div1001,
            other => Self::Reserved(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Mhz27 => 1,
            Self::Mhz148_5 => 2,
            Self::Mhz148_5Div1001 => 3,
            Self::Mhz297 => 4,
            Self::Mhz297Div1001 => 5,
            Self::Reserved(code) => code,
        }
    }

    pub fn has_timestamp(self) -> bool {
        self != Self::None
    }
}

/// Reference of the video timestamp (R field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampReference {
    NotLocked,
    Reserved,
    LockedUtc,
    LockedPrivate,
}

impl TimestampReference {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::NotLocked,
            1 => Self::Reserved,
            2 => Self::LockedUtc,
            _ => Self::LockedPrivate,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::NotLocked => 0,
            Self::Reserved => 1,
            Self::LockedUtc => 2,
            Self::LockedPrivate => 3,
        }
    }
}

/// Decoded HBRMT payload header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HbrmtHeader {
    /// Number of 32-bit extension words following the header.
    pub ext: u8,
    /// Video source format present (F bit).
    pub f: bool,
    /// Video source ID, 3 bits.
    pub vsid: u8,
    /// Frame counter, modulo 256.
    pub frame_count: u8,
    pub reference: TimestampReference,
    /// Video source format flags (S field), 2 bits.
    pub s: u8,
    /// FEC usage, 3 bits.
    pub fec: u8,
    pub clock: ClockFrequency,
    /// Mapping of the source onto the payload: 0 direct, 1 level-B dual-link.
    pub map: u8,
    pub frame: u8,
    pub frate: u8,
    pub sample: u8,
    /// Video timestamp, zero when [`clock`](Self::clock) is `None`.
    pub timestamp: u32,
}

impl HbrmtHeader {
    /// Decode the header at the start of an RTP payload.
    ///
    /// Fails when the payload is shorter than the header it declares.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < HBRMT_FIXED_LEN {
            return Err(HbrmtError::Malformed {
                unit: "HBRMT header",
                len: payload.len(),
                min: HBRMT_FIXED_LEN,
            });
        }
        let b = payload;
        let clock = ClockFrequency::from_code(((b[2] & 0x01) << 3) | (b[3] >> 5));
        let mut header = Self {
            ext: b[0] >> 4,
            f: b[0] & 0x08 != 0,
            vsid: b[0] & 0x07,
            frame_count: b[1],
            reference: TimestampReference::from_bits(b[2] >> 6),
            s: (b[2] >> 4) & 0b11,
            fec: (b[2] >> 1) & 0b111,
            clock,
            map: b[4] >> 4,
            frame: (b[4] << 4) | (b[5] >> 4),
            frate: (b[5] << 4) | (b[6] >> 4),
            sample: b[6] & 0x0f,
            timestamp: 0,
        };
        let len = header.header_len();
        if payload.len() < len {
            return Err(HbrmtError::Malformed {
                unit: "HBRMT header",
                len: payload.len(),
                min: len,
            });
        }
        if clock.has_timestamp() {
            header.timestamp = u32::from_be_bytes([b[8], b[9], b[10], b[11]]);
        }
        Ok(header)
    }

    /// Bytes occupied by the header, extension words included.
    pub fn header_len(&self) -> usize {
        let timestamp = if self.clock.has_timestamp() { TIMESTAMP_LEN } else { 0 };
        HBRMT_FIXED_LEN + timestamp + usize::from(self.ext) * 4
    }

    /// Header fields a sender fixes for the lifetime of a stream of
    /// `profile`: FRAME, FRATE and SAMPLE codes derived from its geometry,
    /// F set, 148.5/1.001 MHz timestamp clock.
    ///
    /// Codes the tables cannot express are left at zero; see
    /// [`is_transmittable`](Self::is_transmittable).
    pub fn from_profile(profile: &SmpteProfile) -> Self {
        let frame = FRAME_CODES
            .iter()
            .find(|c| {
                c.active_width == profile.active_width
                    && c.active_height == profile.active_height
                    && c.interlaced() == profile.interlaced
            })
            .map_or(0, |c| c.code);
        let frate = FRATE_CODES
            .iter()
            .find(|c| c.rate == profile.frame_rate)
            .map_or(0, |c| c.code);
        let sample = SAMPLE_CODES
            .iter()
            .find(|c| c.bit_depth == profile.bit_depth && c.sampling == Sampling::YCbCr422)
            .map_or(0, |c| c.code);
        for (field, code) in [("FRAME", frame), ("FRATE", frate), ("SAMPLE", sample)] {
            if code == 0 {
                tracing::warn!(profile = profile.name, field, stage = %Stage::Format, "no HBRMT code for profile");
            }
        }

        Self {
            ext: 0,
            f: true,
            vsid: 0,
            frame_count: 0,
            reference: TimestampReference::NotLocked,
            s: 0,
            fec: 0,
            clock: ClockFrequency::Mhz148_5Div1001,
            map: profile.map,
            frame,
            frate,
            sample,
            timestamp: 0,
        }
    }

    /// Whether the format codes are all known.
    pub fn is_transmittable(&self) -> bool {
        self.frame != 0 && self.frate != 0 && self.sample != 0
    }

    /// Serialize into `buf`, returning the number of bytes written
    /// ([`header_len`](Self::header_len) minus extension words, which are
    /// zero-filled).
    ///
    /// # Panics
    ///
    /// If `buf` is shorter than [`header_len`](Self::header_len).
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let len = self.header_len();
        let out = &mut buf[..len];
        out.fill(0);
        out[0] = (self.ext << 4) | ((self.f as u8) << 3) | (self.vsid & 0b111);
        out[1] = self.frame_count;
        let cf = self.clock.code();
        out[2] = (self.reference.bits() << 6)
            | ((self.s & 0b11) << 4)
            | ((self.fec & 0b111) << 1)
            | ((cf >> 3) & 1);
        out[3] = (cf & 0b111) << 5;
        out[4] = (self.map << 4) | (self.frame >> 4);
        out[5] = (self.frame << 4) | (self.frate >> 4);
        out[6] = (self.frate << 4) | (self.sample & 0x0f);
        if self.clock.has_timestamp() {
            out[8..12].copy_from_slice(&self.timestamp.to_be_bytes());
        }
        len
    }
}

/// Colour sampling of the SAMPLE code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    YCbCr422,
    YCbCr444,
}

/// Row of the FRAME table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCode {
    pub code: u8,
    pub active_width: usize,
    pub active_height: usize,
    pub scanlines: usize,
    /// 0 interlaced, 1 progressive.
    pub sampling_struct: u8,
    /// 0 interlaced, 1 progressive, 2 progressive segmented frame.
    pub transport_struct: u8,
}

impl FrameCode {
    pub fn interlaced(&self) -> bool {
        self.sampling_struct == 0
    }
}

/// Row of the FRATE table. Rates are frames per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrateCode {
    pub code: u8,
    pub rate: f32,
}

/// Row of the SAMPLE table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleCode {
    pub code: u8,
    pub sampling: Sampling,
    pub bit_depth: usize,
}

const fn frame_code(
    code: u8,
    active_width: usize,
    active_height: usize,
    scanlines: usize,
    sampling_struct: u8,
    transport_struct: u8,
) -> FrameCode {
    FrameCode {
        code,
        active_width,
        active_height,
        scanlines,
        sampling_struct,
        transport_struct,
    }
}

pub static FRAME_CODES: [FrameCode; 8] = [
    frame_code(0x10, 720, 486, 525, 0, 0),
    frame_code(0x11, 720, 576, 625, 0, 0),
    frame_code(0x20, 1920, 1080, 1125, 0, 0),
    frame_code(0x21, 1920, 1080, 1125, 1, 1),
    frame_code(0x22, 1920, 1080, 1125, 1, 2),
    frame_code(0x23, 2048, 1080, 1125, 1, 1),
    frame_code(0x24, 2048, 1080, 1125, 1, 2),
    frame_code(0x30, 1280, 720, 750, 1, 1),
];

pub static FRATE_CODES: [FrateCode; 10] = [
    FrateCode { code: 0x10, rate: 60.0 },
    FrateCode { code: 0x11, rate: 59.94 },
    FrateCode { code: 0x12, rate: 50.0 },
    FrateCode { code: 0x14, rate: 48.0 },
    FrateCode { code: 0x15, rate: 47.95 },
    FrateCode { code: 0x16, rate: 30.0 },
    FrateCode { code: 0x17, rate: 29.97 },
    FrateCode { code: 0x18, rate: 25.0 },
    FrateCode { code: 0x1a, rate: 24.0 },
    FrateCode { code: 0x1b, rate: 23.97 },
];

pub static SAMPLE_CODES: [SampleCode; 4] = [
    SampleCode { code: 0x01, sampling: Sampling::YCbCr422, bit_depth: 10 },
    SampleCode { code: 0x02, sampling: Sampling::YCbCr444, bit_depth: 10 },
    SampleCode { code: 0x05, sampling: Sampling::YCbCr422, bit_depth: 12 },
    SampleCode { code: 0x06, sampling: Sampling::YCbCr444, bit_depth: 12 },
];

pub fn frame_code_of(code: u8) -> Option<&'static FrameCode> {
    FRAME_CODES.iter().find(|c| c.code == code)
}

pub fn frate_code_of(code: u8) -> Option<&'static FrateCode> {
    FRATE_CODES.iter().find(|c| c.code == code)
}

/// Index of `code` in [`SAMPLE_CODES`].
pub fn sample_index_of(code: u8) -> Option<usize> {
    SAMPLE_CODES.iter().position(|c| c.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile;

    fn header_720p60() -> HbrmtHeader {
        HbrmtHeader::from_profile(profile::resolve_by_name("720p60").unwrap())
    }

    #[test]
    fn profile_defaults() {
        let h = header_720p60();
        assert!(h.f);
        assert_eq!(h.clock, ClockFrequency::Mhz148_5Div1001);
        assert_eq!((h.frame, h.frate, h.sample), (0x30, 0x10, 0x01));
        assert!(h.is_transmittable());
        assert_eq!(h.header_len(), HBRMT_HEADER_LEN);
    }

    #[test]
    fn unknown_rate_is_not_transmittable() {
        let profile = SmpteProfile {
            frame_rate: 15.0,
            ..profile::resolve_by_name("720p60").unwrap().clone()
        };
        let h = HbrmtHeader::from_profile(&profile);
        assert_eq!(h.frate, 0);
        assert_eq!(h.frame, 0x30);
        assert!(!h.is_transmittable());
    }

    #[test]
    fn encode_then_decode() {
        let mut h = header_720p60();
        h.vsid = 5;
        h.fec = 0b101;
        h.frame_count = 200;
        h.timestamp = 0xDEADBEEF;
        h.reference = TimestampReference::LockedUtc;

        let mut buf = [0u8; HBRMT_HEADER_LEN];
        assert_eq!(h.encode(&mut buf), HBRMT_HEADER_LEN);
        assert_eq!(HbrmtHeader::decode(&buf).unwrap(), h);
    }

    #[test]
    fn vsid_and_fec_do_not_leak() {
        let mut h = header_720p60();
        h.vsid = 0xff;
        h.fec = 0xff;
        let mut buf = [0u8; HBRMT_HEADER_LEN];
        h.encode(&mut buf);
        assert_eq!(buf[0] & 0xf0, 0x00);
        assert_eq!(buf[0] & 0x08, 0x08);
        assert_eq!(buf[2] & 0x0e, 0x0e);
        assert_eq!(buf[2] & 0xf0, 0x00);
        assert_eq!(buf[2] & 0x01, 0x00);
    }

    #[test]
    fn field_layout() {
        // MAP=1, FRAME=0x21, FRATE=0x10, SAMPLE=0x1, CF=3
        let buf = [0x08, 0x07, 0x00, 0x60, 0x12, 0x11, 0x01, 0x00, 0, 0, 0, 42];
        let h = HbrmtHeader::decode(&buf).unwrap();
        assert_eq!(h.frame_count, 7);
        assert_eq!(h.clock, ClockFrequency::Mhz148_5Div1001);
        assert_eq!(h.map, 1);
        assert_eq!(h.frame, 0x21);
        assert_eq!(h.frate, 0x10);
        assert_eq!(h.sample, 0x01);
        assert_eq!(h.timestamp, 42);
    }

    #[test]
    fn no_clock_means_no_timestamp() {
        let buf = [0x08, 0, 0, 0, 0x03, 0x01, 0x01, 0];
        let h = HbrmtHeader::decode(&buf).unwrap();
        assert_eq!(h.clock, ClockFrequency::None);
        assert_eq!(h.header_len(), HBRMT_FIXED_LEN);
        assert_eq!(h.timestamp, 0);
    }

    #[test]
    fn extension_words_lengthen_header() {
        let mut buf = [0u8; 16];
        buf[0] = 0x10; // ext = 1
        buf[3] = 0x20; // cf = 1
        let h = HbrmtHeader::decode(&buf).unwrap();
        assert_eq!(h.header_len(), 16);
        assert!(HbrmtHeader::decode(&buf[..12]).is_err());
    }

    #[test]
    fn short_payload_rejected() {
        assert!(matches!(
            HbrmtHeader::decode(&[0u8; 7]),
            Err(HbrmtError::Malformed { min: 8, .. })
        ));
        // cf != 0 but timestamp missing
        assert!(HbrmtHeader::decode(&[0, 0, 0, 0x60, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn reserved_clock_kept() {
        assert_eq!(ClockFrequency::from_code(7), ClockFrequency::Reserved(7));
        assert_eq!(ClockFrequency::Reserved(7).code(), 7);
    }
}
