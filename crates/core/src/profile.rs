//! Registry of SDI video formats and the geometry derived from them.
//!
//! A [`SmpteProfile`] describes one raster: total and active sizes, field
//! boundaries, sample layout and rate. All byte offsets used to slice a
//! transport frame (scanline size, horizontal blanking, first active line of
//! each field) derive from it.
//!
//! Three ways to pick a profile:
//!
//! - [`resolve_from_header`]: from the HBRMT codes of a received packet.
//!   This is the authoritative path used by the frame assembler.
//! - [`resolve_native`]: from a caller-described format.
//! - [`resolve_by_frame_size`]: legacy heuristic on the transport frame size.

use crate::error::{HbrmtError, Result, Stage};
use crate::media::hbrmt::{self, HbrmtHeader, SAMPLE_CODES};

/// SDI interface standard a profile is carried on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpteStandard {
    NotDefined,
    /// SMPTE 292M, HD-SDI 1.5G.
    Hd292M,
    /// SMPTE 372M, dual-link HD-SDI.
    DualLink372M,
    /// SMPTE 425M level A, 3G-SDI direct mapping.
    Level425MA,
    /// SMPTE 425M level B, dual-link mapping of two 1.5G streams.
    Level425MBDualLink,
    /// SMPTE 425M level B, dual-stream mapping.
    Level425MBDualStream,
    /// SMPTE 435M, 10G.
    Uhd435M,
    /// SMPTE 259M, SD-SDI.
    Sd259M,
}

/// One row of the profile table.
#[derive(Debug, Clone, PartialEq)]
pub struct SmpteProfile {
    pub name: &'static str,
    pub standard: SmpteStandard,
    /// HBRMT MAP code.
    pub map: u8,
    pub active_width: usize,
    pub active_height: usize,
    /// Samples per scanline, blanking included.
    pub scanline_width: usize,
    pub scanlines: usize,
    /// Interleaved components per sample (Y and C).
    pub components: usize,
    pub bit_depth: usize,
    /// First and last active line of field 1, 1-based.
    pub field1: (usize, usize),
    /// First and last active line of field 2, 1-based. `(0, 0)` when
    /// progressive.
    pub field2: (usize, usize),
    /// Frames per second.
    pub frame_rate: f32,
    pub interlaced: bool,
    pub multiplexed: bool,
}

impl SmpteProfile {
    /// Bytes per scanline, blanking included.
    pub fn scanline_size(&self) -> usize {
        self.scanline_width * self.components * self.bit_depth / 8
    }

    /// Bytes of one single-link frame.
    pub fn frame_size(&self) -> usize {
        self.scanline_size() * self.scanlines
    }

    /// Bytes of HBRMT payload per frame: twice the frame size for level-B
    /// dual-link, which carries two frames.
    pub fn transport_frame_size(&self) -> usize {
        if self.is_dual_link() {
            self.frame_size() * 2
        } else {
            self.frame_size()
        }
    }

    /// Byte offset of the first active sample within a scanline.
    pub fn x_offset(&self) -> usize {
        (self.scanline_width - self.active_width) * self.components * self.bit_depth / 8
    }

    /// Index of the first active scanline of field 1.
    pub fn y_offset_field1(&self) -> usize {
        self.field1.0.saturating_sub(1)
    }

    /// Index of the first active scanline of field 2.
    pub fn y_offset_field2(&self) -> usize {
        self.field2.0.saturating_sub(1)
    }

    /// Bytes of active picture per scanline.
    pub fn active_line_size(&self) -> usize {
        self.active_width * self.components * self.bit_depth / 8
    }

    /// Bytes of active picture per frame.
    pub fn video_size(&self) -> usize {
        self.active_line_size() * self.active_height
    }

    /// Whether the transport frame carries two interleaved single-link
    /// frames.
    pub fn is_dual_link(&self) -> bool {
        self.standard == SmpteStandard::Level425MBDualLink
    }

    /// Scanline index in the transport frame of active picture line `line`
    /// (0-based, top to bottom). Interlaced pictures alternate fields, field 1
    /// first.
    pub fn source_scanline(&self, line: usize) -> usize {
        if self.interlaced {
            if line % 2 == 0 {
                line / 2 + self.y_offset_field1()
            } else {
                line / 2 + self.y_offset_field2()
            }
        } else {
            line + self.y_offset_field1()
        }
    }
}

#[allow(clippy::too_many_arguments)]
const fn profile(
    name: &'static str,
    standard: SmpteStandard,
    map: u8,
    (active_width, active_height): (usize, usize),
    (scanline_width, scanlines): (usize, usize),
    field1: (usize, usize),
    field2: (usize, usize),
    frame_rate: f32,
    interlaced: bool,
    multiplexed: bool,
) -> SmpteProfile {
    SmpteProfile {
        name,
        standard,
        map,
        active_width,
        active_height,
        scanline_width,
        scanlines,
        components: 2,
        bit_depth: 10,
        field1,
        field2,
        frame_rate,
        interlaced,
        multiplexed,
    }
}

use SmpteStandard::{Hd292M, Level425MA, Level425MBDualLink, Sd259M};

const P: bool = false;
const I: bool = true;
const NO_FIELD2: (usize, usize) = (0, 0);

static PROFILES: [SmpteProfile; 17] = [
    // Full 858-sample raster: 2145-byte lines, 1,126,125-byte transport
    // frames (not 720 x 525 x 2.5 = 945,000).
    profile("525i29.97", Sd259M, 0, (720, 486), (858, 525), (20, 263), (283, 525), 29.97, I, false),
    profile("625i25", Sd259M, 0, (720, 576), (864, 625), (23, 310), (336, 623), 25.0, I, false),
    profile("1080p30", Hd292M, 0, (1920, 1080), (2200, 1125), (42, 1121), NO_FIELD2, 30.0, P, false),
    profile("1080p29.97", Hd292M, 0, (1920, 1080), (2200, 1125), (42, 1121), NO_FIELD2, 29.97, P, false),
    profile("1080p25", Hd292M, 0, (1920, 1080), (2640, 1125), (42, 1121), NO_FIELD2, 25.0, P, false),
    profile("1080i50", Hd292M, 0, (1920, 1080), (2640, 1125), (21, 560), (584, 1123), 25.0, I, false),
    profile("720p60", Hd292M, 0, (1280, 720), (1650, 750), (26, 745), NO_FIELD2, 60.0, P, false),
    profile("720p59.94", Hd292M, 0, (1280, 720), (1650, 750), (26, 745), NO_FIELD2, 59.94, P, false),
    profile("720p50", Hd292M, 0, (1280, 720), (1980, 750), (26, 745), NO_FIELD2, 50.0, P, false),
    profile("1080i59.94", Hd292M, 0, (1920, 1080), (2200, 1125), (21, 560), (584, 1123), 29.97, I, false),
    profile("1080i60", Hd292M, 0, (1920, 1080), (2200, 1125), (21, 560), (584, 1123), 30.0, I, false),
    profile("1080p50 LvlB DL", Level425MBDualLink, 1, (1920, 1080), (2640, 1125), (42, 1121), NO_FIELD2, 50.0, P, true),
    profile("1080p59.94 LvlB DL", Level425MBDualLink, 1, (1920, 1080), (2200, 1125), (42, 1121), NO_FIELD2, 59.94, P, true),
    profile("1080p60 LvlB DL", Level425MBDualLink, 1, (1920, 1080), (2200, 1125), (42, 1121), NO_FIELD2, 60.0, P, true),
    profile("1080p50 LvlA", Level425MA, 0, (1920, 1080), (2640, 1125), (42, 1121), NO_FIELD2, 50.0, P, true),
    profile("1080p59.94 LvlA", Level425MA, 0, (1920, 1080), (2200, 1125), (42, 1121), NO_FIELD2, 59.94, P, true),
    profile("1080p60 LvlA", Level425MA, 0, (1920, 1080), (2200, 1125), (42, 1121), NO_FIELD2, 60.0, P, true),
];

/// Every registered profile, in table order.
pub fn profiles() -> &'static [SmpteProfile] {
    &PROFILES
}

pub fn resolve_by_name(name: &str) -> Result<&'static SmpteProfile> {
    PROFILES
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| HbrmtError::UnknownProfile(name.to_string()))
}

/// Caller-described video format for [`resolve_native`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NativeFormat {
    pub width: usize,
    pub height: usize,
    /// HBRMT FRATE code.
    pub frate: u8,
    pub bit_depth: usize,
    pub interlaced: bool,
}

/// Match a native format description against the table.
pub fn resolve_native(format: &NativeFormat) -> Result<&'static SmpteProfile> {
    let rate = hbrmt::frate_code_of(format.frate)
        .ok_or_else(|| unsupported(format!("FRATE code {:#04x}", format.frate)))?
        .rate;
    PROFILES
        .iter()
        .find(|p| {
            p.active_width == format.width
                && p.active_height == format.height
                && p.frame_rate == rate
                && p.bit_depth == format.bit_depth
                && p.interlaced == format.interlaced
        })
        .ok_or_else(|| unsupported(format!("no profile for native format {format:?}")))
}

/// Resolve the profile of a stream from its HBRMT header.
///
/// Each lookup stage (FRAME, FRATE, SAMPLE, profile table) reports its own
/// failure so an unsupported stream can be diagnosed from the error alone.
pub fn resolve_from_header(header: &HbrmtHeader) -> Result<&'static SmpteProfile> {
    let frame = hbrmt::frame_code_of(header.frame)
        .ok_or_else(|| unsupported(format!("unknown FRAME code {:#04x}", header.frame)))?;
    let frate = hbrmt::frate_code_of(header.frate)
        .ok_or_else(|| unsupported(format!("unknown FRATE code {:#04x}", header.frate)))?;
    let mut sample = hbrmt::sample_index_of(header.sample)
        .ok_or_else(|| unsupported(format!("unknown SAMPLE code {:#04x}", header.sample)))?;

    let interlaced = frame.interlaced();
    if interlaced && (5..=7).contains(&sample) {
        // interlaced senders report the 12-bit variants of the 10-bit rows
        sample -= 5;
    }
    let bit_depth = SAMPLE_CODES[sample].bit_depth;

    PROFILES
        .iter()
        .find(|p| {
            p.active_width == frame.active_width
                && p.active_height == frame.active_height
                && p.scanlines == frame.scanlines
                && p.frame_rate == frate.rate
                && p.bit_depth == bit_depth
                && p.map == header.map
                && p.interlaced == interlaced
        })
        .ok_or_else(|| {
            unsupported(format!(
                "no profile for {}x{} {}, {} lines, {} fps, {} bit, map {}",
                frame.active_width,
                frame.active_height,
                if interlaced { "interlaced" } else { "progressive" },
                frame.scanlines,
                frate.rate,
                bit_depth,
                header.map
            ))
        })
}

/// Guess the profile from the size of a complete transport frame.
///
/// Legacy fallback for senders that do not fill the HBRMT format codes. Only
/// five sizes are recognised and several formats share each of them; prefer
/// [`resolve_from_header`].
pub fn resolve_by_frame_size(len: usize) -> Result<&'static SmpteProfile> {
    let name = match len {
        6_187_500 => "1080p30",
        7_425_000 => "1080p25",
        3_093_750 => "720p60",
        12_375_000 => "1080p60 LvlB DL",
        14_850_000 => "1080p50 LvlB DL",
        _ => return Err(unsupported(format!("no profile for a {len} byte frame"))),
    };
    tracing::warn!(len, profile = name, "profile guessed from frame size");
    resolve_by_name(name)
}

fn unsupported(detail: String) -> HbrmtError {
    HbrmtError::UnsupportedFormat {
        stage: Stage::Format,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_name(name: &str) -> &'static SmpteProfile {
        resolve_by_name(name).unwrap()
    }

    #[test]
    fn geometry_720p60() {
        let p = by_name("720p60");
        assert_eq!(p.scanline_size(), 4125);
        assert_eq!(p.transport_frame_size(), 3_093_750);
        assert_eq!(p.x_offset(), 925);
        assert_eq!(p.y_offset_field1(), 25);
        assert_eq!(p.active_line_size(), 3200);
    }

    #[test]
    fn geometry_525i() {
        let p = by_name("525i29.97");
        assert_eq!(p.scanline_size(), 2145);
        assert_eq!(p.frame_size(), 1_126_125);
        assert_eq!(p.y_offset_field2(), 282);
    }

    #[test]
    fn dual_link_doubles_transport() {
        let p = by_name("1080p60 LvlB DL");
        assert!(p.is_dual_link());
        assert_eq!(p.frame_size(), 6_187_500);
        assert_eq!(p.transport_frame_size(), 12_375_000);
        assert!(!by_name("1080p60 LvlA").is_dual_link());
    }

    #[test]
    fn interlaced_lines_alternate_fields() {
        let p = by_name("1080i50");
        assert_eq!(p.source_scanline(0), 20);
        assert_eq!(p.source_scanline(1), 583);
        assert_eq!(p.source_scanline(2), 21);
        assert_eq!(p.source_scanline(1079), 583 + 539);
    }

    #[test]
    fn header_round_trips_every_profile() {
        for p in profiles() {
            let header = HbrmtHeader::from_profile(p);
            let resolved = resolve_from_header(&header).unwrap();
            // profiles sharing every header field resolve to the first row
            assert_eq!(resolved.transport_frame_size(), p.transport_frame_size(), "{}", p.name);
            assert_eq!(resolved.interlaced, p.interlaced);
        }
    }

    #[test]
    fn header_picks_dual_link_by_map() {
        let mut header = HbrmtHeader::from_profile(by_name("1080p60 LvlA"));
        assert_eq!(resolve_from_header(&header).unwrap().name, "1080p60 LvlA");
        header.map = 1;
        assert_eq!(resolve_from_header(&header).unwrap().name, "1080p60 LvlB DL");
    }

    #[test]
    fn unknown_codes_name_their_stage() {
        let mut header = HbrmtHeader::from_profile(by_name("720p60"));
        header.frate = 0x1f;
        let err = resolve_from_header(&header).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("FRATE"));

        header.frate = 0x12;
        header.frame = 0x23;
        let err = resolve_from_header(&header).unwrap_err();
        assert!(err.to_string().contains("2048x1080"));
    }

    #[test]
    fn native_lookup() {
        let format = NativeFormat {
            width: 1920,
            height: 1080,
            frate: 0x12,
            bit_depth: 10,
            interlaced: false,
        };
        assert_eq!(resolve_native(&format).unwrap().name, "1080p50 LvlB DL");
        let format = NativeFormat { interlaced: true, frate: 0x18, ..format };
        assert_eq!(resolve_native(&format).unwrap().name, "1080i50");
    }

    #[test]
    fn legacy_size_lookup() {
        assert_eq!(resolve_by_frame_size(3_093_750).unwrap().name, "720p60");
        assert!(resolve_by_frame_size(1234).is_err());
    }

    #[test]
    fn unknown_name() {
        assert!(matches!(
            resolve_by_name("4k120"),
            Err(HbrmtError::UnknownProfile(_))
        ));
    }
}
