//! Build single-link transport frames for transmission.
//!
//! Each scanline starts with the timing reference of the previous line's
//! end (EAV), the line number and the line CRC, followed by the horizontal
//! ancillary space, the SAV and the active picture:
//!
//! ```text
//! | EAV 3FF 3FF 000 000 000 000 XYZ XYZ | LN0 LN0 LN1 LN1 | CRC x4 | HANC ... | SAV x8 | active |
//! ```
//!
//! Words alternate chroma and luma, so every timing word appears twice.

use super::extract::{HANC_START, SAV_BYTES};
use crate::error::{HbrmtError, Result};
use crate::media::audio::{
    AdfLayout, AudioPacket, CONTROL_PACKET_WORDS, CONTROL_SCAN_START, DATA_PACKET_WORDS,
    DATA_SCAN_START, PacketKind, TAGGED_PACKET_LEN,
};
use crate::media::crc::Crc18;
use crate::media::words::{set_word, words_in};
use crate::profile::SmpteProfile;

const BLACK_CHROMA: u16 = 0x200;
const BLACK_LUMA: u16 = 0x040;
const TRS: [u16; 6] = [0x3ff, 0x3ff, 0x000, 0x000, 0x000, 0x000];
const CRC_WORD: usize = 12;

#[derive(Debug, Clone, Default)]
pub struct BuilderOptions {
    /// Regenerate the line CRCs after inserting content.
    pub compute_crc: bool,
}

/// Owns one transport frame of a profile and fills it for transmission.
#[derive(Debug)]
pub struct FrameBuilder {
    profile: &'static SmpteProfile,
    frame: Vec<u8>,
    options: BuilderOptions,
}

impl FrameBuilder {
    /// Allocate a frame for `profile` and lay down black picture and timing
    /// words.
    pub fn new(profile: &'static SmpteProfile, options: BuilderOptions) -> Self {
        let mut builder = Self {
            profile,
            frame: vec![0u8; profile.frame_size()],
            options,
        };
        builder.prepare();
        builder
    }

    pub fn profile(&self) -> &'static SmpteProfile {
        self.profile
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn into_frame(self) -> Vec<u8> {
        self.frame
    }

    fn prepare(&mut self) {
        let p = self.profile;
        let words_per_line = p.scanline_width * p.components;
        let sav = words_in(p.x_offset() - SAV_BYTES);
        for (line, words) in self.frame.chunks_exact_mut(p.scanline_size()).enumerate() {
            for j in 0..words_per_line {
                set_word(words, j, if j % 2 == 0 { BLACK_CHROMA } else { BLACK_LUMA });
            }

            let number = line + 1;
            write_trs(words, 0, xyz(p, true, line));
            let [ln0, ln1] = line_number_words(number);
            for (k, w) in [ln0, ln0, ln1, ln1].into_iter().enumerate() {
                set_word(words, 8 + k, w);
            }
            write_trs(words, sav, xyz(p, false, line));
        }
    }

    /// Blank the horizontal ancillary space of every scanline.
    pub fn reset_blanking(&mut self) {
        let p = self.profile;
        let first = words_in(HANC_START) / 2;
        let last = words_in(p.x_offset() - SAV_BYTES) / 2;
        for words in self.frame.chunks_exact_mut(p.scanline_size()) {
            for j in first..last {
                set_word(words, 2 * j, BLACK_CHROMA);
                set_word(words, 2 * j + 1, BLACK_LUMA);
            }
        }
    }

    /// Copy an active picture into the frame, the inverse of video
    /// extraction. `video` holds lines top to bottom.
    pub fn insert_video(&mut self, video: &[u8]) -> Result<()> {
        let p = self.profile;
        let needed = p.video_size();
        if video.len() < needed {
            return Err(HbrmtError::Malformed {
                unit: "video picture",
                len: video.len(),
                min: needed,
            });
        }
        let line_size = p.active_line_size();
        let scanline = p.scanline_size();
        let x_offset = p.x_offset();
        for (i, src) in video[..needed].chunks_exact(line_size).enumerate() {
            let at = p.source_scanline(i) * scanline + x_offset;
            self.frame[at..at + line_size].copy_from_slice(src);
        }
        if self.options.compute_crc {
            self.compute_crc();
        }
        Ok(())
    }

    /// Write line-tagged audio records, as produced by audio extraction,
    /// back into the ancillary space. Data packets are packed from the start
    /// of the chroma stream, control packets from the start of the luma
    /// stream, in record order.
    ///
    /// Returns the number of packets written. Records naming a scanline
    /// outside the frame are skipped.
    pub fn insert_audio(&mut self, records: &[u8]) -> Result<usize> {
        let p = self.profile;
        let scanline = p.scanline_size();
        let mut written = 0;
        // next free slot per scanline: (data, control)
        let mut cursor = vec![(0usize, 0usize); p.scanlines];
        for record in records.chunks_exact(TAGGED_PACKET_LEN) {
            let (line, packet) = AudioPacket::read_tagged(record)?;
            let line = line as usize;
            if line >= p.scanlines {
                tracing::debug!(line, "audio record outside frame, skipped");
                continue;
            }
            let (data, control) = &mut cursor[line];
            let offset = match packet.kind() {
                PacketKind::Data => {
                    *data += 1;
                    DATA_SCAN_START + (*data - 1) * DATA_PACKET_WORDS * 2
                }
                PacketKind::Control => {
                    *control += 1;
                    CONTROL_SCAN_START + (*control - 1) * CONTROL_PACKET_WORDS * 2
                }
            };
            let hanc = &mut self.frame[line * scanline..line * scanline + p.x_offset() - SAV_BYTES];
            packet.write_smpte(hanc, offset, AdfLayout::Single)?;
            written += 1;
        }
        if self.options.compute_crc {
            self.compute_crc();
        }
        Ok(written)
    }

    /// Regenerate the chroma and luma CRC of every scanline. A line's CRC
    /// covers its active picture and the EAV and line number that follow it,
    /// and is stored in the next scanline. The last line has no successor and
    /// keeps its CRC words.
    pub fn compute_crc(&mut self) {
        let p = self.profile;
        let scanline = p.scanline_size();
        let x_offset = p.x_offset();
        let words = p.active_width + 6;
        let mut crc = Crc18::new();
        for line in 0..p.scanlines.saturating_sub(1) {
            let start = line * scanline + x_offset;
            crc.compute_scanline(&self.frame[start..], words, 0, 2);
            let (c0, c1) = (crc.crc0(), crc.crc1());
            crc.compute_scanline(&self.frame[start..], words, 1, 2);
            let (y0, y1) = (crc.crc0(), crc.crc1());

            let next = &mut self.frame[(line + 1) * scanline..];
            for (k, w) in [c0, y0, c1, y1].into_iter().enumerate() {
                set_word(next, CRC_WORD + k, w);
            }
        }
    }
}

fn write_trs(words: &mut [u8], at: usize, xyz: u16) {
    for (k, &w) in TRS.iter().enumerate() {
        set_word(words, at + k, w);
    }
    set_word(words, at + 6, xyz);
    set_word(words, at + 7, xyz);
}

/// LN0 and LN1 words of a 1-based line number.
fn line_number_words(number: usize) -> [u16; 2] {
    let number = number as u16;
    let l6 = (number >> 6) & 1;
    let ln0 = ((l6 ^ 1) << 9) | ((number & 0x7f) << 2);
    let ln1 = 0x200 | ((number & 0x780) >> 5);
    [ln0, ln1]
}

/// Timing reference word for scanline `line` (0-based): F, V and H flags
/// with their Hamming protection bits.
pub fn xyz(profile: &SmpteProfile, eav: bool, line: usize) -> u16 {
    let l = line + 1;
    let y1 = profile.y_offset_field1();
    let y2 = profile.y_offset_field2();
    let half = profile.active_height / 2;

    let h = u16::from(eav);
    let f = u16::from(profile.interlaced && l > y1 + half + 3);
    let mut v = l < y1 + 1;
    if profile.interlaced {
        v |= l > y1 + half && l < y2 + 1;
        v |= l >= y2 + half + 1;
    } else {
        v |= l > y1 + profile.active_height;
    }
    let v = u16::from(v);

    let p3 = v ^ h;
    let p2 = f ^ h;
    let p1 = f ^ v;
    let p0 = f ^ v ^ h;
    0x200 | (f << 8) | (v << 7) | (h << 6) | (p3 << 5) | (p2 << 4) | (p1 << 3) | (p0 << 2)
}
