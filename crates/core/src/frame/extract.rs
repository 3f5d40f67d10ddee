//! Pull picture, audio and ancillary space out of a single-link frame.

use crate::error::{HbrmtError, Result};
use crate::media::audio::{AudioCodec, CONTROL_SCAN_START, DATA_SCAN_START, TAGGED_PACKET_LEN};
use crate::profile::SmpteProfile;

/// First byte of the horizontal ancillary space: EAV, XYZ, line number and
/// CRC take the first 16 words.
pub(crate) const HANC_START: usize = 20;
/// SAV plus its XYZ words.
pub(crate) const SAV_BYTES: usize = 10;

/// Bytes of horizontal ancillary space per scanline.
pub(crate) fn hanc_size(profile: &SmpteProfile) -> usize {
    profile.x_offset().saturating_sub(HANC_START + SAV_BYTES)
}

/// Copy the active picture, line by line and top to bottom, into `out`.
pub(crate) fn video(profile: &SmpteProfile, frame: &[u8], out: &mut [u8]) -> Result<usize> {
    let needed = profile.video_size();
    if out.len() < needed {
        return Err(HbrmtError::OutputTooSmall {
            needed,
            available: out.len(),
        });
    }
    let line_size = profile.active_line_size();
    let scanline = profile.scanline_size();
    let x_offset = profile.x_offset();
    for (i, dst) in out[..needed].chunks_exact_mut(line_size).enumerate() {
        let at = profile.source_scanline(i) * scanline + x_offset;
        dst.copy_from_slice(&frame[at..at + line_size]);
    }
    Ok(needed)
}

/// Scan every scanline for audio packets and write them to `out` as
/// line-tagged records. Data packets come from the chroma stream, control
/// packets from the luma stream.
///
/// Stops early, keeping what fits, when `out` fills up.
pub(crate) fn audio(
    profile: &SmpteProfile,
    frame: &[u8],
    codec: &mut AudioCodec,
    out: &mut [u8],
) -> Result<usize> {
    let scanline = profile.scanline_size();
    let x_offset = profile.x_offset();
    let mut written = 0;
    for (line, words) in frame.chunks_exact(scanline).take(profile.scanlines).enumerate() {
        for start in [DATA_SCAN_START, CONTROL_SCAN_START] {
            let mut pos = start;
            while let Some(at) = codec.detect_adf(words, x_offset, pos) {
                let Ok(packet) = codec.read_from_smpte(words, at) else {
                    break;
                };
                if out.len() - written < TAGGED_PACKET_LEN {
                    tracing::warn!(line, written, "audio output full, dropping remaining packets");
                    return Ok(written);
                }
                written += packet.write_tagged(line as u32, &mut out[written..])?;
                pos = at + packet.kind().words() * codec.stride();
            }
        }
    }
    Ok(written)
}

/// Copy the raw horizontal ancillary space of every scanline into `out`, one
/// fixed-size block per scanline.
pub(crate) fn ancillary(profile: &SmpteProfile, frame: &[u8], out: &mut [u8]) -> Result<usize> {
    let block = hanc_size(profile);
    let needed = block * profile.scanlines;
    if out.len() < needed {
        return Err(HbrmtError::OutputTooSmall {
            needed,
            available: out.len(),
        });
    }
    if block == 0 {
        return Ok(0);
    }
    let lines = frame.chunks_exact(profile.scanline_size()).take(profile.scanlines);
    for (dst, src) in out[..needed].chunks_exact_mut(block).zip(lines) {
        dst.copy_from_slice(&src[HANC_START..HANC_START + block]);
    }
    Ok(needed)
}
