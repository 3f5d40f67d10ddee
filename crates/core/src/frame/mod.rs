//! Transport frame reconstruction.
//!
//! A [`TransportFrame`] accumulates the HBRMT payloads of one video frame,
//! packet by packet, and hands out typed [`MediaBuffer`] tokens once the
//! frame is complete.
//!
//! ## State machine
//!
//! ```text
//!               marker                       marker, size ok
//! WaitingSync ---------> Collecting ---------------------------> Complete
//!      ^                     |                                      |
//!      +---------------------+ gap, overflow, bad size              |
//!      ^                                                            |
//!      +------------------------------------------------------------+
//!                               init_new_frame
//! ```
//!
//! Any sequence discontinuity drops the whole frame: the receiver discards
//! everything up to the next end-of-frame marker and restarts from the first
//! packet after it. Continuity is checked across frame boundaries too, so a
//! frame missing its first packet is dropped like any other. A packet whose
//! HBRMT header cannot be decoded is skipped and counted; the frame it
//! belongs to is dropped at its marker. Frames are never published partially.
//!
//! ## Geometry binding
//!
//! The first packet binds a [`SmpteProfile`] from the HBRMT format codes.
//! The first complete frame may carry some trailing padding (up to one
//! packet); its amount is measured once and every later frame must match
//! `transport_frame_size + padding` exactly.

pub mod builder;
pub mod demux;
mod extract;

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{HbrmtError, Result, Stage};
use crate::media::audio::AudioCodec;
use crate::media::hbrmt::HbrmtHeader;
use crate::media::rtp::{PAYLOAD_TYPE_ST2022_6, RtpPacket};
use crate::profile::{self, SmpteProfile};
use demux::DemuxPool;

/// Size of an ST 2022-6 RTP packet; the first frame may carry at most this
/// much padding.
pub const RTP_PACKET_SIZE: usize = 1400;

/// Media carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    /// Raw horizontal ancillary space.
    Ancillary,
}

/// Which link of the frame a token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramePart {
    /// The whole single-link frame.
    Full,
    /// First link of a level-B dual-link frame.
    Half1,
    /// Second link of a level-B dual-link frame.
    Half2,
}

/// Token naming one extractable piece of a complete frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaBuffer {
    pub kind: MediaKind,
    pub part: FramePart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Discarding packets until the next end-of-frame marker.
    WaitingSync,
    Collecting,
    Complete,
}

/// Counters accumulated over the lifetime of a frame slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub packets: u64,
    pub dropped_waiting: u64,
    pub gaps: u64,
    pub lost_packets: u64,
    /// Packets skipped for an undecodable HBRMT header.
    pub malformed: u64,
    pub completed: u64,
    pub aborted: u64,
}

#[derive(Debug, Clone)]
pub struct FrameOptions {
    pub payload_type: u8,
    /// Publish only video tokens.
    pub video_only: bool,
    /// Bind this profile instead of resolving it from the first packet.
    pub profile: Option<&'static SmpteProfile>,
    /// Worker pool for dual-link streams; created on demand when absent.
    pub demux: Option<Arc<DemuxPool>>,
    /// Workers of an on-demand pool.
    pub demux_workers: usize,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self {
            payload_type: PAYLOAD_TYPE_ST2022_6,
            video_only: false,
            profile: None,
            demux: None,
            demux_workers: 10,
        }
    }
}

#[derive(Debug)]
struct DualLinkHalves {
    half1: Vec<u8>,
    half2: Vec<u8>,
    demuxed: bool,
}

/// Accumulator for one transport frame, reused frame after frame.
#[derive(Debug)]
pub struct TransportFrame {
    state: FrameState,
    options: FrameOptions,
    buffer: Vec<u8>,
    capacity: usize,
    last_seq: u16,
    /// Packets of the frame in progress that were skipped.
    skipped: usize,
    profile: Option<&'static SmpteProfile>,
    padding: Option<usize>,
    frame_count: u8,
    timestamp: u32,
    halves: Option<DualLinkHalves>,
    tokens: VecDeque<MediaBuffer>,
    audio: AudioCodec,
    stats: FrameStats,
}

impl Default for TransportFrame {
    fn default() -> Self {
        Self::new(FrameOptions::default())
    }
}

impl TransportFrame {
    pub fn new(options: FrameOptions) -> Self {
        let mut frame = Self {
            state: FrameState::WaitingSync,
            options,
            buffer: Vec::new(),
            capacity: 0,
            last_seq: 0,
            skipped: 0,
            profile: None,
            padding: None,
            frame_count: 0,
            timestamp: 0,
            halves: None,
            tokens: VecDeque::new(),
            audio: AudioCodec::new(),
            stats: FrameStats::default(),
        };
        if let Some(profile) = frame.options.profile {
            frame.bind(profile);
        }
        frame
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == FrameState::Complete
    }

    pub fn profile(&self) -> Option<&'static SmpteProfile> {
        self.profile
    }

    /// Trailing bytes measured on the first complete frame.
    pub fn padding(&self) -> Option<usize> {
        self.padding
    }

    /// HBRMT frame counter of the last complete frame.
    pub fn frame_count(&self) -> u8 {
        self.frame_count
    }

    /// HBRMT video timestamp of the last complete frame.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Sequence number of the last packet seen.
    pub fn last_sequence(&self) -> u16 {
        self.last_seq
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Bytes accumulated so far, padding included.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The accumulated transport frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Audio groups learnt so far.
    pub fn audio(&self) -> &AudioCodec {
        &self.audio
    }

    /// Size the buffers for `profile`. Reallocates only when the profile
    /// changes.
    fn bind(&mut self, profile: &'static SmpteProfile) {
        if self.profile == Some(profile) {
            return;
        }
        let capacity = profile.transport_frame_size() + RTP_PACKET_SIZE;
        self.buffer = Vec::with_capacity(capacity);
        self.capacity = capacity;
        self.padding = None;
        self.halves = None;
        self.profile = Some(profile);
        tracing::info!(
            profile = profile.name,
            transport_size = profile.transport_frame_size(),
            dual_link = profile.is_dual_link(),
            "profile bound"
        );
    }

    /// Prepare for the next frame. A complete frame goes back to collecting,
    /// with continuity checked from its last packet; a frame waiting for sync
    /// keeps waiting.
    pub fn init_new_frame(&mut self) {
        self.buffer.clear();
        self.tokens.clear();
        self.skipped = 0;
        if let Some(halves) = &mut self.halves {
            halves.demuxed = false;
        }
        if self.state == FrameState::Complete {
            self.state = FrameState::Collecting;
        }
    }

    /// Prepare for the frame that follows one completed elsewhere, whose last
    /// packet carried `last_seq`. The stream is at a frame boundary, so
    /// collecting starts right away with continuity checked from `last_seq`.
    pub fn resume_after(&mut self, last_seq: u16) {
        self.init_new_frame();
        self.state = FrameState::Collecting;
        self.last_seq = last_seq;
    }

    /// Continue the stream of `previous`, a complete frame held in another
    /// slot: same profile and padding, continuity checked from its last
    /// packet.
    pub fn continue_from(&mut self, previous: &TransportFrame) {
        if let Some(profile) = previous.profile {
            self.bind(profile);
            self.padding = previous.padding;
        }
        self.resume_after(previous.last_seq);
    }

    /// Drop the frame in progress and wait for the next end-of-frame marker.
    pub fn abort_current_frame(&mut self) {
        if self.state == FrameState::Collecting && !self.buffer.is_empty() {
            self.stats.aborted += 1;
        }
        self.state = FrameState::WaitingSync;
        self.buffer.clear();
        self.tokens.clear();
        self.skipped = 0;
    }

    /// Feed one RTP packet.
    ///
    /// Loss is not an error here: it switches the frame to
    /// [`FrameState::WaitingSync`] and shows up in [`stats`](Self::stats).
    /// Errors mean the packet was rejected; fatal ones (unsupported format,
    /// geometry mismatch) mean the stream cannot be received at all.
    pub fn add_packet(&mut self, packet: &RtpPacket<'_>) -> Result<()> {
        let seq = packet.sequence();
        if packet.payload_type() != self.options.payload_type {
            return Err(HbrmtError::UnexpectedPayloadType {
                received: packet.payload_type(),
                expected: self.options.payload_type,
                seq,
            });
        }
        if self.state == FrameState::Complete {
            self.init_new_frame();
        }
        self.stats.packets += 1;

        let expected = self.last_seq.wrapping_add(1);
        if self.state == FrameState::Collecting && seq != expected {
            let lost = seq.wrapping_sub(expected);
            tracing::warn!(
                expected,
                received = seq,
                lost,
                stage = %Stage::Sync,
                "sequence gap, dropping frame"
            );
            self.stats.gaps += 1;
            self.stats.lost_packets += u64::from(lost);
            self.abort_current_frame();
        }
        self.last_seq = seq;

        if self.state == FrameState::WaitingSync {
            self.stats.dropped_waiting += 1;
            if packet.is_end_of_frame() {
                tracing::debug!(seq, "end of frame seen, synchronised");
                self.state = FrameState::Collecting;
                self.buffer.clear();
            }
            return Ok(());
        }

        let payload = packet.payload();
        let header = match HbrmtHeader::decode(payload) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(seq, error = %e, "bad HBRMT header, packet skipped");
                self.stats.malformed += 1;
                self.skipped += 1;
                if packet.is_end_of_frame() {
                    self.drop_damaged_frame();
                }
                return Err(e);
            }
        };
        let profile = match self.profile {
            Some(profile) => profile,
            None => {
                let profile = profile::resolve_from_header(&header)?;
                self.bind(profile);
                profile
            }
        };

        let data = &payload[header.header_len()..];
        let received = self.buffer.len() + data.len();
        if received > self.capacity {
            tracing::warn!(profile = profile.name, received, capacity = self.capacity, "frame overflow");
            self.abort_current_frame();
            return Err(HbrmtError::FrameOverflow {
                received,
                capacity: self.capacity,
            });
        }
        self.buffer.extend_from_slice(data);

        if packet.is_end_of_frame() {
            if self.skipped > 0 {
                self.drop_damaged_frame();
            } else {
                self.finish_frame(profile, &header)?;
            }
        }
        Ok(())
    }

    /// Drop a frame that lost packets to bad headers. Its marker was seen, so
    /// the next packet starts a new frame.
    fn drop_damaged_frame(&mut self) {
        tracing::warn!(
            skipped = self.skipped,
            received = self.buffer.len(),
            stage = %Stage::Sync,
            "frame with skipped packets dropped"
        );
        self.stats.aborted += 1;
        self.buffer.clear();
        self.tokens.clear();
        self.skipped = 0;
        self.state = FrameState::Collecting;
    }

    fn finish_frame(&mut self, profile: &'static SmpteProfile, header: &HbrmtHeader) -> Result<()> {
        let received = self.buffer.len();
        let expected = profile.transport_frame_size();
        match self.padding {
            None => {
                let limit = expected + RTP_PACKET_SIZE;
                if !(expected..limit).contains(&received) {
                    tracing::warn!(
                        profile = profile.name,
                        received,
                        expected,
                        stage = %Stage::Geometry,
                        "first frame size out of range, dropping"
                    );
                    self.abort_current_frame();
                    return Err(HbrmtError::FrameLength {
                        profile: profile.name,
                        received,
                        expected,
                        limit,
                        stage: Stage::Geometry,
                    });
                }
                let padding = received - expected;
                tracing::info!(profile = profile.name, padding, "frame geometry confirmed");
                self.padding = Some(padding);
            }
            Some(padding) if received != expected + padding => {
                tracing::error!(
                    profile = profile.name,
                    received,
                    expected,
                    padding,
                    stage = %Stage::Geometry,
                    "frame size changed"
                );
                self.abort_current_frame();
                return Err(HbrmtError::GeometryMismatch {
                    profile: profile.name,
                    received,
                    expected,
                    padding,
                });
            }
            Some(_) => {}
        }

        self.state = FrameState::Complete;
        self.frame_count = header.frame_count;
        self.timestamp = header.timestamp;
        self.stats.completed += 1;
        self.publish(profile);
        Ok(())
    }

    fn publish(&mut self, profile: &'static SmpteProfile) {
        self.tokens.clear();
        let parts: &[FramePart] = if profile.is_dual_link() {
            if let Some(halves) = &mut self.halves {
                halves.demuxed = false;
            }
            &[FramePart::Half1, FramePart::Half2]
        } else {
            &[FramePart::Full]
        };
        let kinds: &[MediaKind] = if self.options.video_only {
            &[MediaKind::Video]
        } else {
            &[MediaKind::Video, MediaKind::Audio, MediaKind::Ancillary]
        };
        for &part in parts {
            for &kind in kinds {
                self.tokens.push_back(MediaBuffer { kind, part });
            }
        }
    }

    /// Next token of the complete frame, in publication order: video, audio,
    /// ancillary, for each link in turn.
    pub fn next_media_buffer(&mut self) -> Option<MediaBuffer> {
        self.tokens.pop_front()
    }

    pub fn buffer_type(&self, token: MediaBuffer) -> MediaKind {
        token.kind
    }

    /// Bytes [`extract_media_content`](Self::extract_media_content) needs for
    /// `kind`, or `None` before a profile is bound. Audio is variable; this
    /// returns an upper bound of four packets per scanline.
    pub fn media_size(&self, kind: MediaKind) -> Option<usize> {
        let profile = self.profile?;
        Some(match kind {
            MediaKind::Video => profile.video_size(),
            MediaKind::Audio => 4 * profile.scanlines * crate::media::audio::TAGGED_PACKET_LEN,
            MediaKind::Ancillary => extract::hanc_size(profile) * profile.scanlines,
        })
    }

    /// Copy the content named by `token` into `out`, returning the number of
    /// bytes written.
    pub fn extract_media_content(&mut self, token: MediaBuffer, out: &mut [u8]) -> Result<usize> {
        if self.state != FrameState::Complete {
            return Err(HbrmtError::NoMediaBuffer(format!("{token:?}: frame not complete")));
        }
        let Some(profile) = self.profile else {
            return Err(HbrmtError::NoMediaBuffer(format!("{token:?}: no profile bound")));
        };
        let dual = profile.is_dual_link();
        if dual && token.part != FramePart::Full {
            self.demux_halves(profile)?;
        }
        let frame: &[u8] = match (token.part, dual, &self.halves) {
            (FramePart::Full, false, _) => &self.buffer[..profile.frame_size()],
            (FramePart::Half1, true, Some(halves)) => &halves.half1[..],
            (FramePart::Half2, true, Some(halves)) => &halves.half2[..],
            _ => {
                return Err(HbrmtError::NoMediaBuffer(format!(
                    "{token:?}: not part of a {} frame",
                    profile.name
                )));
            }
        };
        match token.kind {
            MediaKind::Video => extract::video(profile, frame, out),
            MediaKind::Audio => extract::audio(profile, frame, &mut self.audio, out),
            MediaKind::Ancillary => extract::ancillary(profile, frame, out),
        }
    }

    /// Split the dual-link frame into its two links, once per frame.
    fn demux_halves(&mut self, profile: &SmpteProfile) -> Result<()> {
        let half_len = profile.frame_size();
        let halves = self.halves.get_or_insert_with(|| DualLinkHalves {
            half1: vec![0u8; half_len],
            half2: vec![0u8; half_len],
            demuxed: false,
        });
        if !halves.demuxed {
            let pool = match &self.options.demux {
                Some(pool) => pool.clone(),
                None => {
                    let pool = Arc::new(DemuxPool::new(self.options.demux_workers)?);
                    self.options.demux = Some(pool.clone());
                    pool
                }
            };
            pool.demux(&self.buffer, &mut halves.half1, &mut halves.half2);
            halves.demuxed = true;
        }
        Ok(())
    }
}
