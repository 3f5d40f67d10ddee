//! Embedded audio in the horizontal blanking (SMPTE 299 ancillary packets).
//!
//! Each packet starts with an Ancillary Data Flag (ADF), followed by the Data
//! Identification word (DID), the data block number (DBN), the data count
//! (DC), the user data words and a checksum. Up to four audio groups of four
//! channels are carried, each identified by a pair of DIDs: one for the data
//! packets (samples) and one for the control packet (rate, active channels).
//!
//! ```text
//! data packet, 31 words:
//!   ADF ADF ADF DID DBN DC CLK CLK | CH1 x4 | CH2 x4 | CH3 x4 | CH4 x4 | ECC x6 | CS
//! control packet, 18 words:
//!   ADF ADF ADF DID DBN DC AF RATE ACT DEL x6 RSV RSV | CS
//! ```
//!
//! Words are read from the chroma (data) or luma (control) stream of a
//! scanline, so consecutive packet words sit two 10-bit words apart. Some
//! senders interleave two packets word by word; that layout is detected from
//! its longer ADF and read with a stride of four.

use crate::error::{HbrmtError, Result};
use crate::media::words::{get_word, set_word, words_in};

pub const DATA_PACKET_WORDS: usize = 31;
pub const CONTROL_PACKET_WORDS: usize = 18;

/// DIDs of the data packets of groups 1 to 4.
pub const DATA_DIDS: [u16; 4] = [0x2e7, 0x1e6, 0x1e5, 0x2e4];
/// DIDs of the control packets of groups 1 to 4.
pub const CONTROL_DIDS: [u16; 4] = [0x1e3, 0x2e2, 0x2e1, 0x1e0];

/// First chroma word after EAV, XYZ, line number and CRC.
pub const DATA_SCAN_START: usize = 16;
/// First luma word after EAV, XYZ, line number and CRC.
pub const CONTROL_SCAN_START: usize = 17;

/// Bytes of one line-tagged packet: a little-endian `u32` scanline index
/// followed by 31 little-endian `u16` words.
pub const TAGGED_PACKET_LEN: usize = 4 + DATA_PACKET_WORDS * 2;

const ADF_SINGLE: [u16; 3] = [0x000, 0x3ff, 0x3ff];
const ADF_DUAL: [u16; 6] = [0x000, 0x000, 0x3ff, 0x3ff, 0x3ff, 0x3ff];

/// How packets are laid out in the sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdfLayout {
    /// One packet at a time, words two apart.
    Single,
    /// Two packets interleaved, words four apart.
    Dual,
}

impl AdfLayout {
    fn pattern(self) -> &'static [u16] {
        match self {
            Self::Single => &ADF_SINGLE,
            Self::Dual => &ADF_DUAL,
        }
    }

    /// Distance in 10-bit words between consecutive words of one packet.
    pub fn stride(self) -> usize {
        match self {
            Self::Single => 2,
            Self::Dual => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SamplingRate {
    #[default]
    Khz48,
    Khz44_1,
    Khz32,
    Khz96,
}

impl SamplingRate {
    /// Decode the X2 X1 X0 bits of the RATE word.
    fn from_rate_word(word: u16) -> Option<Self> {
        match (word >> 1) & 0b111 {
            0b000 => Some(Self::Khz48),
            0b001 => Some(Self::Khz44_1),
            0b010 => Some(Self::Khz32),
            0b100 => Some(Self::Khz96),
            _ => None,
        }
    }

    fn rate_bits(self) -> u16 {
        match self {
            Self::Khz48 => 0b000,
            Self::Khz44_1 => 0b001,
            Self::Khz32 => 0b010,
            Self::Khz96 => 0b100,
        }
    }

    pub fn hz(self) -> u32 {
        match self {
            Self::Khz48 => 48_000,
            Self::Khz44_1 => 44_100,
            Self::Khz32 => 32_000,
            Self::Khz96 => 96_000,
        }
    }
}

/// One AES3 subframe as carried in a data packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AesSample {
    /// 24-bit sample.
    pub sample: u32,
    pub validity: bool,
    pub user: bool,
    pub channel_status: bool,
    pub parity: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioChannel {
    pub active: bool,
    /// Last sample decoded for this channel.
    pub last: AesSample,
}

/// State of one audio group, learnt from its control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChannelsGroup {
    pub index: usize,
    pub data_did: u16,
    pub control_did: u16,
    pub sampling_rate: SamplingRate,
    /// Set once the control packet has been seen. Data packets are only
    /// decoded for valid groups.
    pub valid: bool,
    pub channels: [AudioChannel; 4],
}

impl AudioChannelsGroup {
    fn new(index: usize) -> Self {
        Self {
            index,
            data_did: DATA_DIDS[index],
            control_did: CONTROL_DIDS[index],
            sampling_rate: SamplingRate::default(),
            valid: false,
            channels: [AudioChannel::default(); 4],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Control,
    Data,
}

impl PacketKind {
    pub fn words(self) -> usize {
        match self {
            Self::Control => CONTROL_PACKET_WORDS,
            Self::Data => DATA_PACKET_WORDS,
        }
    }
}

/// Classify a DID, returning the packet kind and group index.
pub fn classify_did(did: u16) -> Option<(PacketKind, usize)> {
    if let Some(group) = DATA_DIDS.iter().position(|&d| d == did) {
        return Some((PacketKind::Data, group));
    }
    CONTROL_DIDS
        .iter()
        .position(|&d| d == did)
        .map(|group| (PacketKind::Control, group))
}

/// Set the parity bits of an 8-bit ancillary value: b8 is even parity of
/// b0..b7, b9 is the inverse of b8.
pub fn anc_word(value: u8) -> u16 {
    let b8 = (value.count_ones() & 1) as u16;
    u16::from(value) | (b8 << 8) | ((b8 ^ 1) << 9)
}

/// Raw words of one packet, as read from or written to a scanline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    words: [u16; DATA_PACKET_WORDS],
    kind: PacketKind,
    group: usize,
}

impl AudioPacket {
    fn from_words(words: [u16; DATA_PACKET_WORDS], offset: usize) -> Result<Self> {
        let did = words[3];
        let (kind, group) = classify_did(did).ok_or(HbrmtError::UnknownDid { did, offset })?;
        Ok(Self { words, kind, group })
    }

    /// Build a control packet announcing `rate` and the channels set in
    /// `active` (bit 0 is the group's first channel).
    pub fn control(group: usize, frame_number: u8, rate: SamplingRate, active: u8) -> Self {
        let mut words = [0u16; DATA_PACKET_WORDS];
        words[..3].copy_from_slice(&ADF_SINGLE);
        words[3] = CONTROL_DIDS[group];
        words[4] = 0x200;
        words[5] = anc_word(11);
        words[6] = anc_word(frame_number);
        words[7] = anc_word((rate.rate_bits() << 1) as u8);
        words[8] = anc_word(active & 0x0f);
        for w in &mut words[9..17] {
            *w = anc_word(0);
        }
        words[17] = checksum(&words[3..17]);
        Self {
            words,
            kind: PacketKind::Control,
            group,
        }
    }

    /// Build a data packet with one subframe per channel of the group.
    pub fn data(group: usize, block: u8, clock: u16, samples: [AesSample; 4]) -> Self {
        let mut words = [0u16; DATA_PACKET_WORDS];
        words[..3].copy_from_slice(&ADF_SINGLE);
        words[3] = DATA_DIDS[group];
        words[4] = anc_word(block);
        words[5] = anc_word(24);
        words[6] = anc_word(clock as u8);
        words[7] = anc_word((((clock >> 8) & 0x0f) | ((clock >> 7) & 0x20)) as u8);
        for (i, s) in samples.iter().enumerate() {
            let at = 8 + i * 4;
            let flags = (s.validity as u32) << 4
                | (s.user as u32) << 5
                | (s.channel_status as u32) << 6
                | (s.parity as u32) << 7;
            words[at] = ((s.sample & 0x0f) << 4) as u16;
            words[at + 1] = ((s.sample >> 4) & 0xff) as u16;
            words[at + 2] = ((s.sample >> 12) & 0xff) as u16;
            words[at + 3] = (((s.sample >> 20) & 0x0f) | flags) as u16;
            for w in &mut words[at..at + 4] {
                *w = anc_word(*w as u8);
            }
        }
        for w in &mut words[24..30] {
            *w = anc_word(0);
        }
        words[30] = checksum(&words[3..30]);
        Self {
            words,
            kind: PacketKind::Data,
            group,
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Group index, 0 to 3.
    pub fn group(&self) -> usize {
        self.group
    }

    pub fn did(&self) -> u16 {
        self.words[3]
    }

    /// Meaningful words: 18 for control packets, 31 for data packets.
    pub fn words(&self) -> &[u16] {
        &self.words[..self.kind.words()]
    }

    /// Data block number.
    pub fn block_number(&self) -> u8 {
        self.words[4] as u8
    }

    /// Data count, 24 for data packets and 11 for control packets.
    pub fn data_count(&self) -> u8 {
        self.words[5] as u8
    }

    /// Audio clock phase of a data packet, 13 bits.
    pub fn clock(&self) -> u16 {
        (self.words[6] & 0xff) | ((self.words[7] & 0x0f) << 8) | ((self.words[7] & 0x20) << 7)
    }

    /// Multiplexed-position flag of a data packet.
    pub fn mpf(&self) -> bool {
        self.words[7] & 0x10 != 0
    }

    /// Subframe of channel `channel` (0 to 3) of a data packet.
    pub fn sample(&self, channel: usize) -> AesSample {
        let at = 8 + channel * 4;
        let w = |i: usize| u32::from(self.words[at + i]);
        let last = w(3);
        AesSample {
            sample: ((w(0) & 0xf0) >> 4) | ((w(1) & 0xff) << 4) | ((w(2) & 0xff) << 12) | ((last & 0x0f) << 20),
            validity: last & 0x10 != 0,
            user: last & 0x20 != 0,
            channel_status: last & 0x40 != 0,
            parity: last & 0x80 != 0,
        }
    }

    /// Write the packet into a scanline starting at word `offset`, with the
    /// word spacing of `layout`.
    pub fn write_smpte(&self, buf: &mut [u8], offset: usize, layout: AdfLayout) -> Result<()> {
        let stride = layout.stride();
        let last = offset + (self.kind.words() - 1) * stride;
        if last >= words_in(buf.len()) {
            return Err(HbrmtError::Malformed {
                unit: "ancillary area",
                len: buf.len(),
                min: (last + 1) * 10 / 8 + 1,
            });
        }
        for (i, &w) in self.words().iter().enumerate() {
            set_word(buf, offset + i * stride, w);
        }
        Ok(())
    }

    /// Serialize as a line-tagged record of [`TAGGED_PACKET_LEN`] bytes.
    /// Control packets are zero-padded to 31 words.
    pub fn write_tagged(&self, line: u32, out: &mut [u8]) -> Result<usize> {
        if out.len() < TAGGED_PACKET_LEN {
            return Err(HbrmtError::OutputTooSmall {
                needed: TAGGED_PACKET_LEN,
                available: out.len(),
            });
        }
        out[..4].copy_from_slice(&line.to_le_bytes());
        for (i, w) in self.words.iter().enumerate() {
            let w = if i < self.kind.words() { *w } else { 0 };
            out[4 + i * 2..6 + i * 2].copy_from_slice(&w.to_le_bytes());
        }
        Ok(TAGGED_PACKET_LEN)
    }

    /// Parse one line-tagged record.
    pub fn read_tagged(record: &[u8]) -> Result<(u32, Self)> {
        if record.len() < TAGGED_PACKET_LEN {
            return Err(HbrmtError::Malformed {
                unit: "tagged audio packet",
                len: record.len(),
                min: TAGGED_PACKET_LEN,
            });
        }
        let line = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let mut words = [0u16; DATA_PACKET_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            *w = u16::from_le_bytes([record[4 + i * 2], record[5 + i * 2]]) & 0x3ff;
        }
        Ok((line, Self::from_words(words, 0)?))
    }
}

/// Checksum word: 9-bit sum of the DID..UDW words with b9 = !b8.
fn checksum(words: &[u16]) -> u16 {
    let sum = words.iter().fold(0u16, |acc, w| acc.wrapping_add(w & 0x1ff)) & 0x1ff;
    sum | ((((sum >> 8) & 1) ^ 1) << 9)
}

/// Per-stream decoder: remembers the ADF layout and the state of the four
/// audio groups across scanlines and frames.
#[derive(Debug, Clone)]
pub struct AudioCodec {
    layout: Option<AdfLayout>,
    groups: [AudioChannelsGroup; 4],
}

impl Default for AudioCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioCodec {
    pub fn new() -> Self {
        Self {
            layout: None,
            groups: std::array::from_fn(AudioChannelsGroup::new),
        }
    }

    /// Layout detected on the first packet of the stream, if any.
    pub fn layout(&self) -> Option<AdfLayout> {
        self.layout
    }

    pub fn groups(&self) -> &[AudioChannelsGroup; 4] {
        &self.groups
    }

    /// Word spacing of packets in the current layout.
    pub fn stride(&self) -> usize {
        self.layout.unwrap_or(AdfLayout::Single).stride()
    }

    /// Check for an ADF at word `offset` of the first `size` bytes of `buf`.
    ///
    /// Until a layout has been seen, the dual layout is tried first and the
    /// first match is kept for the rest of the stream.
    pub fn detect_adf(&mut self, buf: &[u8], size: usize, offset: usize) -> Option<usize> {
        let limit = words_in(size.min(buf.len()));
        let matches = |layout: AdfLayout| {
            let pattern = layout.pattern();
            offset + (pattern.len() - 1) * 2 < limit
                && pattern
                    .iter()
                    .enumerate()
                    .all(|(i, &w)| get_word(buf, offset + i * 2) == w)
        };
        match self.layout {
            Some(layout) => matches(layout).then_some(offset),
            None => {
                let found = [AdfLayout::Dual, AdfLayout::Single]
                    .into_iter()
                    .find(|&l| matches(l))?;
                tracing::debug!(layout = ?found, offset, "ancillary layout detected");
                self.layout = Some(found);
                Some(offset)
            }
        }
    }

    /// Read the packet whose ADF starts at word `offset` and update group
    /// state from it.
    ///
    /// A packet with an unknown DID is returned as an error; the caller skips
    /// it.
    pub fn read_from_smpte(&mut self, buf: &[u8], offset: usize) -> Result<AudioPacket> {
        let stride = self.stride();
        let last = offset + (DATA_PACKET_WORDS - 1) * stride;
        let available = words_in(buf.len());
        let mut words = [0u16; DATA_PACKET_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            let at = offset + i * stride;
            // control packets may end close to the line end
            if at < available {
                *w = get_word(buf, at);
            } else if i < CONTROL_PACKET_WORDS {
                return Err(HbrmtError::Malformed {
                    unit: "ancillary packet",
                    len: buf.len(),
                    min: last * 10 / 8 + 2,
                });
            }
        }
        let packet = AudioPacket::from_words(words, offset).inspect_err(|e| {
            tracing::debug!(error = %e, "skipping ancillary packet");
        })?;
        self.decode(&packet);
        Ok(packet)
    }

    /// Update group state from a packet: control packets validate their
    /// group, data packets refresh the active channels of a valid group.
    pub fn decode(&mut self, packet: &AudioPacket) {
        let group = &mut self.groups[packet.group];
        match packet.kind {
            PacketKind::Control => {
                if group.valid {
                    return;
                }
                let rate_word = packet.words[7];
                match SamplingRate::from_rate_word(rate_word) {
                    Some(rate) => group.sampling_rate = rate,
                    None => tracing::warn!(
                        did = format_args!("{:#05x}", packet.did()),
                        rate_word,
                        "unknown audio sampling rate, keeping {:?}",
                        group.sampling_rate
                    ),
                }
                let active = packet.words[8];
                for (i, ch) in group.channels.iter_mut().enumerate() {
                    ch.active = active & (1 << i) != 0;
                }
                group.valid = true;
                tracing::info!(
                    group = group.index + 1,
                    frame = packet.words[6] & 0xff,
                    rate = group.sampling_rate.hz(),
                    active = format_args!("{:04b}", active & 0x0f),
                    "audio group discovered"
                );
            }
            PacketKind::Data => {
                if !group.valid {
                    return;
                }
                for (i, ch) in group.channels.iter_mut().enumerate() {
                    if ch.active {
                        ch.last = packet.sample(i);
                    }
                }
            }
        }
    }
}
