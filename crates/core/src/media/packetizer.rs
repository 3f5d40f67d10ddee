use super::hbrmt::{HBRMT_HEADER_LEN, HbrmtHeader};
use super::rtp::{PAYLOAD_TYPE_ST2022_6, RTP_HEADER_LEN, RtpHeader};
use crate::error::{HbrmtError, Result, Stage};
use crate::profile::SmpteProfile;

/// Size of every packet on the wire.
pub const PACKET_SIZE: usize = 1400;
/// Transport frame bytes carried by one packet.
pub const PAYLOAD_SIZE: usize = PACKET_SIZE - RTP_HEADER_LEN - HBRMT_HEADER_LEN;

/// ST 2022-6 RTP packetizer.
///
/// Splits transport frames into fixed-size packets:
///
/// ```text
/// +------------+---------------+----------------------------+
/// | RTP (12 B) | HBRMT (12 B)  | transport frame (1376 B)   |
/// +------------+---------------+----------------------------+
/// ```
///
/// The last packet of a frame is zero-padded to full size and carries the
/// marker bit, so a receiver sees up to 1375 bytes of trailing padding per
/// frame.
///
/// The HBRMT header is fixed for the stream except for the frame counter,
/// which wraps at 256, and the video timestamp, which counts 148.5/1.001 MHz
/// clock ticks: two per pixel, a pixel being 20 bits of payload.
#[derive(Debug)]
pub struct HbrmtPacketizer {
    rtp: RtpHeader,
    hbrmt: HbrmtHeader,
    profile: &'static SmpteProfile,
}

impl HbrmtPacketizer {
    /// Fails when the profile geometry has no HBRMT format code.
    pub fn new(profile: &'static SmpteProfile) -> Result<Self> {
        Self::with_rtp(profile, RtpHeader::with_random_state(PAYLOAD_TYPE_ST2022_6))
    }

    /// Use an explicit RTP header state instead of a random one.
    pub fn with_rtp(profile: &'static SmpteProfile, rtp: RtpHeader) -> Result<Self> {
        let hbrmt = HbrmtHeader::from_profile(profile);
        if !hbrmt.is_transmittable() {
            return Err(HbrmtError::UnsupportedFormat {
                stage: Stage::Format,
                detail: format!(
                    "{}: no HBRMT codes (FRAME {:#04x}, FRATE {:#04x}, SAMPLE {:#04x})",
                    profile.name, hbrmt.frame, hbrmt.frate, hbrmt.sample
                ),
            });
        }
        tracing::debug!(
            profile = profile.name,
            frame = hbrmt.frame,
            frate = hbrmt.frate,
            sample = hbrmt.sample,
            "HBRMT packetizer created"
        );
        Ok(Self { rtp, hbrmt, profile })
    }

    pub fn profile(&self) -> &'static SmpteProfile {
        self.profile
    }

    /// Sequence number of the next packet.
    pub fn next_sequence(&self) -> u16 {
        self.rtp.sequence()
    }

    /// Frame counter of the next frame.
    pub fn frame_count(&self) -> u8 {
        self.hbrmt.frame_count
    }

    /// Video timestamp of the next packet.
    pub fn timestamp(&self) -> u32 {
        self.hbrmt.timestamp
    }

    /// Number of packets one transport frame of `len` bytes takes.
    pub fn packets_per_frame(len: usize) -> usize {
        len.div_ceil(PAYLOAD_SIZE)
    }

    /// Packetize one transport frame.
    pub fn packetize(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        let count = Self::packets_per_frame(frame.len());
        let mut packets = Vec::with_capacity(count);
        let timestamp_ref = self.hbrmt.timestamp;
        let mut sent = 0usize;

        for (i, chunk) in frame.chunks(PAYLOAD_SIZE).enumerate() {
            let marker = i + 1 == count;
            let mut packet = vec![0u8; PACKET_SIZE];
            packet[..RTP_HEADER_LEN].copy_from_slice(&self.rtp.write(marker));
            self.hbrmt.encode(&mut packet[RTP_HEADER_LEN..]);
            let body = RTP_HEADER_LEN + HBRMT_HEADER_LEN;
            packet[body..body + chunk.len()].copy_from_slice(chunk);
            packets.push(packet);

            sent += chunk.len();
            let pixels = (sent * 8).div_ceil(20) as u32;
            self.hbrmt.timestamp = timestamp_ref.wrapping_add(pixels.wrapping_mul(2));
        }

        tracing::trace!(
            profile = self.profile.name,
            frame_count = self.hbrmt.frame_count,
            packets = packets.len(),
            bytes = frame.len(),
            "frame packetized"
        );
        self.hbrmt.frame_count = self.hbrmt.frame_count.wrapping_add(1);
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::RtpPacket;
    use crate::profile;

    fn packetizer(name: &str) -> HbrmtPacketizer {
        let profile = profile::resolve_by_name(name).unwrap();
        HbrmtPacketizer::with_rtp(profile, RtpHeader::new(PAYLOAD_TYPE_ST2022_6, 1, 65530)).unwrap()
    }

    #[test]
    fn packets_are_fixed_size_with_one_marker() {
        let mut p = packetizer("720p60");
        let frame = vec![0x5a; 10_000];
        let packets = p.packetize(&frame);
        assert_eq!(packets.len(), 8);
        assert!(packets.iter().all(|pkt| pkt.len() == PACKET_SIZE));
        let markers: Vec<bool> = packets
            .iter()
            .map(|pkt| RtpPacket::parse(pkt).unwrap().marker())
            .collect();
        assert_eq!(markers.iter().filter(|&&m| m).count(), 1);
        assert!(markers[7]);
    }

    #[test]
    fn last_packet_is_zero_padded() {
        let mut p = packetizer("720p60");
        let frame = vec![0xff; PAYLOAD_SIZE + 10];
        let packets = p.packetize(&frame);
        let last = RtpPacket::parse(&packets[1]).unwrap();
        let data = &last.payload()[HBRMT_HEADER_LEN..];
        assert!(data[..10].iter().all(|&b| b == 0xff));
        assert!(data[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn sequence_wraps_across_frames() {
        let mut p = packetizer("720p60");
        let packets = p.packetize(&vec![0; 10 * PAYLOAD_SIZE]);
        let seqs: Vec<u16> = packets
            .iter()
            .map(|pkt| RtpPacket::parse(pkt).unwrap().sequence())
            .collect();
        assert_eq!(seqs[0], 65530);
        assert_eq!(seqs[5], 65535);
        assert_eq!(seqs[6], 0);
        assert_eq!(p.next_sequence(), 4);
    }

    #[test]
    fn header_carries_profile_codes_and_counter() {
        let mut p = packetizer("1080i50");
        let first = p.packetize(&[0u8; 100]);
        let second = p.packetize(&[0u8; 100]);
        let h1 = HbrmtHeader::decode(RtpPacket::parse(&first[0]).unwrap().payload()).unwrap();
        let h2 = HbrmtHeader::decode(RtpPacket::parse(&second[0]).unwrap().payload()).unwrap();
        assert_eq!(h1.frame_count, 0);
        assert_eq!(h2.frame_count, 1);
        assert!(h1.f);
        assert_eq!(profile::resolve_from_header(&h1).unwrap().name, "1080i50");
    }

    #[test]
    fn timestamp_counts_two_ticks_per_pixel() {
        let mut p = packetizer("720p60");
        let packets = p.packetize(&vec![0; 2 * PAYLOAD_SIZE]);
        let ts: Vec<u32> = packets
            .iter()
            .map(|pkt| HbrmtHeader::decode(RtpPacket::parse(pkt).unwrap().payload()).unwrap().timestamp)
            .collect();
        // 1376 bytes = 550.4 pixels, rounded up
        assert_eq!(ts, [0, 551 * 2]);
        assert_eq!(p.timestamp(), 1101 * 2);
    }

    #[test]
    fn frame_counter_wraps() {
        let mut p = packetizer("720p60");
        for _ in 0..256 {
            p.packetize(&[0u8; 4]);
        }
        assert_eq!(p.frame_count(), 0);
    }
}
