//! Capture replay.
//!
//! Two capture forms are understood:
//!
//! - **pcap**: libpcap files (microsecond or nanosecond, either byte order).
//!   Each record is an Ethernet frame; Ethernet (with an optional VLAN tag),
//!   IPv4 and UDP headers are stripped and records that are not IPv4/UDP
//!   are skipped.
//! - **raw**: a dump of the UDP payloads back to back. All packets have the
//!   size of the first one, which is 1400 bytes, or 1396 when the HBRMT
//!   header carries no timestamp.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::{FramePacer, MemorySource, PacketSource};
use crate::error::{HbrmtError, Result};
use crate::media::hbrmt::HbrmtHeader;
use crate::media::rtp::RTP_HEADER_LEN;

const PCAP_HEADER_LEN: usize = 24;
const PCAP_RECORD_LEN: usize = 16;
const ETHERNET_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const UDP_HEADER_LEN: usize = 8;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IPPROTO_UDP: u8 = 17;
/// Packet size of a raw dump whose HBRMT header carries a timestamp.
const RAW_PACKET_SIZE: usize = 1400;
/// Records larger than this are treated as corruption.
const MAX_RECORD_LEN: usize = 65_535 + ETHERNET_LEN + VLAN_TAG_LEN;

#[derive(Debug, Clone)]
pub struct FileSourceConfig {
    pub path: PathBuf,
    /// Replay rate; zero or less replays as fast as possible.
    pub fps: f32,
    /// Rewind at end of file instead of reporting
    /// [`HbrmtError::Closed`].
    pub looping: bool,
}

impl FileSourceConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fps: 25.0,
            looping: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureFormat {
    Pcap { big_endian: bool },
    Raw { sample_size: usize },
}

/// Replays a capture file as a packet source.
#[derive(Debug)]
pub struct FileSource {
    reader: Option<BufReader<File>>,
    format: CaptureFormat,
    data_start: u64,
    looping: bool,
    pacer: Option<FramePacer>,
    record: Vec<u8>,
    packets: u64,
    path: PathBuf,
}

impl FileSource {
    pub fn open(config: &FileSourceConfig) -> Result<Self> {
        let mut reader = BufReader::new(File::open(&config.path)?);
        let format = detect_format(&mut reader)?;
        let data_start = match format {
            CaptureFormat::Pcap { .. } => PCAP_HEADER_LEN as u64,
            CaptureFormat::Raw { .. } => 0,
        };
        reader.seek(SeekFrom::Start(data_start))?;
        tracing::info!(path = %config.path.display(), ?format, fps = config.fps, "capture opened");
        Ok(Self {
            reader: Some(reader),
            format,
            data_start,
            looping: config.looping,
            pacer: FramePacer::new(config.fps),
            record: Vec::new(),
            packets: 0,
            path: config.path.clone(),
        })
    }

    /// Read every packet of the capture at `path` into memory.
    pub fn load(path: impl AsRef<Path>) -> Result<MemorySource> {
        let mut source = Self::open(&FileSourceConfig {
            path: path.as_ref().to_path_buf(),
            fps: 0.0,
            looping: false,
        })?;
        let mut packets = Vec::new();
        let mut buf = vec![0u8; MAX_RECORD_LEN];
        loop {
            match source.recv(&mut buf) {
                Ok(len) => packets.push(buf[..len].to_vec()),
                Err(HbrmtError::Closed) => break,
                Err(e) => return Err(e),
            }
        }
        tracing::info!(path = %path.as_ref().display(), packets = packets.len(), "capture cached");
        Ok(MemorySource::new(packets))
    }

    pub fn is_pcap(&self) -> bool {
        matches!(self.format, CaptureFormat::Pcap { .. })
    }

    /// Read one packet. `Ok(None)` at end of file.
    fn read_packet(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let reader = self.reader.as_mut().ok_or(HbrmtError::Closed)?;
        match self.format {
            CaptureFormat::Raw { sample_size } => {
                if buf.len() < sample_size {
                    return Err(HbrmtError::OutputTooSmall {
                        needed: sample_size,
                        available: buf.len(),
                    });
                }
                match reader.read_exact(&mut buf[..sample_size]) {
                    Ok(()) => Ok(Some(sample_size)),
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            CaptureFormat::Pcap { big_endian } => loop {
                let mut header = [0u8; PCAP_RECORD_LEN];
                match reader.read_exact(&mut header) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
                let incl_len = read_u32(&header[8..12], big_endian) as usize;
                if incl_len > MAX_RECORD_LEN {
                    return Err(HbrmtError::Malformed {
                        unit: "pcap record",
                        len: incl_len,
                        min: 0,
                    });
                }
                self.record.resize(incl_len, 0);
                match reader.read_exact(&mut self.record) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
                let Some(payload) = udp_payload(&self.record) else {
                    tracing::debug!(len = incl_len, "skipping non-UDP record");
                    continue;
                };
                if buf.len() < payload.len() {
                    return Err(HbrmtError::OutputTooSmall {
                        needed: payload.len(),
                        available: buf.len(),
                    });
                }
                buf[..payload.len()].copy_from_slice(payload);
                return Ok(Some(payload.len()));
            },
        }
    }

    fn rewind(&mut self) -> Result<()> {
        let reader = self.reader.as_mut().ok_or(HbrmtError::Closed)?;
        reader.seek(SeekFrom::Start(self.data_start))?;
        Ok(())
    }
}

impl PacketSource for FileSource {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(len) = self.read_packet(buf)? {
            self.packets += 1;
            return Ok(len);
        }
        if !self.looping || self.packets == 0 {
            tracing::info!(path = %self.path.display(), packets = self.packets, "end of capture");
            return Err(HbrmtError::Closed);
        }
        tracing::debug!(path = %self.path.display(), "end of capture, looping");
        self.rewind()?;
        self.read_packet(buf)?.ok_or(HbrmtError::Closed)
    }

    fn sample_size(&self) -> usize {
        match self.format {
            CaptureFormat::Raw { sample_size } => sample_size,
            CaptureFormat::Pcap { .. } => RAW_PACKET_SIZE,
        }
    }

    fn wait_for_next_frame(&mut self) {
        if let Some(pacer) = &mut self.pacer {
            pacer.wait();
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.reader.take().is_some() {
            tracing::debug!(path = %self.path.display(), "capture closed");
        }
        Ok(())
    }
}

fn detect_format(reader: &mut BufReader<File>) -> Result<CaptureFormat> {
    let mut head = [0u8; RAW_PACKET_SIZE];
    let mut filled = 0;
    while filled < head.len() {
        match reader.read(&mut head[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    let head = &head[..filled];
    if head.len() >= 4 {
        match [head[0], head[1], head[2], head[3]] {
            [0xd4, 0xc3, 0xb2, 0xa1] | [0x4d, 0x3c, 0xb2, 0xa1] => {
                return Ok(CaptureFormat::Pcap { big_endian: false });
            }
            [0xa1, 0xb2, 0xc3, 0xd4] | [0xa1, 0xb2, 0x3c, 0x4d] => {
                return Ok(CaptureFormat::Pcap { big_endian: true });
            }
            _ => {}
        }
    }
    if head.len() < RTP_HEADER_LEN {
        return Err(HbrmtError::Malformed {
            unit: "capture",
            len: head.len(),
            min: RTP_HEADER_LEN,
        });
    }
    let header = HbrmtHeader::decode(&head[RTP_HEADER_LEN..])?;
    let sample_size = if header.clock.has_timestamp() {
        RAW_PACKET_SIZE
    } else {
        RAW_PACKET_SIZE - 4
    };
    Ok(CaptureFormat::Raw { sample_size })
}

fn read_u32(bytes: &[u8], big_endian: bool) -> u32 {
    let b = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if big_endian {
        u32::from_be_bytes(b)
    } else {
        u32::from_le_bytes(b)
    }
}

/// UDP payload of an Ethernet frame, if it carries IPv4/UDP.
fn udp_payload(frame: &[u8]) -> Option<&[u8]> {
    let mut at = ETHERNET_LEN;
    let mut ethertype = u16::from_be_bytes([*frame.get(12)?, *frame.get(13)?]);
    if ethertype == ETHERTYPE_VLAN {
        ethertype = u16::from_be_bytes([*frame.get(16)?, *frame.get(17)?]);
        at += VLAN_TAG_LEN;
    }
    if ethertype != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = frame.get(at..)?;
    let ihl = usize::from(*ip.first()? & 0x0f) * 4;
    if *ip.get(9)? != IPPROTO_UDP || ihl < 20 {
        return None;
    }
    let udp = ip.get(ihl..)?;
    let udp_len = usize::from(u16::from_be_bytes([*udp.get(4)?, *udp.get(5)?]));
    let end = udp_len.clamp(UDP_HEADER_LEN, udp.len());
    udp.get(UDP_HEADER_LEN..end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::hbrmt::HBRMT_HEADER_LEN;
    use crate::media::rtp::write_header;
    use crate::profile;
    use std::io::Write;

    fn rtp_packet(seq: u16, fill: u8) -> Vec<u8> {
        let profile = profile::resolve_by_name("720p60").unwrap();
        let mut p = write_header(false, 98, seq).to_vec();
        let mut h = [0u8; HBRMT_HEADER_LEN];
        HbrmtHeader::from_profile(profile).encode(&mut h);
        p.extend_from_slice(&h);
        p.resize(RAW_PACKET_SIZE, fill);
        p
    }

    fn ethernet(payload: &[u8], vlan: bool) -> Vec<u8> {
        let mut f = vec![0u8; 12];
        if vlan {
            f.extend_from_slice(&[0x81, 0x00, 0x00, 0x64]);
        }
        f.extend_from_slice(&[0x08, 0x00]);
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[9] = IPPROTO_UDP;
        f.extend_from_slice(&ip);
        let udp_len = (payload.len() + UDP_HEADER_LEN) as u16;
        f.extend_from_slice(&[0x13, 0x88, 0x13, 0x88]);
        f.extend_from_slice(&udp_len.to_be_bytes());
        f.extend_from_slice(&[0, 0]);
        f.extend_from_slice(payload);
        f
    }

    fn write_pcap(path: &Path, frames: &[Vec<u8>]) {
        let mut out = Vec::new();
        out.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes());
        out.extend_from_slice(&[2, 0, 4, 0]);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&65535u32.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        for f in frames {
            out.extend_from_slice(&[0u8; 8]);
            out.extend_from_slice(&(f.len() as u32).to_le_bytes());
            out.extend_from_slice(&(f.len() as u32).to_le_bytes());
            out.extend_from_slice(f);
        }
        File::create(path).unwrap().write_all(&out).unwrap();
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hbrmt-{}-{name}", std::process::id()))
    }

    fn config(path: &Path, looping: bool) -> FileSourceConfig {
        FileSourceConfig {
            path: path.to_path_buf(),
            fps: 0.0,
            looping,
        }
    }

    #[test]
    fn pcap_records_are_stripped() {
        let path = temp_path("strip.pcap");
        let arp = {
            let mut f = vec![0u8; 12];
            f.extend_from_slice(&[0x08, 0x06]);
            f.resize(42, 0);
            f
        };
        write_pcap(
            &path,
            &[ethernet(&rtp_packet(1, 0xaa), false), arp, ethernet(&rtp_packet(2, 0xbb), true)],
        );

        let mut source = FileSource::open(&config(&path, false)).unwrap();
        assert!(source.is_pcap());
        let mut buf = vec![0u8; 2048];
        assert_eq!(source.recv(&mut buf).unwrap(), RAW_PACKET_SIZE);
        assert_eq!(buf[..RAW_PACKET_SIZE], rtp_packet(1, 0xaa)[..]);
        assert_eq!(source.recv(&mut buf).unwrap(), RAW_PACKET_SIZE);
        assert_eq!(buf[..RAW_PACKET_SIZE], rtp_packet(2, 0xbb)[..]);
        assert!(matches!(source.recv(&mut buf), Err(HbrmtError::Closed)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn raw_dump_loops() {
        let path = temp_path("loop.raw");
        let mut dump = rtp_packet(1, 1);
        dump.extend_from_slice(&rtp_packet(2, 2));
        File::create(&path).unwrap().write_all(&dump).unwrap();

        let mut source = FileSource::open(&config(&path, true)).unwrap();
        assert_eq!(source.sample_size(), RAW_PACKET_SIZE);
        let mut buf = vec![0u8; RAW_PACKET_SIZE];
        let seqs: Vec<u16> = (0..5)
            .map(|_| {
                source.recv(&mut buf).unwrap();
                u16::from_be_bytes([buf[2], buf[3]])
            })
            .collect();
        assert_eq!(seqs, [1, 2, 1, 2, 1]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_caches_every_packet() {
        let path = temp_path("cache.pcap");
        let frames: Vec<Vec<u8>> = (0..4).map(|i| ethernet(&rtp_packet(i, i as u8), false)).collect();
        write_pcap(&path, &frames);

        let source = FileSource::load(&path).unwrap();
        assert_eq!(source.len(), 4);
        std::fs::remove_file(&path).ok();
    }
}
