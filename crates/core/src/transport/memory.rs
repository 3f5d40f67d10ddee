use std::time::{Duration, Instant};

use super::{FramePacer, PacketSource};
use crate::error::{HbrmtError, Result};

/// Packets held in memory.
///
/// Built from packets the caller already has (a packetizer's output, a
/// capture loaded with [`FileSource::load`](super::FileSource::load)) and
/// replayed in order.
#[derive(Debug)]
pub struct MemorySource {
    packets: Vec<Vec<u8>>,
    pos: usize,
    looping: bool,
    pacer: Option<FramePacer>,
    interval: Option<Duration>,
    last: Option<Instant>,
    closed: bool,
}

impl MemorySource {
    pub fn new(packets: Vec<Vec<u8>>) -> Self {
        Self {
            packets,
            pos: 0,
            looping: false,
            pacer: None,
            interval: None,
            last: None,
            closed: false,
        }
    }

    /// Restart from the first packet once the last one has been read.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Hold `fps` frames per second in
    /// [`wait_for_next_frame`](PacketSource::wait_for_next_frame).
    pub fn paced(mut self, fps: f32) -> Self {
        self.pacer = FramePacer::new(fps);
        self
    }

    /// Space consecutive packets at least `interval` apart.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Packets not yet read in the current pass.
    pub fn remaining(&self) -> usize {
        self.packets.len() - self.pos
    }
}

impl PacketSource for MemorySource {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(HbrmtError::Closed);
        }
        if self.pos == self.packets.len() {
            if !self.looping || self.packets.is_empty() {
                return Err(HbrmtError::Closed);
            }
            self.pos = 0;
        }
        if let Some(interval) = self.interval {
            if let Some(wait) = self.last.and_then(|t| (t + interval).checked_duration_since(Instant::now())) {
                std::thread::sleep(wait);
            }
            self.last = Some(Instant::now());
        }

        let packet = &self.packets[self.pos];
        if buf.len() < packet.len() {
            return Err(HbrmtError::OutputTooSmall {
                needed: packet.len(),
                available: buf.len(),
            });
        }
        buf[..packet.len()].copy_from_slice(packet);
        self.pos += 1;
        Ok(packet.len())
    }

    fn sample_size(&self) -> usize {
        self.packets.first().map_or(super::MAX_PACKET_SIZE, Vec::len)
    }

    fn wait_for_next_frame(&mut self) {
        if let Some(pacer) = &mut self.pacer {
            pacer.wait();
        }
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_in_order_then_closes() {
        let mut source = MemorySource::new(vec![vec![1], vec![2, 2]]);
        let mut buf = [0u8; 4];
        assert_eq!(source.recv(&mut buf).unwrap(), 1);
        assert_eq!(source.recv(&mut buf).unwrap(), 2);
        assert_eq!(buf[..2], [2, 2]);
        assert!(matches!(source.recv(&mut buf), Err(HbrmtError::Closed)));
    }

    #[test]
    fn loops_when_asked() {
        let mut source = MemorySource::new(vec![vec![7]]).looping(true);
        let mut buf = [0u8; 4];
        for _ in 0..3 {
            assert_eq!(source.recv(&mut buf).unwrap(), 1);
            assert_eq!(buf[0], 7);
        }
        source.close().unwrap();
        assert!(matches!(source.recv(&mut buf), Err(HbrmtError::Closed)));
    }

    #[test]
    fn small_buffer_is_rejected() {
        let mut source = MemorySource::new(vec![vec![0; 10]]);
        let mut buf = [0u8; 4];
        assert!(matches!(source.recv(&mut buf), Err(HbrmtError::OutputTooSmall { needed: 10, .. })));
        assert_eq!(source.remaining(), 1);
    }
}
