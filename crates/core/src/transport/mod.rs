//! Packet sources feeding the receive pipeline.
//!
//! Every source yields one RTP packet per [`PacketSource::recv`] call:
//!
//! - **UDP** ([`udp`]): a socket with optional multicast membership. The
//!   live input, one per network leg.
//! - **File** ([`file`]): replay of a pcap capture or of a raw dump of
//!   fixed-size packets, paced to the frame rate.
//! - **Memory** ([`memory`]): packets held in memory, either loaded from a
//!   capture up front or handed over by the caller.
//!
//! The protection switch ([`crate::redundancy::ProtectionSwitch`]) combines
//! two sources into one and is itself a source.

pub mod file;
pub mod memory;
pub mod udp;

pub use file::FileSource;
pub use memory::MemorySource;
pub use udp::{UdpSource, UdpSourceConfig};

use std::time::{Duration, Instant};

use crate::error::Result;

/// Largest datagram a source is expected to deliver.
pub const MAX_PACKET_SIZE: usize = 1500;

/// A blocking source of RTP packets.
///
/// Implementations are moved onto a receive thread, hence `Send`.
pub trait PacketSource: Send {
    /// Read the next packet into `buf`, returning its length.
    ///
    /// Returns [`HbrmtError::Timeout`](crate::HbrmtError::Timeout) when no
    /// packet arrived within the source's read timeout, and
    /// [`HbrmtError::Closed`](crate::HbrmtError::Closed) once the source is
    /// exhausted or closed.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Nominal packet size of the stream.
    fn sample_size(&self) -> usize {
        MAX_PACKET_SIZE
    }

    /// Called after every complete frame. Sources without their own clock
    /// sleep here to keep the frame rate.
    fn wait_for_next_frame(&mut self) {}

    /// Release the underlying resource. Later reads return
    /// [`HbrmtError::Closed`](crate::HbrmtError::Closed).
    fn close(&mut self) -> Result<()>;
}

impl<S: PacketSource + ?Sized> PacketSource for Box<S> {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).recv(buf)
    }

    fn sample_size(&self) -> usize {
        (**self).sample_size()
    }

    fn wait_for_next_frame(&mut self) {
        (**self).wait_for_next_frame()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Sleeps to hold a frame rate for sources without a clock of their own.
#[derive(Debug)]
pub(crate) struct FramePacer {
    interval: Duration,
    next: Instant,
}

impl FramePacer {
    /// Lateness after which the pacer gives up catching up.
    const MAX_LAG: Duration = Duration::from_secs(10);

    /// `None` for a non-positive rate, which disables pacing.
    pub(crate) fn new(fps: f32) -> Option<Self> {
        if fps.is_nan() || fps <= 0.0 {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs_f64(1.0 / f64::from(fps)),
            next: Instant::now(),
        })
    }

    pub(crate) fn wait(&mut self) {
        self.next += self.interval;
        let now = Instant::now();
        if let Some(ahead) = self.next.checked_duration_since(now) {
            std::thread::sleep(ahead);
        } else if now - self.next > Self::MAX_LAG {
            tracing::info!(lag_ms = (now - self.next).as_millis() as u64, "replay too late, resyncing clock");
            self.next = now;
        }
    }
}
