use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, SendTimeoutError, Sender, bounded};
use parking_lot::{Mutex, MutexGuard};

use crate::error::{HbrmtError, Result};
use crate::frame::demux::DemuxPool;
use crate::frame::{FrameOptions, TransportFrame};
use crate::media::rtp::{PAYLOAD_TYPE_ST2022_6, RtpPacket};
use crate::profile::{self, SmpteProfile};
use crate::transport::{MAX_PACKET_SIZE, PacketSource};

/// How long the producer waits on a full ready queue before rechecking the
/// stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receive pipeline configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Frame slots. With two or more, the producer fills the next frame
    /// while the consumer reads the previous one. With one, the producer
    /// waits for the consumer to claim and release each frame.
    pub slots: usize,
    /// Publish only video tokens.
    pub video_only: bool,
    /// Workers of the dual-link demultiplex pool.
    pub demux_workers: usize,
    /// Force a profile by name instead of detecting it from the stream.
    pub profile: Option<String>,
    pub payload_type: u8,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            slots: 2,
            video_only: false,
            demux_workers: 10,
            profile: None,
            payload_type: PAYLOAD_TYPE_ST2022_6,
        }
    }
}

/// Counters of the producer thread.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    packets: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    frames: AtomicU64,
}

impl ReceiverStats {
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Consecutive repeats of a sequence number, skipped.
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Packets the assembler refused (wrong payload type, bad header, bad
    /// frame size).
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Frames handed to the consumer.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
enum Ready {
    /// Slot index and the completion count of the frame published in it.
    Slot(usize, u64),
    Shutdown,
}

/// Multi-slot ST 2022-6 receive pipeline.
///
/// A producer thread reads packets from a [`PacketSource`] into frame
/// slots; each complete frame is announced on a ready queue and read with
/// [`next_frame`](Self::next_frame).
///
/// ```no_run
/// use hbrmt::{Receiver, ReceiverConfig, UdpSource, UdpSourceConfig};
///
/// let source = UdpSource::bind(&UdpSourceConfig::default())?;
/// let mut receiver = Receiver::new(ReceiverConfig::default());
/// receiver.start(source)?;
/// while let Some(mut frame) = receiver.next_frame() {
///     let mut out = vec![0u8; 8 << 20];
///     while let Some(token) = frame.next_media_buffer() {
///         let len = frame.extract_media_content(token, &mut out)?;
///         println!("{:?}: {len} bytes", token);
///     }
/// }
/// receiver.stop()?;
/// # Ok::<(), hbrmt::HbrmtError>(())
/// ```
pub struct Receiver {
    config: ReceiverConfig,
    running: Arc<AtomicBool>,
    slots: Vec<Arc<Mutex<TransportFrame>>>,
    ready: crossbeam_channel::Receiver<Ready>,
    /// Generations the consumer has claimed; a single-slot producer waits
    /// on it before reusing the slot.
    claimed: Sender<u64>,
    producer: Option<JoinHandle<Result<()>>>,
    stats: Arc<ReceiverStats>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        // disconnected until started
        let (_, ready) = bounded(1);
        let (claimed, _) = bounded(1);
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            slots: Vec::new(),
            ready,
            claimed,
            producer: None,
            stats: Arc::new(ReceiverStats::default()),
        }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the producer thread on `source`.
    pub fn start<S: PacketSource + 'static>(&mut self, source: S) -> Result<()> {
        if self.is_running() {
            return Err(HbrmtError::AlreadyRunning);
        }
        if self.config.slots == 0 {
            return Err(HbrmtError::InvalidConfig("at least one frame slot is required".into()));
        }
        let forced: Option<&'static SmpteProfile> = match &self.config.profile {
            Some(name) => Some(profile::resolve_by_name(name)?),
            None => None,
        };
        let demux = Arc::new(DemuxPool::new(self.config.demux_workers)?);
        let options = FrameOptions {
            payload_type: self.config.payload_type,
            video_only: self.config.video_only,
            profile: forced,
            demux: Some(demux),
            demux_workers: self.config.demux_workers,
        };
        self.slots = (0..self.config.slots)
            .map(|_| Arc::new(Mutex::new(TransportFrame::new(options.clone()))))
            .collect();
        let (ready_tx, ready_rx) = bounded(self.config.slots);
        self.ready = ready_rx;
        let (claimed_tx, claimed_rx) = bounded(self.config.slots);
        self.claimed = claimed_tx;

        self.running.store(true, Ordering::SeqCst);
        let pipeline = Pipeline {
            source,
            slots: self.slots.clone(),
            ready: ready_tx,
            claimed: claimed_rx,
            running: self.running.clone(),
            stats: self.stats.clone(),
        };
        let handle = thread::Builder::new()
            .name("hbrmt-receiver".into())
            .spawn(move || pipeline.run());
        match handle {
            Ok(handle) => self.producer = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        tracing::info!(
            slots = self.config.slots,
            video_only = self.config.video_only,
            profile = forced.map(|p| p.name),
            "receiver started"
        );
        Ok(())
    }

    /// Stop the producer and wait for it. Returns the fatal error that
    /// stopped it, if any.
    pub fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.producer.take() else {
            return Ok(());
        };
        tracing::info!("receiver stopping");
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(HbrmtError::Closed),
        }
    }

    /// Block until the next complete frame. `None` once the receiver has
    /// stopped.
    pub fn next_frame(&mut self) -> Option<CompletedFrame<'_>> {
        loop {
            let (slot, generation) = match self.ready.recv().ok()? {
                Ready::Slot(slot, generation) => (slot, generation),
                Ready::Shutdown => return None,
            };
            if let Some(frame) = self.claim(slot, generation) {
                return Some(frame);
            }
        }
    }

    /// Like [`next_frame`](Self::next_frame), giving up after `timeout`.
    pub fn next_frame_timeout(&mut self, timeout: Duration) -> Result<Option<CompletedFrame<'_>>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let ready = match self.ready.recv_deadline(deadline) {
                Ok(ready) => ready,
                Err(RecvTimeoutError::Timeout) => return Err(HbrmtError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            };
            let (slot, generation) = match ready {
                Ready::Slot(slot, generation) => (slot, generation),
                Ready::Shutdown => return Ok(None),
            };
            if let Some(frame) = self.claim(slot, generation) {
                return Ok(Some(frame));
            }
        }
    }

    /// Lock `slot` if it still holds the frame announced with `generation`.
    /// The producer may have reused the slot since.
    fn claim(&self, slot: usize, generation: u64) -> Option<CompletedFrame<'_>> {
        let guard = self.slots.get(slot)?.lock();
        // only read with a single slot; dropped when full otherwise
        let _ = self.claimed.try_send(generation);
        if guard.is_complete() && guard.stats().completed == generation {
            Some(CompletedFrame { guard, slot })
        } else {
            tracing::debug!(slot, generation, "stale frame skipped");
            None
        }
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "receiver stopped with error");
        }
    }
}

/// A complete frame, locked in its slot until dropped.
///
/// Dereferences to the [`TransportFrame`] for token iteration and
/// extraction.
pub struct CompletedFrame<'a> {
    guard: MutexGuard<'a, TransportFrame>,
    slot: usize,
}

impl CompletedFrame<'_> {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Deref for CompletedFrame<'_> {
    type Target = TransportFrame;

    fn deref(&self) -> &TransportFrame {
        &self.guard
    }
}

impl DerefMut for CompletedFrame<'_> {
    fn deref_mut(&mut self) -> &mut TransportFrame {
        &mut self.guard
    }
}

struct Pipeline<S> {
    source: S,
    slots: Vec<Arc<Mutex<TransportFrame>>>,
    ready: Sender<Ready>,
    claimed: crossbeam_channel::Receiver<u64>,
    running: Arc<AtomicBool>,
    stats: Arc<ReceiverStats>,
}

impl<S: PacketSource> Pipeline<S> {
    fn run(mut self) -> Result<()> {
        let result = self.receive();
        if let Err(e) = &result {
            tracing::error!(error = %e, "receive loop stopped on fatal error");
        }
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.source.close() {
            tracing::warn!(error = %e, "closing packet source failed");
        }
        let _ = self.ready.try_send(Ready::Shutdown);
        tracing::debug!(frames = self.stats.frames(), "receive loop finished");
        result
    }

    fn receive(&mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut current = 0;
        let mut slot = self.slots[current].lock_arc();
        let mut last_seq: Option<u16> = None;

        while self.running.load(Ordering::Relaxed) {
            let len = match self.source.recv(&mut buf) {
                Ok(len) => len,
                Err(HbrmtError::Closed) => {
                    tracing::info!("packet source closed");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if e.keeps_frame() => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "read failed, dropping frame");
                    slot.abort_current_frame();
                    continue;
                }
            };
            let packet = match RtpPacket::parse(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!(error = %e, "malformed RTP packet");
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let seq = packet.sequence();
            if last_seq == Some(seq) {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            last_seq = Some(seq);
            self.stats.packets.fetch_add(1, Ordering::Relaxed);

            if let Err(e) = slot.add_packet(&packet) {
                if e.is_fatal() {
                    return Err(e);
                }
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(seq, error = %e, "packet rejected");
            }
            if !slot.is_complete() {
                continue;
            }

            let finished = current;
            let generation = slot.stats().completed;
            current = (current + 1) % self.slots.len();
            self.stats.frames.fetch_add(1, Ordering::Relaxed);
            if current == finished {
                // single slot: unlocked while the consumer reads it between
                // frames
                drop(slot);
                if !self.publish(Ready::Slot(finished, generation)) || !self.await_claim(generation) {
                    return Ok(());
                }
                self.source.wait_for_next_frame();
                slot = self.slots[current].lock_arc();
                slot.init_new_frame();
                continue;
            }
            let mut next = self.slots[current].lock_arc();
            next.continue_from(&slot);
            slot = next;
            if !self.publish(Ready::Slot(finished, generation)) {
                return Ok(());
            }
            self.source.wait_for_next_frame();
        }
        Ok(())
    }

    /// Wait until the consumer has locked the frame published as
    /// `generation`, giving up once the receiver stops.
    fn await_claim(&self, generation: u64) -> bool {
        loop {
            match self.claimed.recv_timeout(POLL_INTERVAL) {
                Ok(claimed) if claimed >= generation => return true,
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    if !self.running.load(Ordering::Relaxed) {
                        return false;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    fn publish(&self, mut ready: Ready) -> bool {
        loop {
            match self.ready.send_timeout(ready, POLL_INTERVAL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(r)) => {
                    if !self.running.load(Ordering::Relaxed) {
                        return false;
                    }
                    ready = r;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MediaKind;
    use crate::media::packetizer::HbrmtPacketizer;
    use crate::media::rtp::RtpHeader;
    use crate::transport::MemorySource;

    fn stream(name: &str, frames: usize) -> Vec<Vec<u8>> {
        let profile = profile::resolve_by_name(name).unwrap();
        let mut packetizer =
            HbrmtPacketizer::with_rtp(profile, RtpHeader::new(PAYLOAD_TYPE_ST2022_6, 7, 1000)).unwrap();
        let frame = vec![0x11u8; profile.transport_frame_size()];
        (0..frames).flat_map(|_| packetizer.packetize(&frame)).collect()
    }

    #[test]
    fn delivers_frames_after_first_marker() {
        let mut receiver = Receiver::new(ReceiverConfig {
            video_only: true,
            ..Default::default()
        });
        receiver.start(MemorySource::new(stream("525i29.97", 4))).unwrap();

        let mut counts = Vec::new();
        while let Some(mut frame) = receiver.next_frame() {
            assert_eq!(frame.profile().unwrap().name, "525i29.97");
            let token = frame.next_media_buffer().unwrap();
            assert_eq!(token.kind, MediaKind::Video);
            assert_eq!(frame.next_media_buffer(), None);
            counts.push(frame.frame_count());
        }
        // the first frame only synchronises the assembler
        assert!(!counts.is_empty());
        assert!(counts.iter().all(|&c| (1..4).contains(&c)));
        receiver.stop().unwrap();
        assert_eq!(receiver.stats().duplicates(), 0);
    }

    fn frame_counts(receiver: &mut Receiver) -> Vec<u8> {
        let mut counts = Vec::new();
        while let Some(frame) = receiver.next_frame() {
            counts.push(frame.frame_count());
        }
        counts
    }

    #[test]
    fn single_slot_delivers_every_frame() {
        let mut receiver = Receiver::new(ReceiverConfig {
            slots: 1,
            video_only: true,
            ..Default::default()
        });
        receiver.start(MemorySource::new(stream("525i29.97", 4))).unwrap();
        assert_eq!(frame_counts(&mut receiver), [1, 2, 3]);
        receiver.stop().unwrap();
        assert_eq!(receiver.stats().frames(), 3);
    }

    #[test]
    fn lost_first_packet_drops_only_that_frame() {
        let mut packets = stream("525i29.97", 5);
        let per_frame = packets.len() / 5;
        packets.remove(2 * per_frame);
        let mut receiver = Receiver::new(ReceiverConfig {
            slots: 1,
            video_only: true,
            ..Default::default()
        });
        receiver.start(MemorySource::new(packets)).unwrap();
        assert_eq!(frame_counts(&mut receiver), [1, 3, 4]);
        receiver.stop().expect("loss is not fatal");
        assert_eq!(receiver.stats().frames(), 3);
    }

    #[test]
    fn duplicates_are_skipped() {
        let packets: Vec<Vec<u8>> = stream("525i29.97", 2)
            .into_iter()
            .flat_map(|p| [p.clone(), p])
            .collect();
        let mut receiver = Receiver::new(ReceiverConfig::default());
        receiver.start(MemorySource::new(packets)).unwrap();
        while receiver.next_frame().is_some() {}
        receiver.stop().unwrap();
        assert!(receiver.stats().duplicates() > 0);
        assert_eq!(receiver.stats().rejected(), 0);
    }

    #[test]
    fn unknown_profile_fails_start() {
        let mut receiver = Receiver::new(ReceiverConfig {
            profile: Some("4320p120".into()),
            ..Default::default()
        });
        let err = receiver.start(MemorySource::new(Vec::new())).unwrap_err();
        assert!(err.is_fatal());
        assert!(!receiver.is_running());
    }

    #[test]
    fn second_start_is_rejected() {
        let mut receiver = Receiver::new(ReceiverConfig::default());
        let idle = MemorySource::new(stream("525i29.97", 1)).looping(true);
        receiver.start(idle).unwrap();
        assert!(matches!(
            receiver.start(MemorySource::new(Vec::new())),
            Err(HbrmtError::AlreadyRunning)
        ));
        receiver.stop().unwrap();
        assert!(!receiver.is_running());
    }

    #[test]
    fn unsupported_format_stops_pipeline() {
        let mut packets = stream("525i29.97", 2);
        for p in &mut packets {
            // FRATE = 0x1f
            p[12 + 5] = (p[12 + 5] & 0xf0) | 0x01;
            p[12 + 6] = (p[12 + 6] & 0x0f) | 0xf0;
        }
        let mut receiver = Receiver::new(ReceiverConfig::default());
        receiver.start(MemorySource::new(packets)).unwrap();
        assert!(receiver.next_frame().is_none());
        let err = receiver.stop().unwrap_err();
        assert!(matches!(err, HbrmtError::UnsupportedFormat { .. }));
        assert!(!receiver.is_running());
    }

    #[test]
    fn not_started_has_no_frames() {
        let mut receiver = Receiver::new(ReceiverConfig::default());
        assert!(receiver.next_frame().is_none());
        assert!(receiver.stop().is_ok());
    }
}
