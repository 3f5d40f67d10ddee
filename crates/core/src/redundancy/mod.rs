//! SMPTE ST 2022-7 seamless protection switching.
//!
//! Two legs carry the same RTP stream over separate network paths. Each leg
//! runs a thread that reads its [`PacketSource`], stores every packet in its
//! own [`ReceiveRing`] and announces it on a shared event queue:
//!
//! ```text
//! leg 0 thread --store--> ring 0 --+
//!      \                           |        SwitchCore        TransportFrame
//!       +---(leg, seq, t)---> event queue ---> read() -------> add_packet()
//!       +---(leg, seq, t)---/      |
//! leg 1 thread --store--> ring 1 --+
//! ```
//!
//! [`ProtectionSwitch`] is itself a [`PacketSource`]: the receiver reads it
//! like a single socket and only ever sees the master leg's packets, with
//! single losses repaired from the secondary leg. The switching rules live in
//! [`SwitchCore`].

pub mod ring;
pub mod switch;

pub use ring::ReceiveRing;
pub use switch::{ArrivalEvent, LegRings, LegRole, SwitchCore, SwitchStats};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};

use crate::error::{HbrmtError, Result};
use crate::media::rtp::sequence_of;
use crate::transport::{MAX_PACKET_SIZE, PacketSource};
use ring::Stored;
use switch::LEGS;

/// How long a leg thread waits on a full event queue before rechecking the
/// stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SwitchConfig {
    /// Packets buffered per leg.
    pub ring_capacity: usize,
    /// Silence after which a leg is considered offline.
    pub offline_threshold: Duration,
    /// Capacity of the shared arrival queue.
    pub event_queue: usize,
    /// Longest [`recv`](PacketSource::recv) blocks before returning
    /// [`HbrmtError::Timeout`].
    pub read_timeout: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 16384,
            offline_threshold: Duration::from_millis(20),
            event_queue: 65536,
            read_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
enum LegMessage {
    Arrival(ArrivalEvent),
    Closed(usize),
    Shutdown,
}

/// Stops a [`ProtectionSwitch`] from another thread, unblocking a pending
/// read.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    events: Sender<LegMessage>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        // a full queue means the reader is not blocked
        let _ = self.events.try_send(LegMessage::Shutdown);
    }
}

/// Two-leg protection switch presenting the master leg as one packet
/// source.
pub struct ProtectionSwitch {
    core: SwitchCore,
    rings: Arc<LegRings>,
    events: Receiver<LegMessage>,
    shutdown: ShutdownHandle,
    threads: Vec<JoinHandle<()>>,
    closed_legs: usize,
    stopped: bool,
    read_timeout: Duration,
    sample_size: usize,
}

impl ProtectionSwitch {
    /// Start one receive thread per leg. Leg 0 starts as master.
    pub fn init(sources: [Box<dyn PacketSource>; LEGS], config: SwitchConfig) -> Result<Self> {
        if config.ring_capacity == 0 || config.event_queue == 0 {
            return Err(HbrmtError::InvalidConfig(
                "ring capacity and event queue must be non-zero".into(),
            ));
        }
        let rings = Arc::new(LegRings::new(config.ring_capacity));
        let (tx, rx) = bounded(config.event_queue);
        let running = Arc::new(AtomicBool::new(true));
        let sample_size = sources[0].sample_size();

        let mut threads = Vec::with_capacity(LEGS);
        for (leg, source) in sources.into_iter().enumerate() {
            let rings = rings.clone();
            let tx = tx.clone();
            let running = running.clone();
            let handle = std::thread::Builder::new()
                .name(format!("hbrmt-leg-{leg}"))
                .spawn(move || run_leg(leg, source, &rings, &tx, &running))?;
            threads.push(handle);
        }
        tracing::info!(
            ring_capacity = config.ring_capacity,
            offline_threshold_ms = config.offline_threshold.as_millis() as u64,
            "protection switch started"
        );

        Ok(Self {
            core: SwitchCore::new(rings.clone(), config.offline_threshold),
            rings,
            events: rx,
            shutdown: ShutdownHandle { running, events: tx },
            threads,
            closed_legs: 0,
            stopped: false,
            read_timeout: config.read_timeout,
            sample_size,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn master(&self) -> usize {
        self.core.master()
    }

    pub fn is_online(&self, leg: usize) -> bool {
        self.core.is_online(leg)
    }

    pub fn stats(&self) -> SwitchStats {
        self.core.stats()
    }

    /// Packets lost to ring overwrites on each leg.
    pub fn ring_overflows(&self) -> [u64; LEGS] {
        [
            self.rings.ring(0).lock().overflows(),
            self.rings.ring(1).lock().overflows(),
        ]
    }
}

impl std::fmt::Debug for ProtectionSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectionSwitch")
            .field("core", &self.core)
            .field("closed_legs", &self.closed_legs)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl PacketSource for ProtectionSwitch {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.stopped || (self.closed_legs == LEGS && self.events.is_empty() && self.core.pending() == 0) {
            return Err(HbrmtError::Closed);
        }
        let events = &self.events;
        let closed_legs = &mut self.closed_legs;
        let stopped = &mut self.stopped;
        let timeout = self.read_timeout;
        let mut next = || loop {
            match events.recv_timeout(timeout) {
                Ok(LegMessage::Arrival(event)) => return Ok(event),
                Ok(LegMessage::Closed(leg)) => {
                    *closed_legs += 1;
                    tracing::info!(leg, "leg closed");
                    if *closed_legs == LEGS {
                        return Err(HbrmtError::Closed);
                    }
                }
                Ok(LegMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    *stopped = true;
                    return Err(HbrmtError::Closed);
                }
                Err(RecvTimeoutError::Timeout) => return Err(HbrmtError::Timeout),
            }
        };
        self.core.read_with(&mut next, buf)
    }

    fn sample_size(&self) -> usize {
        self.sample_size
    }

    fn close(&mut self) -> Result<()> {
        self.shutdown.shutdown();
        self.stopped = true;
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("leg thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for ProtectionSwitch {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn run_leg(
    leg: usize,
    mut source: Box<dyn PacketSource>,
    rings: &LegRings,
    events: &Sender<LegMessage>,
    running: &AtomicBool,
) {
    tracing::debug!(leg, "leg thread started");
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    while running.load(Ordering::Relaxed) {
        let len = match source.recv(&mut buf) {
            Ok(len) => len,
            Err(HbrmtError::Timeout) => continue,
            Err(HbrmtError::Closed) => break,
            Err(e) => {
                tracing::warn!(leg, error = %e, "leg read failed");
                continue;
            }
        };
        let Some(seq) = sequence_of(&buf[..len]) else {
            tracing::debug!(leg, len, "runt packet dropped");
            continue;
        };
        let stored = rings.ring(leg).lock().store(seq, &buf[..len]);
        if let Stored::Overwrote(old) = stored {
            if rings.master() == leg {
                tracing::warn!(leg, seq, overwritten = old, "master ring overflow");
            }
        }
        let event = ArrivalEvent {
            leg,
            seq,
            at: Instant::now(),
        };
        if !forward(events, LegMessage::Arrival(event), running) {
            break;
        }
    }
    if let Err(e) = source.close() {
        tracing::warn!(leg, error = %e, "closing leg source failed");
    }
    let _ = events.try_send(LegMessage::Closed(leg));
    tracing::debug!(leg, "leg thread stopped");
}

/// Send `message`, giving up once the switch stops.
fn forward(events: &Sender<LegMessage>, mut message: LegMessage, running: &AtomicBool) -> bool {
    loop {
        match events.send_timeout(message, POLL_INTERVAL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(m)) => {
                if !running.load(Ordering::Relaxed) {
                    return false;
                }
                message = m;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::write_header;
    use crate::transport::MemorySource;

    fn packets(seqs: impl IntoIterator<Item = u16>) -> Vec<Vec<u8>> {
        seqs.into_iter()
            .map(|seq| {
                let mut p = write_header(false, 98, seq).to_vec();
                p.push(seq as u8);
                p
            })
            .collect()
    }

    fn read_all(switch: &mut ProtectionSwitch) -> Vec<u16> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut seqs = Vec::new();
        loop {
            match switch.recv(&mut buf) {
                Ok(len) => seqs.push(sequence_of(&buf[..len]).unwrap()),
                Err(HbrmtError::Closed) => return seqs,
                Err(e) if e.keeps_frame() => {}
                Err(e) => panic!("unexpected {e}"),
            }
        }
    }

    #[test]
    fn repairs_master_loss_from_secondary() {
        // the secondary runs ahead so the lost packet is buffered in time
        let master = MemorySource::new(packets((0..200).filter(|&s| s != 120)))
            .with_interval(Duration::from_micros(200));
        let secondary = MemorySource::new(packets(0..200));
        let mut switch = ProtectionSwitch::init(
            [Box::new(master), Box::new(secondary)],
            SwitchConfig {
                offline_threshold: Duration::from_secs(5),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(read_all(&mut switch), (0..200).collect::<Vec<_>>());
        assert_eq!(switch.stats().backfilled, 1);
        switch.close().unwrap();
    }

    #[test]
    fn shutdown_unblocks_reader() {
        let idle = MemorySource::new(Vec::new());
        let other = MemorySource::new(Vec::new());
        let mut switch = ProtectionSwitch::init(
            [Box::new(idle), Box::new(other)],
            SwitchConfig {
                read_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        )
        .unwrap();
        let handle = switch.shutdown_handle();
        handle.shutdown();
        let mut buf = [0u8; 16];
        assert!(matches!(switch.recv(&mut buf), Err(HbrmtError::Closed)));
    }

    #[test]
    fn rejects_empty_ring() {
        let config = SwitchConfig {
            ring_capacity: 0,
            ..Default::default()
        };
        let sources: [Box<dyn PacketSource>; LEGS] =
            [Box::new(MemorySource::new(Vec::new())), Box::new(MemorySource::new(Vec::new()))];
        assert!(ProtectionSwitch::init(sources, config).is_err());
    }
}
