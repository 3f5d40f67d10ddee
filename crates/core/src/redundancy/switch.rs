use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::ring::ReceiveRing;
use crate::error::{HbrmtError, Result, Stage};

/// Number of network legs.
pub const LEGS: usize = 2;

/// A packet stored in a leg's ring, announced to the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalEvent {
    pub leg: usize,
    pub seq: u16,
    /// When the leg received the packet.
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegRole {
    Master,
    Secondary,
}

/// State shared between the switch and its leg threads.
#[derive(Debug)]
pub struct LegRings {
    rings: [Mutex<ReceiveRing>; LEGS],
    master: AtomicUsize,
}

impl LegRings {
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: [
                Mutex::new(ReceiveRing::new(capacity)),
                Mutex::new(ReceiveRing::new(capacity)),
            ],
            master: AtomicUsize::new(0),
        }
    }

    pub fn ring(&self, leg: usize) -> &Mutex<ReceiveRing> {
        &self.rings[leg]
    }

    /// Index of the leg currently acting as master.
    pub fn master(&self) -> usize {
        self.master.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Leg {
    online: bool,
    last_arrival: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchStats {
    /// Packets delivered from the master leg.
    pub delivered: u64,
    /// Lost master packets recovered from the secondary leg.
    pub backfilled: u64,
    /// Master packets found missing.
    pub lost: u64,
    pub failed_backfills: u64,
    pub switches: u64,
}

/// ST 2022-7 switching logic over two packet rings.
///
/// Delivers the master leg's packets in sequence order. When the master
/// skips packets, the gap is reported once with
/// [`HbrmtError::PacketLost`] and then drained on the following reads from
/// the secondary leg's ring, one packet per read; the packet that revealed
/// the gap comes last, from the master ring. A packet missing from both
/// legs fails the backfill and the switch resynchronizes on the next master
/// packet.
///
/// A leg is offline once no packet arrived on it for the offline threshold,
/// measured in arrival time. When the master goes offline the roles swap.
#[derive(Debug)]
pub struct SwitchCore {
    rings: Arc<LegRings>,
    legs: [Leg; LEGS],
    master: usize,
    next_seq: Option<u16>,
    last_seq: u16,
    pending: u32,
    threshold: Duration,
    stats: SwitchStats,
}

impl SwitchCore {
    pub fn new(rings: Arc<LegRings>, threshold: Duration) -> Self {
        let now = Instant::now();
        let leg = Leg {
            online: true,
            last_arrival: Some(now),
        };
        rings.master.store(0, Ordering::Relaxed);
        Self {
            rings,
            legs: [leg; LEGS],
            master: 0,
            next_seq: None,
            last_seq: 0,
            pending: 0,
            threshold,
            stats: SwitchStats::default(),
        }
    }

    pub fn master(&self) -> usize {
        self.master
    }

    pub fn role(&self, leg: usize) -> LegRole {
        if leg == self.master {
            LegRole::Master
        } else {
            LegRole::Secondary
        }
    }

    pub fn is_online(&self, leg: usize) -> bool {
        self.legs.get(leg).is_some_and(|l| l.online)
    }

    /// Lost packets still to be backfilled.
    pub fn pending(&self) -> u32 {
        self.pending
    }

    pub fn stats(&self) -> SwitchStats {
        self.stats
    }

    fn secondary(&self) -> usize {
        1 - self.master
    }

    fn resync(&mut self) {
        self.next_seq = None;
        self.pending = 0;
    }

    /// Produce the next master packet into `out`, pulling arrival events
    /// from `next_event` as needed.
    pub fn read_with<F>(&mut self, next_event: &mut F, out: &mut [u8]) -> Result<usize>
    where
        F: FnMut() -> Result<ArrivalEvent>,
    {
        if self.pending > 0 {
            return self.backfill(out);
        }

        let event = next_event()?;
        if event.leg >= LEGS {
            return Err(HbrmtError::InvalidConfig(format!("arrival on unknown leg {}", event.leg)));
        }
        self.refresh_liveness(&event);

        if !self.legs[self.master].online {
            let from = self.master;
            self.master = self.secondary();
            self.rings.master.store(self.master, Ordering::Relaxed);
            self.stats.switches += 1;
            self.resync();
            tracing::info!(from, to = self.master, "master leg offline, roles swapped");
            return Err(HbrmtError::LegSwitched { from, to: self.master });
        }

        if event.leg != self.master {
            return Err(HbrmtError::NotPrimary {
                leg: event.leg,
                seq: event.seq,
            });
        }

        let seq = event.seq;
        let expected = self.next_seq.unwrap_or(seq);
        if seq != expected {
            let gap = seq.wrapping_sub(expected);
            if gap >= 0x8000 {
                tracing::debug!(leg = self.master, seq, expected, "late packet on master leg");
                return Err(HbrmtError::LatePacket {
                    leg: self.master,
                    seq,
                    expected,
                });
            }
            self.last_seq = seq;
            self.next_seq = Some(expected);
            self.pending = u32::from(gap) + 1;
            self.stats.lost += u64::from(gap);
            tracing::warn!(
                leg = self.master,
                expected,
                received = seq,
                lost = gap,
                stage = %Stage::Sync,
                "packets lost on master leg, backfilling"
            );
            return Err(HbrmtError::PacketLost {
                leg: self.master,
                expected,
                received: seq,
                lost: gap,
                stage: Stage::Sync,
            });
        }

        self.last_seq = seq;
        let taken = self.rings.ring(self.master).lock().take(seq, out);
        match taken {
            Some(len) => {
                self.next_seq = Some(seq.wrapping_add(1));
                self.stats.delivered += 1;
                Ok(len)
            }
            None => {
                self.resync();
                tracing::warn!(leg = self.master, seq, stage = %Stage::Transport, "master packet no longer buffered");
                Err(HbrmtError::BackfillFailed {
                    leg: self.master,
                    seq,
                    stage: Stage::Transport,
                })
            }
        }
    }

    fn refresh_liveness(&mut self, event: &ArrivalEvent) {
        let leg = &mut self.legs[event.leg];
        leg.last_arrival = Some(event.at);
        if !leg.online {
            leg.online = true;
            tracing::info!(leg = event.leg, "leg online");
        }
        for (i, leg) in self.legs.iter_mut().enumerate() {
            let silent = leg
                .last_arrival
                .is_some_and(|t| event.at.saturating_duration_since(t) > self.threshold);
            if leg.online && silent {
                leg.online = false;
                tracing::info!(leg = i, master = i == self.master, "leg offline");
            }
        }
    }

    fn backfill(&mut self, out: &mut [u8]) -> Result<usize> {
        let Some(seq) = self.next_seq else {
            self.pending = 0;
            return Err(HbrmtError::Timeout);
        };
        let (primary, fallback) = if seq == self.last_seq {
            (self.master, self.secondary())
        } else {
            (self.secondary(), self.master)
        };
        let taken = self.rings.ring(primary).lock().take(seq, out).map(|len| (primary, len));
        let taken = taken.or_else(|| self.rings.ring(fallback).lock().take(seq, out).map(|len| (fallback, len)));

        let Some((leg, len)) = taken else {
            self.stats.failed_backfills += 1;
            let pending = self.pending;
            self.resync();
            tracing::warn!(
                leg = self.secondary(),
                seq,
                pending,
                stage = %Stage::Transport,
                "lost packet missing on both legs, dropping frame"
            );
            return Err(HbrmtError::BackfillFailed {
                leg: self.secondary(),
                seq,
                stage: Stage::Transport,
            });
        };

        if leg == self.master {
            self.stats.delivered += 1;
        } else {
            self.stats.backfilled += 1;
        }
        self.pending -= 1;
        if seq == self.last_seq {
            self.pending = 0;
        }
        self.next_seq = Some(seq.wrapping_add(1));
        Ok(len)
    }
}
