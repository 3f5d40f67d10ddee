//! Error types for the ST 2022-6 receive and transmit stack.

use std::fmt;

/// How far an error is allowed to propagate.
///
/// - **Recoverable**: loss, reordering, malformed input, a leg going offline.
///   The caller drops the offending unit (packet, sub-packet or frame) and
///   keeps running.
/// - **Fatal**: misconfiguration that cannot be reconciled at runtime, such
///   as a stream whose format matches no profile or a frame that disagrees
///   with the geometry it was bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Recoverable,
    Fatal,
}

/// Pipeline stage an error was raised in, reported with every loss or
/// mismatch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Socket or file reads, protection switching.
    Transport,
    /// Sequence continuity and end-of-frame synchronization.
    Sync,
    /// Frame length against the bound profile.
    Geometry,
    /// HBRMT header codes and profile lookup.
    Format,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Sync => write!(f, "sync"),
            Self::Geometry => write!(f, "geometry"),
            Self::Format => write!(f, "format"),
        }
    }
}

/// Errors that can occur while receiving, assembling or building frames.
///
/// Every variant carries enough context (leg, sequence range, stage, sizes)
/// to diagnose the event from a single log line. Use
/// [`severity`](Self::severity) to decide between dropping the unit and
/// stopping the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum HbrmtError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking read returned without data.
    #[error("read timed out")]
    Timeout,

    /// The packet source has been closed or reached the end of its input.
    #[error("packet source closed")]
    Closed,

    /// A unit is shorter than its fixed header or declared layout.
    #[error("malformed {unit}: {len} bytes, need at least {min}")]
    Malformed {
        unit: &'static str,
        len: usize,
        min: usize,
    },

    /// RTP payload type does not match the one the receiver is bound to.
    #[error("unexpected RTP payload type {received} (expected {expected}) at seq {seq}")]
    UnexpectedPayloadType { received: u8, expected: u8, seq: u16 },

    /// The master leg skipped `lost` packets. The missing range is queued for
    /// backfill from the secondary leg.
    #[error("leg {leg}: {lost} packet(s) lost before seq {received} (expected {expected}), stage {stage}")]
    PacketLost {
        leg: usize,
        expected: u16,
        received: u16,
        lost: u16,
        stage: Stage,
    },

    /// A packet arrived on the secondary leg. It is buffered for backfill,
    /// not delivered.
    #[error("leg {leg}: seq {seq} arrived on the secondary leg")]
    NotPrimary { leg: usize, seq: u16 },

    /// A packet older than the next expected one arrived on the master leg.
    /// It was already delivered or given up on, and is dropped.
    #[error("leg {leg}: late packet seq {seq} (expected {expected})")]
    LatePacket { leg: usize, seq: u16, expected: u16 },

    /// A lost packet was not available on the secondary leg either.
    #[error("leg {leg}: backfill of seq {seq} failed, stage {stage}")]
    BackfillFailed { leg: usize, seq: u16, stage: Stage },

    /// The master leg went offline and roles were swapped.
    #[error("leg {from} offline, switched to leg {to}")]
    LegSwitched { from: usize, to: usize },

    /// No profile matches the stream description.
    #[error("unsupported format at {stage} stage: {detail}")]
    UnsupportedFormat { stage: Stage, detail: String },

    /// No profile is registered under this name.
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    /// The first complete frame is outside the size window of its profile.
    #[error("{profile}: frame of {received} bytes outside [{expected}, {limit}), stage {stage}")]
    FrameLength {
        profile: &'static str,
        received: usize,
        expected: usize,
        limit: usize,
        stage: Stage,
    },

    /// A later frame disagrees with the geometry bound on the first one.
    #[error("{profile}: frame of {received} bytes, expected {expected} plus {padding} padding")]
    GeometryMismatch {
        profile: &'static str,
        received: usize,
        expected: usize,
        padding: usize,
    },

    /// More payload arrived than the frame buffer can hold.
    #[error("frame buffer overflow: {received} bytes exceeds capacity {capacity}")]
    FrameOverflow { received: usize, capacity: usize },

    /// The caller's output buffer cannot hold the extracted content.
    #[error("output buffer too small: {needed} bytes needed, {available} available")]
    OutputTooSmall { needed: usize, available: usize },

    /// A media token was requested from a frame that does not hold it.
    #[error("media buffer not available: {0}")]
    NoMediaBuffer(String),

    /// An ancillary packet carries a DID outside the four audio groups.
    #[error("unknown ancillary DID {did:#05x} at word {offset}")]
    UnknownDid { did: u16, offset: usize },

    /// Configuration rejected at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The worker pool for dual-link demultiplexing could not be created.
    #[error("worker pool: {0}")]
    WorkerPool(String),

    /// [`Receiver::start`](crate::Receiver::start) was called while already running.
    #[error("receiver already running")]
    AlreadyRunning,
}

impl HbrmtError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::UnsupportedFormat { .. }
            | Self::UnknownProfile(_)
            | Self::GeometryMismatch { .. }
            | Self::InvalidConfig(_)
            | Self::WorkerPool(_) => Severity::Fatal,
            _ => Severity::Recoverable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// True when a read error leaves the frame in progress intact: the packet
    /// was buffered for backfill or dropped as a duplicate, a backfill is
    /// pending, or nothing arrived yet.
    pub fn keeps_frame(&self) -> bool {
        matches!(
            self,
            Self::NotPrimary { .. } | Self::PacketLost { .. } | Self::LatePacket { .. } | Self::Timeout
        )
    }
}

/// Convenience alias for `Result<T, HbrmtError>`.
pub type Result<T> = std::result::Result<T, HbrmtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_mismatch_is_fatal() {
        let err = HbrmtError::GeometryMismatch {
            profile: "720p60",
            received: 10,
            expected: 20,
            padding: 0,
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn loss_is_recoverable_and_keeps_frame() {
        let err = HbrmtError::PacketLost {
            leg: 0,
            expected: 10,
            received: 12,
            lost: 2,
            stage: Stage::Sync,
        };
        assert_eq!(err.severity(), Severity::Recoverable);
        assert!(err.keeps_frame());
    }

    #[test]
    fn backfill_failure_drops_frame() {
        let err = HbrmtError::BackfillFailed {
            leg: 1,
            seq: 7,
            stage: Stage::Transport,
        };
        assert!(!err.is_fatal());
        assert!(!err.keeps_frame());
    }

    #[test]
    fn loss_message_names_leg_and_range() {
        let err = HbrmtError::PacketLost {
            leg: 1,
            expected: 100,
            received: 103,
            lost: 3,
            stage: Stage::Sync,
        };
        let msg = err.to_string();
        assert!(msg.contains("leg 1"));
        assert!(msg.contains("seq 103"));
        assert!(msg.contains("expected 100"));
        assert!(msg.contains("sync"));
    }
}
