//! SMPTE ST 2022-6 receiver with ST 2022-7 seamless protection switching.
//!
//! Packets arrive from a [`PacketSource`] (a UDP socket, a capture file, or
//! a [`ProtectionSwitch`] merging two of them), are reassembled into a
//! [`TransportFrame`] and handed to the caller by a [`Receiver`], which
//! then extracts video, audio and ancillary data from the frame.

pub mod error;
pub mod frame;
pub mod media;
pub mod profile;
pub mod receiver;
pub mod redundancy;
pub mod transport;

pub use error::{HbrmtError, Result, Severity, Stage};
pub use frame::builder::{BuilderOptions, FrameBuilder};
pub use frame::demux::DemuxPool;
pub use frame::{FrameOptions, FramePart, FrameState, FrameStats, MediaBuffer, MediaKind, TransportFrame};
pub use media::packetizer::HbrmtPacketizer;
pub use profile::SmpteProfile;
pub use receiver::{CompletedFrame, Receiver, ReceiverConfig, ReceiverStats};
pub use redundancy::{ProtectionSwitch, ShutdownHandle, SwitchConfig};
pub use transport::file::FileSourceConfig;
pub use transport::{FileSource, MemorySource, PacketSource, UdpSource, UdpSourceConfig};
