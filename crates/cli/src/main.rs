use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use hbrmt::frame::demux::interleave;
use hbrmt::media::hbrmt::HbrmtHeader;
use hbrmt::media::rtp::RtpPacket;
use hbrmt::media::words::{set_word, words_in};
use hbrmt::profile::{self, SmpteProfile};
use hbrmt::{
    BuilderOptions, FileSource, FileSourceConfig, FrameBuilder, HbrmtError, HbrmtPacketizer, MediaKind,
    PacketSource, ProtectionSwitch, Receiver, ReceiverConfig, SwitchConfig, UdpSource, UdpSourceConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hbrmt", version, about = "SMPTE ST 2022-6 receiver and test-pattern sender")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Receive a stream and print a line per frame
    Receive {
        /// Local address of the first leg (host:port)
        #[arg(long, default_value = "0.0.0.0:5000", conflicts_with = "file")]
        bind: SocketAddr,

        /// Local address of the second leg; enables ST 2022-7 protection
        #[arg(long, conflicts_with = "file")]
        secondary: Option<SocketAddr>,

        /// Multicast group per leg, in leg order
        #[arg(long)]
        group: Vec<Ipv4Addr>,

        /// Interface for multicast membership
        #[arg(long, default_value = "0.0.0.0")]
        interface: Ipv4Addr,

        /// Replay a pcap or raw capture instead of listening
        #[arg(long)]
        file: Option<PathBuf>,

        /// Replay rate of --file
        #[arg(long, default_value_t = 25.0)]
        fps: f32,

        /// Stop at the end of --file instead of rewinding
        #[arg(long)]
        once: bool,

        /// Force a profile instead of detecting it
        #[arg(long)]
        profile: Option<String>,

        /// Publish only video
        #[arg(long)]
        video_only: bool,

        /// Silence after which a leg is considered offline, in milliseconds
        #[arg(long, default_value_t = 20)]
        offline_ms: u64,

        /// Stop after this many frames
        #[arg(long)]
        frames: Option<u64>,

        /// Write the video of the first N frames to DIR
        #[arg(long, value_name = "DIR")]
        dump: Option<PathBuf>,

        /// Frames to write with --dump
        #[arg(long, default_value_t = 1)]
        dump_count: u64,
    },

    /// Send a ramp test pattern
    Send {
        /// Destination (host:port)
        #[arg(long)]
        dest: SocketAddr,

        /// Profile name, see `hbrmt profiles`
        #[arg(long, default_value = "720p60")]
        profile: String,

        /// Frames to send; runs until Enter without it
        #[arg(long)]
        frames: Option<u64>,

        /// Regenerate the line CRCs
        #[arg(long)]
        crc: bool,
    },

    /// List the supported profiles
    Profiles,

    /// Print the RTP and HBRMT headers of a capture
    Inspect {
        file: PathBuf,

        /// Packets to print; the summary covers the whole capture
        #[arg(long, default_value_t = 20)]
        count: usize,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Receive {
            bind,
            secondary,
            group,
            interface,
            file,
            fps,
            once,
            profile,
            video_only,
            offline_ms,
            frames,
            dump,
            dump_count,
        } => {
            let source = match file {
                Some(path) => open_file(path, fps, !once),
                None => open_legs(bind, secondary, &group, interface, Duration::from_millis(offline_ms)),
            };
            source.and_then(|source| {
                let config = ReceiverConfig {
                    profile,
                    video_only,
                    ..Default::default()
                };
                receive(source, config, frames, dump.map(|dir| (dir, dump_count)))
            })
        }
        Command::Send {
            dest,
            profile,
            frames,
            crc,
        } => send(dest, &profile, frames, crc),
        Command::Profiles => {
            list_profiles();
            Ok(())
        }
        Command::Inspect { file, count } => inspect(file, count),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn open_file(path: PathBuf, fps: f32, looping: bool) -> hbrmt::Result<Box<dyn PacketSource>> {
    let config = FileSourceConfig { path, fps, looping };
    Ok(Box::new(FileSource::open(&config)?))
}

fn open_legs(
    bind: SocketAddr,
    secondary: Option<SocketAddr>,
    groups: &[Ipv4Addr],
    interface: Ipv4Addr,
    offline_threshold: Duration,
) -> hbrmt::Result<Box<dyn PacketSource>> {
    let leg = |bind, multicast| {
        UdpSource::bind(&UdpSourceConfig {
            bind,
            multicast,
            interface,
            ..Default::default()
        })
    };
    let primary = leg(bind, groups.first().copied())?;
    let Some(secondary) = secondary else {
        return Ok(Box::new(primary));
    };
    let secondary = leg(secondary, groups.get(1).copied())?;
    let switch = ProtectionSwitch::init(
        [Box::new(primary), Box::new(secondary)],
        SwitchConfig {
            offline_threshold,
            ..Default::default()
        },
    )?;
    Ok(Box::new(switch))
}

/// Stop flag raised when Enter is pressed.
fn stop_on_enter() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().read_line(&mut line);
        flag.store(true, Ordering::SeqCst);
    });
    stop
}

fn receive(
    source: Box<dyn PacketSource>,
    config: ReceiverConfig,
    limit: Option<u64>,
    dump: Option<(PathBuf, u64)>,
) -> hbrmt::Result<()> {
    if let Some((dir, _)) = &dump {
        std::fs::create_dir_all(dir)?;
    }
    let mut receiver = Receiver::new(config);
    receiver.start(source)?;
    println!("receiving, press Enter to stop");
    let stop = stop_on_enter();

    let mut out = Vec::new();
    let mut received = 0u64;
    while !stop.load(Ordering::SeqCst) && limit.is_none_or(|n| received < n) {
        let mut frame = match receiver.next_frame_timeout(Duration::from_millis(500)) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(HbrmtError::Timeout) => continue,
            Err(e) => return Err(e),
        };
        received += 1;

        let name = frame.profile().map_or("?", |p| p.name);
        let mut line = format!(
            "frame {:>6} slot {} {name} fc {:>3} ts {:>10}",
            received,
            frame.slot(),
            frame.frame_count(),
            frame.timestamp()
        );
        while let Some(token) = frame.next_media_buffer() {
            let Some(size) = frame.media_size(token.kind) else {
                continue;
            };
            out.resize(size, 0);
            let len = frame.extract_media_content(token, &mut out)?;
            line.push_str(&format!(" {:?}:{len}", token.kind));

            if let Some((dir, count)) = &dump {
                if token.kind == MediaKind::Video && received <= *count {
                    let path = dir.join(format!("frame-{received:04}-{:?}.yuv10", token.part).to_lowercase());
                    std::fs::write(&path, &out[..len])?;
                    tracing::info!(path = %path.display(), "video dumped");
                }
            }
        }
        println!("{line}");
    }

    let stats = receiver.stats();
    println!(
        "{} frames, {} packets, {} duplicates, {} rejected",
        stats.frames(),
        stats.packets(),
        stats.duplicates(),
        stats.rejected()
    );
    receiver.stop()
}

fn send(dest: SocketAddr, name: &str, limit: Option<u64>, crc: bool) -> hbrmt::Result<()> {
    let profile = profile::resolve_by_name(name)?;
    let frame = test_pattern(profile, crc)?;
    let mut packetizer = HbrmtPacketizer::new(profile)?;
    let socket = UdpSource::sender()?;

    println!("sending {} to {dest}, press Enter to stop", profile.name);
    let stop = stop_on_enter();
    let interval = Duration::from_secs_f32(1.0 / profile.frame_rate);
    let mut next = Instant::now();
    let mut sent = 0u64;
    while !stop.load(Ordering::SeqCst) && limit.is_none_or(|n| sent < n) {
        for packet in packetizer.packetize(&frame) {
            socket.send_to(&packet, dest)?;
        }
        sent += 1;
        next += interval;
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        } else {
            next = now;
        }
    }
    tracing::info!(frames = sent, "sender stopped");
    Ok(())
}

/// Luma ramp across each line on neutral chroma, as a transport frame.
fn test_pattern(profile: &'static SmpteProfile, crc: bool) -> hbrmt::Result<Vec<u8>> {
    let mut video = vec![0u8; profile.video_size()];
    let line_words = words_in(profile.active_line_size());
    let span = 0x3ac - 0x040;
    for j in 0..words_in(video.len()) {
        let x = (j % line_words) / 2;
        let word = if j % 2 == 0 {
            0x200
        } else {
            0x040 + (x * span / profile.active_width) as u16
        };
        set_word(&mut video, j, word);
    }

    let mut builder = FrameBuilder::new(profile, BuilderOptions { compute_crc: crc });
    builder.insert_video(&video)?;
    if !profile.is_dual_link() {
        return Ok(builder.into_frame());
    }
    let mut transport = vec![0u8; profile.transport_frame_size()];
    interleave(builder.frame(), builder.frame(), &mut transport);
    Ok(transport)
}

fn list_profiles() {
    println!("{:<22} {:>11} {:>6} {:>12} {:>4}", "name", "active", "rate", "transport", "map");
    for p in profile::profiles() {
        println!(
            "{:<22} {:>5}x{:<5} {:>6.2} {:>12} {:>4}",
            p.name,
            p.active_width,
            p.active_height,
            p.frame_rate,
            p.transport_frame_size(),
            p.map
        );
    }
}

fn inspect(path: PathBuf, count: usize) -> hbrmt::Result<()> {
    let mut source = FileSource::load(&path)?;
    let mut buf = vec![0u8; 1 << 16];
    let mut packets = 0usize;
    let mut markers = 0usize;
    let mut gaps = 0usize;
    let mut last: Option<u16> = None;

    loop {
        let len = match source.recv(&mut buf) {
            Ok(len) => len,
            Err(HbrmtError::Closed) => break,
            Err(e) => return Err(e),
        };
        let packet = match RtpPacket::parse(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                println!("#{packets}: {e}");
                packets += 1;
                continue;
            }
        };
        let seq = packet.sequence();
        if last.is_some_and(|l| l.wrapping_add(1) != seq) {
            gaps += 1;
        }
        last = Some(seq);
        if packet.marker() {
            markers += 1;
        }

        if packets < count {
            let mut line = format!(
                "#{packets}: seq {seq} pt {} ts {} m {} len {len}",
                packet.payload_type(),
                packet.timestamp(),
                u8::from(packet.marker())
            );
            match HbrmtHeader::decode(packet.payload()) {
                Ok(h) => line.push_str(&format!(
                    " | fc {} map {} frm {:#04x} frate {:#04x} sample {:#x} clk {:?} vts {}",
                    h.frame_count, h.map, h.frame, h.frate, h.sample, h.clock, h.timestamp
                )),
                Err(e) => line.push_str(&format!(" | {e}")),
            }
            println!("{line}");
        }
        packets += 1;
    }

    println!("{packets} packets, {markers} frame markers, {gaps} sequence gaps");
    Ok(())
}
