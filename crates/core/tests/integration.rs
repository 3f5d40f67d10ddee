//! Integration tests: frames built for transmission, packetized, carried by
//! each kind of packet source and reassembled by the receiver.

use std::net::SocketAddr;
use std::time::Duration;

use hbrmt::media::audio::{AesSample, AudioPacket, SamplingRate, TAGGED_PACKET_LEN};
use hbrmt::media::rtp::{PAYLOAD_TYPE_ST2022_6, RtpHeader};
use hbrmt::profile::{self, SmpteProfile};
use hbrmt::{
    BuilderOptions, FileSource, FileSourceConfig, FramePart, FrameBuilder, HbrmtPacketizer, MediaBuffer,
    MediaKind, MemorySource, PacketSource, ProtectionSwitch, Receiver, ReceiverConfig, SwitchConfig,
    UdpSource, UdpSourceConfig,
};

/// Fixed port for the loopback test. Must be explicit (no port 0).
const LOOPBACK_BIND: &str = "127.0.0.1:15004";

fn random_picture(profile: &SmpteProfile) -> Vec<u8> {
    let mut picture = vec![0u8; profile.video_size()];
    rand::fill(&mut picture[..]);
    picture
}

/// `frames` copies of one frame carrying `picture`, packetized from a known
/// sequence number.
fn stream(profile: &'static SmpteProfile, picture: &[u8], audio: &[u8], frames: usize) -> Vec<Vec<u8>> {
    let mut builder = FrameBuilder::new(profile, BuilderOptions { compute_crc: true });
    builder.insert_video(picture).expect("insert video");
    builder.insert_audio(audio).expect("insert audio");
    let frame = builder.into_frame();
    let rtp = RtpHeader::new(PAYLOAD_TYPE_ST2022_6, 0x2022, 40_000);
    let mut packetizer = HbrmtPacketizer::with_rtp(profile, rtp).expect("packetizer");
    (0..frames).flat_map(|_| packetizer.packetize(&frame)).collect()
}

fn assert_video(receiver: &mut Receiver, picture: &[u8]) -> usize {
    let mut frames = 0;
    let mut out = vec![0u8; picture.len()];
    while let Some(mut frame) = receiver.next_frame() {
        let token = frame.next_media_buffer().expect("video token");
        assert_eq!(frame.buffer_type(token), MediaKind::Video);
        assert_eq!(frame.extract_media_content(token, &mut out).unwrap(), picture.len());
        assert!(out == picture, "video differs in frame {}", frame.frame_count());
        frames += 1;
    }
    frames
}

#[test]
fn memory_stream_round_trip() {
    let profile = profile::resolve_by_name("720p60").unwrap();
    let picture = random_picture(profile);
    let mut audio = vec![0u8; 2 * TAGGED_PACKET_LEN];
    AudioPacket::control(1, 0, SamplingRate::Khz48, 0b0011)
        .write_tagged(9, &mut audio[..])
        .unwrap();
    let sample = AesSample {
        sample: 0x12_3456,
        validity: true,
        ..Default::default()
    };
    AudioPacket::data(1, 1, 0x0abc, [sample; 4])
        .write_tagged(9, &mut audio[TAGGED_PACKET_LEN..])
        .unwrap();

    let mut receiver = Receiver::new(ReceiverConfig::default());
    receiver
        .start(MemorySource::new(stream(profile, &picture, &audio, 3)))
        .expect("start receiver");

    let mut frame = receiver.next_frame().expect("a complete frame");
    assert_eq!(frame.profile().unwrap().name, "720p60");
    assert!(frame.padding().unwrap() < 1400);
    let tokens: Vec<MediaBuffer> = std::iter::from_fn(|| frame.next_media_buffer()).collect();
    let kinds: Vec<MediaKind> = tokens.iter().map(|t| t.kind).collect();
    assert_eq!(kinds, [MediaKind::Video, MediaKind::Audio, MediaKind::Ancillary]);
    assert!(tokens.iter().all(|t| t.part == FramePart::Full));

    let mut out = vec![0u8; frame.media_size(MediaKind::Video).unwrap()];
    assert_eq!(frame.extract_media_content(tokens[0], &mut out).unwrap(), picture.len());
    assert!(out == picture);

    let mut records = vec![0u8; frame.media_size(MediaKind::Audio).unwrap()];
    let len = frame.extract_media_content(tokens[1], &mut records).unwrap();
    assert_eq!(len, 2 * TAGGED_PACKET_LEN);
    // data record first, then control
    assert_eq!(&records[..len], &[&audio[TAGGED_PACKET_LEN..], &audio[..TAGGED_PACKET_LEN]].concat()[..]);
    let group = &frame.audio().groups()[1];
    assert!(group.valid);
    assert!(group.channels[1].active && !group.channels[2].active);
    // data precedes control on the line, so samples decode from the next pass on
    frame.extract_media_content(tokens[1], &mut records).unwrap();
    assert_eq!(frame.audio().groups()[1].channels[0].last.sample, 0x12_3456);

    let mut hanc = vec![0u8; frame.media_size(MediaKind::Ancillary).unwrap()];
    assert_eq!(frame.extract_media_content(tokens[2], &mut hanc).unwrap(), hanc.len());
    drop(frame);

    receiver.stop().expect("clean stop");
    assert_eq!(receiver.stats().rejected(), 0);
}

#[test]
fn raw_capture_replay() {
    let profile = profile::resolve_by_name("525i29.97").unwrap();
    let picture = random_picture(profile);
    let packets = stream(profile, &picture, &[], 3);
    let path = std::env::temp_dir().join(format!("hbrmt-replay-{}.raw", std::process::id()));
    std::fs::write(&path, packets.concat()).unwrap();

    let source = FileSource::open(&FileSourceConfig {
        path: path.clone(),
        fps: 0.0,
        looping: false,
    })
    .unwrap();
    assert!(!source.is_pcap());
    assert_eq!(source.sample_size(), 1400);

    let mut receiver = Receiver::new(ReceiverConfig {
        video_only: true,
        ..Default::default()
    });
    receiver.start(source).unwrap();
    assert!(assert_video(&mut receiver, &picture) >= 1);
    receiver.stop().unwrap();
    assert_eq!(receiver.stats().frames(), 2);
    std::fs::remove_file(&path).ok();
}

#[test]
fn protection_switch_repairs_master_losses() {
    let profile = profile::resolve_by_name("525i29.97").unwrap();
    let picture = random_picture(profile);
    let packets = stream(profile, &picture, &[], 3);
    let per_frame = packets.len() / 3;
    // one loss in each frame after the first
    let lost = [per_frame + 100, 2 * per_frame + 400];
    let master: Vec<Vec<u8>> = packets
        .iter()
        .enumerate()
        .filter(|(i, _)| !lost.contains(i))
        .map(|(_, p)| p.clone())
        .collect();

    // the secondary runs ahead so every lost packet is buffered in time
    let master = MemorySource::new(master).with_interval(Duration::from_micros(100));
    let secondary = MemorySource::new(packets);
    let switch = ProtectionSwitch::init(
        [Box::new(master), Box::new(secondary)],
        SwitchConfig {
            offline_threshold: Duration::from_secs(30),
            ..Default::default()
        },
    )
    .unwrap();

    let mut receiver = Receiver::new(ReceiverConfig {
        video_only: true,
        ..Default::default()
    });
    receiver.start(switch).unwrap();
    assert!(assert_video(&mut receiver, &picture) >= 1);
    receiver.stop().unwrap();
    // without the repair both frames would be dropped
    assert_eq!(receiver.stats().frames(), 2);
}

#[test]
fn loss_on_both_legs_drops_one_frame() {
    let profile = profile::resolve_by_name("525i29.97").unwrap();
    let picture = random_picture(profile);
    let packets = stream(profile, &picture, &[], 4);
    let per_frame = packets.len() / 4;
    let lost = 2 * per_frame + 300;
    let without = |packets: &[Vec<u8>]| -> Vec<Vec<u8>> {
        packets
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != lost)
            .map(|(_, p)| p.clone())
            .collect()
    };

    let master = MemorySource::new(without(&packets)).with_interval(Duration::from_micros(100));
    let secondary = MemorySource::new(without(&packets));
    let switch = ProtectionSwitch::init(
        [Box::new(master), Box::new(secondary)],
        SwitchConfig {
            offline_threshold: Duration::from_secs(30),
            ..Default::default()
        },
    )
    .unwrap();

    let mut receiver = Receiver::new(ReceiverConfig {
        slots: 1,
        video_only: true,
        ..Default::default()
    });
    receiver.start(switch).unwrap();
    let mut counts = Vec::new();
    let mut out = vec![0u8; picture.len()];
    while let Some(mut frame) = receiver.next_frame() {
        let token = frame.next_media_buffer().unwrap();
        frame.extract_media_content(token, &mut out).unwrap();
        assert!(out == picture);
        counts.push(frame.frame_count());
    }
    receiver.stop().expect("unrepairable loss is not fatal");
    // frame 2 is dropped, the pipeline carries on with frame 3
    assert_eq!(counts, [1, 3]);
}

#[test]
fn udp_loopback() {
    let bind: SocketAddr = LOOPBACK_BIND.parse().unwrap();
    let source = UdpSource::bind(&UdpSourceConfig {
        bind,
        ..Default::default()
    })
    .expect("bind loopback");

    let profile = profile::resolve_by_name("525i29.97").unwrap();
    let picture = random_picture(profile);
    let packets = stream(profile, &picture, &[], 6);

    let mut receiver = Receiver::new(ReceiverConfig {
        video_only: true,
        ..Default::default()
    });
    receiver.start(source).unwrap();

    let sender = std::thread::spawn(move || {
        let socket = UdpSource::sender().expect("sender socket");
        for chunk in packets.chunks(10) {
            for packet in chunk {
                socket.send_to(packet, bind).expect("send");
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    });

    let mut out = vec![0u8; picture.len()];
    let mut frame = receiver
        .next_frame_timeout(Duration::from_secs(10))
        .expect("frame in time")
        .expect("receiver running");
    let token = frame.next_media_buffer().unwrap();
    frame.extract_media_content(token, &mut out).unwrap();
    assert!(out == picture);
    drop(frame);

    sender.join().unwrap();
    receiver.stop().unwrap();
}
