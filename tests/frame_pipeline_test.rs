//! Integration tests for the complete frame processing pipeline.
//!
//! Tests the full datagram-to-sink pipeline:
//! ```text
//! Datagrams → Header Decode → Frame Assembly → Reassembly → Sink
//! ```
//!
//! These tests verify that all components work together correctly without
//! a camera on the network.

use gvsp_receiver_lib::config::ReceiverConfig;
use gvsp_receiver_lib::frame_assembler::{DuplicatePolicy, FrameAssembler, ProcessResult};
use gvsp_receiver_lib::frame_validation::{FrameGeometry, PixelFormat};
use gvsp_receiver_lib::reassembly::AssembledFrame;
use gvsp_receiver_lib::receiver::{run_inline, Pipeline, UdpDatagramSource};
use gvsp_receiver_lib::sink::{read_segment, read_segment_metadata, MultiSink, SegmentRecorder};
use gvsp_receiver_lib::test_utils::{CollectingSink, MemorySource, PacketGenerator, Rgb};
use std::net::UdpSocket;
use std::time::{Duration, Instant};
use tempfile::tempdir;

/// Helper to feed datagrams through a fresh assembler
fn assemble_all(datagrams: &[Vec<u8>], width: u32, height: u32) -> Vec<AssembledFrame> {
    let mut assembler =
        FrameAssembler::new(FrameGeometry::new(width, height), DuplicatePolicy::KeepFirst);

    datagrams
        .iter()
        .filter_map(|d| match assembler.process_datagram(d) {
            ProcessResult::Frame(frame) => Some(frame),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Happy Path: Complete Pipeline Tests
// ============================================================================

#[test]
fn test_leader_two_payloads_trailer_emits_one_frame() {
    let x = [0x11u8; 4];
    let y = [0x22u8; 4];
    let datagrams = [
        PacketGenerator::leader(1, 1000),
        PacketGenerator::payload(1, 0, &x),
        PacketGenerator::payload(1, 1, &y),
        PacketGenerator::trailer(1, 2),
    ];

    let mut assembler = FrameAssembler::new(FrameGeometry::new(4, 2), DuplicatePolicy::KeepFirst);

    for datagram in &datagrams[..3] {
        assert!(
            !matches!(assembler.process_datagram(datagram), ProcessResult::Frame(_)),
            "No frame may be emitted before the trailer"
        );
    }

    let ProcessResult::Frame(frame) = assembler.process_datagram(&datagrams[3]) else {
        panic!("Trailer should complete the frame");
    };

    let expected: Vec<u8> = x.iter().chain(y.iter()).copied().collect();
    assert_eq!(frame.data, expected);
    assert_eq!(frame.start_timestamp, Some(1000));
    assert_eq!(frame.pixel_format, PixelFormat::Mono8);
    assert!(!assembler.is_collecting());
}

#[test]
fn test_complete_pipeline_rgb8_solid_red() {
    let mut gen = PacketGenerator::new(1024);
    let (width, height) = (64u32, 48u32);
    let image = PacketGenerator::rgb8_solid(width, height, Rgb::RED);
    let datagrams = gen.frame_datagrams(&image, 77);

    let frames = assemble_all(&datagrams, width, height);

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].pixel_format, PixelFormat::Rgb8);
    assert_eq!(frames[0].data.len(), (width * height * 3) as usize);
    assert!(frames[0].data.chunks(3).all(|px| px == [255, 0, 0]));
}

#[test]
fn test_pipeline_out_of_order_payloads() {
    let mut gen = PacketGenerator::new(100);
    let (width, height) = (32u32, 24u32);
    let image = PacketGenerator::mono8_gradient(width, height);

    let reversed = PacketGenerator::reverse_payloads(gen.frame_datagrams(&image, 1));
    let interleaved = PacketGenerator::interleave_payloads(gen.frame_datagrams(&image, 2));

    let mut datagrams = reversed;
    datagrams.extend(interleaved);
    let frames = assemble_all(&datagrams, width, height);

    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.data == image));
}

#[test]
fn test_pipeline_mixed_formats_in_one_stream() {
    let mut gen = PacketGenerator::new(500);
    let (width, height) = (40u32, 30u32);
    let mono = PacketGenerator::mono8_solid(width, height, Rgb::WHITE);
    let color = PacketGenerator::rgb8_color_bars(width, height);

    let mut datagrams = gen.frame_datagrams(&mono, 1);
    datagrams.extend(gen.frame_datagrams(&color, 2));
    datagrams.extend(gen.frame_datagrams(&mono, 3));

    let formats: Vec<PixelFormat> = assemble_all(&datagrams, width, height)
        .iter()
        .map(|f| f.pixel_format)
        .collect();

    assert_eq!(
        formats,
        vec![PixelFormat::Mono8, PixelFormat::Rgb8, PixelFormat::Mono8]
    );
}

// ============================================================================
// Error Recovery Tests
// ============================================================================

#[test]
fn test_pipeline_recovers_after_noise() {
    let mut gen = PacketGenerator::new(8);
    let image = PacketGenerator::mono8_gradient(4, 4);

    let mut datagrams = vec![
        vec![0x00; 5],
        PacketGenerator::payload(99, 1, &[1, 2, 3]),
        PacketGenerator::trailer(99, 2),
        PacketGenerator::error_packet(1, 0x8001),
    ];
    // Short frame: wrong size, dropped at the trailer
    datagrams.extend(gen.frame_datagrams(&[0xAB; 5], 10));
    datagrams.extend(gen.frame_datagrams(&image, 20));

    let frames = assemble_all(&datagrams, 4, 4);

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data, image);
    assert_eq!(frames[0].start_timestamp, Some(20));
}

#[test]
fn test_pipeline_new_leader_discards_partial_frame() {
    let image = PacketGenerator::mono8_solid(4, 2, Rgb::BLACK);
    let datagrams = vec![
        PacketGenerator::leader(5, 500),
        PacketGenerator::payload(5, 1, &[0xEE; 4]),
        PacketGenerator::leader(6, 600),
        PacketGenerator::payload(5, 2, &[0xEE; 4]),
        PacketGenerator::payload(6, 1, &image),
        PacketGenerator::trailer(5, 3),
        PacketGenerator::trailer(6, 2),
    ];

    let frames = assemble_all(&datagrams, 4, 2);

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].block_id, 6);
    assert_eq!(frames[0].data, image);
}

// ============================================================================
// Threaded Pipeline And Sinks
// ============================================================================

fn small_config() -> ReceiverConfig {
    ReceiverConfig {
        listen_ip: "127.0.0.1".to_string(),
        listen_port: 0,
        width: 4,
        height: 2,
        read_timeout_ms: 10,
        ..Default::default()
    }
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_threaded_pipeline_records_segments() {
    let dir = tempdir().unwrap();
    let mut gen = PacketGenerator::new(3);
    let mut datagrams = Vec::new();
    for i in 0..3u8 {
        datagrams.extend(gen.frame_datagrams(&[i; 8], u64::from(i) + 1));
    }

    let collector = CollectingSink::new();
    let mut sink = MultiSink::new();
    sink.push(Box::new(collector.clone()));
    sink.push(Box::new(SegmentRecorder::new(
        dir.path(),
        Duration::from_secs(300),
    )));

    let mut pipeline = Pipeline::start(MemorySource::new(datagrams), sink, &small_config(), None);
    wait_for(Duration::from_secs(5), || pipeline.is_finished());
    let report = pipeline.stop().unwrap();

    assert_eq!(report.frames_delivered, 3);
    assert_eq!(collector.frames().len(), 3);

    let segments: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "gvraw"))
        .collect();
    assert_eq!(segments.len(), 1);

    let records = read_segment(&segments[0]).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].data, vec![2u8; 8]);
    assert_eq!(records[2].start_timestamp, 3);

    let metadata = read_segment_metadata(&segments[0].with_extension("json")).unwrap();
    assert_eq!(metadata.total_frames, 3);
    assert_eq!(metadata.last_block_id, 3);
}

#[test]
fn test_run_inline_matches_threaded_pipeline() {
    let mut gen = PacketGenerator::new(5);
    let mut datagrams = Vec::new();
    for i in 0..4u8 {
        let image = PacketGenerator::rgb8_solid(4, 2, Rgb { r: i, g: 0, b: 0 });
        datagrams.extend(PacketGenerator::interleave_payloads(
            gen.frame_datagrams(&image, u64::from(i)),
        ));
    }

    let inline_sink = CollectingSink::new();
    let mut source = MemorySource::new(datagrams.clone());
    let mut assembler = FrameAssembler::from_config(&small_config());
    run_inline(&mut source, &mut assembler, &mut inline_sink.clone()).unwrap();

    let threaded_sink = CollectingSink::new();
    let mut pipeline = Pipeline::start(
        MemorySource::new(datagrams),
        threaded_sink.clone(),
        &small_config(),
        None,
    );
    wait_for(Duration::from_secs(5), || pipeline.is_finished());
    pipeline.stop().unwrap();

    let strip = |frames: Vec<AssembledFrame>| -> Vec<(u16, Vec<u8>)> {
        frames.into_iter().map(|f| (f.block_id, f.data)).collect()
    };
    assert_eq!(strip(inline_sink.frames()), strip(threaded_sink.frames()));
    assert_eq!(inline_sink.frames().len(), 4);
}

#[test]
fn test_udp_pipeline_end_to_end() {
    let source = UdpDatagramSource::bind(&small_config()).unwrap();
    let addr = source.local_addr().unwrap();

    let sink = CollectingSink::new();
    let mut pipeline = Pipeline::start(source, sink.clone(), &small_config(), None);

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut gen = PacketGenerator::new(4);
    let image = PacketGenerator::mono8_gradient(4, 2);
    for datagram in gen.frame_datagrams(&image, 1234) {
        sender.send_to(&datagram, addr).unwrap();
    }

    wait_for(Duration::from_secs(5), || !sink.frames().is_empty());
    let report = pipeline.stop().unwrap();

    let frames = sink.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data, image);
    assert_eq!(frames[0].start_timestamp, Some(1234));
    assert_eq!(report.frames_delivered, 1);
}
