//! Integration tests for replay fixtures.
//!
//! These tests verify that the capture fixture in `tests/fixtures/` can be
//! loaded and replayed correctly.

use gvsp_receiver_lib::capture::read_capture;
use gvsp_receiver_lib::config::ReceiverConfig;
use gvsp_receiver_lib::frame_validation::{FrameGeometry, PixelFormat};
use gvsp_receiver_lib::receiver::Pipeline;
use gvsp_receiver_lib::replay::{replay_all_frames, FrameIterator, ReplayConfig, ReplaySource};
use gvsp_receiver_lib::test_utils::{CollectingSink, PacketGenerator};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Path to the GVSP 4x2 test fixture capture.
fn fixture_capture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("gvsp_4x2")
        .join("capture.bin")
}

#[test]
fn test_load_fixture() {
    let capture_path = fixture_capture();
    assert!(capture_path.exists(), "Fixture file should exist");

    let source = ReplaySource::load(&capture_path).expect("Should load fixture");
    assert_eq!(source.datagram_count(), 19);
    assert_eq!(source.duration_ms(), 18);

    let metadata = source.metadata().expect("Should have metadata");
    assert_eq!(metadata.width, 4);
    assert_eq!(metadata.height, 2);
    assert_eq!(metadata.total_datagrams, 19);
    assert_eq!(metadata.total_frames, 2);
    assert_eq!(metadata.total_bytes, 220);
    assert_eq!(source.geometry(), Some(FrameGeometry::new(4, 2)));
}

#[test]
fn test_fixture_records_are_consistent_with_metadata() {
    let records = read_capture(&fixture_capture()).unwrap();
    let bytes: usize = records.iter().map(|r| r.data.len()).sum();

    assert_eq!(bytes, 220);
    assert!(records
        .windows(2)
        .all(|pair| pair[0].timestamp_us < pair[1].timestamp_us));
}

#[test]
fn test_replay_fixture_produces_both_frames() {
    let frames = replay_all_frames(&fixture_capture(), None).expect("Should replay fixture");

    assert_eq!(frames.len(), 2);

    assert_eq!(frames[0].block_id, 1);
    assert_eq!(frames[0].pixel_format, PixelFormat::Mono8);
    assert_eq!(frames[0].data, PacketGenerator::mono8_gradient(4, 2));
    assert_eq!(frames[0].start_timestamp, Some(1000));

    assert_eq!(frames[1].block_id, 2);
    assert_eq!(frames[1].pixel_format, PixelFormat::Rgb8);
    assert_eq!(frames[1].data, PacketGenerator::rgb8_color_bars(4, 2));
    assert_eq!(frames[1].start_timestamp, Some(2000));
    assert_eq!(frames[1].packet_count, 8);
}

#[test]
fn test_fixture_assembler_stats() {
    let mut frames = FrameIterator::new(&fixture_capture(), None).unwrap();
    assert_eq!(frames.by_ref().count(), 2);

    let stats = frames.stats();
    assert_eq!(stats.datagrams, 19);
    assert_eq!(stats.error_packets, 1);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.frames_started, 3);
    assert_eq!(stats.frames_completed, 2);
    assert_eq!(stats.frames_dropped, 0);
}

#[test]
fn test_fixture_through_threaded_pipeline() {
    let source = ReplaySource::load_with_config(
        &fixture_capture(),
        ReplayConfig {
            speed: 0.0,
            ..Default::default()
        },
    )
    .unwrap();
    let config = ReceiverConfig {
        width: 4,
        height: 2,
        ..Default::default()
    };

    let sink = CollectingSink::new();
    let mut pipeline = Pipeline::start(source, sink.clone(), &config, None);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !pipeline.is_finished() {
        assert!(Instant::now() < deadline, "pipeline should finish");
        std::thread::sleep(Duration::from_millis(5));
    }
    let report = pipeline.stop().unwrap();

    assert_eq!(report.datagrams_received, 19);
    assert_eq!(report.frames_delivered, 2);
    // Block 3 was still open when the source ran dry
    assert_eq!(report.assembler.frames_abandoned, 1);
    assert_eq!(sink.frames()[1].data, PacketGenerator::rgb8_color_bars(4, 2));
}
