//! Generates the GVSP 4x2 capture fixture.
//!
//! Run with: `cargo run --bin generate_gvsp_fixture`
//!
//! Writes `tests/fixtures/gvsp_4x2/capture.bin` and `capture.json`, one
//! datagram per millisecond:
//! - Block 1: Mono8 gradient, payloads in order
//! - Error packet for block 2
//! - Block 2: RGB8 color bars, payloads in reverse order
//! - A 5-byte malformed datagram
//! - Block 3: leader and one payload, no trailer (left in flight)

use std::path::Path;

use gvsp_receiver_lib::capture::{
    write_capture, write_metadata, CaptureMetadata, CapturedDatagram,
};
use gvsp_receiver_lib::test_utils::PacketGenerator;

const WIDTH: u32 = 4;
const HEIGHT: u32 = 2;
const DESCRIPTION: &str = concat!(
    "Mono8 gradient, RGB8 color bars (reversed payloads), ",
    "error, malformed and an unterminated block"
);
const MAX_PAYLOAD: usize = 3;
const ERROR_STATUS: u16 = 0x800F;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let output_dir = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("gvsp_4x2");
    std::fs::create_dir_all(&output_dir)?;

    let mut gen = PacketGenerator::new(MAX_PAYLOAD);
    let mut datagrams = gen.frame_datagrams(&PacketGenerator::mono8_gradient(WIDTH, HEIGHT), 1000);
    datagrams.push(PacketGenerator::error_packet(2, ERROR_STATUS));
    datagrams.extend(PacketGenerator::reverse_payloads(gen.frame_datagrams(
        &PacketGenerator::rgb8_color_bars(WIDTH, HEIGHT),
        2000,
    )));
    datagrams.push(vec![0u8; 5]);
    datagrams.push(PacketGenerator::leader(3, 3000));
    datagrams.push(PacketGenerator::payload(3, 1, &[1, 2, 3]));

    let records: Vec<CapturedDatagram> = datagrams
        .into_iter()
        .enumerate()
        .map(|(i, data)| CapturedDatagram {
            timestamp_us: i as u64 * 1000,
            data,
        })
        .collect();

    let metadata = CaptureMetadata {
        source: "generate_gvsp_fixture".to_string(),
        width: WIDTH,
        height: HEIGHT,
        total_datagrams: records.len() as u64,
        total_frames: 2,
        duration_ms: records.last().map_or(0, |r| r.timestamp_us / 1000),
        total_bytes: records.iter().map(|r| r.data.len() as u64).sum(),
        description: DESCRIPTION.to_string(),
        ..Default::default()
    };

    let capture_path = output_dir.join("capture.bin");
    write_capture(&capture_path, &records)?;
    write_metadata(&capture_path.with_extension("json"), &metadata)?;

    println!(
        "Wrote {} datagrams ({} bytes) to {}",
        metadata.total_datagrams,
        metadata.total_bytes,
        capture_path.display()
    );
    Ok(())
}
