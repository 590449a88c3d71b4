//! Synthetic GVSP datagram generation for testing
//!
//! Generates leader/payload/trailer datagrams with known payloads for
//! byte-exact test validation.
//!
//! # Example
//!
//! ```rust,ignore
//! use gvsp_receiver_lib::test_utils::{PacketGenerator, Rgb};
//!
//! let mut gen = PacketGenerator::default();
//!
//! // Datagrams for a solid red RGB8 frame
//! let image = PacketGenerator::rgb8_solid(640, 480, Rgb::RED);
//! let datagrams = gen.frame_datagrams(&image, 1_000);
//!
//! // Same frame with payloads arriving back to front
//! let reordered = PacketGenerator::reverse_payloads(datagrams);
//! ```

use crate::gvsp_header::{PacketFormat, PacketHeader, LEADER_MIN_LEN, LEADER_TIMESTAMP_OFFSET};

/// RGB color for test patterns
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgb {
    /// Red component (0-255)
    pub r: u8,
    /// Green component (0-255)
    pub g: u8,
    /// Blue component (0-255)
    pub b: u8,
}

impl Rgb {
    /// Pure red color
    pub const RED: Rgb = Rgb { r: 255, g: 0, b: 0 };
    /// Pure green color
    pub const GREEN: Rgb = Rgb { r: 0, g: 255, b: 0 };
    /// Pure blue color
    pub const BLUE: Rgb = Rgb { r: 0, g: 0, b: 255 };
    /// Pure white color
    pub const WHITE: Rgb = Rgb {
        r: 255,
        g: 255,
        b: 255,
    };
    /// Pure black color
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };

    /// Luma (BT.601, full range) for grayscale patterns
    pub fn to_gray(&self) -> u8 {
        (0.299 * self.r as f32 + 0.587 * self.g as f32 + 0.114 * self.b as f32)
            .round()
            .clamp(0.0, 255.0) as u8
    }
}

/// Generates synthetic GVSP datagrams for testing
pub struct PacketGenerator {
    /// Maximum payload size per datagram (excluding header)
    pub max_payload_size: usize,
    /// Block id used for the next generated frame
    next_block_id: u16,
}

impl Default for PacketGenerator {
    fn default() -> Self {
        // Jumbo frame (9014) minus IP/UDP/GVSP headers
        Self::new(8964)
    }
}

impl PacketGenerator {
    /// Create a new packet generator with specified max payload size
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            max_payload_size: max_payload_size.max(1),
            next_block_id: 1,
        }
    }

    /// Block id the next call to [`frame_datagrams`](Self::frame_datagrams) will use
    pub fn next_block_id(&self) -> u16 {
        self.next_block_id
    }

    /// Build a 20-byte leader datagram carrying `timestamp`
    pub fn leader(block_id: u16, timestamp: u64) -> Vec<u8> {
        let mut datagram = Self::header(block_id, PacketFormat::Leader, 0, 0).to_vec();
        datagram.resize(LEADER_MIN_LEN, 0);
        datagram[LEADER_TIMESTAMP_OFFSET..LEADER_MIN_LEN].copy_from_slice(&timestamp.to_be_bytes());
        datagram
    }

    /// Build a leader datagram that ends before the timestamp
    pub fn truncated_leader(block_id: u16) -> Vec<u8> {
        let mut datagram = Self::header(block_id, PacketFormat::Leader, 0, 0).to_vec();
        datagram.extend_from_slice(&[0, 0, 0, 0]);
        datagram
    }

    /// Build a payload datagram
    pub fn payload(block_id: u16, packet_id: u32, data: &[u8]) -> Vec<u8> {
        let mut datagram = Self::header(block_id, PacketFormat::Payload, packet_id, 0).to_vec();
        datagram.extend_from_slice(data);
        datagram
    }

    /// Build a trailer datagram
    pub fn trailer(block_id: u16, packet_id: u32) -> Vec<u8> {
        Self::header(block_id, PacketFormat::Trailer, packet_id, 0).to_vec()
    }

    /// Build an error-format datagram with a status code
    pub fn error_packet(block_id: u16, status: u16) -> Vec<u8> {
        Self::header(block_id, PacketFormat::Error, 0, status).to_vec()
    }

    fn header(block_id: u16, format: PacketFormat, packet_id: u32, status: u16) -> [u8; 8] {
        PacketHeader {
            status,
            block_id,
            format,
            packet_id,
        }
        .encode()
    }

    /// Packetize a frame: leader, payloads in order, trailer
    ///
    /// The leader uses packet id 0, payloads 1..=n and the trailer n+1.
    /// Block ids advance per frame and skip 0 on wrap.
    pub fn frame_datagrams(&mut self, frame_data: &[u8], timestamp: u64) -> Vec<Vec<u8>> {
        let block_id = self.next_block_id;
        self.next_block_id = self.next_block_id.checked_add(1).unwrap_or(1);

        let mut datagrams = vec![Self::leader(block_id, timestamp)];
        let mut packet_id = 1u32;
        for chunk in frame_data.chunks(self.max_payload_size) {
            datagrams.push(Self::payload(block_id, packet_id, chunk));
            packet_id += 1;
        }
        datagrams.push(Self::trailer(block_id, packet_id));

        datagrams
    }

    /// Reverse the payload datagrams, keeping leader first and trailer last
    pub fn reverse_payloads(mut datagrams: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let len = datagrams.len();
        if len > 2 {
            datagrams[1..len - 1].reverse();
        }
        datagrams
    }

    /// Send odd-indexed payloads first, then even-indexed ones
    pub fn interleave_payloads(datagrams: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let len = datagrams.len();
        if len <= 3 {
            return datagrams;
        }

        let mut iter = datagrams.into_iter();
        let leader = iter.next();
        let mut body: Vec<Vec<u8>> = iter.collect();
        let trailer = body.pop();

        let (odd, even): (Vec<_>, Vec<_>) = body
            .into_iter()
            .enumerate()
            .partition(|(i, _)| i % 2 == 1);

        leader
            .into_iter()
            .chain(odd.into_iter().map(|(_, d)| d))
            .chain(even.into_iter().map(|(_, d)| d))
            .chain(trailer)
            .collect()
    }

    /// Generate a Mono8 horizontal gradient (dark left, bright right)
    pub fn mono8_gradient(width: u32, height: u32) -> Vec<u8> {
        let mut frame = Vec::with_capacity((width * height) as usize);
        for _y in 0..height {
            for x in 0..width {
                let value = (x * 255 / width.saturating_sub(1).max(1)) as u8;
                frame.push(value);
            }
        }
        frame
    }

    /// Generate a Mono8 frame filled with the luma of `color`
    pub fn mono8_solid(width: u32, height: u32, color: Rgb) -> Vec<u8> {
        vec![color.to_gray(); (width * height) as usize]
    }

    /// Generate an RGB8 frame filled with `color`
    pub fn rgb8_solid(width: u32, height: u32, color: Rgb) -> Vec<u8> {
        let mut frame = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..(width * height) {
            frame.extend_from_slice(&[color.r, color.g, color.b]);
        }
        frame
    }

    /// Generate RGB8 vertical color bars (white, red, green, blue, black)
    pub fn rgb8_color_bars(width: u32, height: u32) -> Vec<u8> {
        const BARS: [Rgb; 5] = [Rgb::WHITE, Rgb::RED, Rgb::GREEN, Rgb::BLUE, Rgb::BLACK];
        let bar_width = (width / BARS.len() as u32).max(1);

        let mut frame = Vec::with_capacity((width * height * 3) as usize);
        for _y in 0..height {
            for x in 0..width {
                let color = BARS[((x / bar_width) as usize).min(BARS.len() - 1)];
                frame.extend_from_slice(&[color.r, color.g, color.b]);
            }
        }
        frame
    }
}
