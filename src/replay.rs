//! Datagram replay for testing without a camera on the network.
//!
//! This module replays captured GVSP datagrams from binary files written by
//! [`crate::capture`], either through the full receive pipeline as a
//! [`DatagramSource`] or synchronously through a [`FrameAssembler`].
//!
//! # File Format
//!
//! ```text
//! [u64 LE: timestamp_us][u32 LE: length][data bytes]...
//! ```
//!
//! A companion `.json` file with the same stem holds the
//! [`CaptureMetadata`], including the frame geometry.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use gvsp_receiver_lib::replay::{ReplayConfig, ReplaySource};
//!
//! let source = ReplaySource::load_with_config(
//!     Path::new("capture_12345.bin"),
//!     ReplayConfig { speed: 2.0, ..Default::default() },
//! )?;
//! let pipeline = Pipeline::start(source, sink, &config, None);
//! ```

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::capture::{
    read_capture, read_metadata, CaptureError, CaptureMetadata, CapturedDatagram,
};
use crate::frame_assembler::{AssemblerStats, DuplicatePolicy, FrameAssembler, ProcessResult};
use crate::frame_validation::FrameGeometry;
use crate::reassembly::AssembledFrame;
use crate::receiver::{DatagramSource, Receive};

/// Longest single wait before control returns to the caller
const PACING_CHUNK: Duration = Duration::from_millis(10);

/// Errors that can occur during replay operations.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// File not found or cannot be read.
    #[error("failed to read capture: {0}")]
    Io(#[from] io::Error),

    /// Invalid or corrupted datagram record in the capture file.
    #[error("invalid datagram data at offset {offset}: {message}")]
    InvalidDatagram {
        /// Byte offset in the capture file where the error occurred.
        offset: u64,
        /// Description of the error.
        message: String,
    },

    /// Metadata file is missing or invalid.
    #[error("metadata error: {0}")]
    Metadata(String),
}

impl From<CaptureError> for ReplayError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::Io(e) => Self::Io(e),
            CaptureError::InvalidData { offset, message } => {
                Self::InvalidDatagram { offset, message }
            }
            other => Self::Metadata(other.to_string()),
        }
    }
}

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Configuration for datagram replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayConfig {
    /// Playback speed multiplier (1.0 = realtime, 2.0 = 2x speed, 0.0 = as fast as possible).
    pub speed: f64,
    /// Whether to loop the replay when reaching the end.
    pub loop_playback: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            loop_playback: false,
        }
    }
}

/// Replays captured datagrams as a [`DatagramSource`].
///
/// With a non-zero speed, datagrams are released at their captured offsets
/// scaled by the speed. While waiting, `receive` returns
/// [`Receive::TimedOut`] at least every 10 ms so a pipeline can observe a
/// stop request.
#[derive(Debug)]
pub struct ReplaySource {
    /// Loaded datagrams ready for replay.
    datagrams: Vec<CapturedDatagram>,
    /// Optional metadata from the capture session.
    metadata: Option<CaptureMetadata>,
    /// Replay configuration.
    config: ReplayConfig,
    /// Index of the next datagram to deliver.
    position: usize,
    /// When the current pass started.
    pass_start: Option<Instant>,
    /// Completed passes (looping only).
    passes: u64,
}

impl ReplaySource {
    /// Load captured datagrams from a binary file.
    ///
    /// Metadata is loaded from the companion `.json` file when present.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Io` if the file cannot be read and
    /// `ReplayError::InvalidDatagram` if it is truncated or corrupt.
    pub fn load(path: &Path) -> Result<Self> {
        let datagrams = read_capture(path)?;
        let metadata = try_load_metadata(path);

        log::info!(
            "Loaded {} datagrams from {} (metadata: {})",
            datagrams.len(),
            path.display(),
            if metadata.is_some() { "yes" } else { "no" }
        );

        Ok(Self::from_datagrams(datagrams, metadata))
    }

    /// Load captured datagrams with a custom replay configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or contains invalid data.
    pub fn load_with_config(path: &Path, config: ReplayConfig) -> Result<Self> {
        let mut source = Self::load(path)?;
        source.config = config;
        Ok(source)
    }

    /// Replay datagrams already in memory.
    pub fn from_datagrams(
        datagrams: Vec<CapturedDatagram>,
        metadata: Option<CaptureMetadata>,
    ) -> Self {
        Self {
            datagrams,
            metadata,
            config: ReplayConfig::default(),
            position: 0,
            pass_start: None,
            passes: 0,
        }
    }

    /// Get the loaded metadata, if available.
    #[must_use]
    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    /// Frame geometry recorded in the metadata, if any.
    #[must_use]
    pub fn geometry(&self) -> Option<FrameGeometry> {
        self.metadata.as_ref().and_then(metadata_geometry)
    }

    /// Get the number of loaded datagrams.
    #[must_use]
    pub fn datagram_count(&self) -> usize {
        self.datagrams.len()
    }

    /// Get the total duration of the capture in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.datagrams
            .last()
            .map(|d| d.timestamp_us / 1000)
            .unwrap_or(0)
    }

    /// Set the replay configuration.
    pub fn set_config(&mut self, config: ReplayConfig) {
        self.config = config;
    }

    /// Completed passes over the capture.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Time left before a datagram stamped `timestamp_us` is due, or `None` if it is due now.
    fn pacing_delay(&mut self, timestamp_us: u64) -> Option<Duration> {
        if self.config.speed <= 0.0 {
            return None;
        }

        let start = *self.pass_start.get_or_insert_with(Instant::now);
        let due = Duration::from_micros((timestamp_us as f64 / self.config.speed) as u64);
        let elapsed = start.elapsed();
        (due > elapsed).then(|| due - elapsed)
    }
}

impl DatagramSource for ReplaySource {
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<Receive> {
        if self.position >= self.datagrams.len() {
            if self.config.loop_playback && !self.datagrams.is_empty() {
                self.passes += 1;
                self.position = 0;
                self.pass_start = None;
                log::debug!("Replay pass {} completed, restarting", self.passes);
            } else {
                log::debug!("Replay completed");
                return Ok(Receive::Exhausted);
            }
        }

        let timestamp_us = self.datagrams[self.position].timestamp_us;
        if let Some(delay) = self.pacing_delay(timestamp_us) {
            std::thread::sleep(delay.min(PACING_CHUNK));
            if delay > PACING_CHUNK {
                return Ok(Receive::TimedOut);
            }
        }

        let data = &self.datagrams[self.position].data;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        self.position += 1;
        Ok(Receive::Datagram(len))
    }
}

/// Try to load metadata from a companion JSON file.
///
/// Looks for a file with the same base name but `.json` extension.
fn try_load_metadata(path: &Path) -> Option<CaptureMetadata> {
    let json_path = path.with_extension("json");
    if !json_path.exists() {
        return None;
    }

    match read_metadata(&json_path) {
        Ok(meta) => Some(meta),
        Err(e) => {
            log::warn!("Ignoring metadata {}: {}", json_path.display(), e);
            None
        }
    }
}

fn metadata_geometry(meta: &CaptureMetadata) -> Option<FrameGeometry> {
    (meta.width > 0 && meta.height > 0).then(|| FrameGeometry::new(meta.width, meta.height))
}

/// Pick the explicit geometry, else the one recorded in the metadata.
fn resolve_geometry(
    geometry: Option<FrameGeometry>,
    metadata: Option<&CaptureMetadata>,
) -> Result<FrameGeometry> {
    geometry
        .or_else(|| metadata.and_then(metadata_geometry))
        .ok_or_else(|| {
            ReplayError::Metadata("frame geometry not given and not found in metadata".to_string())
        })
}

/// Synchronous replay for simple use cases.
///
/// Replays all datagrams without timing and returns all assembled frames.
///
/// # Arguments
///
/// * `path` - Path to the binary capture file.
/// * `geometry` - Frame geometry; `None` reads it from the companion metadata.
///
/// # Errors
///
/// Returns `ReplayError` if the file cannot be loaded, contains invalid
/// data, or no geometry is available.
///
/// # Example
///
/// ```rust,ignore
/// let frames = replay_all_frames(Path::new("capture.bin"), None)?;
/// println!("Replayed {} frames", frames.len());
/// ```
pub fn replay_all_frames(
    path: &Path,
    geometry: Option<FrameGeometry>,
) -> Result<Vec<AssembledFrame>> {
    Ok(FrameIterator::new(path, geometry)?.collect())
}

/// Replay datagrams and return frames via an iterator.
///
/// This is a lazy iterator that processes datagrams on demand.
pub struct FrameIterator {
    datagrams: std::vec::IntoIter<CapturedDatagram>,
    assembler: FrameAssembler,
}

impl FrameIterator {
    /// Create a new frame iterator from a capture file.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError` if the file cannot be loaded or no geometry is
    /// available.
    pub fn new(path: &Path, geometry: Option<FrameGeometry>) -> Result<Self> {
        Self::with_policy(path, geometry, DuplicatePolicy::default())
    }

    /// Create with an explicit duplicate packet policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, contains invalid
    /// datagram data, or no geometry is available.
    pub fn with_policy(
        path: &Path,
        geometry: Option<FrameGeometry>,
        policy: DuplicatePolicy,
    ) -> Result<Self> {
        let datagrams = read_capture(path)?;
        let metadata = try_load_metadata(path);
        let geometry = resolve_geometry(geometry, metadata.as_ref())?;

        Ok(Self {
            datagrams: datagrams.into_iter(),
            assembler: FrameAssembler::new(geometry, policy),
        })
    }

    /// Assembler counters so far.
    #[must_use]
    pub fn stats(&self) -> &AssemblerStats {
        self.assembler.stats()
    }
}

impl Iterator for FrameIterator {
    type Item = AssembledFrame;

    fn next(&mut self) -> Option<Self::Item> {
        for datagram in self.datagrams.by_ref() {
            if let ProcessResult::Frame(frame) = self.assembler.process_datagram(&datagram.data) {
                return Some(frame);
            }
        }
        None
    }
}
