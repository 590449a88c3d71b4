//! Frame sinks
//!
//! A sink consumes finished frames. Sink failures are reported by the caller
//! and never stop reassembly of the next frame.
//!
//! # Segment File Format
//!
//! [`SegmentRecorder`] writes raw frames into time-bounded segment files:
//! ```text
//! [u64 LE: start_timestamp][u64 LE: completed_us][u8: pixel format][u32 LE: length][data bytes]...
//! ```
//! A frame whose leader carried no timestamp is written with timestamp 0.
//! Each closed segment gets a `.json` sidecar with [`SegmentMetadata`].

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame_validation::PixelFormat;
use crate::reassembly::AssembledFrame;

/// Extension of segment data files
pub const SEGMENT_EXTENSION: &str = "gvraw";

/// Largest frame accepted when reading a segment back (an 8K RGB8 frame fits)
pub const MAX_SEGMENT_FRAME: usize = 128 * 1024 * 1024;

/// Bytes in front of every frame record
const SEGMENT_RECORD_HEADER_LEN: u64 = 8 + 8 + 1 + 4;

/// Errors raised by frame sinks.
#[derive(Error, Debug)]
pub enum SinkError {
    /// I/O error while writing or reading frames.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Segment file contents are not valid.
    #[error("corrupt segment at offset {offset}: {message}")]
    Corrupt {
        /// Byte offset where the problem was found.
        offset: u64,
        /// Description of the problem.
        message: String,
    },

    /// Sink refused the frame.
    #[error("frame rejected: {0}")]
    Rejected(String),
}

/// Result type alias for sink operations.
pub type Result<T> = std::result::Result<T, SinkError>;

/// Consumer of finished frames
pub trait FrameSink: Send {
    /// Take ownership of a finished frame
    ///
    /// # Errors
    ///
    /// Returns a `SinkError` if the frame could not be consumed.
    fn accept(&mut self, frame: AssembledFrame) -> Result<()>;

    /// Flush and close any open output
    ///
    /// # Errors
    ///
    /// Returns a `SinkError` if buffered output could not be written.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    fn accept(&mut self, frame: AssembledFrame) -> Result<()> {
        (**self).accept(frame)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Format a capture timestamp the way it is overlaid on displayed frames
pub fn overlay_timestamp(start_timestamp: Option<u64>) -> String {
    match start_timestamp {
        Some(ts) => format!("{:.3}", ts as f64 / 1000.0),
        None => "-".to_string(),
    }
}

// =============================================================================
// Logging Sink
// =============================================================================

/// Reports every frame through the `log` facade
#[derive(Debug, Default)]
pub struct LoggingSink {
    frames: u64,
    report_every: u64,
}

impl LoggingSink {
    /// Create a sink that logs a summary every `report_every` frames
    pub fn new(report_every: u64) -> Self {
        Self {
            frames: 0,
            report_every: report_every.max(1),
        }
    }

    /// Frames seen so far
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl FrameSink for LoggingSink {
    fn accept(&mut self, frame: AssembledFrame) -> Result<()> {
        self.frames += 1;
        log::debug!(
            "Frame {} [{}] {}x{} {} ({} bytes, {} packets)",
            frame.block_id,
            overlay_timestamp(frame.start_timestamp),
            frame.width,
            frame.height,
            frame.pixel_format.name(),
            frame.data.len(),
            frame.packet_count
        );
        if self.frames % self.report_every.max(1) == 0 {
            log::info!(
                "{} frames received, latest block {} at {}",
                self.frames,
                frame.block_id,
                overlay_timestamp(frame.start_timestamp)
            );
        }
        Ok(())
    }
}

// =============================================================================
// Segment Recorder
// =============================================================================

/// Summary written next to each closed segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    /// Block id of the first frame in the segment.
    pub first_block_id: u16,
    /// Block id of the last frame in the segment.
    pub last_block_id: u16,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Number of frames in the segment.
    pub total_frames: u64,
    /// Number of Mono8 frames.
    #[serde(default)]
    pub mono8_frames: u64,
    /// Number of RGB8 frames.
    #[serde(default)]
    pub rgb8_frames: u64,
    /// Total pixel bytes written.
    #[serde(default)]
    pub total_bytes: u64,
    /// Capture timestamp of the first frame.
    pub first_start_timestamp: Option<u64>,
    /// Capture timestamp of the last frame.
    pub last_start_timestamp: Option<u64>,
    /// Completion time of the first frame (µs since the Unix epoch).
    pub first_completed_us: u64,
    /// Completion time of the last frame (µs since the Unix epoch).
    pub last_completed_us: u64,
}

/// One frame read back from a segment file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    /// Capture timestamp (0 if the leader carried none)
    pub start_timestamp: u64,
    /// Completion time, µs since the Unix epoch
    pub completed_at_us: u64,
    /// Inferred pixel format
    pub pixel_format: PixelFormat,
    /// Pixel bytes
    pub data: Vec<u8>,
}

struct OpenSegment {
    path: PathBuf,
    writer: BufWriter<File>,
    opened_at: Instant,
    metadata: SegmentMetadata,
}

/// Records frames into time-bounded segment files
///
/// A segment opens on the first frame after the previous one closed and is
/// named `{block_id:03}_{start_timestamp}_{completed_us}.gvraw` after that
/// frame. It closes once the segment duration has elapsed since it opened.
pub struct SegmentRecorder {
    output_dir: PathBuf,
    segment_duration: Duration,
    current: Option<OpenSegment>,
    closed: Vec<PathBuf>,
}

impl SegmentRecorder {
    /// Create a recorder writing into `output_dir`
    ///
    /// The directory is created when the first segment opens.
    pub fn new(output_dir: impl Into<PathBuf>, segment_duration: Duration) -> Self {
        Self {
            output_dir: output_dir.into(),
            segment_duration,
            current: None,
            closed: Vec::new(),
        }
    }

    /// Paths of segments closed so far
    pub fn closed_segments(&self) -> &[PathBuf] {
        &self.closed
    }

    /// Path of the segment currently open
    pub fn current_segment(&self) -> Option<&Path> {
        self.current.as_ref().map(|s| s.path.as_path())
    }

    fn open_segment(&mut self, frame: &AssembledFrame) -> Result<OpenSegment> {
        std::fs::create_dir_all(&self.output_dir)?;

        let stem = format!(
            "{:03}_{}_{}",
            frame.block_id,
            frame.start_timestamp.unwrap_or(0),
            frame.completed_at_us
        );
        let mut path = self.output_dir.join(format!("{}.{}", stem, SEGMENT_EXTENSION));
        let mut suffix = 1;
        while path.exists() {
            path = self
                .output_dir
                .join(format!("{}_{}.{}", stem, suffix, SEGMENT_EXTENSION));
            suffix += 1;
        }

        let file = File::create(&path)?;
        log::info!("Opened segment: {}", path.display());

        Ok(OpenSegment {
            path,
            writer: BufWriter::new(file),
            opened_at: Instant::now(),
            metadata: SegmentMetadata {
                first_block_id: frame.block_id,
                width: frame.width,
                height: frame.height,
                first_start_timestamp: frame.start_timestamp,
                first_completed_us: frame.completed_at_us,
                ..Default::default()
            },
        })
    }

    fn close_segment(&mut self) -> Result<()> {
        let Some(mut segment) = self.current.take() else {
            return Ok(());
        };

        segment.writer.flush()?;
        let json = serde_json::to_string_pretty(&segment.metadata)?;
        std::fs::write(segment.path.with_extension("json"), json)?;

        log::info!(
            "Closing segment: {} ({} frames, {} bytes)",
            segment.path.display(),
            segment.metadata.total_frames,
            segment.metadata.total_bytes
        );
        self.closed.push(segment.path);
        Ok(())
    }
}

impl FrameSink for SegmentRecorder {
    fn accept(&mut self, frame: AssembledFrame) -> Result<()> {
        if self.current.is_none() {
            self.current = Some(self.open_segment(&frame)?);
        }

        if let Some(segment) = self.current.as_mut() {
            write_record(&mut segment.writer, &frame)?;

            let meta = &mut segment.metadata;
            meta.last_block_id = frame.block_id;
            meta.last_start_timestamp = frame.start_timestamp;
            meta.last_completed_us = frame.completed_at_us;
            meta.total_frames += 1;
            meta.total_bytes += frame.data.len() as u64;
            match frame.pixel_format {
                PixelFormat::Mono8 => meta.mono8_frames += 1,
                PixelFormat::Rgb8 => meta.rgb8_frames += 1,
            }

            if segment.opened_at.elapsed() >= self.segment_duration {
                self.close_segment()?;
            }
        }

        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.close_segment()
    }
}

impl Drop for SegmentRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.close_segment() {
            log::warn!("Failed to close segment on drop: {}", e);
        }
    }
}

fn write_record<W: Write>(writer: &mut W, frame: &AssembledFrame) -> Result<()> {
    let len = u32::try_from(frame.data.len())
        .map_err(|_| SinkError::Rejected(format!("frame of {} bytes", frame.data.len())))?;

    writer.write_all(&frame.start_timestamp.unwrap_or(0).to_le_bytes())?;
    writer.write_all(&frame.completed_at_us.to_le_bytes())?;
    writer.write_all(&[frame.pixel_format.to_tag()])?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&frame.data)?;
    Ok(())
}

/// Read all frames back from a segment file
///
/// # Errors
///
/// Returns `SinkError::Io` if the file cannot be read and
/// `SinkError::Corrupt` if a record is truncated or has an unknown format tag.
pub fn read_segment(path: &Path) -> Result<Vec<SegmentRecord>> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut file = std::io::BufReader::new(file);
    let mut records = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut timestamp_bytes = [0u8; 8];
        match file.read_exact(&mut timestamp_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(SinkError::Io(e)),
        }

        let mut rest = [0u8; 8 + 1 + 4];
        file.read_exact(&mut rest).map_err(|_| SinkError::Corrupt {
            offset,
            message: "unexpected EOF reading record header".to_string(),
        })?;

        let completed_at_us = u64::from_le_bytes(rest[0..8].try_into().unwrap_or_default());
        let pixel_format = PixelFormat::from_tag(rest[8]).ok_or(SinkError::Corrupt {
            offset,
            message: format!("unknown pixel format tag {}", rest[8]),
        })?;
        let len = u32::from_le_bytes(rest[9..13].try_into().unwrap_or_default()) as usize;

        let remaining = file_len.saturating_sub(offset + SEGMENT_RECORD_HEADER_LEN);
        if len > MAX_SEGMENT_FRAME || len as u64 > remaining {
            return Err(SinkError::Corrupt {
                offset,
                message: format!(
                    "frame length {} exceeds {} remaining bytes or the {} byte limit",
                    len, remaining, MAX_SEGMENT_FRAME
                ),
            });
        }

        let mut data = vec![0u8; len];
        file.read_exact(&mut data).map_err(|_| SinkError::Corrupt {
            offset,
            message: format!("unexpected EOF reading {} bytes of data", len),
        })?;

        records.push(SegmentRecord {
            start_timestamp: u64::from_le_bytes(timestamp_bytes),
            completed_at_us,
            pixel_format,
            data,
        });
        offset += SEGMENT_RECORD_HEADER_LEN + len as u64;
    }

    Ok(records)
}

/// Reads segment metadata from its JSON sidecar.
///
/// # Errors
///
/// Returns `SinkError::Io` if the file cannot be read.
/// Returns `SinkError::Json` if the JSON is invalid.
pub fn read_segment_metadata(path: &Path) -> Result<SegmentMetadata> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

// =============================================================================
// Multi Sink
// =============================================================================

/// Forwards every frame to several sinks
///
/// A failing member is logged and the remaining members still receive the
/// frame; the first error is returned afterwards.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn FrameSink>>,
}

impl MultiSink {
    /// Create an empty fan-out
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn push(&mut self, sink: Box<dyn FrameSink>) {
        self.sinks.push(sink);
    }

    /// Number of member sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether there are no member sinks
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl FrameSink for MultiSink {
    fn accept(&mut self, frame: AssembledFrame) -> Result<()> {
        let mut first_error = None;
        let last = self.sinks.len().saturating_sub(1);
        let mut frame = Some(frame);

        for (i, sink) in self.sinks.iter_mut().enumerate() {
            let item = if i == last {
                frame.take()
            } else {
                frame.clone()
            };
            let Some(item) = item else { break };

            if let Err(e) = sink.accept(item) {
                log::warn!("Sink {} failed: {}", i, e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn finish(&mut self) -> Result<()> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.finish() {
                log::warn!("Sink finish failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn frame(block_id: u16, format: PixelFormat, fill: u8) -> AssembledFrame {
        AssembledFrame {
            block_id,
            data: vec![fill; 8 * format.channels()],
            pixel_format: format,
            width: 4,
            height: 2,
            start_timestamp: Some(1000 + block_id as u64),
            completed_at_us: 5_000_000 + block_id as u64,
            packet_count: 1,
        }
    }

    /// Records block ids, optionally failing every frame
    struct Recording {
        seen: Arc<Mutex<Vec<u16>>>,
        fail: bool,
    }

    impl FrameSink for Recording {
        fn accept(&mut self, frame: AssembledFrame) -> Result<()> {
            self.seen.lock().unwrap().push(frame.block_id);
            if self.fail {
                return Err(SinkError::Rejected("test".to_string()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_overlay_timestamp() {
        assert_eq!(overlay_timestamp(Some(1000)), "1.000");
        assert_eq!(overlay_timestamp(Some(123_456)), "123.456");
        assert_eq!(overlay_timestamp(None), "-");
    }

    #[test]
    fn test_logging_sink_counts_frames() {
        let mut sink = LoggingSink::new(2);
        sink.accept(frame(1, PixelFormat::Mono8, 0)).unwrap();
        sink.accept(frame(2, PixelFormat::Rgb8, 0)).unwrap();
        assert_eq!(sink.frames(), 2);
    }

    #[test]
    fn test_segment_recorder_single_segment() {
        let dir = tempdir().unwrap();
        let mut recorder = SegmentRecorder::new(dir.path(), Duration::from_secs(300));

        recorder.accept(frame(1, PixelFormat::Mono8, 0x11)).unwrap();
        recorder.accept(frame(2, PixelFormat::Rgb8, 0x22)).unwrap();
        assert!(recorder.closed_segments().is_empty());
        let open = recorder.current_segment().unwrap().to_path_buf();
        assert_eq!(
            open.file_name().unwrap().to_str().unwrap(),
            "001_1001_5000001.gvraw"
        );

        recorder.finish().unwrap();
        assert_eq!(recorder.closed_segments(), &[open.clone()]);

        let records = read_segment(&open).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].start_timestamp, 1001);
        assert_eq!(records[0].pixel_format, PixelFormat::Mono8);
        assert_eq!(records[0].data, vec![0x11; 8]);
        assert_eq!(records[1].pixel_format, PixelFormat::Rgb8);
        assert_eq!(records[1].data, vec![0x22; 24]);
        assert_eq!(records[1].completed_at_us, 5_000_002);

        let meta = read_segment_metadata(&open.with_extension("json")).unwrap();
        assert_eq!(meta.total_frames, 2);
        assert_eq!(meta.mono8_frames, 1);
        assert_eq!(meta.rgb8_frames, 1);
        assert_eq!(meta.total_bytes, 32);
        assert_eq!(meta.first_block_id, 1);
        assert_eq!(meta.last_block_id, 2);
        assert_eq!(meta.first_start_timestamp, Some(1001));
        assert_eq!(meta.last_start_timestamp, Some(1002));
    }

    #[test]
    fn test_segment_recorder_rotates_on_duration() {
        let dir = tempdir().unwrap();
        // Zero duration closes a segment after every frame
        let mut recorder = SegmentRecorder::new(dir.path(), Duration::ZERO);

        for block_id in 1..=3 {
            recorder.accept(frame(block_id, PixelFormat::Mono8, 0)).unwrap();
        }

        assert_eq!(recorder.closed_segments().len(), 3);
        assert!(recorder.current_segment().is_none());
        for path in recorder.closed_segments() {
            assert_eq!(read_segment(path).unwrap().len(), 1);
            assert!(path.with_extension("json").exists());
        }
    }

    #[test]
    fn test_segment_recorder_closes_on_drop() {
        let dir = tempdir().unwrap();
        let path = {
            let mut recorder = SegmentRecorder::new(dir.path(), Duration::from_secs(60));
            recorder.accept(frame(7, PixelFormat::Mono8, 1)).unwrap();
            recorder.current_segment().unwrap().to_path_buf()
        };
        assert!(path.with_extension("json").exists());
        assert_eq!(read_segment(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_timestamp_written_as_zero() {
        let dir = tempdir().unwrap();
        let mut recorder = SegmentRecorder::new(dir.path(), Duration::from_secs(60));
        let mut untimed = frame(3, PixelFormat::Mono8, 9);
        untimed.start_timestamp = None;

        recorder.accept(untimed).unwrap();
        let path = recorder.current_segment().unwrap().to_path_buf();
        recorder.finish().unwrap();

        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("003_0_"));
        assert_eq!(read_segment(&path).unwrap()[0].start_timestamp, 0);
    }

    #[test]
    fn test_read_segment_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.gvraw");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.push(PixelFormat::Mono8.to_tag());
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 10]);
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_segment(&path),
            Err(SinkError::Corrupt { offset: 0, .. })
        ));
    }

    #[test]
    fn test_read_segment_rejects_oversized_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge.gvraw");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.push(PixelFormat::Rgb8.to_tag());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 64]);
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_segment(&path),
            Err(SinkError::Corrupt { offset: 0, message }) if message.contains("exceeds")
        ));
    }

    #[test]
    fn test_read_segment_unknown_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.gvraw");
        let mut bytes = vec![0u8; 16];
        bytes.push(0x7F);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(read_segment(&path), Err(SinkError::Corrupt { .. })));
    }

    #[test]
    fn test_multi_sink_continues_after_failure() {
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        let mut sink = MultiSink::new();
        sink.push(Box::new(Recording {
            seen: Arc::clone(&first),
            fail: true,
        }));
        sink.push(Box::new(Recording {
            seen: Arc::clone(&second),
            fail: false,
        }));
        assert_eq!(sink.len(), 2);

        let result = sink.accept(frame(4, PixelFormat::Mono8, 0));

        assert!(matches!(result, Err(SinkError::Rejected(_))));
        assert_eq!(*first.lock().unwrap(), vec![4]);
        assert_eq!(*second.lock().unwrap(), vec![4]);
    }

    #[test]
    fn test_empty_multi_sink_accepts() {
        let mut sink = MultiSink::new();
        assert!(sink.is_empty());
        assert!(sink.accept(frame(1, PixelFormat::Mono8, 0)).is_ok());
        assert!(sink.finish().is_ok());
    }
}
