//! Raw datagram capture
//!
//! A [`DatagramRecorder`] streams every datagram it is handed straight into a
//! record file, so a long capture costs disk space rather than memory. The
//! receive thread records datagrams and the assembly thread counts frames;
//! both share one recorder behind an `Arc`.
//!
//! # File Format
//!
//! - `capture_<unix secs>.bin`: sequence of
//!   `[u64 LE: timestamp_us][u32 LE: length][data bytes]...`
//!   where the timestamp is relative to the start of the capture
//! - `capture_<unix secs>.json`: [`CaptureMetadata`], written by
//!   [`DatagramRecorder::finish`]
//!
//! Captures are read back with [`read_capture`] and replayed through the
//! assembler with [`crate::replay`].

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest datagram accepted when reading a capture back
pub const MAX_CAPTURED_DATAGRAM: usize = 64 * 1024;

/// Bytes of framing in front of every datagram
const RECORD_HEADER_LEN: u64 = 8 + 4;

/// Errors raised while writing or reading captures.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The recorder was already finished, or closed after a write failure.
    #[error("capture is closed")]
    Closed,

    /// Failed to acquire lock on the recorder.
    #[error("failed to acquire lock: {0}")]
    LockError(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory does not exist.
    #[error("output directory does not exist: {0}")]
    DirectoryNotFound(String),

    /// Capture file contents are not valid.
    #[error("invalid capture data at offset {offset}: {message}")]
    InvalidData {
        /// Byte offset in the capture file where the error occurred.
        offset: u64,
        /// Description of the error.
        message: String,
    },
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Metadata about the capture session and stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Address the datagrams were received on.
    #[serde(default)]
    pub source: String,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Total number of datagrams written.
    #[serde(default)]
    pub total_datagrams: u64,
    /// Datagrams dropped because the size limit was reached.
    #[serde(default)]
    pub skipped_datagrams: u64,
    /// Total number of frames assembled while capturing.
    #[serde(default)]
    pub total_frames: u64,
    /// Capture duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Total datagram bytes written.
    #[serde(default)]
    pub total_bytes: u64,
    /// Optional description or notes about the capture.
    #[serde(default)]
    pub description: String,
}

/// Paths and summary of a finished capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Path to the datagram file.
    pub datagrams_path: PathBuf,
    /// Path to the metadata sidecar.
    pub metadata_path: PathBuf,
    /// Summary of the capture session.
    pub metadata: CaptureMetadata,
}

/// A single captured datagram with its arrival time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedDatagram {
    /// Time since capture start (microseconds).
    pub timestamp_us: u64,
    /// Raw datagram bytes.
    pub data: Vec<u8>,
}

/// Whether a datagram made it into the capture file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Written to the file
    Written,
    /// Dropped; the file reached its size limit
    LimitReached,
}

#[derive(Debug)]
struct RecorderInner {
    /// `None` once finished or after a write failure
    writer: Option<BufWriter<File>>,
    file_bytes: u64,
    metadata: CaptureMetadata,
}

/// Streams raw datagrams into a capture file
///
/// Records are written through a `BufWriter` as they arrive; nothing is held
/// in memory beyond the write buffer. Once the file would grow past the
/// configured limit, further datagrams are counted but not written.
#[derive(Debug)]
pub struct DatagramRecorder {
    datagrams_path: PathBuf,
    started: Instant,
    max_bytes: Option<u64>,
    inner: Mutex<RecorderInner>,
}

impl DatagramRecorder {
    /// Create `capture_<unix secs>.bin` in `dir` and start the capture clock
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::DirectoryNotFound` if `dir` does not exist and
    /// `CaptureError::Io` if the file cannot be created.
    pub fn create(dir: &Path, metadata: CaptureMetadata) -> Result<Self> {
        if !dir.is_dir() {
            return Err(CaptureError::DirectoryNotFound(dir.display().to_string()));
        }

        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let datagrams_path = dir.join(format!("capture_{}.bin", secs));
        let writer = BufWriter::new(File::create(&datagrams_path)?);

        log::info!("Capturing datagrams to {}", datagrams_path.display());
        Ok(Self {
            datagrams_path,
            started: Instant::now(),
            max_bytes: None,
            inner: Mutex::new(RecorderInner {
                writer: Some(writer),
                file_bytes: 0,
                metadata: CaptureMetadata {
                    total_datagrams: 0,
                    skipped_datagrams: 0,
                    total_frames: 0,
                    duration_ms: 0,
                    total_bytes: 0,
                    ..metadata
                },
            }),
        })
    }

    /// Cap the datagram file at `max_bytes`, framing included (0 = unbounded)
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = (max_bytes > 0).then_some(max_bytes);
        self
    }

    /// Path of the datagram file being written
    pub fn path(&self) -> &Path {
        &self.datagrams_path
    }

    /// Append one datagram, stamped with the time since the capture started
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Closed` after [`finish`](Self::finish) or a
    /// previous write failure, and `CaptureError::Io` if the write fails. A
    /// failed write closes the recorder.
    pub fn record_datagram(&self, datagram: &[u8]) -> Result<Recorded> {
        let timestamp_us = u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX);
        let mut inner = self.lock()?;
        let record_len = RECORD_HEADER_LEN + datagram.len() as u64;

        if self
            .max_bytes
            .is_some_and(|max| inner.file_bytes + record_len > max)
        {
            if inner.writer.is_none() {
                return Err(CaptureError::Closed);
            }
            if inner.metadata.skipped_datagrams == 0 {
                log::warn!(
                    "Capture reached {} bytes, further datagrams are not recorded",
                    inner.file_bytes
                );
            }
            inner.metadata.skipped_datagrams += 1;
            return Ok(Recorded::LimitReached);
        }

        let writer = inner.writer.as_mut().ok_or(CaptureError::Closed)?;
        if let Err(e) = write_record(writer, timestamp_us, datagram) {
            inner.writer = None;
            return Err(e.into());
        }

        inner.file_bytes += record_len;
        inner.metadata.total_datagrams += 1;
        inner.metadata.total_bytes += datagram.len() as u64;
        Ok(Recorded::Written)
    }

    /// Count a frame assembled while capturing
    pub fn record_frame(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.metadata.total_frames += 1;
        }
    }

    /// Datagrams written so far
    pub fn datagram_count(&self) -> u64 {
        self.inner
            .lock()
            .map(|inner| inner.metadata.total_datagrams)
            .unwrap_or(0)
    }

    /// Flush the datagram file and write the metadata sidecar
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Closed` if the recorder is already finished,
    /// otherwise `CaptureError::Io` or `CaptureError::Json` on write failure.
    pub fn finish(&self) -> Result<CaptureResult> {
        let mut inner = self.lock()?;
        let mut writer = inner.writer.take().ok_or(CaptureError::Closed)?;
        writer.flush()?;

        inner.metadata.duration_ms =
            u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let metadata = inner.metadata.clone();

        let metadata_path = self.datagrams_path.with_extension("json");
        write_metadata(&metadata_path, &metadata)?;

        log::info!(
            "Capture finished: {} datagrams, {} bytes, {} skipped, {} ms",
            metadata.total_datagrams,
            metadata.total_bytes,
            metadata.skipped_datagrams,
            metadata.duration_ms
        );

        Ok(CaptureResult {
            datagrams_path: self.datagrams_path.clone(),
            metadata_path,
            metadata,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RecorderInner>> {
        self.inner
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))
    }
}

fn write_record<W: Write>(writer: &mut W, timestamp_us: u64, data: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} byte datagram does not fit a record", data.len()),
        )
    })?;
    writer.write_all(&timestamp_us.to_le_bytes())?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(data)
}

/// Writes a complete capture file from datagrams already in memory.
///
/// # Errors
///
/// Returns `CaptureError::Io` if file operations fail.
pub fn write_capture(path: &Path, datagrams: &[CapturedDatagram]) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    for datagram in datagrams {
        write_record(&mut file, datagram.timestamp_us, &datagram.data)?;
    }
    file.flush()?;
    log::debug!("Saved {} datagrams to {}", datagrams.len(), path.display());
    Ok(())
}

/// Writes capture metadata to a JSON file.
///
/// # Errors
///
/// Returns `CaptureError::Io` or `CaptureError::Json` on failure.
pub fn write_metadata(path: &Path, metadata: &CaptureMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(path, json)?;
    log::debug!("Saved metadata to {}", path.display());
    Ok(())
}

/// Reads datagrams from a capture file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be opened.
/// Returns `CaptureError::InvalidData` if a record is truncated or oversized.
pub fn read_capture(path: &Path) -> Result<Vec<CapturedDatagram>> {
    let mut file = BufReader::new(File::open(path)?);
    let mut datagrams = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut timestamp_bytes = [0u8; 8];
        match file.read_exact(&mut timestamp_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CaptureError::Io(e)),
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)
            .map_err(|_| CaptureError::InvalidData {
                offset,
                message: "unexpected EOF reading datagram length".to_string(),
            })?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_CAPTURED_DATAGRAM {
            return Err(CaptureError::InvalidData {
                offset,
                message: format!(
                    "datagram length {} exceeds {} byte limit",
                    len, MAX_CAPTURED_DATAGRAM
                ),
            });
        }

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)
            .map_err(|_| CaptureError::InvalidData {
                offset,
                message: format!("unexpected EOF reading {} bytes of data", len),
            })?;

        datagrams.push(CapturedDatagram {
            timestamp_us: u64::from_le_bytes(timestamp_bytes),
            data,
        });
        offset += RECORD_HEADER_LEN + len as u64;
    }

    Ok(datagrams)
}

/// Reads capture metadata from a JSON file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read.
/// Returns `CaptureError::Json` if the JSON is invalid.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let json = std::fs::read_to_string(path)?;
    let metadata: CaptureMetadata = serde_json::from_str(&json)?;
    Ok(metadata)
}
