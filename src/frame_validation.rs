//! Frame size validation and pixel format inference
//!
//! The stream does not declare the pixel format at this layer. A frame is
//! classified purely by its assembled size:
//! - `width * height` bytes is Mono8
//! - `width * height * 3` bytes is RGB8
//!
//! Any other size is rejected. The format is re-inferred for every frame.

use serde::{Deserialize, Serialize};

/// Pixel layouts a frame can be classified as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit grayscale, one byte per pixel
    Mono8,
    /// 8-bit interleaved RGB, three bytes per pixel
    Rgb8,
}

impl PixelFormat {
    /// Bytes per pixel
    pub fn channels(self) -> usize {
        match self {
            Self::Mono8 => 1,
            Self::Rgb8 => 3,
        }
    }

    /// Short name used in logs and file metadata
    pub fn name(self) -> &'static str {
        match self {
            Self::Mono8 => "mono8",
            Self::Rgb8 => "rgb8",
        }
    }

    /// Stable on-disk tag
    pub fn to_tag(self) -> u8 {
        match self {
            Self::Mono8 => 1,
            Self::Rgb8 => 3,
        }
    }

    /// Parse an on-disk tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Mono8),
            3 => Some(Self::Rgb8),
            _ => None,
        }
    }
}

/// Configured sensor dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl FrameGeometry {
    /// Create a geometry from width and height
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in one frame
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Expected byte length of a Mono8 frame
    pub fn mono8_len(&self) -> usize {
        self.pixel_count()
    }

    /// Expected byte length of an RGB8 frame
    pub fn rgb8_len(&self) -> usize {
        self.pixel_count() * PixelFormat::Rgb8.channels()
    }

    /// Expected byte length for a given format
    pub fn frame_len(&self, format: PixelFormat) -> usize {
        self.pixel_count() * format.channels()
    }
}

/// Infer the pixel format from an assembled buffer length
///
/// Returns `None` when the length matches neither valid frame size.
#[inline]
pub fn infer_pixel_format(len: usize, geometry: FrameGeometry) -> Option<PixelFormat> {
    if geometry.pixel_count() == 0 {
        return None;
    }

    if len == geometry.mono8_len() {
        Some(PixelFormat::Mono8)
    } else if len == geometry.rgb8_len() {
        Some(PixelFormat::Rgb8)
    } else {
        None
    }
}
