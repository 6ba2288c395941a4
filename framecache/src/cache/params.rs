//! Descriptive metadata stored alongside cached payloads.
//!
//! The table treats params as opaque; they are handed back on every hit and
//! written into the table of contents so restored entries can be validated
//! and reconstructed.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Metadata a [`CacheTable`](super::CacheTable) can store next to an entry.
pub trait EntryParams:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> EntryParams for T where
    T: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Integer rectangle, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RectI {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl RectI {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> u64 {
        (i64::from(self.x2) - i64::from(self.x1)).max(0) as u64
    }

    pub fn height(&self) -> u64 {
        (i64::from(self.y2) - i64::from(self.y1)).max(0) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Storage type of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum BitDepth {
    Byte = 0,
    Short = 1,
    Half = 2,
    Float = 3,
}

impl BitDepth {
    pub fn bytes_per_channel(self) -> u64 {
        match self {
            BitDepth::Byte => 1,
            BitDepth::Short | BitDepth::Half => 2,
            BitDepth::Float => 4,
        }
    }
}

/// Channels present in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelLayout {
    Alpha,
    Rgb,
    Rgba,
}

impl ChannelLayout {
    pub fn channel_count(self) -> u64 {
        match self {
            ChannelLayout::Alpha => 1,
            ChannelLayout::Rgb => 3,
            ChannelLayout::Rgba => 4,
        }
    }
}

/// Params of a node image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageParams {
    pub bounds: RectI,
    pub bit_depth: BitDepth,
    pub layout: ChannelLayout,
    pub mipmap_level: u32,
    pub pixel_aspect: f64,
}

impl ImageParams {
    pub fn new(bounds: RectI, bit_depth: BitDepth, layout: ChannelLayout) -> Self {
        Self {
            bounds,
            bit_depth,
            layout,
            mipmap_level: 0,
            pixel_aspect: 1.0,
        }
    }

    pub fn with_mipmap_level(mut self, level: u32) -> Self {
        self.mipmap_level = level;
        self
    }

    /// Bytes needed to hold the pixels described by these params.
    pub fn payload_size(&self) -> u64 {
        self.bounds.width()
            * self.bounds.height()
            * self.layout.channel_count()
            * self.bit_depth.bytes_per_channel()
    }
}

/// Params of a viewer texture (always 4 channels).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameParams {
    pub texture_rect: RectI,
    pub bit_depth: BitDepth,
}

impl FrameParams {
    pub fn new(texture_rect: RectI, bit_depth: BitDepth) -> Self {
        Self {
            texture_rect,
            bit_depth,
        }
    }

    pub fn payload_size(&self) -> u64 {
        self.texture_rect.width() * self.texture_rect.height() * 4 * self.bit_depth.bytes_per_channel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_dimensions() {
        let rect = RectI::new(-10, 0, 10, 5);
        assert_eq!(rect.width(), 20);
        assert_eq!(rect.height(), 5);
        assert!(!rect.is_empty());
    }

    #[test]
    fn test_inverted_rect_is_empty() {
        let rect = RectI::new(10, 10, 0, 0);
        assert_eq!(rect.width(), 0);
        assert!(rect.is_empty());
    }

    #[test]
    fn test_image_payload_size() {
        let params = ImageParams::new(RectI::new(0, 0, 100, 50), BitDepth::Float, ChannelLayout::Rgba);
        assert_eq!(params.payload_size(), 100 * 50 * 4 * 4);

        let alpha = ImageParams::new(RectI::new(0, 0, 8, 8), BitDepth::Byte, ChannelLayout::Alpha);
        assert_eq!(alpha.payload_size(), 64);
    }

    #[test]
    fn test_frame_payload_size() {
        let params = FrameParams::new(RectI::new(0, 0, 256, 256), BitDepth::Half);
        assert_eq!(params.payload_size(), 256 * 256 * 4 * 2);
    }
}
