// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared value types passed between components
//!
//! Frames are moved from producer to consumer on every handoff; window
//! snapshots are immutable and created once per poll.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Nanoseconds since the Unix epoch, or 0 if the clock is before it.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Byte layout of [`TimestampedFrame::pixels`]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Four bytes per pixel, blue first
    #[default]
    Bgra32 = 0,
    /// Four bytes per pixel, red first
    Rgba32 = 1,
    /// Planar YUV 4:2:0
    Nv12 = 2,
}

impl TryFrom<u32> for PixelFormat {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PixelFormat::Bgra32),
            1 => Ok(PixelFormat::Rgba32),
            2 => Ok(PixelFormat::Nv12),
            _ => Err("Invalid pixel format value"),
        }
    }
}

impl PixelFormat {
    /// Bytes per pixel of the first plane
    pub fn bytes_per_pixel(&self) -> u8 {
        match self {
            PixelFormat::Bgra32 | PixelFormat::Rgba32 => 4,
            PixelFormat::Nv12 => 1, // Y plane only
        }
    }

    /// Caps name used in pipeline descriptions
    pub fn caps_name(&self) -> &'static str {
        match self {
            PixelFormat::Bgra32 => "BGRA",
            PixelFormat::Rgba32 => "RGBA",
            PixelFormat::Nv12 => "NV12",
        }
    }
}

/// One captured image with its capture time
pub struct TimestampedFrame {
    /// Capture time, nanoseconds since the Unix epoch
    pub timestamp_ns: i64,
    /// Pixel data, row-major, no padding
    pub pixels: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Pixel format
    pub pixel_format: PixelFormat,
}

impl TimestampedFrame {
    /// Byte length a frame of this size and format should have
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel() as usize
    }

    /// Latency between capture and `now_ns`, in nanoseconds
    pub fn age_ns(&self, now_ns: i64) -> i64 {
        now_ns.saturating_sub(self.timestamp_ns)
    }
}

impl fmt::Debug for TimestampedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimestampedFrame")
            .field("timestamp_ns", &self.timestamp_ns)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &self.pixel_format)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Opaque platform window identifier (XID, HWND, CGWindowID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowHandle(pub u64);

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Window rectangle in screen coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl WindowRect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

/// Snapshot of a top-level window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    /// Window title
    pub title: String,
    /// Outer rectangle
    pub rect: WindowRect,
    /// Platform handle
    pub handle: WindowHandle,
}

impl WindowInfo {
    pub fn new(title: impl Into<String>, rect: WindowRect, handle: WindowHandle) -> Self {
        Self {
            title: title.into(),
            rect,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_bytes_per_pixel() {
        assert_eq!(PixelFormat::Bgra32.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Rgba32.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Nv12.bytes_per_pixel(), 1);
    }

    #[test]
    fn test_pixel_format_try_from() {
        assert_eq!(PixelFormat::try_from(0).unwrap(), PixelFormat::Bgra32);
        assert_eq!(PixelFormat::try_from(2).unwrap(), PixelFormat::Nv12);
        assert_eq!(PixelFormat::try_from(99), Err("Invalid pixel format value"));
    }

    #[test]
    fn test_frame_debug_omits_pixels() {
        let frame = TimestampedFrame {
            timestamp_ns: 5,
            pixels: vec![0; 1920 * 1080 * 4],
            width: 1920,
            height: 1080,
            pixel_format: PixelFormat::Bgra32,
        };
        assert_eq!(frame.expected_len(), frame.pixels.len());
        let debug_str = format!("{frame:?}");
        assert!(debug_str.contains("1920"));
        assert!(debug_str.contains("bytes"));
        assert!(debug_str.len() < 200);
    }

    #[test]
    fn test_frame_age() {
        let frame = TimestampedFrame {
            timestamp_ns: 1_000,
            pixels: Vec::new(),
            width: 0,
            height: 0,
            pixel_format: PixelFormat::default(),
        };
        assert_eq!(frame.age_ns(4_000), 3_000);
        assert_eq!(frame.age_ns(0), -1_000);
    }

    #[test]
    fn test_window_rect_size() {
        let rect = WindowRect::new(10, 20, 110, 70);
        assert_eq!(rect.width(), 100);
        assert_eq!(rect.height(), 50);
    }

    #[test]
    fn test_now_ns_is_positive() {
        assert!(now_ns() > 0);
    }
}
