// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture pipeline description
//!
//! A pipeline is source ! rate limiter ! sink. The description is rendered
//! as gst-launch text for backends that hand it to a media framework, and
//! read field-by-field by backends that capture natively.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::CaptureConfig;
use crate::error::{DesktopError, Result};
use crate::protocol::{PixelFormat, WindowHandle};

use super::WindowQuery;

/// Frame rate as a rational `num/den`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Framerate {
    num: u32,
    den: u32,
}

impl Framerate {
    /// # Errors
    ///
    /// [`DesktopError::InvalidConfig`] if either part is zero.
    pub fn new(num: u32, den: u32) -> Result<Self> {
        if num == 0 || den == 0 {
            return Err(DesktopError::InvalidConfig(format!(
                "framerate {num}/{den} must be positive"
            )));
        }
        Ok(Self { num, den })
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn den(&self) -> u32 {
        self.den
    }

    /// Time between two frames
    pub fn interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 * u64::from(self.den) / u64::from(self.num))
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.num) / f64::from(self.den)
    }
}

impl Default for Framerate {
    fn default() -> Self {
        Self { num: 30, den: 1 }
    }
}

impl fmt::Display for Framerate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Framerate {
    type Err = DesktopError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DesktopError::InvalidConfig(format!("invalid framerate '{s}'"));
        let (num, den) = match s.trim().split_once('/') {
            Some((num, den)) => (num.trim(), den.trim()),
            None => (s.trim(), "1"),
        };
        let num = num.parse().map_err(|_| invalid())?;
        let den = den.parse().map_err(|_| invalid())?;
        Self::new(num, den)
    }
}

impl TryFrom<String> for Framerate {
    type Error = DesktopError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Framerate> for String {
    fn from(value: Framerate) -> Self {
        value.to_string()
    }
}

/// Source element families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceElement {
    /// Desktop Duplication on Windows
    D3d11ScreenCapture,
    /// X server image grabs
    Ximage,
    /// AVFoundation on macOS
    AvfVideo,
    /// Synthetic pattern
    TestPattern,
}

impl SourceElement {
    /// Element used for screen capture on the build target.
    pub fn for_host() -> Self {
        if cfg!(windows) {
            SourceElement::D3d11ScreenCapture
        } else if cfg!(target_os = "macos") {
            SourceElement::AvfVideo
        } else {
            SourceElement::Ximage
        }
    }
}

/// What to capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSource {
    pub element: SourceElement,
    /// Restrict capture to this window
    pub window: Option<WindowHandle>,
    /// Monitor to capture when no window is set
    pub monitor_index: Option<u32>,
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.element {
            SourceElement::D3d11ScreenCapture => {
                write!(f, "d3d11screencapturesrc do-timestamp=true show-cursor=true")?;
                if let Some(handle) = self.window {
                    write!(f, " window-handle={}", handle.0)?;
                }
                if let Some(index) = self.monitor_index {
                    write!(f, " monitor-index={index}")?;
                }
                write!(f, " ! d3d11download")
            }
            SourceElement::Ximage => {
                write!(f, "ximagesrc do-timestamp=true use-damage=false")?;
                if let Some(handle) = self.window {
                    write!(f, " xid={}", handle.0)?;
                }
                if let Some(index) = self.monitor_index {
                    write!(f, " screen-num={index}")?;
                }
                Ok(())
            }
            SourceElement::AvfVideo => {
                write!(f, "avfvideosrc do-timestamp=true capture-screen=true")?;
                if let Some(index) = self.monitor_index {
                    write!(f, " device-index={index}")?;
                }
                Ok(())
            }
            SourceElement::TestPattern => write!(f, "videotestsrc is-live=true do-timestamp=true"),
        }
    }
}

/// Terminal stage delivering raw frames to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSink {
    pub name: String,
    pub pixel_format: PixelFormat,
    /// Frames buffered inside the sink
    pub max_buffers: u32,
    /// Drop the oldest frame when `max_buffers` is reached
    pub drop: bool,
}

impl Default for AppSink {
    fn default() -> Self {
        Self {
            name: "sink".to_string(),
            pixel_format: PixelFormat::Bgra32,
            max_buffers: 1,
            drop: true,
        }
    }
}

/// Structured capture pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDescription {
    pub source: CaptureSource,
    /// Upper bound; frames above it are dropped, never duplicated
    pub max_framerate: Framerate,
    pub sink: AppSink,
}

impl PipelineDescription {
    pub fn new(source: CaptureSource, max_framerate: Framerate) -> Self {
        Self {
            source,
            max_framerate,
            sink: AppSink::default(),
        }
    }
}

impl fmt::Display for PipelineDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ! videoconvert ! videorate drop-only=true ! \
             video/x-raw,format={},framerate=0/1,max-framerate={} ! \
             appsink name={} emit-signals=true sync=false max-buffers={} drop={}",
            self.source,
            self.sink.pixel_format.caps_name(),
            self.max_framerate,
            self.sink.name,
            self.sink.max_buffers,
            self.sink.drop,
        )
    }
}

/// Build the capture pipeline for `config` on this host.
///
/// # Errors
///
/// [`DesktopError::NotFound`] if `window_name` matches no window.
pub fn construct_pipeline(config: &CaptureConfig, windows: &dyn WindowQuery) -> Result<PipelineDescription> {
    let window = match &config.window_name {
        Some(name) => Some(windows.find_window_by_title(name)?.handle),
        None => None,
    };

    let source = CaptureSource {
        element: SourceElement::for_host(),
        window,
        monitor_index: config.monitor_index,
    };
    Ok(PipelineDescription::new(source, config.framerate))
}
