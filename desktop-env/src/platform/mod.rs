// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Platform backends
//!
//! Everything that touches the OS sits behind the traits in this module.
//! One [`PlatformBackend`] is chosen by [`detect`] at startup; components
//! only ever see the trait objects it hands out.
//!
//! - **win32**: `windows` crate, low-level hooks and `SendInput`
//! - **x11**: `x11rb` core protocol plus XTEST for injection
//! - **stub**: scripted in-memory doubles, used headless and in tests

use std::sync::Arc;
use std::time::Duration;

use crate::error::{DesktopError, Result};
use crate::event::{InputEvent, MouseButton};
use crate::protocol::{TimestampedFrame, WindowInfo};

mod pacer;
mod pipeline;
pub mod stub;
#[cfg(windows)]
pub mod win32;
#[cfg(target_os = "linux")]
pub mod x11;

pub use pipeline::{construct_pipeline, AppSink, CaptureSource, Framerate, PipelineDescription, SourceElement};

/// Platform backend errors
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// Capability not available on this backend
    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),

    /// Connection to the display server failed or was lost
    #[error("Display connection failed: {0}")]
    Connection(String),

    /// A request to the OS failed
    #[error("Platform request failed: {0}")]
    Request(String),

    /// The OS refused an injected input
    #[error("Injection failed: {0}")]
    Injection(String),

    /// A hook could not be installed
    #[error("Hook installation failed: {0}")]
    HookInstall(String),

    /// Virtual key has no translation on this backend
    #[error("No key mapping for virtual key {0:#04x}")]
    UnmappedKey(u32),

    /// Capture backend failure
    #[error("Capture failed: {0}")]
    Capture(String),
}

/// Result type for platform operations.
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Receiver of translated hook events
pub type EventSink = Arc<dyn Fn(InputEvent) + Send + Sync>;

/// Window inspection
pub trait WindowQuery: Send + Sync {
    /// Window that currently has input focus, if any.
    fn active_window(&self) -> PlatformResult<Option<WindowInfo>>;

    /// All visible top-level windows.
    fn windows(&self) -> PlatformResult<Vec<WindowInfo>>;

    /// First window whose title contains `needle`.
    ///
    /// # Errors
    ///
    /// [`DesktopError::NotFound`] when no title matches.
    fn find_window_by_title(&self, needle: &str) -> Result<WindowInfo> {
        self.windows()?
            .into_iter()
            .find(|w| w.title.contains(needle))
            .ok_or_else(|| DesktopError::NotFound(needle.to_string()))
    }
}

/// Synthetic input injection
///
/// Key codes are virtual keys (see [`crate::keymap::vk`]); coordinates are
/// absolute screen pixels.
pub trait InputInjector: Send + Sync {
    fn press_key(&self, vk: u32) -> PlatformResult<()>;
    fn release_key(&self, vk: u32) -> PlatformResult<()>;
    fn move_mouse(&self, x: i32, y: i32) -> PlatformResult<()>;
    fn click_mouse(&self, x: i32, y: i32, button: MouseButton, pressed: bool) -> PlatformResult<()>;
    fn scroll(&self, dx: i32, dy: i32) -> PlatformResult<()>;
}

/// Installed hook
pub trait HookGuard: Send {
    /// Stop delivering events. Idempotent, callable from any thread.
    fn uninstall(&self);

    /// Wait for the hook's delivery thread to unwind.
    fn join(&mut self) -> PlatformResult<()>;
}

/// Global input hooks
///
/// Sinks are invoked on the hook's own delivery thread.
pub trait InputHook: Send + Sync {
    fn install_keyboard(&self, sink: EventSink) -> PlatformResult<Box<dyn HookGuard>>;
    fn install_mouse(&self, sink: EventSink) -> PlatformResult<Box<dyn HookGuard>>;
}

/// Frame source driven by a [`PipelineDescription`]
pub trait CaptureBackend: Send {
    /// Bring the pipeline to a running state.
    fn open(&mut self, pipeline: &PipelineDescription) -> PlatformResult<()>;

    /// Wait up to `timeout` for the next frame; `Ok(None)` on timeout.
    fn next_frame(&mut self, timeout: Duration) -> PlatformResult<Option<TimestampedFrame>>;

    /// Tear the pipeline down. Idempotent.
    fn close(&mut self);
}

/// Capability bundle for one platform
pub trait PlatformBackend: Send + Sync {
    /// Short backend name ("win32", "x11", "stub")
    fn name(&self) -> &'static str;

    fn window_query(&self) -> Arc<dyn WindowQuery>;

    fn injector(&self) -> Arc<dyn InputInjector>;

    fn input_hook(&self) -> Arc<dyn InputHook>;

    /// A fresh capture backend; each capture component owns its own.
    fn capture_backend(&self) -> PlatformResult<Box<dyn CaptureBackend>>;
}

/// Select the backend for the running host.
///
/// Win32 on Windows, X11 on Linux when `DISPLAY` is set, the stub
/// otherwise. A failed X11 connection also falls back to the stub.
pub fn detect() -> Arc<dyn PlatformBackend> {
    let platform = detect_host();
    log::info!("Using {} platform backend", platform.name());
    platform
}

#[cfg(windows)]
fn detect_host() -> Arc<dyn PlatformBackend> {
    Arc::new(win32::Win32Platform::new())
}

#[cfg(target_os = "linux")]
fn detect_host() -> Arc<dyn PlatformBackend> {
    if std::env::var_os("DISPLAY").is_some() {
        match x11::X11Platform::connect() {
            Ok(platform) => return Arc::new(platform),
            Err(e) => log::warn!("X11 unavailable, falling back to stub: {e}"),
        }
    }
    Arc::new(stub::StubPlatform::new())
}

#[cfg(not(any(windows, target_os = "linux")))]
fn detect_host() -> Arc<dyn PlatformBackend> {
    Arc::new(stub::StubPlatform::new())
}
