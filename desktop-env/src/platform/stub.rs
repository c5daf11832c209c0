// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! In-memory platform backend
//!
//! Used when no display server is reachable and as the test double for
//! every platform trait: window titles are scripted, injected input is
//! recorded, hook events are emitted by hand and frames are a moving test
//! pattern.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::debug;

use crate::event::{InputDevice, InputEvent, MouseButton};
use crate::protocol::{now_ns, PixelFormat, TimestampedFrame, WindowHandle, WindowInfo, WindowRect};

use super::pacer::FramePacer;
use super::{
    CaptureBackend, EventSink, HookGuard, InputHook, InputInjector, PipelineDescription, PlatformBackend,
    PlatformError, PlatformResult, WindowQuery,
};

// ============================================================================
// Window query
// ============================================================================

enum Scripted {
    Window(Option<WindowInfo>),
    Error,
}

#[derive(Default)]
struct WindowScript {
    queue: VecDeque<Scripted>,
    current: Option<WindowInfo>,
    windows: Vec<WindowInfo>,
}

/// Window query that replays a script of active windows
///
/// Each `active_window` call consumes one scripted entry; once the script
/// is exhausted the last window stays active.
#[derive(Default)]
pub struct ScriptedWindowQuery {
    script: Mutex<WindowScript>,
    polls: AtomicU64,
}

impl ScriptedWindowQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script one active window per title, in order.
    pub fn with_titles(titles: &[&str]) -> Self {
        let query = Self::new();
        for (i, title) in titles.iter().enumerate() {
            query.push_active(Some(test_window(title, i as u64 + 1)));
        }
        query
    }

    /// Append one poll result to the script.
    pub fn push_active(&self, window: Option<WindowInfo>) {
        self.lock().queue.push_back(Scripted::Window(window));
    }

    /// Append a failing poll to the script.
    pub fn push_error(&self) {
        self.lock().queue.push_back(Scripted::Error);
    }

    /// Drop the script and make `window` the steady active window.
    pub fn set_active(&self, window: Option<WindowInfo>) {
        let mut script = self.lock();
        script.queue.clear();
        script.current = window;
    }

    /// Windows listed by `windows()`.
    pub fn set_windows(&self, windows: Vec<WindowInfo>) {
        self.lock().windows = windows;
    }

    /// Number of `active_window` calls so far
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Whether every scripted entry has been consumed
    pub fn exhausted(&self) -> bool {
        self.lock().queue.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WindowQuery for ScriptedWindowQuery {
    fn active_window(&self) -> PlatformResult<Option<WindowInfo>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.lock();
        match script.queue.pop_front() {
            Some(Scripted::Window(window)) => {
                script.current = window.clone();
                Ok(window)
            }
            Some(Scripted::Error) => Err(PlatformError::Request("scripted failure".to_string())),
            None => Ok(script.current.clone()),
        }
    }

    fn windows(&self) -> PlatformResult<Vec<WindowInfo>> {
        Ok(self.lock().windows.clone())
    }
}

/// Window with a fixed 800x600 rectangle, for scripts.
pub fn test_window(title: &str, handle: u64) -> WindowInfo {
    WindowInfo::new(title, WindowRect::new(0, 0, 800, 600), WindowHandle(handle))
}

// ============================================================================
// Injector
// ============================================================================

/// One call received by [`RecordingInjector`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedInput {
    Press(u32),
    Release(u32),
    Move(i32, i32),
    Click(i32, i32, MouseButton, bool),
    Scroll(i32, i32),
}

/// Injector that records calls instead of touching the OS
#[derive(Default)]
pub struct RecordingInjector {
    calls: Mutex<Vec<InjectedInput>>,
    unmapped: Mutex<HashSet<u32>>,
}

impl RecordingInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make presses and releases of `vk` fail with `UnmappedKey`.
    pub fn reject_key(&self, vk: u32) {
        self.unmapped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vk);
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<InjectedInput> {
        std::mem::take(&mut *self.calls.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, input: InjectedInput) -> PlatformResult<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(input);
        Ok(())
    }

    fn check_key(&self, vk: u32) -> PlatformResult<()> {
        if self
            .unmapped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&vk)
        {
            return Err(PlatformError::UnmappedKey(vk));
        }
        Ok(())
    }
}

impl InputInjector for RecordingInjector {
    fn press_key(&self, vk: u32) -> PlatformResult<()> {
        self.check_key(vk)?;
        self.record(InjectedInput::Press(vk))
    }

    fn release_key(&self, vk: u32) -> PlatformResult<()> {
        self.check_key(vk)?;
        self.record(InjectedInput::Release(vk))
    }

    fn move_mouse(&self, x: i32, y: i32) -> PlatformResult<()> {
        self.record(InjectedInput::Move(x, y))
    }

    fn click_mouse(&self, x: i32, y: i32, button: MouseButton, pressed: bool) -> PlatformResult<()> {
        self.record(InjectedInput::Click(x, y, button, pressed))
    }

    fn scroll(&self, dx: i32, dy: i32) -> PlatformResult<()> {
        self.record(InjectedInput::Scroll(dx, dy))
    }
}

// ============================================================================
// Hooks
// ============================================================================

#[derive(Default)]
struct HookSlots {
    keyboard: Mutex<Option<EventSink>>,
    mouse: Mutex<Option<EventSink>>,
}

impl HookSlots {
    fn slot(&self, device: InputDevice) -> &Mutex<Option<EventSink>> {
        match device {
            InputDevice::Keyboard => &self.keyboard,
            InputDevice::Mouse => &self.mouse,
        }
    }
}

/// Hook whose events are emitted by the test itself
///
/// `emit` runs the installed sink on the calling thread, standing in for
/// the OS delivery thread.
#[derive(Default)]
pub struct ManualHook {
    slots: Arc<HookSlots>,
    refuse: Mutex<HashSet<InputDevice>>,
    uninstalls: Arc<AtomicU64>,
}

impl ManualHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make installation for `device` fail.
    pub fn refuse(&self, device: InputDevice) {
        self.refuse
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device);
    }

    pub fn is_installed(&self, device: InputDevice) -> bool {
        self.slots
            .slot(device)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Deliver `event` to the hook for its device.
    ///
    /// Returns `false` if no hook is installed for that device.
    pub fn emit(&self, event: InputEvent) -> bool {
        let sink = self
            .slots
            .slot(event.device())
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match sink {
            Some(sink) => {
                sink(event);
                true
            }
            None => false,
        }
    }

    /// Number of hooks uninstalled so far
    pub fn uninstalls(&self) -> u64 {
        self.uninstalls.load(Ordering::SeqCst)
    }

    fn install(&self, device: InputDevice, sink: EventSink) -> PlatformResult<Box<dyn HookGuard>> {
        if self
            .refuse
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&device)
        {
            return Err(PlatformError::HookInstall(format!(
                "{} hook refused",
                device.as_str()
            )));
        }

        *self
            .slots
            .slot(device)
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
        debug!("Manual {} hook installed", device.as_str());

        Ok(Box::new(ManualGuard {
            device,
            slots: self.slots.clone(),
            installed: AtomicBool::new(true),
            uninstalls: self.uninstalls.clone(),
        }))
    }
}

impl InputHook for ManualHook {
    fn install_keyboard(&self, sink: EventSink) -> PlatformResult<Box<dyn HookGuard>> {
        self.install(InputDevice::Keyboard, sink)
    }

    fn install_mouse(&self, sink: EventSink) -> PlatformResult<Box<dyn HookGuard>> {
        self.install(InputDevice::Mouse, sink)
    }
}

struct ManualGuard {
    device: InputDevice,
    slots: Arc<HookSlots>,
    installed: AtomicBool,
    uninstalls: Arc<AtomicU64>,
}

impl HookGuard for ManualGuard {
    fn uninstall(&self) {
        if self.installed.swap(false, Ordering::SeqCst) {
            self.slots
                .slot(self.device)
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            self.uninstalls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn join(&mut self) -> PlatformResult<()> {
        Ok(())
    }
}

// ============================================================================
// Capture
// ============================================================================

/// Capture backend producing a moving BGRA test pattern
pub struct SyntheticCapture {
    width: u32,
    height: u32,
    fail_open: bool,
    pacer: FramePacer,
    frame_count: u64,
    buffer: Vec<u8>,
}

impl SyntheticCapture {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fail_open: false,
            pacer: FramePacer::default(),
            frame_count: 0,
            buffer: Vec::new(),
        }
    }

    /// Make `open` fail, as a pipeline that never reaches PLAYING would.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    fn render(&mut self) -> Vec<u8> {
        let bpp = PixelFormat::Bgra32.bytes_per_pixel() as usize;
        let size = self.width as usize * self.height as usize * bpp;
        if self.buffer.len() != size {
            self.buffer.resize(size, 0);
        }

        let phase = (self.frame_count % 256) as u8;
        for (i, px) in self.buffer.chunks_exact_mut(bpp).enumerate() {
            let x = i % self.width as usize;
            let y = i / self.width as usize;
            px[0] = (x as u8).wrapping_add(phase);
            px[1] = (y as u8).wrapping_add(phase);
            px[2] = ((x + y) as u8).wrapping_add(phase);
            px[3] = 255;
        }

        self.frame_count += 1;
        self.buffer.clone()
    }
}

impl CaptureBackend for SyntheticCapture {
    fn open(&mut self, pipeline: &PipelineDescription) -> PlatformResult<()> {
        if self.fail_open {
            return Err(PlatformError::Capture(format!(
                "pipeline '{pipeline}' did not reach a running state"
            )));
        }
        self.pacer.start(pipeline.max_framerate.interval());
        debug!("Synthetic capture opened: {}x{}", self.width, self.height);
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> PlatformResult<Option<TimestampedFrame>> {
        if !self.pacer.is_running() {
            return Err(PlatformError::Capture("capture not open".to_string()));
        }
        if !self.pacer.wait(timeout) {
            return Ok(None);
        }

        Ok(Some(TimestampedFrame {
            timestamp_ns: now_ns(),
            pixels: self.render(),
            width: self.width,
            height: self.height,
            pixel_format: PixelFormat::Bgra32,
        }))
    }

    fn close(&mut self) {
        self.pacer.stop();
        self.buffer = Vec::new();
    }
}

// ============================================================================
// Platform
// ============================================================================

/// Backend built from the doubles above
pub struct StubPlatform {
    windows: Arc<ScriptedWindowQuery>,
    injector: Arc<RecordingInjector>,
    hook: Arc<ManualHook>,
    frame_size: (u32, u32),
    fail_capture: AtomicBool,
}

impl Default for StubPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl StubPlatform {
    pub fn new() -> Self {
        Self {
            windows: Arc::new(ScriptedWindowQuery::new()),
            injector: Arc::new(RecordingInjector::new()),
            hook: Arc::new(ManualHook::new()),
            frame_size: (64, 48),
            fail_capture: AtomicBool::new(false),
        }
    }

    pub fn windows(&self) -> &Arc<ScriptedWindowQuery> {
        &self.windows
    }

    pub fn recorder(&self) -> &Arc<RecordingInjector> {
        &self.injector
    }

    pub fn hook(&self) -> &Arc<ManualHook> {
        &self.hook
    }

    /// Make every capture backend handed out from now on fail to open.
    pub fn fail_capture(&self) {
        self.fail_capture.store(true, Ordering::SeqCst);
    }
}

impl PlatformBackend for StubPlatform {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn window_query(&self) -> Arc<dyn WindowQuery> {
        self.windows.clone()
    }

    fn injector(&self) -> Arc<dyn InputInjector> {
        self.injector.clone()
    }

    fn input_hook(&self) -> Arc<dyn InputHook> {
        self.hook.clone()
    }

    fn capture_backend(&self) -> PlatformResult<Box<dyn CaptureBackend>> {
        let (width, height) = self.frame_size;
        let capture = SyntheticCapture::new(width, height);
        if self.fail_capture.load(Ordering::SeqCst) {
            Ok(Box::new(capture.failing_open()))
        } else {
            Ok(Box::new(capture))
        }
    }
}
