// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Win32 platform backend
//!
//! Virtual keys are native here, so no key translation is needed. Hooks
//! are `WH_KEYBOARD_LL`/`WH_MOUSE_LL` installed on a dedicated thread that
//! pumps messages; the hook procedure runs on that thread, which is where
//! the sink is kept.

use std::cell::RefCell;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use windows::Win32::Foundation::{BOOL, HWND, LPARAM, LRESULT, RECT, TRUE, WPARAM};
use windows::Win32::Graphics::Gdi::{
    BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDC, GetDIBits, ReleaseDC,
    SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS, SRCCOPY,
};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::System::Threading::GetCurrentThreadId;
use windows::Win32::UI::Input::KeyboardAndMouse::{
    SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, INPUT_MOUSE, KEYBDINPUT, KEYBD_EVENT_FLAGS, KEYEVENTF_KEYUP,
    MOUSEEVENTF_HWHEEL, MOUSEEVENTF_LEFTDOWN, MOUSEEVENTF_LEFTUP, MOUSEEVENTF_MIDDLEDOWN, MOUSEEVENTF_MIDDLEUP,
    MOUSEEVENTF_RIGHTDOWN, MOUSEEVENTF_RIGHTUP, MOUSEEVENTF_WHEEL, MOUSEINPUT, MOUSE_EVENT_FLAGS, VIRTUAL_KEY,
};
use windows::Win32::UI::WindowsAndMessaging::{
    CallNextHookEx, EnumWindows, GetForegroundWindow, GetMessageW, GetSystemMetrics, GetWindowRect,
    GetWindowTextW, IsWindowVisible, PeekMessageW, PostThreadMessageW, SetCursorPos, SetWindowsHookExW,
    UnhookWindowsHookEx, HHOOK, KBDLLHOOKSTRUCT, MSG, MSLLHOOKSTRUCT, PM_NOREMOVE, SM_CXSCREEN, SM_CYSCREEN,
    WHEEL_DELTA, WH_KEYBOARD_LL, WH_MOUSE_LL, WINDOWS_HOOK_ID, WM_KEYDOWN, WM_KEYUP, WM_LBUTTONDOWN,
    WM_LBUTTONUP, WM_MBUTTONDOWN, WM_MBUTTONUP, WM_MOUSEHWHEEL, WM_MOUSEMOVE, WM_MOUSEWHEEL, WM_QUIT,
    WM_RBUTTONDOWN, WM_RBUTTONUP, WM_SYSKEYDOWN, WM_SYSKEYUP, WM_USER,
};

use crate::event::{InputEvent, MouseButton};
use crate::protocol::{now_ns, PixelFormat, TimestampedFrame, WindowHandle, WindowInfo, WindowRect};

use super::pacer::FramePacer;
use super::{
    CaptureBackend, EventSink, HookGuard, InputHook, InputInjector, PipelineDescription, PlatformBackend,
    PlatformError, PlatformResult, WindowQuery,
};

fn hwnd_of(handle: WindowHandle) -> HWND {
    HWND(handle.0 as isize)
}

fn handle_of(hwnd: HWND) -> WindowHandle {
    WindowHandle(hwnd.0 as u64)
}

// ============================================================================
// Window query
// ============================================================================

/// Foreground and top-level window lookups
pub struct Win32Windows;

impl Win32Windows {
    fn info(hwnd: HWND) -> PlatformResult<WindowInfo> {
        let mut title = [0u16; 512];
        // SAFETY: the buffer outlives the call and its length is passed along.
        let len = unsafe { GetWindowTextW(hwnd, &mut title) };
        let title = String::from_utf16_lossy(&title[..usize::try_from(len).unwrap_or(0)]);

        let mut rect = RECT::default();
        // SAFETY: `rect` is a valid out pointer.
        unsafe { GetWindowRect(hwnd, &mut rect) }.map_err(|e| PlatformError::Request(e.to_string()))?;

        Ok(WindowInfo::new(
            title,
            WindowRect::new(rect.left, rect.top, rect.right, rect.bottom),
            handle_of(hwnd),
        ))
    }
}

unsafe extern "system" fn collect_window(hwnd: HWND, lparam: LPARAM) -> BOOL {
    // SAFETY: `lparam` is the `Vec<HWND>` passed by `windows()` below, alive
    // for the whole enumeration.
    let found = unsafe { &mut *(lparam.0 as *mut Vec<HWND>) };
    if unsafe { IsWindowVisible(hwnd) }.as_bool() {
        found.push(hwnd);
    }
    TRUE
}

impl WindowQuery for Win32Windows {
    fn active_window(&self) -> PlatformResult<Option<WindowInfo>> {
        // SAFETY: no preconditions.
        let hwnd = unsafe { GetForegroundWindow() };
        if hwnd.0 == 0 {
            return Ok(None);
        }
        Self::info(hwnd).map(Some)
    }

    fn windows(&self) -> PlatformResult<Vec<WindowInfo>> {
        let mut found: Vec<HWND> = Vec::new();
        // SAFETY: `collect_window` only casts `lparam` back to `found`.
        unsafe { EnumWindows(Some(collect_window), LPARAM(&mut found as *mut Vec<HWND> as isize)) }
            .map_err(|e| PlatformError::Request(e.to_string()))?;

        Ok(found
            .into_iter()
            .filter_map(|hwnd| Self::info(hwnd).ok())
            .filter(|info| !info.title.is_empty())
            .collect())
    }
}

// ============================================================================
// Injection
// ============================================================================

/// `SendInput` injector
pub struct Win32Injector;

impl Win32Injector {
    fn send(input: INPUT) -> PlatformResult<()> {
        // SAFETY: one fully initialized INPUT with its exact size.
        let sent = unsafe { SendInput(&[input], size_of::<INPUT>() as i32) };
        if sent == 1 {
            Ok(())
        } else {
            Err(PlatformError::Injection("SendInput was blocked".to_string()))
        }
    }

    fn key(vk: u32, flags: KEYBD_EVENT_FLAGS) -> PlatformResult<()> {
        let vk = u16::try_from(vk).map_err(|_| PlatformError::UnmappedKey(vk))?;
        Self::send(INPUT {
            r#type: INPUT_KEYBOARD,
            Anonymous: INPUT_0 {
                ki: KEYBDINPUT {
                    wVk: VIRTUAL_KEY(vk),
                    wScan: 0,
                    dwFlags: flags,
                    time: 0,
                    dwExtraInfo: 0,
                },
            },
        })
    }

    fn mouse(flags: MOUSE_EVENT_FLAGS, data: i32) -> PlatformResult<()> {
        Self::send(INPUT {
            r#type: INPUT_MOUSE,
            Anonymous: INPUT_0 {
                mi: MOUSEINPUT {
                    dx: 0,
                    dy: 0,
                    mouseData: data as _,
                    dwFlags: flags,
                    time: 0,
                    dwExtraInfo: 0,
                },
            },
        })
    }
}

impl InputInjector for Win32Injector {
    fn press_key(&self, vk: u32) -> PlatformResult<()> {
        Self::key(vk, KEYBD_EVENT_FLAGS(0))
    }

    fn release_key(&self, vk: u32) -> PlatformResult<()> {
        Self::key(vk, KEYEVENTF_KEYUP)
    }

    fn move_mouse(&self, x: i32, y: i32) -> PlatformResult<()> {
        // SAFETY: no preconditions.
        unsafe { SetCursorPos(x, y) }.map_err(|e| PlatformError::Injection(e.to_string()))
    }

    fn click_mouse(&self, x: i32, y: i32, button: MouseButton, pressed: bool) -> PlatformResult<()> {
        self.move_mouse(x, y)?;
        let flags = match (button, pressed) {
            (MouseButton::Left, true) => MOUSEEVENTF_LEFTDOWN,
            (MouseButton::Left, false) => MOUSEEVENTF_LEFTUP,
            (MouseButton::Right, true) => MOUSEEVENTF_RIGHTDOWN,
            (MouseButton::Right, false) => MOUSEEVENTF_RIGHTUP,
            (MouseButton::Middle, true) => MOUSEEVENTF_MIDDLEDOWN,
            (MouseButton::Middle, false) => MOUSEEVENTF_MIDDLEUP,
        };
        Self::mouse(flags, 0)
    }

    fn scroll(&self, dx: i32, dy: i32) -> PlatformResult<()> {
        let notch = WHEEL_DELTA as i32;
        if dy != 0 {
            Self::mouse(MOUSEEVENTF_WHEEL, dy * notch)?;
        }
        if dx != 0 {
            Self::mouse(MOUSEEVENTF_HWHEEL, dx * notch)?;
        }
        Ok(())
    }
}

// ============================================================================
// Low-level hooks
// ============================================================================

thread_local! {
    static HOOK_SINK: RefCell<Option<EventSink>> = const { RefCell::new(None) };
}

fn deliver(event: InputEvent) {
    // Clone out of the cell so a re-entrant hook call cannot hit a borrow.
    let sink = HOOK_SINK.with(|cell| cell.borrow().clone());
    if let Some(sink) = sink {
        sink(event);
    }
}

unsafe extern "system" fn keyboard_proc(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if code >= 0 {
        // SAFETY: for WH_KEYBOARD_LL with code >= 0, lparam is a KBDLLHOOKSTRUCT.
        let info = unsafe { &*(lparam.0 as *const KBDLLHOOKSTRUCT) };
        match wparam.0 as u32 {
            WM_KEYDOWN | WM_SYSKEYDOWN => deliver(InputEvent::key_press(info.vkCode)),
            WM_KEYUP | WM_SYSKEYUP => deliver(InputEvent::key_release(info.vkCode)),
            _ => {}
        }
    }
    // SAFETY: forwarding the unmodified hook arguments.
    unsafe { CallNextHookEx(HHOOK::default(), code, wparam, lparam) }
}

unsafe extern "system" fn mouse_proc(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if code >= 0 {
        // SAFETY: for WH_MOUSE_LL with code >= 0, lparam is an MSLLHOOKSTRUCT.
        let info = unsafe { &*(lparam.0 as *const MSLLHOOKSTRUCT) };
        let (x, y) = (info.pt.x, info.pt.y);
        let wheel = i32::from((info.mouseData >> 16) as u16 as i16) / WHEEL_DELTA as i32;
        let event = match wparam.0 as u32 {
            WM_MOUSEMOVE => Some(InputEvent::mouse_move(x, y)),
            WM_LBUTTONDOWN => Some(InputEvent::mouse_click(x, y, MouseButton::Left, true)),
            WM_LBUTTONUP => Some(InputEvent::mouse_click(x, y, MouseButton::Left, false)),
            WM_RBUTTONDOWN => Some(InputEvent::mouse_click(x, y, MouseButton::Right, true)),
            WM_RBUTTONUP => Some(InputEvent::mouse_click(x, y, MouseButton::Right, false)),
            WM_MBUTTONDOWN => Some(InputEvent::mouse_click(x, y, MouseButton::Middle, true)),
            WM_MBUTTONUP => Some(InputEvent::mouse_click(x, y, MouseButton::Middle, false)),
            WM_MOUSEWHEEL => Some(InputEvent::mouse_scroll(x, y, 0, wheel)),
            WM_MOUSEHWHEEL => Some(InputEvent::mouse_scroll(x, y, wheel, 0)),
            _ => None,
        };
        if let Some(event) = event {
            deliver(event);
        }
    }
    // SAFETY: forwarding the unmodified hook arguments.
    unsafe { CallNextHookEx(HHOOK::default(), code, wparam, lparam) }
}

struct MessageLoopGuard {
    name: &'static str,
    thread_id: u32,
    uninstalled: AtomicBool,
    handle: Option<thread::JoinHandle<()>>,
}

impl HookGuard for MessageLoopGuard {
    fn uninstall(&self) {
        if self.uninstalled.swap(true, Ordering::SeqCst) {
            return;
        }
        // SAFETY: posting to a thread id; fails harmlessly if it has exited.
        if let Err(e) = unsafe { PostThreadMessageW(self.thread_id, WM_QUIT, WPARAM(0), LPARAM(0)) } {
            debug!("{}: quit message not delivered: {e}", self.name);
        }
    }

    fn join(&mut self) -> PlatformResult<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| PlatformError::Request(format!("{} thread panicked", self.name))),
            None => Ok(()),
        }
    }
}

type HookProc = unsafe extern "system" fn(i32, WPARAM, LPARAM) -> LRESULT;

fn install_hook(
    name: &'static str,
    id: WINDOWS_HOOK_ID,
    proc: HookProc,
    sink: EventSink,
) -> PlatformResult<Box<dyn HookGuard>> {
    let (ready_tx, ready_rx) = flume::bounded::<PlatformResult<u32>>(1);

    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            HOOK_SINK.with(|cell| *cell.borrow_mut() = Some(sink));

            // SAFETY: a null module name yields this executable's handle.
            let hook = unsafe { GetModuleHandleW(None) }
                .and_then(|module| unsafe { SetWindowsHookExW(id, Some(proc), module, 0) });
            let hook = match hook {
                Ok(hook) => hook,
                Err(e) => {
                    ready_tx.send(Err(PlatformError::HookInstall(e.to_string()))).ok();
                    return;
                }
            };

            // Force creation of the message queue before announcing the
            // thread id, so an immediate WM_QUIT is not lost.
            let mut msg = MSG::default();
            // SAFETY: `msg` is a valid out pointer.
            unsafe { PeekMessageW(&mut msg, None, WM_USER, WM_USER, PM_NOREMOVE) };
            // SAFETY: no preconditions.
            ready_tx.send(Ok(unsafe { GetCurrentThreadId() })).ok();
            info!("{name} installed");

            // SAFETY: `msg` is a valid out pointer; 0 means WM_QUIT, -1 an error.
            while unsafe { GetMessageW(&mut msg, None, 0, 0) }.0 > 0 {}

            // SAFETY: `hook` was returned by SetWindowsHookExW on this thread.
            if let Err(e) = unsafe { UnhookWindowsHookEx(hook) } {
                warn!("{name}: unhook failed: {e}");
            }
            HOOK_SINK.with(|cell| cell.borrow_mut().take());
            info!("{name} removed");
        })
        .map_err(|e| PlatformError::HookInstall(e.to_string()))?;

    let thread_id = ready_rx
        .recv_timeout(Duration::from_secs(5))
        .map_err(|_| PlatformError::HookInstall(format!("{name} thread did not report")))??;

    Ok(Box::new(MessageLoopGuard {
        name,
        thread_id,
        uninstalled: AtomicBool::new(false),
        handle: Some(handle),
    }))
}

/// Low-level keyboard and mouse hooks
pub struct Win32Hooks;

impl InputHook for Win32Hooks {
    fn install_keyboard(&self, sink: EventSink) -> PlatformResult<Box<dyn HookGuard>> {
        install_hook("win32-keyboard-hook", WH_KEYBOARD_LL, keyboard_proc, sink)
    }

    fn install_mouse(&self, sink: EventSink) -> PlatformResult<Box<dyn HookGuard>> {
        install_hook("win32-mouse-hook", WH_MOUSE_LL, mouse_proc, sink)
    }
}

// ============================================================================
// Capture
// ============================================================================

/// GDI screen grabs of the primary screen or a window's rectangle
pub struct Win32Capture {
    window: Option<HWND>,
    pacer: FramePacer,
}

impl Win32Capture {
    fn region(&self) -> PlatformResult<RECT> {
        match self.window {
            Some(hwnd) => {
                let mut rect = RECT::default();
                // SAFETY: `rect` is a valid out pointer.
                unsafe { GetWindowRect(hwnd, &mut rect) }.map_err(|e| PlatformError::Capture(e.to_string()))?;
                Ok(rect)
            }
            None => Ok(RECT {
                left: 0,
                top: 0,
                // SAFETY: no preconditions.
                right: unsafe { GetSystemMetrics(SM_CXSCREEN) },
                bottom: unsafe { GetSystemMetrics(SM_CYSCREEN) },
            }),
        }
    }

    fn grab(&self) -> PlatformResult<TimestampedFrame> {
        let rect = self.region()?;
        let (width, height) = (rect.right - rect.left, rect.bottom - rect.top);
        if width <= 0 || height <= 0 {
            return Err(PlatformError::Capture(format!("empty capture region {width}x{height}")));
        }

        let mut pixels = vec![0u8; width as usize * height as usize * 4];
        let timestamp_ns = now_ns();
        // SAFETY: every GDI object created here is released before return;
        // `pixels` is sized for a 32-bit top-down DIB of width x height.
        let lines = unsafe {
            let screen = GetDC(None);
            let memory = CreateCompatibleDC(screen);
            let bitmap = CreateCompatibleBitmap(screen, width, height);
            let previous = SelectObject(memory, bitmap);

            let copied = BitBlt(memory, 0, 0, width, height, screen, rect.left, rect.top, SRCCOPY);

            let mut info = BITMAPINFO {
                bmiHeader: BITMAPINFOHEADER {
                    biSize: size_of::<BITMAPINFOHEADER>() as u32,
                    biWidth: width,
                    biHeight: -height,
                    biPlanes: 1,
                    biBitCount: 32,
                    biCompression: BI_RGB.0,
                    ..Default::default()
                },
                ..Default::default()
            };
            let lines = if copied.is_ok() {
                GetDIBits(
                    memory,
                    bitmap,
                    0,
                    height as u32,
                    Some(pixels.as_mut_ptr().cast()),
                    &mut info,
                    DIB_RGB_COLORS,
                )
            } else {
                0
            };

            SelectObject(memory, previous);
            DeleteObject(bitmap);
            DeleteDC(memory);
            ReleaseDC(None, screen);
            lines
        };

        if lines != height {
            return Err(PlatformError::Capture(format!("copied {lines} of {height} lines")));
        }
        for px in pixels.chunks_exact_mut(4) {
            px[3] = 255;
        }

        Ok(TimestampedFrame {
            timestamp_ns,
            pixels,
            width: width as u32,
            height: height as u32,
            pixel_format: PixelFormat::Bgra32,
        })
    }
}

impl CaptureBackend for Win32Capture {
    fn open(&mut self, pipeline: &PipelineDescription) -> PlatformResult<()> {
        if pipeline.source.monitor_index.is_some_and(|index| index > 0) {
            warn!("GDI capture only covers the primary monitor");
        }
        self.window = pipeline.source.window.map(hwnd_of);
        self.region()?;
        self.pacer.start(pipeline.max_framerate.interval());
        info!("GDI capture opened: {pipeline}");
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> PlatformResult<Option<TimestampedFrame>> {
        if !self.pacer.is_running() {
            return Err(PlatformError::Capture("capture not open".to_string()));
        }
        if !self.pacer.wait(timeout) {
            return Ok(None);
        }
        self.grab().map(Some)
    }

    fn close(&mut self) {
        self.pacer.stop();
    }
}

// ============================================================================
// Platform
// ============================================================================

/// Win32 backend
pub struct Win32Platform {
    windows: Arc<Win32Windows>,
    injector: Arc<Win32Injector>,
    hooks: Arc<Win32Hooks>,
}

impl Default for Win32Platform {
    fn default() -> Self {
        Self::new()
    }
}

impl Win32Platform {
    pub fn new() -> Self {
        Self {
            windows: Arc::new(Win32Windows),
            injector: Arc::new(Win32Injector),
            hooks: Arc::new(Win32Hooks),
        }
    }
}

impl PlatformBackend for Win32Platform {
    fn name(&self) -> &'static str {
        "win32"
    }

    fn window_query(&self) -> Arc<dyn WindowQuery> {
        self.windows.clone()
    }

    fn injector(&self) -> Arc<dyn InputInjector> {
        self.injector.clone()
    }

    fn input_hook(&self) -> Arc<dyn InputHook> {
        self.hooks.clone()
    }

    fn capture_backend(&self) -> PlatformResult<Box<dyn CaptureBackend>> {
        Ok(Box::new(Win32Capture {
            window: None,
            pacer: FramePacer::default(),
        }))
    }
}
