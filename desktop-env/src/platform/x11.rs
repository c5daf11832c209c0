// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! X11 platform backend
//!
//! Window state comes from the EWMH properties on the root window. Input is
//! injected through XTEST. The core protocol has no global hooks, so
//! keyboard and mouse hooks are threads that poll the key map and pointer
//! and emit the differences.

use std::fmt::Display;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ConnectionExt as XprotoExt, ImageFormat, KeyButMask, Window, BUTTON_PRESS_EVENT,
    BUTTON_RELEASE_EVENT, KEY_PRESS_EVENT, KEY_RELEASE_EVENT,
};
use x11rb::protocol::xtest::ConnectionExt as XtestExt;
use x11rb::rust_connection::RustConnection;

use crate::event::{ButtonState, InputEvent, MouseButton};
use crate::keymap;
use crate::lifecycle::StopSignal;
use crate::protocol::{now_ns, PixelFormat, TimestampedFrame, WindowHandle, WindowInfo, WindowRect};

use super::pacer::FramePacer;
use super::{
    CaptureBackend, EventSink, HookGuard, InputHook, InputInjector, PipelineDescription, PlatformBackend,
    PlatformError, PlatformResult, WindowQuery,
};

/// Poll period of the keyboard and mouse hook threads
const HOOK_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn request_err(e: impl Display) -> PlatformError {
    PlatformError::Request(e.to_string())
}

struct Atoms {
    net_active_window: Atom,
    net_client_list: Atom,
    net_wm_name: Atom,
    utf8_string: Atom,
}

impl Atoms {
    fn intern(conn: &RustConnection) -> PlatformResult<Self> {
        let intern = |name: &[u8]| -> PlatformResult<Atom> {
            Ok(conn
                .intern_atom(false, name)
                .map_err(request_err)?
                .reply()
                .map_err(request_err)?
                .atom)
        };
        Ok(Self {
            net_active_window: intern(b"_NET_ACTIVE_WINDOW")?,
            net_client_list: intern(b"_NET_CLIENT_LIST")?,
            net_wm_name: intern(b"_NET_WM_NAME")?,
            utf8_string: intern(b"UTF8_STRING")?,
        })
    }
}

/// Connection and lookup tables shared by every X11 capability
pub struct X11Session {
    conn: RustConnection,
    root: Window,
    atoms: Atoms,
    min_keycode: u8,
    keysyms_per_keycode: usize,
    keysyms: Vec<u32>,
}

impl X11Session {
    fn connect() -> PlatformResult<Self> {
        let (conn, screen_num) =
            x11rb::connect(None).map_err(|e| PlatformError::Connection(e.to_string()))?;

        let setup = conn.setup();
        let root = setup
            .roots
            .get(screen_num)
            .ok_or_else(|| PlatformError::Connection("Screen not found".to_string()))?
            .root;
        let (min_keycode, max_keycode) = (setup.min_keycode, setup.max_keycode);

        let mapping = conn
            .get_keyboard_mapping(min_keycode, max_keycode - min_keycode + 1)
            .map_err(request_err)?
            .reply()
            .map_err(request_err)?;
        let atoms = Atoms::intern(&conn)?;

        Ok(Self {
            conn,
            root,
            atoms,
            min_keycode,
            keysyms_per_keycode: usize::from(mapping.keysyms_per_keycode).max(1),
            keysyms: mapping.keysyms,
        })
    }

    fn keycode_to_vk(&self, keycode: u8) -> Option<u32> {
        let index = usize::from(keycode.checked_sub(self.min_keycode)?) * self.keysyms_per_keycode;
        keymap::keysym_to_vk(*self.keysyms.get(index)?)
    }

    fn vk_to_keycode(&self, vk: u32) -> PlatformResult<u8> {
        let sym = keymap::vk_to_keysym(vk).ok_or(PlatformError::UnmappedKey(vk))?;
        self.keysyms
            .chunks(self.keysyms_per_keycode)
            .position(|syms| syms.contains(&sym))
            .and_then(|offset| u8::try_from(offset).ok())
            .map(|offset| self.min_keycode + offset)
            .ok_or(PlatformError::UnmappedKey(vk))
    }

    fn window_property(&self, window: Window, property: Atom, type_: Atom) -> PlatformResult<Vec<u8>> {
        Ok(self
            .conn
            .get_property(false, window, property, type_, 0, u32::MAX)
            .map_err(request_err)?
            .reply()
            .map_err(request_err)?
            .value)
    }

    fn window_title(&self, window: Window) -> PlatformResult<String> {
        let mut raw = self.window_property(window, self.atoms.net_wm_name, self.atoms.utf8_string)?;
        if raw.is_empty() {
            raw = self.window_property(window, AtomEnum::WM_NAME.into(), AtomEnum::STRING.into())?;
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn window_rect(&self, window: Window) -> PlatformResult<WindowRect> {
        let geometry = self
            .conn
            .get_geometry(window)
            .map_err(request_err)?
            .reply()
            .map_err(request_err)?;
        let origin = self
            .conn
            .translate_coordinates(window, self.root, 0, 0)
            .map_err(request_err)?
            .reply()
            .map_err(request_err)?;

        let (left, top) = (i32::from(origin.dst_x), i32::from(origin.dst_y));
        Ok(WindowRect::new(
            left,
            top,
            left + i32::from(geometry.width),
            top + i32::from(geometry.height),
        ))
    }

    fn window_info(&self, window: Window) -> PlatformResult<WindowInfo> {
        Ok(WindowInfo::new(
            self.window_title(window)?,
            self.window_rect(window)?,
            WindowHandle(u64::from(window)),
        ))
    }

    fn root_windows(&self, property: Atom) -> PlatformResult<Vec<Window>> {
        let reply = self
            .conn
            .get_property(false, self.root, property, AtomEnum::WINDOW, 0, u32::MAX)
            .map_err(request_err)?
            .reply()
            .map_err(request_err)?;
        Ok(reply
            .value32()
            .map(|windows| windows.filter(|w| *w != x11rb::NONE).collect())
            .unwrap_or_default())
    }

    fn fake_input(&self, event_type: u8, detail: u8) -> PlatformResult<()> {
        self.conn
            .xtest_fake_input(event_type, detail, x11rb::CURRENT_TIME, self.root, 0, 0, 0)
            .map_err(|e| PlatformError::Injection(e.to_string()))?;
        self.conn
            .flush()
            .map_err(|e| PlatformError::Injection(e.to_string()))
    }

    fn tap_button(&self, button: u8, count: u32) -> PlatformResult<()> {
        for _ in 0..count {
            self.fake_input(BUTTON_PRESS_EVENT, button)?;
            self.fake_input(BUTTON_RELEASE_EVENT, button)?;
        }
        Ok(())
    }
}

impl WindowQuery for X11Session {
    fn active_window(&self) -> PlatformResult<Option<WindowInfo>> {
        match self.root_windows(self.atoms.net_active_window)?.first() {
            Some(&window) => self.window_info(window).map(Some),
            None => Ok(None),
        }
    }

    fn windows(&self) -> PlatformResult<Vec<WindowInfo>> {
        let mut infos = Vec::new();
        for window in self.root_windows(self.atoms.net_client_list)? {
            match self.window_info(window) {
                Ok(info) => infos.push(info),
                // Windows can vanish between listing and querying.
                Err(e) => debug!("Skipping window {window:#x}: {e}"),
            }
        }
        Ok(infos)
    }
}

fn button_code(button: MouseButton) -> u8 {
    match button {
        MouseButton::Left => 1,
        MouseButton::Middle => 2,
        MouseButton::Right => 3,
    }
}

impl InputInjector for X11Session {
    fn press_key(&self, vk: u32) -> PlatformResult<()> {
        self.fake_input(KEY_PRESS_EVENT, self.vk_to_keycode(vk)?)
    }

    fn release_key(&self, vk: u32) -> PlatformResult<()> {
        self.fake_input(KEY_RELEASE_EVENT, self.vk_to_keycode(vk)?)
    }

    fn move_mouse(&self, x: i32, y: i32) -> PlatformResult<()> {
        let clamp = |v: i32| v.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        self.conn
            .warp_pointer(x11rb::NONE, self.root, 0, 0, 0, 0, clamp(x), clamp(y))
            .map_err(|e| PlatformError::Injection(e.to_string()))?;
        self.conn
            .flush()
            .map_err(|e| PlatformError::Injection(e.to_string()))
    }

    fn click_mouse(&self, x: i32, y: i32, button: MouseButton, pressed: bool) -> PlatformResult<()> {
        self.move_mouse(x, y)?;
        let event_type = if pressed {
            BUTTON_PRESS_EVENT
        } else {
            BUTTON_RELEASE_EVENT
        };
        self.fake_input(event_type, button_code(button))
    }

    fn scroll(&self, dx: i32, dy: i32) -> PlatformResult<()> {
        // Wheel buttons: 4 up, 5 down, 6 left, 7 right.
        let vertical = if dy > 0 { 4 } else { 5 };
        let horizontal = if dx > 0 { 7 } else { 6 };
        self.tap_button(vertical, dy.unsigned_abs())?;
        self.tap_button(horizontal, dx.unsigned_abs())
    }
}

// ============================================================================
// Polling hooks
// ============================================================================

struct PollingGuard {
    name: &'static str,
    signal: StopSignal,
    handle: Option<thread::JoinHandle<()>>,
}

impl HookGuard for PollingGuard {
    fn uninstall(&self) {
        self.signal.trigger();
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

fn spawn_poller<F>(name: &'static str, mut poll: F) -> PlatformResult<Box<dyn HookGuard>>
where
    F: FnMut() -> PlatformResult<()> + Send + 'static,
{
    let signal = StopSignal::new();
    let thread_signal = signal.clone();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            info!("{name} installed");
            while !thread_signal.wait_timeout(HOOK_POLL_INTERVAL) {
                if let Err(e) = poll() {
                    warn!("{name} poll failed: {e}");
                }
            }
            info!("{name} removed");
        })
        .map_err(|e| PlatformError::HookInstall(e.to_string()))?;

    Ok(Box::new(PollingGuard {
        name,
        signal,
        handle: Some(handle),
    }))
}

fn query_keymap(session: &X11Session) -> PlatformResult<[u8; 32]> {
    Ok(session
        .conn
        .query_keymap()
        .map_err(request_err)?
        .reply()
        .map_err(request_err)?
        .keys)
}

fn pointer_state(session: &X11Session) -> PlatformResult<(i32, i32, ButtonState)> {
    let reply = session
        .conn
        .query_pointer(session.root)
        .map_err(request_err)?
        .reply()
        .map_err(request_err)?;

    let mask = u16::from(reply.mask);
    let mut buttons = ButtonState::empty();
    for (bit, flag) in [
        (KeyButMask::BUTTON1, ButtonState::LEFT),
        (KeyButMask::BUTTON2, ButtonState::MIDDLE),
        (KeyButMask::BUTTON3, ButtonState::RIGHT),
    ] {
        if mask & u16::from(bit) != 0 {
            buttons |= flag;
        }
    }
    Ok((i32::from(reply.root_x), i32::from(reply.root_y), buttons))
}

impl InputHook for Arc<X11Session> {
    fn install_keyboard(&self, sink: EventSink) -> PlatformResult<Box<dyn HookGuard>> {
        let session = self.clone();
        let mut previous = query_keymap(&session).map_err(|e| PlatformError::HookInstall(e.to_string()))?;

        spawn_poller("x11-keyboard-hook", move || {
            let keys = query_keymap(&session)?;
            for (byte, (old, new)) in previous.iter().zip(keys.iter()).enumerate() {
                let changed = old ^ new;
                for bit in (0..8).filter(|bit| changed & (1 << bit) != 0) {
                    let Ok(keycode) = u8::try_from(byte * 8 + bit) else {
                        continue;
                    };
                    let Some(vk) = session.keycode_to_vk(keycode) else {
                        trace!("Ignoring unmapped keycode {keycode}");
                        continue;
                    };
                    let event = if new & (1 << bit) != 0 {
                        InputEvent::key_press(vk)
                    } else {
                        InputEvent::key_release(vk)
                    };
                    sink(event);
                }
            }
            previous = keys;
            Ok(())
        })
    }

    fn install_mouse(&self, sink: EventSink) -> PlatformResult<Box<dyn HookGuard>> {
        let session = self.clone();
        let (mut x, mut y, mut buttons) =
            pointer_state(&session).map_err(|e| PlatformError::HookInstall(e.to_string()))?;

        spawn_poller("x11-mouse-hook", move || {
            let (nx, ny, nbuttons) = pointer_state(&session)?;
            if (nx, ny) != (x, y) {
                sink(InputEvent::mouse_move(nx, ny));
            }
            for (button, pressed) in buttons.transitions(nbuttons) {
                sink(InputEvent::mouse_click(nx, ny, button, pressed));
            }
            (x, y, buttons) = (nx, ny, nbuttons);
            Ok(())
        })
    }
}

// ============================================================================
// Capture
// ============================================================================

/// Screen or window grabs with GetImage, paced to the pipeline framerate
pub struct X11Capture {
    session: Arc<X11Session>,
    target: Window,
    pacer: FramePacer,
}

impl X11Capture {
    fn grab(&self) -> PlatformResult<TimestampedFrame> {
        let capture_err = |e: x11rb::errors::ReplyError| PlatformError::Capture(e.to_string());
        let geometry = self
            .session
            .conn
            .get_geometry(self.target)
            .map_err(request_err)?
            .reply()
            .map_err(capture_err)?;

        let timestamp_ns = now_ns();
        let image = self
            .session
            .conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                self.target,
                0,
                0,
                geometry.width,
                geometry.height,
                !0,
            )
            .map_err(request_err)?
            .reply()
            .map_err(capture_err)?;

        let (width, height) = (u32::from(geometry.width), u32::from(geometry.height));
        let mut pixels = image.data;
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(PlatformError::Capture(format!(
                "unsupported image depth {} ({} bytes for {width}x{height})",
                image.depth,
                pixels.len()
            )));
        }
        for px in pixels.chunks_exact_mut(4) {
            px[3] = 255;
        }

        Ok(TimestampedFrame {
            timestamp_ns,
            pixels,
            width,
            height,
            pixel_format: PixelFormat::Bgra32,
        })
    }
}

impl CaptureBackend for X11Capture {
    fn open(&mut self, pipeline: &PipelineDescription) -> PlatformResult<()> {
        self.target = match pipeline.source.window {
            Some(handle) => Window::try_from(handle.0)
                .map_err(|_| PlatformError::Capture(format!("invalid window handle {handle}")))?,
            None => self.session.root,
        };
        // Grab once so an unusable target fails here, not per frame.
        self.session
            .window_rect(self.target)
            .map_err(|e| PlatformError::Capture(e.to_string()))?;
        self.pacer.start(pipeline.max_framerate.interval());
        info!("X11 capture opened on window {:#x}", self.target);
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

/// X11 backend over one shared connection
pub struct X11Platform {
    session: Arc<X11Session>,
}

impl X11Platform {
    /// Connect to the display named by `DISPLAY`.
    pub fn connect() -> PlatformResult<Self> {
        Ok(Self {
            session: Arc::new(X11Session::connect()?),
        })
    }
}

impl PlatformBackend for X11Platform {
    fn name(&self) -> &'static str {
        "x11"
    }

    fn window_query(&self) -> Arc<dyn WindowQuery> {
        self.session.clone()
    }

    fn injector(&self) -> Arc<dyn InputInjector> {
        self.session.clone()
    }

    fn input_hook(&self) -> Arc<dyn InputHook> {
        Arc::new(self.session.clone())
    }

    fn capture_backend(&self) -> PlatformResult<Box<dyn CaptureBackend>> {
        Ok(Box::new(X11Capture {
            session: self.session.clone(),
            target: self.session.root,
            pacer: FramePacer::default(),
        }))
    }
}
