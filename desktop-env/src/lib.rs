// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! desktop-env
//!
//! This crate drives the real-time signals of a desktop session as one
//! controllable unit: captured frames, the active window, keyboard and mouse
//! events, and synthetic input injected back into the session.
//!
//! # Overview
//!
//! Every component runs on its own thread (or on the OS hook threads) and
//! follows the same [`Lifecycle`]: start, stop, join, close. A [`Desktop`]
//! starts a fleet of them all or nothing. Components only talk through
//! callbacks and two buffers:
//!
//! - **[`LatestValueSlot`]**: a fast frame producer always overwrites, so a
//!   slow consumer only ever sees the newest frame
//! - **[`StaleDiscardChannel`]**: bounded and FIFO, rejects when full and
//!   drops items that waited longer than `max_age`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Desktop                              │
//! │  start all or abort all, fan out stop / join / close         │
//! └─────────────────────────────────────────────────────────────┘
//!        │               │                 │               │
//!        ▼               ▼                 ▼               ▼
//! ┌─────────────┐ ┌───────────────┐ ┌─────────────────┐ ┌─────────┐
//! │ScreenCapture│ │WindowPublisher│ │ControlPublisher │ │  Actor  │
//! │ frame loop  │ │ change-only   │ │ keyboard/mouse  │ │ gated   │
//! │             │ │ polling       │ │ hooks           │ │ inject  │
//! └─────────────┘ └───────────────┘ └─────────────────┘ └─────────┘
//!        │               │                 │               ▲
//!        ▼               ▼                 ▼               │
//!  LatestValueSlot    on_window       on_keyboard   StaleDiscardChannel
//!        │                            on_mouse          <Action>
//!        ▼
//!     consumer
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  PlatformBackend (detect)                    │
//! │  win32  |  x11  |  stub                                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use desktop_env::{platform, Callbacks, Desktop, DesktopConfig, LatestValueSlot, Lifecycle};
//!
//! # fn main() -> desktop_env::Result<()> {
//! let frames = LatestValueSlot::new();
//! let callbacks = Callbacks {
//!     on_frame: frames.sink(),
//!     ..Callbacks::default()
//! };
//!
//! let platform = platform::detect();
//! let mut desktop = Desktop::from_config(&DesktopConfig::default(), platform.as_ref(), callbacks)?;
//! desktop.start_detached()?;
//!
//! if let Ok(frame) = frames.take(Duration::from_secs(1)) {
//!     println!("{}x{} frame", frame.width, frame.height);
//! }
//!
//! desktop.stop_join_close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`lifecycle`]: component protocol and stop signalling
//! - [`buffer`]: producer/consumer buffers
//! - [`capture`], [`window`], [`control`], [`actor`]: the components
//! - [`desktop`]: the orchestrator
//! - [`platform`]: OS backends behind one capability trait
//! - [`recorder`]: JSON Lines event recording

pub mod actor;
pub mod buffer;
pub mod callback;
pub mod capture;
pub mod config;
pub mod control;
pub mod desktop;
pub mod error;
pub mod event;
pub mod keymap;
pub mod lifecycle;
pub mod platform;
pub mod protocol;
pub mod recorder;
pub mod window;

pub use actor::{Action, ActionOutcome, Actor};
pub use buffer::{LatestValueSlot, StaleDiscardChannel};
pub use callback::{Callback, CallbackResult};
pub use capture::ScreenCapture;
pub use config::{Callbacks, ComponentConfig, DesktopConfig};
pub use control::ControlPublisher;
pub use desktop::{Desktop, DesktopBuilder};
pub use error::{DesktopError, Result};
pub use event::InputEvent;
pub use lifecycle::{Lifecycle, LifecycleState, StopHandle};
pub use platform::PlatformBackend;
pub use protocol::*;
pub use recorder::JsonlRecorder;
pub use window::WindowPublisher;
