// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Keyboard and mouse event publisher
//!
//! Installs the platform's global input hooks and hands every translated
//! [`InputEvent`] to a user callback on the hook's own delivery thread.
//! A callback that fails or panics is logged for that event only; the hook
//! stays installed.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, trace, warn};

use crate::callback::{dispatch, Callback};
use crate::config::ControlPublisherConfig;
use crate::error::{DesktopError, Result};
use crate::event::{InputDevice, InputEvent};
use crate::lifecycle::{ComponentThread, Lifecycle, LifecycleState, StopHandle};
use crate::platform::{EventSink, HookGuard, InputHook, PlatformResult};

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    failures: AtomicU64,
}

#[derive(Default)]
struct Guards(Mutex<Vec<Box<dyn HookGuard>>>);

impl Guards {
    fn push(&self, guard: Box<dyn HookGuard>) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(guard);
    }

    fn uninstall_all(&self) {
        for guard in self.0.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            guard.uninstall();
        }
    }

    /// Join and drop every guard, returning the first failure.
    fn join_all(&self) -> PlatformResult<()> {
        let guards = mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner));
        let mut first = Ok(());
        for mut guard in guards {
            if let Err(e) = guard.join() {
                warn!("{}: hook thread ended with error: {e}", ControlPublisher::NAME);
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }
}

/// Hook-driven input event publisher
pub struct ControlPublisher {
    thread: ComponentThread,
    config: ControlPublisherConfig,
    hook: Arc<dyn InputHook>,
    on_keyboard: Callback<InputEvent>,
    on_mouse: Callback<InputEvent>,
    counters: Arc<Counters>,
    guards: Arc<Guards>,
}

impl ControlPublisher {
    pub const NAME: &'static str = "control_publisher";

    /// # Errors
    ///
    /// [`DesktopError::InvalidConfig`] if both devices are disabled.
    pub fn new(
        config: &ControlPublisherConfig,
        hook: Arc<dyn InputHook>,
        on_keyboard: Callback<InputEvent>,
        on_mouse: Callback<InputEvent>,
    ) -> Result<Self> {
        if !config.keyboard && !config.mouse {
            return Err(DesktopError::InvalidConfig(
                "control publisher needs keyboard or mouse enabled".to_string(),
            ));
        }

        Ok(Self {
            thread: ComponentThread::new(Self::NAME),
            config: config.clone(),
            hook,
            on_keyboard,
            on_mouse,
            counters: Arc::new(Counters::default()),
            guards: Arc::new(Guards::default()),
        })
    }

    /// Events handed to a callback that returned successfully
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    /// Events whose callback failed or panicked
    pub fn callback_failures(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }

    fn sink(&self, device: InputDevice) -> EventSink {
        let name = format!("{}.{}", Self::NAME, device.as_str());
        let callback = match device {
            InputDevice::Keyboard => self.on_keyboard.clone(),
            InputDevice::Mouse => self.on_mouse.clone(),
        };
        let counters = self.counters.clone();

        Arc::new(move |event: InputEvent| {
            trace!("{name}: {event:?}");
            if dispatch(&name, &callback, event) {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        })
    }

    /// Install the enabled hooks. A partial install is rolled back.
    fn install(&self) -> Result<()> {
        if self.state() != LifecycleState::Created {
            return Err(DesktopError::startup(
                Self::NAME,
                format!("cannot start from state {}", self.state()),
            ));
        }

        for device in [InputDevice::Keyboard, InputDevice::Mouse] {
            let enabled = match device {
                InputDevice::Keyboard => self.config.keyboard,
                InputDevice::Mouse => self.config.mouse,
            };
            if !enabled {
                continue;
            }

            let sink = self.sink(device);
            let installed = match device {
                InputDevice::Keyboard => self.hook.install_keyboard(sink),
                InputDevice::Mouse => self.hook.install_mouse(sink),
            };
            match installed {
                Ok(guard) => {
                    debug!("{}: {} hook installed", Self::NAME, device.as_str());
                    self.guards.push(guard);
                }
                Err(e) => {
                    error!("{}: {} hook failed to install: {e}", Self::NAME, device.as_str());
                    self.guards.uninstall_all();
                    self.guards.join_all().ok();
                    return Err(DesktopError::startup(Self::NAME, e));
                }
            }
        }
        Ok(())
    }
}

impl Lifecycle for ControlPublisher {
    fn name(&self) -> &str {
        self.thread.name()
    }

    fn state(&self) -> LifecycleState {
        self.thread.state()
    }

    fn start(&mut self) -> Result<()> {
        self.install()?;
        if let Err(e) = self.thread.begin() {
            self.guards.uninstall_all();
            self.guards.join_all().ok();
            return Err(e);
        }

        self.thread.signal().wait();
        self.guards.uninstall_all();
        let joined = self.guards.join_all();
        self.thread.finish();
        joined.map_err(DesktopError::from)
    }

    fn start_detached(&mut self) -> Result<()> {
        self.install()?;

        // The hooks deliver on their own threads; this one only waits for
        // the stop signal so that a remote `StopHandle` also uninstalls.
        let guards = self.guards.clone();
        let spawned = self.thread.spawn(move |signal| {
            signal.wait();
            guards.uninstall_all();
        });
        if spawned.is_err() {
            self.guards.uninstall_all();
            self.guards.join_all().ok();
        }
        spawned
    }

    fn stop(&self) {
        self.thread.stop();
        if self.state() >= LifecycleState::Stopping {
            self.guards.uninstall_all();
        }
    }

    fn stop_handle(&self) -> StopHandle {
        self.thread.stop_handle()
    }

    fn join(&mut self) -> Result<()> {
        let waiter = self.thread.join();
        if self.state() < LifecycleState::Stopped {
            return waiter;
        }
        let hooks = self.guards.join_all().map_err(DesktopError::from);
        waiter.and(hooks)
    }

    fn close(&mut self) -> Result<()> {
        let closed = self.thread.close();
        self.guards.uninstall_all();
        let hooks = self.guards.join_all().map_err(DesktopError::from);
        closed.and(hooks)
    }
}
