// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Input injection gated on the active window
//!
//! An [`Action`] expands into units of atomic [`InputStep`]s (a key tap, a
//! click) that are injected one by one with a fixed delay in between. Before
//! each action the active window is checked against the target title; on a
//! mismatch the action is dropped, not queued or retried. A step that fails
//! is logged and the remaining steps still run.
//!
//! A stop request is honoured between units only, so a pressed key or
//! button is always released.

use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::buffer::{SendError, StaleDiscardChannel};
use crate::config::ActorConfig;
use crate::error::{DesktopError, Result};
use crate::event::MouseButton;
use crate::keymap::char_to_vk;
use crate::lifecycle::{ComponentThread, Lifecycle, LifecycleState, StopHandle, StopSignal};
use crate::platform::{InputInjector, PlatformError, PlatformResult, WindowQuery};

/// How long the request loop waits before rechecking the stop signal
const REQUEST_TIMEOUT: Duration = Duration::from_millis(100);

/// Request handled by the actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Tap one key per character
    TypeText(String),
    /// Press and release one virtual key
    KeyTap(u32),
    MoveMouse { x: i32, y: i32 },
    /// Press and release `button` at a position
    Click { x: i32, y: i32, button: MouseButton },
    Scroll { dx: i32, dy: i32 },
}

/// Atomic unit of injected input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStep {
    Press(u32),
    Release(u32),
    Move { x: i32, y: i32 },
    Button { x: i32, y: i32, button: MouseButton, pressed: bool },
    Scroll { dx: i32, dy: i32 },
    /// Character without a key mapping; fails when injected
    Unmapped(char),
}

impl InputStep {
    fn inject(self, injector: &dyn InputInjector) -> PlatformResult<()> {
        match self {
            InputStep::Press(vk) => injector.press_key(vk),
            InputStep::Release(vk) => injector.release_key(vk),
            InputStep::Move { x, y } => injector.move_mouse(x, y),
            InputStep::Button { x, y, button, pressed } => injector.click_mouse(x, y, button, pressed),
            InputStep::Scroll { dx, dy } => injector.scroll(dx, dy),
            InputStep::Unmapped(c) => Err(PlatformError::Unsupported(format!(
                "no key mapping for character {c:?}"
            ))),
        }
    }
}

fn tap(vk: u32) -> Vec<InputStep> {
    vec![InputStep::Press(vk), InputStep::Release(vk)]
}

impl Action {
    /// Expand into units that are never split by a stop request.
    pub fn units(&self) -> Vec<Vec<InputStep>> {
        match self {
            Action::TypeText(text) => text
                .chars()
                .map(|c| char_to_vk(c).map_or_else(|| vec![InputStep::Unmapped(c)], tap))
                .collect(),
            Action::KeyTap(vk) => vec![tap(*vk)],
            Action::MoveMouse { x, y } => vec![vec![InputStep::Move { x: *x, y: *y }]],
            Action::Click { x, y, button } => vec![[true, false]
                .into_iter()
                .map(|pressed| InputStep::Button {
                    x: *x,
                    y: *y,
                    button: *button,
                    pressed,
                })
                .collect()],
            Action::Scroll { dx, dy } => vec![vec![InputStep::Scroll { dx: *dx, dy: *dy }]],
        }
    }

    /// Expand into the steps injected for this action.
    pub fn steps(&self) -> Vec<InputStep> {
        self.units().into_iter().flatten().collect()
    }
}

/// Result of one [`Actor::perform_action`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The active window did not match the target, or the actor was
    /// already stopped
    Skipped,
    /// Steps were injected; `failed` of them returned an error
    Performed { steps: usize, failed: usize },
}

#[derive(Default)]
struct Counters {
    performed: AtomicU64,
    skipped: AtomicU64,
}

struct Executor {
    query: Arc<dyn WindowQuery>,
    injector: Arc<dyn InputInjector>,
    target: Option<String>,
    step_delay: Duration,
    counters: Counters,
}

impl Executor {
    /// Point-in-time check of the active window.
    fn gate_open(&self) -> bool {
        let Some(target) = self.target.as_deref() else {
            return true;
        };

        match self.query.active_window() {
            Ok(Some(window)) if window.title.contains(target) => true,
            Ok(Some(window)) => {
                debug!("{}: active window '{}' is not '{target}'", Actor::NAME, window.title);
                false
            }
            Ok(None) => {
                debug!("{}: no active window", Actor::NAME);
                false
            }
            Err(e) => {
                warn!("{}: window query failed: {e}", Actor::NAME);
                false
            }
        }
    }

    fn perform(&self, action: &Action, signal: &StopSignal) -> ActionOutcome {
        if signal.is_triggered() {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("{}: stopped, dropping {action:?}", Actor::NAME);
            return ActionOutcome::Skipped;
        }
        if !self.gate_open() {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("{}: skipped {action:?}", Actor::NAME);
            return ActionOutcome::Skipped;
        }

        let mut steps = 0;
        let mut failed = 0;
        for (i, unit) in action.units().into_iter().enumerate() {
            if i > 0 && signal.wait_timeout(self.step_delay) {
                debug!("{}: stop requested, abandoning {action:?}", Actor::NAME);
                break;
            }

            for (j, step) in unit.into_iter().enumerate() {
                if j > 0 {
                    thread::sleep(self.step_delay);
                }
                trace!("{}: {step:?}", Actor::NAME);
                steps += 1;
                if let Err(e) = step.inject(self.injector.as_ref()) {
                    warn!("{}: step {step:?} failed: {e}", Actor::NAME);
                    failed += 1;
                }
            }
        }

        self.counters.performed.fetch_add(1, Ordering::Relaxed);
        ActionOutcome::Performed { steps, failed }
    }

    fn run(&self, requests: &StaleDiscardChannel<Action>, signal: &StopSignal) {
        while !signal.is_triggered() {
            if let Ok(action) = requests.receive(REQUEST_TIMEOUT) {
                self.perform(&action, signal);
            }
        }
    }
}

/// Window-gated input injector component
pub struct Actor {
    thread: ComponentThread,
    executor: Arc<Executor>,
    requests: StaleDiscardChannel<Action>,
}

impl Actor {
    pub const NAME: &'static str = "actor";

    /// # Errors
    ///
    /// [`DesktopError::InvalidConfig`] if `request_capacity` is zero.
    pub fn new(
        config: &ActorConfig,
        query: Arc<dyn WindowQuery>,
        injector: Arc<dyn InputInjector>,
    ) -> Result<Self> {
        if config.request_capacity == 0 {
            return Err(DesktopError::InvalidConfig(
                "actor request_capacity must be positive".to_string(),
            ));
        }

        if let Some(target) = &config.target_window_title {
            info!("{}: acting only on windows titled '{target}'", Self::NAME);
        }

        Ok(Self {
            thread: ComponentThread::new(Self::NAME),
            executor: Arc::new(Executor {
                query,
                injector,
                target: config.target_window_title.clone(),
                step_delay: config.step_delay(),
                counters: Counters::default(),
            }),
            requests: StaleDiscardChannel::new(config.request_capacity, config.max_request_age()),
        })
    }

    /// Execute `action` now on the calling thread, if the gate is open.
    ///
    /// Once the actor has been stopped every action is skipped.
    pub fn perform_action(&self, action: &Action) -> ActionOutcome {
        self.executor.perform(action, &self.thread.signal())
    }

    /// Sending side of the request channel consumed by the actor's loop.
    pub fn requests(&self) -> StaleDiscardChannel<Action> {
        self.requests.clone()
    }

    /// Actions executed (gate open)
    pub fn performed(&self) -> u64 {
        self.executor.counters.performed.load(Ordering::Relaxed)
    }

    /// Actions dropped by the gate
    pub fn skipped(&self) -> u64 {
        self.executor.counters.skipped.load(Ordering::Relaxed)
    }
}

impl Lifecycle for Actor {
    fn name(&self) -> &str {
        self.thread.name()
    }

    fn state(&self) -> LifecycleState {
        self.thread.state()
    }

    fn start(&mut self) -> Result<()> {
        self.thread.begin()?;
        self.executor.run(&self.requests, &self.thread.signal());
        self.thread.finish();
        Ok(())
    }

    fn start_detached(&mut self) -> Result<()> {
        let executor = self.executor.clone();
        let requests = self.requests.clone();
        self.thread.spawn(move |signal| executor.run(&requests, &signal))
    }

    fn stop(&self) {
        self.thread.stop();
    }

    fn stop_handle(&self) -> StopHandle {
        self.thread.stop_handle()
    }

    fn join(&mut self) -> Result<()> {
        self.thread.join()
    }

    fn close(&mut self) -> Result<()> {
        self.thread.close()
    }
}

/// Forward JSON [`Action`] lines from `reader` into `requests` until EOF.
///
/// Blank and malformed lines are skipped, as are actions rejected by a
/// full channel. Returns the number of actions enqueued.
///
/// # Errors
///
/// Fails only if reading from `reader` fails.
pub fn forward_requests(reader: impl BufRead, requests: &StaleDiscardChannel<Action>) -> Result<usize> {
    let mut sent = 0;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Action>(&line) {
            Ok(action) => match requests.try_send(action) {
                Ok(()) => sent += 1,
                Err(SendError::Full(action)) => {
                    warn!("{}: request channel full, dropping {action:?}", Actor::NAME);
                }
            },
            Err(e) => warn!("{}: ignoring request '{line}': {e}", Actor::NAME),
        }
    }
    Ok(sent)
}
