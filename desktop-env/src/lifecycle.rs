// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Component lifecycle
//!
//! Every component follows the same protocol:
//!
//! ```text
//!   start / start_detached      stop            loop exits        close
//! Created ───────────────▶ Running ───▶ Stopping ──────────▶ Stopped ───▶ Closed
//! ```
//!
//! States only move forward. `stop` before `Running` is a no-op and `close`
//! is idempotent. Cancellation is cooperative: loops sleep on a
//! [`StopSignal`], so a `stop` wakes them immediately instead of waiting out
//! a poll interval.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{DesktopError, Result};

/// Lifecycle state of a component
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    /// Constructed, never started
    Created = 0,
    /// Main loop (or hooks) active
    Running = 1,
    /// Stop requested, loop not yet exited
    Stopping = 2,
    /// Loop exited
    Stopped = 3,
    /// Resources released
    Closed = 4,
}

impl LifecycleState {
    /// Whether the component has finished running (stopped or closed).
    pub fn is_terminated(&self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Closed)
    }
}

impl TryFrom<u8> for LifecycleState {
    type Error = &'static str;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(LifecycleState::Created),
            1 => Ok(LifecycleState::Running),
            2 => Ok(LifecycleState::Stopping),
            3 => Ok(LifecycleState::Stopped),
            4 => Ok(LifecycleState::Closed),
            _ => Err("Invalid lifecycle state value"),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Forward-only atomic state holder
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Created as u8))
    }

    pub fn get(&self) -> LifecycleState {
        LifecycleState::try_from(self.0.load(Ordering::SeqCst)).unwrap_or(LifecycleState::Closed)
    }

    /// Move to `next` if it is later than the current state.
    pub fn advance(&self, next: LifecycleState) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (next as u8 > current).then_some(next as u8)
            })
            .is_ok()
    }

    /// Move from exactly `from` to `to`.
    pub fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        to > from
            && self
                .0
                .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }
}

/// Cooperative cancellation flag that loops can sleep on
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter.
    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `timeout` unless the flag is raised first.
    ///
    /// Returns `true` if the flag is raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    /// Block until the flag is raised.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = cvar
            .wait_while(guard, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Thread-safe handle that stops a component from anywhere
///
/// Obtained from [`Lifecycle::stop_handle`]; usable while another thread is
/// blocked inside the component's `start`.
#[derive(Debug, Clone)]
pub struct StopHandle {
    name: Arc<str>,
    state: Arc<StateCell>,
    signal: StopSignal,
}

impl StopHandle {
    /// Request a stop. Only a running component reacts.
    pub fn stop(&self) {
        if self
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            info!("Stopping {}", self.name);
            self.signal.trigger();
        } else {
            debug!("Stop of {} ignored in state {}", self.name, self.state.get());
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }
}

/// Four-phase protocol implemented by every component
pub trait Lifecycle: Send {
    /// Component name used in logs and errors
    fn name(&self) -> &str;

    /// Current lifecycle state
    fn state(&self) -> LifecycleState;

    /// Run the main loop on the calling thread until stopped.
    fn start(&mut self) -> Result<()>;

    /// Start on a new thread and return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`DesktopError::StartupFailure`] if the component cannot reach
    /// a running state.
    fn start_detached(&mut self) -> Result<()>;

    /// Signal the component to stop. Safe to call repeatedly.
    fn stop(&self);

    /// Handle for stopping the component from another thread.
    fn stop_handle(&self) -> StopHandle;

    /// Wait for the thread spawned by `start_detached` to terminate.
    fn join(&mut self) -> Result<()>;

    /// Release threads, handles and hooks. Idempotent.
    fn close(&mut self) -> Result<()>;

    /// `stop`, `join` and `close` in sequence.
    fn stop_join_close(&mut self) -> Result<()> {
        self.stop();
        let joined = self.join();
        let closed = self.close();
        joined.and(closed)
    }
}

/// Thread, state and stop signal owned by one component
///
/// Concrete components delegate their lifecycle bookkeeping here and only
/// supply the loop body.
#[derive(Debug)]
pub struct ComponentThread {
    name: Arc<str>,
    state: Arc<StateCell>,
    signal: StopSignal,
    handle: Option<thread::JoinHandle<()>>,
}

impl ComponentThread {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            state: Arc::new(StateCell::new()),
            signal: StopSignal::new(),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    pub fn signal(&self) -> StopSignal {
        self.signal.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            name: self.name.clone(),
            state: self.state.clone(),
            signal: self.signal.clone(),
        }
    }

    /// Enter `Running`. Fails if the component was started before.
    pub fn begin(&self) -> Result<()> {
        if self
            .state
            .transition(LifecycleState::Created, LifecycleState::Running)
        {
            info!("{} running", self.name);
            Ok(())
        } else {
            Err(DesktopError::startup(
                self.name.as_ref(),
                format!("cannot start from state {}", self.state.get()),
            ))
        }
    }

    /// Mark the loop as exited.
    pub fn finish(&self) {
        if self.state.advance(LifecycleState::Stopped) {
            info!("{} stopped", self.name);
        }
    }

    /// Enter `Running` and run `body` on a new named thread.
    pub fn spawn<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        self.begin()?;

        let signal = self.signal.clone();
        let state = self.state.clone();
        let name = self.name.clone();
        let spawned = thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || {
                body(signal);
                if state.advance(LifecycleState::Stopped) {
                    info!("{name} stopped");
                }
            });

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.advance(LifecycleState::Stopped);
                Err(DesktopError::startup(self.name.as_ref(), e))
            }
        }
    }

    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Join the spawned thread, if any.
    pub fn join(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        let joined = handle.join();
        self.finish();
        joined.map_err(|_| {
            warn!("{} thread panicked", self.name);
            DesktopError::ThreadPanicked(self.name.to_string())
        })
    }

    /// Stop and reap a still-running thread, then enter `Closed`.
    pub fn close(&mut self) -> Result<()> {
        let joined = if self.handle.is_some() {
            self.stop();
            self.join()
        } else {
            Ok(())
        };

        if self.state.advance(LifecycleState::Closed) {
            debug!("{} closed", self.name);
        }
        joined
    }
}

impl Drop for ComponentThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.close().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_state_only_moves_forward() {
        let cell = StateCell::new();
        assert!(cell.advance(LifecycleState::Running));
        assert!(cell.advance(LifecycleState::Stopped));
        assert!(!cell.advance(LifecycleState::Stopping));
        assert!(!cell.advance(LifecycleState::Running));
        assert_eq!(cell.get(), LifecycleState::Stopped);
        assert!(cell.advance(LifecycleState::Closed));
        assert!(!cell.advance(LifecycleState::Closed));
    }

    #[test]
    fn test_transition_requires_exact_source() {
        let cell = StateCell::new();
        assert!(!cell.transition(LifecycleState::Running, LifecycleState::Stopping));
        assert_eq!(cell.get(), LifecycleState::Created);
        assert!(cell.transition(LifecycleState::Created, LifecycleState::Running));
        assert!(!cell.transition(LifecycleState::Running, LifecycleState::Created));
    }

    #[test]
    fn test_state_try_from() {
        assert_eq!(LifecycleState::try_from(2).unwrap(), LifecycleState::Stopping);
        assert_eq!(LifecycleState::try_from(9), Err("Invalid lifecycle state value"));
    }

    #[test]
    fn test_stop_signal_wakes_sleeper() {
        let signal = StopSignal::new();
        let remote = signal.clone();
        let started = Instant::now();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.trigger();
        });
        assert!(signal.wait_timeout(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();
    }

    #[test]
    fn test_stop_signal_times_out() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        assert!(!signal.is_triggered());
    }

    #[test]
    fn test_stop_before_running_is_noop() {
        let component = ComponentThread::new("idle");
        component.stop();
        assert_eq!(component.state(), LifecycleState::Created);
        assert!(!component.signal().is_triggered());
    }

    #[test]
    fn test_spawn_stop_join_close() {
        let mut component = ComponentThread::new("worker");
        component
            .spawn(|signal| while !signal.wait_timeout(Duration::from_millis(50)) {})
            .unwrap();
        assert_eq!(component.state(), LifecycleState::Running);

        component.stop();
        component.stop();
        component.join().unwrap();
        assert_eq!(component.state(), LifecycleState::Stopped);

        component.close().unwrap();
        component.close().unwrap();
        assert_eq!(component.state(), LifecycleState::Closed);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let mut component = ComponentThread::new("once");
        component.spawn(|_| {}).unwrap();
        component.join().unwrap();
        let err = component.spawn(|_| {}).unwrap_err();
        assert!(err.is_startup_failure());
    }

    #[test]
    fn test_panicking_thread_is_reported_by_join() {
        let mut component = ComponentThread::new("broken");
        component.spawn(|_| panic!("loop body failed")).unwrap();
        let err = component.join().unwrap_err();
        assert!(matches!(err, DesktopError::ThreadPanicked(_)));
        assert_eq!(component.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_close_without_start() {
        let mut component = ComponentThread::new("never");
        component.close().unwrap();
        assert_eq!(component.state(), LifecycleState::Closed);
    }

    #[test]
    fn test_close_reaps_running_thread() {
        let mut component = ComponentThread::new("leaky");
        component
            .spawn(|signal| signal.wait())
            .unwrap();
        component.close().unwrap();
        assert_eq!(component.state(), LifecycleState::Closed);
    }
}
