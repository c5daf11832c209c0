// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Active window publisher
//!
//! Polls the active window at a fixed rate and publishes it only when its
//! title changes. Ticks with no active window, or a failed query, are
//! skipped without resetting the last published title.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::callback::{dispatch, Callback};
use crate::config::WindowPublisherConfig;
use crate::error::{DesktopError, Result};
use crate::lifecycle::{ComponentThread, Lifecycle, LifecycleState, StopHandle, StopSignal};
use crate::platform::WindowQuery;
use crate::protocol::WindowInfo;

/// Title change filter
#[derive(Debug, Default)]
pub struct WindowChangeDetector {
    last_title: Option<String>,
}

impl WindowChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `window` should be published. Records its title if so.
    pub fn observe(&mut self, window: &WindowInfo) -> bool {
        if self.last_title.as_deref() == Some(window.title.as_str()) {
            return false;
        }
        self.last_title = Some(window.title.clone());
        true
    }

    pub fn last_title(&self) -> Option<&str> {
        self.last_title.as_deref()
    }
}

struct Poller {
    name: Arc<str>,
    query: Arc<dyn WindowQuery>,
    on_window: Callback<WindowInfo>,
    interval: Duration,
    verbose: bool,
    published: Arc<AtomicU64>,
}

impl Poller {
    fn run(&self, signal: &StopSignal) {
        let mut detector = WindowChangeDetector::new();
        loop {
            self.tick(&mut detector);
            if signal.wait_timeout(self.interval) {
                break;
            }
        }
    }

    fn tick(&self, detector: &mut WindowChangeDetector) {
        let window = match self.query.active_window() {
            Ok(Some(window)) => window,
            Ok(None) => {
                debug!("{}: no active window, skipping tick", self.name);
                return;
            }
            Err(e) => {
                warn!("{}: window query failed, skipping tick: {e}", self.name);
                return;
            }
        };

        if !detector.observe(&window) {
            return;
        }
        if self.verbose {
            info!("{}: active window '{}' {:?}", self.name, window.title, window.rect);
        } else {
            debug!("{}: active window '{}'", self.name, window.title);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        dispatch(&self.name, &self.on_window, window);
    }
}

/// Change-triggered active window publisher
pub struct WindowPublisher {
    thread: ComponentThread,
    poller: Arc<Poller>,
}

impl WindowPublisher {
    pub const NAME: &'static str = "window_publisher";

    /// # Errors
    ///
    /// [`DesktopError::InvalidConfig`] if `fps` is zero.
    pub fn new(
        config: &WindowPublisherConfig,
        query: Arc<dyn WindowQuery>,
        on_window: Callback<WindowInfo>,
    ) -> Result<Self> {
        if config.fps == 0 {
            return Err(DesktopError::InvalidConfig(
                "window publisher fps must be positive".to_string(),
            ));
        }

        Ok(Self {
            thread: ComponentThread::new(Self::NAME),
            poller: Arc::new(Poller {
                name: Arc::from(Self::NAME),
                query,
                on_window,
                interval: Duration::from_secs(1) / config.fps,
                verbose: config.verbose,
                published: Arc::new(AtomicU64::new(0)),
            }),
        })
    }

    /// Time between two polls
    pub fn interval(&self) -> Duration {
        self.poller.interval
    }

    /// Number of windows published so far
    pub fn published(&self) -> u64 {
        self.poller.published.load(Ordering::Relaxed)
    }
}

impl Lifecycle for WindowPublisher {
    fn name(&self) -> &str {
        self.thread.name()
    }

    fn state(&self) -> LifecycleState {
        self.thread.state()
    }

    fn start(&mut self) -> Result<()> {
        self.thread.begin()?;
        self.poller.run(&self.thread.signal());
        self.thread.finish();
        Ok(())
    }

    fn start_detached(&mut self) -> Result<()> {
        let poller = self.poller.clone();
        self.thread.spawn(move |signal| poller.run(&signal))
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
