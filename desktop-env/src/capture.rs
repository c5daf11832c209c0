// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Screen capture component
//!
//! Opens a capture backend with a [`PipelineDescription`] and moves every
//! frame it produces into the `on_frame` callback. Pair it with a
//! [`LatestValueSlot`](crate::buffer::LatestValueSlot) sink so a slow
//! consumer only ever sees the newest frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, trace};

use crate::callback::{dispatch, Callback};
use crate::config::CaptureConfig;
use crate::error::{DesktopError, Result};
use crate::lifecycle::{ComponentThread, Lifecycle, LifecycleState, StopHandle, StopSignal};
use crate::platform::{construct_pipeline, CaptureBackend, PipelineDescription, PlatformBackend};
use crate::protocol::TimestampedFrame;

/// Longest wait for one frame, and so the stop latency of the loop
const FRAME_TIMEOUT: Duration = Duration::from_millis(100);

type SharedBackend = Arc<Mutex<Box<dyn CaptureBackend>>>;

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    dropped: AtomicU64,
}

struct FrameLoop {
    name: Arc<str>,
    backend: SharedBackend,
    on_frame: Callback<TimestampedFrame>,
    counters: Arc<Counters>,
}

impl FrameLoop {
    fn run(&self, signal: &StopSignal) {
        while !signal.is_triggered() {
            let next = self
                .backend
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .next_frame(FRAME_TIMEOUT);

            match next {
                Ok(Some(frame)) => {
                    self.counters.frames.fetch_add(1, Ordering::Relaxed);
                    trace!("{}: frame {}x{} at {}", self.name, frame.width, frame.height, frame.timestamp_ns);
                    dispatch(&self.name, &self.on_frame, frame);
                }
                Ok(None) => {}
                Err(e) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("{}: {}", self.name, DesktopError::TransientCapture(e.to_string()));
                }
            }
        }
    }
}

/// Frame producer driven by a capture backend
pub struct ScreenCapture {
    thread: ComponentThread,
    pipeline: PipelineDescription,
    frame_loop: Arc<FrameLoop>,
}

impl ScreenCapture {
    pub const NAME: &'static str = "capture";

    pub fn new(
        pipeline: PipelineDescription,
        backend: Box<dyn CaptureBackend>,
        on_frame: Callback<TimestampedFrame>,
    ) -> Self {
        Self {
            thread: ComponentThread::new(Self::NAME),
            pipeline,
            frame_loop: Arc::new(FrameLoop {
                name: Arc::from(Self::NAME),
                backend: Arc::new(Mutex::new(backend)),
                on_frame,
                counters: Arc::new(Counters::default()),
            }),
        }
    }

    /// Resolve `config` into a pipeline and a backend from `platform`.
    ///
    /// # Errors
    ///
    /// [`DesktopError::NotFound`] if the configured window does not exist.
    pub fn from_config(
        config: &CaptureConfig,
        platform: &dyn PlatformBackend,
        on_frame: Callback<TimestampedFrame>,
    ) -> Result<Self> {
        let pipeline = construct_pipeline(config, platform.window_query().as_ref())?;
        let backend = platform.capture_backend()?;
        Ok(Self::new(pipeline, backend, on_frame))
    }

    pub fn pipeline(&self) -> &PipelineDescription {
        &self.pipeline
    }

    /// Frames delivered to `on_frame`
    pub fn frames(&self) -> u64 {
        self.frame_loop.counters.frames.load(Ordering::Relaxed)
    }

    /// Frames lost to transient capture errors
    pub fn dropped(&self) -> u64 {
        self.frame_loop.counters.dropped.load(Ordering::Relaxed)
    }

    fn open(&self) -> Result<()> {
        if self.state() != LifecycleState::Created {
            return Err(DesktopError::startup(
                Self::NAME,
                format!("cannot start from state {}", self.state()),
            ));
        }

        info!("{}: opening pipeline: {}", Self::NAME, self.pipeline);
        self.frame_loop
            .backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open(&self.pipeline)
            .map_err(|e| {
                error!("{}: pipeline failed to start: {e}", Self::NAME);
                DesktopError::startup(Self::NAME, e)
            })
    }
}

impl Lifecycle for ScreenCapture {
    fn name(&self) -> &str {
        self.thread.name()
    }

    fn state(&self) -> LifecycleState {
        self.thread.state()
    }

    fn start(&mut self) -> Result<()> {
        self.open()?;
        self.thread.begin()?;
        self.frame_loop.run(&self.thread.signal());
        self.thread.finish();
        Ok(())
    }

    fn start_detached(&mut self) -> Result<()> {
        self.open()?;
        let frame_loop = self.frame_loop.clone();
        self.thread.spawn(move |signal| frame_loop.run(&signal))
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
        let closed = self.thread.close();
        self.frame_loop
            .backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::LatestValueSlot;
    use crate::platform::stub::SyntheticCapture;
    use crate::platform::{CaptureSource, Framerate, PlatformError, PlatformResult, SourceElement};

    fn pipeline(fps: u32) -> PipelineDescription {
        let source = CaptureSource {
            element: SourceElement::TestPattern,
            window: None,
            monitor_index: None,
        };
        PipelineDescription::new(source, Framerate::new(fps, 1).unwrap())
    }

    /// Backend failing every other frame
    struct Flaky {
        inner: SyntheticCapture,
        calls: u64,
    }

    impl CaptureBackend for Flaky {
        fn open(&mut self, pipeline: &PipelineDescription) -> PlatformResult<()> {
            self.inner.open(pipeline)
        }

        fn next_frame(&mut self, timeout: Duration) -> PlatformResult<Option<TimestampedFrame>> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(PlatformError::Capture("buffer lost".to_string()));
            }
            self.inner.next_frame(timeout)
        }

        fn close(&mut self) {
            self.inner.close();
        }
    }

    #[test]
    fn test_frames_reach_latest_slot() {
        let slot = LatestValueSlot::new();
        let mut capture = ScreenCapture::new(pipeline(200), Box::new(SyntheticCapture::new(16, 8)), slot.sink());

        capture.start_detached().unwrap();
        let frame = slot.take(Duration::from_secs(5)).unwrap();
        assert_eq!((frame.width, frame.height), (16, 8));
        assert_eq!(frame.pixels.len(), frame.expected_len());

        capture.stop_join_close().unwrap();
        assert!(capture.frames() >= 1);
        assert_eq!(capture.state(), LifecycleState::Closed);
    }

    #[test]
    fn test_open_failure_is_startup_failure() {
        let backend = SyntheticCapture::new(4, 4).failing_open();
        let mut capture = ScreenCapture::new(pipeline(30), Box::new(backend), crate::callback::noop());

        let err = capture.start_detached().unwrap_err();
        assert!(err.is_startup_failure());
        assert_eq!(capture.state(), LifecycleState::Created);
        capture.close().unwrap();
        assert_eq!(capture.state(), LifecycleState::Closed);
    }

    #[test]
    fn test_transient_errors_do_not_stop_the_loop() {
        let backend = Flaky {
            inner: SyntheticCapture::new(4, 4),
            calls: 0,
        };
        let slot = LatestValueSlot::new();
        let mut capture = ScreenCapture::new(pipeline(500), Box::new(backend), slot.sink());

        capture.start_detached().unwrap();
        for _ in 0..3 {
            slot.take(Duration::from_secs(5)).unwrap();
        }
        capture.stop_join_close().unwrap();
        assert!(capture.dropped() >= 2);
        assert!(capture.frames() >= 3);
    }

    #[test]
    fn test_restart_is_rejected() {
        let mut capture = ScreenCapture::new(pipeline(30), Box::new(SyntheticCapture::new(4, 4)), crate::callback::noop());
        capture.start_detached().unwrap();
        capture.stop_join_close().unwrap();
        assert!(capture.start_detached().unwrap_err().is_startup_failure());
    }
}
