// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

use std::thread;
use std::time::{Duration, Instant};

/// Frame pacing for backends that grab on demand
///
/// Enforces the pipeline's max framerate: a grab is only allowed once per
/// interval, and a late grab never triggers catch-up bursts.
#[derive(Debug, Default)]
pub(crate) struct FramePacer {
    interval: Duration,
    next_due: Option<Instant>,
}

impl FramePacer {
    pub(crate) fn start(&mut self, interval: Duration) {
        self.interval = interval;
        self.next_due = Some(Instant::now());
    }

    pub(crate) fn stop(&mut self) {
        self.next_due = None;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    /// Sleep until the next grab is due, or for `timeout` if that is sooner.
    ///
    /// Returns `true` when a grab is due. Not running counts as not due.
    pub(crate) fn wait(&mut self, timeout: Duration) -> bool {
        let Some(due) = self.next_due else {
            return false;
        };

        let wait = due.saturating_duration_since(Instant::now());
        if wait > timeout {
            thread::sleep(timeout);
            return false;
        }
        thread::sleep(wait);
        self.next_due = Some((due + self.interval).max(Instant::now()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacer_not_started() {
        let mut pacer = FramePacer::default();
        assert!(!pacer.is_running());
        assert!(!pacer.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_pacer_limits_rate() {
        let mut pacer = FramePacer::default();
        pacer.start(Duration::from_millis(200));
        assert!(pacer.wait(Duration::from_millis(10)));
        assert!(!pacer.wait(Duration::from_millis(10)));
        pacer.stop();
        assert!(!pacer.is_running());
    }
}
