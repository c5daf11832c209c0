// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Component orchestrator
//!
//! A [`Desktop`] owns an ordered fleet of components. Starting is all or
//! nothing: if one component fails to start, every component is stopped,
//! joined and closed before the error is returned. Stopping, joining and
//! closing fan out to every member and carry on past individual failures,
//! which are collected instead of raised.

use log::{error, info, warn};

use crate::actor::{Action, Actor};
use crate::buffer::StaleDiscardChannel;
use crate::capture::ScreenCapture;
use crate::config::{Callbacks, ComponentConfig, DesktopConfig};
use crate::control::ControlPublisher;
use crate::error::{DesktopError, Result};
use crate::lifecycle::{ComponentThread, Lifecycle, LifecycleState, StopHandle};
use crate::platform::PlatformBackend;
use crate::window::WindowPublisher;

/// Fleet of lifecycle components driven as one
pub struct Desktop {
    thread: ComponentThread,
    components: Vec<Box<dyn Lifecycle>>,
    failures: Vec<String>,
    actor_requests: Option<StaleDiscardChannel<Action>>,
}

/// Builder for a [`Desktop`] with hand-picked components
#[derive(Default)]
pub struct DesktopBuilder {
    components: Vec<Box<dyn Lifecycle>>,
}

impl DesktopBuilder {
    /// Append a component; components start in insertion order.
    pub fn with_component(mut self, component: Box<dyn Lifecycle>) -> Self {
        self.components.push(component);
        self
    }

    pub fn build(self) -> Desktop {
        Desktop::new(self.components, None)
    }
}

impl Desktop {
    pub const NAME: &'static str = "desktop";

    fn new(components: Vec<Box<dyn Lifecycle>>, actor_requests: Option<StaleDiscardChannel<Action>>) -> Self {
        Self {
            thread: ComponentThread::new(Self::NAME),
            components,
            failures: Vec::new(),
            actor_requests,
        }
    }

    pub fn builder() -> DesktopBuilder {
        DesktopBuilder::default()
    }

    /// Build the components listed in `config` against `platform`.
    ///
    /// # Errors
    ///
    /// Propagates construction errors, e.g. [`DesktopError::NotFound`] for a
    /// capture window that does not exist.
    pub fn from_config(config: &DesktopConfig, platform: &dyn PlatformBackend, callbacks: Callbacks) -> Result<Self> {
        config.validate()?;

        let mut components: Vec<Box<dyn Lifecycle>> = Vec::with_capacity(config.components.len());
        let mut actor_requests = None;
        for entry in &config.components {
            let component: Box<dyn Lifecycle> = match entry {
                ComponentConfig::Capture(c) => {
                    Box::new(ScreenCapture::from_config(c, platform, callbacks.on_frame.clone())?)
                }
                ComponentConfig::WindowPublisher(c) => Box::new(WindowPublisher::new(
                    c,
                    platform.window_query(),
                    callbacks.on_window.clone(),
                )?),
                ComponentConfig::ControlPublisher(c) => Box::new(ControlPublisher::new(
                    c,
                    platform.input_hook(),
                    callbacks.on_keyboard.clone(),
                    callbacks.on_mouse.clone(),
                )?),
                ComponentConfig::Actor(c) => {
                    let actor = Actor::new(c, platform.window_query(), platform.injector())?;
                    actor_requests.get_or_insert_with(|| actor.requests());
                    Box::new(actor)
                }
            };
            components.push(component);
        }

        info!(
            "Desktop configured on {} with {} components",
            platform.name(),
            components.len()
        );
        Ok(Self::new(components, actor_requests))
    }

    /// Request channel of the first configured actor, if any
    pub fn actor_requests(&self) -> Option<StaleDiscardChannel<Action>> {
        self.actor_requests.clone()
    }

    /// Member failures collected by `join` and `close`
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    /// Name and state of every member, in start order
    pub fn states(&self) -> Vec<(String, LifecycleState)> {
        self.components
            .iter()
            .map(|c| (c.name().to_string(), c.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Tear down the whole fleet after a failed start.
    fn abort(&mut self) {
        for component in &self.components {
            component.stop();
        }
        for component in &mut self.components {
            let joined = component.join();
            let closed = component.close();
            record(&mut self.failures, component.name(), joined.and(closed));
        }
        self.thread.close().ok();
    }
}

fn record(failures: &mut Vec<String>, name: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!("{}: {name} failed during shutdown: {e}", Desktop::NAME);
        failures.push(format!("{name}: {e}"));
    }
}

impl Lifecycle for Desktop {
    fn name(&self) -> &str {
        self.thread.name()
    }

    fn state(&self) -> LifecycleState {
        self.thread.state()
    }

    fn start(&mut self) -> Result<()> {
        self.start_detached()?;
        self.thread.signal().wait();
        Ok(())
    }

    fn start_detached(&mut self) -> Result<()> {
        if self.state() != LifecycleState::Created {
            return Err(DesktopError::startup(
                Self::NAME,
                format!("cannot start from state {}", self.state()),
            ));
        }

        let failed = self
            .components
            .iter_mut()
            .find_map(|c| c.start_detached().err().map(|e| (c.name().to_string(), e)));
        if let Some((name, e)) = failed {
            error!("{}: {name} failed to start, aborting all components: {e}", Self::NAME);
            self.abort();
            return Err(e);
        }

        // Propagate a remote stop of the desktop to every member.
        let handles: Vec<StopHandle> = self.components.iter().map(|c| c.stop_handle()).collect();
        let spawned = self.thread.spawn(move |signal| {
            signal.wait();
            for handle in &handles {
                handle.stop();
            }
        });
        if let Err(e) = spawned {
            self.abort();
            return Err(e);
        }

        info!("{}: {} components running", Self::NAME, self.components.len());
        Ok(())
    }

    fn stop(&self) {
        self.thread.stop();
        for component in &self.components {
            component.stop();
        }
    }

    fn stop_handle(&self) -> StopHandle {
        self.thread.stop_handle()
    }

    fn join(&mut self) -> Result<()> {
        for component in &mut self.components {
            let joined = component.join();
            record(&mut self.failures, component.name(), joined);
        }
        record(&mut self.failures, Self::NAME, self.thread.join());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        for component in &mut self.components {
            let closed = component.close();
            record(&mut self.failures, component.name(), closed);
        }
        record(&mut self.failures, Self::NAME, self.thread.close());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::from_fn;
    use crate::config::{ActorConfig, CaptureConfig};
    use crate::event::{InputDevice, InputEvent};
    use crate::platform::stub::{test_window, StubPlatform};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// Component whose start outcome and loop are chosen by the test
    struct FakeMember {
        thread: ComponentThread,
        fail_start: bool,
        panic_in_loop: bool,
    }

    impl FakeMember {
        fn new(name: &str) -> Self {
            Self {
                thread: ComponentThread::new(name),
                fail_start: false,
                panic_in_loop: false,
            }
        }

        fn failing(name: &str) -> Self {
            Self {
                fail_start: true,
                ..Self::new(name)
            }
        }

        fn panicking(name: &str) -> Self {
            Self {
                panic_in_loop: true,
                ..Self::new(name)
            }
        }
    }

    impl Lifecycle for FakeMember {
        fn name(&self) -> &str {
            self.thread.name()
        }

        fn state(&self) -> LifecycleState {
            self.thread.state()
        }

        fn start(&mut self) -> Result<()> {
            self.thread.begin()?;
            self.thread.signal().wait();
            self.thread.finish();
            Ok(())
        }

        fn start_detached(&mut self) -> Result<()> {
            if self.fail_start {
                return Err(DesktopError::startup(self.thread.name(), "refused"));
            }
            let panic_in_loop = self.panic_in_loop;
            self.thread.spawn(move |signal| {
                signal.wait();
                if panic_in_loop {
                    panic!("member loop failed");
                }
            })
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

    fn fleet(members: Vec<FakeMember>) -> (Desktop, Vec<StopHandle>) {
        let handles = members.iter().map(|p| p.stop_handle()).collect();
        let desktop = members
            .into_iter()
            .fold(Desktop::builder(), |b, p| b.with_component(Box::new(p)))
            .build();
        (desktop, handles)
    }

    #[test]
    fn test_failed_start_aborts_started_components() {
        let (mut desktop, handles) = fleet(vec![FakeMember::new("c1"), FakeMember::failing("c2"), FakeMember::new("c3")]);

        let err = desktop.start_detached().unwrap_err();
        assert!(err.is_startup_failure());
        for handle in &handles {
            assert!(handle.state().is_terminated());
        }
        assert_eq!(handles[0].state(), LifecycleState::Closed);
        assert_eq!(desktop.state(), LifecycleState::Closed);
    }

    #[test]
    fn test_fan_out_lifecycle() {
        let (mut desktop, handles) = fleet(vec![FakeMember::new("a"), FakeMember::new("b"), FakeMember::new("c")]);

        desktop.start_detached().unwrap();
        assert!(handles.iter().all(|h| h.state() == LifecycleState::Running));
        assert_eq!(desktop.state(), LifecycleState::Running);

        desktop.stop();
        desktop.join().unwrap();
        assert!(handles.iter().all(|h| h.state() == LifecycleState::Stopped));
        desktop.close().unwrap();
        assert!(handles.iter().all(|h| h.state() == LifecycleState::Closed));
        assert!(desktop.failures().is_empty());
        assert_eq!(desktop.state(), LifecycleState::Closed);
    }

    #[test]
    fn test_member_failures_are_collected() {
        let (mut desktop, handles) = fleet(vec![FakeMember::new("a"), FakeMember::panicking("b"), FakeMember::new("c")]);

        desktop.start_detached().unwrap();
        desktop.stop_join_close().unwrap();

        assert_eq!(desktop.failures().len(), 1);
        assert!(desktop.failures()[0].starts_with("b:"));
        assert!(handles.iter().all(|h| h.state() == LifecycleState::Closed));
    }

    #[test]
    fn test_remote_stop_reaches_members() {
        let (mut desktop, handles) = fleet(vec![FakeMember::new("a"), FakeMember::new("b")]);
        desktop.start_detached().unwrap();

        let remote = desktop.stop_handle();
        thread::spawn(move || remote.stop()).join().unwrap();
        desktop.join().unwrap();
        assert!(handles.iter().all(|h| h.state() == LifecycleState::Stopped));
        desktop.close().unwrap();
    }

    #[test]
    fn test_blocking_start_returns_after_stop() {
        let (mut desktop, handles) = fleet(vec![FakeMember::new("a")]);
        let remote = desktop.stop_handle();
        let stopper = thread::spawn(move || {
            while remote.state() != LifecycleState::Running {
                thread::sleep(Duration::from_millis(1));
            }
            remote.stop();
        });

        desktop.start().unwrap();
        stopper.join().unwrap();
        desktop.join().unwrap();
        desktop.close().unwrap();
        assert_eq!(handles[0].state(), LifecycleState::Closed);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let (mut desktop, _) = fleet(vec![FakeMember::new("a")]);
        desktop.start_detached().unwrap();
        desktop.stop_join_close().unwrap();
        assert!(desktop.start_detached().unwrap_err().is_startup_failure());
    }

    #[test]
    fn test_from_config_on_stub_platform() {
        let platform = StubPlatform::new();
        platform.windows().set_active(Some(test_window("ZType", 1)));
        let mut config = DesktopConfig::default();
        config.update_actor(|a| a.target_window_title = Some("ZType".to_string()));

        let keys = Arc::new(AtomicUsize::new(0));
        let counter = keys.clone();
        let callbacks = Callbacks {
            on_keyboard: from_fn(move |_: InputEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            ..Callbacks::default()
        };
        let mut desktop = Desktop::from_config(&config, &platform, callbacks).unwrap();
        assert_eq!(desktop.len(), 4);

        desktop.start_detached().unwrap();
        let names: Vec<String> = desktop.states().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["capture", "window_publisher", "control_publisher", "actor"]);
        assert!(desktop.states().iter().all(|(_, s)| *s == LifecycleState::Running));

        assert!(platform.hook().emit(InputEvent::key_press(0x41)));
        assert_eq!(keys.load(Ordering::SeqCst), 1);
        assert!(desktop.actor_requests().is_some());

        desktop.stop_join_close().unwrap();
        assert!(desktop.failures().is_empty());
        assert!(!platform.hook().is_installed(InputDevice::Keyboard));
    }

    #[test]
    fn test_from_config_missing_capture_window() {
        let platform = StubPlatform::new();
        let config = DesktopConfig {
            components: vec![ComponentConfig::Capture(CaptureConfig {
                window_name: Some("Notepad".to_string()),
                ..Default::default()
            })],
        };
        let result = Desktop::from_config(&config, &platform, Callbacks::default());
        assert!(matches!(result, Err(DesktopError::NotFound(_))));
    }

    #[test]
    fn test_hook_failure_aborts_configured_fleet() {
        let platform = StubPlatform::new();
        platform.hook().refuse(InputDevice::Mouse);
        let mut config = DesktopConfig::default();
        config.components.push(ComponentConfig::Actor(ActorConfig::default()));

        let mut desktop = Desktop::from_config(&config, &platform, Callbacks::default()).unwrap();
        let err = desktop.start_detached().unwrap_err();
        assert!(err.is_startup_failure());
        assert!(desktop.states().iter().all(|(_, s)| *s == LifecycleState::Closed));
        assert!(!platform.hook().is_installed(InputDevice::Keyboard));
    }
}
