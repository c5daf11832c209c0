// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for desktop-env
//!
//! This file contains end-to-end tests for:
//! - Buffers between producers and consumers
//! - Component fleets built from configuration on the stub platform
//! - Recording and replaying input events

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use desktop_env::buffer::{DedupSender, RecvError, SendOutcome};
use desktop_env::callback::from_fn;
use desktop_env::config::{ActorConfig, CaptureConfig, ControlPublisherConfig, WindowPublisherConfig};
use desktop_env::event::{replay_all, MouseButton};
use desktop_env::keymap::vk;
use desktop_env::platform::stub::{test_window, InjectedInput, StubPlatform};
use desktop_env::recorder::load_input_events;
use desktop_env::{
    Action, Callbacks, ComponentConfig, Desktop, DesktopConfig, DesktopError, InputEvent, JsonlRecorder,
    LatestValueSlot, Lifecycle, LifecycleState, StaleDiscardChannel, TimestampedFrame, WindowInfo,
};

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
    true
}

fn fleet(components: Vec<ComponentConfig>) -> DesktopConfig {
    DesktopConfig { components }
}

// ============================================================================
// Buffer Tests
// ============================================================================

#[test]
fn test_latest_slot_keeps_last_put() {
    let slot = LatestValueSlot::new();
    for i in 0..100 {
        slot.put(i);
    }
    assert_eq!(slot.try_take(), Ok(99));
    assert_eq!(slot.evicted(), 99);
}

#[test]
fn test_stale_channel_never_delivers_expired_items() {
    let max_age = Duration::from_millis(30);
    let channel = StaleDiscardChannel::new(16, max_age);
    let producer = channel.clone();

    let sender = thread::spawn(move || {
        for _ in 0..60 {
            producer.try_send(Instant::now()).ok();
            thread::sleep(Duration::from_millis(3));
        }
    });

    let mut received = 0;
    let deadline = Instant::now() + Duration::from_millis(400);
    while Instant::now() < deadline {
        match channel.receive(Duration::from_millis(20)) {
            Ok(sent_at) => {
                // Queued items reach 60 ms while the consumer sleeps.
                assert!(sent_at.elapsed() < max_age + Duration::from_millis(20));
                received += 1;
                thread::sleep(Duration::from_millis(60));
            }
            Err(RecvError::Empty) => {}
        }
    }
    sender.join().unwrap();
    assert!(received > 0);
    assert!(channel.discarded() > 0);
}

#[test]
fn test_dedup_sender_suppresses_repeated_detections() {
    let channel = StaleDiscardChannel::new(3, Duration::from_secs(2));
    let mut sender = DedupSender::new(channel.clone());

    let outcomes: Vec<SendOutcome> = ["cat", "cat", "dog", "dog", "cat"]
        .into_iter()
        .map(|word| sender.send(word.to_string()).unwrap())
        .collect();
    assert_eq!(
        outcomes,
        vec![
            SendOutcome::Sent,
            SendOutcome::Suppressed,
            SendOutcome::Sent,
            SendOutcome::Suppressed,
            SendOutcome::Sent,
        ]
    );

    let words: Vec<String> = (0..3).filter_map(|_| channel.try_receive().ok()).collect();
    assert_eq!(words, vec!["cat", "dog", "cat"]);
}

// ============================================================================
// Fleet Tests
// ============================================================================

#[test]
fn test_capture_feeds_latest_slot_through_desktop() {
    let platform = StubPlatform::new();
    let frames: LatestValueSlot<TimestampedFrame> = LatestValueSlot::new();
    let callbacks = Callbacks {
        on_frame: frames.sink(),
        ..Callbacks::default()
    };
    let config = fleet(vec![ComponentConfig::Capture(CaptureConfig {
        framerate: "100/1".parse().unwrap(),
        ..Default::default()
    })]);

    let mut desktop = Desktop::from_config(&config, &platform, callbacks).unwrap();
    desktop.start_detached().unwrap();
    let frame = frames.take(Duration::from_secs(5)).unwrap();
    assert_eq!(frame.pixels.len(), frame.expected_len());
    assert!(frame.timestamp_ns > 0);

    desktop.stop_join_close().unwrap();
    assert!(desktop.failures().is_empty());
}

#[test]
fn test_window_publisher_emits_changes_only() {
    let platform = StubPlatform::new();
    for (i, title) in ["A", "A", "B", "B", "B", "A"].iter().enumerate() {
        platform.windows().push_active(Some(test_window(title, i as u64)));
    }
    let titles = Arc::new(Mutex::new(Vec::new()));
    let sink = titles.clone();
    let callbacks = Callbacks {
        on_window: from_fn(move |w: WindowInfo| sink.lock().unwrap().push(w.title)),
        ..Callbacks::default()
    };
    let config = fleet(vec![ComponentConfig::WindowPublisher(WindowPublisherConfig {
        fps: 200,
        verbose: false,
    })]);

    let mut desktop = Desktop::from_config(&config, &platform, callbacks).unwrap();
    desktop.start_detached().unwrap();
    assert!(wait_until(|| platform.windows().exhausted() && platform.windows().polls() >= 8));
    desktop.stop_join_close().unwrap();

    assert_eq!(*titles.lock().unwrap(), vec!["A", "B", "A"]);
}

#[test]
fn test_actor_requests_respect_window_gate() {
    let platform = StubPlatform::new();
    platform.windows().set_active(Some(test_window("Terminal", 1)));
    let config = fleet(vec![ComponentConfig::Actor(ActorConfig {
        target_window_title: Some("ZType".to_string()),
        step_delay_ms: 0,
        ..Default::default()
    })]);

    let mut desktop = Desktop::from_config(&config, &platform, Callbacks::default()).unwrap();
    let requests = desktop.actor_requests().unwrap();
    desktop.start_detached().unwrap();

    requests.try_send(Action::TypeText("no".to_string())).unwrap();
    assert!(wait_until(|| requests.is_empty() && platform.windows().polls() >= 1));
    thread::sleep(Duration::from_millis(20));
    assert!(platform.recorder().is_empty());

    platform.windows().set_active(Some(test_window("ZType", 2)));
    requests.try_send(Action::TypeText("go".to_string())).unwrap();
    assert!(wait_until(|| platform.recorder().len() >= 4));
    desktop.stop_join_close().unwrap();

    assert_eq!(
        platform.recorder().take(),
        vec![
            InjectedInput::Press(0x47),
            InjectedInput::Release(0x47),
            InjectedInput::Press(0x4F),
            InjectedInput::Release(0x4F),
        ]
    );
}

#[test]
fn test_failed_capture_aborts_running_publishers() {
    let platform = StubPlatform::new();
    platform.fail_capture();
    let config = fleet(vec![
        ComponentConfig::WindowPublisher(WindowPublisherConfig::default()),
        ComponentConfig::ControlPublisher(ControlPublisherConfig::default()),
        ComponentConfig::Capture(CaptureConfig::default()),
    ]);

    let mut desktop = Desktop::from_config(&config, &platform, Callbacks::default()).unwrap();
    let err = desktop.start_detached().unwrap_err();
    assert!(matches!(err, DesktopError::StartupFailure { ref component, .. } if component == "capture"));

    for (name, state) in desktop.states() {
        assert_eq!(state, LifecycleState::Closed, "{name} left running");
    }
    assert!(!platform.hook().emit(InputEvent::key_press(vk::SPACE)));
    assert_eq!(desktop.state(), LifecycleState::Closed);
}

#[test]
fn test_invalid_config_is_rejected_before_start() {
    let platform = StubPlatform::new();
    let config = fleet(vec![ComponentConfig::WindowPublisher(WindowPublisherConfig {
        fps: 0,
        verbose: false,
    })]);
    let result = Desktop::from_config(&config, &platform, Callbacks::default());
    assert!(matches!(result, Err(DesktopError::InvalidConfig(_))));
}

// ============================================================================
// Record And Replay Tests
// ============================================================================

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_recorded_input_replays_in_order() {
    let platform = StubPlatform::new();
    let buffer = SharedBuffer::default();
    let recorder = JsonlRecorder::from_writer(buffer.clone());
    let callbacks = Callbacks {
        on_keyboard: recorder.input_sink("keyboard"),
        on_mouse: recorder.input_sink("mouse"),
        ..Callbacks::default()
    };
    let config = fleet(vec![ComponentConfig::ControlPublisher(ControlPublisherConfig::default())]);

    let mut desktop = Desktop::from_config(&config, &platform, callbacks).unwrap();
    desktop.start_detached().unwrap();
    let hook = platform.hook();
    hook.emit(InputEvent::mouse_click(10, 20, MouseButton::Left, true).with_time(300));
    hook.emit(InputEvent::key_press(vk::KEY_A).with_time(100));
    hook.emit(InputEvent::key_release(vk::KEY_A).with_time(200));
    desktop.stop_join_close().unwrap();
    assert_eq!(recorder.records(), 3);

    let contents = buffer.0.lock().unwrap().clone();
    let events = load_input_events(Cursor::new(contents)).unwrap();
    assert_eq!(events.len(), 3);

    let failures = replay_all(events, platform.recorder().as_ref(), false);
    assert_eq!(failures, 0);
    assert_eq!(
        platform.recorder().take(),
        vec![
            InjectedInput::Press(vk::KEY_A),
            InjectedInput::Release(vk::KEY_A),
            InjectedInput::Click(10, 20, MouseButton::Left, true),
        ]
    );
}
