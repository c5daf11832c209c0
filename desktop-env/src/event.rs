// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Input Event Types
//!
//! Keyboard and mouse events published by the control publisher and
//! replayed through an [`InputInjector`]. Events are ordered by `time_ns`,
//! with device and payload as tie-breakers so the order is total.

use std::cmp::Ordering;
use std::thread;
use std::time::Duration;

use bitflags::bitflags;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::platform::{InputInjector, PlatformResult};
use crate::protocol::now_ns;

/// Input device type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputDevice {
    Keyboard,
    Mouse,
}

impl InputDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputDevice::Keyboard => "keyboard",
            InputDevice::Mouse => "mouse",
        }
    }
}

// ============================================================================
// Keyboard Events
// ============================================================================

/// Keyboard action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAction {
    Press,
    Release,
}

/// Keyboard event
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyboardEvent {
    /// Press or release
    pub kind: KeyAction,
    /// Virtual key code (Windows numbering)
    pub vk: u32,
    /// Event time, nanoseconds since the Unix epoch
    pub time_ns: i64,
}

// ============================================================================
// Mouse Events
// ============================================================================

/// Mouse button identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        }
    }
}

bitflags! {
    /// Set of mouse buttons held down
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ButtonState: u8 {
        const LEFT = 1 << 0;
        const RIGHT = 1 << 1;
        const MIDDLE = 1 << 2;
    }
}

impl ButtonState {
    pub fn of(button: MouseButton) -> Self {
        match button {
            MouseButton::Left => ButtonState::LEFT,
            MouseButton::Right => ButtonState::RIGHT,
            MouseButton::Middle => ButtonState::MIDDLE,
        }
    }

    /// Press/release edges going from `self` to `next`, as `(button, pressed)`.
    pub fn transitions(self, next: ButtonState) -> Vec<(MouseButton, bool)> {
        [MouseButton::Left, MouseButton::Right, MouseButton::Middle]
            .into_iter()
            .filter_map(|button| {
                let flag = ButtonState::of(button);
                match (self.contains(flag), next.contains(flag)) {
                    (false, true) => Some((button, true)),
                    (true, false) => Some((button, false)),
                    _ => None,
                }
            })
            .collect()
    }
}

/// Mouse action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MouseAction {
    Move,
    Click,
    Scroll,
}

/// Mouse event payload
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseData {
    /// Pointer moved to an absolute position
    Move { x: i32, y: i32 },
    /// Button pressed or released at a position
    Click {
        x: i32,
        y: i32,
        button: MouseButton,
        pressed: bool,
    },
    /// Wheel scrolled at a position
    Scroll { x: i32, y: i32, dx: i32, dy: i32 },
}

/// Mouse event
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MouseEvent {
    pub data: MouseData,
    /// Event time, nanoseconds since the Unix epoch
    pub time_ns: i64,
}

impl MouseEvent {
    pub fn kind(&self) -> MouseAction {
        match self.data {
            MouseData::Move { .. } => MouseAction::Move,
            MouseData::Click { .. } => MouseAction::Click,
            MouseData::Scroll { .. } => MouseAction::Scroll,
        }
    }
}

// ============================================================================
// Generic Input Event
// ============================================================================

/// Generic input event (union of all event types)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "device", rename_all = "lowercase")]
pub enum InputEvent {
    Keyboard(KeyboardEvent),
    Mouse(MouseEvent),
}

impl InputEvent {
    pub fn key_press(vk: u32) -> Self {
        Self::key(KeyAction::Press, vk)
    }

    pub fn key_release(vk: u32) -> Self {
        Self::key(KeyAction::Release, vk)
    }

    fn key(kind: KeyAction, vk: u32) -> Self {
        InputEvent::Keyboard(KeyboardEvent {
            kind,
            vk,
            time_ns: now_ns(),
        })
    }

    pub fn mouse_move(x: i32, y: i32) -> Self {
        Self::mouse(MouseData::Move { x, y })
    }

    pub fn mouse_click(x: i32, y: i32, button: MouseButton, pressed: bool) -> Self {
        Self::mouse(MouseData::Click {
            x,
            y,
            button,
            pressed,
        })
    }

    pub fn mouse_scroll(x: i32, y: i32, dx: i32, dy: i32) -> Self {
        Self::mouse(MouseData::Scroll { x, y, dx, dy })
    }

    fn mouse(data: MouseData) -> Self {
        InputEvent::Mouse(MouseEvent {
            data,
            time_ns: now_ns(),
        })
    }

    /// Replace the event time.
    pub fn with_time(mut self, time_ns: i64) -> Self {
        match &mut self {
            InputEvent::Keyboard(kb) => kb.time_ns = time_ns,
            InputEvent::Mouse(m) => m.time_ns = time_ns,
        }
        self
    }

    pub fn time_ns(&self) -> i64 {
        match self {
            InputEvent::Keyboard(kb) => kb.time_ns,
            InputEvent::Mouse(m) => m.time_ns,
        }
    }

    pub fn device(&self) -> InputDevice {
        match self {
            InputEvent::Keyboard(_) => InputDevice::Keyboard,
            InputEvent::Mouse(_) => InputDevice::Mouse,
        }
    }

    /// Inject this event again through `injector`.
    pub fn replay(&self, injector: &dyn InputInjector) -> PlatformResult<()> {
        match self {
            InputEvent::Keyboard(kb) => match kb.kind {
                KeyAction::Press => injector.press_key(kb.vk),
                KeyAction::Release => injector.release_key(kb.vk),
            },
            InputEvent::Mouse(m) => match m.data {
                MouseData::Move { x, y } => injector.move_mouse(x, y),
                MouseData::Click {
                    x,
                    y,
                    button,
                    pressed,
                } => injector.click_mouse(x, y, button, pressed),
                MouseData::Scroll { dx, dy, .. } => injector.scroll(dx, dy),
            },
        }
    }
}

impl PartialOrd for InputEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InputEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time_ns()
            .cmp(&other.time_ns())
            .then_with(|| self.device().cmp(&other.device()))
            .then_with(|| match (self, other) {
                (InputEvent::Keyboard(a), InputEvent::Keyboard(b)) => a.cmp(b),
                (InputEvent::Mouse(a), InputEvent::Mouse(b)) => a.cmp(b),
                _ => Ordering::Equal,
            })
    }
}

/// Time between two recorded events, whatever their order.
fn recorded_gap(previous: i64, next: i64) -> Duration {
    Duration::from_nanos(next.abs_diff(previous))
}

/// Replay `events` in time order.
///
/// With `paced`, the original gaps between events are reproduced. Failed
/// events are logged and skipped; the number of failures is returned.
pub fn replay_all(mut events: Vec<InputEvent>, injector: &dyn InputInjector, paced: bool) -> usize {
    events.sort();

    let mut failures = 0;
    let mut previous: Option<i64> = None;
    for event in &events {
        if let (true, Some(prev)) = (paced, previous) {
            thread::sleep(recorded_gap(prev, event.time_ns()));
        }
        previous = Some(event.time_ns());

        if let Err(e) = event.replay(injector) {
            warn!("Replay of {} event failed: {e}", event.device().as_str());
            failures += 1;
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::stub::{InjectedInput, RecordingInjector};

    #[test]
    fn test_recorded_gap_spans_full_range() {
        assert_eq!(recorded_gap(100, 350), Duration::from_nanos(250));
        assert_eq!(recorded_gap(350, 100), Duration::from_nanos(250));
        assert_eq!(recorded_gap(i64::MIN, i64::MAX), Duration::from_nanos(u64::MAX));
        assert_eq!(recorded_gap(-5, 5), Duration::from_nanos(10));
    }

    #[test]
    fn test_events_sort_by_time() {
        let mut events = vec![
            InputEvent::mouse_move(1, 1).with_time(30),
            InputEvent::key_press(0x41).with_time(10),
            InputEvent::key_release(0x41).with_time(20),
        ];
        events.sort();
        let times: Vec<i64> = events.iter().map(InputEvent::time_ns).collect();
        assert_eq!(times, vec![10, 20, 30]);
    }

    #[test]
    fn test_ties_are_broken_by_device() {
        let key = InputEvent::key_press(0x41).with_time(5);
        let mouse = InputEvent::mouse_move(0, 0).with_time(5);
        assert!(key < mouse);
        assert_ne!(key.cmp(&mouse), Ordering::Equal);
    }

    #[test]
    fn test_mouse_kind() {
        let InputEvent::Mouse(m) = InputEvent::mouse_scroll(0, 0, 0, -1) else {
            panic!("expected mouse event");
        };
        assert_eq!(m.kind(), MouseAction::Scroll);
    }

    #[test]
    fn test_button_state_transitions() {
        let before = ButtonState::LEFT;
        let after = ButtonState::RIGHT | ButtonState::MIDDLE;
        assert_eq!(
            before.transitions(after),
            vec![
                (MouseButton::Left, false),
                (MouseButton::Right, true),
                (MouseButton::Middle, true),
            ]
        );
        assert!(after.transitions(after).is_empty());
    }

    #[test]
    fn test_json_shape() {
        let event = InputEvent::key_press(0x52).with_time(7);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["device"], "keyboard");
        assert_eq!(json["kind"], "press");
        assert_eq!(json["vk"], 0x52);

        let click = InputEvent::mouse_click(3, 4, MouseButton::Right, true).with_time(8);
        let text = serde_json::to_string(&click).unwrap();
        let parsed: InputEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, click);
    }

    #[test]
    fn test_replay_all_in_order() {
        let injector = RecordingInjector::new();
        let events = vec![
            InputEvent::key_release(0x41).with_time(2),
            InputEvent::key_press(0x41).with_time(1),
            InputEvent::mouse_scroll(0, 0, 0, 3).with_time(3),
        ];
        assert_eq!(replay_all(events, &injector, false), 0);
        assert_eq!(
            injector.take(),
            vec![
                InjectedInput::Press(0x41),
                InjectedInput::Release(0x41),
                InjectedInput::Scroll(0, 3),
            ]
        );
    }
}
