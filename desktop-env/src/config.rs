// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Desktop configuration
//!
//! A configuration is an ordered list of components, each selected by its
//! `kind` key from a closed set. Components start in list order.
//!
//! ```json
//! {
//!   "components": [
//!     { "kind": "capture", "window_name": "ZType", "framerate": "20/1" },
//!     { "kind": "window_publisher", "fps": 5 },
//!     { "kind": "actor", "target_window_title": "ZType" }
//!   ]
//! }
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::callback::{noop, Callback};
use crate::error::{DesktopError, Result};
use crate::event::InputEvent;
use crate::platform::Framerate;
use crate::protocol::{TimestampedFrame, WindowInfo};

/// Screen capture options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture only the first window whose title contains this
    pub window_name: Option<String>,
    /// Monitor to capture when no window is named
    pub monitor_index: Option<u32>,
    /// Upper bound on delivered frames
    pub framerate: Framerate,
}

/// Active window polling options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowPublisherConfig {
    /// Polls per second
    pub fps: u32,
    /// Log every published change at info level
    pub verbose: bool,
}

impl Default for WindowPublisherConfig {
    fn default() -> Self {
        Self {
            fps: 10,
            verbose: false,
        }
    }
}

/// Input hook options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPublisherConfig {
    pub keyboard: bool,
    pub mouse: bool,
}

impl Default for ControlPublisherConfig {
    fn default() -> Self {
        Self {
            keyboard: true,
            mouse: true,
        }
    }
}

/// Input injection options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Only act while the active window title contains this
    pub target_window_title: Option<String>,
    /// Pause between two input steps
    pub step_delay_ms: u64,
    /// Pending action requests before new ones are rejected
    pub request_capacity: usize,
    /// Requests older than this are dropped unexecuted
    pub max_request_age_ms: u64,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            target_window_title: None,
            step_delay_ms: 50,
            request_capacity: 3,
            max_request_age_ms: 2000,
        }
    }
}

impl ActorConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub fn max_request_age(&self) -> Duration {
        Duration::from_millis(self.max_request_age_ms)
    }
}

/// One component entry, keyed by `kind`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComponentConfig {
    Capture(CaptureConfig),
    WindowPublisher(WindowPublisherConfig),
    ControlPublisher(ControlPublisherConfig),
    Actor(ActorConfig),
}

impl ComponentConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ComponentConfig::Capture(_) => "capture",
            ComponentConfig::WindowPublisher(_) => "window_publisher",
            ComponentConfig::ControlPublisher(_) => "control_publisher",
            ComponentConfig::Actor(_) => "actor",
        }
    }
}

/// Complete desktop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesktopConfig {
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
}

impl Default for DesktopConfig {
    /// Capture, window publisher and control publisher with default options.
    fn default() -> Self {
        Self {
            components: vec![
                ComponentConfig::Capture(CaptureConfig::default()),
                ComponentConfig::WindowPublisher(WindowPublisherConfig::default()),
                ComponentConfig::ControlPublisher(ControlPublisherConfig::default()),
            ],
        }
    }
}

impl DesktopConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        for component in &self.components {
            match component {
                ComponentConfig::WindowPublisher(c) if c.fps == 0 => {
                    return Err(DesktopError::InvalidConfig(
                        "window_publisher fps must be positive".to_string(),
                    ));
                }
                ComponentConfig::ControlPublisher(c) if !c.keyboard && !c.mouse => {
                    return Err(DesktopError::InvalidConfig(
                        "control_publisher needs keyboard or mouse enabled".to_string(),
                    ));
                }
                ComponentConfig::Actor(c) if c.request_capacity == 0 => {
                    return Err(DesktopError::InvalidConfig(
                        "actor request_capacity must be positive".to_string(),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Edit the first capture entry, appending a default one if missing.
    pub fn update_capture(&mut self, edit: impl FnOnce(&mut CaptureConfig)) {
        if let Some(ComponentConfig::Capture(c)) = self
            .components
            .iter_mut()
            .find(|c| matches!(c, ComponentConfig::Capture(_)))
        {
            edit(c);
            return;
        }
        let mut c = CaptureConfig::default();
        edit(&mut c);
        self.components.push(ComponentConfig::Capture(c));
    }

    /// Edit the first window publisher entry, appending a default one if missing.
    pub fn update_window_publisher(&mut self, edit: impl FnOnce(&mut WindowPublisherConfig)) {
        if let Some(ComponentConfig::WindowPublisher(c)) = self
            .components
            .iter_mut()
            .find(|c| matches!(c, ComponentConfig::WindowPublisher(_)))
        {
            edit(c);
            return;
        }
        let mut c = WindowPublisherConfig::default();
        edit(&mut c);
        self.components.push(ComponentConfig::WindowPublisher(c));
    }

    /// Edit the first actor entry, appending a default one if missing.
    pub fn update_actor(&mut self, edit: impl FnOnce(&mut ActorConfig)) {
        if let Some(ComponentConfig::Actor(c)) = self
            .components
            .iter_mut()
            .find(|c| matches!(c, ComponentConfig::Actor(_)))
        {
            edit(c);
            return;
        }
        let mut c = ActorConfig::default();
        edit(&mut c);
        self.components.push(ComponentConfig::Actor(c));
    }
}

/// User callbacks handed to the components built from a configuration
#[derive(Clone)]
pub struct Callbacks {
    pub on_frame: Callback<TimestampedFrame>,
    pub on_window: Callback<WindowInfo>,
    pub on_keyboard: Callback<InputEvent>,
    pub on_mouse: Callback<InputEvent>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_frame: noop(),
            on_window: noop(),
            on_keyboard: noop(),
            on_mouse: noop(),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fleet() {
        let config = DesktopConfig::default();
        let kinds: Vec<&str> = config.components.iter().map(ComponentConfig::kind).collect();
        assert_eq!(kinds, vec!["capture", "window_publisher", "control_publisher"]);
    }

    #[test]
    fn test_parse_with_defaults() {
        let config = DesktopConfig::from_json_str(
            r#"{
                "components": [
                    { "kind": "capture", "window_name": "ZType" },
                    { "kind": "window_publisher", "verbose": true },
                    { "kind": "actor", "target_window_title": "ZType", "step_delay_ms": 10 }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.components[0],
            ComponentConfig::Capture(CaptureConfig {
                window_name: Some("ZType".to_string()),
                monitor_index: None,
                framerate: Framerate::default(),
            })
        );
        assert_eq!(
            config.components[1],
            ComponentConfig::WindowPublisher(WindowPublisherConfig {
                fps: 10,
                verbose: true,
            })
        );
        let ComponentConfig::Actor(actor) = &config.components[2] else {
            panic!("expected actor entry");
        };
        assert_eq!(actor.step_delay(), Duration::from_millis(10));
        assert_eq!(actor.request_capacity, 3);
        assert_eq!(actor.max_request_age(), Duration::from_secs(2));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = DesktopConfig::from_json_str(r#"{ "components": [ { "kind": "mixer" } ] }"#).unwrap_err();
        assert!(matches!(err, DesktopError::Json(_)));
    }

    #[test]
    fn test_validation() {
        let err = DesktopConfig::from_json_str(r#"{ "components": [ { "kind": "window_publisher", "fps": 0 } ] }"#)
            .unwrap_err();
        assert!(matches!(err, DesktopError::InvalidConfig(_)));

        let err = DesktopConfig::from_json_str(
            r#"{ "components": [ { "kind": "control_publisher", "keyboard": false, "mouse": false } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, DesktopError::InvalidConfig(_)));

        let err = DesktopConfig::from_json_str(r#"{ "components": [ { "kind": "capture", "framerate": "0/1" } ] }"#)
            .unwrap_err();
        assert!(matches!(err, DesktopError::Json(_)));
    }

    #[test]
    fn test_update_inserts_once() {
        let mut config = DesktopConfig { components: Vec::new() };
        config.update_actor(|a| a.target_window_title = Some("Game".to_string()));
        config.update_actor(|a| a.step_delay_ms = 5);
        config.update_capture(|c| c.monitor_index = Some(1));
        config.update_window_publisher(|w| w.fps = 2);

        assert_eq!(config.components.len(), 3);
        assert_eq!(
            config.components[0],
            ComponentConfig::Actor(ActorConfig {
                target_window_title: Some("Game".to_string()),
                step_delay_ms: 5,
                ..Default::default()
            })
        );
        assert_eq!(config.components[2].kind(), "window_publisher");
    }

    #[test]
    fn test_json_round_trip_keeps_kind_tag() {
        let json = serde_json::to_value(DesktopConfig::default()).unwrap();
        assert_eq!(json["components"][0]["kind"], "capture");
        assert_eq!(json["components"][0]["framerate"], "30/1");
    }
}
