// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy
//!
//! Only [`DesktopError::StartupFailure`] is fatal to an orchestrator. Every
//! other variant is handled where it happens (logged and skipped) or handed
//! to the caller as a typed value.

use crate::platform::PlatformError;

/// Result type for desktop operations.
pub type Result<T> = std::result::Result<T, DesktopError>;

/// Desktop error types.
#[derive(Debug, thiserror::Error)]
pub enum DesktopError {
    /// A component could not reach a running state.
    ///
    /// Raised at most once per component, from `start` or `start_detached`.
    /// An orchestrator receiving it aborts the whole fleet.
    #[error("Component '{component}' failed to start: {reason}")]
    StartupFailure { component: String, reason: String },

    /// A single frame or sample was lost; the capture loop continues.
    #[error("Transient capture error: {0}")]
    TransientCapture(String),

    /// A user callback returned an error or panicked.
    #[error("Callback '{name}' failed: {reason}")]
    Callback { name: String, reason: String },

    /// A window lookup matched nothing.
    #[error("No window with title containing '{0}' found")]
    NotFound(String),

    /// Configuration values are out of range or inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A platform backend call failed.
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// A component thread panicked and was reaped by `join`.
    #[error("Thread of component '{0}' panicked")]
    ThreadPanicked(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration or record file could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DesktopError {
    /// Build a [`DesktopError::StartupFailure`] for `component`.
    pub fn startup(component: impl Into<String>, reason: impl ToString) -> Self {
        DesktopError::StartupFailure {
            component: component.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error must abort an orchestrator.
    pub fn is_startup_failure(&self) -> bool {
        matches!(self, DesktopError::StartupFailure { .. })
    }
}
