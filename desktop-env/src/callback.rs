// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! User callbacks
//!
//! A callback may fail by returning an error or by panicking. Both are
//! caught at the call site by [`dispatch`], logged, and never propagated:
//! one broken invocation must not take down the thread that delivers events.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::warn;

use crate::error::{DesktopError, Result};

/// Result returned by user callbacks
pub type CallbackResult = anyhow::Result<()>;

/// Shared, thread-safe user callback
pub type Callback<T> = Arc<dyn Fn(T) -> CallbackResult + Send + Sync>;

/// Callback that accepts and discards every value.
pub fn noop<T>() -> Callback<T> {
    Arc::new(|_: T| Ok(()))
}

/// Wrap an infallible closure into a [`Callback`].
pub fn from_fn<T, F>(f: F) -> Callback<T>
where
    F: Fn(T) + Send + Sync + 'static,
{
    Arc::new(move |value: T| {
        f(value);
        Ok(())
    })
}

/// Callback that feeds every value to `first`, then to `second`.
///
/// Both always run; the first error is returned.
pub fn chain<T: Clone + 'static>(first: Callback<T>, second: Callback<T>) -> Callback<T> {
    Arc::new(move |value: T| {
        let a = first(value.clone());
        let b = second(value);
        a.and(b)
    })
}

/// Invoke `callback`, turning an error or a panic into
/// [`DesktopError::Callback`].
pub fn invoke<T>(name: &str, callback: &Callback<T>, value: T) -> Result<()> {
    let reason = match panic::catch_unwind(AssertUnwindSafe(|| callback(value))) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => format!("{e:#}"),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
    };
    Err(DesktopError::Callback {
        name: name.to_string(),
        reason,
    })
}

/// Invoke `callback`, logging and containing errors and panics.
///
/// Returns `true` if the callback completed successfully.
pub fn dispatch<T>(name: &str, callback: &Callback<T>, value: T) -> bool {
    match invoke(name, callback, value) {
        Ok(()) => true,
        Err(e) => {
            warn!("{e}");
            false
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
