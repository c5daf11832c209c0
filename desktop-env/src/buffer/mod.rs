// Copyright 2024 desktop-env Authors
// SPDX-License-Identifier: Apache-2.0

//! Buffers between producers and consumers
//!
//! These are the only state shared across component threads:
//!
//! - [`LatestValueSlot`]: capacity-1 overwrite buffer. A fast producer always
//!   wins and the consumer only ever sees the newest item (frames).
//! - [`StaleDiscardChannel`]: bounded FIFO that rejects when full and drops
//!   items older than `max_age` at dequeue time (detections, requests).
//!
//! `Empty` and `Full` are control-flow signals, not failures.

mod latest;
mod stale;

pub use latest::{LatestValueSlot, TakeError};
pub use stale::{DedupSender, RecvError, SendError, SendOutcome, StaleDiscardChannel};
