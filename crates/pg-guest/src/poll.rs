// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded polling.
//!
//! Poll loops report a timeout as a value; callers at the RPC edge turn
//! [`PollOutcome::TimedOut`] into [`Error::PollTimeout`](crate::Error::PollTimeout)
//! or a more specific error.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Result of a bounded poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The check produced a value before the deadline.
    Ready(T),
    /// The deadline elapsed.
    TimedOut,
}

impl<T> PollOutcome<T> {
    /// Whether the deadline elapsed.
    pub fn timed_out(&self) -> bool {
        matches!(self, PollOutcome::TimedOut)
    }

    /// Convert into a result, naming what was waited for on timeout.
    pub fn into_result(self, what: &str) -> Result<T> {
        match self {
            PollOutcome::Ready(value) => Ok(value),
            PollOutcome::TimedOut => Err(Error::PollTimeout(what.to_string())),
        }
    }
}

/// Call `check` every `interval` until it returns `Some` or `timeout` elapses.
///
/// `check` is always invoked at least once. Transient failures should be
/// mapped to `None` by the caller so the loop retries them.
pub async fn poll_until<T, F, Fut>(mut check: F, interval: Duration, timeout: Duration) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return PollOutcome::Ready(value);
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
