// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Span timestamps are stored in 100-microsecond ticks. At least one
/// embedder feeds us pre-scaled integers, so the division is forced again
/// on every boundary crossing.
pub const TICK_NANOS: u64 = 100_000;

/// Time source for the pipeline. Monotonic nanoseconds drive span
/// durations; absolute seconds drive batch windows and token expiry.
pub trait Clock: Send + Sync {
    /// Monotonic nanoseconds since an arbitrary process-local epoch.
    fn nanos(&self) -> u64;

    /// Wall-clock seconds since the unix epoch.
    fn absolute_secs(&self) -> u64;
}

/// Normalize a monotonic nanosecond reading to span-store ticks.
pub fn normalize_time(nanos: u64) -> u64 {
    nanos / TICK_NANOS
}

/// Production clock backed by `Instant`/`SystemTime`.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn absolute_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Scriptable clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: std::sync::atomic::AtomicU64,
    absolute: std::sync::atomic::AtomicU64,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(ManualClock::default())
    }

    pub fn advance_nanos(&self, by: u64) {
        self.nanos
            .fetch_add(by, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_absolute_secs(&self, secs: u64) {
        self.absolute
            .store(secs, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn nanos(&self) -> u64 {
        self.nanos.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn absolute_secs(&self) -> u64 {
        self.absolute.load(std::sync::atomic::Ordering::SeqCst)
    }
}
