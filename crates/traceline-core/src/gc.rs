// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! Garbage-collector time attribution.
//!
//! Span durations report wall time minus collector pauses on the owning
//! thread, so every timestamp taken inside a trace subtracts the tracker's
//! accumulated total. Embedders whose runtime has a collector (a hosted
//! scripting VM, for instance) supply their own tracker; the default
//! reports zero and keeps the subtraction path live at no cost.

/// Accumulated GC time attributed to the current unit of work.
pub trait GcTracker: Send {
    /// Total collector nanoseconds observed since this tracker was
    /// attached to a trace. Must be monotonically non-decreasing.
    fn accumulated_nanos(&mut self) -> u64;
}

/// Tracker for runtimes without a collector.
#[derive(Debug, Default)]
pub struct NullGc;

impl GcTracker for NullGc {
    fn accumulated_nanos(&mut self) -> u64 {
        0
    }
}

/// Scripted tracker for tests: shares a cell with the test body.
#[derive(Debug, Clone, Default)]
pub struct SharedGc(std::sync::Arc<std::sync::atomic::AtomicU64>);

impl SharedGc {
    pub fn new() -> Self {
        SharedGc::default()
    }

    pub fn add_nanos(&self, by: u64) {
        self.0.fetch_add(by, std::sync::atomic::Ordering::SeqCst);
    }
}

impl GcTracker for SharedGc {
    fn accumulated_nanos(&mut self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_gc_is_always_zero() {
        let mut gc = NullGc;
        assert_eq!(gc.accumulated_nanos(), 0);
        assert_eq!(gc.accumulated_nanos(), 0);
    }

    #[test]
    fn shared_gc_accumulates() {
        let gc = SharedGc::new();
        let mut reader = gc.clone();
        assert_eq!(reader.accumulated_nanos(), 0);
        gc.add_nanos(1_000);
        gc.add_nanos(500);
        assert_eq!(reader.accumulated_nanos(), 1_500);
    }
}
