// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use serde_json::json;
use traceline_core::TraceEnvelope;

use crate::sample::UniformSample;

/// Grace period after a window closes during which its traces may still
/// arrive, before the batch is eligible for flushing.
pub const FLUSH_DELAY_SECS: u64 = 1;

/// Accumulates completed traces for one time window `[from, from+interval)`:
/// a capped uniform sample plus exact per-endpoint counts. The counts
/// reflect every trace seen even when the reservoir rejects one.
#[derive(Debug)]
pub struct Batch {
    from: u64,
    interval: u64,
    flush_at: u64,
    counts: HashMap<String, u64>,
    sample: UniformSample<TraceEnvelope>,
}

impl Batch {
    pub fn new(from: u64, interval: u64, sample_size: usize) -> Batch {
        Batch {
            from,
            interval,
            flush_at: from + interval + FLUSH_DELAY_SECS,
            counts: HashMap::new(),
            sample: UniformSample::new(sample_size),
        }
    }

    pub fn from_secs(&self) -> u64 {
        self.from
    }

    pub fn counts(&self) -> &HashMap<String, u64> {
        &self.counts
    }

    pub fn is_empty(&self) -> bool {
        self.sample.is_empty()
    }

    pub fn should_flush(&self, now: u64) -> bool {
        now >= self.flush_at
    }

    pub fn wants(&self, envelope: &TraceEnvelope) -> bool {
        envelope.completed_at >= self.from && envelope.completed_at < self.from + self.interval
    }

    pub fn push(&mut self, envelope: TraceEnvelope) {
        *self.counts.entry(envelope.endpoint.clone()).or_insert(0) += 1;
        self.sample.push(envelope);
    }

    pub fn next_batch(&self, sample_size: usize) -> Batch {
        Batch::new(self.from + self.interval, self.interval, sample_size)
    }

    /// Serialize the window for the report endpoint. Trace payloads are
    /// already JSON; they are embedded as values, not re-encoded.
    pub fn serialize(&self) -> Vec<u8> {
        let samples: Vec<serde_json::Value> = self
            .sample
            .iter()
            .map(|envelope| {
                let spans: serde_json::Value = serde_json::from_slice(&envelope.payload)
                    .unwrap_or(serde_json::Value::Null);
                json!({
                    "uuid": envelope.uuid,
                    "endpoint": envelope.endpoint,
                    "segment": envelope.segment,
                    "component": envelope.component,
                    "completed_at": envelope.completed_at,
                    "trace": spans,
                })
            })
            .collect();

        let body = json!({
            "from": self.from,
            "interval": self.interval,
            "counts": self.counts,
            "samples": samples,
        });

        body.to_string().into_bytes()
    }
}
