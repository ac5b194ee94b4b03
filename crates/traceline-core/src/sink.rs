// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Mutex;
use std::time::Duration;

use crate::trace::TraceEnvelope;

/// Destination for completed traces: the in-process collector in embedded
/// mode, the IPC client in standalone mode. Submission is fire-and-forget;
/// a `false` return means the envelope was dropped.
pub trait TraceSink: Send + Sync {
    fn submit(&self, envelope: TraceEnvelope) -> bool;

    /// Flush and stop. Default is a no-op for sinks with no state.
    fn shutdown(&self, _timeout: Duration) -> bool {
        true
    }
}

/// Sink that drops everything; the default until an agent is wired up.
#[derive(Debug, Default)]
pub struct NullSink;

impl TraceSink for NullSink {
    fn submit(&self, _envelope: TraceEnvelope) -> bool {
        true
    }
}

/// Test sink collecting every submitted envelope.
#[derive(Debug, Default)]
pub struct VecSink {
    envelopes: Mutex<Vec<TraceEnvelope>>,
}

impl VecSink {
    pub fn new() -> Self {
        VecSink::default()
    }

    pub fn envelopes(&self) -> Vec<TraceEnvelope> {
        self.envelopes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.envelopes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceSink for VecSink {
    fn submit(&self, envelope: TraceEnvelope) -> bool {
        self.envelopes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(envelope);
        true
    }
}
