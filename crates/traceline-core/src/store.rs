// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! Span storage seam.
//!
//! The trace state machine never inspects span internals; it holds opaque
//! handles and pushes timing through this trait. The production engine can
//! satisfy it over FFI; [`MemoryStore`] is the in-process implementation
//! and the one the test suite inspects.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Opaque identifier issued by a span store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanHandle(pub(crate) u64);

impl SpanHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Keyed span storage. Timestamps are in 100-microsecond ticks; the trace
/// layer normalizes before calling in.
pub trait SpanStore: Send + Sync {
    fn start_span(&self, time: u64, category: &str) -> Result<SpanHandle, CoreError>;
    fn set_title(&self, span: SpanHandle, title: &str) -> Result<(), CoreError>;
    fn set_description(&self, span: SpanHandle, description: &str) -> Result<(), CoreError>;
    fn set_exception(&self, span: SpanHandle, reason: &str) -> Result<(), CoreError>;
    fn stop_span(&self, span: SpanHandle, time: u64) -> Result<(), CoreError>;

    /// Title lookup for diagnostics (out-of-order close messages).
    fn span_title(&self, span: SpanHandle) -> Option<String>;
    fn span_category(&self, span: SpanHandle) -> Option<String>;

    /// Serialize one completed trace's spans into a transportable payload.
    fn serialize_trace(
        &self,
        ident: &str,
        endpoint: &str,
        spans: &[SpanHandle],
    ) -> Result<Vec<u8>, CoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub category: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub exception: Option<String>,
    pub started_at: u64,
    pub ended_at: Option<u64>,
}

impl SpanRecord {
    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn duration(&self) -> Option<u64> {
        self.ended_at.map(|end| end.saturating_sub(self.started_at))
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    next_handle: u64,
    spans: HashMap<u64, SpanRecord>,
}

/// In-process span store backed by a handle-keyed map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Snapshot of a span, for tests and diagnostics.
    pub fn span(&self, span: SpanHandle) -> Option<SpanRecord> {
        self.lock().spans.get(&span.0).cloned()
    }

    pub fn span_count(&self) -> usize {
        self.lock().spans.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // A poisoned store mutex means a panic mid-update; the recorded
        // spans are still the best diagnostic we have.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn with_span<R>(
        &self,
        span: SpanHandle,
        f: impl FnOnce(&mut SpanRecord) -> Result<R, CoreError>,
    ) -> Result<R, CoreError> {
        let mut inner = self.lock();
        let record = inner
            .spans
            .get_mut(&span.0)
            .ok_or(CoreError::UnknownSpan(span.0))?;
        f(record)
    }
}

impl SpanStore for MemoryStore {
    fn start_span(&self, time: u64, category: &str) -> Result<SpanHandle, CoreError> {
        let mut inner = self.lock();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.spans.insert(
            handle,
            SpanRecord {
                category: category.to_owned(),
                title: None,
                description: None,
                exception: None,
                started_at: time,
                ended_at: None,
            },
        );
        Ok(SpanHandle(handle))
    }

    fn set_title(&self, span: SpanHandle, title: &str) -> Result<(), CoreError> {
        self.with_span(span, |record| {
            record.title = Some(title.to_owned());
            Ok(())
        })
    }

    fn set_description(&self, span: SpanHandle, description: &str) -> Result<(), CoreError> {
        self.with_span(span, |record| {
            record.description = Some(description.to_owned());
            Ok(())
        })
    }

    fn set_exception(&self, span: SpanHandle, reason: &str) -> Result<(), CoreError> {
        self.with_span(span, |record| {
            record.exception = Some(reason.to_owned());
            Ok(())
        })
    }

    fn stop_span(&self, span: SpanHandle, time: u64) -> Result<(), CoreError> {
        self.with_span(span, |record| {
            if record.ended_at.is_some() {
                return Err(CoreError::SpanAlreadyClosed(span.0));
            }
            record.ended_at = Some(time);
            Ok(())
        })
    }

    fn span_title(&self, span: SpanHandle) -> Option<String> {
        self.lock().spans.get(&span.0).and_then(|r| r.title.clone())
    }

    fn span_category(&self, span: SpanHandle) -> Option<String> {
        self.lock().spans.get(&span.0).map(|r| r.category.clone())
    }

    fn serialize_trace(
        &self,
        ident: &str,
        endpoint: &str,
        spans: &[SpanHandle],
    ) -> Result<Vec<u8>, CoreError> {
        let inner = self.lock();
        let mut records = Vec::with_capacity(spans.len());
        for handle in spans {
            let record = inner
                .spans
                .get(&handle.0)
                .ok_or(CoreError::UnknownSpan(handle.0))?;
            records.push(record.clone());
        }

        let payload = serde_json::json!({
            "ident": ident,
            "endpoint": endpoint,
            "spans": records,
        });

        serde_json::to_vec(&payload).map_err(|e| CoreError::Store(e.to_string()))
    }
}
