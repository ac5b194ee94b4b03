// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! Span-tracking state machine.
//!
//! A `Trace` owns one request/job's span stack and turns a stream of
//! start/stop calls, possibly out of order and possibly abandoned halfway,
//! into a well-formed trace tree. Every failure path degrades: the trace
//! is marked broken and dropped, the host application never sees an error.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::{normalize_time, Clock};
use crate::error::CoreError;
use crate::gc::GcTracker;
use crate::store::{SpanHandle, SpanStore};

pub const GC_CATEGORY: &str = "noise.gc";

/// One-shot process-wide switch: set when an out-of-order close implicates
/// the middleware integration. The integration layer polls this before
/// wrapping the next request.
static MIDDLEWARE_INTEGRATION_DISABLED: AtomicBool = AtomicBool::new(false);
static DISABLE_COUNT: AtomicUsize = AtomicUsize::new(0);

pub fn middleware_integration_disabled() -> bool {
    MIDDLEWARE_INTEGRATION_DISABLED.load(Ordering::SeqCst)
}

fn disable_middleware_integration() -> bool {
    let flipped = MIDDLEWARE_INTEGRATION_DISABLED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok();
    if flipped {
        DISABLE_COUNT.fetch_add(1, Ordering::SeqCst);
    }
    flipped
}

#[cfg(test)]
fn reset_middleware_integration() {
    MIDDLEWARE_INTEGRATION_DISABLED.store(false, Ordering::SeqCst);
    DISABLE_COUNT.store(0, Ordering::SeqCst);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Web,
    Worker,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Web => "web",
            Component::Worker => "worker",
        }
    }
}

/// Per-span options supplied by producers.
#[derive(Debug, Default, Clone)]
pub struct SpanMeta {
    /// Close whenever convenient instead of now; used by wrappers that
    /// cannot guarantee they run on the unwind path.
    pub defer: bool,
    /// Suppress instrumentation of this span's descendants.
    pub mute_children: bool,
    /// Exception description attached at close.
    pub exception: Option<String>,
}

impl SpanMeta {
    pub fn deferred() -> Self {
        SpanMeta {
            defer: true,
            ..SpanMeta::default()
        }
    }

    pub fn muting() -> Self {
        SpanMeta {
            mute_children: true,
            ..SpanMeta::default()
        }
    }
}

/// Correlates a producer-supplied notification name with the span it
/// opened, so asynchronous start/finish pairs can find each other.
#[derive(Debug, Clone)]
pub struct Notification {
    pub name: String,
    pub span: Option<SpanHandle>,
}

/// A completed trace, serialized and ready for transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEnvelope {
    pub uuid: String,
    pub endpoint: String,
    pub segment: Option<String>,
    pub component: Component,
    /// Wall-clock seconds at submission; batches window on this.
    pub completed_at: u64,
    pub payload: Vec<u8>,
}

pub struct Trace {
    store: Arc<dyn SpanStore>,
    clock: Arc<dyn Clock>,
    gc: Box<dyn GcTracker>,
    uuid: Uuid,
    endpoint: String,
    segment: Option<String>,
    component: Component,
    /// Open spans, most recent last. Never empty while the trace is open.
    stack: Vec<SpanHandle>,
    /// Every span opened under this trace, in open order.
    all_spans: Vec<SpanHandle>,
    notifications: Vec<Notification>,
    /// Spans marked "close whenever convenient" with their defer-time
    /// timestamps (ticks). Drained on each subsequent close.
    deferred: HashMap<SpanHandle, u64>,
    muted_by: Option<SpanHandle>,
    broken: bool,
    submitted: bool,
    mute_warned: HashSet<&'static str>,
    disable_policy_prefix: Option<String>,
}

impl Trace {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SpanStore>,
        clock: Arc<dyn Clock>,
        gc: Box<dyn GcTracker>,
        endpoint: &str,
        component: Component,
        category: &str,
        title: Option<&str>,
        disable_policy_prefix: Option<String>,
    ) -> Result<Trace, CoreError> {
        let mut trace = Trace {
            store,
            clock,
            gc,
            uuid: Uuid::new_v4(),
            endpoint: endpoint.to_owned(),
            segment: None,
            component,
            stack: Vec::new(),
            all_spans: Vec::new(),
            notifications: Vec::new(),
            deferred: HashMap::new(),
            muted_by: None,
            broken: false,
            submitted: false,
            mute_warned: HashSet::new(),
            disable_policy_prefix,
        };

        // Root span; stays open until submit.
        let time = trace.current_ticks();
        let root = trace.open_span(time, category, title, None)?;
        trace.stack.push(root);
        Ok(trace)
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn segment(&self) -> Option<&str> {
        self.segment.as_deref()
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn is_muted(&self) -> bool {
        self.muted_by.is_some()
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    /// Mutating the display name is rejected while muted; logged once per
    /// reason rather than raised.
    pub fn set_endpoint(&mut self, endpoint: &str) {
        if self.is_muted() {
            self.warn_muted("endpoint");
            return;
        }
        self.endpoint = endpoint.to_owned();
    }

    pub fn set_segment(&mut self, segment: &str) {
        if self.is_muted() {
            self.warn_muted("segment");
            return;
        }
        self.segment = Some(segment.to_owned());
    }

    /// Open a span. Returns `None` (running nothing) when the trace is
    /// muted or broken.
    pub fn instrument(
        &mut self,
        category: &str,
        title: Option<&str>,
        description: Option<&str>,
        meta: Option<&SpanMeta>,
    ) -> Option<SpanHandle> {
        if self.broken || self.is_muted() {
            return None;
        }

        let time = self.current_ticks();
        match self.open_span(time, category, title, description) {
            Ok(span) => {
                self.stack.push(span);
                if meta.map(|m| m.mute_children).unwrap_or(false) {
                    self.muted_by = Some(span);
                }
                Some(span)
            }
            Err(e) => {
                self.maybe_broken(&e);
                None
            }
        }
    }

    /// Record a zero-duration span (an event).
    pub fn record(&mut self, category: &str, title: Option<&str>, description: Option<&str>) {
        if self.broken || self.is_muted() {
            return;
        }

        let time = self.current_ticks();
        let result = self
            .open_span(time, category, title, description)
            .and_then(|span| self.store.stop_span(span, time));
        if let Err(e) = result {
            self.maybe_broken(&e);
        }
    }

    /// Close a span (or defer its close). A `None` handle means the
    /// matching `instrument` already failed; nothing to do.
    pub fn done(&mut self, span: Option<SpanHandle>, meta: Option<&SpanMeta>) {
        let Some(span) = span else {
            return;
        };
        if self.broken {
            return;
        }

        if meta.map(|m| m.defer).unwrap_or(false) {
            let time = self.current_ticks();
            self.deferred.insert(span, time);
            return;
        }

        if let Some(exception) = meta.and_then(|m| m.exception.as_deref()) {
            if let Err(e) = self.store.set_exception(span, exception) {
                self.maybe_broken(&e);
                return;
            }
        }

        let time = self.current_ticks();
        self.stop(span, time);
    }

    pub fn notify_started(&mut self, name: &str, span: Option<SpanHandle>) {
        self.notifications.push(Notification {
            name: name.to_owned(),
            span,
        });
    }

    /// Find and remove the most recent notification with this name.
    pub fn notify_finished(&mut self, name: &str) -> Option<Option<SpanHandle>> {
        let idx = self
            .notifications
            .iter()
            .rposition(|n| n.name == name)?;
        Some(self.notifications.remove(idx).span)
    }

    /// Terminate the trace. Idempotent; a broken trace is dropped here and
    /// never reaches the collector.
    pub fn submit(&mut self) -> Option<TraceEnvelope> {
        if self.broken {
            debug!(endpoint = %self.endpoint, "dropping broken trace");
            return None;
        }
        if self.submitted {
            debug!(endpoint = %self.endpoint, "trace already submitted");
            return None;
        }
        self.submitted = true;

        let gc = self.gc.accumulated_nanos();
        let now = self.clock.nanos();

        // Force-close anything still open, walking the stack outward.
        // Deferred spans close at their defer-time timestamps.
        while self.stack.len() > 1 {
            let span = match self.stack.pop() {
                Some(span) => span,
                None => break,
            };
            let time = self
                .deferred
                .remove(&span)
                .unwrap_or_else(|| normalize_time(now.saturating_sub(gc)));
            self.close_span(span, time);
        }

        // Accumulated collector time becomes one synthetic span bracketing
        // the trailing edge of the trace.
        if gc > 0 {
            match self.open_span(normalize_time(now.saturating_sub(gc)), GC_CATEGORY, None, None)
            {
                Ok(span) => {
                    if let Err(e) = self.store.stop_span(span, normalize_time(now)) {
                        self.maybe_broken(&e);
                    }
                }
                Err(e) => self.maybe_broken(&e),
            }
        }

        if let Some(root) = self.stack.pop() {
            self.close_span(root, normalize_time(now));
        }

        if self.broken {
            return None;
        }

        let payload = match self.store.serialize_trace(
            &self.uuid.to_string(),
            &self.endpoint,
            &self.all_spans,
        ) {
            Ok(payload) => payload,
            Err(e) => {
                error!(endpoint = %self.endpoint, error = %e, "failed to serialize trace");
                return None;
            }
        };

        Some(TraceEnvelope {
            uuid: self.uuid.to_string(),
            endpoint: self.endpoint.clone(),
            segment: self.segment.clone(),
            component: self.component,
            completed_at: self.clock.absolute_secs(),
            payload,
        })
    }

    /// Close protocol: flush deferred entries off the top of the stack,
    /// then require the top to match. A mismatch is an out-of-order close;
    /// the trace is abandoned.
    fn stop(&mut self, span: SpanHandle, time: u64) {
        loop {
            let Some(&top) = self.stack.last() else {
                let e = CoreError::EmptyStack;
                self.maybe_broken(&e);
                return;
            };

            if top == span {
                self.stack.pop();
                self.close_span(span, time);
                return;
            }

            if let Some(deferred_at) = self.deferred.remove(&top) {
                self.stack.pop();
                self.close_span(top, deferred_at);
                if self.broken {
                    return;
                }
                continue;
            }

            self.handle_out_of_order(top, span);
            return;
        }
    }

    fn close_span(&mut self, span: SpanHandle, time: u64) {
        if let Err(e) = self.store.stop_span(span, time) {
            self.maybe_broken(&e);
            return;
        }
        // Closing the muting span restores instrumentation.
        if self.muted_by == Some(span) {
            self.muted_by = None;
        }
    }

    fn handle_out_of_order(&mut self, expected: SpanHandle, actual: SpanHandle) {
        let expected_title = self
            .store
            .span_title(expected)
            .unwrap_or_else(|| "unknown".to_owned());
        let actual_title = self
            .store
            .span_title(actual)
            .unwrap_or_else(|| "unknown".to_owned());

        error!(
            endpoint = %self.endpoint,
            expected = %expected_title,
            actual = %actual_title,
            "spans were closed out of order; this request will not be tracked"
        );

        if let Some(prefix) = self.disable_policy_prefix.as_deref() {
            let category = self.store.span_category(actual).unwrap_or_default();
            if category.contains(prefix) {
                if disable_middleware_integration() {
                    warn!(
                        category = %category,
                        "disabled the middleware integration to prevent repeat corruption"
                    );
                } else if middleware_integration_disabled() {
                    warn!("middleware integration already disabled; the mismatch persists");
                }
            }
        }

        self.mark_broken();
    }

    fn open_span(
        &mut self,
        time: u64,
        category: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<SpanHandle, CoreError> {
        let span = self.store.start_span(time, category)?;
        if let Some(title) = title {
            self.store.set_title(span, title)?;
        }
        if let Some(description) = description {
            self.store.set_description(span, description)?;
        }
        self.all_spans.push(span);
        Ok(span)
    }

    /// GC-compensated timestamp in store ticks.
    fn current_ticks(&mut self) -> u64 {
        let gc = self.gc.accumulated_nanos();
        normalize_time(self.clock.nanos().saturating_sub(gc))
    }

    fn maybe_broken(&mut self, e: &CoreError) {
        error!(endpoint = %self.endpoint, error = %e, "failed to operate on span");
        self.mark_broken();
    }

    fn mark_broken(&mut self) {
        debug!(endpoint = %self.endpoint, "trace is broken");
        self.broken = true;
    }

    fn warn_muted(&mut self, reason: &'static str) {
        if self.mute_warned.insert(reason) {
            warn!(
                endpoint = %self.endpoint,
                reason = reason,
                "ignoring mutation of a muted trace"
            );
        }
    }
}
