// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide instrumentation entry point.
//!
//! The instrumenter validates categories, owns the span store and the
//! trace sink, and hands out [`TraceScope`]s: explicit per-unit-of-work
//! contexts that replace a hidden thread-local "current trace". A scope
//! submits its trace when dropped, so a panic unwinding through the host
//! still attempts submission before propagating.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::gc::{GcTracker, NullGc};
use crate::sink::TraceSink;
use crate::store::{SpanHandle, SpanStore};
use crate::trace::{Component, SpanMeta, Trace};

/// Known top-level category tiers; anything else is demoted under `other.`
/// rather than rejected outright.
const TIERS: &[&str] = &[
    "api",
    "app",
    "db",
    "external",
    "gc",
    "middleware",
    "noise",
    "other",
    "rack",
    "view",
];

fn category_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"^[a-z0-9_-]+(\.[a-z0-9_-]+)*$").expect("category pattern is valid")
    })
}

static INSTANCE: Mutex<Option<Arc<Instrumenter>>> = Mutex::new(None);

type GcFactory = Box<dyn Fn() -> Box<dyn GcTracker> + Send + Sync>;

pub struct Instrumenter {
    config: Config,
    store: Arc<dyn SpanStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TraceSink>,
    gc_factory: GcFactory,
    /// Reentrancy guard: while set, dispatch no-ops. Used to keep
    /// diagnostics about instrumentation from instrumenting themselves.
    disabled: AtomicBool,
}

impl Instrumenter {
    pub fn new(
        config: Config,
        store: Arc<dyn SpanStore>,
        sink: Arc<dyn TraceSink>,
    ) -> anyhow::Result<Arc<Instrumenter>> {
        Instrumenter::with_parts(
            config,
            store,
            sink,
            Arc::new(SystemClock::new()),
            Box::new(|| Box::new(NullGc)),
        )
    }

    pub fn with_parts(
        config: Config,
        store: Arc<dyn SpanStore>,
        sink: Arc<dyn TraceSink>,
        clock: Arc<dyn Clock>,
        gc_factory: GcFactory,
    ) -> anyhow::Result<Arc<Instrumenter>> {
        if config.auth_token.is_none() {
            warn!("no authentication token configured; traces will not be reported");
        }
        if config.report_interval_secs == 0 {
            anyhow::bail!("report interval must be positive");
        }

        Ok(Arc::new(Instrumenter {
            config,
            store,
            clock,
            sink,
            gc_factory,
            disabled: AtomicBool::new(false),
        }))
    }

    /// Start the process-wide instance. Idempotent: concurrent and repeat
    /// calls observe the instance the first call created.
    pub fn start(
        config: Config,
        store: Arc<dyn SpanStore>,
        sink: Arc<dyn TraceSink>,
    ) -> anyhow::Result<Arc<Instrumenter>> {
        let mut instance = INSTANCE.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = instance.as_ref() {
            debug!("instrumenter already started");
            return Ok(Arc::clone(existing));
        }

        let built = Instrumenter::new(config, store, sink)?;
        *instance = Some(Arc::clone(&built));
        Ok(built)
    }

    pub fn instance() -> Option<Arc<Instrumenter>> {
        INSTANCE
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tear down the process-wide instance, flushing the sink.
    pub fn stop(timeout: Duration) -> bool {
        let taken = INSTANCE
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(instrumenter) => instrumenter.sink.shutdown(timeout),
            None => true,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one unit of work under a new trace scope. The scope is handed
    /// to the closure; on exit (normal or unwinding) the trace is
    /// submitted. An integration that already holds a scope extends it by
    /// instrumenting on it instead of opening another trace.
    pub fn trace<F, R>(
        self: &Arc<Self>,
        endpoint: &str,
        category: &str,
        title: Option<&str>,
        component: Component,
        f: F,
    ) -> R
    where
        F: FnOnce(&mut TraceScope) -> R,
    {
        let mut scope = self.begin_trace(endpoint, category, title, component);
        f(&mut scope)
    }

    /// Open a scope without the closure shape, for callers whose unit of
    /// work is not block-structured. The scope submits on drop.
    pub fn begin_trace(
        self: &Arc<Self>,
        endpoint: &str,
        category: &str,
        title: Option<&str>,
        component: Component,
    ) -> TraceScope {
        let trace = if self.is_disabled() {
            None
        } else {
            self.create_trace(endpoint, category, title, component)
        };

        TraceScope {
            instrumenter: Arc::clone(self),
            trace,
        }
    }

    /// Suppress dispatch for the duration of the closure. Not reentrancy
    /// safe: nested calls clear the flag on first exit.
    pub fn disable<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.disabled.store(true, Ordering::SeqCst);
        let result = f();
        self.disabled.store(false, Ordering::SeqCst);
        result
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Validate a category against the allow-list pattern; demote unknown
    /// top tiers under `other.` instead of rejecting.
    fn validate_category(&self, category: &str) -> Option<String> {
        if !category_pattern().is_match(category) {
            debug!(category = category, "invalid category, skipping span");
            return None;
        }

        let tier = category.split('.').next().unwrap_or(category);
        if TIERS.contains(&tier) {
            Some(category.to_owned())
        } else {
            Some(format!("other.{category}"))
        }
    }

    fn create_trace(
        &self,
        endpoint: &str,
        category: &str,
        title: Option<&str>,
        component: Component,
    ) -> Option<Trace> {
        let category = self.validate_category(category)?;
        match Trace::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            (self.gc_factory)(),
            endpoint,
            component,
            &category,
            title,
            self.config.disable_policy_prefix.clone(),
        ) {
            Ok(trace) => Some(trace),
            Err(e) => {
                // Paranoia: a trace we cannot create is a trace we skip.
                warn!(endpoint = endpoint, error = %e, "failed to create trace");
                None
            }
        }
    }

    fn dispatch_instrument(
        &self,
        trace: &mut Trace,
        category: &str,
        title: Option<&str>,
        description: Option<&str>,
        meta: Option<&SpanMeta>,
    ) -> Option<SpanHandle> {
        if self.is_disabled() {
            return None;
        }
        let category = self.validate_category(category)?;
        trace.instrument(&category, title, description, meta)
    }

    fn dispatch_record(
        &self,
        trace: &mut Trace,
        category: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) {
        if self.is_disabled() {
            return;
        }
        if let Some(category) = self.validate_category(category) {
            trace.record(&category, title, description);
        }
    }
}

/// Explicit trace context for one unit of work. Owns the trace; submits it
/// on drop. A scope created while dispatch was disabled (or after trace
/// creation failed) is inert: every operation is a no-op.
pub struct TraceScope {
    instrumenter: Arc<Instrumenter>,
    trace: Option<Trace>,
}

impl TraceScope {
    pub fn is_active(&self) -> bool {
        self.trace.is_some()
    }

    pub fn is_broken(&self) -> bool {
        self.trace.as_ref().map(Trace::is_broken).unwrap_or(false)
    }

    pub fn is_muted(&self) -> bool {
        self.trace.as_ref().map(Trace::is_muted).unwrap_or(false)
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.trace.as_ref().map(Trace::endpoint)
    }

    pub fn instrument(
        &mut self,
        category: &str,
        title: Option<&str>,
        description: Option<&str>,
        meta: Option<&SpanMeta>,
    ) -> Option<SpanHandle> {
        let instrumenter = Arc::clone(&self.instrumenter);
        let trace = self.trace.as_mut()?;
        instrumenter.dispatch_instrument(trace, category, title, description, meta)
    }

    pub fn record(&mut self, category: &str, title: Option<&str>, description: Option<&str>) {
        let instrumenter = Arc::clone(&self.instrumenter);
        if let Some(trace) = self.trace.as_mut() {
            instrumenter.dispatch_record(trace, category, title, description);
        }
    }

    pub fn done(&mut self, span: Option<SpanHandle>, meta: Option<&SpanMeta>) {
        if let Some(trace) = self.trace.as_mut() {
            trace.done(span, meta);
        }
    }

    pub fn set_endpoint(&mut self, endpoint: &str) {
        if let Some(trace) = self.trace.as_mut() {
            trace.set_endpoint(endpoint);
        }
    }

    pub fn set_segment(&mut self, segment: &str) {
        if let Some(trace) = self.trace.as_mut() {
            trace.set_segment(segment);
        }
    }

    pub fn notify_started(&mut self, name: &str, span: Option<SpanHandle>) {
        if let Some(trace) = self.trace.as_mut() {
            trace.notify_started(name, span);
        }
    }

    pub fn notify_finished(&mut self, name: &str) -> Option<Option<SpanHandle>> {
        self.trace.as_mut()?.notify_finished(name)
    }

    /// Submit now instead of at drop.
    pub fn submit(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(mut trace) = self.trace.take() {
            if let Some(envelope) = trace.submit() {
                if !self.instrumenter.sink.submit(envelope) {
                    warn!("could not submit trace to the collector");
                }
            }
        }
    }
}

impl Drop for TraceScope {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::VecSink;
    use crate::store::MemoryStore;
    use serial_test::serial;

    fn test_config() -> Config {
        Config {
            auth_token: Some("_token_".to_owned()),
            ..Config::default()
        }
    }

    fn build() -> (Arc<Instrumenter>, Arc<MemoryStore>, Arc<VecSink>) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(VecSink::new());
        let instrumenter = Instrumenter::new(
            test_config(),
            Arc::clone(&store) as Arc<dyn SpanStore>,
            Arc::clone(&sink) as Arc<dyn TraceSink>,
        )
        .unwrap();
        (instrumenter, store, sink)
    }

    #[test]
    #[serial]
    fn start_is_idempotent() {
        let _ = Instrumenter::stop(Duration::ZERO);

        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(VecSink::new());
        let first = Instrumenter::start(
            test_config(),
            Arc::clone(&store) as Arc<dyn SpanStore>,
            Arc::clone(&sink) as Arc<dyn TraceSink>,
        )
        .unwrap();
        let second = Instrumenter::start(
            test_config(),
            Arc::new(MemoryStore::new()) as Arc<dyn SpanStore>,
            Arc::new(VecSink::new()) as Arc<dyn TraceSink>,
        )
        .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Instrumenter::instance().is_some());
        assert!(Instrumenter::stop(Duration::ZERO));
        assert!(Instrumenter::instance().is_none());
    }

    #[test]
    fn trace_submits_to_the_sink() {
        let (instrumenter, _store, sink) = build();
        instrumenter.trace("Endpoint#a", "app.endpoint.request", None, Component::Web, |scope| {
            let span = scope.instrument("db.query", Some("SELECT"), None, None);
            scope.done(span, None);
        });

        let envelopes = sink.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].endpoint, "Endpoint#a");
    }

    #[test]
    fn unknown_tier_is_demoted_under_other() {
        let (instrumenter, store, _sink) = build();
        instrumenter.trace("Endpoint#a", "app.endpoint.request", None, Component::Web, |scope| {
            let span = scope.instrument("custom.thing", None, None, None).unwrap();
            assert_eq!(
                store.span(span).unwrap().category,
                "other.custom.thing"
            );
            scope.done(Some(span), None);
        });
    }

    #[test]
    fn invalid_category_is_skipped() {
        let (instrumenter, _store, _sink) = build();
        instrumenter.trace("Endpoint#a", "app.endpoint.request", None, Component::Web, |scope| {
            assert!(scope.instrument("Not A Category!", None, None, None).is_none());
        });
    }

    #[test]
    fn disable_suppresses_dispatch() {
        let (instrumenter, store, _sink) = build();
        instrumenter.trace("Endpoint#a", "app.endpoint.request", None, Component::Web, |scope| {
            let before = store.span_count();
            let inst = Arc::clone(&scope.instrumenter);
            inst.disable(|| {
                assert!(scope.instrument("db.query", None, None, None).is_none());
            });
            assert_eq!(store.span_count(), before);
            // Dispatch resumes after the block.
            assert!(scope.instrument("db.query", None, None, None).is_some());
        });
    }

    #[test]
    fn scope_created_while_disabled_is_inert() {
        let (instrumenter, _store, sink) = build();
        instrumenter.disable(|| {
            let mut scope =
                instrumenter.begin_trace("Endpoint#a", "app.endpoint.request", None, Component::Web);
            assert!(!scope.is_active());
            assert!(scope.instrument("db.query", None, None, None).is_none());
        });
        assert!(sink.is_empty());
    }

    #[test]
    fn broken_trace_is_not_submitted() {
        let (instrumenter, _store, sink) = build();
        instrumenter.trace("Endpoint#a", "app.endpoint.request", None, Component::Web, |scope| {
            let a = scope.instrument("db.query", Some("a"), None, None);
            let _b = scope.instrument("db.query", Some("b"), None, None);
            scope.done(a, None); // out of order
            assert!(scope.is_broken());
        });
        assert!(sink.is_empty());
    }

    #[test]
    fn scope_submits_even_when_the_closure_panics() {
        let (instrumenter, _store, sink) = build();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            instrumenter.trace(
                "Endpoint#a",
                "app.endpoint.request",
                None,
                Component::Web,
                |_scope| panic!("request blew up"),
            )
        }));
        assert!(result.is_err());
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn explicit_submit_consumes_the_scope() {
        let (instrumenter, _store, sink) = build();
        let scope =
            instrumenter.begin_trace("Endpoint#a", "app.endpoint.request", None, Component::Web);
        scope.submit();
        assert_eq!(sink.len(), 1);
    }
}
