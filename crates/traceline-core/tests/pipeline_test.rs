// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end over the host-process half: instrumenter -> trace -> sink.

use std::sync::Arc;

use traceline_core::instrumenter::Instrumenter;
use traceline_core::trace::Component;
use traceline_core::{Config, MemoryStore, SpanMeta, SpanStore, TraceSink, VecSink};

fn build() -> (Arc<Instrumenter>, Arc<MemoryStore>, Arc<VecSink>) {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(VecSink::new());
    let config = Config {
        auth_token: Some("_token_".to_owned()),
        ..Config::default()
    };
    let instrumenter = Instrumenter::new(
        config,
        Arc::clone(&store) as Arc<dyn SpanStore>,
        Arc::clone(&sink) as Arc<dyn TraceSink>,
    )
    .unwrap();
    (instrumenter, store, sink)
}

#[test]
fn a_full_request_produces_one_envelope() {
    let (instrumenter, store, sink) = build();

    instrumenter.trace(
        "UsersController#show",
        "app.endpoint.request",
        Some("GET /users/:id"),
        Component::Web,
        |scope| {
            let view = scope.instrument("view.render", Some("show.html"), None, None);
            let query = scope.instrument(
                "db.query",
                Some("SELECT"),
                Some("SELECT * FROM users WHERE id = ?"),
                None,
            );
            scope.done(query, None);
            scope.done(view, None);
            scope.record("app.event", Some("cache.hit"), None);
            scope.set_segment("html");
        },
    );

    let envelopes = sink.envelopes();
    assert_eq!(envelopes.len(), 1);

    let envelope = &envelopes[0];
    assert_eq!(envelope.endpoint, "UsersController#show");
    assert_eq!(envelope.segment.as_deref(), Some("html"));
    assert_eq!(envelope.component, Component::Web);
    assert!(!envelope.uuid.is_empty());

    // Payload is the serialized span tree: root + view + query + record.
    let payload: serde_json::Value = serde_json::from_slice(&envelope.payload).unwrap();
    let spans = payload["spans"].as_array().unwrap();
    assert_eq!(spans.len(), 4);
    assert!(spans.iter().all(|s| s["ended_at"].is_u64()));

    // Everything in the store is closed once the trace submits.
    assert_eq!(store.span_count(), 4);
}

#[test]
fn sequential_units_of_work_stay_separate() {
    let (instrumenter, _store, sink) = build();

    for i in 0..3 {
        let endpoint = format!("Job#{i}");
        instrumenter.trace(&endpoint, "app.job.perform", None, Component::Worker, |scope| {
            let span = scope.instrument("app.block", Some("work"), None, None);
            scope.done(span, None);
        });
    }

    let envelopes = sink.envelopes();
    assert_eq!(envelopes.len(), 3);
    assert_eq!(envelopes[0].endpoint, "Job#0");
    assert_eq!(envelopes[2].endpoint, "Job#2");
    assert!(envelopes.iter().all(|e| e.component == Component::Worker));
}

#[test]
fn a_deferred_middleware_wrapper_still_yields_a_clean_trace() {
    let (instrumenter, _store, sink) = build();

    instrumenter.trace("Endpoint#a", "app.endpoint.request", None, Component::Web, |scope| {
        // A middleware that cannot run on the unwind path defers its
        // close; the next stop flushes it in order.
        let outer = scope.instrument("middleware.session", Some("Session"), None, None);
        let inner = scope.instrument("app.block", Some("handler"), None, None);
        scope.done(inner, None);
        scope.done(outer, Some(&SpanMeta::deferred()));
    });

    let envelopes = sink.envelopes();
    assert_eq!(envelopes.len(), 1, "deferred close must not break the trace");
}

#[test]
fn muted_subtree_is_invisible_in_the_payload() {
    let (instrumenter, _store, sink) = build();

    instrumenter.trace("Endpoint#a", "app.endpoint.request", None, Component::Web, |scope| {
        let muter = scope.instrument("app.block", Some("quiet"), None, Some(&SpanMeta::muting()));
        let hidden = scope.instrument("db.query", Some("hidden"), None, None);
        assert!(hidden.is_none());
        scope.done(muter, None);
    });

    let envelopes = sink.envelopes();
    let payload: serde_json::Value = serde_json::from_slice(&envelopes[0].payload).unwrap();
    let spans = payload["spans"].as_array().unwrap();
    assert_eq!(spans.len(), 2); // root + muter, nothing from the muted region
}
