// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! Batch accumulation and reporting.
//!
//! The collector consumes completed traces on a background consumer
//! thread, keeps one open batch per time window (plus its successor, so
//! traces landing near a boundary still find a home), refreshes the
//! session token ahead of expiry, and posts serialized batches to the
//! report endpoint. Metrics are deliberately lossy: a batch that cannot be
//! reported is dropped, never buffered without bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use traceline_core::{BackgroundTask, Clock, Config, Flow, TraceEnvelope};

use crate::api::ReportClient;
use crate::batch::{Batch, FLUSH_DELAY_SECS};
use crate::error::TransportError;
use crate::proto::InternalError;
use crate::session::{AuthState, SessionToken};

const QUEUE_CAPACITY: usize = 1000;

#[derive(Debug)]
pub enum CollectorMessage {
    Trace(TraceEnvelope),
    InternalError(InternalError),
    Shutdown,
}

/// Success/failure meters, shared with the metrics reporter.
#[derive(Debug, Default)]
pub struct CollectorMeters {
    pub traces_seen: AtomicU64,
    pub flush_success: AtomicU64,
    pub flush_failure: AtomicU64,
    pub dropped_batches: AtomicU64,
    pub internal_errors: AtomicU64,
}

impl CollectorMeters {
    fn bump(&self, meter: &AtomicU64) {
        meter.fetch_add(1, Ordering::Relaxed);
    }
}

struct CollectorState {
    config: Config,
    clock: Arc<dyn Clock>,
    client: ReportClient,
    auth: AuthState,
    current: Option<Batch>,
    next: Option<Batch>,
    meters: Arc<CollectorMeters>,
}

impl CollectorState {
    fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        client: ReportClient,
        meters: Arc<CollectorMeters>,
    ) -> CollectorState {
        CollectorState {
            config,
            clock,
            client,
            auth: AuthState::Missing,
            current: None,
            next: None,
            meters,
        }
    }

    fn handle(&mut self, msg: Option<CollectorMessage>) -> Flow {
        let now = self.clock.absolute_secs();

        match msg {
            Some(CollectorMessage::Shutdown) => {
                self.finish(now);
                return Flow::Stop;
            }
            Some(CollectorMessage::Trace(envelope)) => self.accept(envelope, now),
            Some(CollectorMessage::InternalError(err)) => {
                self.meters.bump(&self.meters.internal_errors);
                error!(reason = %err.reason, details = ?err.details, "agent internal error");
            }
            None => {}
        }

        self.tick(now);
        Flow::Continue
    }

    fn accept(&mut self, envelope: TraceEnvelope, now: u64) {
        self.ensure_batches(now);
        self.meters.bump(&self.meters.traces_seen);

        let wanted_by_current = self
            .current
            .as_ref()
            .map(|b| b.wants(&envelope))
            .unwrap_or(false);
        if wanted_by_current {
            if let Some(batch) = self.current.as_mut() {
                batch.push(envelope);
            }
            return;
        }

        let wanted_by_next = self
            .next
            .as_ref()
            .map(|b| b.wants(&envelope))
            .unwrap_or(false);
        if wanted_by_next {
            if let Some(batch) = self.next.as_mut() {
                batch.push(envelope);
            }
            return;
        }

        debug!(
            completed_at = envelope.completed_at,
            "trace fell outside both open batch windows"
        );
    }

    /// Steady-state maintenance, run on every message and on idle ticks.
    fn tick(&mut self, now: u64) {
        self.ensure_batches(now);
        self.refresh_token_if_due(now);
        self.flush_due(now);
    }

    fn refresh_token_if_due(&mut self, now: u64) {
        if !self.auth.refresh_due(now) {
            return;
        }

        match self.client.fetch_session() {
            Ok(response) => {
                let token = SessionToken::from_response(response, now);
                debug!(refresh_at = token.refresh_at(), "session token refreshed");
                self.auth = AuthState::Active(token);
            }
            Err(e) if e.is_rejection() => {
                // The agent credential itself was refused. Give up until a
                // fresh one is configured; 5xx/network paths stay hopeful.
                error!(error = %e, "report credential rejected; abandoning reporting");
                self.auth = AuthState::Abandoned;
            }
            Err(e) => {
                self.meters.bump(&self.meters.internal_errors);
                error!(error = %e, "session refresh failed");
            }
        }
    }

    fn flush_due(&mut self, now: u64) {
        while self
            .current
            .as_ref()
            .map(|b| b.should_flush(now))
            .unwrap_or(false)
        {
            let sample_size = self.config.samples_per_interval;
            if let Some(closed) = self.current.take() {
                self.flush(closed, now);
            }
            self.current = self.next.take();
            self.next = self
                .current
                .as_ref()
                .map(|b| b.next_batch(sample_size));
        }

        if self.config.constant_flush {
            let refreshed = self.current.as_ref().and_then(|batch| {
                if batch.is_empty() {
                    None
                } else {
                    Some(Batch::new(
                        batch.from_secs(),
                        self.config.report_interval_secs,
                        self.config.samples_per_interval,
                    ))
                }
            });
            if let Some(empty) = refreshed {
                if let Some(full) = self.current.replace(empty) {
                    self.flush(full, now);
                }
            }
        }
    }

    fn flush(&mut self, batch: Batch, now: u64) {
        if batch.is_empty() {
            return;
        }

        let token = match self.auth.usable_token(now) {
            Some(token) => token.to_owned(),
            None => {
                warn!(
                    from = batch.from_secs(),
                    "no valid session token; dropping batch"
                );
                self.meters.bump(&self.meters.dropped_batches);
                return;
            }
        };

        match self.client.post_report(&token, batch.serialize()) {
            Ok(()) => self.meters.bump(&self.meters.flush_success),
            Err(e) => {
                self.meters.bump(&self.meters.flush_failure);
                warn!(error = %e, from = batch.from_secs(), "batch report failed");
            }
        }
    }

    /// Last chance before the worker exits: refresh if needed, then flush
    /// whatever can be flushed.
    fn finish(&mut self, now: u64) {
        self.refresh_token_if_due(now);
        if let Some(batch) = self.current.take() {
            self.flush(batch, now);
        }
        if let Some(batch) = self.next.take() {
            self.flush(batch, now);
        }
    }

    fn ensure_batches(&mut self, now: u64) {
        if self.current.is_some() {
            return;
        }

        let interval = self.config.report_interval_secs;
        let mut from = (now / interval) * interval;
        // Still inside the previous window's grace period: open that
        // window instead so its stragglers are kept.
        if now < from + FLUSH_DELAY_SECS {
            from = from.saturating_sub(interval);
        }

        let current = Batch::new(from, interval, self.config.samples_per_interval);
        self.next = Some(current.next_batch(self.config.samples_per_interval));
        self.current = Some(current);
    }
}

/// Public handle: a supervised consumer thread around [`CollectorState`].
pub struct Collector {
    task: BackgroundTask<CollectorMessage>,
    meters: Arc<CollectorMeters>,
}

impl Collector {
    pub fn new(config: Config, clock: Arc<dyn Clock>) -> Result<Collector, TransportError> {
        let client = ReportClient::new(&config)?;
        let meters = Arc::new(CollectorMeters::default());
        let mut state = CollectorState::new(config, clock, client, Arc::clone(&meters));

        let tick = tick_interval(state.config.report_interval_secs);
        let task = BackgroundTask::new(
            "collector",
            QUEUE_CAPACITY,
            tick,
            move |msg| state.handle(msg),
        );

        Ok(Collector { task, meters })
    }

    pub fn submit(&self, envelope: TraceEnvelope) -> bool {
        self.task.submit(CollectorMessage::Trace(envelope))
    }

    pub fn submit_error(&self, error: InternalError) -> bool {
        self.task.submit(CollectorMessage::InternalError(error))
    }

    pub fn queue_depth(&self) -> usize {
        self.task.queue_depth()
    }

    pub fn meters(&self) -> Arc<CollectorMeters> {
        Arc::clone(&self.meters)
    }

    /// Final refresh + flush, then stop the consumer.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.task.submit(CollectorMessage::Shutdown);
        self.task.shutdown(timeout)
    }
}

/// The consumer wakes often enough to notice window boundaries promptly.
fn tick_interval(report_interval_secs: u64) -> Duration {
    Duration::from_millis((report_interval_secs * 1000 / 20).max(50))
}
