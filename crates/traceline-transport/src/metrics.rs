// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! Periodic self-observability report: registered named metrics (queue
//! depth, throughput, resident memory) merged with static host/runtime
//! identification and posted to the backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use traceline_core::{BackgroundTask, Clock, Config, Flow, VERSION};

use crate::api::ReportClient;
use crate::error::TransportError;

/// A metric is a zero-arg callable evaluated at report time.
pub type Metric = Arc<dyn Fn() -> Value + Send + Sync>;

/// Named metric registry. Registration and removal are safe to race with
/// a report in flight: the reporter snapshots names first and skips any
/// metric removed before it gets around to reading it.
#[derive(Default)]
pub struct MetricsRegistry {
    metrics: Mutex<HashMap<String, Metric>>,
}

impl MetricsRegistry {
    pub fn new() -> Arc<MetricsRegistry> {
        Arc::new(MetricsRegistry::default())
    }

    pub fn register(&self, name: &str, metric: Metric) {
        self.lock().insert(name.to_owned(), metric);
    }

    pub fn unregister(&self, name: &str) {
        self.lock().remove(name);
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Metric> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Metric>> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ReporterState {
    registry: Arc<MetricsRegistry>,
    client: ReportClient,
    clock: Arc<dyn Clock>,
    interval: u64,
    next_report_at: Option<u64>,
}

impl ReporterState {
    fn handle(&mut self) -> Flow {
        let now = self.clock.absolute_secs();

        let Some(due) = self.next_report_at else {
            self.next_report_at = Some(now + self.interval);
            return Flow::Continue;
        };
        if now < due {
            return Flow::Continue;
        }

        self.next_report_at = Some(now + self.interval);
        let report = build_report(&self.registry);
        debug!(metrics = report.as_object().map(|o| o.len()).unwrap_or(0), "posting self metrics");
        if let Err(e) = self.client.post_metrics(&report) {
            warn!(error = %e, "internal metrics report failed");
        }

        Flow::Continue
    }
}

fn build_report(registry: &MetricsRegistry) -> Value {
    let mut report = json!({
        "hostname": gethostname::gethostname().to_string_lossy(),
        "host.info": format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
        "agent.version": VERSION,
    });

    for name in registry.names() {
        // A metric removed between the snapshot and here is just skipped.
        let Some(metric) = registry.get(&name) else {
            continue;
        };
        report[name] = metric();
    }

    report
}

/// Background reporter posting every `metrics_report_interval_secs`.
pub struct MetricsReporter {
    task: BackgroundTask<()>,
    registry: Arc<MetricsRegistry>,
}

impl MetricsReporter {
    pub fn new(
        config: &Config,
        clock: Arc<dyn Clock>,
        registry: Arc<MetricsRegistry>,
    ) -> Result<MetricsReporter, TransportError> {
        let client = ReportClient::new(config)?;
        let mut state = ReporterState {
            registry: Arc::clone(&registry),
            client,
            clock,
            interval: config.metrics_report_interval_secs,
            next_report_at: None,
        };

        let task = BackgroundTask::new(
            "metrics-reporter",
            16,
            Duration::from_millis(250),
            move |_msg: Option<()>| state.handle(),
        );

        Ok(MetricsReporter { task, registry })
    }

    /// Kick the consumer thread into existence. Reports happen on idle
    /// ticks from then on.
    pub fn start(&self) {
        self.task.submit(());
    }

    pub fn registry(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.task.shutdown(timeout)
    }
}
