// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use traceline_core::{Clock, Config, SystemClock, TraceEnvelope, TraceSink};

use crate::collector::Collector;
use crate::error::TransportError;
use crate::standalone::Standalone;

/// Embedded mode: completed traces go straight into an in-process
/// collector, no worker subprocess involved.
pub struct Embedded {
    collector: Arc<Collector>,
}

impl Embedded {
    pub fn new(collector: Arc<Collector>) -> Embedded {
        Embedded { collector }
    }

    pub fn collector(&self) -> Arc<Collector> {
        Arc::clone(&self.collector)
    }
}

impl TraceSink for Embedded {
    fn submit(&self, envelope: TraceEnvelope) -> bool {
        self.collector.submit(envelope)
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        self.collector.shutdown(timeout)
    }
}

/// Build the trace sink the configuration asks for: a supervised worker
/// subprocess in standalone mode, an in-process collector otherwise.
pub fn build_sink(config: &Config) -> Result<Arc<dyn TraceSink>, TransportError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    if config.standalone {
        let standalone = Standalone::new(config.clone())?;
        Ok(Arc::new(standalone))
    } else {
        let collector = Arc::new(Collector::new(config.clone(), clock)?);
        Ok(Arc::new(Embedded::new(collector)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use traceline_core::trace::Component;
    use traceline_core::ManualClock;

    #[test]
    fn embedded_sink_feeds_the_collector() {
        let config = Config {
            auth_token: Some("t".to_owned()),
            base_url: "http://127.0.0.1:9".to_owned(),
            ..Config::default()
        };
        let clock = ManualClock::new();
        clock.set_absolute_secs(1_000);
        let collector = Arc::new(Collector::new(config, clock).unwrap());
        let sink = Embedded::new(Arc::clone(&collector));

        let envelope = TraceEnvelope {
            uuid: "u".to_owned(),
            endpoint: "Endpoint#a".to_owned(),
            segment: None,
            component: Component::Web,
            completed_at: 1_000,
            payload: b"{}".to_vec(),
        };
        assert!(sink.submit(envelope));

        let meters = collector.meters();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while meters.traces_seen.load(Ordering::Relaxed) == 0
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(meters.traces_seen.load(Ordering::Relaxed), 1);
        assert!(sink.shutdown(Duration::from_secs(2)));
    }
}
