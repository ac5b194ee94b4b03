// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;

const DEFAULT_BASE_URL: &str = "https://agent.traceline.dev";
const DEFAULT_REPORT_INTERVAL_SECS: u64 = 5;
const DEFAULT_SAMPLES_PER_INTERVAL: usize = 100;
const DEFAULT_MAX_PENDING_TRACES: usize = 500;
const DEFAULT_IDLE_KEEPALIVE_SECS: u64 = 60;
const DEFAULT_MAX_MEMORY_MB: u64 = 256;
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 60;

/// Agent configuration. Every resource limit the pipeline enforces is
/// surfaced here; `new` reads the environment, defaults cover the rest.
#[derive(Debug, Clone)]
pub struct Config {
    /// Long-lived agent credential, exchanged for short-lived session
    /// tokens before reports are accepted.
    pub auth_token: Option<String>,
    pub base_url: String,
    /// Batch window length, in seconds.
    pub report_interval_secs: u64,
    /// Reservoir size per batch window.
    pub samples_per_interval: usize,
    /// Work queue capacity; a full queue drops, never blocks producers.
    pub max_pending_traces: usize,
    /// Run the collector in a supervised subprocess instead of in-process.
    pub standalone: bool,
    pub lockfile_path: PathBuf,
    pub sockfile_dir: PathBuf,
    /// Worker exits after this long with no connected clients.
    pub worker_idle_keepalive_secs: u64,
    /// Worker self-terminates above this resident set size.
    pub worker_max_memory_mb: u64,
    pub metrics_report_interval_secs: u64,
    /// Command line used to launch (and relaunch) the worker binary.
    pub worker_command: Vec<String>,
    /// Category prefix that, on an out-of-order close, disables the
    /// middleware integration process-wide. `None` disables the policy.
    pub disable_policy_prefix: Option<String>,
    /// Testing mode: flush every batch as soon as it has content.
    pub constant_flush: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            auth_token: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            report_interval_secs: DEFAULT_REPORT_INTERVAL_SECS,
            samples_per_interval: DEFAULT_SAMPLES_PER_INTERVAL,
            max_pending_traces: DEFAULT_MAX_PENDING_TRACES,
            standalone: false,
            lockfile_path: PathBuf::from("tmp/traceline.pid"),
            sockfile_dir: PathBuf::from("tmp"),
            worker_idle_keepalive_secs: DEFAULT_IDLE_KEEPALIVE_SECS,
            worker_max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            metrics_report_interval_secs: DEFAULT_METRICS_INTERVAL_SECS,
            worker_command: vec!["traceline-worker".to_string()],
            disable_policy_prefix: Some("middleware".to_string()),
            constant_flush: false,
        }
    }
}

impl Config {
    pub fn new() -> anyhow::Result<Config> {
        let auth_token = env::var("TRACELINE_AUTH_TOKEN")
            .map_err(|_| anyhow::anyhow!("TRACELINE_AUTH_TOKEN environment variable is not set"))?;

        let mut config = Config {
            auth_token: Some(auth_token),
            ..Config::default()
        };

        if let Ok(url) = env::var("TRACELINE_BASE_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(interval) = parse_env("TRACELINE_REPORT_INTERVAL") {
            config.report_interval_secs = interval;
        }
        if let Some(samples) = parse_env("TRACELINE_SAMPLES_PER_INTERVAL") {
            config.samples_per_interval = samples;
        }
        if let Some(pending) = parse_env("TRACELINE_MAX_PENDING_TRACES") {
            config.max_pending_traces = pending;
        }
        if let Ok(val) = env::var("TRACELINE_STANDALONE") {
            config.standalone = val.to_lowercase() != "false";
        }
        if let Ok(path) = env::var("TRACELINE_LOCKFILE") {
            config.lockfile_path = PathBuf::from(path);
        }
        if let Ok(dir) = env::var("TRACELINE_SOCKDIR") {
            config.sockfile_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse_env("TRACELINE_WORKER_KEEPALIVE") {
            config.worker_idle_keepalive_secs = secs;
        }
        if let Some(mb) = parse_env("TRACELINE_WORKER_MAX_MEMORY_MB") {
            config.worker_max_memory_mb = mb;
        }
        if let Some(secs) = parse_env("TRACELINE_METRICS_INTERVAL") {
            config.metrics_report_interval_secs = secs;
        }
        if let Ok(bin) = env::var("TRACELINE_WORKER_BIN") {
            config.worker_command = vec![bin];
        }
        if let Ok(val) = env::var("TRACELINE_DISABLE_POLICY") {
            config.disable_policy_prefix = match val.as_str() {
                "" | "off" => None,
                prefix => Some(prefix.to_string()),
            };
        }
        if let Ok(val) = env::var("TRACELINE_CONSTANT_FLUSH") {
            config.constant_flush = val.to_lowercase() == "true";
        }

        if config.report_interval_secs == 0 {
            anyhow::bail!("TRACELINE_REPORT_INTERVAL must be positive");
        }
        if config.max_pending_traces == 0 {
            anyhow::bail!("TRACELINE_MAX_PENDING_TRACES must be positive");
        }

        Ok(config)
    }

    pub fn report_url(&self) -> String {
        format!("{}/report", self.base_url)
    }

    pub fn session_url(&self) -> String {
        format!("{}/session", self.base_url)
    }

    pub fn metrics_url(&self) -> String {
        format!("{}/agent/metrics", self.base_url)
    }

    pub fn sockfile_for(&self, pid: u32) -> PathBuf {
        self.sockfile_dir.join(format!("traceline-{pid}.sock"))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.parse::<T>().ok())
}
