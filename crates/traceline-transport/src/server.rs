// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! Worker-process server: the event loop on the other side of the IPC
//! socket.
//!
//! Single logical loop over: accepting clients, dispatching complete
//! frames from per-connection reader tasks, a once-a-second tick that
//! runs the sanity check (lockfile still ours, sockfile still present),
//! the status check (resident memory against the ceiling) and the
//! idle-timeout shutdown. A `Hello` naming a newer agent version makes
//! the server re-exec itself with the peer's relaunch command.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::json;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use traceline_core::{Clock, Config, VERSION};

use crate::collector::Collector;
use crate::error::TransportError;
use crate::metrics::{MetricsRegistry, MetricsReporter};
use crate::proto::{Hello, IpcCodec, Message};
use crate::standalone::try_acquire_lock;

const LOCK_ATTEMPTS: u32 = 100;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
const TICK_SECS: u64 = 1;
const STATUS_CHECK_TICKS: u64 = 5;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
enum Event {
    Frame(usize, Message),
    Disconnected(usize),
}

enum Verdict {
    Continue,
    Reexec(Hello),
}

enum Exit {
    Clean,
    Reexec(Hello),
}

pub struct Server {
    config: Config,
    collector: Arc<Collector>,
    reporter: MetricsReporter,
    open_connections: Arc<AtomicUsize>,
    // Held (locked) for the worker's lifetime; never deleted, since an
    // atomic "delete only if still ours" is not possible.
    _lockfile: File,
    pid: u32,
}

impl Server {
    /// Claim the lockfile, write our pid, clean up stale sockfiles from
    /// dead workers, and wire the collector + metrics reporter.
    pub fn prepare(config: Config, clock: Arc<dyn Clock>) -> Result<Server, TransportError> {
        let pid = std::process::id();
        let lockfile = claim_lockfile(&config.lockfile_path, pid)?;
        cleanup_stale_sockfiles(&config.sockfile_dir, pid);

        let collector = Arc::new(Collector::new(config.clone(), Arc::clone(&clock))?);

        let open_connections = Arc::new(AtomicUsize::new(0));
        let registry = MetricsRegistry::new();
        register_worker_metrics(&registry, &collector, &open_connections);
        let reporter = MetricsReporter::new(&config, clock, Arc::clone(&registry))?;

        Ok(Server {
            config,
            collector,
            reporter,
            open_connections,
            _lockfile: lockfile,
            pid,
        })
    }

    pub fn collector(&self) -> Arc<Collector> {
        Arc::clone(&self.collector)
    }

    pub fn sockfile(&self) -> PathBuf {
        self.config.sockfile_for(self.pid)
    }

    pub async fn run(self) -> Result<(), TransportError> {
        let sockfile = self.sockfile();
        let listener = UnixListener::bind(&sockfile)?;
        self.reporter.start();
        info!(pid = self.pid, sockfile = %sockfile.display(), "worker listening");

        let result = self.work(&listener).await;

        // Only our own per-pid sockfile is removed; the lockfile stays.
        if let Err(e) = fs::remove_file(&sockfile) {
            debug!(error = %e, "could not remove sockfile");
        }
        self.collector.shutdown(Duration::from_secs(5));
        self.reporter.shutdown(Duration::from_secs(1));

        match result {
            Ok(Exit::Clean) => Ok(()),
            Ok(Exit::Reexec(hello)) => reexec(&hello),
            Err(e) => Err(e),
        }
    }

    async fn work(&self, listener: &UnixListener) -> Result<Exit, TransportError> {
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);
        let mut tick = tokio::time::interval(Duration::from_secs(TICK_SECS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut clients: HashSet<usize> = HashSet::new();
        let mut next_conn_id: usize = 0;
        let mut last_client_at = Instant::now();
        let mut ticks: u64 = 0;
        let idle_keepalive = Duration::from_secs(self.config.worker_idle_keepalive_secs);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let id = next_conn_id;
                        next_conn_id += 1;
                        clients.insert(id);
                        self.open_connections.store(clients.len(), Ordering::Relaxed);
                        last_client_at = Instant::now();
                        debug!(conn = id, "client accepted");
                        spawn_reader(id, stream, event_tx.clone());
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },

                event = event_rx.recv() => match event {
                    Some(Event::Frame(id, msg)) => {
                        if let Verdict::Reexec(hello) = self.handle_message(id, msg) {
                            return Ok(Exit::Reexec(hello));
                        }
                    }
                    Some(Event::Disconnected(id)) => {
                        clients.remove(&id);
                        self.open_connections.store(clients.len(), Ordering::Relaxed);
                        last_client_at = Instant::now();
                        debug!(conn = id, "client disconnected");
                    }
                    // We hold a sender, so the channel cannot close.
                    None => return Ok(Exit::Clean),
                },

                _ = tick.tick() => {
                    ticks += 1;
                    self.sanity_check()?;

                    if ticks % STATUS_CHECK_TICKS == 0 {
                        self.status_check()?;
                    }

                    if !clients.is_empty() {
                        last_client_at = Instant::now();
                    } else if last_client_at.elapsed() >= idle_keepalive {
                        info!("no clients for the keepalive window; shutting down");
                        return Ok(Exit::Clean);
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received; shutting down");
                    return Ok(Exit::Clean);
                },
            }
        }
    }

    fn handle_message(&self, conn: usize, msg: Message) -> Verdict {
        match msg {
            Message::Hello(hello) => {
                if hello.newer_than(VERSION) {
                    info!(
                        current = VERSION,
                        peer = %hello.version,
                        "newer agent version deployed; restarting worker"
                    );
                    return Verdict::Reexec(hello);
                }
                debug!(conn = conn, version = %hello.version, "handshake");
            }
            Message::Trace(envelope) => {
                if !self.collector.submit(envelope) {
                    warn!("collector queue full; trace dropped");
                }
            }
            Message::InternalError(err) => {
                self.collector.submit_error(err);
            }
        }
        Verdict::Continue
    }

    /// The worker's claim to exist: the lockfile must still name this pid
    /// and the sockfile must still be on disk. Anything else is fatal.
    fn sanity_check(&self) -> Result<(), TransportError> {
        let lockfile = &self.config.lockfile_path;
        let content = fs::read_to_string(lockfile)
            .map_err(|_| TransportError::ServerState("lockfile gone".to_owned()))?;
        if content.trim() != self.pid.to_string() {
            return Err(TransportError::ServerState(
                "lockfile points to a different process".to_owned(),
            ));
        }
        if !self.sockfile().exists() {
            return Err(TransportError::ServerState("sockfile gone".to_owned()));
        }
        Ok(())
    }

    /// Measure resident memory; self-terminate above the ceiling.
    fn status_check(&self) -> Result<(), TransportError> {
        let Some(rss) = resident_memory_bytes() else {
            return Ok(());
        };
        debug!(rss_mb = rss / (1024 * 1024), "worker status");

        let ceiling = self.config.worker_max_memory_mb * 1024 * 1024;
        if rss > ceiling {
            error!(
                rss_mb = rss / (1024 * 1024),
                ceiling_mb = self.config.worker_max_memory_mb,
                "memory ceiling exceeded"
            );
            return Err(TransportError::ServerState(
                "memory ceiling exceeded".to_owned(),
            ));
        }
        Ok(())
    }
}

fn spawn_reader(id: usize, stream: tokio::net::UnixStream, tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let mut frames = FramedRead::new(stream, IpcCodec);
        while let Some(result) = frames.next().await {
            match result {
                Ok(msg) => {
                    if tx.send(Event::Frame(id, msg)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    // Protocol damage is per-connection: drop the client,
                    // keep the server.
                    debug!(conn = id, error = %e, "closing connection");
                    break;
                }
            }
        }
        let _ = tx.send(Event::Disconnected(id)).await;
    });
}

fn claim_lockfile(path: &Path, pid: u32) -> Result<File, TransportError> {
    for _ in 0..LOCK_ATTEMPTS {
        if let Some(mut file) = try_acquire_lock(path)? {
            file.set_len(0)?;
            file.write_all(pid.to_string().as_bytes())?;
            file.flush()?;
            return Ok(file);
        }
        std::thread::sleep(LOCK_RETRY_DELAY);
    }
    Err(TransportError::ServerState(
        "could not claim the worker lockfile".to_owned(),
    ))
}

/// Remove sockfiles left behind by dead workers. Ours is re-created at
/// bind time, so everything matching the pattern goes.
fn cleanup_stale_sockfiles(dir: &Path, own_pid: u32) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with("traceline-") && name.ends_with(".sock") {
            if name == format!("traceline-{own_pid}.sock") {
                continue;
            }
            debug!(sockfile = name, "removing stale sockfile");
            let _ = fs::remove_file(entry.path());
        }
    }
}

/// Graceful hot upgrade: replace this process with the newer agent's
/// worker, keeping the same lockfile/sockfile configuration via env.
fn reexec(hello: &Hello) -> Result<(), TransportError> {
    use std::os::unix::process::CommandExt;

    let mut parts = hello.relaunch_command.iter();
    let bin = parts
        .next()
        .ok_or_else(|| TransportError::ServerState("empty relaunch command".to_owned()))?;

    info!(command = %bin, "re-exec for hot upgrade");
    let err = std::process::Command::new(bin).args(parts).exec();
    // exec only returns on failure.
    Err(TransportError::ServerState(format!(
        "re-exec failed: {err}"
    )))
}

#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<u64> {
    // statm reports pages; the kernel page size on every platform we ship
    // to is 4KiB.
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<u64> {
    None
}

fn register_worker_metrics(
    registry: &MetricsRegistry,
    collector: &Arc<Collector>,
    open_connections: &Arc<AtomicUsize>,
) {
    let queue_depth = Arc::clone(collector);
    registry.register(
        "collector.queue_depth",
        Arc::new(move || json!(queue_depth.queue_depth())),
    );

    let meters = collector.meters();
    registry.register(
        "collector.throughput",
        Arc::new(move || {
            json!({
                "seen": meters.traces_seen.load(Ordering::Relaxed),
                "flushed": meters.flush_success.load(Ordering::Relaxed),
                "failed": meters.flush_failure.load(Ordering::Relaxed),
                "dropped": meters.dropped_batches.load(Ordering::Relaxed),
            })
        }),
    );

    let connections = Arc::clone(open_connections);
    registry.register(
        "server.open_connections",
        Arc::new(move || json!(connections.load(Ordering::Relaxed))),
    );

    registry.register(
        "worker.memory",
        Arc::new(|| json!(resident_memory_bytes().unwrap_or(0))),
    );
}
