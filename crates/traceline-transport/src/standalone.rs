// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! Host-side handle to the supervised worker subprocess.
//!
//! Exactly one worker runs per environment, enforced by an exclusive
//! non-blocking flock on the lockfile. The lock winner spawns the worker
//! binary; losers read the running worker's pid out of the lockfile. Both
//! then poll for the per-pid socket, connect and send the handshake. All
//! sends happen on a background consumer thread so the host request path
//! never blocks on IPC I/O; a failed write closes and drops the socket,
//! and the next send attempt reconnects (or respawns a dead worker).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, warn};

use traceline_core::{BackgroundTask, Config, Flow, TraceEnvelope, TraceSink, VERSION};

use crate::error::TransportError;
use crate::proto::{encode_frame, Hello, Message};

/// Attempt budget covering the race between lock acquisition and socket
/// readiness.
const SPAWN_ATTEMPTS: u32 = 90;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(10);
const SOCK_WRITE_TIMEOUT: Duration = Duration::from_millis(10);

struct IpcState {
    config: Config,
    sock: Option<UnixStream>,
    worker_pid: Option<u32>,
}

impl IpcState {
    /// Spawn or attach to the worker, then connect and shake hands.
    fn establish(&mut self) -> Result<(), TransportError> {
        for attempt in 0..SPAWN_ATTEMPTS {
            match try_acquire_lock(&self.config.lockfile_path) {
                Ok(Some(lock)) => {
                    debug!("standalone process lock acquired");
                    if let Err(e) = lock.set_len(0) {
                        warn!(error = %e, "could not truncate lockfile");
                    }
                    match spawn_worker(&self.config) {
                        Ok(pid) => debug!(pid = pid, "spawned worker process"),
                        Err(e) => warn!(error = %e, "worker spawn failed"),
                    }
                    // Release the lock so the worker can claim it and
                    // write its pid.
                    drop(lock);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "could not open lockfile"),
            }

            if let Some(pid) = read_lockfile_pid(&self.config.lockfile_path) {
                let sockfile = self.config.sockfile_for(pid);
                if sockfile.exists() {
                    if let Some(sock) = self.connect(&sockfile) {
                        debug!(pid = pid, attempt = attempt, "connected to worker");
                        self.sock = Some(sock);
                        self.worker_pid = Some(pid);
                        return Ok(());
                    }
                }
            }

            thread::sleep(SPAWN_RETRY_DELAY);
        }

        Err(TransportError::Spawn(format!(
            "no responsive worker after {SPAWN_ATTEMPTS} attempts"
        )))
    }

    fn connect(&self, sockfile: &Path) -> Option<UnixStream> {
        let mut sock = UnixStream::connect(sockfile).ok()?;
        let _ = sock.set_write_timeout(Some(SOCK_WRITE_TIMEOUT));

        let hello = Message::Hello(Hello {
            version: VERSION.to_owned(),
            relaunch_command: self.config.worker_command.clone(),
        });
        let frame = encode_frame(&hello).ok()?;
        sock.write_all(&frame).ok()?;
        Some(sock)
    }

    /// Write one frame. Failures drop the socket; the message is lost and
    /// the next send reconnects.
    fn send(&mut self, msg: &Message) {
        if self.sock.is_none() {
            if let Err(e) = self.establish() {
                warn!(error = %e, "worker unreachable; dropping message");
                return;
            }
        }

        let frame = match encode_frame(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "could not encode IPC message");
                return;
            }
        };

        if let Some(sock) = self.sock.as_mut() {
            if let Err(e) = sock.write_all(&frame) {
                warn!(error = %e, "IPC write failed; closing socket");
                self.sock = None;
                self.worker_pid = None;
            }
        }
    }
}

/// Open the lockfile and try to take the exclusive non-blocking lock.
/// `Ok(None)` means another process (the running worker, or a racing
/// spawner) holds it.
pub(crate) fn try_acquire_lock(path: &Path) -> std::io::Result<Option<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(_) => Ok(None),
    }
}

fn read_lockfile_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn spawn_worker(config: &Config) -> Result<u32, TransportError> {
    let mut parts = config.worker_command.iter();
    let bin = parts
        .next()
        .ok_or_else(|| TransportError::Spawn("empty worker command".to_owned()))?;

    let mut command = Command::new(bin);
    command
        .args(parts)
        .env("TRACELINE_LOCKFILE", &config.lockfile_path)
        .env("TRACELINE_SOCKDIR", &config.sockfile_dir)
        .env("TRACELINE_BASE_URL", &config.base_url)
        .env(
            "TRACELINE_REPORT_INTERVAL",
            config.report_interval_secs.to_string(),
        )
        .env(
            "TRACELINE_WORKER_KEEPALIVE",
            config.worker_idle_keepalive_secs.to_string(),
        )
        .env(
            "TRACELINE_WORKER_MAX_MEMORY_MB",
            config.worker_max_memory_mb.to_string(),
        )
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(token) = &config.auth_token {
        command.env("TRACELINE_AUTH_TOKEN", token);
    }

    let child = command
        .spawn()
        .map_err(|e| TransportError::Spawn(e.to_string()))?;
    Ok(child.id())
}

/// Public handle; implements [`TraceSink`] for standalone mode.
pub struct Standalone {
    state: Arc<Mutex<IpcState>>,
    task: BackgroundTask<Message>,
}

impl std::fmt::Debug for Standalone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Standalone").finish_non_exhaustive()
    }
}

impl Standalone {
    pub fn new(config: Config) -> Result<Standalone, TransportError> {
        let mut initial = IpcState {
            config: config.clone(),
            sock: None,
            worker_pid: None,
        };
        // Spawn (or detect) the worker immediately; construction fails if
        // no worker can be reached within the attempt budget.
        initial.establish()?;

        let state = Arc::new(Mutex::new(initial));
        let writer_state = Arc::clone(&state);
        let task = BackgroundTask::new(
            "ipc-sender",
            config.max_pending_traces,
            Duration::from_millis(100),
            move |msg: Option<Message>| {
                if let Some(msg) = msg {
                    lock_state(&writer_state).send(&msg);
                }
                Flow::Continue
            },
        );

        Ok(Standalone { state, task })
    }

    pub fn worker_pid(&self) -> Option<u32> {
        lock_state(&self.state).worker_pid
    }

    pub fn send(&self, msg: Message) -> bool {
        self.task.submit(msg)
    }

    pub fn queue_depth(&self) -> usize {
        self.task.queue_depth()
    }
}

impl TraceSink for Standalone {
    fn submit(&self, envelope: TraceEnvelope) -> bool {
        self.send(Message::Trace(envelope))
    }

    /// Stop the sender thread. The worker is left to exit on its own idle
    /// timeout; it is not ours to kill once others may be attached.
    fn shutdown(&self, timeout: Duration) -> bool {
        self.task.shutdown(timeout)
    }
}

fn lock_state(state: &Arc<Mutex<IpcState>>) -> MutexGuard<'_, IpcState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
