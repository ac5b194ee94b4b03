// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! Supervised consumer thread over a [`WorkQueue`].
//!
//! The thread is spawned lazily on the first `submit`. Ownership is
//! tracked with a pid + generation token: after a fork-without-exec (web
//! server workers), the child's first submit observes a foreign pid,
//! discards the inherited queue and thread record, and respawns its own
//! consumer.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::queue::WorkQueue;

/// Handler verdict for each message (or idle tick, delivered as `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

enum Envelope<T> {
    Work(T),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OwnershipToken {
    pid: u32,
    generation: u64,
}

struct Finished {
    done: Mutex<bool>,
    cond: Condvar,
}

struct TaskState<T> {
    queue: Arc<WorkQueue<Envelope<T>>>,
    thread: Option<thread::JoinHandle<()>>,
    finished: Arc<Finished>,
    owner: Option<OwnershipToken>,
    generation: u64,
    stopped: bool,
}

type Handler<T> = Arc<Mutex<dyn FnMut(Option<T>) -> Flow + Send>>;

pub struct BackgroundTask<T> {
    name: &'static str,
    capacity: usize,
    tick: Duration,
    handler: Handler<T>,
    state: Mutex<TaskState<T>>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    pub fn new(
        name: &'static str,
        capacity: usize,
        tick: Duration,
        handler: impl FnMut(Option<T>) -> Flow + Send + 'static,
    ) -> BackgroundTask<T> {
        BackgroundTask {
            name,
            capacity,
            tick,
            handler: Arc::new(Mutex::new(handler)),
            state: Mutex::new(TaskState {
                queue: Arc::new(WorkQueue::new(capacity)),
                thread: None,
                finished: Arc::new(Finished {
                    done: Mutex::new(false),
                    cond: Condvar::new(),
                }),
                owner: None,
                generation: 0,
                stopped: false,
            }),
        }
    }

    /// Enqueue a message, spawning (or respawning) the consumer as needed.
    /// Returns false when the task is stopped or the queue is full.
    pub fn submit(&self, msg: T) -> bool {
        let mut state = self.lock_state();
        if state.stopped {
            return false;
        }

        let pid = std::process::id();
        match state.owner {
            Some(token) if token.pid == pid => {}
            Some(_) => {
                // Forked: the recorded owner is another process. The
                // inherited thread does not exist here and the queue may
                // hold the parent's messages.
                debug!(task = self.name, "owner pid changed, respawning consumer");
                self.respawn(&mut state, pid);
            }
            None => self.respawn(&mut state, pid),
        }

        state.queue.push(Envelope::Work(msg)).is_some()
    }

    pub fn running(&self) -> bool {
        let state = self.lock_state();
        !state.stopped && state.owner.is_some()
    }

    /// Depth of the work queue, for self-observability metrics.
    pub fn queue_depth(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Signal the consumer with a sentinel and join up to `timeout`. A
    /// thread that refuses to exit is abandoned (there is no forced kill),
    /// so the caller never blocks past the deadline.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let (thread, finished, queue) = {
            let mut state = self.lock_state();
            if state.stopped {
                return true;
            }
            state.stopped = true;
            let thread = state.thread.take();
            (thread, Arc::clone(&state.finished), Arc::clone(&state.queue))
        };

        let Some(thread) = thread else {
            return true;
        };

        if queue.push(Envelope::Shutdown).is_none() {
            // Full queue: the consumer is alive but behind; it will still
            // observe `pop` returning work until the deadline.
            debug!(task = self.name, "shutdown sentinel dropped, queue full");
        }

        let deadline = Instant::now() + timeout;
        let mut done = finished
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = finished
                .cond
                .wait_timeout(done, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            done = guard;
        }

        if *done {
            let _ = thread.join();
            true
        } else {
            error!(task = self.name, "consumer did not exit in time, abandoning");
            false
        }
    }

    fn respawn(&self, state: &mut TaskState<T>, pid: u32) {
        state.generation += 1;
        state.owner = Some(OwnershipToken {
            pid,
            generation: state.generation,
        });
        state.queue = Arc::new(WorkQueue::new(self.capacity));
        state.finished = Arc::new(Finished {
            done: Mutex::new(false),
            cond: Condvar::new(),
        });

        let queue = Arc::clone(&state.queue);
        let finished = Arc::clone(&state.finished);
        let handler = Arc::clone(&self.handler);
        let tick = self.tick;
        let name = self.name;

        state.thread = Some(thread::spawn(move || {
            consume(name, queue, handler, finished, tick);
        }));
    }

    fn lock_state(&self) -> MutexGuard<'_, TaskState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn consume<T>(
    name: &'static str,
    queue: Arc<WorkQueue<Envelope<T>>>,
    handler: Handler<T>,
    finished: Arc<Finished>,
    tick: Duration,
) {
    loop {
        let msg = match queue.pop(Some(tick)) {
            Some(Envelope::Shutdown) => break,
            Some(Envelope::Work(msg)) => Some(msg),
            None => None,
        };

        let verdict = {
            let mut handler = handler.lock().unwrap_or_else(PoisonError::into_inner);
            catch_unwind(AssertUnwindSafe(|| (*handler)(msg)))
        };

        match verdict {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => break,
            Err(_) => {
                // Handler failures are transient: log, throttle, keep
                // consuming.
                error!(task = name, "handler panicked; continuing");
                thread::sleep(Duration::from_secs(1));
            }
        }
    }

    let mut done = finished
        .done
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    *done = true;
    finished.cond.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn messages_reach_the_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let task = {
            let seen = Arc::clone(&seen);
            BackgroundTask::new("test", 16, Duration::from_millis(10), move |msg| {
                if let Some(n) = msg {
                    seen.fetch_add(n, Ordering::SeqCst);
                }
                Flow::Continue
            })
        };

        assert!(task.submit(1));
        assert!(task.submit(2));
        assert!(task.submit(3));

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.load(Ordering::SeqCst) < 6 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 6);
        assert!(task.shutdown(Duration::from_secs(1)));
    }

    #[test]
    fn consumer_spawns_lazily() {
        let task: BackgroundTask<u32> =
            BackgroundTask::new("lazy", 4, Duration::from_millis(10), |_| Flow::Continue);
        assert!(!task.running());
        assert!(task.submit(1));
        assert!(task.running());
        task.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn idle_ticks_are_delivered_as_none() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let task: BackgroundTask<u32> = {
            let ticks = Arc::clone(&ticks);
            BackgroundTask::new("ticker", 4, Duration::from_millis(5), move |msg| {
                if msg.is_none() {
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
                Flow::Continue
            })
        };

        task.submit(0);
        let deadline = Instant::now() + Duration::from_secs(2);
        while ticks.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(ticks.load(Ordering::SeqCst) > 0);
        task.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn handler_stop_ends_the_loop() {
        let task = BackgroundTask::new("stopper", 4, Duration::from_millis(10), |msg| {
            match msg {
                Some(99) => Flow::Stop,
                _ => Flow::Continue,
            }
        });
        task.submit(99u32);
        // The consumer exits on its own; shutdown only needs to observe it.
        assert!(task.shutdown(Duration::from_secs(2)));
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let task: BackgroundTask<u32> =
            BackgroundTask::new("done", 4, Duration::from_millis(10), |_| Flow::Continue);
        task.submit(1);
        assert!(task.shutdown(Duration::from_secs(1)));
        assert!(!task.submit(2));
    }

    #[test]
    fn panicking_handler_keeps_consuming() {
        let seen = Arc::new(AtomicUsize::new(0));
        let task = {
            let seen = Arc::clone(&seen);
            BackgroundTask::new("panicky", 16, Duration::from_millis(10), move |msg| {
                match msg {
                    Some(0) => panic!("boom"),
                    Some(n) => {
                        seen.fetch_add(n, Ordering::SeqCst);
                    }
                    None => {}
                }
                Flow::Continue
            })
        };

        task.submit(0);
        task.submit(7);

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        task.shutdown(Duration::from_secs(1));
    }
}
