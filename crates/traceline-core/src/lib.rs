// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! Host-process half of the traceline agent: the span-tracking state
//! machine and the primitives the transport layer is built on.

pub mod clock;
pub mod config;
pub mod error;
pub mod gc;
pub mod instrumenter;
pub mod queue;
pub mod sink;
pub mod store;
pub mod task;
pub mod trace;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::CoreError;
pub use gc::{GcTracker, NullGc};
pub use instrumenter::{Instrumenter, TraceScope};
pub use queue::WorkQueue;
pub use sink::{NullSink, TraceSink, VecSink};
pub use store::{MemoryStore, SpanHandle, SpanStore};
pub use task::{BackgroundTask, Flow};
pub use trace::{middleware_integration_disabled, Component, SpanMeta, Trace, TraceEnvelope};

/// Agent version carried in the IPC handshake; a newer peer triggers a
/// worker re-exec.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
