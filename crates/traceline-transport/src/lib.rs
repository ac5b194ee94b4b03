// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! Transport half of the traceline agent: batching, session-token
//! lifecycle, HTTP reporting, self-metrics, and the supervised worker
//! subprocess with its framed IPC socket.

pub mod api;
pub mod batch;
pub mod collector;
pub mod embedded;
pub mod error;
pub mod metrics;
pub mod proto;
pub mod sample;
pub mod server;
pub mod session;
pub mod standalone;

pub use batch::Batch;
pub use collector::{Collector, CollectorMeters};
pub use embedded::{build_sink, Embedded};
pub use error::TransportError;
pub use metrics::{MetricsRegistry, MetricsReporter};
pub use proto::{Hello, InternalError, Message};
pub use sample::UniformSample;
pub use server::Server;
pub use session::{AuthState, SessionToken};
pub use standalone::Standalone;
