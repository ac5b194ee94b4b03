// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised in the transport pipeline. Queue and IPC failures are
/// handled by dropping or reconnecting; only worker-fatal states
/// (`ServerState`) terminate a process.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown IPC message id {0}")]
    UnknownMessage(u32),

    #[error("malformed IPC frame: {0}")]
    Proto(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http client error: {0}")]
    Http(String),

    #[error("request rejected with status {0}")]
    Rejected(u16),

    #[error("endpoint unavailable with status {0}")]
    Unavailable(u16),

    #[error("worker state error: {0}")]
    ServerState(String),

    #[error("could not spawn or attach to worker: {0}")]
    Spawn(String),
}

impl TransportError {
    /// Permanent rejection (4xx): the credential or payload is bad and a
    /// retry will not help.
    pub fn is_rejection(&self) -> bool {
        matches!(self, TransportError::Rejected(_))
    }
}
