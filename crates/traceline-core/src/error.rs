// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised inside the instrumentation pipeline. None of these ever
/// cross a public entry point into the host application: callers catch
/// them, mark the trace broken, and degrade to a no-op.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("unknown span handle: {0}")]
    UnknownSpan(u64),

    #[error("span {0} already closed")]
    SpanAlreadyClosed(u64),

    #[error("trace has no open spans")]
    EmptyStack,

    #[error("invalid category: {0}")]
    InvalidCategory(String),

    #[error("instrumenter is not running")]
    NotRunning,

    #[error("span store failure: {0}")]
    Store(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoreError::UnknownSpan(7);
        assert_eq!(error.to_string(), "unknown span handle: 7");
    }

    #[test]
    fn test_error_debug() {
        let error = CoreError::EmptyStack;
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("EmptyStack"));
    }
}
