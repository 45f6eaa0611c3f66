// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics sink injected into arenas at construction.
//!
//! The core never reaches for a process-wide logger on its own. Whoever opens an arena decides
//! where its events go: [`NoopDiagnostics`] (the default) drops them, [`TracingDiagnostics`]
//! forwards them to the `tracing` ecosystem under the `mpdict` target.

use std::fmt;
use std::sync::Arc;

/// Severity of a diagnostic event.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    /// Lifecycle details: region created, opened, unlinked.
    Debug = 0,
    Info = 1,
    /// Something the caller should know about but that did not fail the operation, e.g. a lock
    /// taken over from a dead process.
    Warn = 2,
    /// An operation failed.
    Error = 3,
}

/// Receives events emitted by arenas and maps.
pub trait Diagnostics: Send + Sync {
    fn event(&self, level: DiagnosticLevel, message: fmt::Arguments<'_>);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiagnostics;

impl Diagnostics for NoopDiagnostics {
    fn event(&self, _level: DiagnosticLevel, _message: fmt::Arguments<'_>) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn event(&self, level: DiagnosticLevel, message: fmt::Arguments<'_>) {
        match level {
            DiagnosticLevel::Debug => tracing::debug!(target: "mpdict", "{}", message),
            DiagnosticLevel::Info => tracing::info!(target: "mpdict", "{}", message),
            DiagnosticLevel::Warn => tracing::warn!(target: "mpdict", "{}", message),
            DiagnosticLevel::Error => tracing::error!(target: "mpdict", "{}", message),
        }
    }
}

pub(crate) fn noop() -> Arc<dyn Diagnostics> {
    Arc::new(NoopDiagnostics)
}

macro_rules! emit {
    ($sink:expr, $level:ident, $($arg:tt)+) => {
        $sink.event($crate::diagnostics::DiagnosticLevel::$level, format_args!($($arg)+))
    };
}

pub(crate) use emit;


#[cfg(test)]
mod tests {
    use super::testing::RecordingDiagnostics;
    use super::*;

    #[test]
    fn emit_formats_lazily_into_sink() {
        let sink = RecordingDiagnostics::default();
        emit!(sink, Warn, "lock held by {} recovered", 42);
        assert!(sink.contains(DiagnosticLevel::Warn, "held by 42"));
        assert!(!sink.contains(DiagnosticLevel::Error, "held by 42"));
    }

    #[test]
    fn levels_are_ordered() {
        assert!(DiagnosticLevel::Debug < DiagnosticLevel::Warn);
        assert!(DiagnosticLevel::Warn < DiagnosticLevel::Error);
    }

    #[test]
    fn noop_and_tracing_accept_events() {
        emit!(NoopDiagnostics, Info, "ignored");
        // No subscriber is installed, so this is dropped by tracing itself.
        emit!(TracingDiagnostics, Error, "forwarded {}", "nowhere");
    }
}
