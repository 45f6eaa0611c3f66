// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{ffi_call, MpdictStatus};
use function_name::named;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log level for filtering log events.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MpdictLogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Off = 5,
}

impl From<MpdictLogLevel> for LevelFilter {
    fn from(level: MpdictLogLevel) -> Self {
        match level {
            MpdictLogLevel::Trace => LevelFilter::TRACE,
            MpdictLogLevel::Debug => LevelFilter::DEBUG,
            MpdictLogLevel::Info => LevelFilter::INFO,
            MpdictLogLevel::Warn => LevelFilter::WARN,
            MpdictLogLevel::Error => LevelFilter::ERROR,
            MpdictLogLevel::Off => LevelFilter::OFF,
        }
    }
}

#[no_mangle]
#[must_use]
#[named]
/// Installs a process-wide subscriber writing to stderr. `level` applies unless `RUST_LOG` says
/// otherwise. Fails if a global subscriber is already installed.
pub extern "C" fn mpdict_logger_init(level: MpdictLogLevel) -> MpdictStatus {
    ffi_call(function_name!(), || {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from(level).into())
            .from_env_lossy();
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
        tracing::debug!(target: "mpdict", ?level, "logger initialized");
        Ok(())
    })
}
