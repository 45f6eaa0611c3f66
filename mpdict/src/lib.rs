// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]
#![cfg(unix)]

//! Ordered key-value map shared between processes through a POSIX shared memory arena.
//!
//! Processes that open the same arena name and map name see the same entries, without any
//! server process in between:
//!
//! ```no_run
//! use mpdict::{SharedMap, DEFAULT_ARENA_NAME};
//!
//! let map = SharedMap::open_or_create("sessions", 1 << 20, DEFAULT_ARENA_NAME)?;
//! map.set(b"user:1", b"alice")?;
//! assert_eq!(map.get(b"user:1")?, Some(b"alice".to_vec()));
//! for key in map.iter() {
//!     println!("{:?}", key?);
//! }
//! # Ok::<(), mpdict::ShmDictError>(())
//! ```
//!
//! The arena has a fixed size chosen by whoever creates it. Running out of room makes
//! [`SharedMap::set`] fail with [`ShmDictError::CapacityExhausted`] and leaves the map unchanged.

pub mod arena;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod map;
pub mod platform;

pub use arena::{ArenaGuard, ArenaRef, ArenaStats, SharedArena, ShmAllocator, ShmObject, ShmOffset};
pub use config::{ArenaOptions, UnlinkPolicy, DEFAULT_ARENA_NAME, DEFAULT_KEY_LIMIT};
pub use diagnostics::{DiagnosticLevel, Diagnostics, NoopDiagnostics, TracingDiagnostics};
pub use error::{Result, ShmDictError};
pub use map::{KeyCursor, KeyEnumerator, SharedMap};

#[cfg(test)]
pub(crate) mod test_utils {
    use std::ffi::CString;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Shm name no other test, in this process or a concurrent run, will pick.
    pub(crate) fn unique_name(prefix: &str) -> String {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        format!(
            "mpdict-test-{prefix}-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    pub(crate) fn unique_shm_path(prefix: &str) -> CString {
        CString::new(format!("/{}", unique_name(prefix))).unwrap()
    }

    /// Pid of a process that already exited and was reaped.
    pub(crate) fn dead_pid() -> u32 {
        use nix::sys::wait::waitpid;
        use nix::unistd::{fork, ForkResult};

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe { libc::_exit(0) },
            ForkResult::Parent { child } => {
                waitpid(child, None).unwrap();
                child.as_raw() as u32
            }
        }
    }
}
