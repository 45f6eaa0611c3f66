// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-shared spin lock living in the arena header.
//!
//! The lock word holds the pid of the holder, or 0 when free. Waiters spin briefly, then yield,
//! and every so often check whether the holder process still exists. A holder that died without
//! releasing is replaced by the waiter; whatever the dead process was in the middle of is left
//! as is.
//!
//! Threads of one process share a pid, so the lock also excludes threads, but it is not
//! reentrant: acquiring it twice from the same thread deadlocks.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::sync::atomic::{AtomicU32, Ordering};

const SPINS_BEFORE_YIELD: u32 = 128;
const YIELDS_BETWEEN_CHECKS: u32 = 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Acquired {
    /// The lock was free.
    Free,
    /// The lock was held by `previous`, a process that no longer exists.
    Recovered { previous: u32 },
}

pub(crate) struct ProcessLock<'a> {
    word: &'a AtomicU32,
}

impl<'a> ProcessLock<'a> {
    pub(crate) fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// Spins until the lock is held by `me`.
    pub(crate) fn acquire(&self, me: u32) -> Acquired {
        let mut spins: u32 = 0;
        let mut yields: u32 = 0;
        loop {
            let holder = match self
                .word
                .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return Acquired::Free,
                Err(holder) => holder,
            };

            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                core::hint::spin_loop();
                continue;
            }

            yields = yields.wrapping_add(1);
            if holder != 0 && yields % YIELDS_BETWEEN_CHECKS == 0 && !process_exists(holder) {
                if self
                    .word
                    .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Acquired::Recovered { previous: holder };
                }
                continue;
            }
            std::thread::yield_now();
        }
    }

    pub(crate) fn release(&self, me: u32) {
        debug_assert_eq!(self.word.load(Ordering::Relaxed), me);
        self.word.store(0, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn holder(&self) -> u32 {
        self.word.load(Ordering::Relaxed)
    }
}

/// True while `pid` is running. `kill(pid, 0)` also succeeds for zombies, and a zombie holder
/// may be a child of the very process waiting for its lock, which will not reap it meanwhile.
pub(crate) fn process_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH)) {
        return false;
    }
    !is_zombie(pid)
}

/// Reads the state letter of `/proc/<pid>/stat`, which follows the parenthesized command name.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next());
    matches!(state, Some('Z' | 'X'))
}

/// Without procfs, an exited process counts as alive until it is reaped.
#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

pub(crate) fn current_pid() -> u32 {
    std::process::id()
}
