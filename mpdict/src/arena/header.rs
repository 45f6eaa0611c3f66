// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The fixed header at offset 0 of every arena.
//!
//! ```text
//! +-------------+----------------------------------------------------------+
//! | ArenaHeader |                         Heap                             |
//! +-------------+----------------------------------------------------------+
//! 0             HEAP_START                                          size
//! ```
//!
//! Every field is an atomic so that a `&ArenaHeader` can be held by several processes at once.
//! `magic`, `version`, `size` and the heap bounds are written once before `ready` is published.
//! The allocator and directory fields are only touched while `lock` is held, so they use
//! `Relaxed` ordering; the lock's `Acquire`/`Release` pair orders them.

use super::region::Region;
use crate::error::{Result, ShmDictError};
use core::mem::size_of;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// "MPDICT" followed by the arena format generation.
pub(crate) const MAGIC: u64 = u64::from_le_bytes(*b"MPDICT\0\x01");

/// Bumped whenever the header, block or node layout changes.
pub(crate) const LAYOUT_VERSION: u32 = 1;

const READY: u32 = 1;
const RETIRED: u32 = 2;

/// First heap byte. Keeps the heap 64-byte aligned.
pub(crate) const HEAP_START: u64 = ((size_of::<ArenaHeader>() + 63) & !63) as u64;

#[repr(C)]
pub(crate) struct ArenaHeader {
    pub(crate) magic: AtomicU64,
    pub(crate) version: AtomicU32,
    /// 0 when free, otherwise the pid of the holder.
    pub(crate) lock: AtomicU32,
    /// 0 while the creator formats the region, then [`READY`], then [`RETIRED`] once the region
    /// was found abandoned.
    pub(crate) ready: AtomicU32,
    pub(crate) owner_pid: AtomicU32,
    /// Number of times the lock was taken over from a dead holder.
    pub(crate) lock_recoveries: AtomicU32,
    _reserved: AtomicU32,
    pub(crate) size: AtomicU64,
    pub(crate) heap_start: AtomicU64,
    pub(crate) heap_end: AtomicU64,
    /// Address-ordered free list, see [`super::allocator`].
    pub(crate) free_head: AtomicU64,
    pub(crate) free_bytes: AtomicU64,
    /// Head of the named-object directory.
    pub(crate) directory: AtomicU64,
}

const _: () = assert!(size_of::<ArenaHeader>() as u64 <= HEAP_START);
const _: () = assert!(HEAP_START % 16 == 0);

impl ArenaHeader {
    /// Borrows the header of `region`.
    ///
    /// # Safety
    /// The mapping behind `region` must outlive `'a`.
    pub(crate) unsafe fn at<'a>(region: Region) -> Result<&'a ArenaHeader> {
        if (region.len() as u64) < HEAP_START {
            return Err(ShmDictError::IncompatibleRegion(format!(
                "region of {} bytes cannot hold an arena header",
                region.len()
            )));
        }
        let ptr = region.ptr::<ArenaHeader>(0)?;
        Ok(&*ptr.as_ptr())
    }

    /// Writes the immutable part of a fresh header. The region must be zero-filled and not yet
    /// visible to anyone waiting on `ready`.
    pub(crate) fn initialize(&self, size: u64, owner_pid: u32) {
        self.magic.store(MAGIC, Ordering::Relaxed);
        self.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        self.size.store(size, Ordering::Relaxed);
        self.owner_pid.store(owner_pid, Ordering::Relaxed);
        self.heap_start.store(HEAP_START, Ordering::Relaxed);
        self.heap_end.store(size, Ordering::Relaxed);
        self.directory.store(0, Ordering::Relaxed);
    }

    pub(crate) fn publish(&self) {
        self.ready.store(READY, Ordering::Release);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) == READY
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.ready.load(Ordering::Acquire) == RETIRED
    }

    /// Marks the region as abandoned for good. Returns true for the single caller that did it.
    pub(crate) fn retire(&self) -> bool {
        self.ready.swap(RETIRED, Ordering::AcqRel) != RETIRED
    }

    /// Checks that a mapped region of `mapped_len` bytes is an arena this build understands.
    /// Only meaningful once [`ArenaHeader::is_ready`] returned true.
    pub(crate) fn validate(&self, mapped_len: usize) -> Result<()> {
        let magic = self.magic.load(Ordering::Relaxed);
        if magic != MAGIC {
            return Err(ShmDictError::IncompatibleRegion(format!(
                "bad magic {magic:#018x}"
            )));
        }
        let version = self.version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(ShmDictError::IncompatibleRegion(format!(
                "layout version {version}, expected {LAYOUT_VERSION}"
            )));
        }
        let size = self.size.load(Ordering::Relaxed);
        if size != mapped_len as u64 {
            return Err(ShmDictError::IncompatibleRegion(format!(
                "header records {size} bytes but {mapped_len} are mapped"
            )));
        }
        let heap_start = self.heap_start.load(Ordering::Relaxed);
        let heap_end = self.heap_end.load(Ordering::Relaxed);
        if heap_start != HEAP_START || heap_end > size || heap_end < heap_start {
            return Err(ShmDictError::IncompatibleRegion(format!(
                "heap bounds {heap_start}..{heap_end} do not fit {size} bytes"
            )));
        }
        Ok(())
    }
}
