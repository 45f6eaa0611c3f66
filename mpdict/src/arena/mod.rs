// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size shared memory arena.
//!
//! A [`SharedArena`] maps one shared memory object and manages it as a heap: an
//! [`ArenaHeader`](header::ArenaHeader) at offset 0, then blocks handed out by
//! [`ShmAllocator`]. Nothing in the region ever stores a process-local address, so any process
//! that maps the object, at whatever base address, sees the same structures.
//!
//! Access to the heap is serialized by a process-shared lock in the header. [`SharedArena::lock`]
//! returns an [`ArenaGuard`] that releases it on drop; the allocator and the named-object
//! directory are only reachable through a guard.
//!
//! Named objects are how independent processes find the same structure: the first
//! [`ArenaGuard::construct_or_find`] for a name allocates and initializes the object and records
//! it in the directory, later calls from any process get the same [`ArenaRef`] back.

mod allocator;
mod header;
mod lock;
pub(crate) mod region;

pub use allocator::ShmAllocator;

use crate::config::{shm_path, validate_name, ArenaOptions, UnlinkPolicy};
use crate::diagnostics::{emit, Diagnostics};
use crate::error::{Result, ShmDictError};
use crate::platform::{FileBackedHandle, MappedMem, NamedShmHandle, ShmHandle};
use header::{ArenaHeader, HEAP_START};
use lock::{current_pid, process_exists, Acquired, ProcessLock};
use region::Region;
use std::ffi::{CStr, CString};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::num::NonZeroU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Offset of an allocation from the start of an arena. Never 0, which is the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShmOffset(NonZeroU64);

impl ShmOffset {
    pub fn new(offset: u64) -> Option<Self> {
        NonZeroU64::new(offset).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Types that may be constructed inside an arena and referenced from several processes at once.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, contain no pointers, references or other process-local
/// state, accept every bit pattern (including all zeroes) as a valid value, and only allow
/// mutation through `&self` via atomics. Their alignment must not exceed 16 bytes.
pub unsafe trait ShmObject: Sized {
    /// Distinguishes object types sharing the directory. Must be unique per type and layout.
    const TYPE_TAG: u64;
}

/// Typed offset of a named object inside an arena.
pub struct ArenaRef<T> {
    offset: ShmOffset,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ArenaRef<T> {
    pub fn from_offset(offset: ShmOffset) -> Self {
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    pub fn offset(&self) -> ShmOffset {
        self.offset
    }
}

impl<T> Clone for ArenaRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArenaRef<T> {}

impl<T> PartialEq for ArenaRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for ArenaRef<T> {}

impl<T> fmt::Debug for ArenaRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ArenaRef").field(&self.offset.get()).finish()
    }
}

/// Point-in-time figures about an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Mapped size in bytes.
    pub size: usize,
    /// Bytes managed by the allocator.
    pub heap_size: usize,
    /// Bytes currently in free blocks.
    pub free_bytes: usize,
    /// How often the lock was taken over from an exited process.
    pub lock_recoveries: u32,
    /// Pid of the process that created the arena.
    pub owner_pid: u32,
}

enum Mapping {
    Named(MappedMem<NamedShmHandle>),
    Anonymous(MappedMem<ShmHandle>),
}

impl Mapping {
    fn len(&self) -> usize {
        match self {
            Mapping::Named(mem) => mem.get_size(),
            Mapping::Anonymous(mem) => mem.get_size(),
        }
    }

    fn region(&self) -> Region {
        let base = match self {
            Mapping::Named(mem) => mem.as_ptr(),
            Mapping::Anonymous(mem) => mem.as_ptr(),
        };
        // SAFETY: mmap returns page-aligned memory valid for the mapped size; the mapping lives
        // as long as the arena that owns this `Mapping`.
        unsafe { Region::from_raw(base, self.len()) }
    }
}

/// Directory record, followed in memory by `name_len` name bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct DirEntry {
    next: u64,
    object: u64,
    type_tag: u64,
    name_len: u64,
}

const DIR_ENTRY_SIZE: u64 = size_of::<DirEntry>() as u64;

/// A shared memory region managed as a heap, see the [module documentation](self).
pub struct SharedArena {
    mapping: Mapping,
    region: Region,
    path: Option<CString>,
    /// Pid of the process that created the region through this value. A forked child inherits
    /// the value but not the ownership.
    creator: Option<u32>,
    unlink: UnlinkPolicy,
    diagnostics: Arc<dyn Diagnostics>,
}

impl fmt::Debug for SharedArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedArena")
            .field("path", &self.path)
            .field("size", &self.region.len())
            .field("owner", &self.is_owner())
            .finish_non_exhaustive()
    }
}

impl SharedArena {
    /// Attaches to the arena called `name`, creating it with room for `capacity` bytes if it
    /// does not exist yet.
    pub fn open_or_create(name: &str, capacity: usize) -> Result<Self> {
        Self::open_or_create_with(name, ArenaOptions::new(capacity))
    }

    /// Like [`SharedArena::open_or_create`]. A region left behind by a creator that exited
    /// without removing it is discarded and replaced by a new one.
    pub fn open_or_create_with(name: &str, options: ArenaOptions) -> Result<Self> {
        let path = shm_path(name)?;
        if options.get_clear_stale() {
            Self::clear(&path, &options)?;
        }
        // The region found by a failed create can be unlinked before we open it, by its owner
        // or because it was abandoned. Retry until the open timeout.
        let deadline = Instant::now() + options.get_open_timeout();
        loop {
            match Self::create_at(path.clone(), &options) {
                Err(ShmDictError::RegionCreateConflict { .. }) => {}
                other => return other,
            }
            match Self::open_at(path.clone(), &options, true) {
                Err(ShmDictError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {}
                Err(ShmDictError::StaleRegion { .. }) => {}
                other => return other,
            }
            Self::wait_until(deadline, &path, "kept disappearing while being opened")?;
        }
    }

    /// Creates a new arena called `name`. Fails with [`ShmDictError::RegionCreateConflict`] if
    /// the name is taken, unless [`ArenaOptions::clear_stale`] is set.
    pub fn create(name: &str, options: ArenaOptions) -> Result<Self> {
        let path = shm_path(name)?;
        if options.get_clear_stale() {
            Self::clear(&path, &options)?;
        }
        Self::create_at(path, &options)
    }

    /// Attaches to an existing arena called `name`. Only the diagnostics sink and open timeout
    /// of `options` are used. Fails with [`ShmDictError::StaleRegion`] if the process that
    /// created it exited without removing it.
    pub fn open(name: &str, options: ArenaOptions) -> Result<Self> {
        Self::open_at(shm_path(name)?, &options, false)
    }

    /// Creates an arena without a name. It can only be shared with processes that inherit the
    /// mapping, e.g. children created by `fork`.
    pub fn anonymous(options: ArenaOptions) -> Result<Self> {
        let size = options.region_size();
        let mapping = Mapping::Anonymous(ShmHandle::new(size)?.map()?);
        let arena = Self::from_mapping(mapping, None, Some(current_pid()), &options);
        arena.format()?;
        emit!(arena.diagnostics, Debug, "created anonymous arena of {size} bytes");
        Ok(arena)
    }

    fn clear(path: &CStr, options: &ArenaOptions) -> Result<()> {
        NamedShmHandle::unlink(path)?;
        emit!(
            options.get_diagnostics(),
            Debug,
            "cleared any stale region named {path:?}"
        );
        Ok(())
    }

    fn from_mapping(
        mapping: Mapping,
        path: Option<CString>,
        creator: Option<u32>,
        options: &ArenaOptions,
    ) -> Self {
        let region = mapping.region();
        Self {
            mapping,
            region,
            path,
            creator,
            unlink: options.get_unlink_policy(),
            diagnostics: options.get_diagnostics().clone(),
        }
    }

    fn create_at(path: CString, options: &ArenaOptions) -> Result<Self> {
        let size = options.region_size();
        let handle = NamedShmHandle::create_exclusive(path.clone(), size).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                ShmDictError::RegionCreateConflict {
                    name: path.to_string_lossy().into_owned(),
                }
            } else {
                ShmDictError::Io(e)
            }
        })?;
        let mapping = match handle.map() {
            Ok(mem) => Mapping::Named(mem),
            Err(e) => {
                _ = NamedShmHandle::unlink(&path);
                return Err(e.into());
            }
        };
        // From here on, dropping `arena` on error unlinks the name again.
        let arena = Self::from_mapping(mapping, Some(path), Some(current_pid()), options);
        arena.format()?;
        emit!(
            arena.diagnostics,
            Debug,
            "created arena {:?} of {size} bytes",
            arena.path
        );

        if arena.unlink == UnlinkPolicy::OnCreate {
            if let Some(path) = &arena.path {
                NamedShmHandle::unlink(path)?;
                emit!(
                    arena.diagnostics,
                    Debug,
                    "unlinked {path:?} right after creation; it can no longer be opened by name"
                );
            }
        }
        Ok(arena)
    }

    /// Maps the existing region at `path`. A region whose creator exited is refused; with
    /// `reclaim` the first process to notice also unlinks it.
    fn open_at(path: CString, options: &ArenaOptions, reclaim: bool) -> Result<Self> {
        let deadline = Instant::now() + options.get_open_timeout();
        let handle = loop {
            let handle = NamedShmHandle::open(path.clone())?;
            if handle.get_size() as u64 >= HEAP_START {
                break handle;
            }
            Self::wait_until(deadline, &path, "was never sized")?;
        };
        let mapping = Mapping::Named(handle.map()?);
        let arena = Self::from_mapping(mapping, Some(path.clone()), None, options);

        // SAFETY: the mapping is owned by `arena`, which outlives every use of `header`.
        let header = unsafe { ArenaHeader::at(arena.region)? };
        loop {
            // 0 until the creator initialized the header.
            let owner = header.owner_pid.load(Ordering::Relaxed);
            if header.is_retired() || (owner != 0 && !process_exists(owner)) {
                return Err(arena.abandoned(header, owner, reclaim));
            }
            if header.is_ready() {
                break;
            }
            Self::wait_until(deadline, &path, "was never initialized")?;
        }
        header.validate(arena.region.len())?;
        emit!(
            arena.diagnostics,
            Debug,
            "opened arena {:?} of {} bytes",
            arena.path,
            arena.region.len()
        );
        Ok(arena)
    }

    fn abandoned(&self, header: &ArenaHeader, owner: u32, reclaim: bool) -> ShmDictError {
        let name = self
            .path
            .as_deref()
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default();
        if reclaim && header.retire() {
            if let Some(path) = &self.path {
                match NamedShmHandle::unlink(path) {
                    Ok(()) => emit!(
                        self.diagnostics,
                        Warn,
                        "discarded arena {path:?} left behind by exited process {owner}"
                    ),
                    Err(e) => emit!(
                        self.diagnostics,
                        Error,
                        "failed to unlink abandoned arena {path:?}: {e}"
                    ),
                }
            }
        }
        ShmDictError::StaleRegion {
            name,
            owner_pid: owner,
        }
    }

    fn wait_until(deadline: Instant, path: &CStr, what: &str) -> Result<()> {
        if Instant::now() >= deadline {
            return Err(ShmDictError::IncompatibleRegion(format!(
                "region {path:?} {what}"
            )));
        }
        std::thread::sleep(Duration::from_millis(1));
        Ok(())
    }

    fn format(&self) -> Result<()> {
        let header = self.header();
        let size = self.region.len() as u64;
        header.initialize(size, current_pid());
        ShmAllocator::new(self.region, header).format(HEAP_START, size)?;
        header.publish();
        Ok(())
    }

    fn header(&self) -> &ArenaHeader {
        // SAFETY: every constructor maps at least HEAP_START bytes (checked when opening,
        // guaranteed by region_size() when creating), and the mapping lives as long as `self`.
        unsafe { &*self.region.base().as_ptr().cast::<ArenaHeader>() }
    }

    /// Removes the arena's name from the OS namespace and unmaps it. Processes that still have
    /// it mapped keep working on their mapping; the name can be reused right away.
    pub fn destroy(mut self) -> Result<()> {
        self.creator = None;
        if let Some(path) = &self.path {
            NamedShmHandle::unlink(path)?;
            emit!(self.diagnostics, Debug, "destroyed arena {path:?}");
        }
        Ok(())
    }

    /// Acquires the arena lock, waiting for other threads and processes to release it.
    pub fn lock(&self) -> ArenaGuard<'_> {
        let header = self.header();
        let pid = current_pid();
        if let Acquired::Recovered { previous } = ProcessLock::new(&header.lock).acquire(pid) {
            header.lock_recoveries.fetch_add(1, Ordering::Relaxed);
            emit!(
                self.diagnostics,
                Warn,
                "arena {:?}: took over the lock from exited process {previous}; structures it was modifying may be inconsistent",
                self.path
            );
        }
        ArenaGuard { arena: self, pid }
    }

    /// Borrows a named object found or constructed through an [`ArenaGuard`].
    pub fn resolve<T: ShmObject>(&self, object: ArenaRef<T>) -> Result<&T> {
        let ptr = self.region.ptr::<T>(object.offset.get())?;
        // SAFETY: in bounds and aligned (checked by ptr), every bit pattern is a valid T and T
        // is only mutated through atomics (ShmObject contract).
        Ok(unsafe { &*ptr.as_ptr() })
    }

    pub fn stats(&self) -> ArenaStats {
        let header = self.header();
        let heap_start = header.heap_start.load(Ordering::Relaxed);
        let heap_end = header.heap_end.load(Ordering::Relaxed);
        ArenaStats {
            size: self.region.len(),
            heap_size: heap_end.saturating_sub(heap_start) as usize,
            free_bytes: header.free_bytes.load(Ordering::Relaxed) as usize,
            lock_recoveries: header.lock_recoveries.load(Ordering::Relaxed),
            owner_pid: header.owner_pid.load(Ordering::Relaxed),
        }
    }

    /// OS-level name, `None` for anonymous arenas.
    pub fn path(&self) -> Option<&CStr> {
        self.path.as_deref()
    }

    pub fn is_named(&self) -> bool {
        self.path.is_some()
    }

    /// True in the process that created the arena through this value.
    pub fn is_owner(&self) -> bool {
        self.creator == Some(current_pid())
    }

    pub fn size(&self) -> usize {
        self.mapping.len()
    }

    pub(crate) fn diagnostics(&self) -> &dyn Diagnostics {
        &*self.diagnostics
    }
}

impl Drop for SharedArena {
    fn drop(&mut self) {
        if !self.is_owner() || self.unlink != UnlinkPolicy::OnDestroy {
            return;
        }
        if let Some(path) = &self.path {
            match NamedShmHandle::unlink(path) {
                Ok(()) => emit!(self.diagnostics, Debug, "unlinked arena {path:?}"),
                Err(e) => emit!(self.diagnostics, Error, "failed to unlink arena {path:?}: {e}"),
            }
        }
    }
}

/// Exclusive access to an arena's heap. The lock is released when the guard is dropped.
pub struct ArenaGuard<'a> {
    arena: &'a SharedArena,
    pid: u32,
}

impl<'a> ArenaGuard<'a> {
    pub fn arena(&self) -> &'a SharedArena {
        self.arena
    }

    pub fn allocator(&self) -> ShmAllocator<'_> {
        ShmAllocator::new(self.arena.region, self.arena.header())
    }

    pub(crate) fn region(&self) -> Region {
        self.arena.region
    }

    /// Returns the object registered under `name`, constructing it with `init` if there is
    /// none. The boolean is true if this call constructed it.
    ///
    /// Fails with [`ShmDictError::TypeMismatch`] if `name` holds an object of another type, and
    /// with [`ShmDictError::CapacityExhausted`] (leaving the directory unchanged) if there is no
    /// room for the object.
    pub fn construct_or_find<T: ShmObject>(
        &self,
        name: &str,
        init: impl FnOnce() -> T,
    ) -> Result<(ArenaRef<T>, bool)> {
        validate_name(name, "object")?;
        if let Some(found) = self.find::<T>(name)? {
            return Ok((found, false));
        }
        if align_of::<T>() > 16 {
            return Err(ShmDictError::malformed(format!(
                "objects aligned to {} bytes cannot be placed in an arena",
                align_of::<T>()
            )));
        }

        let region = self.region();
        let alloc = self.allocator();
        let object = alloc.allocate(size_of::<T>())?;
        let entry = match alloc.allocate(DIR_ENTRY_SIZE as usize + name.len()) {
            Ok(entry) => entry,
            Err(e) => {
                alloc.deallocate(object)?;
                return Err(e);
            }
        };

        let ptr = region.ptr::<T>(object.get())?;
        // SAFETY: freshly allocated, in bounds and aligned; nobody else can see it yet.
        unsafe { ptr.as_ptr().write(init()) };

        let header = self.arena.header();
        region.write(
            entry.get(),
            DirEntry {
                next: header.directory.load(Ordering::Relaxed),
                object: object.get(),
                type_tag: T::TYPE_TAG,
                name_len: name.len() as u64,
            },
        )?;
        region.copy_in(entry.get() + DIR_ENTRY_SIZE, name.as_bytes())?;
        header.directory.store(entry.get(), Ordering::Relaxed);
        Ok((ArenaRef::from_offset(object), true))
    }

    /// Looks up the object registered under `name`.
    pub fn find<T: ShmObject>(&self, name: &str) -> Result<Option<ArenaRef<T>>> {
        let region = self.region();
        // Each entry occupies at least DIR_ENTRY_SIZE bytes, which bounds a sane walk.
        let mut budget = region.len() as u64 / DIR_ENTRY_SIZE;
        let mut cur = self.arena.header().directory.load(Ordering::Relaxed);
        while cur != 0 {
            budget = budget
                .checked_sub(1)
                .ok_or_else(|| ShmDictError::corrupted(cur))?;
            let entry: DirEntry = region.read(cur)?;
            let stored = region.bytes(cur + DIR_ENTRY_SIZE, entry.name_len as usize)?;
            if stored == name.as_bytes() {
                if entry.type_tag != T::TYPE_TAG {
                    return Err(ShmDictError::TypeMismatch {
                        name: name.to_owned(),
                    });
                }
                let offset =
                    ShmOffset::new(entry.object).ok_or_else(|| ShmDictError::corrupted(cur))?;
                return Ok(Some(ArenaRef::from_offset(offset)));
            }
            cur = entry.next;
        }
        Ok(None)
    }
}

impl Drop for ArenaGuard<'_> {
    fn drop(&mut self) {
        ProcessLock::new(&self.arena.header().lock).release(self.pid);
    }
}
