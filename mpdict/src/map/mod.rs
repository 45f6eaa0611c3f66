// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ordered byte-string map living in a [`SharedArena`].
//!
//! The map is a named object of its arena: every process that opens the same arena and map name
//! operates on the same entries. Each operation takes the arena lock for its duration, except
//! [`SharedMap::len`] which reads a single atomic counter.

mod iter;
mod tree;

pub use iter::{KeyCursor, KeyEnumerator};

use crate::arena::{ArenaRef, SharedArena, ShmObject};
use crate::config::{validate_name, ArenaOptions, DEFAULT_KEY_LIMIT};
use crate::diagnostics::emit;
use crate::error::{Result, ShmDictError};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tree::Tree;

/// Root of one map, constructed in the arena directory.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct MapHeader {
    root: AtomicU64,
    len: AtomicU64,
}

// SAFETY: repr(C), atomics only, all zeroes is an empty map.
unsafe impl ShmObject for MapHeader {
    const TYPE_TAG: u64 = u64::from_le_bytes(*b"mpd:avl1");
}

pub struct SharedMap {
    arena: Arc<SharedArena>,
    header: NonNull<MapHeader>,
    name: String,
}

// SAFETY: `header` points into the arena mapping kept alive by `arena`, and MapHeader is only
// accessed through atomics.
unsafe impl Send for SharedMap {}
unsafe impl Sync for SharedMap {}

impl fmt::Debug for SharedMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMap")
            .field("name", &self.name)
            .field("arena", &self.arena)
            .field("len", &self.len())
            .finish()
    }
}

impl SharedMap {
    /// Opens the map `name` inside the arena `arena_name`, creating either when missing. An
    /// existing arena keeps its size; `capacity` only applies when it is created.
    pub fn open_or_create(name: &str, capacity: usize, arena_name: &str) -> Result<Self> {
        Self::open_or_create_with(name, arena_name, ArenaOptions::new(capacity))
    }

    pub fn open_or_create_with(name: &str, arena_name: &str, options: ArenaOptions) -> Result<Self> {
        validate_name(name, "map")?;
        let arena = SharedArena::open_or_create_with(arena_name, options)?;
        Self::open_in(Arc::new(arena), name)
    }

    /// Opens the map `name` in an arena that is already mapped, constructing it if needed.
    pub fn open_in(arena: Arc<SharedArena>, name: &str) -> Result<Self> {
        validate_name(name, "map")?;
        let header = {
            let guard = arena.lock();
            let (header, created): (ArenaRef<MapHeader>, bool) =
                guard.construct_or_find(name, MapHeader::default)?;
            if created {
                emit!(arena.diagnostics(), Debug, "constructed map {name:?}");
            }
            NonNull::from(arena.resolve(header)?)
        };
        Ok(Self {
            arena,
            header,
            name: name.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arena(&self) -> &Arc<SharedArena> {
        &self.arena
    }

    fn header(&self) -> &MapHeader {
        // SAFETY: see the Send/Sync impls.
        unsafe { self.header.as_ref() }
    }

    fn with_tree<R>(&self, f: impl FnOnce(&Tree<'_>) -> Result<R>) -> Result<R> {
        let guard = self.arena.lock();
        f(&Tree::new(&guard, self.header()))
    }

    /// Copy of the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_value(key, <[u8]>::to_vec)
    }

    /// Lends the value stored under `key` to `f` while the arena lock is held. `f` must not
    /// call back into this arena.
    pub fn with_value<R>(&self, key: &[u8], f: impl FnOnce(&[u8]) -> R) -> Result<Option<R>> {
        self.with_tree(|tree| tree.with_value(key, f))
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.with_value(key, |_| ())?.is_some())
    }

    /// Stores `value` under `key`. Returns true if an earlier value was replaced.
    ///
    /// Fails with [`ShmDictError::CapacityExhausted`] when the arena has no room left, in which
    /// case the map is unchanged.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        if u32::try_from(key.len()).is_err() {
            return Err(ShmDictError::malformed(format!(
                "key of {} bytes is too long",
                key.len()
            )));
        }
        let result = self.with_tree(|tree| tree.insert(key, value));
        if let Err(ShmDictError::CapacityExhausted { requested }) = &result {
            emit!(
                self.arena.diagnostics(),
                Warn,
                "map {:?}: out of shared memory storing {} bytes (allocation of {requested} failed)",
                self.name,
                key.len() + value.len()
            );
        }
        result
    }

    /// Removes `key`. Returns true if it was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.with_tree(|tree| tree.remove(key))
    }

    pub fn len(&self) -> usize {
        self.header().len.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `limit` keys in ascending order, read under a single lock acquisition.
    pub fn enumerate_keys(&self, limit: usize) -> Result<Vec<Vec<u8>>> {
        self.with_tree(|tree| {
            let mut keys = Vec::with_capacity(limit.min(self.len()));
            tree.walk(limit, |key| keys.push(key.to_vec()))?;
            Ok(keys)
        })
    }

    /// [`SharedMap::enumerate_keys`] with [`DEFAULT_KEY_LIMIT`].
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        self.enumerate_keys(DEFAULT_KEY_LIMIT)
    }

    /// Enumerates keys one lock acquisition at a time, see [`KeyCursor`].
    pub fn iter(&self) -> KeyEnumerator<'_> {
        KeyEnumerator::new(self)
    }

    pub(crate) fn key_after(&self, after: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        self.with_tree(|tree| tree.key_after(after))
    }

    /// Arena bytes consumed by an entry with the given key and value lengths. `None` on
    /// overflow.
    pub fn entry_footprint(key_len: usize, value_len: usize) -> Option<usize> {
        tree::entry_footprint(key_len, value_len)
    }
}

impl<'a> IntoIterator for &'a SharedMap {
    type Item = Result<Vec<u8>>;
    type IntoIter = KeyEnumerator<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
