// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration types for arenas.

use crate::diagnostics::{self, Diagnostics};
use crate::error::{Result, ShmDictError};
use std::ffi::CString;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Arena name used when the caller does not provide one.
pub const DEFAULT_ARENA_NAME: &str = "mpdict";

/// Default upper bound on the number of keys returned by
/// [`SharedMap::enumerate_keys`](crate::SharedMap::enumerate_keys).
pub const DEFAULT_KEY_LIMIT: usize = 999;

/// Longest accepted arena or map name, in bytes (POSIX `NAME_MAX`).
pub const MAX_NAME_LEN: usize = 255;

/// When the OS-level name of a created arena is removed.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum UnlinkPolicy {
    /// The name stays discoverable until the owning arena is dropped or destroyed. Other
    /// processes can attach by name in the meantime.
    #[default]
    OnDestroy,
    /// The name is removed right after creation. The region lives on through the creator's
    /// mapping and can only be shared with processes that inherit it (e.g. via `fork`).
    OnCreate,
}

/// Options for creating or opening a [`SharedArena`](crate::SharedArena).
#[derive(Clone)]
pub struct ArenaOptions {
    capacity: usize,
    unlink: UnlinkPolicy,
    clear_stale: bool,
    open_timeout: Duration,
    diagnostics: Arc<dyn Diagnostics>,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        Self {
            capacity: 0,
            unlink: UnlinkPolicy::default(),
            clear_stale: false,
            open_timeout: Duration::from_secs(1),
            diagnostics: diagnostics::noop(),
        }
    }
}

impl fmt::Debug for ArenaOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaOptions")
            .field("capacity", &self.capacity)
            .field("unlink", &self.unlink)
            .field("clear_stale", &self.clear_stale)
            .field("open_timeout", &self.open_timeout)
            .finish_non_exhaustive()
    }
}

impl ArenaOptions {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Requested data capacity in bytes. The mapped size is rounded up to whole pages and gets
    /// allocator slack on top, see [`ArenaOptions::region_size`].
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn unlink_policy(mut self, unlink: UnlinkPolicy) -> Self {
        self.unlink = unlink;
        self
    }

    /// Remove any region left under the same name before creating a new one.
    ///
    /// Without this, [`SharedArena::open_or_create`](crate::SharedArena::open_or_create) attaches
    /// to whatever a previous run left behind.
    pub fn clear_stale(mut self, clear_stale: bool) -> Self {
        self.clear_stale = clear_stale;
        self
    }

    /// How long an opener waits for the creator to finish initializing the region.
    pub fn open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn get_capacity(&self) -> usize {
        self.capacity
    }

    pub fn get_unlink_policy(&self) -> UnlinkPolicy {
        self.unlink
    }

    pub fn get_clear_stale(&self) -> bool {
        self.clear_stale
    }

    pub fn get_open_timeout(&self) -> Duration {
        self.open_timeout
    }

    pub fn get_diagnostics(&self) -> &Arc<dyn Diagnostics> {
        &self.diagnostics
    }

    /// Bytes actually reserved for the requested capacity: whole pages covering the capacity,
    /// plus slack pages for the header and allocator metadata.
    pub fn region_size(&self) -> usize {
        region_size_for(self.capacity, page_size::get())
    }
}

pub(crate) fn region_size_for(capacity: usize, page: usize) -> usize {
    page.saturating_mul(2usize.saturating_add(capacity / page))
}

/// Validates a user-supplied arena name and turns it into the OS-level shm path (`/name`).
pub(crate) fn shm_path(name: &str) -> Result<CString> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    validate_name(bare, "arena")?;
    if bare.contains('/') {
        return Err(ShmDictError::malformed(format!(
            "arena name {name:?} must not contain '/'"
        )));
    }
    CString::new(format!("/{bare}")).map_err(|_| ShmDictError::malformed("arena name contains NUL"))
}

/// Validates a name stored in an arena's named-object directory.
pub(crate) fn validate_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ShmDictError::malformed(format!("{what} name is empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ShmDictError::malformed(format!(
            "{what} name is {} bytes, limit is {MAX_NAME_LEN}",
            name.len()
        )));
    }
    if name.as_bytes().contains(&0) {
        return Err(ShmDictError::malformed(format!("{what} name contains NUL")));
    }
    Ok(())
}
