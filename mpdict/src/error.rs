// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for `mpdict`.

use std::io;
use thiserror::Error;

pub type Result<T, E = ShmDictError> = std::result::Result<T, E>;

/// Errors that can occur while creating, opening or operating on a shared arena or map.
#[derive(Debug, Error)]
pub enum ShmDictError {
    /// The arena has no free block large enough for the request. The operation that hit this
    /// left the map unchanged.
    #[error("shared arena exhausted: no room for {requested} bytes")]
    CapacityExhausted {
        /// Payload size of the allocation that failed.
        requested: usize,
    },

    /// A key, value or name was not acceptable. Nothing was mutated.
    #[error("malformed argument: {0}")]
    MalformedArgument(String),

    /// An exclusive create found a live region under the same name.
    #[error("a shared memory region named {name:?} already exists")]
    RegionCreateConflict {
        /// The OS-level name, including the leading `/`.
        name: String,
    },

    /// The mapped region is not an arena of this build (magic, version or size mismatch), or its
    /// creator never finished initializing it.
    #[error("incompatible shared memory region: {0}")]
    IncompatibleRegion(String),

    /// The region was created by a process that exited without removing it. Its content is
    /// never handed out again; [`crate::SharedArena::open_or_create`] replaces it.
    #[error("shared memory region {name:?} was left behind by exited process {owner_pid}")]
    StaleRegion { name: String, owner_pid: u32 },

    /// A named object exists in the arena but was constructed with a different type.
    #[error("named object {name:?} exists with a different type")]
    TypeMismatch { name: String },

    /// An offset read from the shared region failed a bounds, alignment or tag check.
    #[error("corrupted shared structure at offset {offset:#x}")]
    CorruptedStructure { offset: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<nix::Error> for ShmDictError {
    fn from(value: nix::Error) -> Self {
        ShmDictError::Io(value.into())
    }
}

impl ShmDictError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        ShmDictError::MalformedArgument(message.into())
    }

    pub(crate) fn corrupted(offset: u64) -> Self {
        ShmDictError::CorruptedStructure { offset }
    }

    /// Returns true for [`ShmDictError::CapacityExhausted`].
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, ShmDictError::CapacityExhausted { .. })
    }
}
