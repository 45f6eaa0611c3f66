// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Result, ShmDictError};
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

/// One process's view of an arena: the local base address plus the region length.
///
/// Everything stored in the region refers to other parts of it by byte offset from the base. A
/// `Region` is the only place where such an offset becomes a local pointer, and every conversion
/// is checked against the region bounds and the target type's alignment. Offset `0` is the arena
/// header, so it doubles as "none" in links.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is a shared mapping; all mutation goes through raw pointer reads and writes
// performed while the arena lock is held, or through atomics.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// # Safety
    /// `base` must be valid for reads and writes of `len` bytes, aligned to at least 16 bytes,
    /// and stay mapped for as long as the `Region` or anything derived from it is used.
    pub(crate) unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Checks that `[offset, offset + size)` lies within the region and that `offset` is a
    /// multiple of `align`.
    #[inline]
    fn check(&self, offset: u64, size: usize, align: usize) -> Result<usize> {
        let start = usize::try_from(offset).map_err(|_| ShmDictError::corrupted(offset))?;
        let end = start
            .checked_add(size)
            .ok_or_else(|| ShmDictError::corrupted(offset))?;
        if end > self.len || start % align != 0 {
            return Err(ShmDictError::corrupted(offset));
        }
        Ok(start)
    }

    /// Local pointer to a `T` stored at `offset`.
    #[inline]
    pub(crate) fn ptr<T>(&self, offset: u64) -> Result<NonNull<T>> {
        let start = self.check(offset, size_of::<T>(), align_of::<T>())?;
        // SAFETY: start + size_of::<T>() <= len, checked above.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) }.cast())
    }

    /// Copies a `T` out of the region.
    #[inline]
    pub(crate) fn read<T: Copy>(&self, offset: u64) -> Result<T> {
        let ptr = self.ptr::<T>(offset)?;
        Ok(unsafe { ptr.as_ptr().read() })
    }

    /// Copies a `T` into the region.
    #[inline]
    pub(crate) fn write<T: Copy>(&self, offset: u64, value: T) -> Result<()> {
        let ptr = self.ptr::<T>(offset)?;
        unsafe { ptr.as_ptr().write(value) };
        Ok(())
    }

    /// Borrows `len` bytes at `offset`.
    ///
    /// The returned slice aliases shared memory: it must only be used while the arena lock is
    /// held, since another process may rewrite the bytes afterwards.
    #[inline]
    pub(crate) fn bytes(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let start = self.check(offset, len, 1)?;
        Ok(unsafe { core::slice::from_raw_parts(self.base.as_ptr().add(start), len) })
    }

    #[inline]
    pub(crate) fn copy_in(&self, offset: u64, src: &[u8]) -> Result<()> {
        let start = self.check(offset, src.len(), 1)?;
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(start), src.len())
        };
        Ok(())
    }

    /// Converts a local pointer into this region back into an offset.
    pub(crate) fn offset_of(&self, ptr: *const u8) -> Result<u64> {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        match addr.checked_sub(base) {
            Some(offset) if offset < self.len => Ok(offset as u64),
            _ => Err(ShmDictError::malformed(format!(
                "pointer {ptr:p} is outside the arena mapping"
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod heap {
    use super::Region;
    use core::ptr::NonNull;

    #[derive(Clone, Copy)]
    #[repr(C, align(64))]
    struct Line([u8; 64]);

    /// Zeroed, 64-byte aligned heap memory standing in for a mapping in unit tests.
    pub(crate) struct HeapRegion {
        buf: Vec<Line>,
        len: usize,
    }

    impl HeapRegion {
        pub(crate) fn new(len: usize) -> Self {
            Self {
                buf: vec![Line([0; 64]); len.div_ceil(64)],
                len,
            }
        }

        pub(crate) fn region(&mut self) -> Region {
            let base = NonNull::new(self.buf.as_mut_ptr() as *mut u8).unwrap();
            unsafe { Region::from_raw(base, self.len) }
        }
    }
}
