// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mpdict::ShmDictError;
use std::ptr::{self, NonNull};

/// Borrowed bytes passed in by the caller. A null `ptr` is only valid with `len == 0`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ByteSlice {
    pub ptr: *const u8,
    pub len: usize,
}

impl ByteSlice {
    pub const fn empty() -> Self {
        Self {
            ptr: ptr::null(),
            len: 0,
        }
    }

    /// # Safety
    /// A non-null `ptr` must be valid for reads of `len` bytes for the lifetime `'a`.
    pub unsafe fn as_bytes<'a>(&self) -> Result<&'a [u8], ShmDictError> {
        match NonNull::new(self.ptr.cast_mut()) {
            Some(ptr) => Ok(std::slice::from_raw_parts(ptr.as_ptr(), self.len)),
            None if self.len == 0 => Ok(&[]),
            None => Err(ShmDictError::MalformedArgument(format!(
                "null pointer with length {}",
                self.len
            ))),
        }
    }

    /// # Safety
    /// Same as [`ByteSlice::as_bytes`].
    pub unsafe fn as_str<'a>(&self, what: &str) -> Result<&'a str, ShmDictError> {
        std::str::from_utf8(self.as_bytes()?)
            .map_err(|_| ShmDictError::MalformedArgument(format!("{what} is not valid UTF-8")))
    }
}

impl From<&[u8]> for ByteSlice {
    fn from(bytes: &[u8]) -> Self {
        Self {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        }
    }
}

/// Bytes allocated by this library. Release with `mpdict_bytes_drop`.
#[repr(C)]
#[derive(Debug)]
pub struct OwnedBytes {
    pub ptr: *mut u8,
    pub len: usize,
}

impl OwnedBytes {
    pub const fn empty() -> Self {
        Self {
            ptr: ptr::null_mut(),
            len: 0,
        }
    }

    /// # Safety
    /// `self` must be empty or come from `OwnedBytes::from`, and not have been released yet.
    pub(crate) unsafe fn release(&mut self) {
        if !self.ptr.is_null() {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr, self.len)));
        }
        *self = Self::empty();
    }

    #[cfg(test)]
    pub(crate) fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl From<Vec<u8>> for OwnedBytes {
    fn from(bytes: Vec<u8>) -> Self {
        let boxed = bytes.into_boxed_slice();
        let len = boxed.len();
        Self {
            ptr: Box::into_raw(boxed).cast(),
            len,
        }
    }
}

/// Keys returned by `mpdict_keys`. Release with `mpdict_key_list_drop`.
#[repr(C)]
#[derive(Debug)]
pub struct KeyList {
    pub keys: *mut OwnedBytes,
    pub len: usize,
}

impl KeyList {
    pub const fn empty() -> Self {
        Self {
            keys: ptr::null_mut(),
            len: 0,
        }
    }

    /// # Safety
    /// `self` must be empty or come from `KeyList::from`, and not have been released yet.
    pub(crate) unsafe fn release(&mut self) {
        if !self.keys.is_null() {
            let mut keys = Box::from_raw(ptr::slice_from_raw_parts_mut(self.keys, self.len));
            for key in keys.iter_mut() {
                key.release();
            }
        }
        *self = Self::empty();
    }

    #[cfg(test)]
    pub(crate) fn as_slice(&self) -> &[OwnedBytes] {
        if self.keys.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.keys, self.len) }
    }
}

impl From<Vec<Vec<u8>>> for KeyList {
    fn from(keys: Vec<Vec<u8>>) -> Self {
        let boxed: Box<[OwnedBytes]> = keys.into_iter().map(OwnedBytes::from).collect();
        let len = boxed.len();
        Self {
            keys: Box::into_raw(boxed).cast(),
            len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_slice_needs_zero_length() {
        assert_eq!(unsafe { ByteSlice::empty().as_bytes() }.unwrap(), b"");
        let bad = ByteSlice {
            ptr: ptr::null(),
            len: 3,
        };
        assert!(matches!(
            unsafe { bad.as_bytes() },
            Err(ShmDictError::MalformedArgument(_))
        ));
    }

    #[test]
    fn invalid_utf8_names() {
        let bytes: &[u8] = &[0xff, 0xfe];
        assert!(unsafe { ByteSlice::from(bytes).as_str("name") }.is_err());
        let bytes: &[u8] = b"ok";
        assert_eq!(unsafe { ByteSlice::from(bytes).as_str("name") }.unwrap(), "ok");
    }

    #[test]
    fn owned_values_release_once() {
        let mut bytes = OwnedBytes::from(b"abc".to_vec());
        assert_eq!(bytes.as_slice(), b"abc");
        unsafe { bytes.release() };
        assert!(bytes.ptr.is_null());
        unsafe { bytes.release() };

        let mut list = KeyList::from(vec![b"a".to_vec(), Vec::new()]);
        assert_eq!(list.len, 2);
        assert_eq!(list.as_slice()[0].as_slice(), b"a");
        assert_eq!(list.as_slice()[1].as_slice(), b"");
        unsafe { list.release() };
        assert_eq!(list.len, 0);
    }
}
