// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]
#![cfg(unix)]

//! C interface to [`mpdict`].
//!
//! Every function returns an [`MpdictStatus`]. On failure, a description of the error is kept
//! per thread and can be read with [`mpdict_last_error`]. Panics never cross the boundary.

mod iter;
mod logger;
mod map;
mod slice;

pub use iter::*;
pub use logger::*;
pub use map::*;
pub use slice::*;

use mpdict::ShmDictError;
use std::cell::RefCell;
use std::ffi::{c_char, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MpdictStatus {
    Ok = 0,
    CapacityExhausted = 1,
    MalformedArgument = 2,
    RegionCreateConflict = 3,
    IncompatibleRegion = 4,
    TypeMismatch = 5,
    CorruptedStructure = 6,
    Io = 7,
    /// Any other failure, including panics.
    Internal = 8,
    StaleRegion = 9,
}

impl MpdictStatus {
    fn of(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<ShmDictError>() {
            Some(ShmDictError::CapacityExhausted { .. }) => Self::CapacityExhausted,
            Some(ShmDictError::MalformedArgument(_)) => Self::MalformedArgument,
            Some(ShmDictError::RegionCreateConflict { .. }) => Self::RegionCreateConflict,
            Some(ShmDictError::IncompatibleRegion(_)) => Self::IncompatibleRegion,
            Some(ShmDictError::StaleRegion { .. }) => Self::StaleRegion,
            Some(ShmDictError::TypeMismatch { .. }) => Self::TypeMismatch,
            Some(ShmDictError::CorruptedStructure { .. }) => Self::CorruptedStructure,
            Some(ShmDictError::Io(_)) => Self::Io,
            None => Self::Internal,
        }
    }

    const fn message(self) -> &'static std::ffi::CStr {
        match self {
            Self::Ok => c"ok",
            Self::CapacityExhausted => c"out of shared memory",
            Self::MalformedArgument => c"malformed argument",
            Self::RegionCreateConflict => c"shared memory region already exists",
            Self::IncompatibleRegion => c"incompatible shared memory region",
            Self::TypeMismatch => c"named object has another type",
            Self::CorruptedStructure => c"corrupted shared structure",
            Self::Io => c"operating system error",
            Self::Internal => c"internal error",
            Self::StaleRegion => c"shared memory region was abandoned by its creator",
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(message: String) {
    // Interior NULs cannot come from our messages, but a name echoed back could carry one.
    let message = CString::new(message.replace('\0', "\\0")).ok();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = message);
}

/// Runs `body`, turning errors and panics into a status and the thread's last error.
pub(crate) fn ffi_call(
    function_name: &str,
    body: impl FnOnce() -> anyhow::Result<()>,
) -> MpdictStatus {
    let result = catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| payload.downcast_ref::<&str>().copied())
            .unwrap_or("unable to retrieve panic context");
        Err(anyhow::anyhow!("(panic) {reason}"))
    });
    match result {
        Ok(()) => MpdictStatus::Ok,
        Err(error) => {
            let status = MpdictStatus::of(&error);
            set_last_error(format!("{function_name} failed: {error:#}"));
            status
        }
    }
}

pub(crate) fn malformed(message: &str) -> anyhow::Error {
    ShmDictError::MalformedArgument(message.to_owned()).into()
}

/// Static description of `status`.
#[no_mangle]
pub extern "C" fn mpdict_status_message(status: MpdictStatus) -> *const c_char {
    status.message().as_ptr()
}

/// Description of the last error on the calling thread, or null if no call failed yet. The
/// string stays valid until the next failing call on the same thread.
#[no_mangle]
pub extern "C" fn mpdict_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(ptr::null(), |s| s.as_ptr()))
}

#[cfg(test)]
pub(crate) mod test_utils {
    use crate::{mpdict_open, ByteSlice, MpdictMap, MpdictStatus};
    use std::ptr;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) fn slice(bytes: &[u8]) -> ByteSlice {
        bytes.into()
    }

    /// Opens map "t1" in a fresh arena.
    pub(crate) fn open_map(prefix: &str) -> *mut MpdictMap {
        let arena = unique_name(prefix);
        let mut dict = ptr::null_mut();
        let status = unsafe { mpdict_open(slice(b"t1"), 1 << 16, slice(arena.as_bytes()), &mut dict) };
        assert_eq!(status, MpdictStatus::Ok);
        dict
    }

    pub(crate) fn unique_name(prefix: &str) -> String {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        format!(
            "mpdict-ffi-{prefix}-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn errors_map_to_statuses() {
        let status = ffi_call("test", || {
            Err(ShmDictError::CapacityExhausted { requested: 10 }.into())
        });
        assert_eq!(status, MpdictStatus::CapacityExhausted);
        let message = unsafe { CStr::from_ptr(mpdict_last_error()) };
        assert!(message.to_str().unwrap().starts_with("test failed"));

        assert_eq!(
            ffi_call("test", || Err(anyhow::anyhow!("other"))),
            MpdictStatus::Internal
        );
        assert_eq!(ffi_call("test", || Ok(())), MpdictStatus::Ok);

        let stale = ShmDictError::StaleRegion {
            name: "/mpdict".to_owned(),
            owner_pid: 42,
        };
        assert_eq!(
            ffi_call("test", || Err(stale.into())),
            MpdictStatus::StaleRegion
        );
    }

    #[test]
    fn panics_are_caught() {
        let status = ffi_call("boom", || panic!("exploded"));
        assert_eq!(status, MpdictStatus::Internal);
        let message = unsafe { CStr::from_ptr(mpdict_last_error()) };
        assert!(message.to_str().unwrap().contains("exploded"));
    }

    #[test]
    fn status_messages_are_static() {
        let message = unsafe { CStr::from_ptr(mpdict_status_message(MpdictStatus::Io)) };
        assert_eq!(message.to_str().unwrap(), "operating system error");
    }
}
