// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{ffi_call, malformed, ByteSlice, KeyList, MpdictStatus, OwnedBytes};
use function_name::named;
use mpdict::{ArenaOptions, SharedMap, TracingDiagnostics, DEFAULT_ARENA_NAME};
use std::sync::Arc;

/// Opaque handle to a map. Iterators keep their own reference, so dropping the handle while
/// an iterator is alive is fine.
pub struct MpdictMap {
    pub(crate) map: Arc<SharedMap>,
}

pub(crate) unsafe fn map_ref<'a>(dict: *const MpdictMap) -> anyhow::Result<&'a MpdictMap> {
    dict.as_ref().ok_or_else(|| malformed("null map handle"))
}

unsafe fn write<T>(out: *mut T, value: T) {
    if !out.is_null() {
        out.write(value);
    }
}

#[no_mangle]
#[must_use]
#[named]
/// Opens map `name` in the arena `arena_name`, creating the arena with room for `capacity`
/// bytes and the map as needed. An empty `arena_name` selects the default arena.
///
/// # Safety
/// The slices must be valid for reads, `out` must be valid for writes. Release the handle with
/// [`mpdict_drop`].
pub unsafe extern "C" fn mpdict_open(
    name: ByteSlice,
    capacity: usize,
    arena_name: ByteSlice,
    out: *mut *mut MpdictMap,
) -> MpdictStatus {
    ffi_call(function_name!(), || {
        if out.is_null() {
            return Err(malformed("null output pointer"));
        }
        let name = name.as_str("map name")?;
        let arena_name = match arena_name.as_str("arena name")? {
            "" => DEFAULT_ARENA_NAME,
            arena_name => arena_name,
        };
        let options = ArenaOptions::new(capacity).diagnostics(Arc::new(TracingDiagnostics));
        let map = SharedMap::open_or_create_with(name, arena_name, options)?;
        out.write(Box::into_raw(Box::new(MpdictMap { map: Arc::new(map) })));
        Ok(())
    })
}

/// # Safety
/// `dict` must be null or a handle from [`mpdict_open`] that was not dropped yet.
#[no_mangle]
pub unsafe extern "C" fn mpdict_drop(dict: *mut MpdictMap) {
    if !dict.is_null() {
        drop(Box::from_raw(dict));
    }
}

#[no_mangle]
#[must_use]
#[named]
/// Copies the value of `key` into `out_value` and sets `out_found`. A missing key is not an
/// error. Release the value with [`crate::mpdict_bytes_drop`].
///
/// # Safety
/// `dict` must be a live handle, `key` valid for reads, the outputs valid for writes.
pub unsafe extern "C" fn mpdict_get(
    dict: *const MpdictMap,
    key: ByteSlice,
    out_value: *mut OwnedBytes,
    out_found: *mut bool,
) -> MpdictStatus {
    ffi_call(function_name!(), || {
        if out_value.is_null() {
            return Err(malformed("null output pointer"));
        }
        let value = map_ref(dict)?.map.get(key.as_bytes()?)?;
        write(out_found, value.is_some());
        out_value.write(value.map_or(OwnedBytes::empty(), OwnedBytes::from));
        Ok(())
    })
}

#[no_mangle]
#[must_use]
#[named]
/// Stores `value` under `key`. `out_replaced`, if not null, tells whether a value existed.
///
/// # Safety
/// `dict` must be a live handle, the slices valid for reads, `out_replaced` null or valid for
/// writes.
pub unsafe extern "C" fn mpdict_set(
    dict: *const MpdictMap,
    key: ByteSlice,
    value: ByteSlice,
    out_replaced: *mut bool,
) -> MpdictStatus {
    ffi_call(function_name!(), || {
        let replaced = map_ref(dict)?
            .map
            .set(key.as_bytes()?, value.as_bytes()?)?;
        write(out_replaced, replaced);
        Ok(())
    })
}

#[no_mangle]
#[must_use]
#[named]
/// Removes `key`. `out_removed`, if not null, tells whether it was present.
///
/// # Safety
/// `dict` must be a live handle, `key` valid for reads, `out_removed` null or valid for writes.
pub unsafe extern "C" fn mpdict_delete(
    dict: *const MpdictMap,
    key: ByteSlice,
    out_removed: *mut bool,
) -> MpdictStatus {
    ffi_call(function_name!(), || {
        let removed = map_ref(dict)?.map.delete(key.as_bytes()?)?;
        write(out_removed, removed);
        Ok(())
    })
}

/// Number of entries, 0 for a null handle.
///
/// # Safety
/// `dict` must be null or a live handle.
#[no_mangle]
pub unsafe extern "C" fn mpdict_len(dict: *const MpdictMap) -> usize {
    dict.as_ref().map_or(0, |dict| dict.map.len())
}

#[no_mangle]
#[must_use]
#[named]
/// Up to `limit` keys in ascending order. Release the list with [`mpdict_key_list_drop`].
///
/// # Safety
/// `dict` must be a live handle, `out_list` valid for writes.
pub unsafe extern "C" fn mpdict_keys(
    dict: *const MpdictMap,
    limit: usize,
    out_list: *mut KeyList,
) -> MpdictStatus {
    ffi_call(function_name!(), || {
        if out_list.is_null() {
            return Err(malformed("null output pointer"));
        }
        let keys = map_ref(dict)?.map.enumerate_keys(limit)?;
        out_list.write(KeyList::from(keys));
        Ok(())
    })
}

/// Releases the keys and leaves `list` empty.
///
/// # Safety
/// `list` must be null or point to a list filled by [`mpdict_keys`].
#[no_mangle]
pub unsafe extern "C" fn mpdict_key_list_drop(list: *mut KeyList) {
    if let Some(list) = list.as_mut() {
        list.release();
    }
}

/// Releases bytes returned by this library and leaves `bytes` empty.
///
/// # Safety
/// `bytes` must be null or point to bytes filled by this library.
#[no_mangle]
pub unsafe extern "C" fn mpdict_bytes_drop(bytes: *mut OwnedBytes) {
    if let Some(bytes) = bytes.as_mut() {
        bytes.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{open_map, slice, unique_name};
    use std::ptr;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn set_get_delete() {
        let dict = open_map("map");
        unsafe {
            let mut replaced = true;
            let status = mpdict_set(dict, slice(b"k"), slice(b"v"), &mut replaced);
            assert_eq!(status, MpdictStatus::Ok);
            assert!(!replaced);
            assert_eq!(mpdict_len(dict), 1);

            let mut value = OwnedBytes::empty();
            let mut found = false;
            let status = mpdict_get(dict, slice(b"k"), &mut value, &mut found);
            assert_eq!(status, MpdictStatus::Ok);
            assert!(found);
            assert_eq!(value.as_slice(), b"v");
            mpdict_bytes_drop(&mut value);

            let status = mpdict_get(dict, slice(b"missing"), &mut value, &mut found);
            assert_eq!(status, MpdictStatus::Ok);
            assert!(!found);
            assert!(value.ptr.is_null());

            let mut removed = false;
            let status = mpdict_delete(dict, slice(b"k"), &mut removed);
            assert_eq!(status, MpdictStatus::Ok);
            assert!(removed);
            assert_eq!(mpdict_len(dict), 0);
            mpdict_drop(dict);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn keys_are_limited_and_sorted() {
        let dict = open_map("keys");
        unsafe {
            for key in ["z", "x", "y"] {
                let status = mpdict_set(dict, slice(key.as_bytes()), slice(b"1"), ptr::null_mut());
                assert_eq!(status, MpdictStatus::Ok);
            }
            let mut list = KeyList::empty();
            assert_eq!(mpdict_keys(dict, 2, &mut list), MpdictStatus::Ok);
            let keys: Vec<&[u8]> = list.as_slice().iter().map(OwnedBytes::as_slice).collect();
            assert_eq!(keys, vec![&b"x"[..], &b"y"[..]]);
            mpdict_key_list_drop(&mut list);
            mpdict_drop(dict);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn empty_arena_name_selects_default_arena() {
        let name = unique_name("default-arena");
        let mut dict = ptr::null_mut();
        unsafe {
            let status = mpdict_open(
                slice(name.as_bytes()),
                1 << 16,
                ByteSlice::empty(),
                &mut dict,
            );
            assert_eq!(status, MpdictStatus::Ok);
            assert_eq!((*dict).map.arena().path(), Some(c"/mpdict"));
            let status = mpdict_set(dict, slice(b"k"), slice(b"v"), ptr::null_mut());
            assert_eq!(status, MpdictStatus::Ok);
        }

        let seen = SharedMap::open_or_create(&name, 0, DEFAULT_ARENA_NAME).unwrap();
        assert_eq!(seen.get(b"k").unwrap(), Some(b"v".to_vec()));
        drop(seen);

        let handle = unsafe { Box::from_raw(dict) };
        let arena = handle.map.arena().clone();
        drop(handle);
        if arena.is_owner() {
            Arc::try_unwrap(arena).unwrap().destroy().unwrap();
        }
    }

    #[test]
    fn malformed_arguments() {
        unsafe {
            let null_key = ByteSlice {
                ptr: ptr::null(),
                len: 4,
            };
            let status = mpdict_set(ptr::null(), null_key, ByteSlice::empty(), ptr::null_mut());
            assert_eq!(status, MpdictStatus::MalformedArgument);
            assert_eq!(mpdict_len(ptr::null()), 0);

            let mut dict = ptr::null_mut();
            let status = mpdict_open(ByteSlice::empty(), 0, ByteSlice::empty(), &mut dict);
            assert_eq!(status, MpdictStatus::MalformedArgument);
            assert!(dict.is_null());

            let slash = b"a/b";
            let status = mpdict_open(slice(b"m"), 0, slice(slash), &mut dict);
            assert_eq!(status, MpdictStatus::MalformedArgument);
        }
    }
}
