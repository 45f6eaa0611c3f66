// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::map::map_ref;
use crate::{ffi_call, malformed, MpdictMap, MpdictStatus, OwnedBytes};
use function_name::named;
use mpdict::{KeyCursor, SharedMap};
use std::sync::Arc;

/// Key iterator. Holds a reference to its map until the last key was returned.
pub struct MpdictIter {
    map: Option<Arc<SharedMap>>,
    cursor: KeyCursor,
}

#[no_mangle]
#[must_use]
#[named]
/// Creates an iterator over the keys of `dict`, positioned before the first key. Release it
/// with [`mpdict_iter_drop`].
///
/// # Safety
/// `dict` must be a live handle, `out` valid for writes.
pub unsafe extern "C" fn mpdict_iter_new(
    dict: *const MpdictMap,
    out: *mut *mut MpdictIter,
) -> MpdictStatus {
    ffi_call(function_name!(), || {
        if out.is_null() {
            return Err(malformed("null output pointer"));
        }
        let iter = MpdictIter {
            map: Some(map_ref(dict)?.map.clone()),
            cursor: KeyCursor::new(),
        };
        out.write(Box::into_raw(Box::new(iter)));
        Ok(())
    })
}

#[no_mangle]
#[must_use]
#[named]
/// Advances the iterator. Writes the next key to `out_key` and false to `out_done`, or leaves
/// `out_key` empty and writes true once all keys were returned. The iterator lets go of its map
/// at that point, or after an error.
///
/// # Safety
/// `iter` must be a live iterator, the outputs valid for writes.
pub unsafe extern "C" fn mpdict_iter_next(
    iter: *mut MpdictIter,
    out_key: *mut OwnedBytes,
    out_done: *mut bool,
) -> MpdictStatus {
    ffi_call(function_name!(), || {
        let iter = iter
            .as_mut()
            .ok_or_else(|| malformed("null iterator handle"))?;
        if out_key.is_null() || out_done.is_null() {
            return Err(malformed("null output pointer"));
        }
        let next = match &iter.map {
            Some(map) => iter.cursor.advance(map),
            None => Ok(None),
        };
        let key = match next {
            Ok(key) => key,
            Err(e) => {
                iter.map = None;
                return Err(e.into());
            }
        };
        if key.is_none() {
            iter.map = None;
        }
        out_done.write(key.is_none());
        out_key.write(key.map_or(OwnedBytes::empty(), OwnedBytes::from));
        Ok(())
    })
}

/// # Safety
/// `iter` must be null or an iterator from [`mpdict_iter_new`] that was not dropped yet.
#[no_mangle]
pub unsafe extern "C" fn mpdict_iter_drop(iter: *mut MpdictIter) {
    if !iter.is_null() {
        drop(Box::from_raw(iter));
    }
}
