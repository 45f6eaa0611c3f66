// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::SharedMap;
use crate::error::Result;
use std::iter::FusedIterator;

/// Position in a key enumeration, independent of any borrow of the map.
///
/// Each step looks up the smallest key greater than the last one returned, under the arena lock.
/// Keys inserted or removed by other processes between steps are therefore seen or skipped
/// according to where they sort relative to the cursor, and no key is returned twice.
#[derive(Debug, Default, Clone)]
pub struct KeyCursor {
    last: Option<Vec<u8>>,
    exhausted: bool,
}

impl KeyCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Returns the next key of `map`, or `None` once the end was reached. Keeps returning `None`
    /// afterwards.
    pub fn advance(&mut self, map: &SharedMap) -> Result<Option<Vec<u8>>> {
        if self.exhausted {
            return Ok(None);
        }
        match map.key_after(self.last.as_deref())? {
            Some(key) => {
                self.last = Some(key.clone());
                Ok(Some(key))
            }
            None => {
                self.exhausted = true;
                self.last = None;
                Ok(None)
            }
        }
    }
}

/// Iterator over the keys of a [`SharedMap`] in ascending order, see [`KeyCursor`].
///
/// The borrow of the map is dropped as soon as the end is reached or an error is returned.
#[derive(Debug)]
pub struct KeyEnumerator<'a> {
    map: Option<&'a SharedMap>,
    cursor: KeyCursor,
}

impl<'a> KeyEnumerator<'a> {
    pub(crate) fn new(map: &'a SharedMap) -> Self {
        Self {
            map: Some(map),
            cursor: KeyCursor::new(),
        }
    }

    /// True once the enumerator no longer refers to its map.
    pub fn is_released(&self) -> bool {
        self.map.is_none()
    }
}

impl Iterator for KeyEnumerator<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let map = self.map?;
        match self.cursor.advance(map) {
            Ok(Some(key)) => Some(Ok(key)),
            Ok(None) => {
                self.map = None;
                None
            }
            Err(e) => {
                self.map = None;
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for KeyEnumerator<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::SharedArena;
    use crate::config::ArenaOptions;
    use std::sync::Arc;

    fn map() -> SharedMap {
        let arena = SharedArena::anonymous(ArenaOptions::new(1 << 14)).unwrap();
        SharedMap::open_in(Arc::new(arena), "iter").unwrap()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn empty_map_yields_nothing() {
        let map = map();
        let mut keys = map.iter();
        assert!(keys.next().is_none());
        assert!(keys.is_released());
        assert!(keys.next().is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn enumerator_sees_changes_ahead_of_cursor() {
        let map = map();
        for key in ["b", "d", "f"] {
            map.set(key.as_bytes(), b"").unwrap();
        }
        let mut keys = map.iter();
        assert_eq!(keys.next().unwrap().unwrap(), b"b");

        map.set(b"a", b"").unwrap();
        map.set(b"c", b"").unwrap();
        map.delete(b"d").unwrap();

        let rest: Vec<Vec<u8>> = keys.map(|k| k.unwrap()).collect();
        assert_eq!(rest, vec![b"c".to_vec(), b"f".to_vec()]);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn cursor_survives_removal_of_last_key() {
        let map = map();
        for key in ["x", "y", "z"] {
            map.set(key.as_bytes(), b"1").unwrap();
        }
        let mut cursor = KeyCursor::new();
        assert_eq!(cursor.advance(&map).unwrap(), Some(b"x".to_vec()));
        map.delete(b"x").unwrap();
        assert_eq!(cursor.advance(&map).unwrap(), Some(b"y".to_vec()));
        assert_eq!(cursor.advance(&map).unwrap(), Some(b"z".to_vec()));
        assert_eq!(cursor.advance(&map).unwrap(), None);
        assert!(cursor.is_exhausted());

        map.set(b"zz", b"").unwrap();
        assert_eq!(cursor.advance(&map).unwrap(), None);
    }
}
