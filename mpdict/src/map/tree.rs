// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! AVL tree stored in an arena, linked by offsets.
//!
//! Every entry is one allocation holding a [`Node`] immediately followed by the key bytes. The
//! value lives in a separate allocation so that it can be replaced without moving the node, or
//! is absent (offset 0) when empty. Keys compare as plain byte strings.
//!
//! A [`Tree`] is only ever built from an [`ArenaGuard`], so all of this runs under the arena lock.

use super::MapHeader;
use crate::arena::region::Region;
use crate::arena::{ArenaGuard, ShmAllocator, ShmOffset};
use crate::error::{Result, ShmDictError};
use core::cmp::Ordering as KeyOrdering;
use core::mem::size_of;
use core::sync::atomic::Ordering;

const NIL: u64 = 0;

/// Far beyond the height of any AVL tree that fits in memory; hitting it means a link cycle.
const MAX_DEPTH: usize = 96;

/// A replaced value keeps its block if that wastes fewer bytes than this.
const SHRINK_SLACK: usize = 64;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Node {
    left: u64,
    right: u64,
    value: u64,
    value_len: u64,
    key_len: u32,
    height: u32,
}

pub(crate) const NODE_SIZE: usize = size_of::<Node>();

/// Arena bytes taken by one entry with the given key and value lengths.
pub(crate) fn entry_footprint(key_len: usize, value_len: usize) -> Option<usize> {
    let node = ShmAllocator::block_size(NODE_SIZE.checked_add(key_len)?)?;
    let value = match value_len {
        0 => 0,
        len => ShmAllocator::block_size(len)?,
    };
    node.checked_add(value)
}

pub(crate) struct Tree<'g> {
    region: Region,
    alloc: ShmAllocator<'g>,
    header: &'g MapHeader,
}

impl<'g> Tree<'g> {
    pub(crate) fn new(guard: &'g ArenaGuard<'_>, header: &'g MapHeader) -> Self {
        Self {
            region: guard.region(),
            alloc: guard.allocator(),
            header,
        }
    }

    fn root(&self) -> u64 {
        self.header.root.load(Ordering::Relaxed)
    }

    fn load(&self, offset: u64) -> Result<Node> {
        self.region.read(offset)
    }

    fn store(&self, offset: u64, node: Node) -> Result<()> {
        self.region.write(offset, node)
    }

    fn key_of(&self, offset: u64, node: &Node) -> Result<&[u8]> {
        self.region
            .bytes(offset + NODE_SIZE as u64, node.key_len as usize)
    }

    fn value_of(&self, node: &Node) -> Result<&[u8]> {
        if node.value == NIL {
            return Ok(&[]);
        }
        self.region.bytes(node.value, node.value_len as usize)
    }

    fn height(&self, offset: u64) -> Result<u32> {
        if offset == NIL {
            return Ok(0);
        }
        Ok(self.load(offset)?.height)
    }

    /// Offset of the node holding `key`, or 0.
    fn find(&self, key: &[u8]) -> Result<u64> {
        let mut cur = self.root();
        for _ in 0..MAX_DEPTH {
            if cur == NIL {
                return Ok(NIL);
            }
            let node = self.load(cur)?;
            cur = match key.cmp(self.key_of(cur, &node)?) {
                KeyOrdering::Less => node.left,
                KeyOrdering::Greater => node.right,
                KeyOrdering::Equal => return Ok(cur),
            };
        }
        Err(ShmDictError::corrupted(cur))
    }

    /// Runs `f` on the value stored under `key`.
    pub(crate) fn with_value<R>(&self, key: &[u8], f: impl FnOnce(&[u8]) -> R) -> Result<Option<R>> {
        let found = self.find(key)?;
        if found == NIL {
            return Ok(None);
        }
        let node = self.load(found)?;
        Ok(Some(f(self.value_of(&node)?)))
    }

    /// Smallest key strictly greater than `after`, or the smallest key when `after` is `None`.
    pub(crate) fn key_after(&self, after: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let mut best = NIL;
        let mut cur = self.root();
        for _ in 0..MAX_DEPTH {
            if cur == NIL {
                if best == NIL {
                    return Ok(None);
                }
                let node = self.load(best)?;
                return Ok(Some(self.key_of(best, &node)?.to_vec()));
            }
            let node = self.load(cur)?;
            let greater = match after {
                None => true,
                Some(after) => self.key_of(cur, &node)? > after,
            };
            if greater {
                best = cur;
                cur = node.left;
            } else {
                cur = node.right;
            }
        }
        Err(ShmDictError::corrupted(cur))
    }

    /// Calls `f` on up to `limit` keys in ascending order.
    pub(crate) fn walk(&self, limit: usize, mut f: impl FnMut(&[u8])) -> Result<()> {
        let mut stack = Vec::with_capacity(32);
        let mut cur = self.root();
        let mut seen = 0;
        while seen < limit {
            while cur != NIL {
                if stack.len() >= MAX_DEPTH {
                    return Err(ShmDictError::corrupted(cur));
                }
                stack.push(cur);
                cur = self.load(cur)?.left;
            }
            let Some(top) = stack.pop() else {
                break;
            };
            let node = self.load(top)?;
            f(self.key_of(top, &node)?);
            seen += 1;
            cur = node.right;
        }
        Ok(())
    }

    /// Inserts or replaces. Returns true if `key` was present. On error the tree is unchanged.
    pub(crate) fn insert(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let found = self.find(key)?;
        if found != NIL {
            self.replace_value(found, value)?;
            return Ok(true);
        }

        let key_len = u32::try_from(key.len())
            .map_err(|_| ShmDictError::malformed("key is longer than 4 GiB"))?;
        let node_off = self.alloc.allocate(NODE_SIZE + key.len())?;
        let value_off = match self.store_value(value) {
            Ok(offset) => offset,
            Err(e) => {
                self.alloc.deallocate(node_off)?;
                return Err(e);
            }
        };

        let offset = node_off.get();
        self.store(
            offset,
            Node {
                left: NIL,
                right: NIL,
                value: value_off,
                value_len: value.len() as u64,
                key_len,
                height: 1,
            },
        )?;
        self.region.copy_in(offset + NODE_SIZE as u64, key)?;

        let root = self.insert_node(self.root(), offset, key, 0)?;
        self.header.root.store(root, Ordering::Relaxed);
        let len = self.header.len.load(Ordering::Relaxed);
        self.header.len.store(len + 1, Ordering::Relaxed);
        Ok(false)
    }

    /// Copies `value` into a new block; empty values take no block.
    fn store_value(&self, value: &[u8]) -> Result<u64> {
        if value.is_empty() {
            return Ok(NIL);
        }
        let offset = self.alloc.allocate(value.len())?.get();
        self.region.copy_in(offset, value)?;
        Ok(offset)
    }

    fn replace_value(&self, offset: u64, value: &[u8]) -> Result<()> {
        let mut node = self.load(offset)?;
        let old = ShmOffset::new(node.value);

        let usable = match old {
            Some(old) => self.alloc.usable_size(old)?,
            None => 0,
        };
        let fits = !value.is_empty() && value.len() <= usable;
        let in_place = if fits && usable - value.len() >= SHRINK_SLACK {
            // Prefer a tighter block, but reuse the old one when the heap is full.
            match self.store_value(value) {
                Ok(fresh) => {
                    node.value = fresh;
                    false
                }
                Err(e) if e.is_capacity_exhausted() => true,
                Err(e) => return Err(e),
            }
        } else if fits {
            true
        } else {
            node.value = self.store_value(value)?;
            false
        };

        if in_place {
            self.region.copy_in(node.value, value)?;
        } else if let Some(old) = old {
            self.alloc.deallocate(old)?;
        }
        node.value_len = value.len() as u64;
        self.store(offset, node)
    }

    /// Removes `key`. Returns true if it was present.
    pub(crate) fn remove(&self, key: &[u8]) -> Result<bool> {
        let (root, removed) = self.remove_node(self.root(), key, 0)?;
        if removed == NIL {
            return Ok(false);
        }
        self.header.root.store(root, Ordering::Relaxed);
        let len = self.header.len.load(Ordering::Relaxed);
        self.header.len.store(len.saturating_sub(1), Ordering::Relaxed);

        let node = self.load(removed)?;
        if let Some(value) = ShmOffset::new(node.value) {
            self.alloc.deallocate(value)?;
        }
        match ShmOffset::new(removed) {
            Some(removed) => self.alloc.deallocate(removed)?,
            None => return Err(ShmDictError::corrupted(removed)),
        }
        Ok(true)
    }

    fn insert_node(&self, root: u64, new: u64, key: &[u8], depth: usize) -> Result<u64> {
        if root == NIL {
            return Ok(new);
        }
        if depth >= MAX_DEPTH {
            return Err(ShmDictError::corrupted(root));
        }
        let mut node = self.load(root)?;
        match key.cmp(self.key_of(root, &node)?) {
            KeyOrdering::Less => node.left = self.insert_node(node.left, new, key, depth + 1)?,
            KeyOrdering::Greater => node.right = self.insert_node(node.right, new, key, depth + 1)?,
            KeyOrdering::Equal => return Err(ShmDictError::corrupted(root)),
        }
        self.store(root, node)?;
        self.rebalance(root)
    }

    /// Returns the new subtree root and the detached node, 0 if `key` was not found.
    fn remove_node(&self, root: u64, key: &[u8], depth: usize) -> Result<(u64, u64)> {
        if root == NIL {
            return Ok((NIL, NIL));
        }
        if depth >= MAX_DEPTH {
            return Err(ShmDictError::corrupted(root));
        }
        let mut node = self.load(root)?;
        let removed = match key.cmp(self.key_of(root, &node)?) {
            KeyOrdering::Less => {
                let (left, removed) = self.remove_node(node.left, key, depth + 1)?;
                node.left = left;
                removed
            }
            KeyOrdering::Greater => {
                let (right, removed) = self.remove_node(node.right, key, depth + 1)?;
                node.right = right;
                removed
            }
            KeyOrdering::Equal => {
                if node.left == NIL {
                    return Ok((node.right, root));
                }
                if node.right == NIL {
                    return Ok((node.left, root));
                }
                let (right, min) = self.detach_min(node.right, depth + 1)?;
                let mut successor = self.load(min)?;
                successor.left = node.left;
                successor.right = right;
                self.store(min, successor)?;
                return Ok((self.rebalance(min)?, root));
            }
        };
        if removed == NIL {
            return Ok((root, NIL));
        }
        self.store(root, node)?;
        Ok((self.rebalance(root)?, removed))
    }

    /// Unlinks the leftmost node of a non-empty subtree.
    fn detach_min(&self, root: u64, depth: usize) -> Result<(u64, u64)> {
        if depth >= MAX_DEPTH {
            return Err(ShmDictError::corrupted(root));
        }
        let mut node = self.load(root)?;
        if node.left == NIL {
            return Ok((node.right, root));
        }
        let (left, min) = self.detach_min(node.left, depth + 1)?;
        node.left = left;
        self.store(root, node)?;
        Ok((self.rebalance(root)?, min))
    }

    fn update_height(&self, offset: u64, mut node: Node) -> Result<Node> {
        node.height = 1 + self.height(node.left)?.max(self.height(node.right)?);
        self.store(offset, node)?;
        Ok(node)
    }

    fn rotate_right(&self, offset: u64) -> Result<u64> {
        let mut node = self.load(offset)?;
        let pivot = node.left;
        let mut left = self.load(pivot)?;
        node.left = left.right;
        self.update_height(offset, node)?;
        left.right = offset;
        self.update_height(pivot, left)?;
        Ok(pivot)
    }

    fn rotate_left(&self, offset: u64) -> Result<u64> {
        let mut node = self.load(offset)?;
        let pivot = node.right;
        let mut right = self.load(pivot)?;
        node.right = right.left;
        self.update_height(offset, node)?;
        right.left = offset;
        self.update_height(pivot, right)?;
        Ok(pivot)
    }

    fn rebalance(&self, offset: u64) -> Result<u64> {
        let mut node = self.update_height(offset, self.load(offset)?)?;
        let balance = self.height(node.left)? as i64 - self.height(node.right)? as i64;
        if balance > 1 {
            let left = self.load(node.left)?;
            if self.height(left.left)? < self.height(left.right)? {
                node.left = self.rotate_left(node.left)?;
                self.store(offset, node)?;
            }
            return self.rotate_right(offset);
        }
        if balance < -1 {
            let right = self.load(node.right)?;
            if self.height(right.right)? < self.height(right.left)? {
                node.right = self.rotate_right(node.right)?;
                self.store(offset, node)?;
            }
            return self.rotate_left(offset);
        }
        Ok(offset)
    }

    /// Checks ordering, balance and stored heights; returns the number of nodes.
    #[cfg(test)]
    pub(crate) fn check(&self) -> usize {
        fn visit(tree: &Tree, offset: u64, lo: Option<&[u8]>, hi: Option<&[u8]>) -> (u32, usize) {
            if offset == NIL {
                return (0, 0);
            }
            let node = tree.load(offset).unwrap();
            let key = tree.key_of(offset, &node).unwrap();
            assert!(lo.map_or(true, |lo| key > lo), "order violated");
            assert!(hi.map_or(true, |hi| key < hi), "order violated");
            let (lh, ln) = visit(tree, node.left, lo, Some(key));
            let (rh, rn) = visit(tree, node.right, Some(key), hi);
            assert!(lh.abs_diff(rh) <= 1, "unbalanced at {offset}");
            assert_eq!(node.height, 1 + lh.max(rh), "stale height at {offset}");
            (node.height, ln + rn + 1)
        }
        visit(self, self.root(), None, None).1
    }
}
