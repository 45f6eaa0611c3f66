// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Offset-based allocator over the arena heap.
//!
//! The heap is carved into blocks. Each block starts with a 16-byte [`BlockHeader`] holding its
//! total size and a tag telling used blocks from free ones. Free blocks additionally store the
//! offset of the next free block right after the header, forming a singly-linked list sorted by
//! offset:
//!
//! ```text
//!   used block                 free block
//! +------+-----+-----------+  +------+-----+------+-------------+
//! | size | tag | payload.. |  | size | tag | next | (unused)..  |
//! +------+-----+-----------+  +------+-----+------+-------------+
//! ```
//!
//! Allocation is first fit, splitting the block when the remainder can still hold a free block.
//! Deallocation inserts the block back in offset order and merges it with adjacent free
//! neighbours, so freeing everything restores a single block spanning the heap.
//!
//! All bookkeeping lives in the arena header and the heap itself, and every link is an offset,
//! which keeps the allocator usable from any process regardless of where it mapped the arena.

use super::header::ArenaHeader;
use super::region::Region;
use super::ShmOffset;
use crate::error::{Result, ShmDictError};
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

const ALIGN: u64 = 16;
const BLOCK_HEADER: u64 = 16;
/// Smallest block: header plus the free-list link, rounded to the alignment.
const MIN_BLOCK: u64 = 32;
const NIL: u64 = 0;

const TAG_USED: u64 = u64::from_le_bytes(*b"mpd:used");
const TAG_FREE: u64 = u64::from_le_bytes(*b"mpd:free");

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BlockHeader {
    size: u64,
    tag: u64,
}

const VOID: BlockHeader = BlockHeader { size: 0, tag: 0 };

/// Allocator handle for one arena, obtained through
/// [`ArenaGuard::allocator`](super::ArenaGuard::allocator). It only exists while the arena lock
/// is held.
pub struct ShmAllocator<'a> {
    region: Region,
    header: &'a ArenaHeader,
}

impl<'a> ShmAllocator<'a> {
    pub(crate) fn new(region: Region, header: &'a ArenaHeader) -> Self {
        Self { region, header }
    }

    /// Turns `[heap_start, heap_end)` into a single free block.
    pub(crate) fn format(&self, heap_start: u64, heap_end: u64) -> Result<()> {
        let heap_end = heap_end & !(ALIGN - 1);
        self.header.heap_start.store(heap_start, Ordering::Relaxed);
        self.header.heap_end.store(heap_end, Ordering::Relaxed);
        self.header.free_head.store(NIL, Ordering::Relaxed);
        self.header.free_bytes.store(0, Ordering::Relaxed);

        let size = heap_end.saturating_sub(heap_start);
        if size >= MIN_BLOCK {
            self.region.write(
                heap_start,
                BlockHeader {
                    size,
                    tag: TAG_FREE,
                },
            )?;
            self.set_next_free(heap_start, NIL)?;
            self.header.free_head.store(heap_start, Ordering::Relaxed);
            self.header.free_bytes.store(size, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Arena bytes consumed by an allocation of `payload` bytes, header and padding included.
    /// `None` if the size overflows.
    pub fn block_size(payload: usize) -> Option<usize> {
        let align = ALIGN as usize;
        let total = payload
            .checked_add(BLOCK_HEADER as usize)?
            .checked_add(align - 1)?
            & !(align - 1);
        Some(total.max(MIN_BLOCK as usize))
    }

    /// Total bytes in free blocks, headers included.
    pub fn free_bytes(&self) -> usize {
        self.header.free_bytes.load(Ordering::Relaxed) as usize
    }

    /// Size of the heap the allocator manages.
    pub fn heap_size(&self) -> usize {
        let start = self.header.heap_start.load(Ordering::Relaxed);
        let end = self.header.heap_end.load(Ordering::Relaxed);
        end.saturating_sub(start) as usize
    }

    /// Allocates `size` bytes, 16-byte aligned. Fails with
    /// [`ShmDictError::CapacityExhausted`] if no free block is large enough.
    pub fn allocate(&self, size: usize) -> Result<ShmOffset> {
        let exhausted = || ShmDictError::CapacityExhausted { requested: size };
        let need = Self::block_size(size).ok_or_else(exhausted)? as u64;

        let mut prev = NIL;
        let mut cur = self.header.free_head.load(Ordering::Relaxed);
        while cur != NIL {
            let block = self.block(cur, TAG_FREE)?;
            let next = self.next_free(cur)?;
            if block.size >= need {
                let taken = if block.size - need >= MIN_BLOCK {
                    let rest = cur + need;
                    self.region.write(
                        rest,
                        BlockHeader {
                            size: block.size - need,
                            tag: TAG_FREE,
                        },
                    )?;
                    self.set_next_free(rest, next)?;
                    self.link(prev, rest)?;
                    need
                } else {
                    self.link(prev, next)?;
                    block.size
                };
                self.region.write(
                    cur,
                    BlockHeader {
                        size: taken,
                        tag: TAG_USED,
                    },
                )?;
                self.sub_free(taken);
                return ShmOffset::new(cur + BLOCK_HEADER)
                    .ok_or_else(|| ShmDictError::corrupted(cur));
            }
            prev = cur;
            cur = next;
        }
        Err(exhausted())
    }

    /// Returns the block at `offset` to the free list, merging it with free neighbours.
    pub fn deallocate(&self, offset: ShmOffset) -> Result<()> {
        let start = self.block_start(offset)?;
        let freed = self.block(start, TAG_USED)?.size;

        let mut prev = NIL;
        let mut cur = self.header.free_head.load(Ordering::Relaxed);
        while cur != NIL && cur < start {
            prev = cur;
            cur = self.next_free(cur)?;
        }
        if cur == start {
            return Err(ShmDictError::corrupted(start));
        }

        let mut size = freed;
        let mut next = cur;
        if cur != NIL && start + size == cur {
            size += self.block(cur, TAG_FREE)?.size;
            next = self.next_free(cur)?;
            self.region.write(cur, VOID)?;
        }

        if prev != NIL {
            let before = self.block(prev, TAG_FREE)?;
            if prev + before.size == start {
                self.region.write(
                    prev,
                    BlockHeader {
                        size: before.size + size,
                        tag: TAG_FREE,
                    },
                )?;
                self.set_next_free(prev, next)?;
                self.region.write(start, VOID)?;
                self.add_free(freed);
                return Ok(());
            }
        }

        self.region.write(
            start,
            BlockHeader {
                size,
                tag: TAG_FREE,
            },
        )?;
        self.set_next_free(start, next)?;
        self.link(prev, start)?;
        self.add_free(freed);
        Ok(())
    }

    /// Bytes usable at `offset`, which can be more than what was asked for.
    pub fn usable_size(&self, offset: ShmOffset) -> Result<usize> {
        let start = self.block_start(offset)?;
        Ok((self.block(start, TAG_USED)?.size - BLOCK_HEADER) as usize)
    }

    /// Resolves an offset into a pointer valid in this process's mapping.
    pub fn ptr(&self, offset: ShmOffset) -> Result<NonNull<u8>> {
        self.region.ptr::<u8>(offset.get())
    }

    /// Converts a pointer into this process's mapping back into an offset.
    pub fn offset_of(&self, ptr: *const u8) -> Result<ShmOffset> {
        let offset = self.region.offset_of(ptr)?;
        ShmOffset::new(offset)
            .ok_or_else(|| ShmDictError::malformed("pointer refers to the arena header"))
    }

    fn block_start(&self, offset: ShmOffset) -> Result<u64> {
        let start = offset.get().wrapping_sub(BLOCK_HEADER);
        let heap_start = self.header.heap_start.load(Ordering::Relaxed);
        if offset.get() < heap_start + BLOCK_HEADER || start % ALIGN != 0 {
            return Err(ShmDictError::corrupted(offset.get()));
        }
        Ok(start)
    }

    fn block(&self, offset: u64, tag: u64) -> Result<BlockHeader> {
        let block: BlockHeader = self.region.read(offset)?;
        let heap_end = self.header.heap_end.load(Ordering::Relaxed);
        let fits = offset
            .checked_add(block.size)
            .is_some_and(|end| end <= heap_end);
        if block.tag != tag || block.size < MIN_BLOCK || block.size % ALIGN != 0 || !fits {
            return Err(ShmDictError::corrupted(offset));
        }
        Ok(block)
    }

    /// Free list links only point forward, which also guarantees every walk terminates.
    fn next_free(&self, offset: u64) -> Result<u64> {
        let next: u64 = self.region.read(offset + BLOCK_HEADER)?;
        if next != NIL && next <= offset {
            return Err(ShmDictError::corrupted(offset));
        }
        Ok(next)
    }

    fn set_next_free(&self, offset: u64, next: u64) -> Result<()> {
        self.region.write(offset + BLOCK_HEADER, next)
    }

    fn link(&self, prev: u64, target: u64) -> Result<()> {
        if prev == NIL {
            self.header.free_head.store(target, Ordering::Relaxed);
            Ok(())
        } else {
            self.set_next_free(prev, target)
        }
    }

    fn add_free(&self, bytes: u64) {
        let free = self.header.free_bytes.load(Ordering::Relaxed);
        self.header.free_bytes.store(free + bytes, Ordering::Relaxed);
    }

    fn sub_free(&self, bytes: u64) {
        let free = self.header.free_bytes.load(Ordering::Relaxed);
        self.header
            .free_bytes
            .store(free.saturating_sub(bytes), Ordering::Relaxed);
    }

    #[cfg(test)]
    fn free_blocks(&self) -> Vec<(u64, u64)> {
        let mut blocks = vec![];
        let mut cur = self.header.free_head.load(Ordering::Relaxed);
        while cur != NIL {
            blocks.push((cur, self.block(cur, TAG_FREE).unwrap().size));
            cur = self.next_free(cur).unwrap();
        }
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::header::HEAP_START;
    use crate::arena::region::heap::HeapRegion;

    const REGION: usize = 4096;

    fn with_allocator(f: impl FnOnce(&ShmAllocator)) {
        let mut heap = HeapRegion::new(REGION);
        let region = heap.region();
        let header = unsafe { ArenaHeader::at(region) }.unwrap();
        header.initialize(REGION as u64, 1);
        let alloc = ShmAllocator::new(region, header);
        alloc.format(HEAP_START, REGION as u64).unwrap();
        f(&alloc);
    }

    fn heap_size() -> u64 {
        REGION as u64 - HEAP_START
    }

    #[test]
    fn block_sizes() {
        assert_eq!(ShmAllocator::block_size(0), Some(32));
        assert_eq!(ShmAllocator::block_size(1), Some(32));
        assert_eq!(ShmAllocator::block_size(16), Some(32));
        assert_eq!(ShmAllocator::block_size(17), Some(48));
        assert_eq!(ShmAllocator::block_size(100), Some(128));
        assert_eq!(ShmAllocator::block_size(usize::MAX), None);
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        with_allocator(|alloc| {
            let a = alloc.allocate(10).unwrap();
            let b = alloc.allocate(100).unwrap();
            let c = alloc.allocate(1).unwrap();
            for off in [a, b, c] {
                assert_eq!(off.get() % 16, 0);
            }
            assert_eq!(b.get() - a.get(), 32);
            assert_eq!(c.get() - b.get(), 128);
            assert_eq!(alloc.usable_size(a).unwrap(), 16);
            assert_eq!(alloc.usable_size(b).unwrap(), 112);
            assert_eq!(alloc.free_bytes() as u64, heap_size() - 32 - 128 - 32);
        });
    }

    #[test]
    fn exhaustion_is_reported_and_recoverable() {
        with_allocator(|alloc| {
            let mut taken = vec![];
            loop {
                match alloc.allocate(48) {
                    Ok(off) => taken.push(off),
                    Err(e) => {
                        assert!(e.is_capacity_exhausted());
                        break;
                    }
                }
            }
            assert_eq!(taken.len() as u64, heap_size() / 64);
            assert!(alloc.free_bytes() < 64);

            alloc.deallocate(taken.pop().unwrap()).unwrap();
            assert!(alloc.allocate(48).is_ok());
        });
    }

    #[test]
    fn freeing_everything_coalesces_into_one_block() {
        with_allocator(|alloc| {
            let offsets: Vec<_> = (0..10).map(|i| alloc.allocate(i * 7).unwrap()).collect();
            // Free in an interleaved order to exercise merging with both neighbours.
            for i in [1, 3, 5, 7, 9, 0, 2, 4, 6, 8] {
                alloc.deallocate(offsets[i]).unwrap();
            }
            assert_eq!(alloc.free_bytes() as u64, heap_size());
            assert_eq!(alloc.free_blocks(), vec![(HEAP_START, heap_size())]);
        });
    }

    #[test]
    fn freed_block_is_reused_first_fit() {
        with_allocator(|alloc| {
            let a = alloc.allocate(64).unwrap();
            let _b = alloc.allocate(64).unwrap();
            alloc.deallocate(a).unwrap();
            let c = alloc.allocate(32).unwrap();
            assert_eq!(c, a);
        });
    }

    #[test]
    fn double_free_is_corruption() {
        with_allocator(|alloc| {
            let a = alloc.allocate(8).unwrap();
            let _b = alloc.allocate(8).unwrap();
            alloc.deallocate(a).unwrap();
            assert!(matches!(
                alloc.deallocate(a),
                Err(ShmDictError::CorruptedStructure { .. })
            ));
        });
    }

    #[test]
    fn bogus_offsets_are_rejected() {
        with_allocator(|alloc| {
            let header_offset = ShmOffset::new(8).unwrap();
            assert!(alloc.deallocate(header_offset).is_err());
            let unaligned = ShmOffset::new(HEAP_START + BLOCK_HEADER + 4).unwrap();
            assert!(alloc.usable_size(unaligned).is_err());
        });
    }

    #[test]
    fn pointer_conversion_roundtrip() {
        with_allocator(|alloc| {
            let a = alloc.allocate(8).unwrap();
            let ptr = alloc.ptr(a).unwrap();
            assert_eq!(alloc.offset_of(ptr.as_ptr()).unwrap(), a);
        });
    }

    /// Fuzz: random allocate/free sequences keep the accounting exact and never hand out
    /// overlapping blocks.
    #[test]
    fn fuzz_alloc_free_accounting() {
        bolero::check!()
            .with_type::<Vec<(bool, u16)>>()
            .for_each(|ops| {
                with_allocator(|alloc| {
                    let mut live: Vec<ShmOffset> = vec![];
                    for &(do_alloc, arg) in ops {
                        if do_alloc || live.is_empty() {
                            let size = arg as usize % 512;
                            match alloc.allocate(size) {
                                Ok(off) => live.push(off),
                                Err(e) => assert!(e.is_capacity_exhausted()),
                            }
                        } else {
                            let off = live.swap_remove(arg as usize % live.len());
                            alloc.deallocate(off).unwrap();
                        }

                        let mut spans: Vec<(u64, u64)> = live
                            .iter()
                            .map(|off| {
                                let start = off.get() - BLOCK_HEADER;
                                let size = alloc.usable_size(*off).unwrap() as u64 + BLOCK_HEADER;
                                (start, start + size)
                            })
                            .collect();
                        spans.sort();
                        for pair in spans.windows(2) {
                            assert!(pair[0].1 <= pair[1].0, "overlapping blocks {pair:?}");
                        }
                        let used: u64 = spans.iter().map(|(s, e)| e - s).sum();
                        assert_eq!(used + alloc.free_bytes() as u64, heap_size());
                    }
                });
            });
    }
}
