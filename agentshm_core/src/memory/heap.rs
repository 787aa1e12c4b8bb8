//! Chunk management inside a mapped segment
//!
//! These routines assume the caller holds the pool lock. They only ever see
//! an [`Arena`], so they behave the same under any mapping address.

use super::freelist;
use super::layout::{
    Arena, ChunkHeader, PoolHeader, ALIGNMENT, CHUNK_HEADER_SIZE, FREE_LIST_COUNT, MIN_CHUNK_SIZE,
    POOL_HEADER_SIZE, POOL_MAGIC,
};
use super::offset::{self, ListEnds, Offset, OffsetLink, NIL};
use crate::error::{ShmError, ShmResult};
use serde::Serialize;

/// Write a fresh header and turn the rest of the segment into one free chunk
pub fn format(arena: &mut Arena<'_>, max_size: u64) -> ShmResult<()> {
    let size = arena.len() as u64;
    *arena.header_mut() = PoolHeader {
        magic: POOL_MAGIC,
        size,
        max_size,
        user_offset: 0,
        open: 1,
        free_lists: [ListEnds::default(); FREE_LIST_COUNT],
        chunks: ListEnds::default(),
    };

    let first = POOL_HEADER_SIZE as Offset;
    arena.put_chunk(first, ChunkHeader::free(size - POOL_HEADER_SIZE as u64))?;
    let mut ends = ListEnds::default();
    offset::push_back(&mut arena.chain(), &mut ends, first)?;
    arena.header_mut().chunks = ends;
    freelist::insert(arena, first)
}

/// Check that an existing segment carries a pool matching its mapped length
pub fn validate(arena: &Arena<'_>) -> ShmResult<()> {
    let header = arena.header();
    if header.magic != POOL_MAGIC {
        return Err(ShmError::corrupted("segment is not a formatted pool"));
    }
    if header.size != arena.len() as u64 {
        return Err(ShmError::corrupted(format!(
            "pool header records {} bytes but {} are mapped",
            header.size,
            arena.len()
        )));
    }
    if header.chunks.head != POOL_HEADER_SIZE as Offset {
        return Err(ShmError::corrupted("chunk chain does not start after the header"));
    }
    Ok(())
}

/// Allocate a chunk of `total` bytes (header included) for `usable` caller bytes
///
/// `total` is raised to [`MIN_CHUNK_SIZE`]. A larger free chunk is split when
/// the remainder can form a chunk of its own; otherwise it is handed out
/// whole. Returns `None` when no free chunk is large enough.
pub fn take(arena: &mut Arena<'_>, total: u64, usable: u64) -> ShmResult<Option<Offset>> {
    let total = total.max(MIN_CHUNK_SIZE as u64);
    let Some(chunk) = freelist::find_fit(arena, total)? else {
        return Ok(None);
    };
    freelist::remove(arena, chunk)?;

    let size = arena.chunk(chunk)?.size;
    if size - total >= MIN_CHUNK_SIZE as u64 {
        let rest = chunk + total;
        arena.put_chunk(rest, ChunkHeader::free(size - total))?;
        arena.chunk_mut(chunk)?.size = total;

        let mut ends = arena.header().chunks;
        offset::insert_after(&mut arena.chain(), &mut ends, chunk, rest)?;
        arena.header_mut().chunks = ends;
        freelist::insert(arena, rest)?;
    }

    let header = arena.chunk_mut(chunk)?;
    header.used = 1;
    header.usable = usable;
    Ok(Some(chunk))
}

/// Header of the used chunk at `chunk`
///
/// Fails with `InvalidArgument` unless `chunk` is a used member of the chunk
/// chain. Bytes that merely look like a used header, such as a stale header
/// inside a merged chunk, are rejected because no neighbour links to them.
pub fn live(arena: &Arena<'_>, chunk: Offset) -> ShmResult<ChunkHeader> {
    match arena.chunk(chunk) {
        Ok(header) if header.is_used() && in_chain(arena, chunk, header) => Ok(*header),
        _ => Err(ShmError::invalid(format!(
            "no live allocation at chunk offset {}",
            chunk
        ))),
    }
}

/// Whether both chain neighbours of `chunk` link back to it
fn in_chain(arena: &Arena<'_>, chunk: Offset, header: &ChunkHeader) -> bool {
    let ends = arena.header().chunks;
    let OffsetLink { prev, next } = header.chain;
    let from_prev = if prev == NIL {
        ends.head == chunk
    } else {
        prev < chunk && arena.chunk(prev).map_or(false, |p| p.chain.next == chunk)
    };
    let from_next = if next == NIL {
        ends.tail == chunk
    } else {
        chunk.checked_add(header.size) == Some(next)
            && arena.chunk(next).map_or(false, |n| n.chain.prev == chunk)
    };
    from_prev && from_next
}

/// Return a chunk to the free lists, merging it with free neighbours
///
/// Returns `false` without touching anything if the chunk is already free.
/// Headers absorbed by a merge are wiped, so freeing one of them again also
/// lands here.
pub fn release(arena: &mut Arena<'_>, chunk: Offset) -> ShmResult<bool> {
    let header = match arena.chunk(chunk) {
        Ok(header) if !header.is_used() => return Ok(false),
        _ => live(arena, chunk)?,
    };

    let mut survivor = chunk;
    let mut size = header.size;
    let mut ends = arena.header().chunks;

    let next = header.chain.next;
    if next != NIL && !arena.chunk(next)?.is_used() {
        freelist::remove(arena, next)?;
        size += arena.chunk(next)?.size;
        offset::unlink(&mut arena.chain(), &mut ends, next)?;
        arena.put_chunk(next, ChunkHeader::free(0))?;
    }

    let prev = header.chain.prev;
    if prev != NIL && !arena.chunk(prev)?.is_used() {
        freelist::remove(arena, prev)?;
        size += arena.chunk(prev)?.size;
        offset::unlink(&mut arena.chain(), &mut ends, chunk)?;
        arena.put_chunk(chunk, ChunkHeader::free(0))?;
        survivor = prev;
    }
    arena.header_mut().chunks = ends;

    let merged = arena.chunk_mut(survivor)?;
    merged.size = size;
    merged.used = 0;
    merged.usable = 0;
    freelist::insert(arena, survivor)?;
    Ok(true)
}

/// Account for a segment that was enlarged from `old_size` to the arena length
///
/// A free tail chunk absorbs the new space; otherwise a new free chunk covering
/// exactly the added bytes is appended to the chain.
pub fn absorb_growth(arena: &mut Arena<'_>, old_size: u64) -> ShmResult<()> {
    let new_size = arena.len() as u64;
    let added = new_size
        .checked_sub(old_size)
        .filter(|added| *added >= MIN_CHUNK_SIZE as u64)
        .ok_or_else(|| {
            ShmError::invalid(format!("cannot grow pool from {} to {}", old_size, new_size))
        })?;

    let last = arena.header().chunks.tail;
    if last != NIL && !arena.chunk(last)?.is_used() {
        freelist::remove(arena, last)?;
        arena.chunk_mut(last)?.size += added;
        freelist::insert(arena, last)?;
    } else {
        let fresh = old_size as Offset;
        arena.put_chunk(fresh, ChunkHeader::free(added))?;
        let mut ends = arena.header().chunks;
        offset::push_back(&mut arena.chain(), &mut ends, fresh)?;
        arena.header_mut().chunks = ends;
        freelist::insert(arena, fresh)?;
    }

    arena.header_mut().size = new_size;
    Ok(())
}

/// One entry of the chunk chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkInfo {
    pub offset: u64,
    /// Total size, header included
    pub size: u64,
    pub usable: u64,
    pub used: bool,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: u64,
    pub max_size: u64,
    pub open: u64,
    pub used_chunks: usize,
    pub free_chunks: usize,
    /// Sum of the usable sizes recorded for used chunks
    pub used_bytes: u64,
    /// Sum of the capacities of free chunks
    pub free_bytes: u64,
    /// Capacity of the largest free chunk
    pub largest_free: u64,
    /// Free chunks per size class
    pub buckets: [usize; FREE_LIST_COUNT],
}

/// The chunk chain in address order
pub fn chunks(arena: &mut Arena<'_>) -> ShmResult<Vec<ChunkInfo>> {
    let ends = arena.header().chunks;
    let offsets = offset::collect(&arena.chain(), &ends)?;
    offsets
        .into_iter()
        .map(|off| {
            let chunk = arena.chunk(off)?;
            Ok(ChunkInfo {
                offset: off,
                size: chunk.size,
                usable: chunk.usable,
                used: chunk.is_used(),
            })
        })
        .collect()
}

pub fn stats(arena: &mut Arena<'_>) -> ShmResult<PoolStats> {
    let header = *arena.header();
    let mut stats = PoolStats {
        size: header.size,
        max_size: header.max_size,
        open: header.open,
        buckets: freelist::bucket_counts(arena)?,
        ..PoolStats::default()
    };
    for chunk in chunks(arena)? {
        let capacity = chunk.size.saturating_sub(CHUNK_HEADER_SIZE as u64);
        if chunk.used {
            stats.used_chunks += 1;
            stats.used_bytes += chunk.usable;
        } else {
            stats.free_chunks += 1;
            stats.free_bytes += capacity;
            stats.largest_free = stats.largest_free.max(capacity);
        }
    }
    Ok(stats)
}

/// Full consistency check of the chain and the free lists
pub fn verify(arena: &mut Arena<'_>) -> ShmResult<()> {
    validate(arena)?;

    let ends = arena.header().chunks;
    let offsets = offset::collect(&arena.chain(), &ends)?;
    let mut expected = POOL_HEADER_SIZE as Offset;
    let mut prev = NIL;
    let mut prev_free = false;
    let mut free_count = 0usize;
    let mut free_bytes = 0u64;

    for off in offsets {
        let chunk = arena.chunk(off)?;
        if off != expected {
            return Err(ShmError::corrupted(format!(
                "chunk at {} where {} was expected",
                off, expected
            )));
        }
        if chunk.chain.prev != prev {
            return Err(ShmError::corrupted(format!("chain back link broken at {}", off)));
        }
        if chunk.size < MIN_CHUNK_SIZE as u64 || chunk.size % ALIGNMENT as u64 != 0 {
            return Err(ShmError::corrupted(format!(
                "chunk {} has invalid size {}",
                off, chunk.size
            )));
        }
        if chunk.is_used() {
            if chunk.usable > chunk.capacity() {
                return Err(ShmError::corrupted(format!(
                    "chunk {} records {} usable bytes in {} of capacity",
                    off,
                    chunk.usable,
                    chunk.capacity()
                )));
            }
            prev_free = false;
        } else {
            if prev_free {
                return Err(ShmError::corrupted(format!(
                    "free chunk {} follows another free chunk",
                    off
                )));
            }
            prev_free = true;
            free_count += 1;
            free_bytes += chunk.size;
        }
        expected += chunk.size;
        prev = off;
    }

    if expected != arena.len() as Offset {
        return Err(ShmError::corrupted(format!(
            "chunks cover {} of {} bytes",
            expected,
            arena.len()
        )));
    }
    if ends.tail != prev {
        return Err(ShmError::corrupted("chain tail is stale"));
    }
    if freelist::verify(arena)? != (free_count, free_bytes) {
        return Err(ShmError::corrupted(
            "free lists disagree with the free chunks of the chain",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::align_up;

    const SEGMENT: usize = 4096;

    fn total(usable: usize) -> u64 {
        align_up(usable + CHUNK_HEADER_SIZE) as u64
    }

    fn with_arena<F: FnOnce(&mut Arena<'_>)>(len: usize, f: F) {
        let mut buf = vec![0u64; len / 8];
        let mut arena = Arena::new(bytemuck::cast_slice_mut(&mut buf)).unwrap();
        format(&mut arena, SEGMENT as u64 * 4).unwrap();
        f(&mut arena);
    }

    #[test]
    fn test_format_single_free_chunk() {
        with_arena(SEGMENT, |arena| {
            verify(arena).unwrap();
            let all = chunks(arena).unwrap();
            assert_eq!(all.len(), 1);
            assert_eq!(all[0].offset, POOL_HEADER_SIZE as u64);
            assert_eq!(all[0].size, (SEGMENT - POOL_HEADER_SIZE) as u64);
            assert!(!all[0].used);
        });
    }

    #[test]
    fn test_take_splits_and_reuses_offset() {
        with_arena(SEGMENT, |arena| {
            let a = take(arena, total(100), 100).unwrap().unwrap();
            assert_eq!(a, POOL_HEADER_SIZE as u64);
            assert_eq!(arena.chunk(a).unwrap().size, total(100));
            verify(arena).unwrap();

            assert!(release(arena, a).unwrap());
            verify(arena).unwrap();
            let again = take(arena, total(100), 100).unwrap().unwrap();
            assert_eq!(again, a);
        });
    }

    #[test]
    fn test_take_whole_chunk_when_remainder_too_small() {
        with_arena(SEGMENT, |arena| {
            let whole = SEGMENT - POOL_HEADER_SIZE - CHUNK_HEADER_SIZE;
            // Leave less than a minimal chunk behind
            let usable = whole - CHUNK_HEADER_SIZE;
            let c = take(arena, total(usable), usable as u64).unwrap().unwrap();
            assert_eq!(chunks(arena).unwrap().len(), 1);
            assert_eq!(arena.chunk(c).unwrap().size, (SEGMENT - POOL_HEADER_SIZE) as u64);
            assert!(take(arena, total(1), 1).unwrap().is_none());
            verify(arena).unwrap();
        });
    }

    #[test]
    fn test_release_coalesces_both_orders() {
        for reverse in [false, true] {
            with_arena(SEGMENT, |arena| {
                let a = take(arena, total(200), 200).unwrap().unwrap();
                let b = take(arena, total(300), 300).unwrap().unwrap();
                let guard = take(arena, total(8), 8).unwrap().unwrap();

                let (first, second) = if reverse { (b, a) } else { (a, b) };
                release(arena, first).unwrap();
                release(arena, second).unwrap();
                verify(arena).unwrap();

                let merged = arena.chunk(a).unwrap();
                assert!(!merged.is_used());
                assert_eq!(merged.size, total(200) + total(300));
                assert!(merged.capacity() >= 500 - CHUNK_HEADER_SIZE as u64);
                assert!(arena.chunk(guard).unwrap().is_used());
            });
        }
    }

    #[test]
    fn test_release_merges_three_way() {
        with_arena(SEGMENT, |arena| {
            let a = take(arena, total(64), 64).unwrap().unwrap();
            let b = take(arena, total(64), 64).unwrap().unwrap();
            let c = take(arena, total(64), 64).unwrap().unwrap();
            release(arena, a).unwrap();
            release(arena, c).unwrap();
            release(arena, b).unwrap();
            verify(arena).unwrap();
            assert_eq!(chunks(arena).unwrap().len(), 1);
        });
    }

    #[test]
    fn test_double_release_is_noop() {
        with_arena(SEGMENT, |arena| {
            let a = take(arena, total(32), 32).unwrap().unwrap();
            assert!(release(arena, a).unwrap());
            assert!(!release(arena, a).unwrap());
            verify(arena).unwrap();
        });
    }

    #[test]
    fn test_release_of_merged_chunk_is_noop() {
        with_arena(SEGMENT, |arena| {
            let a = take(arena, total(64), 64).unwrap().unwrap();
            let b = take(arena, total(64), 64).unwrap().unwrap();
            let c = take(arena, total(64), 64).unwrap().unwrap();
            assert!(release(arena, a).unwrap());
            // b is absorbed into a
            assert!(release(arena, b).unwrap());
            assert!(!release(arena, b).unwrap());
            verify(arena).unwrap();

            let all = chunks(arena).unwrap();
            assert_eq!(all.len(), 3);
            assert_eq!(all[0].offset, a);
            assert_eq!(all[0].size, 2 * total(64));
            assert_eq!(all[1].offset, c);
        });
    }

    #[test]
    fn test_header_inside_allocation_is_not_live() {
        with_arena(SEGMENT, |arena| {
            let a = take(arena, total(256), 256).unwrap().unwrap();
            let fake = a + CHUNK_HEADER_SIZE as Offset + 64;
            let mut forged = ChunkHeader::free(total(64));
            forged.used = 1;
            arena.put_chunk(fake, forged).unwrap();

            assert!(live(arena, a).is_ok());
            let err = live(arena, fake).unwrap_err();
            assert_eq!(err.kind(), crate::error::ShmErrorKind::InvalidArgument);
            assert!(release(arena, fake).is_err());
            assert!(live(arena, 1 << 20).is_err());
            verify(arena).unwrap();
        });
    }

    #[test]
    fn test_take_rounds_up_to_minimum_chunk() {
        with_arena(SEGMENT, |arena| {
            let a = take(arena, total(1), 1).unwrap().unwrap();
            let fence = take(arena, total(64), 64).unwrap().unwrap();
            assert_eq!(arena.chunk(a).unwrap().size, MIN_CHUNK_SIZE as u64);

            release(arena, a).unwrap();
            assert_eq!(stats(arena).unwrap().buckets[0], 1);
            assert!(arena.chunk(fence).unwrap().is_used());
            verify(arena).unwrap();
        });
    }

    #[test]
    fn test_absorb_growth_extends_free_tail() {
        let mut buf = vec![0u64; 2 * SEGMENT / 8];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut buf);
        {
            let mut small = Arena::new(&mut bytes[..SEGMENT]).unwrap();
            format(&mut small, 4 * SEGMENT as u64).unwrap();
        }
        let mut arena = Arena::new(bytes).unwrap();
        absorb_growth(&mut arena, SEGMENT as u64).unwrap();
        verify(&mut arena).unwrap();
        let all = chunks(&mut arena).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].size, (2 * SEGMENT - POOL_HEADER_SIZE) as u64);
    }

    #[test]
    fn test_absorb_growth_appends_after_used_tail() {
        let mut buf = vec![0u64; 2 * SEGMENT / 8];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut buf);
        let used;
        {
            let mut small = Arena::new(&mut bytes[..SEGMENT]).unwrap();
            format(&mut small, 4 * SEGMENT as u64).unwrap();
            let whole = (SEGMENT - POOL_HEADER_SIZE - CHUNK_HEADER_SIZE) as u64;
            used = take(&mut small, whole + CHUNK_HEADER_SIZE as u64, whole)
                .unwrap()
                .unwrap();
        }
        let mut arena = Arena::new(bytes).unwrap();
        absorb_growth(&mut arena, SEGMENT as u64).unwrap();
        verify(&mut arena).unwrap();

        let all = chunks(&mut arena).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].offset, used);
        assert!(all[0].used);
        assert_eq!(all[1].offset, SEGMENT as u64);
        assert_eq!(all[1].size, SEGMENT as u64);
    }

    #[test]
    fn test_stats_account_for_every_byte() {
        with_arena(SEGMENT, |arena| {
            let a = take(arena, total(100), 100).unwrap().unwrap();
            take(arena, total(700), 700).unwrap().unwrap();
            release(arena, a).unwrap();

            let stats = stats(arena).unwrap();
            assert_eq!(stats.used_chunks, 1);
            assert_eq!(stats.used_bytes, 700);
            assert_eq!(stats.free_chunks, 2);
            assert!(stats.used_bytes + stats.free_bytes <= (SEGMENT - POOL_HEADER_SIZE) as u64);
            assert_eq!(stats.buckets.iter().sum::<usize>(), 2);
        });
    }

    #[test]
    fn test_verify_detects_adjacent_free_chunks() {
        with_arena(SEGMENT, |arena| {
            let a = take(arena, total(100), 100).unwrap().unwrap();
            // Mark free without coalescing or filing
            arena.chunk_mut(a).unwrap().used = 0;
            assert!(verify(arena).is_err());
        });
    }
}
