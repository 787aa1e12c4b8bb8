//! Segregated free lists
//!
//! Free chunks are indexed in three unordered buckets by total chunk size:
//! small (< 64 bytes, the minimum chunk and little else), medium (< 1024 bytes)
//! and large. A fit is searched in
//! the request's own bucket and then every larger one, taking the first chunk
//! that is big enough. This bounds the scan by the bucket count rather than
//! the chunk count, at the price of sometimes picking a larger chunk than a
//! global best fit would.

use super::layout::{Arena, FREE_LIST_COUNT};
use super::offset::{self, Offset};
use crate::error::{ShmError, ShmResult};

const SMALL_LIMIT: u64 = 64;
const MEDIUM_LIMIT: u64 = 1024;

/// Size class of a free chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SizeClass {
    Small = 0,
    Medium = 1,
    Large = 2,
}

impl SizeClass {
    pub fn for_size(size: u64) -> Self {
        if size < SMALL_LIMIT {
            SizeClass::Small
        } else if size < MEDIUM_LIMIT {
            SizeClass::Medium
        } else {
            SizeClass::Large
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Put a free chunk at the head of the bucket matching its size
pub fn insert(arena: &mut Arena<'_>, chunk: Offset) -> ShmResult<()> {
    let bucket = SizeClass::for_size(arena.chunk(chunk)?.size).index();
    let mut ends = arena.header().free_lists[bucket];
    offset::push_front(&mut arena.free_links(), &mut ends, chunk)?;
    arena.header_mut().free_lists[bucket] = ends;
    Ok(())
}

/// Take a free chunk out of its bucket
///
/// Must be called before the chunk's size changes, since the size selects the
/// bucket.
pub fn remove(arena: &mut Arena<'_>, chunk: Offset) -> ShmResult<()> {
    let bucket = SizeClass::for_size(arena.chunk(chunk)?.size).index();
    let mut ends = arena.header().free_lists[bucket];
    offset::unlink(&mut arena.free_links(), &mut ends, chunk)?;
    arena.header_mut().free_lists[bucket] = ends;
    Ok(())
}

/// First free chunk of at least `size` total bytes, scanning upward from the
/// bucket `size` belongs to
pub fn find_fit(arena: &mut Arena<'_>, size: u64) -> ShmResult<Option<Offset>> {
    for bucket in SizeClass::for_size(size).index()..FREE_LIST_COUNT {
        let ends = arena.header().free_lists[bucket];
        let found = offset::find(&arena.free_links(), &ends, |links, node| {
            Ok(links.arena().chunk(node)?.size >= size)
        })?;
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

/// Walk every bucket, checking back links and bucket placement
///
/// Returns the number of free chunks and their total size.
pub fn verify(arena: &mut Arena<'_>) -> ShmResult<(usize, u64)> {
    let mut count = 0usize;
    let mut bytes = 0u64;
    for bucket in 0..FREE_LIST_COUNT {
        let ends = arena.header().free_lists[bucket];
        let nodes = offset::collect(&arena.free_links(), &ends)?;
        let mut prev = offset::NIL;
        for node in nodes {
            if arena.free_link(node)?.prev != prev {
                return Err(ShmError::corrupted(format!(
                    "free list {} back link broken at {}",
                    bucket, node
                )));
            }
            let chunk = arena.chunk(node)?;
            if chunk.is_used() {
                return Err(ShmError::corrupted(format!(
                    "used chunk {} found in free list {}",
                    node, bucket
                )));
            }
            if SizeClass::for_size(chunk.size).index() != bucket {
                return Err(ShmError::corrupted(format!(
                    "chunk {} of {} bytes filed in free list {}",
                    node, chunk.size, bucket
                )));
            }
            count += 1;
            bytes += chunk.size;
            prev = node;
        }
        if ends.tail != prev {
            return Err(ShmError::corrupted(format!("free list {} tail is stale", bucket)));
        }
    }
    Ok((count, bytes))
}

/// Number of chunks in each bucket
pub fn bucket_counts(arena: &mut Arena<'_>) -> ShmResult<[usize; FREE_LIST_COUNT]> {
    let mut counts = [0usize; FREE_LIST_COUNT];
    for (bucket, count) in counts.iter_mut().enumerate() {
        let ends = arena.header().free_lists[bucket];
        *count = offset::collect(&arena.free_links(), &ends)?.len();
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::{ChunkHeader, MIN_CHUNK_SIZE, POOL_HEADER_SIZE};

    fn scratch(len: usize) -> Vec<u64> {
        vec![0u64; len / 8]
    }

    /// Place free chunks of the given sizes back to back after the header
    fn place(arena: &mut Arena<'_>, sizes: &[u64]) -> Vec<Offset> {
        let mut at = POOL_HEADER_SIZE as Offset;
        let mut offsets = Vec::new();
        for &size in sizes {
            arena.put_chunk(at, ChunkHeader::free(size)).unwrap();
            insert(arena, at).unwrap();
            offsets.push(at);
            at += size;
        }
        offsets
    }

    #[test]
    fn test_size_classes() {
        assert_eq!(SizeClass::for_size(0), SizeClass::Small);
        assert_eq!(SizeClass::for_size(63), SizeClass::Small);
        assert_eq!(SizeClass::for_size(64), SizeClass::Medium);
        assert_eq!(SizeClass::for_size(1023), SizeClass::Medium);
        assert_eq!(SizeClass::for_size(1024), SizeClass::Large);
    }

    #[test]
    fn test_find_fit_scans_upward_first_fit() {
        let mut buf = scratch(8192);
        let mut arena = Arena::new(bytemuck::cast_slice_mut(&mut buf)).unwrap();
        let offs = place(&mut arena, &[128, 2048, 4096]);

        // Medium request served from the medium bucket
        assert_eq!(find_fit(&mut arena, 100).unwrap(), Some(offs[0]));
        // Too big for medium: first fit in large is the most recently inserted
        assert_eq!(find_fit(&mut arena, 200).unwrap(), Some(offs[2]));
        assert_eq!(find_fit(&mut arena, 3000).unwrap(), Some(offs[2]));
        assert_eq!(find_fit(&mut arena, 5000).unwrap(), None);

        assert_eq!(verify(&mut arena).unwrap(), (3, 128 + 2048 + 4096));
        assert_eq!(bucket_counts(&mut arena).unwrap(), [0, 1, 2]);
    }

    #[test]
    fn test_minimum_chunk_is_small() {
        let mut buf = scratch(4096);
        let mut arena = Arena::new(bytemuck::cast_slice_mut(&mut buf)).unwrap();
        let offs = place(&mut arena, &[MIN_CHUNK_SIZE as u64, 512]);

        assert_eq!(SizeClass::for_size(MIN_CHUNK_SIZE as u64), SizeClass::Small);
        assert_eq!(bucket_counts(&mut arena).unwrap(), [1, 1, 0]);
        assert_eq!(find_fit(&mut arena, MIN_CHUNK_SIZE as u64).unwrap(), Some(offs[0]));
        assert_eq!(verify(&mut arena).unwrap(), (2, MIN_CHUNK_SIZE as u64 + 512));
    }

    #[test]
    fn test_remove_keeps_lists_consistent() {
        let mut buf = scratch(8192);
        let mut arena = Arena::new(bytemuck::cast_slice_mut(&mut buf)).unwrap();
        let offs = place(&mut arena, &[1024, 1024, 1024]);

        remove(&mut arena, offs[1]).unwrap();
        assert_eq!(verify(&mut arena).unwrap(), (2, 2048));
        remove(&mut arena, offs[2]).unwrap();
        remove(&mut arena, offs[0]).unwrap();
        assert_eq!(verify(&mut arena).unwrap(), (0, 0));
        assert!(arena.header().free_lists[2].is_empty());
    }

    #[test]
    fn test_verify_detects_misfiled_chunk() {
        let mut buf = scratch(8192);
        let mut arena = Arena::new(bytemuck::cast_slice_mut(&mut buf)).unwrap();
        let offs = place(&mut arena, &[128]);

        // Grow the chunk without refiling it
        arena.chunk_mut(offs[0]).unwrap().size = 2048;
        assert!(verify(&mut arena).is_err());
    }
}
