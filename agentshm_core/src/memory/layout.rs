//! Segment layout
//!
//! ```text
//! +-------------+--------------+------------+--------------+------------+----
//! | PoolHeader  | ChunkHeader  | usable ... | ChunkHeader  | usable ... |
//! +-------------+--------------+------------+--------------+------------+----
//! 0             POOL_HEADER_SIZE
//! ```
//!
//! The header is followed immediately by the first chunk; every chunk starts
//! right after the previous chunk's total size. All sizes and offsets are
//! multiples of [`ALIGNMENT`].
//!
//! A free chunk keeps its free-list links in the first bytes of its usable
//! area, so every chunk is at least [`MIN_CHUNK_SIZE`] bytes long.

use super::offset::{Links, ListEnds, Offset, OffsetLink};
use crate::error::{ShmError, ShmResult};
use bytemuck::{Pod, Zeroable};
use std::mem;

/// Alignment unit for every header, chunk and size
pub const ALIGNMENT: usize = 8;

/// Round `size` up to the alignment unit
pub const fn align_up(size: usize) -> usize {
    (size + (ALIGNMENT - 1)) & !(ALIGNMENT - 1)
}

/// Marks a formatted pool ("AGSHMPL1")
pub const POOL_MAGIC: u64 = u64::from_le_bytes(*b"AGSHMPL1");

/// Number of free-list size classes
pub const FREE_LIST_COUNT: usize = 3;

/// Pool header, at offset 0 of the segment
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PoolHeader {
    pub magic: u64,
    /// Total segment size in bytes, header included
    pub size: u64,
    pub max_size: u64,
    /// Offset of the user root object, `0` when unset
    pub user_offset: u64,
    /// Number of attached handles
    pub open: u64,
    pub free_lists: [ListEnds; FREE_LIST_COUNT],
    /// Chunk chain in address order
    pub chunks: ListEnds,
}

pub const POOL_HEADER_SIZE: usize = align_up(mem::size_of::<PoolHeader>());

/// Header in front of every chunk
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ChunkHeader {
    /// Total size including this header
    pub size: u64,
    /// Bytes requested by the caller, `0` while free
    pub usable: u64,
    /// Position in the chunk chain
    pub chain: OffsetLink,
    pub used: u32,
    pub _reserved: u32,
}

pub const CHUNK_HEADER_SIZE: usize = align_up(mem::size_of::<ChunkHeader>());

/// Free-list links stored at the start of a free chunk's usable area
pub const FREE_LINK_SIZE: usize = align_up(mem::size_of::<OffsetLink>());

/// Smallest chunk: a header and room for the free-list links
pub const MIN_CHUNK_SIZE: usize = CHUNK_HEADER_SIZE + FREE_LINK_SIZE;

impl ChunkHeader {
    pub fn free(size: u64) -> Self {
        Self {
            size,
            usable: 0,
            chain: OffsetLink::default(),
            used: 0,
            _reserved: 0,
        }
    }

    pub fn is_used(&self) -> bool {
        self.used != 0
    }

    /// Bytes available to the caller
    pub fn capacity(&self) -> u64 {
        self.size.saturating_sub(CHUNK_HEADER_SIZE as u64)
    }
}

/// Bounds-checked view of a mapped segment
///
/// Only hands out headers and byte ranges at validated offsets; a corrupted
/// offset yields [`ShmError::Corrupted`] instead of touching memory outside the
/// mapping.
pub struct Arena<'a> {
    bytes: &'a mut [u8],
}

impl<'a> Arena<'a> {
    pub fn new(bytes: &'a mut [u8]) -> ShmResult<Self> {
        if bytes.len() < POOL_HEADER_SIZE + MIN_CHUNK_SIZE {
            return Err(ShmError::corrupted(format!(
                "segment of {} bytes cannot hold a pool",
                bytes.len()
            )));
        }
        if (bytes.as_ptr() as usize) % ALIGNMENT != 0 {
            return Err(ShmError::corrupted("segment base is misaligned"));
        }
        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn header(&self) -> &PoolHeader {
        bytemuck::from_bytes(&self.bytes[..mem::size_of::<PoolHeader>()])
    }

    pub fn header_mut(&mut self) -> &mut PoolHeader {
        bytemuck::from_bytes_mut(&mut self.bytes[..mem::size_of::<PoolHeader>()])
    }

    fn check_chunk(&self, offset: Offset) -> ShmResult<usize> {
        let off = offset as usize;
        if off < POOL_HEADER_SIZE
            || off % ALIGNMENT != 0
            || off
                .checked_add(CHUNK_HEADER_SIZE)
                .map_or(true, |end| end > self.len())
        {
            return Err(ShmError::corrupted(format!(
                "chunk offset {} outside segment of {} bytes",
                offset,
                self.len()
            )));
        }
        Ok(off)
    }

    pub fn chunk(&self, offset: Offset) -> ShmResult<&ChunkHeader> {
        let off = self.check_chunk(offset)?;
        Ok(bytemuck::from_bytes(
            &self.bytes[off..off + mem::size_of::<ChunkHeader>()],
        ))
    }

    pub fn chunk_mut(&mut self, offset: Offset) -> ShmResult<&mut ChunkHeader> {
        let off = self.check_chunk(offset)?;
        Ok(bytemuck::from_bytes_mut(
            &mut self.bytes[off..off + mem::size_of::<ChunkHeader>()],
        ))
    }

    pub fn put_chunk(&mut self, offset: Offset, chunk: ChunkHeader) -> ShmResult<()> {
        *self.chunk_mut(offset)? = chunk;
        Ok(())
    }

    fn check_free_link(&self, offset: Offset) -> ShmResult<std::ops::Range<usize>> {
        let off = self.check_chunk(offset)?;
        self.check_range((off + CHUNK_HEADER_SIZE) as Offset, mem::size_of::<OffsetLink>())
    }

    /// Free-list links of the free chunk at `offset`
    pub fn free_link(&self, offset: Offset) -> ShmResult<&OffsetLink> {
        let range = self.check_free_link(offset)?;
        Ok(bytemuck::from_bytes(&self.bytes[range]))
    }

    pub fn free_link_mut(&mut self, offset: Offset) -> ShmResult<&mut OffsetLink> {
        let range = self.check_free_link(offset)?;
        Ok(bytemuck::from_bytes_mut(&mut self.bytes[range]))
    }

    fn check_range(&self, offset: Offset, len: usize) -> ShmResult<std::ops::Range<usize>> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if start >= POOL_HEADER_SIZE && end <= self.len() => Ok(start..end),
            _ => Err(ShmError::corrupted(format!(
                "range {}+{} outside segment of {} bytes",
                offset,
                len,
                self.len()
            ))),
        }
    }

    pub fn data(&self, offset: Offset, len: usize) -> ShmResult<&[u8]> {
        let range = self.check_range(offset, len)?;
        Ok(&self.bytes[range])
    }

    pub fn data_mut(&mut self, offset: Offset, len: usize) -> ShmResult<&mut [u8]> {
        let range = self.check_range(offset, len)?;
        Ok(&mut self.bytes[range])
    }

    /// Copy `len` bytes between two ranges of the segment
    pub fn copy_within(&mut self, from: Offset, to: Offset, len: usize) -> ShmResult<()> {
        let src = self.check_range(from, len)?;
        self.check_range(to, len)?;
        self.bytes.copy_within(src, to as usize);
        Ok(())
    }

    /// Links of the chunk chain
    pub fn chain(&mut self) -> ChainLinks<'_, 'a> {
        ChainLinks(self)
    }

    /// Links of the free-list buckets
    pub fn free_links(&mut self) -> FreeLinks<'_, 'a> {
        FreeLinks(self)
    }

    fn max_nodes(&self) -> usize {
        self.len() / MIN_CHUNK_SIZE + 1
    }
}

/// Chunk chain links of an [`Arena`]
pub struct ChainLinks<'s, 'a>(&'s mut Arena<'a>);

impl Links for ChainLinks<'_, '_> {
    fn link(&self, node: Offset) -> ShmResult<OffsetLink> {
        Ok(self.0.chunk(node)?.chain)
    }

    fn set_link(&mut self, node: Offset, link: OffsetLink) -> ShmResult<()> {
        self.0.chunk_mut(node)?.chain = link;
        Ok(())
    }

    fn max_nodes(&self) -> usize {
        self.0.max_nodes()
    }
}

/// Free-list links of an [`Arena`]
pub struct FreeLinks<'s, 'a>(&'s mut Arena<'a>);

impl<'a> FreeLinks<'_, 'a> {
    pub fn arena(&self) -> &Arena<'a> {
        self.0
    }
}

impl Links for FreeLinks<'_, '_> {
    fn link(&self, node: Offset) -> ShmResult<OffsetLink> {
        Ok(*self.0.free_link(node)?)
    }

    fn set_link(&mut self, node: Offset, link: OffsetLink) -> ShmResult<()> {
        *self.0.free_link_mut(node)? = link;
        Ok(())
    }

    fn max_nodes(&self) -> usize {
        self.0.max_nodes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 8-byte aligned scratch buffer
    fn scratch(len: usize) -> Vec<u64> {
        vec![0u64; len / 8]
    }

    #[test]
    fn test_layout_sizes_are_aligned() {
        assert_eq!(POOL_HEADER_SIZE % ALIGNMENT, 0);
        assert_eq!(CHUNK_HEADER_SIZE % ALIGNMENT, 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(9), 16);
    }

    #[test]
    fn test_chunk_bounds_are_checked() {
        let mut buf = scratch(1024);
        let arena = Arena::new(bytemuck::cast_slice_mut(&mut buf)).unwrap();

        assert!(arena.chunk(POOL_HEADER_SIZE as Offset).is_ok());
        assert!(arena.chunk(0).is_err());
        assert!(arena.chunk(POOL_HEADER_SIZE as Offset + 4).is_err());
        assert!(arena.chunk((1024 - CHUNK_HEADER_SIZE + 8) as Offset).is_err());
        assert!(arena.data(1000, 100).is_err());
    }

    #[test]
    fn test_free_link_lives_after_the_header() {
        let mut buf = scratch(1024);
        let mut arena = Arena::new(bytemuck::cast_slice_mut(&mut buf)).unwrap();
        let at = POOL_HEADER_SIZE as Offset;
        arena.put_chunk(at, ChunkHeader::free(MIN_CHUNK_SIZE as u64)).unwrap();
        *arena.free_link_mut(at).unwrap() = OffsetLink { prev: 0, next: 512 };

        assert_eq!(arena.chunk(at).unwrap().size, MIN_CHUNK_SIZE as u64);
        let payload = arena.data(at + CHUNK_HEADER_SIZE as Offset, 16).unwrap();
        assert_eq!(&payload[8..], &512u64.to_ne_bytes());
        // No room for the links of a chunk at the very end
        assert!(arena.free_link((1024 - CHUNK_HEADER_SIZE) as Offset).is_err());
    }

    #[test]
    fn test_too_small_segment_is_rejected() {
        let mut buf = scratch(POOL_HEADER_SIZE);
        assert!(Arena::new(bytemuck::cast_slice_mut(&mut buf)).is_err());
    }
}
