//! Offset-addressed intrusive lists
//!
//! The same segment is mapped at a different base address in every process, so
//! links inside the segment are byte offsets from the segment base. Offset `0`
//! is the pool header and can never be a list node; it doubles as the nil link.
//!
//! [`to_addr`] and [`to_offset`] are the only places where offsets meet native
//! addresses. Everything else in the allocator works on offsets alone.

use crate::error::{ShmError, ShmResult};
use bytemuck::{Pod, Zeroable};

/// Byte displacement from the segment base
pub type Offset = u64;

/// End-of-list marker
pub const NIL: Offset = 0;

/// Address of `offset` within a mapping starting at `base`
pub fn to_addr(base: *const u8, offset: Offset) -> *const u8 {
    base.wrapping_add(offset as usize)
}

/// Offset of `addr` within a mapping of `len` bytes starting at `base`
pub fn to_offset(base: *const u8, len: usize, addr: *const u8) -> Option<Offset> {
    let base = base as usize;
    let addr = addr as usize;
    if addr >= base && addr < base + len {
        Some((addr - base) as Offset)
    } else {
        None
    }
}

/// Previous/next pair stored inside a node
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct OffsetLink {
    pub prev: Offset,
    pub next: Offset,
}

/// First and last node of a list, stored by the list's owner
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ListEnds {
    pub head: Offset,
    pub tail: Offset,
}

impl ListEnds {
    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }
}

/// Access to one family of links embedded in arena nodes
pub trait Links {
    fn link(&self, node: Offset) -> ShmResult<OffsetLink>;
    fn set_link(&mut self, node: Offset, link: OffsetLink) -> ShmResult<()>;

    /// Upper bound on list length, used to detect cycles in corrupted state
    fn max_nodes(&self) -> usize;

    fn set_prev(&mut self, node: Offset, prev: Offset) -> ShmResult<()> {
        let mut link = self.link(node)?;
        link.prev = prev;
        self.set_link(node, link)
    }

    fn set_next(&mut self, node: Offset, next: Offset) -> ShmResult<()> {
        let mut link = self.link(node)?;
        link.next = next;
        self.set_link(node, link)
    }
}

/// Insert `node` at the front of the list
pub fn push_front<L: Links>(links: &mut L, ends: &mut ListEnds, node: Offset) -> ShmResult<()> {
    links.set_link(
        node,
        OffsetLink {
            prev: NIL,
            next: ends.head,
        },
    )?;
    if ends.head != NIL {
        links.set_prev(ends.head, node)?;
    } else {
        ends.tail = node;
    }
    ends.head = node;
    Ok(())
}

/// Append `node` at the back of the list
pub fn push_back<L: Links>(links: &mut L, ends: &mut ListEnds, node: Offset) -> ShmResult<()> {
    if ends.tail == NIL {
        return push_front(links, ends, node);
    }
    let tail = ends.tail;
    insert_after(links, ends, tail, node)
}

/// Insert `node` directly after `after`
pub fn insert_after<L: Links>(
    links: &mut L,
    ends: &mut ListEnds,
    after: Offset,
    node: Offset,
) -> ShmResult<()> {
    let next = links.link(after)?.next;
    links.set_link(node, OffsetLink { prev: after, next })?;
    links.set_next(after, node)?;
    if next != NIL {
        links.set_prev(next, node)?;
    } else {
        ends.tail = node;
    }
    Ok(())
}

/// Splice `node` out of the list; its own link is cleared
pub fn unlink<L: Links>(links: &mut L, ends: &mut ListEnds, node: Offset) -> ShmResult<()> {
    let link = links.link(node)?;
    if link.prev != NIL {
        links.set_next(link.prev, link.next)?;
    } else {
        ends.head = link.next;
    }
    if link.next != NIL {
        links.set_prev(link.next, link.prev)?;
    } else {
        ends.tail = link.prev;
    }
    links.set_link(node, OffsetLink::default())
}

/// First node, walking from the head, for which `pred` holds
pub fn find<L, F>(links: &L, ends: &ListEnds, mut pred: F) -> ShmResult<Option<Offset>>
where
    L: Links,
    F: FnMut(&L, Offset) -> ShmResult<bool>,
{
    let mut node = ends.head;
    let mut steps = 0usize;
    while node != NIL {
        if pred(links, node)? {
            return Ok(Some(node));
        }
        steps += 1;
        if steps > links.max_nodes() {
            return Err(ShmError::corrupted("offset list does not terminate"));
        }
        node = links.link(node)?.next;
    }
    Ok(None)
}

/// Every node of the list, head to tail
pub fn collect<L: Links>(links: &L, ends: &ListEnds) -> ShmResult<Vec<Offset>> {
    let mut nodes = Vec::new();
    find(links, ends, |_, node| {
        nodes.push(node);
        Ok(false)
    })?;
    Ok(nodes)
}
