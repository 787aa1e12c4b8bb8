//! Cross-process shared memory pool
//!
//! A [`SharedPool`] is one process's attachment to a named segment. Every
//! operation takes the cross-process lock, brings the local mapping up to the
//! shared size, and works on the segment through a bounds-checked [`Arena`].
//! Allocations are handed out as [`ShmPtr`] offsets so they mean the same thing
//! in every attached process.
//!
//! ```ignore
//! use agentshm_core::memory::SharedPool;
//!
//! let pool = SharedPool::create("audit_1", 64 * 1024)?;
//! let ptr = pool.alloc(256)?;
//! pool.write(ptr, 0, b"hello")?;
//! pool.set_user_root(Some(ptr))?;
//! pool.shutdown()?;
//! ```

use super::heap::{self, ChunkInfo, PoolStats};
use super::layout::{align_up, Arena, PoolHeader, ALIGNMENT, CHUNK_HEADER_SIZE, POOL_HEADER_SIZE};
use super::lock::{open_lock, LockState, SegmentLock};
use super::offset::{self, Offset, NIL};
use super::platform::{page_align, platform_name, ShmNames};
use super::recovery::{remove_object, OrphanStatus};
use super::shm_region::{Disposition, SharedSize, ShmRegion};
use crate::config::PoolConfig;
use crate::error::{ShmError, ShmErrorKind, ShmResult};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::fs;
use std::io;
use std::path::Path;

/// Location of an allocation, as an offset from the segment base
///
/// Points at the first usable byte. The value is identical in every attached
/// process and stays valid across remapping, so it can be stored inside
/// shared data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShmPtr(Offset);

impl ShmPtr {
    pub fn from_offset(offset: u64) -> Self {
        ShmPtr(offset)
    }

    pub fn offset(self) -> u64 {
        self.0
    }

    fn from_chunk(chunk: Offset) -> Self {
        ShmPtr(chunk + CHUNK_HEADER_SIZE as Offset)
    }

    fn chunk(self) -> ShmResult<Offset> {
        self.0
            .checked_sub(CHUNK_HEADER_SIZE as Offset)
            .filter(|chunk| *chunk >= POOL_HEADER_SIZE as Offset)
            .ok_or_else(|| ShmError::invalid(format!("offset {} is not an allocation", self.0)))
    }
}

/// Result of detaching a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Other handles remain attached
    Detached { remaining: u64 },
    /// This was the last handle; the named objects are gone
    Removed,
}

/// Per-process resources of an attached pool
struct Attachment {
    lock: Box<dyn SegmentLock>,
    region: ShmRegion,
    shared_size: SharedSize,
}

/// Holds the cross-process lock; releases it on drop
struct PoolGuard<'p> {
    att: MappedMutexGuard<'p, Attachment>,
}

impl PoolGuard<'_> {
    fn arena(&mut self) -> ShmResult<Arena<'_>> {
        Arena::new(self.att.region.as_mut_slice())
    }

    fn header(&mut self) -> ShmResult<PoolHeader> {
        Ok(*self.arena()?.header())
    }
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        self.att.lock.release();
    }
}

/// One process's handle on a named shared memory pool
///
/// The handle is `Send + Sync`; threads of one process serialize on an
/// in-process mutex before taking the cross-process lock.
pub struct SharedPool {
    names: ShmNames,
    growable: bool,
    created: bool,
    inner: Mutex<Option<Attachment>>,
    last_error: Mutex<Option<ShmErrorKind>>,
}

/// Attempts to find a lock object that is still in place
const LOCK_REOPEN_ATTEMPTS: usize = 3;

impl SharedPool {
    /// Create or attach to the pool `name` in the default directory
    pub fn create(name: &str, usable: usize) -> ShmResult<Self> {
        Self::create_with_config(name, usable, &PoolConfig::default())
    }

    /// Create or attach to the pool `name`
    ///
    /// The first caller sizes the segment for `usable` bytes (rounded up to a
    /// whole page, capped by the configured maximum) and formats it. Later
    /// callers attach to the existing segment and ignore `usable`.
    pub fn create_with_config(name: &str, usable: usize, config: &PoolConfig) -> ShmResult<Self> {
        if name.is_empty() {
            return Err(ShmError::invalid("pool name is empty"));
        }

        let dir = config.dir();
        fs::create_dir_all(&dir).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ShmError::NotFound(format!("{}: {}", dir.display(), e))
            } else {
                ShmError::fault("mkdir", e)
            }
        })?;

        let names = ShmNames::new(&dir, name);
        let max_size = config.max_pool_size();
        let size = page_align(usable.saturating_add(POOL_HEADER_SIZE)).min(max_size);

        let lock = Self::lock_current(&names)?;
        let attached = Self::attach_segment(&names, size, max_size);
        lock.release();
        let (region, shared_size, disposition) = attached?;

        let created = disposition == Disposition::Created;
        if created {
            log::info!(
                "Created shared pool '{}' at {} ({} bytes, max {} bytes)",
                names.name,
                names.segment.display(),
                region.size(),
                max_size
            );
        } else {
            log::info!(
                "Attached to shared pool '{}' ({} bytes)",
                names.name,
                region.size()
            );
        }

        Ok(Self {
            names,
            growable: config.growable,
            created,
            inner: Mutex::new(Some(Attachment {
                lock,
                region,
                shared_size,
            })),
            last_error: Mutex::new(None),
        })
    }

    /// Open and take the pool's lock object, reopening it if the last handle
    /// of a previous incarnation removed it while this process waited
    fn lock_current(names: &ShmNames) -> ShmResult<Box<dyn SegmentLock>> {
        for _ in 0..LOCK_REOPEN_ATTEMPTS {
            let lock = open_lock(names)?;
            if lock.acquire()? == LockState::Recovered {
                log::warn!(
                    "Recovered lock of pool '{}' from a holder that died",
                    names.name
                );
            }
            if lock.is_current() {
                return Ok(lock);
            }
            lock.release();
            log::debug!("Lock of pool '{}' was removed while waiting", names.name);
        }
        Err(ShmError::fault(
            "lock",
            io::Error::other(format!(
                "lock object of pool '{}' keeps being removed",
                names.name
            )),
        ))
    }

    /// Attach to the pool `name` only if it already exists
    pub fn open_existing(name: &str, config: &PoolConfig) -> ShmResult<Self> {
        let names = ShmNames::new(&config.dir(), name);
        if !names.segment.exists() {
            return Err(ShmError::NotFound(format!(
                "no pool '{}' in {}",
                names.name,
                config.dir().display()
            )));
        }
        Self::create_with_config(name, 0, config)
    }

    /// Map the segment and bring its header up to date; called with the
    /// lock held
    fn attach_segment(
        names: &ShmNames,
        size: usize,
        max_size: usize,
    ) -> ShmResult<(ShmRegion, SharedSize, Disposition)> {
        let (mut region, disposition) = ShmRegion::create_or_open(&names.segment, size)?;
        match Self::init_segment(&mut region, names, disposition, max_size) {
            Ok(shared_size) => Ok((region, shared_size, disposition)),
            Err(e) => {
                if disposition == Disposition::Created {
                    drop(region);
                    remove_object(&names.segment);
                }
                Err(e)
            }
        }
    }

    fn init_segment(
        region: &mut ShmRegion,
        names: &ShmNames,
        disposition: Disposition,
        max_size: usize,
    ) -> ShmResult<SharedSize> {
        let shared_size = SharedSize::open(&names.size)?;
        let mut arena = Arena::new(region.as_mut_slice())?;
        match disposition {
            Disposition::Created => heap::format(&mut arena, max_size as u64)?,
            Disposition::Opened => {
                heap::validate(&arena)?;
                arena.header_mut().open += 1;
            }
        }
        shared_size.store(arena.len());
        Ok(shared_size)
    }

    /// Remove the named objects of a pool without attaching to it
    ///
    /// For segments whose contents can no longer be trusted. Processes still
    /// attached keep their mappings.
    pub fn unlink(name: &str, config: &PoolConfig) -> ShmResult<()> {
        remove_objects(&ShmNames::new(&config.dir(), name))
    }

    /// Take the process-local mutex and the cross-process lock, then remap
    /// if another process resized the segment
    fn acquire(&self) -> ShmResult<PoolGuard<'_>> {
        let slot = self.inner.lock();
        let att = MutexGuard::try_map(slot, |slot| slot.as_mut())
            .map_err(|_| ShmError::invalid(format!("pool '{}' is shut down", self.names.name)))?;

        if att.lock.acquire()? == LockState::Recovered {
            log::warn!(
                "Recovered lock of pool '{}' from a holder that died",
                self.names.name
            );
        }
        let mut guard = PoolGuard { att };

        let shared = guard.att.shared_size.load();
        if shared != guard.att.region.size() {
            log::debug!(
                "Remapping pool '{}' from {} to {} bytes",
                self.names.name,
                guard.att.region.size(),
                shared
            );
            if let Err(e) = guard.att.region.remap(shared) {
                log::error!("Failed to remap pool '{}': {}", self.names.name, e);
                return Err(e);
            }
        }
        Ok(guard)
    }

    fn record<T>(&self, result: ShmResult<T>) -> ShmResult<T> {
        if let Err(e) = &result {
            *self.last_error.lock() = Some(e.kind());
        }
        result
    }

    /// Kind of the most recent failure on this handle
    pub fn last_error(&self) -> Option<ShmErrorKind> {
        *self.last_error.lock()
    }

    /// Allocate `usable` bytes, growing the pool once if it is full
    pub fn alloc(&self, usable: usize) -> ShmResult<ShmPtr> {
        self.record(self.allocate(usable, None, 0))
    }

    /// Allocate `usable` bytes, asking `gc` to evict before growing
    ///
    /// `gc` runs without the pool lock held and receives `id` unchanged. It
    /// should free whatever it can and return whether anything was freed; the
    /// allocation is then retried once.
    pub fn alloc_with_gc<F>(&self, usable: usize, mut gc: F, id: u64) -> ShmResult<ShmPtr>
    where
        F: FnMut(u64) -> bool,
    {
        self.record(self.allocate(usable, Some(&mut gc), id))
    }

    fn allocate(
        &self,
        usable: usize,
        mut gc: Option<&mut dyn FnMut(u64) -> bool>,
        id: u64,
    ) -> ShmResult<ShmPtr> {
        if usable == 0 {
            return Err(ShmError::invalid("allocation size must be non-zero"));
        }
        if usable.checked_add(CHUNK_HEADER_SIZE + ALIGNMENT).is_none() {
            return Err(ShmError::invalid(format!("allocation of {} bytes overflows", usable)));
        }
        let total = align_up(usable + CHUNK_HEADER_SIZE);

        let mut evicted = false;
        let mut grown = false;
        let mut guard = self.acquire()?;
        loop {
            let taken = {
                let mut arena = guard.arena()?;
                heap::take(&mut arena, total as u64, usable as u64)?
            };
            if let Some(chunk) = taken {
                return Ok(ShmPtr::from_chunk(chunk));
            }

            if !evicted {
                if let Some(gc) = gc.as_deref_mut() {
                    evicted = true;
                    drop(guard);
                    log::debug!(
                        "Pool '{}' cannot fit {} bytes, running eviction for {}",
                        self.names.name,
                        usable,
                        id
                    );
                    let freed = gc(id);
                    guard = self.acquire()?;
                    if freed {
                        continue;
                    }
                }
            }

            let header = guard.header()?;
            if grown {
                return Err(ShmError::OutOfMemory {
                    requested: usable,
                    max_size: header.max_size as usize,
                });
            }
            grown = true;
            let target = (header.size as usize).saturating_add(total).saturating_mul(2);
            self.extend_locked(&mut guard, target)?;
        }
    }

    /// Return an allocation to the pool
    ///
    /// Freeing a chunk that is already free is logged and ignored. An offset
    /// that never was an allocation fails with `InvalidArgument`.
    pub fn free(&self, ptr: ShmPtr) -> ShmResult<()> {
        self.record(self.release(ptr))
    }

    fn release(&self, ptr: ShmPtr) -> ShmResult<()> {
        let chunk = ptr.chunk()?;
        let mut guard = self.acquire()?;
        let mut arena = guard.arena()?;
        if !heap::release(&mut arena, chunk)? {
            log::warn!(
                "Ignoring free of unused chunk at offset {} in pool '{}'",
                chunk,
                self.names.name
            );
        }
        Ok(())
    }

    /// Resize an allocation, preserving its contents
    ///
    /// `None` behaves like [`SharedPool::alloc`]. An allocation whose chunk
    /// already has room is resized in place and keeps its offset.
    pub fn realloc(&self, ptr: Option<ShmPtr>, usable: usize) -> ShmResult<ShmPtr> {
        self.record(self.reallocate(ptr, usable))
    }

    fn reallocate(&self, ptr: Option<ShmPtr>, usable: usize) -> ShmResult<ShmPtr> {
        if usable == 0 {
            return Err(ShmError::invalid(
                "reallocation to zero bytes; free the allocation instead",
            ));
        }
        let Some(ptr) = ptr else {
            return self.allocate(usable, None, 0);
        };

        let chunk = ptr.chunk()?;
        let old_usable = {
            let mut guard = self.acquire()?;
            let mut arena = guard.arena()?;
            let header = heap::live(&arena, chunk)?;
            if usable as u64 <= header.capacity() {
                arena.chunk_mut(chunk)?.usable = usable as u64;
                return Ok(ptr);
            }
            header.usable as usize
        };

        let moved = self.allocate(usable, None, 0)?;
        {
            let mut guard = self.acquire()?;
            let mut arena = guard.arena()?;
            arena.copy_within(ptr.offset(), moved.offset(), old_usable)?;
        }
        self.release(ptr)?;
        Ok(moved)
    }

    /// Grow the pool to at least `new_size` total bytes
    pub fn extend(&self, new_size: usize) -> ShmResult<()> {
        self.record(self.try_extend(new_size))
    }

    fn try_extend(&self, new_size: usize) -> ShmResult<()> {
        if new_size == 0 {
            return Err(ShmError::invalid("pool size must be non-zero"));
        }
        let mut guard = self.acquire()?;
        self.extend_locked(&mut guard, new_size)
    }

    fn extend_locked(&self, guard: &mut PoolGuard<'_>, new_size: usize) -> ShmResult<()> {
        let header = guard.header()?;
        let (size, max_size) = (header.size as usize, header.max_size as usize);
        if size >= max_size {
            return Err(ShmError::OutOfMemory {
                requested: new_size,
                max_size,
            });
        }
        if !self.growable {
            return Err(ShmError::Unsupported(format!(
                "pool '{}' has a fixed size",
                self.names.name
            )));
        }
        if !ShmRegion::can_grow() {
            return Err(ShmError::Unsupported(format!(
                "growing shared memory is not supported on {}",
                platform_name()
            )));
        }

        let new_size = page_align(new_size).min(max_size);
        if new_size <= size {
            return Ok(());
        }

        guard.att.region.grow(new_size)?;
        {
            let mut arena = guard.arena()?;
            heap::absorb_growth(&mut arena, size as u64)?;
        }
        guard.att.shared_size.store(new_size);
        log::info!(
            "Grew shared pool '{}' from {} to {} bytes",
            self.names.name,
            size,
            new_size
        );
        Ok(())
    }

    /// Run `f` over the usable bytes of a live allocation
    pub fn with_bytes<R, F>(&self, ptr: ShmPtr, f: F) -> ShmResult<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let result = (|| -> ShmResult<R> {
            let mut guard = self.acquire()?;
            let mut arena = guard.arena()?;
            let usable = live_chunk(&arena, ptr)?;
            Ok(f(arena.data_mut(ptr.offset(), usable)?))
        })();
        self.record(result)
    }

    /// Copy `data` into an allocation starting `at` bytes in
    pub fn write(&self, ptr: ShmPtr, at: usize, data: &[u8]) -> ShmResult<()> {
        let result = (|| -> ShmResult<()> {
            let mut guard = self.acquire()?;
            let mut arena = guard.arena()?;
            let usable = live_chunk(&arena, ptr)?;
            match at.checked_add(data.len()) {
                Some(end) if end <= usable => {}
                _ => {
                    return Err(ShmError::invalid(format!(
                        "write of {} bytes at {} exceeds allocation of {} bytes",
                        data.len(),
                        at,
                        usable
                    )))
                }
            }
            arena
                .data_mut(ptr.offset() + at as u64, data.len())?
                .copy_from_slice(data);
            Ok(())
        })();
        self.record(result)
    }

    /// Copy out the usable bytes of an allocation
    pub fn read(&self, ptr: ShmPtr) -> ShmResult<Vec<u8>> {
        self.with_bytes(ptr, |bytes| bytes.to_vec())
    }

    /// Size the allocation was last requested with
    pub fn usable_size(&self, ptr: ShmPtr) -> ShmResult<usize> {
        let result = (|| -> ShmResult<usize> {
            let mut guard = self.acquire()?;
            let arena = guard.arena()?;
            live_chunk(&arena, ptr)
        })();
        self.record(result)
    }

    /// Address of `ptr` in this process's current mapping
    ///
    /// Only valid until the next operation on this handle, which may remap
    /// the segment after another process grew it.
    pub fn address_of(&self, ptr: ShmPtr) -> ShmResult<*mut u8> {
        let result = (|| -> ShmResult<*mut u8> {
            let mut guard = self.acquire()?;
            let arena = guard.arena()?;
            live_chunk(&arena, ptr)?;
            drop(arena);
            Ok(offset::to_addr(guard.att.region.as_ptr(), ptr.offset()) as *mut u8)
        })();
        self.record(result)
    }

    /// Offset of an address inside this process's current mapping
    pub fn ptr_from_address(&self, addr: *const u8) -> ShmResult<Option<ShmPtr>> {
        let result = (|| -> ShmResult<Option<ShmPtr>> {
            let guard = self.acquire()?;
            let region = &guard.att.region;
            Ok(offset::to_offset(region.as_ptr(), region.size(), addr)
                .filter(|off| *off >= (POOL_HEADER_SIZE + CHUNK_HEADER_SIZE) as Offset)
                .map(ShmPtr))
        })();
        self.record(result)
    }

    /// Record the well-known root object of the pool
    pub fn set_user_root(&self, root: Option<ShmPtr>) -> ShmResult<()> {
        let result = (|| -> ShmResult<()> {
            let mut guard = self.acquire()?;
            let mut arena = guard.arena()?;
            if let Some(ptr) = root {
                live_chunk(&arena, ptr)?;
            }
            arena.header_mut().user_offset = root.map_or(NIL, ShmPtr::offset);
            Ok(())
        })();
        self.record(result)
    }

    /// The root object recorded by any attached process
    pub fn user_root(&self) -> ShmResult<Option<ShmPtr>> {
        let result = (|| -> ShmResult<Option<ShmPtr>> {
            let root = self.acquire()?.header()?.user_offset;
            Ok((root != NIL).then_some(ShmPtr(root)))
        })();
        self.record(result)
    }

    pub fn stats(&self) -> ShmResult<PoolStats> {
        let result = (|| -> ShmResult<PoolStats> {
            let mut guard = self.acquire()?;
            let mut arena = guard.arena()?;
            heap::stats(&mut arena)
        })();
        self.record(result)
    }

    /// The chunk chain in address order
    pub fn chunks(&self) -> ShmResult<Vec<ChunkInfo>> {
        let result = (|| -> ShmResult<Vec<ChunkInfo>> {
            let mut guard = self.acquire()?;
            let mut arena = guard.arena()?;
            heap::chunks(&mut arena)
        })();
        self.record(result)
    }

    /// Check the chunk chain and free lists for consistency
    pub fn verify(&self) -> ShmResult<()> {
        let result = (|| -> ShmResult<()> {
            let mut guard = self.acquire()?;
            let mut arena = guard.arena()?;
            heap::verify(&mut arena)
        })();
        self.record(result)
    }

    /// Current total size of the segment
    pub fn size(&self) -> ShmResult<usize> {
        let result = (|| -> ShmResult<usize> { Ok(self.acquire()?.header()?.size as usize) })();
        self.record(result)
    }

    pub fn name(&self) -> &str {
        &self.names.name
    }

    pub fn segment_path(&self) -> &Path {
        &self.names.segment
    }

    /// Whether this handle formatted the segment
    pub fn is_creator(&self) -> bool {
        self.created
    }

    /// Detach this handle; the last one to detach removes the named objects
    pub fn shutdown(self) -> ShmResult<ShutdownOutcome> {
        self.detach(false)
    }

    /// Detach and remove the named objects even if other handles remain
    ///
    /// Processes still attached keep their mappings but can no longer be
    /// joined by new ones.
    pub fn destroy(self) -> ShmResult<ShutdownOutcome> {
        self.detach(true)
    }

    fn detach(&self, force: bool) -> ShmResult<ShutdownOutcome> {
        let (remaining, unlinked) = {
            let mut guard = self.acquire()?;
            let remaining = {
                let mut arena = guard.arena()?;
                let header = arena.header_mut();
                if force {
                    header.open = 1;
                }
                header.open = header.open.saturating_sub(1);
                header.open
            };
            // Removed before the lock is released where the platform allows,
            // so an attacher finds either a live pool or none
            let unlinked = (remaining == 0 && ShmRegion::can_unlink_mapped())
                .then(|| remove_objects(&self.names));
            (remaining, unlinked)
        };

        // Unmaps the segment and closes the lock
        drop(self.inner.lock().take());

        if remaining > 0 {
            log::debug!(
                "Detached from pool '{}', {} handle(s) remain",
                self.names.name,
                remaining
            );
            return Ok(ShutdownOutcome::Detached { remaining });
        }

        match unlinked {
            Some(result) => result?,
            None => remove_objects(&self.names)?,
        }
        Ok(ShutdownOutcome::Removed)
    }
}

impl Drop for SharedPool {
    fn drop(&mut self) {
        if self.inner.get_mut().is_some() {
            if let Err(e) = self.detach(false) {
                log::warn!("Failed to detach from pool '{}': {}", self.names.name, e);
            }
        }
    }
}

impl std::fmt::Debug for SharedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPool")
            .field("name", &self.names.name)
            .field("segment", &self.names.segment)
            .field("growable", &self.growable)
            .field("created", &self.created)
            .finish()
    }
}

fn remove_objects(names: &ShmNames) -> ShmResult<()> {
    let mut failed = Vec::new();
    for path in names.objects() {
        if let OrphanStatus::Failed(e) = remove_object(path) {
            failed.push(format!("{}: {}", path.display(), e));
        }
    }
    if !failed.is_empty() {
        return Err(ShmError::fault("unlink", io::Error::other(failed.join(", "))));
    }
    log::info!("Removed shared pool '{}'", names.name);
    Ok(())
}

/// Usable size of a live allocation, or `InvalidArgument`
fn live_chunk(arena: &Arena<'_>, ptr: ShmPtr) -> ShmResult<usize> {
    Ok(heap::live(arena, ptr.chunk()?)?.usable as usize)
}
