// AgentShm shared memory region - file backed, growable, remappable
use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Whether [`ShmRegion::create_or_open`] made the backing store or found it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Created,
    Opened,
}

/// Named segment mapped into this process
///
/// The file length is the segment size. Other processes may grow the file;
/// each process then remaps its own view with [`ShmRegion::remap`].
#[derive(Debug)]
pub struct ShmRegion {
    mmap: MmapMut,
    size: usize,
    path: PathBuf,
    file: File,
}

impl ShmRegion {
    /// Create the backing store exclusively, or open it if it already exists
    ///
    /// A new store is sized to `size`; an existing one keeps its own length.
    pub fn create_or_open(path: &Path, size: usize) -> ShmResult<(Self, Disposition)> {
        let created = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path);

        let (file, size, disposition) = match created {
            Ok(file) => {
                if let Err(e) = file.set_len(size as u64) {
                    let _ = std::fs::remove_file(path);
                    return Err(ShmError::fault("ftruncate", e));
                }
                (file, size, Disposition::Created)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|e| open_error(path, e))?;
                let len = file
                    .metadata()
                    .map_err(|e| ShmError::fault("fstat", e))?
                    .len() as usize;
                (file, len, Disposition::Opened)
            }
            Err(e) => return Err(open_error(path, e)),
        };

        let mmap = match map(&file, size) {
            Ok(mmap) => mmap,
            Err(e) => {
                if disposition == Disposition::Created {
                    let _ = std::fs::remove_file(path);
                }
                return Err(e);
            }
        };

        Ok((
            Self {
                mmap,
                size,
                path: path.to_path_buf(),
                file,
            },
            disposition,
        ))
    }

    /// Replace this process's view with one of `size` bytes
    pub fn remap(&mut self, size: usize) -> ShmResult<()> {
        self.mmap = map(&self.file, size)?;
        self.size = size;
        Ok(())
    }

    /// Extend the backing store to `size` bytes and remap
    pub fn grow(&mut self, size: usize) -> ShmResult<()> {
        if !Self::can_grow() {
            return Err(ShmError::Unsupported(format!(
                "growing shared memory is not supported on {}",
                super::platform::platform_name()
            )));
        }
        self.file
            .set_len(size as u64)
            .map_err(|e| ShmError::fault("ftruncate", e))?;
        self.remap(size)
    }

    /// Remove a named object; `Ok(false)` if it did not exist
    ///
    /// Processes that still map the object keep their view.
    pub fn unlink(path: &Path) -> io::Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Mapped files can only be extended in place on Unix
    pub fn can_grow() -> bool {
        cfg!(unix)
    }

    /// Whether an object may be unlinked while still mapped
    pub fn can_unlink_mapped() -> bool {
        cfg!(unix)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn map(file: &File, size: usize) -> ShmResult<MmapMut> {
    if size == 0 {
        return Err(ShmError::corrupted("shared memory segment is empty"));
    }
    unsafe { MmapOptions::new().len(size).map_mut(file) }.map_err(|e| ShmError::fault("mmap", e))
}

fn open_error(path: &Path, e: io::Error) -> ShmError {
    if e.kind() == io::ErrorKind::NotFound {
        ShmError::NotFound(format!("{}: {}", path.display(), e))
    } else {
        ShmError::fault("open", e)
    }
}

/// The shared "true" size of a segment
///
/// Lives in its own small mapping so a process can compare it with its local
/// view before touching the segment itself.
#[derive(Debug)]
pub struct SharedSize {
    mmap: MmapMut,
    _file: File,
}

impl SharedSize {
    pub fn open(path: &Path) -> ShmResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| open_error(path, e))?;

        let len = mem::size_of::<AtomicU64>();
        let current = file
            .metadata()
            .map_err(|e| ShmError::fault("fstat", e))?
            .len();
        if current < len as u64 {
            file.set_len(len as u64)
                .map_err(|e| ShmError::fault("ftruncate", e))?;
        }

        let mmap = map(&file, len)?;
        Ok(Self { mmap, _file: file })
    }

    fn cell(&self) -> &AtomicU64 {
        // The mapping is page aligned and at least 8 bytes long
        unsafe { &*(self.mmap.as_ptr() as *const AtomicU64) }
    }

    pub fn load(&self) -> usize {
        self.cell().load(Ordering::Acquire) as usize
    }

    pub fn store(&self, size: usize) {
        self.cell().store(size as u64, Ordering::Release);
    }
}
