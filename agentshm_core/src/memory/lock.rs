//! Cross-process pool lock
//!
//! On Unix the lock is a process-shared pthread mutex living in the small
//! mapped `<name>_l` object. Where the platform supports robust mutexes, a
//! holder that dies mid-update leaves the mutex in an owner-died state; the
//! next acquirer marks it consistent and proceeds. On Windows a named kernel
//! mutex is used and an abandoned mutex is treated the same way.

use super::platform::ShmNames;
use crate::error::ShmResult;

/// Outcome of a successful acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Acquired,
    /// The previous holder died while holding the lock; shared state may be
    /// mid-update
    Recovered,
}

/// Mutual exclusion shared by every process attached to a pool
pub trait SegmentLock: Send + Sync {
    /// Block until the lock is held by the caller
    fn acquire(&self) -> ShmResult<LockState>;

    fn release(&self);

    /// Whether this is still the lock object reachable by the pool's name;
    /// `false` once the last handle of the pool has removed it
    fn is_current(&self) -> bool {
        true
    }
}

/// Open (creating if necessary) the lock object of a pool
pub fn open_lock(names: &ShmNames) -> ShmResult<Box<dyn SegmentLock>> {
    #[cfg(unix)]
    {
        Ok(Box::new(unix::RobustMutex::open(&names.lock)?))
    }
    #[cfg(windows)]
    {
        Ok(Box::new(windows::NamedMutex::open(&names.lock)?))
    }
}

#[cfg(unix)]
pub use unix::RobustMutex;

#[cfg(windows)]
pub use windows::NamedMutex;

#[cfg(unix)]
mod unix {
    use super::{LockState, SegmentLock};
    use crate::error::{ShmError, ShmResult};
    use memmap2::{MmapMut, MmapOptions};
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::mem;
    use std::os::unix::fs::MetadataExt;
    use std::path::{Path, PathBuf};
    use std::ptr::{self, NonNull};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    const UNINIT: u32 = 0;
    const READY: u32 = 1;
    /// Values from here up are initialization claims
    const FIRST_CLAIM: u32 = 2;

    /// How long a claim may stay unfinished before it is presumed dead
    const INIT_TIMEOUT: Duration = if cfg!(test) {
        Duration::from_millis(200)
    } else {
        Duration::from_secs(5)
    };

    #[repr(C)]
    struct LockBlock {
        state: AtomicU32,
        _pad: u32,
        mutex: libc::pthread_mutex_t,
    }

    /// Process-shared, robust pthread mutex in a mapped file
    pub struct RobustMutex {
        block: NonNull<LockBlock>,
        _mmap: MmapMut,
        file: File,
        path: PathBuf,
    }

    // The mutex is designed to be shared between processes, and therefore threads
    unsafe impl Send for RobustMutex {}
    unsafe impl Sync for RobustMutex {}

    fn check(rc: libc::c_int, op: &'static str) -> ShmResult<()> {
        if rc == 0 {
            Ok(())
        } else {
            Err(ShmError::fault(op, io::Error::from_raw_os_error(rc)))
        }
    }

    impl RobustMutex {
        pub fn open(path: &Path) -> ShmResult<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(|e| {
                    if e.kind() == io::ErrorKind::NotFound {
                        ShmError::NotFound(format!("{}: {}", path.display(), e))
                    } else {
                        ShmError::fault("open", e)
                    }
                })?;

            let len = mem::size_of::<LockBlock>();
            let current = file
                .metadata()
                .map_err(|e| ShmError::fault("fstat", e))?
                .len();
            if current < len as u64 {
                file.set_len(len as u64)
                    .map_err(|e| ShmError::fault("ftruncate", e))?;
            }

            let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file) }
                .map_err(|e| ShmError::fault("mmap", e))?;
            let block = NonNull::new(mmap.as_mut_ptr() as *mut LockBlock)
                .ok_or_else(|| ShmError::corrupted("lock mapping is null"))?;

            let lock = Self {
                block,
                _mmap: mmap,
                file,
                path: path.to_path_buf(),
            };
            lock.initialize()?;
            Ok(lock)
        }

        fn state(&self) -> &AtomicU32 {
            unsafe { &(*self.block.as_ptr()).state }
        }

        fn mutex(&self) -> *mut libc::pthread_mutex_t {
            unsafe { ptr::addr_of_mut!((*self.block.as_ptr()).mutex) }
        }

        /// First opener initializes the mutex; everyone else waits for it
        ///
        /// An opener claims initialization by moving the state to a claim
        /// value. A claim still unfinished after `INIT_TIMEOUT` belongs to a
        /// process that died mid-initialization and is replaced by a newer one.
        fn initialize(&self) -> ShmResult<()> {
            let state = self.state();
            let mut watched = UNINIT;
            let mut deadline = Instant::now() + INIT_TIMEOUT;
            loop {
                let seen = state.load(Ordering::Acquire);
                match seen {
                    READY => return Ok(()),
                    UNINIT => {}
                    _ if seen != watched => {
                        watched = seen;
                        deadline = Instant::now() + INIT_TIMEOUT;
                        continue;
                    }
                    _ if Instant::now() <= deadline => {
                        thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    _ => log::warn!("Taking over a stalled mutex initialization"),
                }

                let claim = seen.checked_add(1).unwrap_or(FIRST_CLAIM).max(FIRST_CLAIM);
                if state
                    .compare_exchange(seen, claim, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                let result = unsafe { self.init_mutex() };
                if result.is_err() {
                    state.store(UNINIT, Ordering::Release);
                    return result;
                }
                if state
                    .compare_exchange(claim, READY, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    log::debug!("Initialized process-shared mutex");
                    return Ok(());
                }
            }
        }

        unsafe fn init_mutex(&self) -> ShmResult<()> {
            let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
            check(
                libc::pthread_mutexattr_init(&mut attr),
                "pthread_mutexattr_init",
            )?;

            let mut rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if rc == 0 {
                rc = set_robust(&mut attr);
            }
            if rc == 0 {
                rc = libc::pthread_mutex_init(self.mutex(), &attr);
            }
            libc::pthread_mutexattr_destroy(&mut attr);
            check(rc, "pthread_mutex_init")
        }
    }

    #[cfg(target_os = "linux")]
    unsafe fn set_robust(attr: *mut libc::pthread_mutexattr_t) -> libc::c_int {
        libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST)
    }

    /// Robust mutexes are only relied upon on Linux
    #[cfg(not(target_os = "linux"))]
    unsafe fn set_robust(_attr: *mut libc::pthread_mutexattr_t) -> libc::c_int {
        0
    }

    impl SegmentLock for RobustMutex {
        fn acquire(&self) -> ShmResult<LockState> {
            let mutex = self.mutex();
            match unsafe { libc::pthread_mutex_lock(mutex) } {
                0 => Ok(LockState::Acquired),
                #[cfg(target_os = "linux")]
                libc::EOWNERDEAD => {
                    let rc = unsafe { libc::pthread_mutex_consistent(mutex) };
                    if rc != 0 {
                        unsafe { libc::pthread_mutex_unlock(mutex) };
                        return Err(ShmError::fault(
                            "pthread_mutex_consistent",
                            io::Error::from_raw_os_error(rc),
                        ));
                    }
                    Ok(LockState::Recovered)
                }
                rc => Err(ShmError::fault(
                    "pthread_mutex_lock",
                    io::Error::from_raw_os_error(rc),
                )),
            }
        }

        fn release(&self) {
            let rc = unsafe { libc::pthread_mutex_unlock(self.mutex()) };
            if rc != 0 {
                log::error!(
                    "pthread_mutex_unlock failed: {}",
                    io::Error::from_raw_os_error(rc)
                );
            }
        }

        fn is_current(&self) -> bool {
            match (self.file.metadata(), std::fs::metadata(&self.path)) {
                (Ok(open), Ok(named)) => open.dev() == named.dev() && open.ino() == named.ino(),
                _ => false,
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{LockState, SegmentLock};
    use crate::error::{ShmError, ShmResult};
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, WAIT_ABANDONED, WAIT_OBJECT_0};
    use windows_sys::Win32::System::Threading::{
        CreateMutexW, ReleaseMutex, WaitForSingleObject, INFINITE,
    };

    /// Named kernel mutex keyed by the lock object's path
    pub struct NamedMutex {
        handle: HANDLE,
    }

    unsafe impl Send for NamedMutex {}
    unsafe impl Sync for NamedMutex {}

    impl NamedMutex {
        pub fn open(path: &Path) -> ShmResult<Self> {
            // Kernel object names may not contain backslashes
            let key: String = path
                .to_string_lossy()
                .chars()
                .map(|c| match c {
                    '\\' | '/' | ':' => '_',
                    c => c,
                })
                .collect();
            let name: Vec<u16> = OsStr::new(&format!("Local\\{}", key))
                .encode_wide()
                .chain(std::iter::once(0))
                .collect();

            let handle = unsafe { CreateMutexW(std::ptr::null(), 0, name.as_ptr()) };
            if handle == 0 {
                return Err(ShmError::last_os_error("CreateMutexW"));
            }
            Ok(Self { handle })
        }
    }

    impl SegmentLock for NamedMutex {
        fn acquire(&self) -> ShmResult<LockState> {
            match unsafe { WaitForSingleObject(self.handle, INFINITE) } {
                WAIT_OBJECT_0 => Ok(LockState::Acquired),
                WAIT_ABANDONED => Ok(LockState::Recovered),
                _ => Err(ShmError::last_os_error("WaitForSingleObject")),
            }
        }

        fn release(&self) {
            if unsafe { ReleaseMutex(self.handle) } == 0 {
                log::error!("ReleaseMutex failed: {}", std::io::Error::last_os_error());
            }
        }
    }

    impl Drop for NamedMutex {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.handle) };
        }
    }
}
