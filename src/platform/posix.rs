// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX layer: shared memory mappings (shm objects and file-backed), plus
// process-shared pthread mutexes and condition variables placed in shared
// memory. All higher-level structures (segments, registries, queues) are
// #[repr(C)] overlays on these mappings.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

fn posix_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

fn cstring(name: &str) -> io::Result<CString> {
    CString::new(name.as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Open mode for shared memory objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Create exclusively — fail if already exists.
    Create,
    /// Open existing — fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

/// A mapped shared memory region, backed either by a POSIX shm object or by
/// a regular file (for huge-page or device-mapped memory).
///
/// Dropping the mapping unmaps it; the backing object is never removed
/// implicitly — cleanup is an explicit, session-level decision.
pub struct ShmMapping {
    mem: *mut u8,
    size: usize,
    /// Set for file-backed mappings.
    file: Option<PathBuf>,
}

// The mapped region is shared between processes; local aliasing rules are
// the concern of the structures layered on top.
unsafe impl Send for ShmMapping {}
unsafe impl Sync for ShmMapping {}

impl ShmMapping {
    /// Acquire a named shm object of `size` bytes. Returns the mapping and
    /// whether this call created the object.
    pub fn acquire(name: &str, size: usize, mode: MapMode) -> io::Result<(Self, bool)> {
        Self::acquire_with_flags(name, size, mode, 0)
    }

    /// Like `acquire`, with extra flags OR-ed into the mmap call.
    pub fn acquire_with_flags(
        name: &str,
        size: usize,
        mode: MapMode,
        extra_mmap_flags: i32,
    ) -> io::Result<(Self, bool)> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }

        let pname = posix_name(name);
        let c_name = cstring(&pname)?;
        let perms: libc::mode_t = 0o666;

        // Try exclusive create first so ftruncate only runs on an object we
        // own. Truncating an already-sized object can zero it on some
        // platforms before returning EINVAL.
        let (fd, created) = match mode {
            MapMode::Create => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, true)
            }
            MapMode::Open => {
                let f =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, false)
            }
            MapMode::CreateOrOpen => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f != -1 {
                    (f, true)
                } else {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EEXIST) {
                        return Err(e);
                    }
                    let f2 = unsafe {
                        libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                    };
                    if f2 == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    (f2, false)
                }
            }
        };

        unsafe { libc::fchmod(fd, perms) };

        let map_size = if created {
            let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(err);
            }
            size
        } else {
            // Opening an existing object: honor its actual size.
            let actual = match Self::fd_size(fd) {
                Ok(s) => s,
                Err(e) => {
                    unsafe { libc::close(fd) };
                    return Err(e);
                }
            };
            if actual == 0 {
                unsafe { libc::close(fd) };
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("shm object {pname} has zero size"),
                ));
            }
            actual
        };

        let mem = Self::mmap(fd, map_size, extra_mmap_flags);
        unsafe { libc::close(fd) };
        let mem = mem?;

        Ok((
            Self {
                mem,
                size: map_size,
                file: None,
            },
            created,
        ))
    }

    /// Map an existing shm object at its full size.
    pub fn open_existing(name: &str) -> io::Result<Self> {
        Ok(Self::acquire(name, 0, MapMode::Open)?.0)
    }

    /// Acquire a file-backed mapping. When `create` is set, the file is
    /// created (truncated) at `size` bytes; otherwise it is opened and
    /// mapped at its full length.
    pub fn acquire_file(
        path: &Path,
        size: usize,
        create: bool,
        extra_mmap_flags: i32,
    ) -> io::Result<(Self, bool)> {
        let c_path = cstring(
            path.to_str()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "non-utf8 path"))?,
        )?;

        let fd = if create {
            let f = unsafe {
                libc::open(
                    c_path.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
                    0o666 as libc::c_uint,
                )
            };
            if f == -1 {
                return Err(io::Error::last_os_error());
            }
            if unsafe { libc::ftruncate(f, size as libc::off_t) } != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(f) };
                return Err(err);
            }
            f
        } else {
            let f = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
            if f == -1 {
                return Err(io::Error::last_os_error());
            }
            f
        };

        let map_size = if create {
            size
        } else {
            match Self::fd_size(fd) {
                Ok(s) => s,
                Err(e) => {
                    unsafe { libc::close(fd) };
                    return Err(e);
                }
            }
        };
        let mem = Self::mmap(fd, map_size, extra_mmap_flags);
        unsafe { libc::close(fd) };
        let mem = mem?;

        Ok((
            Self {
                mem,
                size: map_size,
                file: Some(path.to_path_buf()),
            },
            create,
        ))
    }

    fn fd_size(fd: i32) -> io::Result<usize> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(st.st_size as usize)
    }

    fn mmap(fd: i32, size: usize, extra_flags: i32) -> io::Result<*mut u8> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | extra_flags,
                fd,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(mem as *mut u8)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Path of the backing file, if this is a file mapping.
    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Lock the mapped pages in RAM.
    pub fn mlock_pages(&self) -> io::Result<()> {
        if unsafe { libc::mlock(self.mem as *const libc::c_void, self.size) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Zero the whole mapping.
    pub fn zero(&self) {
        unsafe { ptr::write_bytes(self.mem, 0, self.size) };
    }

    /// Whether a named shm object currently exists.
    pub fn exists(name: &str) -> bool {
        let pname = posix_name(name);
        let Ok(c_name) = cstring(&pname) else {
            return false;
        };
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o666 as libc::c_uint) };
        if fd == -1 {
            return false;
        }
        unsafe { libc::close(fd) };
        true
    }

    /// Remove a named shm object. Returns `true` if an object was removed.
    pub fn unlink(name: &str) -> bool {
        let pname = posix_name(name);
        match cstring(&pname) {
            Ok(c_name) => unsafe { libc::shm_unlink(c_name.as_ptr()) == 0 },
            Err(_) => false,
        }
    }

    /// Remove a file mapping. Returns `true` if the file was removed.
    pub fn remove_file(path: &Path) -> bool {
        std::fs::remove_file(path).is_ok()
    }
}

impl Drop for ShmMapping {
    fn drop(&mut self) {
        if !self.mem.is_null() {
            unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
        }
    }
}

// ---------------------------------------------------------------------------
// Robust mutex symbols — not exposed by the `libc` crate on all platforms.
// On macOS robust mutexes are not used.
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

// ---------------------------------------------------------------------------
// Process-shared pthread primitives at caller-supplied shared addresses.
// ---------------------------------------------------------------------------

/// Initialize a process-shared (and, where available, robust) mutex at
/// `mtx`, which must point into shared memory.
///
/// # Safety
/// `mtx` must be valid, writable, and not concurrently accessed during
/// initialization.
pub unsafe fn init_shared_mutex(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    ptr::write_bytes(mtx, 0, 1);

    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    let mut eno = libc::pthread_mutexattr_init(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }

    eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno != 0 {
        libc::pthread_mutexattr_destroy(&mut attr);
        return Err(io::Error::from_raw_os_error(eno));
    }

    #[cfg(not(target_os = "macos"))]
    {
        eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
        if eno != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::from_raw_os_error(eno));
        }
    }

    eno = libc::pthread_mutex_init(mtx, &attr);
    libc::pthread_mutexattr_destroy(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Lock a process-shared mutex, recovering from a dead previous owner.
///
/// # Safety
/// `mtx` must point to a mutex initialized with `init_shared_mutex` (in
/// this or any cooperating process).
pub unsafe fn shared_mutex_lock(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let eno = libc::pthread_mutex_lock(mtx);
    match eno {
        0 => Ok(()),
        #[cfg(not(target_os = "macos"))]
        EOWNERDEAD => {
            let eno2 = pthread_mutex_consistent(mtx);
            if eno2 != 0 {
                return Err(io::Error::from_raw_os_error(eno2));
            }
            Ok(())
        }
        _ => Err(io::Error::from_raw_os_error(eno)),
    }
}

/// Try-lock variant of `shared_mutex_lock`. Returns `Ok(false)` when busy.
///
/// # Safety
/// Same contract as `shared_mutex_lock`.
pub unsafe fn shared_mutex_try_lock(mtx: *mut libc::pthread_mutex_t) -> io::Result<bool> {
    let eno = libc::pthread_mutex_trylock(mtx);
    match eno {
        0 => Ok(true),
        libc::EBUSY => Ok(false),
        #[cfg(not(target_os = "macos"))]
        EOWNERDEAD => {
            let eno2 = pthread_mutex_consistent(mtx);
            if eno2 != 0 {
                return Err(io::Error::from_raw_os_error(eno2));
            }
            Ok(true)
        }
        _ => Err(io::Error::from_raw_os_error(eno)),
    }
}

/// # Safety
/// Same contract as `shared_mutex_lock`; the caller must hold the lock.
pub unsafe fn shared_mutex_unlock(mtx: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let eno = libc::pthread_mutex_unlock(mtx);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Initialize a process-shared condition variable at `cond`.
///
/// # Safety
/// `cond` must be valid, writable shared memory, not concurrently accessed
/// during initialization.
pub unsafe fn init_shared_cond(cond: *mut libc::pthread_cond_t) -> io::Result<()> {
    ptr::write_bytes(cond, 0, 1);

    let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
    let mut eno = libc::pthread_condattr_init(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }

    eno = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if eno != 0 {
        libc::pthread_condattr_destroy(&mut attr);
        return Err(io::Error::from_raw_os_error(eno));
    }

    eno = libc::pthread_cond_init(cond, &attr);
    libc::pthread_condattr_destroy(&mut attr);
    if eno != 0 {
        return Err(io::Error::from_raw_os_error(eno));
    }
    Ok(())
}

/// Timed wait on a process-shared condition variable. The caller must hold
/// `mtx`. Returns `Ok(false)` on timeout.
///
/// # Safety
/// `cond` and `mtx` must be initialized shared primitives; `mtx` locked by
/// the calling thread.
pub unsafe fn shared_cond_timedwait(
    cond: *mut libc::pthread_cond_t,
    mtx: *mut libc::pthread_mutex_t,
    timeout_ms: u64,
) -> io::Result<bool> {
    let mut ts: libc::timespec = std::mem::zeroed();
    libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    let ns_total = ts.tv_nsec as u64 + (timeout_ms % 1000) * 1_000_000;
    ts.tv_sec += (timeout_ms / 1000) as libc::time_t + (ns_total / 1_000_000_000) as libc::time_t;
    ts.tv_nsec = (ns_total % 1_000_000_000) as libc::c_long;

    loop {
        let eno = libc::pthread_cond_timedwait(cond, mtx, &ts);
        match eno {
            0 => return Ok(true),
            libc::ETIMEDOUT => return Ok(false),
            libc::EINTR => continue,
            _ => return Err(io::Error::from_raw_os_error(eno)),
        }
    }
}

/// # Safety
/// `cond` must be an initialized shared condition variable.
pub unsafe fn shared_cond_signal(cond: *mut libc::pthread_cond_t) {
    libc::pthread_cond_signal(cond);
}

/// # Safety
/// `cond` must be an initialized shared condition variable.
pub unsafe fn shared_cond_broadcast(cond: *mut libc::pthread_cond_t) {
    libc::pthread_cond_broadcast(cond);
}

// ---------------------------------------------------------------------------
// NamedMutex — a pthread mutex living in its own small shm object.
//
// All threads within the same process that open the same name MUST share a
// single mmap: some pthread implementations store internal pointers
// relative to the virtual address used for pthread_mutex_init, so a second
// mmap of the same page at a different address breaks locking.
// ---------------------------------------------------------------------------

const NAMED_MUTEX_MAGIC: u32 = 0x464d_515f; // "FMQ_"
const INIT_SPIN_TIMEOUT: Duration = Duration::from_secs(5);

#[repr(C)]
struct NamedMutexLayout {
    magic: AtomicU32,
    _pad: u32,
    mutex: libc::pthread_mutex_t,
}

struct CachedMapping {
    mapping: ShmMapping,
    local_ref: AtomicUsize,
}

fn mutex_cache() -> &'static Mutex<HashMap<String, Arc<CachedMapping>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<CachedMapping>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A named, inter-process mutex: a `pthread_mutex_t` with
/// `PTHREAD_PROCESS_SHARED` and (where available) `PTHREAD_MUTEX_ROBUST`
/// attributes, stored in a shm object named after the mutex.
pub struct NamedMutex {
    cached: Arc<CachedMapping>,
    name: String,
}

impl NamedMutex {
    /// Open (or create) a named inter-process mutex.
    pub fn open(name: &str) -> io::Result<Self> {
        let mut cache = mutex_cache().lock().unwrap();
        if let Some(entry) = cache.get(name) {
            entry.local_ref.fetch_add(1, Ordering::Relaxed);
            return Ok(Self {
                cached: Arc::clone(entry),
                name: name.to_string(),
            });
        }

        let size = std::mem::size_of::<NamedMutexLayout>();
        let (mapping, created) = ShmMapping::acquire(name, size, MapMode::CreateOrOpen)?;
        let layout = mapping.as_ptr() as *mut NamedMutexLayout;

        if created {
            unsafe {
                init_shared_mutex(ptr::addr_of_mut!((*layout).mutex))?;
                (*layout).magic.store(NAMED_MUTEX_MAGIC, Ordering::Release);
            }
        } else {
            // Wait for the creator to finish initialization.
            let deadline = Instant::now() + INIT_SPIN_TIMEOUT;
            while unsafe { &(*layout).magic }.load(Ordering::Acquire) != NAMED_MUTEX_MAGIC {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("named mutex {name} never became initialized"),
                    ));
                }
                std::thread::yield_now();
            }
        }

        let entry = Arc::new(CachedMapping {
            mapping,
            local_ref: AtomicUsize::new(1),
        });
        cache.insert(name.to_string(), Arc::clone(&entry));
        Ok(Self {
            cached: entry,
            name: name.to_string(),
        })
    }

    /// Create the mutex object exclusively; fails if it already exists.
    /// Used as a presence advertisement by the monitor.
    pub fn create_exclusive(name: &str) -> io::Result<Self> {
        let size = std::mem::size_of::<NamedMutexLayout>();
        let (mapping, _) = ShmMapping::acquire(name, size, MapMode::Create)?;
        let layout = mapping.as_ptr() as *mut NamedMutexLayout;
        unsafe {
            init_shared_mutex(ptr::addr_of_mut!((*layout).mutex))?;
            (*layout).magic.store(NAMED_MUTEX_MAGIC, Ordering::Release);
        }
        let entry = Arc::new(CachedMapping {
            mapping,
            local_ref: AtomicUsize::new(1),
        });
        mutex_cache()
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&entry));
        Ok(Self {
            cached: entry,
            name: name.to_string(),
        })
    }

    /// Whether the backing object of a named mutex currently exists.
    pub fn exists(name: &str) -> bool {
        ShmMapping::exists(name)
    }

    fn mtx_ptr(&self) -> *mut libc::pthread_mutex_t {
        let layout = self.cached.mapping.as_ptr() as *mut NamedMutexLayout;
        unsafe { ptr::addr_of_mut!((*layout).mutex) }
    }

    /// Lock the mutex and return an unlocking guard. Handles a dead
    /// previous owner via `pthread_mutex_consistent`.
    pub fn lock(&self) -> io::Result<NamedMutexGuard<'_>> {
        unsafe { shared_mutex_lock(self.mtx_ptr())? };
        Ok(NamedMutexGuard { mutex: self })
    }

    /// Try to lock the mutex without blocking.
    pub fn try_lock(&self) -> io::Result<Option<NamedMutexGuard<'_>>> {
        if unsafe { shared_mutex_try_lock(self.mtx_ptr())? } {
            Ok(Some(NamedMutexGuard { mutex: self }))
        } else {
            Ok(None)
        }
    }

    /// Remove the shared object backing a named mutex. Also purges any
    /// cached mapping so a subsequent `open` creates fresh state.
    pub fn remove(name: &str) -> bool {
        mutex_cache().lock().unwrap().remove(name);
        ShmMapping::unlink(name)
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        // No pthread_mutex_destroy here: the virtual address may be
        // recycled to a different mapping after munmap, and destroy would
        // corrupt whatever lives there now. Unlinking the object reclaims
        // the memory.
        let mut cache = mutex_cache().lock().unwrap();
        if let Some(entry) = cache.get(&self.name) {
            let prev = entry.local_ref.fetch_sub(1, Ordering::AcqRel);
            if prev <= 1 {
                cache.remove(&self.name);
            }
        }
    }
}

/// Guard returned by `NamedMutex::lock`; unlocks on drop.
pub struct NamedMutexGuard<'a> {
    mutex: &'a NamedMutex,
}

impl Drop for NamedMutexGuard<'_> {
    fn drop(&mut self) {
        let _ = unsafe { shared_mutex_unlock(self.mutex.mtx_ptr()) };
    }
}
