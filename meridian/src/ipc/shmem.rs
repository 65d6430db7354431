//! POSIX shared memory mappings with typestate-based cleanup.
//!
//! [`Shm<T, Mode>`] maps a single `T`, and [`Shm<[T], Mode>`](Shm) maps a
//! fixed-length array of records whose length is recovered from the object
//! size on open. The counters region, the driver command ring and the
//! broadcast buffer are all built on these two shapes.
//!
//! # Overview
//!
//! - [`Shm<T, Mode>`] - smart pointer to a mapping, unmapped on drop
//! - [`SharedMemorySafe`] - marker for types that may live in a mapping
//! - [`Creator`] - creates the object and unlinks its name on drop
//! - [`Opener`] - maps an existing object, leaves the name alone on drop
//!
//! ```no_run
//! use meridian::SharedMemorySafe;
//! use meridian::ipc::shmem::*;
//! use std::sync::atomic::{AtomicI64, Ordering};
//!
//! #[derive(SharedMemorySafe, Default)]
//! #[repr(C)]
//! struct Heartbeat {
//!     epoch_ms: AtomicI64,
//! }
//!
//! let path = ShmPath::new("/meridian-doc-heartbeat")?;
//! let beat = Shm::<Heartbeat, Creator>::create(&path)?;
//! beat.epoch_ms.store(42, Ordering::Release);
//!
//! let seen = Shm::<Heartbeat, Opener>::open(&path)?;
//! assert_eq!(seen.epoch_ms.load(Ordering::Acquire), 42);
//! # Ok::<(), ShmError>(())
//! ```
//!
//! # Crash handling
//!
//! A crashed creator leaves its names behind. Daemons either refuse to start
//! (`EEXIST` from [`Shm::create`]) or call [`unlink`] on their well-known
//! names first.

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::ffi::c_void;
use std::os::fd::OwnedFd;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;
use thiserror::Error;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors produced while creating or opening a mapping.
#[derive(Debug, Error)]
pub enum ShmError {
    /// The name is not a valid portable POSIX shared memory name.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// `shm_open`, `ftruncate`, `fstat` or `mmap` failed.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        #[source]
        source: io::Errno,
    },
    /// The existing object does not have the size the caller expects.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: u64,
    },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, source: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source,
        }
    }

    /// Returns the errno if this error came from a POSIX call.
    #[must_use]
    pub fn errno(&self) -> Option<io::Errno> {
        match self {
            Self::Posix { source, .. } => Some(*source),
            _ => None,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// Invariant: starts with `/`, contains no other `/`, at most 255 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates and wraps a shared memory name.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::InvalidPath`] if the name is not portable.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate_shm_path(&path)?;
        Ok(Self(path))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ShmPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate_shm_path(path: &str) -> Result<()> {
    let invalid = |reason| ShmError::InvalidPath {
        path: path.to_string(),
        reason,
    };

    if !path.starts_with('/') {
        return Err(invalid("path must start with '/'"));
    }
    if path.len() == 1 {
        return Err(invalid("path must name an object after '/'"));
    }
    if path[1..].contains('/') {
        return Err(invalid("path must not contain additional '/' characters"));
    }
    if path.len() > POSIX_NAME_MAX {
        return Err(invalid("path length must be <= 255 bytes"));
    }
    Ok(())
}

/// Removes a shared memory name, returning whether it existed.
///
/// Used on driver start to clear objects left behind by a crashed run.
pub fn unlink(path: &ShmPath) -> bool {
    shm::unlink(path.as_str()).is_ok()
}

/// Cleanup behavior of a mapping, selected at compile time.
///
/// ```text
/// Creator          Opener
///    ↓                ↓
/// munmap()        munmap()
/// unlink()        (no unlink)
/// ```
pub trait ShmMode {
    /// Whether dropping the mapping removes the name.
    const SHOULD_UNLINK: bool;
}

/// Typestate for the process that creates and owns an object.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate for processes that map an object created elsewhere.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types that can be placed in shared memory and accessed by several
/// processes at once.
///
/// Prefer `#[derive(SharedMemorySafe)]`, which checks the layout attribute
/// and rejects pointer-carrying field types.
///
/// # Safety
///
/// Implementers guarantee that the type:
///
/// | Property | Requirement |
/// |----------|-------------|
/// | Layout | `#[repr(C)]`, `#[repr(transparent)]` or a primitive enum repr |
/// | Pointers | holds no references, raw pointers or heap handles |
/// | Fields | every field is itself `SharedMemorySafe` |
/// | Drop | stays valid if `Drop` never runs (processes get killed) |
/// | Concurrency | shared mutation goes through atomics |
///
/// `std::sync::Mutex` is process-local and never belongs in a mapping.
///
/// ```compile_fail
/// # use meridian::ipc::shmem::SharedMemorySafe;
/// use std::rc::Rc;
/// struct NotSync { data: Rc<u32> }
/// unsafe impl SharedMemorySafe for NotSync {}
/// ```
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

// A record array is as shareable as its records.
unsafe impl<T: SharedMemorySafe> SharedMemorySafe for [T] {}

/// Smart pointer to a POSIX shared memory mapping.
///
/// `T` is either a sized record or a slice `[R]` of records. Access is
/// through [`Deref`]; all shared mutation happens through atomics inside `T`.
///
/// Invariants:
/// - `ptr` points to `size` bytes obtained from `mmap` and mapped until drop
/// - `ptr` is page aligned, which satisfies any record alignment
pub struct Shm<T: SharedMemorySafe + ?Sized, Mode: ShmMode> {
    ptr: NonNull<T>,
    size: usize,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: the mapping is process-wide memory, not thread-local, and
// T: SharedMemorySafe requires Send + Sync.
unsafe impl<T: SharedMemorySafe + ?Sized, Mode: ShmMode> Send for Shm<T, Mode> {}

// SAFETY: shared references only expose &T, and T: Sync.
unsafe impl<T: SharedMemorySafe + ?Sized, Mode: ShmMode> Sync for Shm<T, Mode> {}

/// Creates, sizes and maps a brand new object.
///
/// On any failure after `shm_open` the name is unlinked again.
fn create_mapping(path: &ShmPath, size: usize) -> Result<NonNull<c_void>> {
    let fd = shm::open(
        path.as_str(),
        shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
        Mode::RUSR | Mode::WUSR,
    )
    .map_err(|err| ShmError::posix("shm_open", path, err))?;

    // ftruncate zero-fills the object.
    if let Err(err) = ftruncate(&fd, size as u64) {
        drop(fd);
        let _ = shm::unlink(path.as_str());
        return Err(ShmError::posix("ftruncate", path, err));
    }

    map_fd(&fd, path, size).inspect_err(|_| {
        let _ = shm::unlink(path.as_str());
    })
}

/// Opens an existing object and returns its descriptor and byte size.
fn open_existing(path: &ShmPath) -> Result<(OwnedFd, u64)> {
    let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
        .map_err(|err| ShmError::posix("shm_open", path, err))?;
    let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", path, err))?;
    let size = u64::try_from(stat.st_size).unwrap_or(0);
    Ok((fd, size))
}

fn map_fd(fd: &OwnedFd, path: &ShmPath, size: usize) -> Result<NonNull<c_void>> {
    // SAFETY: a fresh shared mapping of an object that is at least `size`
    // bytes long. It aliases no Rust object in this process, and the kernel
    // returns page-aligned addresses.
    let ptr = unsafe {
        mmap(
            null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", path, err))?;

    NonNull::new(ptr).ok_or_else(|| ShmError::posix("mmap", path, io::Errno::NOMEM))
}

impl<T: SharedMemorySafe + Default> Shm<T, Creator> {
    /// Creates a new object holding `T::default()`.
    ///
    /// # Errors
    ///
    /// Fails if the name already exists (`EEXIST`), permissions are missing
    /// (`EACCES`), or the object cannot be sized or mapped.
    ///
    /// # Panics
    ///
    /// Propagates a panic from `T::default()` after unmapping and unlinking.
    pub fn create(path: &ShmPath) -> Result<Self> {
        let raw = create_mapping(path, size_of::<T>())?;
        let shm = Self {
            ptr: raw.cast::<T>(),
            size: size_of::<T>(),
            path: path.clone(),
            _mode: PhantomData,
        };

        // SAFETY: the mapping is exclusively ours until `create` returns.
        let init = catch_unwind(AssertUnwindSafe(|| unsafe {
            shm.ptr.as_ptr().write(T::default());
        }));
        match init {
            Ok(()) => Ok(shm),
            Err(payload) => {
                drop(shm);
                resume_unwind(payload);
            }
        }
    }
}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Creates a new object and leaves it as the kernel hands it out, all zeroes.
    ///
    /// Used for large ring structures that must not be built on the stack.
    ///
    /// # Safety
    ///
    /// The all-zero bit pattern must be a valid, fully initialized `T`.
    ///
    /// # Errors
    ///
    /// Same as [`Shm::create`].
    pub unsafe fn create_zeroed(path: &ShmPath) -> Result<Self> {
        let raw = create_mapping(path, size_of::<T>())?;
        Ok(Self {
            ptr: raw.cast::<T>(),
            size: size_of::<T>(),
            path: path.clone(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe + Default> Shm<[T], Creator> {
    /// Creates a new object holding `len` default records.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::SizeMismatch`] for `len == 0`, otherwise the same
    /// failures as [`Shm::create`].
    pub fn create_slice(path: &ShmPath, len: usize) -> Result<Self> {
        let size = len
            .checked_mul(size_of::<T>())
            .filter(|size| *size > 0)
            .ok_or_else(|| ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: 0,
            })?;

        let raw = create_mapping(path, size)?;
        let first = raw.cast::<T>();
        let shm = Self {
            ptr: NonNull::slice_from_raw_parts(first, len),
            size,
            path: path.clone(),
            _mode: PhantomData,
        };

        // SAFETY: `len` records fit in the mapping, which nobody else has yet.
        let init = catch_unwind(AssertUnwindSafe(|| unsafe {
            for index in 0..len {
                first.as_ptr().add(index).write(T::default());
            }
        }));
        match init {
            Ok(()) => Ok(shm),
            Err(payload) => {
                drop(shm);
                resume_unwind(payload);
            }
        }
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Maps an existing object that must be exactly `size_of::<T>()` bytes.
    ///
    /// # Errors
    ///
    /// Fails with `ENOENT` if the object does not exist, or
    /// [`ShmError::SizeMismatch`] if the creator has not sized it yet or uses
    /// a different layout.
    pub fn open(path: &ShmPath) -> Result<Self> {
        let (fd, actual) = open_existing(path)?;
        if actual != size_of::<T>() as u64 {
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual,
            });
        }

        let raw = map_fd(&fd, path, size_of::<T>())?;
        Ok(Self {
            ptr: raw.cast::<T>(),
            size: size_of::<T>(),
            path: path.clone(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe> Shm<[T], Opener> {
    /// Maps an existing record array; its length is the object size divided
    /// by the record size.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::SizeMismatch`] if the object is empty or not a
    /// whole number of records.
    pub fn open_slice(path: &ShmPath) -> Result<Self> {
        let (fd, actual) = open_existing(path)?;
        let record = size_of::<T>() as u64;
        if actual == 0 || actual % record != 0 {
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual,
            });
        }

        let size = usize::try_from(actual).map_err(|_| ShmError::SizeMismatch {
            path: path.to_string(),
            expected: size_of::<T>(),
            actual,
        })?;
        let raw = map_fd(&fd, path, size)?;
        Ok(Self {
            ptr: NonNull::slice_from_raw_parts(raw.cast::<T>(), size / size_of::<T>()),
            size,
            path: path.clone(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe + ?Sized, Mode: ShmMode> Shm<T, Mode> {
    /// The name this mapping was created or opened with.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }

    /// Size of the mapping in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.size
    }
}

impl<T: SharedMemorySafe + ?Sized, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping made in the constructor, and
        // no borrow of it outlives self.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast::<c_void>(), self.size);
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: SharedMemorySafe + ?Sized, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: mapped for the lifetime of self and initialized by the creator.
        unsafe { self.ptr.as_ref() }
    }
}

/// Generates a name no other test in this process (or a concurrent test
/// process) will use.
#[cfg(test)]
pub(crate) fn unique_test_path(tag: &str) -> ShmPath {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    ShmPath::new(format!("/meridian-test-{tag}-{}-{n}", std::process::id()))
        .expect("test path is valid")
}

/// True if the error means this environment forbids shared memory, in which
/// case tests skip rather than fail.
#[cfg(test)]
pub(crate) fn is_unavailable(err: &ShmError) -> bool {
    matches!(err.errno(), Some(errno) if errno == io::Errno::ACCESS || errno == io::Errno::NOSYS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SharedMemorySafe;

    #[derive(SharedMemorySafe, Default)]
    #[repr(C)]
    struct Beat {
        value: AtomicU64,
        flag: AtomicBool,
    }

    #[derive(SharedMemorySafe, Default)]
    #[repr(C, align(64))]
    struct Line {
        value: AtomicI64,
    }

    #[test]
    fn test_create_then_open_shares_memory() -> Result<()> {
        let path = unique_test_path("beat");
        let created = match Shm::<Beat, Creator>::create(&path) {
            Ok(shm) => shm,
            Err(err) if is_unavailable(&err) => {
                eprintln!("Skipping test_create_then_open_shares_memory: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        created.value.store(100, Ordering::SeqCst);

        {
            let opened = Shm::<Beat, Opener>::open(&path)?;
            assert_eq!(opened.value.load(Ordering::SeqCst), 100);
            opened.value.store(200, Ordering::SeqCst);
            opened.flag.store(true, Ordering::SeqCst);
        }

        assert_eq!(created.value.load(Ordering::SeqCst), 200);
        assert!(created.flag.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_creator_drop_unlinks() -> Result<()> {
        let path = unique_test_path("unlink");
        match Shm::<Beat, Creator>::create(&path) {
            Ok(shm) => drop(shm),
            Err(err) if is_unavailable(&err) => return Ok(()),
            Err(err) => return Err(err),
        }

        let err = Shm::<Beat, Opener>::open(&path).err().expect("name was unlinked");
        assert_eq!(err.errno(), Some(io::Errno::NOENT));
        Ok(())
    }

    #[test]
    fn test_create_twice_fails_with_exist() -> Result<()> {
        let path = unique_test_path("exist");
        let _first = match Shm::<Beat, Creator>::create(&path) {
            Ok(shm) => shm,
            Err(err) if is_unavailable(&err) => return Ok(()),
            Err(err) => return Err(err),
        };

        let err = Shm::<Beat, Creator>::create(&path).err().expect("second create fails");
        assert_eq!(err.errno(), Some(io::Errno::EXIST));
        Ok(())
    }

    #[test]
    fn test_slice_length_recovered_on_open() -> Result<()> {
        let path = unique_test_path("lines");
        let created = match Shm::<[Line], Creator>::create_slice(&path, 17) {
            Ok(shm) => shm,
            Err(err) if is_unavailable(&err) => return Ok(()),
            Err(err) => return Err(err),
        };
        assert_eq!(created.len(), 17);
        assert_eq!(created.byte_len(), 17 * 64);
        created[16].value.store(-5, Ordering::Release);

        let opened = Shm::<[Line], Opener>::open_slice(&path)?;
        assert_eq!(opened.len(), 17);
        assert_eq!(opened[16].value.load(Ordering::Acquire), -5);
        Ok(())
    }

    #[test]
    fn test_empty_slice_rejected() {
        let path = unique_test_path("empty");
        let result = Shm::<[Line], Creator>::create_slice(&path, 0);
        assert!(matches!(result, Err(ShmError::SizeMismatch { actual: 0, .. })));
    }

    #[test]
    fn test_open_size_mismatch() -> Result<()> {
        #[derive(SharedMemorySafe)]
        #[repr(C)]
        struct Large {
            a: AtomicU64,
            b: AtomicU64,
            c: AtomicU64,
        }

        let path = unique_test_path("mismatch");
        let _small = match Shm::<Beat, Creator>::create(&path) {
            Ok(shm) => shm,
            Err(err) if is_unavailable(&err) => return Ok(()),
            Err(err) => return Err(err),
        };

        match Shm::<Large, Opener>::open(&path) {
            Err(ShmError::SizeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, size_of::<Large>());
                assert_eq!(actual, size_of::<Beat>() as u64);
            }
            Err(e) => panic!("expected SizeMismatch, got: {e}"),
            Ok(_) => panic!("expected SizeMismatch, but open succeeded"),
        }
        Ok(())
    }

    #[test]
    fn test_path_validation() {
        assert!(ShmPath::new("/valid-name_123").is_ok());
        assert!(ShmPath::new(format!("/{}", "a".repeat(254))).is_ok());

        let reason = |p: &str| match ShmPath::new(p) {
            Err(ShmError::InvalidPath { reason, .. }) => reason,
            other => panic!("expected InvalidPath for {p}, got {other:?}"),
        };
        assert_eq!(reason("no-slash"), "path must start with '/'");
        assert_eq!(reason("/"), "path must name an object after '/'");
        assert_eq!(
            reason("/foo/bar"),
            "path must not contain additional '/' characters"
        );
        assert_eq!(
            reason(&format!("/{}", "a".repeat(255))),
            "path length must be <= 255 bytes"
        );
    }
}
