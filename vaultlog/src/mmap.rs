//! Memory-mapped files.

use std::{
    fs,
    io::{Error, ErrorKind},
    ops::{Deref, DerefMut},
    os::fd::{AsRawFd, RawFd},
    path::Path,
    ptr::{self, NonNull},
    slice,
    sync::atomic::{AtomicUsize, Ordering},
};

/// A handle to a fixed-length shared `memory-mapped` region of an underlying file.
///
/// It wraps around the unsafe `mmap` call, exposing the safe interfaces. When it is
/// dropped, the `munmap` will be called automatically. Growing a mapping means
/// dropping it and mapping the file again with a larger length.
pub(crate) struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mmap {
    /// Maps the entire underlying file to memory.
    ///
    /// # Arguments
    ///
    /// * `path` - The path of the underlying file. It is created if missing.
    /// * `len` - The expected length of the entire file. It will be rounded up to a
    ///   multiple of the operating system's memory page size. The underlying file
    ///   is extended (never truncated) to match the length.
    pub(crate) fn new(path: impl AsRef<Path>, len: usize) -> Result<Self, Error> {
        let path = path.as_ref();
        let len = round_up_page_size(len).ok_or_else(|| {
            Error::new(ErrorKind::InvalidInput, "mapping length overflows when page-aligned")
        })?;

        // Creates all intermediate directories if they are missing.
        if let Some(parent_path) = path.parent() {
            fs::create_dir_all(parent_path)?;
        }

        let file = fs::OpenOptions::new().read(true).write(true).create(true).open(path)?;
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }

        // The mapping stays valid after the descriptor is closed.
        Self::map(file.as_raw_fd(), len).map(|ptr| Self { ptr, len })
    }

    /// A thin wrapper around the `mmap` system call.
    fn map(file: RawFd, len: usize) -> Result<NonNull<u8>, Error> {
        // SAFETY: Just a few FFI calls to libc.
        unsafe {
            let ptr = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file,
                0,
            );

            if ptr == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }
            debug_assert_eq!(ptr as usize % page_size(), 0, "ptr is not page-aligned");

            libc::madvise(ptr, len, libc::MADV_WILLNEED);

            NonNull::new(ptr as *mut u8).ok_or_else(Error::last_os_error)
        }
    }

    /// Returns the number of bytes in the mmap.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Extracts a slice of the entire mmap.
    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: The pointer and the length describe the live mapping.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Extracts a mutable slice of the entire mmap.
    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: The pointer and the length describe the live mapping.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Deref for Mmap {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for Mmap {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl Drop for Mmap {
    #[inline]
    fn drop(&mut self) {
        let ptr = self.ptr.as_ptr() as *mut libc::c_void;
        // We just ignore the thrown error inside the `Drop` method.
        _ = unsafe { libc::munmap(ptr, self.len) };
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Rounds up to a multiple of the operating system's memory page size, `None` on
/// overflow.
#[inline]
pub(crate) fn round_up_page_size(value: usize) -> Option<usize> {
    let page_size = page_size();
    value.max(1).div_ceil(page_size).checked_mul(page_size)
}

/// Obtains the operating system's memory page size.
pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    // It is not guaranteed that `sysconf` will be called only once in multiple threads,
    // but it is possible to reduce the number of times it is called.
    match PAGE_SIZE.load(Ordering::Acquire) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) } as usize;
            PAGE_SIZE.store(page_size, Ordering::Release);
            page_size
        }
        page_size => page_size,
    }
}
