use std::{
    fs::{self, File, OpenOptions},
    io,
    marker::PhantomData,
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// Represents a target for processed data.
///
/// For the sake of generality, generics are used to define the type of errors that
/// can be occurred during a series of processing steps.
pub(crate) trait Sink<E> {
    /// Type of errors that can be occurred by self.
    type Error: From<E>;

    /// Where the actual writing of bytes happens.
    fn sink(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;
}

impl<E> Sink<E> for Vec<u8> {
    type Error = E;

    #[inline]
    fn sink(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// A closure wrapper that implements the `Sink` trait.
pub(crate) struct FnSink<F, Error> {
    inner: F,
    _error: PhantomData<Error>,
}

impl<F, Error> FnSink<F, Error> {
    /// Constructs a new `FnSink` with a closure.
    #[inline]
    pub(crate) fn new(inner: F) -> Self {
        Self { inner, _error: PhantomData }
    }
}

impl<F, E, Error> Sink<E> for FnSink<F, Error>
where
    F: FnMut(&[u8]) -> Result<(), Error>,
    Error: From<E>,
{
    type Error = Error;

    #[inline]
    fn sink(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        (self.inner)(bytes)
    }
}

/// A fixed sentinel placed at the beginning of a persisted structure for validation.
///
/// Stored in native byte order, like every other integer of the on-disk layouts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub(crate) struct Magic<T>(T);

impl Magic<u32> {
    #[inline]
    pub(crate) const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw representation.
    #[inline]
    pub(crate) const fn raw(&self) -> [u8; 4] {
        self.0.to_ne_bytes()
    }

    /// Checks whether the raw bytes carry this magic.
    #[inline]
    pub(crate) fn matches(&self, raw: [u8; 4]) -> bool {
        u32::from_ne_bytes(raw) == self.0
    }
}

impl Magic<u64> {
    #[inline]
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw representation.
    #[inline]
    pub(crate) const fn raw(&self) -> [u8; 8] {
        self.0.to_ne_bytes()
    }

    /// Checks whether the raw bytes carry this magic.
    #[inline]
    pub(crate) fn matches(&self, raw: [u8; 8]) -> bool {
        u64::from_ne_bytes(raw) == self.0
    }
}

/// Represents a file writer which opens (and truncates) the file only when it is
/// actually ready to be written to.
pub(crate) struct LazyFileWriter<'a> {
    path: &'a Path,
    inner: Option<File>,
}

impl<'a> LazyFileWriter<'a> {
    #[inline]
    pub(crate) fn new(path: &'a Path) -> Self {
        Self { path, inner: None }
    }

    fn open(&mut self) -> io::Result<&mut File> {
        if self.inner.is_none() {
            // Creates all intermediate directories if they are missing.
            if let Some(parent_path) = self.path.parent() {
                fs::create_dir_all(parent_path)?;
            }

            let file =
                OpenOptions::new().create(true).truncate(true).write(true).open(self.path)?;
            self.inner = Some(file);
        }

        self.inner.as_mut().ok_or_else(|| io::Error::other("lazy file is not opened"))
    }
}

impl<'a> io::Write for LazyFileWriter<'a> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.open()?.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Locks the mutex, recovering the guard from a poisoned lock.
///
/// A panicking producer cannot leave the guarded buffers in a torn state: every
/// mutation that matters is a single header store.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The identifier of the calling OS thread.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn current_thread_id() -> u64 {
    // SAFETY: `gettid` has no preconditions and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// The identifier of the calling OS thread.
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) fn current_thread_id() -> u64 {
    let mut tid = 0u64;
    // SAFETY: A null thread handle means the calling thread; `tid` is a valid pointer.
    unsafe {
        libc::pthread_threadid_np(0 as libc::pthread_t, &mut tid);
    }
    tid
}

/// The identifier of the calling OS thread.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
pub(crate) fn current_thread_id() -> u64 {
    0
}

/// This trait being unreachable from outside the crate prevents outside
/// implementations of our specified traits.
pub trait Sealed {}

impl<T> Sealed for Option<T> where T: Sealed {}
