//! A growable, file-backed buffer on top of a shared memory mapping.
//!
//! Whatever is pushed into the buffer lives in the page cache of the backing file,
//! so the OS persists it even if the process terminates unexpectedly. The next
//! process that opens the same file finds the live bytes again.
//!
//! # The underlying structure
//!
//! ```plain
//!     ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ capacity ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─
//!    ├──── 8 ─────┬──────── size ────────┬──────── (unused) ──────────┤
//!    ▼────────────▼──────────────────────▼────────────────────────────▼
//! ┌──│   Header   │      Live bytes      │        Stale bytes         │
//! │  └────────────┴──────────────────────┴────────────────────────────┘
//! │  ┌───────────┬──────────────┐ (capacity: a multiple of the page size)
//! └─▶│   Magic   │     Size     │
//!    ▲───────────▲──────────────▲
//!    └──── 4 ────┴────── 4 ─────┘
//! ```

use std::{
    fs, io, mem,
    path::{Path, PathBuf},
};

use crate::{mmap::Mmap, Magic};

/// Represents the header of the buffer file.
#[repr(C)]
#[derive(Debug)]
struct Header {
    magic: [u8; 4],
    size: [u8; 4],
}

impl Header {
    /// Length of a header in bytes. (8 bytes)
    const LEN: usize = mem::size_of::<Self>();

    /// It means: `Feed Cat Buffer`.
    const MAGIC: Magic<u32> = Magic::<u32>::new(0xFEEDCA7B);
}

/// The state of the mapping.
enum Region {
    /// Mapped, and the header carries the expected magic.
    Ready(Mmap),
    /// Either mapped with a missing or corrupt header, or not mapped at all (a
    /// previous remap failed). Reads see an empty buffer and writes are ignored until
    /// [`MappedBuffer::initialize`] succeeds.
    Uninitialized(Option<Mmap>),
}

/// A persistent, page-aligned, file-backed byte buffer.
pub(crate) struct MappedBuffer {
    path: PathBuf,
    min_capacity: usize,
    region: Region,
}

impl MappedBuffer {
    /// The most live bytes the 32-bit size field can describe.
    pub(crate) const MAX_LEN: usize = u32::MAX as usize - Header::LEN;

    /// Opens the buffer file at `path`, creating it if missing.
    ///
    /// An existing file is mapped as is (at least `min_capacity` bytes) and its
    /// header is validated; a file with a wrong magic stays [uninitialized]
    /// (`Self::is_ready`). A newly created file is initialized right away.
    pub(crate) fn open(path: impl AsRef<Path>, min_capacity: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let min_capacity = min_capacity.max(Header::LEN);

        let file_len = Self::file_len(&path)?;
        let mmap = Mmap::new(&path, file_len.max(min_capacity))?;
        let mut buffer = Self { path, min_capacity, region: Region::Uninitialized(Some(mmap)) };

        if file_len == 0 {
            buffer.initialize()?;
        } else {
            buffer.validate();
        }
        Ok(buffer)
    }

    /// Writes a fresh header (empty buffer), mapping the file again if needed.
    pub(crate) fn initialize(&mut self) -> io::Result<()> {
        let mut mmap = match mem::replace(&mut self.region, Region::Uninitialized(None)) {
            Region::Ready(mmap) | Region::Uninitialized(Some(mmap)) => mmap,
            Region::Uninitialized(None) => Mmap::new(&self.path, self.min_capacity)?,
        };

        mmap[..4].copy_from_slice(&Header::MAGIC.raw());
        mmap[4..Header::LEN].copy_from_slice(&0u32.to_ne_bytes());
        self.region = Region::Ready(mmap);
        Ok(())
    }

    /// Maps the backing file again after a failed grow.
    ///
    /// The header on disk is left alone, so the live bytes are kept. The buffer
    /// stays uninitialized if that header turns out to be invalid.
    pub(crate) fn reopen(&mut self) -> io::Result<()> {
        if let Region::Uninitialized(None) = self.region {
            let len = Self::file_len(&self.path)?.max(self.min_capacity);
            self.region = Region::Uninitialized(Some(Mmap::new(&self.path, len)?));
            self.validate();
        }
        Ok(())
    }

    /// Whether the header is valid, i.e. the buffer accepts reads and writes.
    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        matches!(self.region, Region::Ready(_))
    }

    /// The path of the backing file.
    #[inline]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the whole mapping, header included. Always a page-size multiple.
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        match &self.region {
            Region::Ready(mmap) | Region::Uninitialized(Some(mmap)) => mmap.len(),
            Region::Uninitialized(None) => 0,
        }
    }

    /// The number of live bytes.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        match &self.region {
            Region::Ready(mmap) => Self::size_of(mmap),
            Region::Uninitialized(_) => 0,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live bytes.
    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        match &self.region {
            Region::Ready(mmap) => &mmap[Header::LEN..Header::LEN + Self::size_of(mmap)],
            Region::Uninitialized(_) => &[],
        }
    }

    /// Live size relative to the data capacity, used as backpressure signal.
    #[inline]
    pub(crate) fn fill_ratio(&self) -> f64 {
        match &self.region {
            Region::Ready(mmap) => Self::size_of(mmap) as f64 / (mmap.len() - Header::LEN) as f64,
            Region::Uninitialized(_) => 0.0,
        }
    }

    /// Appends bytes after the live data, growing the mapping when needed.
    ///
    /// It is a no-op on an uninitialized buffer.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> io::Result<()> {
        if !self.is_ready() {
            return Ok(());
        }

        let old_len = self.len();
        let new_len = old_len + bytes.len();
        self.reserve(new_len)?;

        if let Region::Ready(mmap) = &mut self.region {
            mmap[Header::LEN + old_len..Header::LEN + new_len].copy_from_slice(bytes);
            Self::set_size(mmap, new_len);
        }
        Ok(())
    }

    /// Sets the logical size directly, growing the mapping when needed. The bytes in
    /// between are whatever the backing file holds.
    ///
    /// It is a no-op on an uninitialized buffer. The engine only ever appends, so
    /// this is exercised by tests alone.
    #[cfg(test)]
    pub(crate) fn resize(&mut self, new_len: usize) -> io::Result<()> {
        if !self.is_ready() {
            return Ok(());
        }

        self.reserve(new_len)?;
        if let Region::Ready(mmap) = &mut self.region {
            Self::set_size(mmap, new_len);
        }
        Ok(())
    }

    /// Resets the logical size to zero. Capacity and bytes are left untouched.
    #[inline]
    pub(crate) fn clear(&mut self) {
        if let Region::Ready(mmap) = &mut self.region {
            Self::set_size(mmap, 0);
        }
    }

    /// Makes sure `len` live bytes fit into the mapping.
    ///
    /// Growing drops the current mapping, extends the file and maps it again. If
    /// mapping fails, the buffer is left uninitialized.
    fn reserve(&mut self, len: usize) -> io::Result<()> {
        if len > Self::MAX_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "buffer size exceeds 4 GiB"));
        }
        let required = Header::LEN + len;
        if required <= self.capacity() {
            return Ok(());
        }

        // Unmaps before the file is extended and mapped again.
        self.region = Region::Uninitialized(None);
        let mmap = Mmap::new(&self.path, required)?;
        self.region = Region::Ready(mmap);
        Ok(())
    }

    fn file_len(path: &Path) -> io::Result<usize> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(usize::try_from(metadata.len()).unwrap_or(usize::MAX)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Checks the header and falls back to uninitialized if it is invalid.
    fn validate(&mut self) {
        let region = mem::replace(&mut self.region, Region::Uninitialized(None));
        self.region = match region {
            Region::Ready(mmap) | Region::Uninitialized(Some(mmap)) => {
                let magic = mmap[..4].try_into().unwrap_or_default();
                let valid = Header::MAGIC.matches(magic)
                    && Header::LEN + Self::size_of(&mmap) <= mmap.len();
                if valid {
                    Region::Ready(mmap)
                } else {
                    Region::Uninitialized(Some(mmap))
                }
            }
            region => region,
        };
    }

    #[inline]
    fn size_of(mmap: &Mmap) -> usize {
        let raw = mmap[4..Header::LEN].try_into().unwrap_or_default();
        u32::from_ne_bytes(raw) as usize
    }

    #[inline]
    fn set_size(mmap: &mut Mmap, len: usize) {
        debug_assert!(Header::LEN + len <= mmap.len(), "size exceeds capacity");
        mmap[4..Header::LEN].copy_from_slice(&(len as u32).to_ne_bytes());
    }
}
