//! The `Chunk` and `Item` framing.
//!
//! A log file is a flat concatenation of chunks. Each chunk is exactly one drain of
//! a cache buffer: a header carrying the sender public key, followed by the items
//! that were appended to the buffer. Each item is one compressed and encrypted
//! record. All integers are stored in native byte order.
//!
//! # The underlying structure
//!
//! ```plain
//!     ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─
//!    ├─────── 144 ───────┬──────────────── size ─────────────────┤
//!    ▼───────────────────▼───────────────────────────────────────▼
//! ┌──│   Chunk Header    │   Item   │   Item   │  ...  │  Item   │
//! │  └───────────────────┴──┬───────┴──────────┴───────┴─────────┘
//! │  ┌─────────┬──────────┐ │  ┌──────────┬──────────┬─────────────┐
//! └─▶│  Magic  │   Size   │ └─▶│  Magic   │   Size   │   Payload   │
//!    ├─────────┴──────────┤    ▲──────────▲──────────▲─────────────▲
//!    │     Public Key     │    └─── 4 ────┴─── 4 ────┴─── size ────┘
//!    ▲──────────────────┬─▲
//!    └─ 8 + 8 + 128 ────┘
//! ```

use std::{io, mem};

use thiserror::Error;

use crate::{
    encrypt::{ecdh::EMPTY_PUBLIC_KEY, PublicKey, PUBLIC_KEY_LEN},
    Magic,
};

/// Errors that can be occurred while splitting bytes into chunks and items.
#[derive(Error, Debug)]
pub enum Error {
    /// A chunk header with a wrong magic, or a size beyond the end of the file.
    #[error("invalid chunk header at offset {offset}")]
    InvalidChunk { offset: u64 },
    /// An item header with a wrong magic, or a size beyond the end of the chunk.
    #[error("invalid item header at offset {offset} of the chunk payload")]
    InvalidItem { offset: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Width of the key field of a chunk header. Keys are right-padded with zeros.
const KEY_FIELD_LEN: usize = 128;

/// Represents the header of the chunk.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct ChunkHeader {
    payload_len: u64,
    key: [u8; KEY_FIELD_LEN],
}

impl ChunkHeader {
    /// Length of a header in bytes. (144 bytes)
    pub(crate) const LEN: usize = mem::size_of::<u64>() * 2 + KEY_FIELD_LEN;

    /// It means: `Feed Cat Chunk`, format 1.
    const MAGIC: Magic<u64> = Magic::<u64>::new(0xFEEDCA7C_0000_0001);

    #[inline]
    pub(crate) fn new(payload_len: usize, public_key: &PublicKey) -> Self {
        let mut key = [0; KEY_FIELD_LEN];
        key[..PUBLIC_KEY_LEN].copy_from_slice(public_key);
        Self { payload_len: payload_len as u64, key }
    }

    /// Parses and validates a header.
    pub(crate) fn parse(bytes: &[u8; Self::LEN], offset: u64) -> Result<Self, Error> {
        let (magic, rest) = bytes.split_at(8);
        let (payload_len, key) = rest.split_at(8);

        let invalid = || Error::InvalidChunk { offset };
        if !Self::MAGIC.matches(magic.try_into().map_err(|_| invalid())?) {
            return Err(invalid());
        }
        let payload_len = u64::from_ne_bytes(payload_len.try_into().map_err(|_| invalid())?);
        Ok(Self { payload_len, key: key.try_into().map_err(|_| invalid())? })
    }

    /// Converts header to bytes representation.
    pub(crate) fn bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0; Self::LEN];
        bytes[..8].copy_from_slice(&Self::MAGIC.raw());
        bytes[8..16].copy_from_slice(&self.payload_len.to_ne_bytes());
        bytes[16..].copy_from_slice(&self.key);
        bytes
    }

    /// The length of the chunk payload.
    #[inline]
    pub(crate) fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// The sender public key of the chunk. All zeros mean no encryption.
    #[inline]
    pub(crate) fn public_key(&self) -> PublicKey {
        let mut public_key = EMPTY_PUBLIC_KEY;
        public_key.copy_from_slice(&self.key[..PUBLIC_KEY_LEN]);
        public_key
    }
}

/// Represents the header of the item.
pub(crate) struct ItemHeader;

impl ItemHeader {
    /// Length of a header in bytes. (8 bytes)
    pub(crate) const LEN: usize = mem::size_of::<u32>() * 2;

    /// It means: `Feed Cat Item`.
    const MAGIC: Magic<u32> = Magic::<u32>::new(0xFEEDCA71);

    /// Converts header of an item with `payload_len` bytes to bytes representation.
    pub(crate) fn bytes(payload_len: u32) -> [u8; Self::LEN] {
        let mut bytes = [0; Self::LEN];
        bytes[..4].copy_from_slice(&Self::MAGIC.raw());
        bytes[4..].copy_from_slice(&payload_len.to_ne_bytes());
        bytes
    }
}

/// An iterator over the item payloads of a chunk payload.
///
/// It stops after the first error.
pub(crate) struct Items<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> Items<'a> {
    #[inline]
    pub(crate) fn new(payload: &'a [u8]) -> Self {
        Self { payload, offset: 0 }
    }

    fn next_item(&mut self) -> Result<&'a [u8], Error> {
        let invalid = Error::InvalidItem { offset: self.offset };
        let remaining = &self.payload[self.offset..];
        if remaining.len() < ItemHeader::LEN {
            return Err(invalid);
        }

        let (header, body) = remaining.split_at(ItemHeader::LEN);
        let (magic, len) = header.split_at(4);
        let magic = magic.try_into().unwrap_or_default();
        let len = u32::from_ne_bytes(len.try_into().unwrap_or_default()) as usize;
        if !ItemHeader::MAGIC.matches(magic) || len > body.len() {
            return Err(invalid);
        }

        self.offset += ItemHeader::LEN + len;
        Ok(&body[..len])
    }
}

impl<'a> Iterator for Items<'a> {
    type Item = Result<&'a [u8], Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let item = self.next_item();
        if item.is_err() {
            self.offset = self.payload.len();
        }
        Some(item)
    }
}

/// Represents a reader that reads chunks from the underlying [`io::Read`].
///
/// [`Reader::read_chunk`] is called in a loop until either an error occurs or the
/// underlying reader finishes reading.
pub(crate) struct Reader<R> {
    inner: R,
    /// Bytes consumed so far.
    offset: u64,
    /// Total length of the input, to reject oversized chunks before allocating.
    len: u64,
    payload: Vec<u8>,
}

impl<R> Reader<R>
where
    R: io::Read,
{
    /// Construct a new `Reader` over `len` bytes of input.
    #[inline]
    pub(crate) fn new(inner: R, len: u64) -> Self {
        Self { inner, offset: 0, len, payload: Vec::new() }
    }

    /// Bytes consumed so far, i.e. the offset of the next chunk.
    #[inline]
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads the next chunk. If the underlying reader has reached the end, returns
    /// `None`.
    pub(crate) fn read_chunk(&mut self) -> Result<Option<(ChunkHeader, &[u8])>, Error> {
        let offset = self.offset;
        let mut header = [0; ChunkHeader::LEN];
        if !self.read_exact_or_end(&mut header)? {
            return Ok(None);
        }

        let header = ChunkHeader::parse(&header, offset)?;
        let remaining = self.len.saturating_sub(self.offset);
        if header.payload_len() > remaining {
            return Err(Error::InvalidChunk { offset });
        }

        self.payload.resize(header.payload_len() as usize, 0);
        self.inner.read_exact(&mut self.payload).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::InvalidChunk { offset },
            _ => err.into(),
        })?;
        self.offset += header.payload_len();

        Ok(Some((header, &self.payload)))
    }

    /// Fills the whole buffer. Returns `false` on a clean end of input, a partial
    /// header is an invalid chunk.
    fn read_exact_or_end(&mut self, buffer: &mut [u8]) -> Result<bool, Error> {
        let mut read_len = 0;
        while read_len < buffer.len() {
            match self.inner.read(&mut buffer[read_len..]) {
                Ok(0) if read_len == 0 => return Ok(false),
                Ok(0) => return Err(Error::InvalidChunk { offset: self.offset }),
                Ok(len) => read_len += len,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.offset += read_len as u64;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::chunk::{ChunkHeader, Error, ItemHeader, Items, Reader};

    fn item(payload: &[u8]) -> Vec<u8> {
        let mut bytes = ItemHeader::bytes(payload.len() as u32).to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    fn chunk(key: &[u8; 33], items: &[&[u8]]) -> Vec<u8> {
        let payload: Vec<u8> = items.iter().flat_map(|i| item(i)).collect();
        let mut bytes = ChunkHeader::new(payload.len(), key).bytes().to_vec();
        bytes.extend_from_slice(&payload);
        bytes
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(ChunkHeader::LEN, 144);
        assert_eq!(ItemHeader::LEN, 8);

        let key = [3; 33];
        let bytes = ChunkHeader::new(1000, &key).bytes();
        assert_eq!(bytes[..8], 0xFEEDCA7C_0000_0001u64.to_ne_bytes());
        assert_eq!(bytes[8..16], 1000u64.to_ne_bytes());
        assert_eq!(bytes[16..49], key);
        assert!(bytes[49..].iter().all(|b| *b == 0));

        let header = ChunkHeader::parse(&bytes, 0).unwrap();
        assert_eq!(header.payload_len(), 1000);
        assert_eq!(header.public_key(), key);

        let item = ItemHeader::bytes(7);
        assert_eq!(item[..4], 0xFEEDCA71u32.to_ne_bytes());
        assert_eq!(item[4..], 7u32.to_ne_bytes());
    }

    #[test]
    fn test_items() {
        let payload: Vec<u8> = [item(b"one"), item(b""), item(b"three")].concat();
        let items: Vec<_> = Items::new(&payload).collect::<Result<_, _>>().unwrap();
        assert_eq!(items, [&b"one"[..], b"", b"three"]);
        assert_eq!(Items::new(&[]).count(), 0);
    }

    #[test]
    fn test_invalid_items() {
        // Wrong magic in the second item.
        let mut payload = [item(b"one"), item(b"two")].concat();
        payload[11] ^= 0xFF;
        let items: Vec<_> = Items::new(&payload).collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(Error::InvalidItem { offset: 11 })));

        // Size beyond the end of the chunk.
        let mut payload = item(b"one");
        payload.pop();
        assert!(matches!(Items::new(&payload).next(), Some(Err(Error::InvalidItem { .. }))));

        // Truncated header.
        assert!(matches!(Items::new(&[1, 2, 3]).next(), Some(Err(Error::InvalidItem { .. }))));
    }

    #[test]
    fn test_reader() {
        let file = [chunk(&[1; 33], &[b"a", b"b"]), chunk(&[2; 33], &[b"c"])].concat();
        let mut reader = Reader::new(file.as_slice(), file.len() as u64);

        let (header, payload) = reader.read_chunk().unwrap().unwrap();
        assert_eq!(header.public_key(), [1; 33]);
        assert_eq!(Items::new(payload).count(), 2);

        let (header, payload) = reader.read_chunk().unwrap().unwrap();
        assert_eq!(header.public_key(), [2; 33]);
        assert_eq!(payload, item(b"c"));

        assert!(reader.read_chunk().unwrap().is_none());
    }

    #[test]
    fn test_reader_rejects_bad_framing() {
        let file = chunk(&[1; 33], &[b"abc"]);

        // Bad magic.
        let mut corrupt = file.clone();
        corrupt[0] ^= 0xFF;
        let mut reader = Reader::new(corrupt.as_slice(), corrupt.len() as u64);
        assert!(matches!(reader.read_chunk(), Err(Error::InvalidChunk { offset: 0 })));

        // Truncated payload.
        let truncated = &file[..file.len() - 1];
        let mut reader = Reader::new(truncated, truncated.len() as u64);
        assert!(matches!(reader.read_chunk(), Err(Error::InvalidChunk { offset: 0 })));

        // Trailing partial header after a valid chunk.
        let trailing = [file.clone(), vec![0; 10]].concat();
        let mut reader = Reader::new(trailing.as_slice(), trailing.len() as u64);
        assert!(reader.read_chunk().unwrap().is_some());
        assert!(matches!(reader.read_chunk(), Err(Error::InvalidChunk { offset })
            if offset == file.len() as u64));
    }
}
