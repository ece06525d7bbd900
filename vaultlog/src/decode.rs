//! Decoding of log files back into records.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::Path,
};

use thiserror::Error;

use crate::{
    chunk::{self, ChunkHeader, Items},
    codec::Decode,
    common::LazyFileWriter,
    compress::{self, zstd, Decompressor, ZstdDecompressor},
    encrypt::{
        self,
        ecdh::{ecdh_encryption_key, EMPTY_PUBLIC_KEY},
        AesDecryptor, Decryptor,
    },
    DecodingError, Format, Record, SecretKey,
};

/// Errors that can be occurred while decoding a log file ([`decode`]).
///
/// Any error aborts the whole decoding, no later chunk is read.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("the log file is smaller than a chunk header")]
    FileTooSmall,
    #[error(transparent)]
    Framing(chunk::Error),
    #[error("the chunk at offset {offset} is encrypted, but no secret key was given")]
    MissingSecretKey { offset: u64 },
    #[error("key negotiation for the chunk at offset {offset}: {source}")]
    Key { offset: u64, source: encrypt::Error },
    #[error("decryption of the chunk at offset {offset}: {source}")]
    Decrypt { offset: u64, source: encrypt::Error },
    #[error("decompression of the chunk at offset {offset}: {source}")]
    Decompress { offset: u64, source: compress::Error },
    #[error("decoding of the chunk at offset {offset}: {source}")]
    Decode { offset: u64, source: DecodingError },
}

impl From<chunk::Error> for Error {
    #[inline]
    fn from(err: chunk::Error) -> Self {
        match err {
            chunk::Error::Io(err) => Self::Io(err),
            err => Self::Framing(err),
        }
    }
}

/// Decodes the compressed and encrypted log file into records and calls them back
/// one by one, in the order they were logged.
///
/// Chunks written without encryption are decoded without a secret key.
pub fn decode(
    path: impl AsRef<Path>,
    secret_key: Option<SecretKey>,
    callback: impl FnMut(&Record) -> io::Result<()>,
) -> Result<(), Error> {
    run(path.as_ref(), secret_key, &mut Callback(callback))
}

/// Decodes the log file into a readable text file, one line per record.
///
/// The lines of a chunk are written once the whole chunk has been decoded. On
/// error, the destination holds the lines of every chunk before the failing one
/// (and does not exist if that was the first chunk).
pub fn decode_to_file(
    path: impl AsRef<Path>,
    dest_path: impl AsRef<Path>,
    secret_key: Option<SecretKey>,
    formatter: impl Format,
) -> Result<(), Error> {
    let mut visitor = Render {
        formatter,
        pending: Vec::new(),
        writer: BufWriter::new(LazyFileWriter::new(dest_path.as_ref())),
    };
    let result = run(path.as_ref(), secret_key, &mut visitor);
    visitor.writer.flush()?;
    result
}

// ============ Internal ============

/// Receives the decoded records.
trait Visit {
    fn record(&mut self, record: &Record) -> io::Result<()>;

    /// The chunk that delivered the preceding records decoded successfully.
    fn chunk_end(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Callback<F>(F);

impl<F> Visit for Callback<F>
where
    F: FnMut(&Record) -> io::Result<()>,
{
    #[inline]
    fn record(&mut self, record: &Record) -> io::Result<()> {
        (self.0)(record)
    }
}

/// Formats into a per-chunk buffer that is written out when the chunk ends.
struct Render<F, W> {
    formatter: F,
    pending: Vec<u8>,
    writer: W,
}

impl<F, W> Visit for Render<F, W>
where
    F: Format,
    W: Write,
{
    #[inline]
    fn record(&mut self, record: &Record) -> io::Result<()> {
        self.formatter.format(record, &mut self.pending)
    }

    fn chunk_end(&mut self) -> io::Result<()> {
        self.writer.write_all(&self.pending)?;
        self.pending.clear();
        Ok(())
    }
}

fn run(path: &Path, secret_key: Option<SecretKey>, visitor: &mut impl Visit) -> Result<(), Error> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < ChunkHeader::LEN as u64 {
        return Err(Error::FileTooSmall);
    }

    let mut reader = chunk::Reader::new(BufReader::new(file), len);
    let mut processor = Processor::new(secret_key);
    loop {
        let offset = reader.offset();
        let Some((header, payload)) = reader.read_chunk()? else { break };
        processor.process(offset, &header, payload, visitor)?;
        visitor.chunk_end()?;
    }
    Ok(())
}

/// # Workflow
///
/// ```plain
/// ┌──────────────┐   ┌───────────┐   ┌────────────┐   ┌──────────┐   ┌─────────┐
/// │  Read Chunk  │──▶│  Decrypt  │──▶│ Decompress │──▶│  Decode  │──▶│  Visit  │
/// └──────────────┘   └───────────┘   └────────────┘   └──────────┘   └─────────┘
/// ```
struct Processor {
    secret_key: Option<SecretKey>,
    decompressor: ZstdDecompressor,
    decrypted: Vec<u8>,
    decompressed: Vec<u8>,
}

impl Processor {
    #[inline]
    fn new(secret_key: Option<SecretKey>) -> Self {
        Self {
            secret_key,
            decompressor: ZstdDecompressor::new(),
            decrypted: Vec::new(),
            decompressed: Vec::new(),
        }
    }

    /// Derives the decryptor of a chunk from its sender public key.
    fn decryptor(&self, offset: u64, header: &ChunkHeader) -> Result<Option<AesDecryptor>, Error> {
        let public_key = header.public_key();
        if public_key == EMPTY_PUBLIC_KEY {
            return Ok(None);
        }

        let secret_key = self.secret_key.as_ref().ok_or(Error::MissingSecretKey { offset })?;
        let key = ecdh_encryption_key(secret_key, &public_key)
            .map_err(|source| Error::Key { offset, source })?;
        Ok(Some(AesDecryptor::new(&key)))
    }

    fn process(
        &mut self,
        offset: u64,
        header: &ChunkHeader,
        payload: &[u8],
        visitor: &mut impl Visit,
    ) -> Result<(), Error> {
        let mut decryptor = self.decryptor(offset, header)?;
        tracing::debug!(
            offset,
            len = header.payload_len(),
            encrypted = decryptor.is_some(),
            "decoding chunk"
        );

        // Each chunk is a new compression stream.
        self.decompressor.reset().map_err(|source| Error::Decompress { offset, source })?;

        for item in Items::new(payload) {
            let item = item?;

            self.decrypted.clear();
            decryptor
                .decrypt(item, &mut self.decrypted)
                .map_err(|source| Error::Decrypt { offset, source })?;

            // So does every item after a failed one on the encoding side.
            if zstd::starts_frame(&self.decrypted) {
                self.decompressor.reset().map_err(|source| Error::Decompress { offset, source })?;
            }

            self.decompressed.clear();
            self.decompressor
                .decompress(&self.decrypted, &mut self.decompressed)
                .map_err(|source| Error::Decompress { offset, source })?;

            let record = Record::decode(&mut self.decompressed.as_slice())
                .map_err(|source| Error::Decode { offset, source })?;
            visitor.record(&record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, io};

    use tempfile::tempdir;

    use crate::{
        chunk::{ChunkHeader, ItemHeader},
        decode::{decode, decode_to_file, Error},
        encrypt::ecdh::EMPTY_PUBLIC_KEY,
        PatternFormatter,
    };

    #[test]
    fn test_file_too_small() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("small.log");
        fs::write(&path, [0; 10])?;
        assert!(matches!(decode(&path, None, |_| Ok(())), Err(Error::FileTooSmall)));

        fs::write(&path, b"")?;
        assert!(matches!(decode(&path, None, |_| Ok(())), Err(Error::FileTooSmall)));
        Ok(())
    }

    #[test]
    fn test_bad_magic() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bad.log");
        fs::write(&path, [0xAB; ChunkHeader::LEN * 2])?;
        assert!(matches!(decode(&path, None, |_| Ok(())), Err(Error::Framing(_))));
        Ok(())
    }

    #[test]
    fn test_bad_item_writes_nothing() -> io::Result<()> {
        let dir = tempdir()?;
        let (path, dest) = (dir.path().join("item.log"), dir.path().join("item.txt"));

        let mut item = ItemHeader::bytes(4).to_vec();
        item.extend_from_slice(b"junk");
        item[0] ^= 0xFF;
        let mut bytes = ChunkHeader::new(item.len(), &EMPTY_PUBLIC_KEY).bytes().to_vec();
        bytes.extend_from_slice(&item);
        fs::write(&path, bytes)?;

        let result = decode_to_file(&path, &dest, None, PatternFormatter::default());
        assert!(matches!(result, Err(Error::Framing(_))));
        assert!(!dest.exists());
        Ok(())
    }

    #[test]
    fn test_encrypted_chunk_without_key() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("enc.log");
        let (_, public_key) = crate::gen_ecdh_key_pair();
        fs::write(&path, ChunkHeader::new(0, &public_key).bytes())?;

        assert!(matches!(
            decode(&path, None, |_| Ok(())),
            Err(Error::MissingSecretKey { offset: 0 })
        ));
        Ok(())
    }
}
