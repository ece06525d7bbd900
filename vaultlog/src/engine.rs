//! The `Engine` implementation.

use std::{
    fs, io, mem,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use thiserror::Error;

use crate::{
    buffer::MappedBuffer,
    chunk::{ChunkHeader, ItemHeader},
    codec::{Encode, EncodingError},
    common::{lock, FnSink},
    compress::{self, CompressOp, Compressor, ZstdCompressor},
    encrypt::{
        self,
        ecdh::{self, EMPTY_PUBLIC_KEY},
        AesEncryptor, Encryptor, PublicKey,
    },
    logfile::{self, Logfile},
    runloop::{self, RepeatingId, Runloop},
    ByteSize, Config, Domain, Record, ServerKey, Tracker, BUFFER_EXTENSION, KEY_EXTENSION,
};

/// The error type for [`Engine`].
///
/// Only [`Engine::new`] returns errors, everything that fails afterwards is passed
/// to the [`Tracker`] of the engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("encoding: {0}")]
    Encode(#[from] EncodingError),
    #[error("compression: {0}")]
    Compress(#[from] compress::Error),
    #[error("encryption: {0}")]
    Encrypt(#[from] encrypt::Error),
    #[error("runloop: {0}")]
    Runloop(#[from] runloop::Error),
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// The configured server public key is malformed or not on the curve.
    #[error("invalid server key: {0}")]
    InvalidKey(encrypt::Error),
    /// The configured buffer capacity is beyond what a cache buffer can address.
    #[error("a buffer capacity of {capacity} exceeds the 4 GiB cache limit")]
    BufferCapacity { capacity: ByteSize },
    /// The processed record does not fit the 32-bit size of an item header.
    #[error("an item of {len} bytes exceeds the item size limit")]
    ItemTooLarge { len: usize },
    /// A cache buffer file had an invalid header, its content has been discarded.
    #[error("the cache buffer `{}` was corrupt and has been reset", .path.display())]
    CorruptCache { path: PathBuf },
    /// Cached bytes of a previous run were found, but not the key they were
    /// encrypted for, so they have been discarded.
    #[error("discarded {len} cached bytes without a recorded sender key")]
    MissingSenderKey { len: usize },
}

/// Returns a closure that reports the error to tracker.
macro_rules! track {
    ($tracker:expr) => {{
        |err| $tracker.track(err.into(), file!(), line!())
    }};
}

/// The log persistence engine of a [`Domain`].
///
/// Records are processed on the calling thread and appended to the master cache
/// buffer. Writing to the log files and the retention sweeps happen on a
/// dedicated runloop thread.
///
/// `Engine` is `Sync`, it can be shared between threads to log concurrently.
///
/// Dropping an engine stops the runloop without flushing the master buffer. Its
/// content stays in the buffer file and is written by the next engine of the
/// same domain. Use [`Engine::shutdown`] to flush first.
pub struct Engine {
    shared: Arc<Shared>,
    runloop: Runloop,
    sweep: RepeatingId,
}

impl Engine {
    /// Starts an engine.
    ///
    /// Bytes left in the cache buffers by a previous engine of the same domain are
    /// written to a log file before this returns.
    pub fn new(domain: Domain, config: Config) -> Result<Self, Error> {
        let Config {
            key,
            buffer_capacity,
            sweep_interval,
            file_size_limit,
            total_size_limit,
            max_age,
            compression_level,
            tracker,
        } = config;

        if buffer_capacity.as_bytes() > MappedBuffer::MAX_LEN as u64 {
            return Err(Error::BufferCapacity { capacity: buffer_capacity });
        }

        fs::create_dir_all(&domain.directory)?;
        let domain = Arc::new(domain);

        let server_key = match key {
            ServerKey::None => None,
            ServerKey::Bytes(key) => Some(key),
            ServerKey::Hex(key) => {
                Some(encrypt::public_key_from_hex(&key).map_err(Error::InvalidKey)?)
            }
        };
        let keys =
            server_key.as_ref().map(ecdh::Keys::new).transpose().map_err(Error::InvalidKey)?;
        let public_key = keys.as_ref().map_or(EMPTY_PUBLIC_KEY, |k| k.public_key);
        let encryptor = keys.as_ref().map(|k| AesEncryptor::new(&k.encryption_key));
        let processor = Processor::new(ZstdCompressor::new(compression_level)?, encryptor);

        let capacity = buffer_capacity.as_usize();
        let left = domain.file_path("left", BUFFER_EXTENSION);
        let right = domain.file_path("right", BUFFER_EXTENSION);
        let mut master = open_buffer(left, capacity, &tracker)?;
        let mut slave = open_buffer(right, capacity, &tracker)?;

        let key_path = domain.directory.join(format!("{}.{KEY_EXTENSION}", domain.prefix));
        let previous_key = read_key(&key_path)?;
        let leftover = master.len() + slave.len();
        if leftover > 0 && previous_key.is_none() {
            tracker.track(Error::MissingSenderKey { len: leftover }, file!(), line!());
            master.clear();
            slave.clear();
        }

        let cache = Cache {
            master: Arc::new(Mutex::new(master)),
            slave: Arc::new(Mutex::new(slave)),
            processor,
            reset_pending: false,
        };
        let context = Context {
            domain: Arc::clone(&domain),
            public_key,
            total_size_limit: total_size_limit.as_bytes(),
            max_age,
            tracker,
        };
        let shared = Arc::new(Shared {
            context,
            cache: Mutex::new(cache),
            // The first drain below settles whatever the slave holds.
            slave_free: AtomicBool::new(false),
            logfile: Mutex::new(Logfile::new(domain, file_size_limit.as_bytes())),
        });

        let runloop = Runloop::new(format!("vaultlog.{}", shared.context.domain.prefix))?;
        let sweep = {
            let shared = Arc::clone(&shared);
            let (size_limit, max_age) = (shared.context.total_size_limit, shared.context.max_age);
            runloop.post_repeating(move || shared.sweep(size_limit, max_age), sweep_interval, None)?
        };
        let engine = Self { shared, runloop, sweep };

        // The slave holds the older bytes, it goes first.
        let recovery_key = previous_key.unwrap_or(EMPTY_PUBLIC_KEY);
        engine.drain(recovery_key);
        let pending = {
            let mut cache = lock(&engine.shared.cache);
            let cached = !lock(&cache.master).is_empty();
            cached && engine.shared.try_swap(&mut cache)
        };
        if pending {
            engine.drain(recovery_key);
        }

        write_key(&key_path, &public_key)?;
        tracing::info!(
            prefix = %engine.shared.context.domain.prefix,
            directory = %engine.shared.context.domain.directory.display(),
            encrypted = keys.is_some(),
            recovered = leftover,
            "engine started"
        );
        Ok(engine)
    }

    /// Logs the record.
    ///
    /// The record is compressed and encrypted on the calling thread. When the
    /// master buffer is almost full, this also waits for the runloop to write the
    /// buffered records to the log file.
    ///
    /// A record that cannot be processed is dropped and reported to the tracker.
    pub fn log(&self, record: &Record) {
        let full = {
            let mut cache = lock(&self.shared.cache);
            if let Err(err) = cache.append(record) {
                // The compression stream may have advanced past what the buffer holds.
                cache.reset_pending = true;
                self.shared.context.tracker.track(err, file!(), line!());
            }

            let full = lock(&cache.master).fill_ratio() > Shared::SWAP_RATIO;
            if full {
                self.shared.try_swap(&mut cache);
            }
            full
        };

        if full {
            self.drain(self.shared.context.public_key);
        }
    }

    /// Writes every buffered record to the log file and waits for the write.
    pub fn flush(&self) {
        let public_key = self.shared.context.public_key;
        self.drain(public_key);
        self.shared.try_swap(&mut lock(&self.shared.cache));
        self.drain(public_key);
    }

    /// Deletes the log files that were not modified within `lifetime`.
    ///
    /// The deletion is performed asynchronously on the runloop.
    pub fn trim(&self, lifetime: Duration) {
        let shared = Arc::clone(&self.shared);
        self.runloop
            .post(move || shared.sweep(u64::MAX, Some(lifetime)))
            .unwrap_or_else(track!(self.shared.context.tracker));
    }

    /// Flushes then shuts down the engine.
    ///
    /// All asynchronous IO operations will be waiting to complete.
    pub fn shutdown(self) {
        self.flush();
        self.runloop.cancel(self.sweep).unwrap_or_else(track!(self.shared.context.tracker));
        let logfile = lock(&self.shared.logfile).current().map(Path::to_path_buf);
        tracing::info!(
            prefix = %self.shared.context.domain.prefix,
            logfile = ?logfile,
            "engine shut down"
        );
    }

    /// Writes the slave buffer as a chunk stamped with `public_key`, and waits for
    /// it.
    fn drain(&self, public_key: PublicKey) {
        let shared = Arc::clone(&self.shared);
        self.runloop
            .post(move || shared.drain(&public_key))
            .and_then(|()| self.runloop.wait_idle())
            .unwrap_or_else(track!(self.shared.context.tracker));
    }
}

// ============ Internal ============

/// Represents the engine context.
struct Context {
    domain: Arc<Domain>,
    /// Stamped into every chunk written by this engine.
    public_key: PublicKey,
    total_size_limit: u64,
    max_age: Option<Duration>,
    tracker: Tracker,
}

type SharedBuffer = Arc<Mutex<MappedBuffer>>;

/// The cache pair and the processing state of the master.
///
/// Lock order: the `Cache` first, then a buffer. The runloop never takes the
/// `Cache` lock while it holds a buffer.
struct Cache {
    master: SharedBuffer,
    slave: SharedBuffer,
    processor: Processor<ZstdCompressor, Option<AesEncryptor>>,
    /// Set after a failed record, the next one starts a new compression frame.
    reset_pending: bool,
}

impl Cache {
    fn append(&mut self, record: &Record) -> Result<(), Error> {
        let mut master = lock(&self.master);
        if !master.is_ready() {
            // A failed grow unmapped it, the bytes on disk are still live.
            master.reopen()?;
            if !master.is_ready() {
                master.initialize()?;
            }
        }

        // Every buffer fill is an independent compression stream.
        if master.is_empty() || self.reset_pending {
            self.processor.reset()?;
            self.reset_pending = false;
        }

        let item = self.processor.process(record)?;
        master.push(item)?;
        Ok(())
    }
}

/// State shared between the producers and the runloop.
struct Shared {
    context: Context,
    cache: Mutex<Cache>,
    /// Whether the slave has been drained since the last swap.
    slave_free: AtomicBool,
    logfile: Mutex<Logfile>,
}

impl Shared {
    /// Fill ratio of the master above which it is handed over to the runloop.
    const SWAP_RATIO: f64 = 0.8;

    /// Swaps master and slave if the slave is free. Returns whether it swapped.
    fn try_swap(&self, cache: &mut Cache) -> bool {
        let swapped = self
            .slave_free
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            mem::swap(&mut cache.master, &mut cache.slave);
        }
        swapped
    }

    /// Runs on the runloop. Writes the slave as one chunk and marks it free again.
    ///
    /// The slave is cleared even if the write failed.
    fn drain(&self, public_key: &PublicKey) {
        if self.slave_free.load(Ordering::Acquire) {
            return;
        }

        let slave = Arc::clone(&lock(&self.cache).slave);
        let mut buffer = lock(&slave);
        if !buffer.is_empty() {
            let payload = buffer.as_slice();
            let header = ChunkHeader::new(payload.len(), public_key);
            match lock(&self.logfile).write(&[&header.bytes(), payload]) {
                Ok(()) => tracing::debug!(
                    cache = %buffer.path().display(),
                    len = payload.len(),
                    "wrote chunk"
                ),
                Err(err) => self.context.tracker.track(err.into(), file!(), line!()),
            }
        }
        buffer.clear();
        drop(buffer);

        self.slave_free.store(true, Ordering::Release);
    }

    /// Runs on the runloop. Applies the retention rules to the log files.
    fn sweep(&self, size_limit: u64, max_age: Option<Duration>) {
        match logfile::sweep(&self.context.domain, size_limit, max_age) {
            Ok(deleted) if !deleted.is_empty() => {
                tracing::debug!(count = deleted.len(), "retention sweep deleted log files")
            }
            Ok(_) => {}
            Err(err) => self.context.tracker.track(err.into(), file!(), line!()),
        }
    }
}

/// The record processor. It turns a record into a framed item.
///
/// # Workflow
///
/// ```plain
/// ┌──────────┐   ┌──────────────────┐   ┌───────────┐   ┌───────────────┐
/// │  Encode  │──▶│ Compress & Flush │──▶│  Encrypt  │──▶│  Item Header  │
/// └──────────┘   └──────────────────┘   └───────────┘   └───────────────┘
/// ```
struct Processor<C, E> {
    compressor: C,
    encryptor: E,
    compressed: Vec<u8>,
    item: Vec<u8>,
}

impl<C, E> Processor<C, E>
where
    C: Compressor,
    E: Encryptor,
{
    #[inline]
    fn new(compressor: C, encryptor: E) -> Self {
        Self { compressor, encryptor, compressed: Vec::new(), item: Vec::new() }
    }

    /// Starts a new compression frame.
    #[inline]
    fn reset(&mut self) -> Result<(), Error> {
        self.compressor.reset()?;
        Ok(())
    }

    /// Returns the item: header followed by the encrypted payload.
    fn process(&mut self, record: &Record) -> Result<&[u8], Error> {
        self.compressed.clear();
        {
            let mut to_compressor = FnSink::<_, Error>::new(|bytes: &[u8]| {
                self.compressor
                    .compress(CompressOp::Input(bytes), &mut self.compressed)
                    .map_err(Error::from)
            });
            record.encode(&mut to_compressor)?;
        }
        self.compressor.compress(CompressOp::Flush, &mut self.compressed)?;

        self.item.clear();
        self.item.extend_from_slice(&[0; ItemHeader::LEN]);
        self.encryptor.encrypt(&self.compressed, &mut self.item)?;

        let len = self.item.len() - ItemHeader::LEN;
        let len = u32::try_from(len).map_err(|_| Error::ItemTooLarge { len })?;
        self.item[..ItemHeader::LEN].copy_from_slice(&ItemHeader::bytes(len));
        Ok(&self.item)
    }
}

/// Opens a cache buffer, resetting it if its header is invalid.
fn open_buffer(path: PathBuf, capacity: usize, tracker: &Tracker) -> Result<MappedBuffer, Error> {
    let mut buffer = MappedBuffer::open(&path, capacity)?;
    if !buffer.is_ready() {
        tracker.track(Error::CorruptCache { path }, file!(), line!());
        buffer.initialize()?;
    }
    Ok(buffer)
}

/// Reads the sender public key recorded by the previous engine.
fn read_key(path: &Path) -> io::Result<Option<PublicKey>> {
    match fs::read(path) {
        Ok(bytes) => Ok(PublicKey::try_from(bytes.as_slice()).ok()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Records the sender public key, replacing the file atomically.
fn write_key(path: &Path, public_key: &PublicKey) -> io::Result<()> {
    let temporary = path.with_extension(format!("{KEY_EXTENSION}.tmp"));
    fs::write(&temporary, public_key)?;
    fs::rename(temporary, path)
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::{Arc, Mutex},
    };

    use tempfile::tempdir;

    use crate::{
        chunk::ChunkHeader,
        common::lock,
        compress::{zstd::starts_frame, ZstdCompressor},
        encrypt::{ecdh::Keys, AesEncryptor},
        engine::{Engine, Error, Processor},
        gen_ecdh_key_pair, ByteSize, Config, Domain, Format, Level, Location, Meta,
        PatternFormatter, Record, Unit,
    };

    fn record(message: &str) -> Record<'_> {
        let meta = Meta::new(Level::Info, 1_700_000_000_000, 1, 2, Location::new(1, "e.rs", "t"));
        Record::new(meta, message)
    }

    /// Decodes every log file of the directory, oldest first, into lines of messages.
    fn messages(domain: &Domain, secret_key: Option<crate::SecretKey>) -> Vec<String> {
        let mut files = crate::logfile::logfiles(domain).unwrap();
        files.reverse();

        let mut lines = Vec::new();
        for file in files {
            crate::decode(&file.path, secret_key, |record| {
                lines.push(record.message().to_string());
                Ok(())
            })
            .unwrap();
        }
        lines
    }

    fn tracked_errors() -> (Arc<Mutex<Vec<String>>>, Config) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let config = Config::new().tracker(Box::new(move |err: Error, _: &'static str, _: u32| {
            sink.lock().unwrap().push(err.to_string());
        }));
        (errors, config)
    }

    #[test]
    fn test_processor_frames() {
        let mut processor = Processor::new(ZstdCompressor::new(3).unwrap(), None::<AesEncryptor>);
        processor.reset().unwrap();

        let first = processor.process(&record("first")).unwrap().to_vec();
        assert_eq!(&first[..4], &0xFEEDCA71u32.to_ne_bytes());
        let len = u32::from_ne_bytes(first[4..8].try_into().unwrap()) as usize;
        assert_eq!(first.len(), 8 + len);
        assert!(starts_frame(&first[8..]));

        // Same stream: no new frame.
        let second = processor.process(&record("second")).unwrap().to_vec();
        assert!(!starts_frame(&second[8..]));

        processor.reset().unwrap();
        let third = processor.process(&record("third")).unwrap().to_vec();
        assert!(starts_frame(&third[8..]));
    }

    #[test]
    fn test_new_frame_inside_chunk_is_decoded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frames.log");
        let (server_secret, server_public) = gen_ecdh_key_pair();
        let keys = Keys::new(&server_public).unwrap();

        let compressor = ZstdCompressor::new(3).unwrap();
        let mut processor = Processor::new(compressor, AesEncryptor::new(&keys.encryption_key));
        processor.reset().unwrap();

        let messages = ["alpha alpha", "alpha beta", "alpha gamma", "alpha delta"];
        let mut payload = Vec::new();
        for (index, message) in messages.iter().enumerate() {
            // What a dropped record leaves behind: the rest of the chunk is a new frame.
            if index == 2 {
                processor.reset().unwrap();
            }
            payload.extend_from_slice(processor.process(&record(message)).unwrap());
        }
        let mut file = ChunkHeader::new(payload.len(), &keys.public_key).bytes().to_vec();
        file.extend_from_slice(&payload);
        fs::write(&path, file).unwrap();

        let mut decoded = Vec::new();
        crate::decode(&path, Some(server_secret), |record| {
            decoded.push(record.message().to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(decoded, messages);
    }

    #[test]
    fn test_oversized_buffer_capacity() {
        let dir = tempdir().unwrap();
        for capacity in [ByteSize::new(u64::MAX, Unit::TiB), ByteSize::gib(5), ByteSize::gib(4)] {
            let config = Config::new().buffer_capacity(capacity);
            let result = Engine::new(Domain::new("app", dir.path()), config);
            assert!(matches!(result, Err(Error::BufferCapacity { .. })));
        }
        // Nothing was created.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_slave_left_behind_is_recovered_in_order() {
        let dir = tempdir().unwrap();
        let domain = Domain::new("app", dir.path());
        let (server_secret, server_public) = gen_ecdh_key_pair();

        {
            let engine = Engine::new(domain.clone(), Config::new().key(server_public)).unwrap();
            engine.log(&record("zero"));
            // Swaps once, the right buffer becomes the master.
            engine.flush();
            engine.log(&record("one"));
            engine.log(&record("two"));

            // Hands the master over without draining it, as if the process died
            // before the runloop ran.
            let mut cache = lock(&engine.shared.cache);
            assert!(engine.shared.try_swap(&mut cache));
            drop(cache);

            engine.log(&record("three"));
            assert!(!lock(&lock(&engine.shared.cache).slave).is_empty());
        }
        assert_eq!(crate::logfile::logfiles(&domain).unwrap().len(), 1);

        let engine = Engine::new(domain.clone(), Config::new().key(server_public)).unwrap();
        engine.log(&record("four"));
        engine.shutdown();

        assert_eq!(messages(&domain, Some(server_secret)), ["zero", "one", "two", "three", "four"]);
    }

    #[test]
    fn test_corrupt_cache_is_tracked() {
        let dir = tempdir().unwrap();
        let domain = Domain::new("app", dir.path());
        fs::write(domain.file_path("left", crate::BUFFER_EXTENSION), vec![0xAB; 4096]).unwrap();

        let (errors, config) = tracked_errors();
        let engine = Engine::new(domain.clone(), config).unwrap();
        engine.log(&record("after reset"));
        engine.shutdown();

        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(errors.lock().unwrap()[0].contains("corrupt"));
        assert_eq!(messages(&domain, None), ["after reset"]);
    }

    #[test]
    fn test_leftover_without_key_is_discarded() {
        let dir = tempdir().unwrap();
        let domain = Domain::new("app", dir.path());
        {
            let engine = Engine::new(domain.clone(), Config::new()).unwrap();
            engine.log(&record("lost"));
        }
        fs::remove_file(dir.path().join("app.vlkey")).unwrap();

        let (errors, config) = tracked_errors();
        let engine = Engine::new(domain.clone(), config).unwrap();
        engine.shutdown();

        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(errors.lock().unwrap()[0].contains("sender key"));
        assert!(messages(&domain, None).is_empty());
    }

    #[test]
    fn test_invalid_server_key() {
        let dir = tempdir().unwrap();
        let domain = Domain::new("app", dir.path());
        let result = Engine::new(domain, Config::new().key_hex("not a key"));
        assert!(matches!(result, Err(Error::InvalidKey(_))));

        let result = Engine::new(Domain::new("app", dir.path()), Config::new().key([0xFF; 33]));
        assert!(matches!(result, Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_swap_on_full_master() {
        let dir = tempdir().unwrap();
        let domain = Domain::new("app", dir.path());
        let page = crate::mmap::page_size();
        let config = Config::new().buffer_capacity(ByteSize::bytes(page as u64));
        let engine = Engine::new(domain.clone(), config).unwrap();

        // Random letters compress to about 60%, this fills most of a page.
        let mut state = 7u32;
        let mut message = String::new();
        for _ in 0..page * 3 / 2 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            message.push(char::from(b'a' + (state >> 16) as u8 % 26));
        }

        engine.log(&record(&message));
        let files = crate::logfile::logfiles(&domain).unwrap();
        assert_eq!(files.len(), 1);
        assert!(lock(&lock(&engine.shared.cache).master).is_empty());
        drop(engine);

        let mut output = Vec::new();
        crate::decode(&files[0].path, None, |record| {
            PatternFormatter::new("%v").format(record, &mut output)
        })
        .unwrap();
        assert_eq!(output, format!("{message}\n").into_bytes());
    }
}
