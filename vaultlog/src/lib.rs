//! Encrypted, compressed and crash-safe log persistence, written in Rust.
//!
//! ### Buffering
//!
//! Records are appended to a pair of cache buffers backed by `mmap`ed files: the
//! *master* takes new records, while the *slave* is being written to the log file.
//! Once the master is more than 80% full, the two swap roles. If the program exits
//! unexpectedly, the OS still persists the cached bytes, and the next engine for
//! the same domain writes them to the log file before it accepts new records.
//!
//! ### Compression
//!
//! Records are compressed with `Zstandard` as one continuous stream per buffer
//! fill, so similar consecutive records compress very well.
//!
//! ### Encryption
//!
//! Each record is encrypted with `AES 128`. The symmetric key is negotiated via
//! `ECDH` (`secp256r1`) between an ephemeral key pair of the engine and the server
//! public key passed in the [`Config`]. The ephemeral public key is stored in every
//! chunk, so only the holder of the server secret key can read the logs.
//!
//! Keys can be generated with [`gen_ecdh_key_pair`] or the `vaultlog-cli gen-keys`
//! command.
//!
//! ### Rotation & Retention
//!
//! Log files are named `{prefix}_{YYYYMMDDHHMMSS}.log` and a new one is started
//! once the current one exceeds the single-file size limit. A periodic sweep
//! deletes the oldest files once the total size exceeds the budget.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use vaultlog::{ByteSize, Config, Domain, Engine, Level, Meta, Record};
//!
//! let domain = Domain::new("app", "/path/to/logs");
//! let config = Config::new()
//!     .key_hex("02a1...server public key in hex")
//!     .file_size_limit(ByteSize::mib(8));
//! let engine = Engine::new(domain, config).expect("failed to start the engine");
//!
//! let meta = Meta::builder().level(Level::Info).build();
//! let record = Record::builder().meta(meta).message("Hello World").build();
//! engine.log(&record);
//!
//! // Writes everything buffered to the log file.
//! engine.flush();
//! ```
//!
//! ### Decoding
//!
//! ```rust,no_run
//! use vaultlog::{secret_key_from_hex, PatternFormatter};
//!
//! let secret_key = secret_key_from_hex("...server secret key in hex").ok();
//! let formatter = PatternFormatter::new("%D [%l] %F:%# %v");
//! if let Err(err) = vaultlog::decode_to_file("app.log", "app.txt", secret_key, formatter) {
//!     println!("Error: {err}");
//! }
//! ```

use std::{path::PathBuf, time::Duration};

pub mod record;
pub use record::*;

pub mod size;
pub use size::{ByteSize, ParseError as ByteSizeParseError, Unit};

pub mod compress;
pub use compress::Error as CompressionError;

pub mod encrypt;
pub use encrypt::{
    gen_ecdh_key_pair, public_key_from_hex, secret_key_from_hex, EncryptionKey, PublicKey,
    SecretKey, PUBLIC_KEY_LEN,
};

pub mod codec;
pub use codec::{DecodingError, EncodingError};

pub mod chunk;
pub use chunk::Error as ChunkError;

pub mod runloop;
pub use runloop::Error as RunloopError;

mod engine;
pub use engine::{Engine, Error};

mod decode;
pub use decode::{decode, decode_to_file, Error as DecodeError};

mod format;
pub use format::{Format, PatternFormatter};

mod common;
use common::*;

mod buffer;
mod logfile;
mod mmap;

/// The extension of the log files.
pub const FILE_EXTENSION: &str = "log";

/// The extension of the cache buffer files.
pub const BUFFER_EXTENSION: &str = "vlbuf";

/// The extension of the file holding the sender public key of the last engine.
pub const KEY_EXTENSION: &str = "vlkey";

/// Identifies the files of an engine: everything it creates lives in `directory`
/// and is named after `prefix`.
#[derive(Clone, Debug)]
pub struct Domain {
    /// The file name prefix of the log, cache and key files.
    pub prefix: String,
    /// The directory where the files are stored. It is created if missing.
    pub directory: PathBuf,
}

impl Domain {
    /// Constructs a new `Domain`.
    #[inline]
    pub fn new(prefix: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self { prefix: prefix.into(), directory: directory.into() }
    }

    /// Starts an engine with a specified configuration.
    #[inline]
    pub fn engine(self, config: Config) -> Result<Engine, Error> {
        Engine::new(self, config)
    }

    /// Starts an engine with the default configuration.
    #[inline]
    pub fn engine_with_default_config(self) -> Result<Engine, Error> {
        self.engine(Config::default())
    }

    fn file_path(&self, name: &str, extension: &str) -> PathBuf {
        self.directory.join(format!("{}.{name}.{extension}", self.prefix))
    }
}

/// Represents a tracker used to track errors that were handled inside the engine.
///
/// Failures of a single record (compression, encryption, cache writes) or of a
/// background task (log file writes, retention sweeps) never reach the caller;
/// they are passed here instead.
pub trait Track {
    /// Handles the error on the code location.
    fn track(&self, error: Error, file: &'static str, line: u32);
}

impl<F> Track for F
where
    F: Fn(Error, &'static str, u32),
{
    #[inline]
    fn track(&self, error: Error, file: &'static str, line: u32) {
        self(error, file, line)
    }
}

/// Trait object type for [`Track`].
pub type Tracker = Box<dyn Track + Send + Sync>;

/// The server public key used to negotiate the encryption key.
#[derive(Clone, Debug, Default)]
enum ServerKey {
    /// No encryption.
    #[default]
    None,
    Bytes(PublicKey),
    /// Parsed when the engine starts.
    Hex(String),
}

/// Configuration of an engine instance.
pub struct Config {
    key: ServerKey,
    buffer_capacity: ByteSize,
    sweep_interval: Duration,
    file_size_limit: ByteSize,
    total_size_limit: ByteSize,
    max_age: Option<Duration>,
    compression_level: i32,
    tracker: Tracker,
}

impl Config {
    /// Constructs a new `Config`.
    #[inline]
    pub fn new() -> Self {
        Default::default()
    }

    /// The server public key, the public key in ECDH.
    ///
    /// It is used to negotiate the key for symmetric encryption of the records.
    /// Without a key, records are compressed but not encrypted.
    ///
    /// The default value is no key.
    #[inline]
    pub fn key(mut self, key: PublicKey) -> Self {
        self.key = ServerKey::Bytes(key);
        self
    }

    /// The server public key in hex, see [`Config::key`].
    ///
    /// An invalid key makes [`Engine::new`] fail.
    #[inline]
    pub fn key_hex(mut self, key: impl Into<String>) -> Self {
        self.key = ServerKey::Hex(key.into());
        self
    }

    /// The minimum capacity of each cache buffer.
    ///
    /// It is rounded up to a multiple of the page size. Buffers grow beyond it when
    /// a drain cannot keep up.
    ///
    /// The default value is `512 KiB`.
    #[inline]
    pub fn buffer_capacity(mut self, capacity: ByteSize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// How often the retention sweep runs.
    ///
    /// The default value is `5 minutes`.
    #[inline]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Size of a log file after which a new file is started.
    ///
    /// The default value is `4 MiB`.
    #[inline]
    pub fn file_size_limit(mut self, limit: ByteSize) -> Self {
        self.file_size_limit = limit;
        self
    }

    /// Total size of the log files of the domain. The retention sweep deletes the
    /// oldest files beyond it, the newest file is always kept.
    ///
    /// The default value is `100 MiB`.
    #[inline]
    pub fn total_size_limit(mut self, limit: ByteSize) -> Self {
        self.total_size_limit = limit;
        self
    }

    /// Log files not modified within this duration are deleted by the retention
    /// sweep.
    ///
    /// The default value is `None`, files never expire.
    #[inline]
    pub fn max_age(mut self, age: Option<Duration>) -> Self {
        self.max_age = age;
        self
    }

    /// The compression level.
    ///
    /// `zstd` supports compression levels from 1 up to 22, it also offers negative
    /// compression levels. The lower the level, the faster the speed (at the cost
    /// of compression).
    ///
    /// The default value is `10`.
    #[inline]
    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// The tracker used to track errors handled inside the engine.
    ///
    /// Errors are emitted as `tracing` events by default.
    #[inline]
    pub fn tracker(mut self, tracker: Tracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Starts an engine with a specified domain.
    #[inline]
    pub fn engine(self, domain: Domain) -> Result<Engine, Error> {
        Engine::new(domain, self)
    }
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            key: ServerKey::None,
            buffer_capacity: ByteSize::kib(512),
            sweep_interval: Duration::from_secs(5 * 60),
            file_size_limit: ByteSize::mib(4),
            total_size_limit: ByteSize::mib(100),
            max_age: None,
            compression_level: compress::ZstdCompressor::DEFAULT_LEVEL,
            tracker: Box::new(|err: Error, file: &'static str, line: u32| {
                tracing::error!(file, line, "{err}")
            }),
        }
    }
}
