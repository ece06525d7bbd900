//! The log record persisted by the engine.
//!
//! A record is encoded field by field, in declaration order: level, timestamp,
//! pid, tid, line, file, function and finally the message.

use vaultlog_derive::{Builder, Decode, Encode};

use crate::common;

/// Severity of a log record, from the least to the most severe.
///
/// The default value in [`Meta`] is [`Level::Info`].
#[repr(u8)]
#[non_exhaustive]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub enum Level {
    /// Very detailed tracing, usually disabled in production.
    Verbose = 0,
    /// Information useful during development and troubleshooting.
    Debug,
    /// The general flow of the application.
    #[default]
    Info,
    /// Something unexpected happened, but the application keeps working.
    Warn,
    /// An operation failed.
    Error,
    /// The application cannot continue.
    Fatal,
}

impl Level {
    /// Returns the underlying primitive representation.
    #[inline]
    pub fn primitive(&self) -> u8 {
        *self as u8
    }

    /// Constructs from the underlying primitive representation.
    pub fn from_primitive(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Verbose),
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Warn),
            4 => Some(Self::Error),
            5 => Some(Self::Fatal),
            _ => None,
        }
    }

    /// The one-letter abbreviation: `V`, `D`, `I`, `W`, `E` or `F`.
    #[inline]
    pub fn letter(&self) -> char {
        match self {
            Self::Verbose => 'V',
            Self::Debug => 'D',
            Self::Info => 'I',
            Self::Warn => 'W',
            Self::Error => 'E',
            Self::Fatal => 'F',
        }
    }
}

/// The place in the source code where a record was emitted.
///
/// `Location` supports `Builder Pattern`, it can be constructed by
/// `LocationBuilder`.
#[derive(Encode, Decode, Builder, Default, Clone, Copy, PartialEq, Eq, Debug)]
pub struct Location<'a> {
    line: u32,
    file: &'a str,
    func: &'a str,
}

impl<'a> Location<'a> {
    #[inline]
    pub fn new(line: u32, file: &'a str, func: &'a str) -> Self {
        Self { line, file, func }
    }

    #[inline]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[inline]
    pub fn file(&self) -> &'a str {
        self.file
    }

    #[inline]
    pub fn func(&self) -> &'a str {
        self.func
    }
}

/// Metadata associated with a record.
///
/// The default options are:
///
/// - [`Meta::level`] : [`Level::Info`]
/// - [`Meta::timestamp`] : the current time
/// - [`Meta::pid`] : the current process
/// - [`Meta::tid`] : the calling thread
/// - [`Meta::location`] : [`Location::default()`]
///
/// `Meta` supports `Builder Pattern`, it can be constructed by `MetaBuilder`.
#[derive(Encode, Decode, Builder, Clone, Copy, PartialEq, Eq, Debug)]
pub struct Meta<'a> {
    level: Level,
    timestamp: u64,
    pid: u32,
    tid: u64,
    location: Location<'a>,
}

impl<'a> Meta<'a> {
    #[inline]
    pub fn new(level: Level, timestamp: u64, pid: u32, tid: u64, location: Location<'a>) -> Self {
        Self { level, timestamp, pid, tid, location }
    }

    #[inline]
    pub fn level(&self) -> Level {
        self.level
    }

    /// Milliseconds since the Unix epoch.
    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[inline]
    pub fn tid(&self) -> u64 {
        self.tid
    }

    #[inline]
    pub fn location(&self) -> &Location<'a> {
        &self.location
    }
}

impl<'a> Default for Meta<'a> {
    fn default() -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis().try_into().unwrap_or(0);
        Meta::new(
            Level::default(),
            timestamp,
            std::process::id(),
            common::current_thread_id(),
            Location::default(),
        )
    }
}

/// A log record.
///
/// `Record` supports `Builder Pattern`, it can be constructed by `RecordBuilder`.
///
/// ```
/// use vaultlog::{Level, Location, Meta, Record};
///
/// let meta = Meta::builder()
///     .level(Level::Warn)
///     .location(Location::new(42, "main.rs", "main"))
///     .build();
/// let record = Record::builder().meta(meta).message("disk almost full").build();
/// assert_eq!(record.meta().level(), Level::Warn);
/// ```
#[derive(Encode, Decode, Builder, Default, Clone, PartialEq, Eq, Debug)]
pub struct Record<'a> {
    meta: Meta<'a>,
    message: &'a str,
}

impl<'a> Record<'a> {
    #[inline]
    pub fn new(meta: Meta<'a>, message: &'a str) -> Self {
        Self { meta, message }
    }

    #[inline]
    pub fn meta(&self) -> &Meta<'a> {
        &self.meta
    }

    #[inline]
    pub fn message(&self) -> &'a str {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        codec::{Decode, Encode},
        Level, Location, Meta, Record,
    };

    #[test]
    fn test_level_primitive() {
        for primitive in 0..=5 {
            let level = Level::from_primitive(primitive).unwrap();
            assert_eq!(level.primitive(), primitive);
        }
        assert_eq!(Level::from_primitive(6), None);
        assert_eq!(Level::Fatal.letter(), 'F');
        assert!(Level::Verbose < Level::Error);
    }

    #[test]
    fn test_record_layout() {
        let meta = Meta::new(Level::Error, 300, 7, 9, Location::new(1, "a", "b"));
        let record = Record::new(meta, "hi");

        let mut sink = Vec::new();
        record.encode(&mut sink).unwrap();
        // level, timestamp (varint), pid, tid, line, file, func, message.
        assert_eq!(sink, [4, 0xAC, 0x02, 7, 9, 1, 1, b'a', 1, b'b', 2, b'h', b'i']);

        let mut source = sink.as_slice();
        assert_eq!(Record::decode(&mut source).unwrap(), record);
        assert!(source.is_empty());
    }

    #[test]
    fn test_default_meta() {
        let meta = Meta::default();
        assert_eq!(meta.level(), Level::Info);
        assert_eq!(meta.pid(), std::process::id());
        assert!(meta.timestamp() > 0);
    }
}
