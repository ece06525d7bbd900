//! Byte sizes used by the configuration.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Units of a [`ByteSize`], in powers of 1024.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub enum Unit {
    #[default]
    Bytes,
    KiB,
    MiB,
    GiB,
    TiB,
}

impl Unit {
    const ALL: [Self; 5] = [Self::Bytes, Self::KiB, Self::MiB, Self::GiB, Self::TiB];

    /// Number of bytes in one unit.
    #[inline]
    pub const fn factor(self) -> u64 {
        match self {
            Self::Bytes => 1,
            Self::KiB => 1 << 10,
            Self::MiB => 1 << 20,
            Self::GiB => 1 << 30,
            Self::TiB => 1 << 40,
        }
    }

    #[inline]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Bytes => "B",
            Self::KiB => "KiB",
            Self::MiB => "MiB",
            Self::GiB => "GiB",
            Self::TiB => "TiB",
        }
    }
}

/// A size in bytes, carried as a magnitude and a [`Unit`].
///
/// ```
/// use vaultlog::{ByteSize, Unit};
///
/// let size: ByteSize = "4 MiB".parse().unwrap();
/// assert_eq!(size, ByteSize::new(4, Unit::MiB));
/// assert_eq!(size.as_bytes(), 4 * 1024 * 1024);
/// assert_eq!(size.to_string(), "4MiB");
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct ByteSize {
    magnitude: u64,
    unit: Unit,
}

impl ByteSize {
    #[inline]
    pub const fn new(magnitude: u64, unit: Unit) -> Self {
        Self { magnitude, unit }
    }

    #[inline]
    pub const fn bytes(magnitude: u64) -> Self {
        Self::new(magnitude, Unit::Bytes)
    }

    #[inline]
    pub const fn kib(magnitude: u64) -> Self {
        Self::new(magnitude, Unit::KiB)
    }

    #[inline]
    pub const fn mib(magnitude: u64) -> Self {
        Self::new(magnitude, Unit::MiB)
    }

    #[inline]
    pub const fn gib(magnitude: u64) -> Self {
        Self::new(magnitude, Unit::GiB)
    }

    #[inline]
    pub const fn magnitude(&self) -> u64 {
        self.magnitude
    }

    #[inline]
    pub const fn unit(&self) -> Unit {
        self.unit
    }

    /// The raw byte count, saturating at `u64::MAX`.
    #[inline]
    pub const fn as_bytes(&self) -> u64 {
        self.magnitude.saturating_mul(self.unit.factor())
    }

    /// The raw byte count as `usize`, saturating on 32-bit targets.
    #[inline]
    pub fn as_usize(&self) -> usize {
        usize::try_from(self.as_bytes()).unwrap_or(usize::MAX)
    }
}

// Sizes compare by their byte count: `1KiB == 1024B`.
impl PartialEq for ByteSize {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ByteSize {}

impl From<u64> for ByteSize {
    #[inline]
    fn from(bytes: u64) -> Self {
        Self::bytes(bytes)
    }
}

impl fmt::Display for ByteSize {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.magnitude, self.unit.symbol())
    }
}

/// Errors that can be occurred by parsing a [`ByteSize`].
#[derive(Error, Clone, PartialEq, Eq, Debug)]
pub enum ParseError {
    #[error("missing magnitude")]
    MissingMagnitude,
    #[error("invalid magnitude: {0}")]
    Magnitude(#[from] std::num::ParseIntError),
    #[error("unknown unit `{0}`")]
    Unit(String),
}

impl FromStr for ByteSize {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (magnitude, unit) = s.split_at(split);
        if magnitude.is_empty() {
            return Err(ParseError::MissingMagnitude);
        }

        let unit = match unit.trim() {
            "" => Unit::Bytes,
            unit => Unit::ALL
                .into_iter()
                .find(|u| u.symbol().eq_ignore_ascii_case(unit))
                .ok_or_else(|| ParseError::Unit(unit.to_string()))?,
        };
        Ok(Self::new(magnitude.parse()?, unit))
    }
}

#[cfg(test)]
mod tests {
    use crate::size::{ByteSize, ParseError, Unit};

    #[test]
    fn test_as_bytes() {
        assert_eq!(ByteSize::bytes(100).as_bytes(), 100);
        assert_eq!(ByteSize::kib(512).as_bytes(), 512 * 1024);
        assert_eq!(ByteSize::gib(2).as_bytes(), 2 << 30);
        assert_eq!(ByteSize::new(u64::MAX, Unit::TiB).as_bytes(), u64::MAX);
        assert_eq!(ByteSize::kib(1), ByteSize::bytes(1024));
    }

    #[test]
    fn test_parse() {
        assert_eq!("100".parse::<ByteSize>(), Ok(ByteSize::bytes(100)));
        assert_eq!("4MiB".parse::<ByteSize>(), Ok(ByteSize::mib(4)));
        assert_eq!(" 512 kib ".parse::<ByteSize>(), Ok(ByteSize::kib(512)));
        assert_eq!("1 B".parse::<ByteSize>(), Ok(ByteSize::bytes(1)));

        assert_eq!("MiB".parse::<ByteSize>(), Err(ParseError::MissingMagnitude));
        assert_eq!("4 MB".parse::<ByteSize>(), Err(ParseError::Unit("MB".to_string())));
    }

    #[test]
    fn test_display() {
        assert_eq!(ByteSize::kib(512).to_string(), "512KiB");
        assert_eq!(ByteSize::bytes(7).to_string(), "7B");
    }
}
