//! Rendering of decoded records as text.

use std::io::{self, Write};

use chrono::TimeZone;

use crate::Record;

/// Represents a formatter that formats log records into readable text.
pub trait Format {
    /// Formats the log record then passes the result to the writer.
    fn format(&mut self, record: &Record, writer: &mut impl Write) -> io::Result<()>;
}

/// One parsed piece of a pattern.
#[derive(Clone, PartialEq, Eq, Debug)]
enum Piece {
    Literal(String),
    Level,
    Date,
    Seconds,
    Millis,
    Pid,
    Tid,
    Line,
    File,
    Func,
    Message,
}

/// A formatter driven by a `%`-directive pattern.
///
/// | Directive | Output                                        |
/// |-----------|-----------------------------------------------|
/// | `%l`      | level letter: `V`, `D`, `I`, `W`, `E` or `F`  |
/// | `%D`      | local date and time, `YYYY-MM-DD HH:MM:SS`    |
/// | `%S`      | seconds since the Unix epoch                  |
/// | `%M`      | milliseconds since the Unix epoch             |
/// | `%p`      | process id                                    |
/// | `%t`      | thread id                                     |
/// | `%#`      | source line                                   |
/// | `%F`      | source file                                   |
/// | `%f`      | source function                               |
/// | `%v`      | message                                       |
///
/// Any other character after `%` is printed as is, together with the `%`. An empty
/// pattern selects the default layout:
/// `[level][epoch_ms][pid:tid][file:func:line]message`, with the numeric level.
///
/// Every record is terminated by a newline.
///
/// ```
/// use vaultlog::{Format, Level, Location, Meta, PatternFormatter, Record};
///
/// let meta = Meta::new(Level::Warn, 1_700_000_000_123, 7, 8, Location::new(3, "a.rs", "f"));
/// let record = Record::new(meta, "hi");
///
/// let mut output = Vec::new();
/// PatternFormatter::new("%l %S|%t %v").format(&record, &mut output).unwrap();
/// assert_eq!(output, b"W 1700000000|8 hi\n");
///
/// output.clear();
/// PatternFormatter::default().format(&record, &mut output).unwrap();
/// assert_eq!(output, b"[3][1700000000123][7:8][a.rs:f:3]hi\n");
/// ```
#[derive(Clone, Default, Debug)]
pub struct PatternFormatter {
    pieces: Vec<Piece>,
}

impl PatternFormatter {
    /// Compiles the pattern.
    pub fn new(pattern: &str) -> Self {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars();

        while let Some(ch) = chars.next() {
            if ch != '%' {
                literal.push(ch);
                continue;
            }

            // A trailing `%` ends the pattern without output.
            let Some(directive) = chars.next() else { break };
            let piece = match directive {
                'l' => Piece::Level,
                'D' => Piece::Date,
                'S' => Piece::Seconds,
                'M' => Piece::Millis,
                'p' => Piece::Pid,
                't' => Piece::Tid,
                '#' => Piece::Line,
                'F' => Piece::File,
                'f' => Piece::Func,
                'v' => Piece::Message,
                other => {
                    literal.push('%');
                    literal.push(other);
                    continue;
                }
            };

            if !literal.is_empty() {
                pieces.push(Piece::Literal(std::mem::take(&mut literal)));
            }
            pieces.push(piece);
        }

        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }
        Self { pieces }
    }

    fn format_default(record: &Record, writer: &mut impl Write) -> io::Result<()> {
        let (meta, location) = (record.meta(), record.meta().location());
        write!(
            writer,
            "[{}][{}][{}:{}][{}:{}:{}]{}",
            meta.level().primitive(),
            meta.timestamp(),
            meta.pid(),
            meta.tid(),
            location.file(),
            location.func(),
            location.line(),
            record.message()
        )
    }

    fn format_piece(piece: &Piece, record: &Record, writer: &mut impl Write) -> io::Result<()> {
        let (meta, location) = (record.meta(), record.meta().location());
        match piece {
            Piece::Literal(literal) => writer.write_all(literal.as_bytes()),
            Piece::Level => write!(writer, "{}", meta.level().letter()),
            Piece::Date => {
                let millis = i64::try_from(meta.timestamp()).unwrap_or(i64::MAX);
                match chrono::Local.timestamp_millis_opt(millis).single() {
                    Some(datetime) => write!(writer, "{}", datetime.format("%Y-%m-%d %H:%M:%S")),
                    None => write!(writer, "{}", meta.timestamp()),
                }
            }
            Piece::Seconds => write!(writer, "{}", meta.timestamp() / 1000),
            Piece::Millis => write!(writer, "{}", meta.timestamp()),
            Piece::Pid => write!(writer, "{}", meta.pid()),
            Piece::Tid => write!(writer, "{}", meta.tid()),
            Piece::Line => write!(writer, "{}", location.line()),
            Piece::File => writer.write_all(location.file().as_bytes()),
            Piece::Func => writer.write_all(location.func().as_bytes()),
            Piece::Message => writer.write_all(record.message().as_bytes()),
        }
    }
}

impl Format for PatternFormatter {
    fn format(&mut self, record: &Record, writer: &mut impl Write) -> io::Result<()> {
        if self.pieces.is_empty() {
            Self::format_default(record, writer)?;
        } else {
            for piece in &self.pieces {
                Self::format_piece(piece, record, writer)?;
            }
        }
        writer.write_all(b"\n")
    }
}
