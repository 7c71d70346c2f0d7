//! Reading and writing the tarix index format.
//!
//! An index is a text file.  The first line is a header naming the format revision:
//!
//! ```text
//! TARIX INDEX v2 GENERATED BY tarix 0.1.0
//! ```
//!
//! Every following line is either a comment (starting with `#`) or describes one archive member.
//! The numeric fields of a member line depend on the revision:
//!
//!  - v0: `block_number block_length filename`
//!  - v1: `block_number byte_offset block_length filename`
//!  - v2: `record_type block_number byte_offset block_length filename`
//!
//! A single space separates the last number from the filename, which runs verbatim to the end of
//! the line.  Filenames are not escaped, so they may contain spaces but no line breaks.

use std::{
    fmt,
    io::{self, ErrorKind, Write},
};

use thiserror::Error;

use crate::CURRENT_VERSION;

const HEADER_PREFIX: &str = "TARIX INDEX v";
const HEADER_GENERATOR: &str = "GENERATED BY";

/// A malformed index.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Index header not recognized")]
    UnrecognizedHeader,
    #[error("Index version {0} not supported")]
    UnsupportedVersion(i64),
    #[error("Index is empty, expected a header line")]
    MissingHeader,
    #[error("index format error in entry {sequence}: v{version} expects {expected} fields, got {found}")]
    FieldCount {
        sequence: u64,
        version: u32,
        expected: usize,
        found: usize,
    },
    #[error("index format error in entry {sequence}: negative {field}")]
    NegativeField { sequence: u64, field: &'static str },
    #[error("Filename {0:?} cannot be stored in an index line")]
    UnrepresentableName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Comment,
    Normal,
}

/// One line of an index, borrowing its filename from the line it was parsed from.
///
/// Use [`IndexEntry::to_owned_entry`] to keep an entry around after the line buffer is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry<'a> {
    pub version: u32,
    pub sequence_number: u64,
    pub kind: RecordKind,
    /// The tar typeflag of the member (v2 only).  Comments carry `'#'`.
    pub record_type: Option<char>,
    /// First 512-byte block of the member, -1 for comments.
    pub block_number: i64,
    /// Number of blocks the member spans, -1 for comments.
    pub block_length: i64,
    /// Position of `block_number` in the underlying stream (v1 and later), -1 otherwise.
    pub byte_offset: i64,
    /// The member path, or the text after `#` for comments.
    pub filename: &'a str,
}

impl<'a> IndexEntry<'a> {
    /// A member entry in the current format revision.
    pub fn new(
        record_type: char,
        block_number: i64,
        byte_offset: i64,
        block_length: i64,
        filename: &'a str,
    ) -> Self {
        IndexEntry {
            version: CURRENT_VERSION,
            sequence_number: 0,
            kind: RecordKind::Normal,
            record_type: Some(record_type),
            block_number,
            block_length,
            byte_offset,
            filename,
        }
    }

    pub fn is_comment(&self) -> bool {
        self.kind == RecordKind::Comment
    }

    /// Copies the entry, including its filename, so it no longer borrows the index line.
    pub fn to_owned_entry(&self) -> OwnedIndexEntry {
        OwnedIndexEntry {
            version: self.version,
            sequence_number: self.sequence_number,
            kind: self.kind,
            record_type: self.record_type,
            block_number: self.block_number,
            block_length: self.block_length,
            byte_offset: self.byte_offset,
            filename: self.filename.to_owned(),
        }
    }
}

/// Formats the entry as the index line for its version, without a line terminator.
impl fmt::Display for IndexEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_comment() {
            return write!(f, "#{}", self.filename);
        }

        match self.version {
            0 => write!(
                f,
                "{} {} {}",
                self.block_number, self.block_length, self.filename
            ),
            1 => write!(
                f,
                "{} {} {} {}",
                self.block_number, self.byte_offset, self.block_length, self.filename
            ),
            _ => write!(
                f,
                "{} {} {} {} {}",
                self.record_type.unwrap_or('0'),
                self.block_number,
                self.byte_offset,
                self.block_length,
                self.filename
            ),
        }
    }
}

/// An [`IndexEntry`] that owns its filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedIndexEntry {
    pub version: u32,
    pub sequence_number: u64,
    pub kind: RecordKind,
    pub record_type: Option<char>,
    pub block_number: i64,
    pub block_length: i64,
    pub byte_offset: i64,
    pub filename: String,
}

impl OwnedIndexEntry {
    pub fn as_entry(&self) -> IndexEntry<'_> {
        IndexEntry {
            version: self.version,
            sequence_number: self.sequence_number,
            kind: self.kind,
            record_type: self.record_type,
            block_number: self.block_number,
            block_length: self.block_length,
            byte_offset: self.byte_offset,
            filename: &self.filename,
        }
    }
}

fn expected_fields(version: u32) -> usize {
    match version {
        0 => 2,
        1 => 3,
        _ => 4,
    }
}

/// Pulls the leading fields off a member line.  Once a field fails to scan, all later ones do
/// too, so `found` is the number of fields read before the first failure.
struct FieldScanner<'a> {
    rest: &'a str,
    found: usize,
    failed: bool,
}

impl<'a> FieldScanner<'a> {
    fn new(line: &'a str) -> Self {
        FieldScanner {
            rest: line,
            found: 0,
            failed: false,
        }
    }

    fn character(&mut self) -> Option<char> {
        if self.failed {
            return None;
        }
        let mut chars = self.rest.chars();
        match chars.next() {
            Some(c) => {
                self.rest = chars.as_str();
                self.found += 1;
                Some(c)
            }
            None => {
                self.failed = true;
                None
            }
        }
    }

    fn number(&mut self) -> Option<i64> {
        if self.failed {
            return None;
        }

        let s = self.rest.trim_start_matches(&[' ', '\t'][..]);
        let bytes = s.as_bytes();
        let mut end = match bytes.first() {
            Some(b'+' | b'-') => 1,
            _ => 0,
        };
        let digits = end;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }

        match s[..end].parse::<i64>() {
            Ok(value) if end > digits => {
                self.rest = &s[end..];
                self.found += 1;
                Some(value)
            }
            _ => {
                self.failed = true;
                None
            }
        }
    }

    /// Everything after the single space following the last field.
    fn filename(self) -> &'a str {
        self.rest.strip_prefix(' ').unwrap_or(self.rest)
    }
}

fn parse_header(header: &str) -> Result<u32, FormatError> {
    let rest = header
        .strip_prefix(HEADER_PREFIX)
        .ok_or(FormatError::UnrecognizedHeader)?;
    let (number, generator) = rest
        .split_once(' ')
        .ok_or(FormatError::UnrecognizedHeader)?;
    if !generator.starts_with(HEADER_GENERATOR) {
        return Err(FormatError::UnrecognizedHeader);
    }

    let version: i64 = number
        .parse()
        .map_err(|_| FormatError::UnrecognizedHeader)?;
    u32::try_from(version)
        .ok()
        .filter(|v| *v <= CURRENT_VERSION)
        .ok_or(FormatError::UnsupportedVersion(version))
}

/// Parser state for one index stream.
///
/// Created from the header line, then fed every following line in order.  Parsers share nothing,
/// so any number of indexes can be read side by side.
#[derive(Debug, Clone)]
pub struct IndexParser {
    version: u32,
    next_sequence: u64,
}

impl IndexParser {
    pub fn new(header: &str) -> Result<Self, FormatError> {
        Ok(IndexParser {
            version: parse_header(header)?,
            next_sequence: 0,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of lines handed to [`IndexParser::parse_line`] so far, failed ones included.
    pub fn lines_parsed(&self) -> u64 {
        self.next_sequence
    }

    /// Parses one line following the header.
    ///
    /// Every call consumes a sequence number, even when the line turns out to be malformed.  A
    /// malformed line means nothing after it can be trusted, so callers should stop there.
    pub fn parse_line<'a>(&mut self, line: &'a str) -> Result<IndexEntry<'a>, FormatError> {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;

        if let Some(comment) = line.strip_prefix('#') {
            return Ok(IndexEntry {
                version: self.version,
                sequence_number,
                kind: RecordKind::Comment,
                record_type: Some('#'),
                block_number: -1,
                block_length: -1,
                byte_offset: -1,
                filename: comment,
            });
        }

        let mut scanner = FieldScanner::new(line);
        let (record_type, block_number, byte_offset, block_length) = match self.version {
            0 => {
                let block_number = scanner.number();
                let block_length = scanner.number();
                (None, block_number, Some(-1), block_length)
            }
            1 => {
                let block_number = scanner.number();
                let byte_offset = scanner.number();
                let block_length = scanner.number();
                (None, block_number, byte_offset, block_length)
            }
            _ => {
                let record_type = scanner.character();
                let block_number = scanner.number();
                let byte_offset = scanner.number();
                let block_length = scanner.number();
                (record_type, block_number, byte_offset, block_length)
            }
        };

        let expected = expected_fields(self.version);
        let (Some(block_number), Some(byte_offset), Some(block_length)) =
            (block_number, byte_offset, block_length)
        else {
            return Err(FormatError::FieldCount {
                sequence: sequence_number,
                version: self.version,
                expected,
                found: scanner.found,
            });
        };

        if block_number < 0 {
            return Err(FormatError::NegativeField {
                sequence: sequence_number,
                field: "block number",
            });
        }
        if block_length < 0 {
            return Err(FormatError::NegativeField {
                sequence: sequence_number,
                field: "block length",
            });
        }

        Ok(IndexEntry {
            version: self.version,
            sequence_number,
            kind: RecordKind::Normal,
            record_type,
            block_number,
            block_length,
            byte_offset,
            filename: scanner.filename(),
        })
    }
}

/// Writes an index: the header on creation, then one line per entry.
pub struct IndexWriter<W: Write> {
    writer: W,
    version: u32,
}

impl<W: Write> IndexWriter<W> {
    /// Starts an index in the current format revision.
    pub fn new(writer: W) -> io::Result<Self> {
        Self::with_version(writer, CURRENT_VERSION)
    }

    /// Starts an index in an older revision.  Entries are re-encoded for that revision, dropping
    /// the fields it doesn't have.
    pub fn with_version(mut writer: W, version: u32) -> io::Result<Self> {
        if version > CURRENT_VERSION {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                FormatError::UnsupportedVersion(version.into()),
            ));
        }
        writeln!(
            writer,
            "{HEADER_PREFIX}{version} {HEADER_GENERATOR} {} {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )?;
        Ok(IndexWriter { writer, version })
    }

    pub fn write_entry(&mut self, entry: &IndexEntry<'_>) -> io::Result<()> {
        check_representable(entry.filename)?;
        let entry = IndexEntry {
            version: self.version,
            ..*entry
        };
        writeln!(self.writer, "{entry}")
    }

    pub fn write_comment(&mut self, text: &str) -> io::Result<()> {
        check_representable(text)?;
        writeln!(self.writer, "#{text}")
    }

    /// Flushes the index and returns the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

fn check_representable(text: &str) -> io::Result<()> {
    if text.contains('\n') {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            FormatError::UnrepresentableName(text.to_owned()),
        ));
    }
    Ok(())
}
