//! Extracting selected members from an archive using its index.
//!
//! The [`Extractor`] reads the index front to back.  Every member whose name the [`Matcher`]
//! selects is copied block by block from the archive to the output.  The archive is only seeked
//! when the next selected member doesn't start where the previous one ended, so a run of
//! adjacent members costs a single seek.

use std::{
    borrow::Cow,
    io::{self, BufRead, Write},
};

use log::{debug, info};
use thiserror::Error;

use crate::{
    index::{FormatError, IndexEntry, IndexParser},
    matcher::Matcher,
    stream::TarStream,
    util::read_index_line,
    TAR_BLOCK_SIZE,
};

/// Extraction failed.  Nothing is retried and partially copied output is left in place.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("read indexfile: {0}")]
    IndexRead(#[source] io::Error),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("entry {sequence} ({filename:?}) has no byte offset, which a compressed archive requires")]
    MissingOffset { sequence: u64, filename: String },
    #[error("entry {sequence} ({filename:?}) starts at block {block_number}, past any seekable position")]
    BlockOutOfRange {
        sequence: u64,
        block_number: i64,
        filename: String,
    },
    #[error("seek error at {target}: {source}")]
    Seek { target: u64, source: io::Error },
    #[error("read tarfile: {0}")]
    Read(#[source] io::Error),
    #[error("partial tarfile read: got {0} of 512 bytes")]
    ShortRead(usize),
    #[error("write tarfile: {0}")]
    Write(#[source] io::Error),
    #[error("extraction was already aborted by an earlier error")]
    Aborted,
}

impl ExtractError {
    /// The process exit status for this error: 1 for a bad index, 2 for I/O trouble.
    pub fn exit_code(&self) -> u8 {
        match self {
            ExtractError::IndexRead(..)
            | ExtractError::Format(..)
            | ExtractError::MissingOffset { .. }
            | ExtractError::BlockOutOfRange { .. }
            | ExtractError::Aborted => 1,
            ExtractError::Seek { .. }
            | ExtractError::Read(..)
            | ExtractError::ShortRead(..)
            | ExtractError::Write(..) => 2,
        }
    }
}

/// Counters for one extraction run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractStats {
    /// Index lines after the header, comments included.
    pub entries: u64,
    pub members_extracted: u64,
    pub blocks_copied: u64,
    pub seeks: u64,
}

#[derive(Debug)]
enum Phase {
    AwaitingHeader,
    Streaming(IndexParser),
    Failed,
}

/// The state of one extraction run.
pub struct Extractor<S, W> {
    stream: S,
    output: W,
    matcher: Matcher,
    compression_level: u32,
    phase: Phase,
    // block the stream is positioned at, if known
    position: Option<i64>,
    stats: ExtractStats,
}

impl<S: TarStream, W: Write> Extractor<S, W> {
    /// Sets up a run copying from `stream` to `output`.
    ///
    /// A nonzero `compression_level` means `stream` is compressed, so seeks must go to the byte
    /// offsets the index recorded rather than to block boundaries.
    pub fn new(stream: S, output: W, matcher: Matcher, compression_level: u32) -> Self {
        Extractor {
            stream,
            output,
            matcher,
            compression_level,
            phase: Phase::AwaitingHeader,
            position: None,
            stats: ExtractStats::default(),
        }
    }

    pub fn stats(&self) -> ExtractStats {
        self.stats
    }

    /// Processes one index line.  The first line must be the header.
    ///
    /// Any error is fatal: later calls fail with [`ExtractError::Aborted`].
    pub fn feed_line(&mut self, line: &str) -> Result<(), ExtractError> {
        let result = self.process_line(line);
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }

    fn process_line(&mut self, line: &str) -> Result<(), ExtractError> {
        if let Phase::AwaitingHeader = self.phase {
            let parser = IndexParser::new(line)?;
            debug!("index format v{}", parser.version());
            self.phase = Phase::Streaming(parser);
            return Ok(());
        }
        let Phase::Streaming(parser) = &mut self.phase else {
            return Err(ExtractError::Aborted);
        };

        let parsed = parser.parse_line(line);
        self.stats.entries = parser.lines_parsed();
        let entry = parsed?;
        if entry.is_comment() || !self.matcher.matches(entry.filename) {
            return Ok(());
        }

        debug!("extracting {}", entry.filename);
        self.copy_member(&entry)
    }

    fn copy_member(&mut self, entry: &IndexEntry<'_>) -> Result<(), ExtractError> {
        // don't actually seek if we're already there
        if self.position != Some(entry.block_number) {
            let target = if self.compression_level > 0 {
                u64::try_from(entry.byte_offset).map_err(|_| ExtractError::MissingOffset {
                    sequence: entry.sequence_number,
                    filename: entry.filename.to_owned(),
                })?
            } else {
                (entry.block_number as u64)
                    .checked_mul(TAR_BLOCK_SIZE as u64)
                    .ok_or_else(|| ExtractError::BlockOutOfRange {
                        sequence: entry.sequence_number,
                        block_number: entry.block_number,
                        filename: entry.filename.to_owned(),
                    })?
            };

            debug!("seeking to {target}");
            self.stream
                .seek_to(target)
                .map_err(|source| ExtractError::Seek { target, source })?;
            self.stats.seeks += 1;
            self.position = Some(entry.block_number);
        }

        debug!("reading {} records", entry.block_length);
        let mut block = [0u8; TAR_BLOCK_SIZE];
        for _ in 0..entry.block_length {
            let n = self.stream.read_block(&mut block).map_err(|err| {
                self.position = None;
                ExtractError::Read(err)
            })?;
            if n < TAR_BLOCK_SIZE {
                self.position = None;
                return Err(ExtractError::ShortRead(n));
            }
            self.position = self.position.map(|p| p + 1);
            self.output.write_all(&block).map_err(ExtractError::Write)?;
            self.stats.blocks_copied += 1;
        }
        self.stats.members_extracted += 1;

        Ok(())
    }

    /// Feeds every line of `index` until it ends or an error occurs.
    ///
    /// Filenames that aren't UTF-8 are matched in their lossy form.
    pub fn run(&mut self, mut index: impl BufRead) -> Result<(), ExtractError> {
        let mut line = vec![];
        loop {
            match read_index_line(&mut index, &mut line) {
                Ok(true) => {
                    let text = String::from_utf8_lossy(&line);
                    if let Cow::Owned(..) = text {
                        debug!("index line {:?} is not valid UTF-8", text);
                    }
                    self.feed_line(&text)?
                }
                Ok(false) => return Ok(()),
                Err(err) => {
                    self.phase = Phase::Failed;
                    return Err(ExtractError::IndexRead(err));
                }
            }
        }
    }

    /// Ends the run, flushing the output.
    ///
    /// An index that never delivered its header line is a format error.
    pub fn finish(mut self) -> Result<(ExtractStats, W), ExtractError> {
        match self.phase {
            Phase::AwaitingHeader => return Err(FormatError::MissingHeader.into()),
            Phase::Failed => return Err(ExtractError::Aborted),
            Phase::Streaming(..) => {}
        }
        self.output.flush().map_err(ExtractError::Write)?;
        info!(
            "extracted {} members ({} blocks) with {} seeks",
            self.stats.members_extracted, self.stats.blocks_copied, self.stats.seeks
        );
        Ok((self.stats, self.output))
    }
}

#[cfg(test)]
mod test {
    use std::{
        cell::RefCell,
        io::{self, Cursor},
        rc::Rc,
    };

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        matcher::{FilterSpec, MatchMode},
        stream::{Block, PlainStream},
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Seek(u64),
        Read,
        Write(u8),
    }

    type Log = Rc<RefCell<Vec<Call>>>;

    /// A stream of `blocks` blocks where every block is filled with its own block number.
    /// Optionally comes up short when asked for block `short_at`.
    struct FakeStream {
        log: Log,
        pos: u64,
        blocks: u64,
        short_at: Option<u64>,
    }

    impl TarStream for FakeStream {
        fn seek_to(&mut self, target: u64) -> io::Result<()> {
            self.log.borrow_mut().push(Call::Seek(target));
            self.pos = target;
            Ok(())
        }

        fn read_block(&mut self, block: &mut Block) -> io::Result<usize> {
            self.log.borrow_mut().push(Call::Read);
            let blocknum = self.pos / TAR_BLOCK_SIZE as u64;
            if Some(blocknum) == self.short_at {
                return Ok(100);
            }
            if blocknum >= self.blocks {
                return Ok(0);
            }
            block.fill(blocknum as u8);
            self.pos += TAR_BLOCK_SIZE as u64;
            Ok(TAR_BLOCK_SIZE)
        }
    }

    struct FakeOutput {
        log: Log,
    }

    impl Write for FakeOutput {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.log.borrow_mut().push(Call::Write(buf[0]));
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn extractor(
        patterns: &[&str],
        invert: bool,
        short_at: Option<u64>,
    ) -> (Extractor<FakeStream, FakeOutput>, Log) {
        let log = Log::default();
        let matcher = Matcher::new(&FilterSpec {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            mode: MatchMode::Exact,
            invert,
        })
        .unwrap();
        let stream = FakeStream {
            log: log.clone(),
            pos: 0,
            blocks: 64,
            short_at,
        };
        let output = FakeOutput { log: log.clone() };
        (Extractor::new(stream, output, matcher, 0), log)
    }

    const INDEX: &str = "\
TARIX INDEX v2 GENERATED BY test
# a comment
0 10 5120 2 A
0 12 6144 3 B
0 20 10240 1 C
";

    fn writes(log: &Log) -> Vec<u8> {
        log.borrow()
            .iter()
            .filter_map(|call| match call {
                Call::Write(b) => Some(*b),
                _ => None,
            })
            .collect()
    }

    fn seeks(log: &Log) -> Vec<u64> {
        log.borrow()
            .iter()
            .filter_map(|call| match call {
                Call::Seek(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_contiguous_members_seek_once() {
        let (mut ex, log) = extractor(&["A", "B"], false, None);
        ex.run(Cursor::new(INDEX)).unwrap();
        let (stats, _) = ex.finish().unwrap();

        assert_eq!(seeks(&log), [10 * 512]);
        assert_eq!(
            log.borrow()[..3],
            [Call::Seek(5120), Call::Read, Call::Write(10)]
        );
        assert_eq!(writes(&log), [10, 11, 12, 13, 14]);
        assert_eq!(
            stats,
            ExtractStats {
                entries: 4,
                members_extracted: 2,
                blocks_copied: 5,
                seeks: 1,
            }
        );
    }

    #[test]
    fn test_gap_needs_a_seek() {
        let (mut ex, log) = extractor(&["A", "C"], false, None);
        ex.run(Cursor::new(INDEX)).unwrap();
        assert_eq!(seeks(&log), [10 * 512, 20 * 512]);
        assert_eq!(writes(&log), [10, 11, 20]);
    }

    #[test]
    fn test_out_of_order_members() {
        let index = "TARIX INDEX v0 GENERATED BY test\n12 1 second\n3 2 first\n5 1 third\n";
        let (mut ex, log) = extractor(&["first", "second", "third"], false, None);
        ex.run(Cursor::new(index)).unwrap();
        assert_eq!(seeks(&log), [12 * 512, 3 * 512]);
        assert_eq!(writes(&log), [12, 3, 4, 5]);
    }

    #[test]
    fn test_compressed_offsets() {
        let (ex, log) = extractor(&["A", "C"], false, None);
        let mut ex = Extractor {
            compression_level: 6,
            ..ex
        };
        ex.run(Cursor::new(INDEX)).unwrap();
        // the fake stream maps offsets to blocks the same way, so this just checks the targets
        assert_eq!(seeks(&log), [5120, 10240]);
    }

    #[test]
    fn test_compressed_needs_offsets() {
        let (ex, log) = extractor(&["A"], false, None);
        let mut ex = Extractor {
            compression_level: 6,
            ..ex
        };
        let err = ex
            .run(Cursor::new("TARIX INDEX v0 GENERATED BY test\n10 2 A\n"))
            .unwrap_err();
        assert!(matches!(err, ExtractError::MissingOffset { sequence: 0, .. }));
        assert_eq!(err.exit_code(), 1);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_short_read_is_fatal() {
        // B is blocks 12..15, so the second block of B comes up short
        let (mut ex, log) = extractor(&["A", "B", "C"], false, Some(13));
        let err = ex.run(Cursor::new(INDEX)).unwrap_err();
        assert!(matches!(err, ExtractError::ShortRead(100)));
        assert_eq!(err.exit_code(), 2);

        let calls = log.borrow().clone();
        assert_eq!(
            calls,
            [
                Call::Seek(5120),
                Call::Read,
                Call::Write(10),
                Call::Read,
                Call::Write(11),
                Call::Read,
                Call::Write(12),
                Call::Read,
            ]
        );

        // nothing else happens after the failure
        assert!(matches!(
            ex.feed_line("0 20 10240 1 C"),
            Err(ExtractError::Aborted)
        ));
        assert_eq!(log.borrow().len(), calls.len());
        assert!(matches!(ex.finish(), Err(ExtractError::Aborted)));
    }

    #[test]
    fn test_invert() {
        let (mut ex, log) = extractor(&["B"], true, None);
        ex.run(Cursor::new(INDEX)).unwrap();
        assert_eq!(writes(&log), [10, 11, 20]);
    }

    #[test]
    fn test_empty_filter() {
        let (mut ex, log) = extractor(&[], false, None);
        ex.run(Cursor::new(INDEX)).unwrap();
        assert_eq!(ex.finish().unwrap().0.members_extracted, 0);
        assert!(log.borrow().is_empty());

        let (mut ex, log) = extractor(&[], true, None);
        ex.run(Cursor::new(INDEX)).unwrap();
        assert_eq!(ex.finish().unwrap().0.members_extracted, 3);
        assert_eq!(writes(&log), [10, 11, 12, 13, 14, 20]);
        assert_eq!(seeks(&log).len(), 2);
    }

    #[test]
    fn test_bad_header() {
        let (mut ex, log) = extractor(&["A"], false, None);
        let err = ex
            .run(Cursor::new("TARIX INDEX v9 GENERATED BY the future\n0 10 5120 2 A\n"))
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::Format(FormatError::UnsupportedVersion(9))
        ));
        assert_eq!(err.exit_code(), 1);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_format_error_keeps_earlier_output() {
        let index = "TARIX INDEX v1 GENERATED BY test\n10 5120 2 A\nbroken line\n20 10240 1 A\n";
        let (mut ex, log) = extractor(&["A"], false, None);
        let err = ex.run(Cursor::new(index)).unwrap_err();
        assert!(matches!(
            err,
            ExtractError::Format(FormatError::FieldCount {
                sequence: 1,
                found: 0,
                ..
            })
        ));
        assert_eq!(writes(&log), [10, 11]);
        assert_eq!(ex.stats().entries, 2);
    }

    #[test]
    fn test_empty_index() {
        let (mut ex, _) = extractor(&["A"], false, None);
        ex.run(Cursor::new("")).unwrap();
        assert!(matches!(
            ex.finish(),
            Err(ExtractError::Format(FormatError::MissingHeader))
        ));
    }

    #[test]
    fn test_non_utf8_filename() {
        let index = b"TARIX INDEX v0 GENERATED BY test\n3 1 caf\xe9\n5 1 ok\n";
        let (mut ex, log) = extractor(&["ok"], false, None);
        ex.run(&index[..]).unwrap();
        assert_eq!(writes(&log), [5]);

        let (mut ex, log) = extractor(&["caf\u{fffd}"], false, None);
        ex.run(&index[..]).unwrap();
        let (stats, _) = ex.finish().unwrap();
        assert_eq!(writes(&log), [3]);
        assert_eq!(stats.entries, 2);
    }

    #[test]
    fn test_block_number_out_of_range() {
        let (mut ex, log) = extractor(&["A"], false, None);
        let err = ex
            .run(Cursor::new(
                "TARIX INDEX v0 GENERATED BY test\n36028797018963968 1 A\n",
            ))
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractError::BlockOutOfRange {
                sequence: 0,
                block_number: 36028797018963968,
                ..
            }
        ));
        assert_eq!(err.exit_code(), 1);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_plain_archive() {
        let archive: Vec<u8> = (0..8u8).flat_map(|n| [n; TAR_BLOCK_SIZE]).collect();
        let index = "TARIX INDEX v0 GENERATED BY test\n1 2 one\n6 2 six\n";
        let matcher = Matcher::new(&FilterSpec {
            patterns: vec!["six".into()],
            mode: MatchMode::Prefix,
            invert: false,
        })
        .unwrap();

        let mut ex = Extractor::new(PlainStream::new(Cursor::new(archive)), vec![], matcher, 0);
        ex.run(Cursor::new(index)).unwrap();
        let (stats, output) = ex.finish().unwrap();

        assert_eq!(stats.seeks, 1);
        assert_eq!(output.len(), 2 * TAR_BLOCK_SIZE);
        assert!(output[..TAR_BLOCK_SIZE].iter().all(|b| *b == 6));
        assert!(output[TAR_BLOCK_SIZE..].iter().all(|b| *b == 7));
    }
}
