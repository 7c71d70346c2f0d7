//! Building an index from a live tar stream.
//!
//! The archive is read block by block and copied to a passthrough writer (so tarix can sit in a
//! pipeline behind `tar`), optionally compressed.  Every member gets one v2 index line.

use std::{
    borrow::Cow,
    io::{self, Read, Write},
};

use log::{debug, info, warn};
use tar::{EntryType, Header};
use thiserror::Error;

use crate::{
    deflate::DeflateWriter,
    index::{IndexEntry, IndexWriter},
    stream::Block,
    util::{read_exactish, read_full},
    TAR_BLOCK_SIZE,
};

// offsets into GNU sparse headers, see tar(5)
const GNU_ISEXTENDED: usize = 482;
const GNU_EXT_ISEXTENDED: usize = 504;

#[derive(Error, Debug)]
pub enum CreateError {
    #[error("read tarfile: {0}")]
    Read(#[source] io::Error),
    #[error("write tar output: {0}")]
    Passthrough(#[source] io::Error),
    #[error("write indexfile: {0}")]
    Index(#[source] io::Error),
    #[error("bad tar header at block {block}: {source}")]
    Header { block: u64, source: io::Error },
}

impl CreateError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CreateError::Header { .. } => 1,
            _ => 2,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CreateStats {
    /// Members written to the index.
    pub members: u64,
    /// Members left out of the index because their name can't be stored in it.
    pub skipped: u64,
    /// Blocks covered by indexed members.
    pub blocks: u64,
}

/// Where the archive data goes while it is being indexed.
enum Passthrough<W: Write> {
    Plain(W),
    Deflate(DeflateWriter<W>),
}

impl<W: Write> Passthrough<W> {
    fn new(writer: W, compression_level: u32) -> Self {
        match compression_level {
            0 => Passthrough::Plain(writer),
            level => Passthrough::Deflate(DeflateWriter::new(writer, level)),
        }
    }

    /// The stream offset of the next byte, made seekable first if compressing.
    fn mark(&mut self, blocknum: u64) -> io::Result<u64> {
        match self {
            Passthrough::Plain(..) => Ok(blocknum * TAR_BLOCK_SIZE as u64),
            Passthrough::Deflate(writer) => writer.full_flush(),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Passthrough::Plain(writer) => writer.write_all(data),
            Passthrough::Deflate(writer) => writer.write_all(data),
        }
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Passthrough::Plain(mut writer) => {
                writer.flush()?;
                Ok(writer)
            }
            Passthrough::Deflate(writer) => writer.finish(),
        }
    }
}

/// The start of a member whose index line is not written yet, because GNU long name or PAX
/// headers come before the header that describes it.
struct Pending {
    block: u64,
    offset: u64,
    name: Option<Vec<u8>>,
}

/// Finds the `path` record in PAX extended header data.
fn pax_path(mut data: &[u8]) -> Option<&[u8]> {
    let mut path = None;

    // records look like "<len> <key>=<value>\n", where len counts the whole record
    while !data.is_empty() && data[0] != 0 {
        let space = data.iter().position(|b| *b == b' ')?;
        let len: usize = std::str::from_utf8(&data[..space]).ok()?.parse().ok()?;
        if len <= space + 1 || len > data.len() {
            return None;
        }
        let record = &data[space + 1..len];
        let record = record.strip_suffix(b"\n")?;
        let eq = record.iter().position(|b| *b == b'=')?;
        if &record[..eq] == b"path" {
            path = Some(&record[eq + 1..]);
        }
        data = &data[len..];
    }

    path
}

fn until_nul(data: &[u8]) -> &[u8] {
    match data.iter().position(|b| *b == 0) {
        Some(end) => &data[..end],
        None => data,
    }
}

struct Scanner<R: Read, W: Write> {
    tar: R,
    output: Passthrough<W>,
    blocknum: u64,
    block: Block,
}

impl<R: Read, W: Write> Scanner<R, W> {
    /// Reads the next block into `self.block` and passes it through.  Returns `Ok(false)` at a
    /// clean end of input.
    fn next_block(&mut self) -> Result<bool, CreateError> {
        if !read_exactish(&mut self.tar, &mut self.block).map_err(CreateError::Read)? {
            return Ok(false);
        }
        self.output
            .write_all(&self.block)
            .map_err(CreateError::Passthrough)?;
        self.blocknum += 1;
        Ok(true)
    }

    fn require_block(&mut self) -> Result<(), CreateError> {
        match self.next_block()? {
            true => Ok(()),
            false => Err(CreateError::Read(io::ErrorKind::UnexpectedEof.into())),
        }
    }

    /// Passes `size` bytes of member data through, collecting them if `keep` is set.
    fn member_data(&mut self, size: u64, keep: bool) -> Result<Vec<u8>, CreateError> {
        let mut kept = vec![];
        let mut remaining = size;
        while remaining > 0 {
            self.require_block()?;
            let used = remaining.min(TAR_BLOCK_SIZE as u64);
            if keep {
                kept.extend_from_slice(&self.block[..used as usize]);
            }
            remaining -= used;
        }
        Ok(kept)
    }
}

/// Indexes the archive read from `tar`, writing the index to `index` and the archive itself to
/// `passthrough`.
///
/// With a nonzero `compression_level` the passthrough copy is a deflate stream with a flush point
/// in front of every member, and the index records offsets into that stream.
pub fn create_index<R: Read, W: Write, I: Write>(
    tar: R,
    passthrough: W,
    index: I,
    compression_level: u32,
) -> Result<CreateStats, CreateError> {
    let mut index = IndexWriter::new(index).map_err(CreateError::Index)?;
    let mut scanner = Scanner {
        tar,
        output: Passthrough::new(passthrough, compression_level),
        blocknum: 0,
        block: [0; TAR_BLOCK_SIZE],
    };
    let mut stats = CreateStats::default();
    let mut pending: Option<Pending> = None;

    loop {
        let block = scanner.blocknum;
        // the flush point has to go in before the first header block of a member is written
        let mut start = match pending.take() {
            Some(start) => start,
            None => Pending {
                block,
                offset: scanner
                    .output
                    .mark(block)
                    .map_err(CreateError::Passthrough)?,
                name: None,
            },
        };

        if !scanner.next_block()? {
            break;
        }
        if scanner.block.iter().all(|b| *b == 0) {
            debug!("end of archive at block {block}");
            break;
        }

        let header = Header::from_byte_slice(&scanner.block);
        let entry_type = header.entry_type();
        let size = header
            .entry_size()
            .map_err(|source| CreateError::Header { block, source })?;

        match entry_type {
            EntryType::GNULongName => {
                let data = scanner.member_data(size, true)?;
                start.name = Some(until_nul(&data).to_vec());
                pending = Some(start);
                continue;
            }
            EntryType::XHeader => {
                let data = scanner.member_data(size, true)?;
                if let Some(path) = pax_path(&data) {
                    start.name = Some(path.to_vec());
                }
                pending = Some(start);
                continue;
            }
            EntryType::GNULongLink => {
                scanner.member_data(size, false)?;
                pending = Some(start);
                continue;
            }
            _ => {}
        }

        let record_type = entry_type.as_byte() as char;
        let name = match start.name.take() {
            Some(name) => name,
            None => header.path_bytes().into_owned(),
        };

        // GNU sparse headers may be followed by more blocks of sparse maps
        let mut extended = entry_type == EntryType::GNUSparse && scanner.block[GNU_ISEXTENDED] != 0;
        while extended {
            scanner.require_block()?;
            extended = scanner.block[GNU_EXT_ISEXTENDED] != 0;
        }
        // a size on these headers describes the file they point at, not data in the archive
        let has_data = !matches!(
            entry_type,
            EntryType::Link
                | EntryType::Symlink
                | EntryType::Char
                | EntryType::Block
                | EntryType::Fifo
        );
        if has_data {
            scanner.member_data(size, false)?;
        }
        let block_length = scanner.blocknum - start.block;

        let name = match String::from_utf8_lossy(&name) {
            Cow::Borrowed(name) => Cow::Borrowed(name),
            Cow::Owned(lossy) => {
                warn!("member name {lossy:?} is not valid UTF-8, indexing it lossily");
                Cow::Owned(lossy)
            }
        };
        if name.contains('\n') {
            warn!("skipping member {name:?}: line breaks can't be stored in the index");
            stats.skipped += 1;
            continue;
        }

        debug!("indexing {name} at block {} ({block_length} blocks)", start.block);
        index
            .write_entry(&IndexEntry::new(
                record_type,
                start.block as i64,
                start.offset as i64,
                block_length as i64,
                &name,
            ))
            .map_err(CreateError::Index)?;
        stats.members += 1;
        stats.blocks += block_length;
    }

    // everything after the end-of-archive marker is passed through untouched
    loop {
        let n = read_full(&mut scanner.tar, &mut scanner.block).map_err(CreateError::Read)?;
        if n == 0 {
            break;
        }
        scanner
            .output
            .write_all(&scanner.block[..n])
            .map_err(CreateError::Passthrough)?;
    }

    scanner.output.finish().map_err(CreateError::Passthrough)?;
    index.finish().map_err(CreateError::Index)?;

    info!(
        "indexed {} members ({} blocks), skipped {}",
        stats.members, stats.blocks, stats.skipped
    );
    Ok(stats)
}
