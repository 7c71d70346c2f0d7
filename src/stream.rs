//! Seekable block streams over tar archives.
//!
//! The extraction driver only ever seeks to a target and then reads whole tar blocks.  What a
//! target means depends on the stream: a byte offset into a plain file, a byte offset into a
//! compressed file (see [`crate::deflate::DeflateStream`]) or a position on a magnetic tape.

use std::{
    fs::File,
    io::{self, ErrorKind, Read, Seek, SeekFrom},
};

use crate::{util::read_full, TAR_BLOCK_SIZE};

pub type Block = [u8; TAR_BLOCK_SIZE];

/// The interface the extraction driver needs from an archive.
pub trait TarStream {
    /// Positions the stream so the next read returns the data at `target`.
    fn seek_to(&mut self, target: u64) -> io::Result<()>;

    /// Fills `block`, returning the number of bytes read.  This is less than a full block only
    /// at the end of the stream.
    fn read_block(&mut self, block: &mut Block) -> io::Result<usize>;
}

impl<S: TarStream + ?Sized> TarStream for Box<S> {
    fn seek_to(&mut self, target: u64) -> io::Result<()> {
        (**self).seek_to(target)
    }

    fn read_block(&mut self, block: &mut Block) -> io::Result<usize> {
        (**self).read_block(block)
    }
}

/// An uncompressed archive in a regular file (or anything else that can seek).
#[derive(Debug)]
pub struct PlainStream<R> {
    inner: R,
}

impl<R: Read + Seek> PlainStream<R> {
    pub fn new(inner: R) -> Self {
        PlainStream { inner }
    }
}

impl<R: Read + Seek> TarStream for PlainStream<R> {
    fn seek_to(&mut self, target: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(target))?;
        Ok(())
    }

    fn read_block(&mut self, block: &mut Block) -> io::Result<usize> {
        read_full(&mut self.inner, block)
    }
}

/// Magnetic tape operations.
#[cfg(target_os = "linux")]
mod mtio {
    use std::os::fd::AsFd;

    use rustix::ioctl;

    // See /usr/include/linux/mtio.h
    #[repr(C)]
    pub struct MtOp {
        mt_op: i16,
        mt_count: i32,
    }

    const MTSEEK: i16 = 22;

    // #define MTIOCTOP _IOW('m', 1, struct mtop)
    type MtIocTop = ioctl::WriteOpcode<b'm', 1, MtOp>;

    /// Positions the tape at the given record.
    pub fn mt_seek(fd: impl AsFd, record: i32) -> rustix::io::Result<()> {
        unsafe {
            ioctl::ioctl(
                fd,
                ioctl::Setter::<MtIocTop, MtOp>::new(MtOp {
                    mt_op: MTSEEK,
                    mt_count: record,
                }),
            )
        }
    }
}

/// An uncompressed archive on a tape drive, positioned with `MTSEEK` rather than `lseek()`.
///
/// The tape is assumed to hold fixed records of `record_size` bytes.  Seeking goes to the record
/// containing the target and then skips forward to the byte.
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct TapeStream {
    file: File,
    record_size: u64,
}

#[cfg(target_os = "linux")]
impl TapeStream {
    pub fn new(file: File) -> Self {
        Self::with_record_size(file, TAR_BLOCK_SIZE as u64)
    }

    pub fn with_record_size(file: File, record_size: u64) -> Self {
        TapeStream { file, record_size }
    }
}

#[cfg(target_os = "linux")]
impl TarStream for TapeStream {
    fn seek_to(&mut self, target: u64) -> io::Result<()> {
        let record = i32::try_from(target / self.record_size).map_err(|_| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("tape position {target} is out of range"),
            )
        })?;
        mtio::mt_seek(&self.file, record)?;

        let skip = target % self.record_size;
        let skipped = io::copy(&mut (&self.file).take(skip), &mut io::sink())?;
        if skipped != skip {
            return Err(ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    fn read_block(&mut self, block: &mut Block) -> io::Result<usize> {
        read_full(&mut self.file, block)
    }
}
