//! Compressed archives that can still be seeked into.
//!
//! The archive is written as one raw deflate stream, with a full flush in front of every member.
//! After a full flush the compressor has forgotten everything it saw before, so decompression can
//! start at that byte offset with a fresh decompressor.  The index records these offsets.

use std::io::{self, BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::stream::{Block, TarStream};

const OUTPUT_CHUNK: usize = 32 * 1024;

/// A raw deflate encoder that reports where its flush points land.
pub struct DeflateWriter<W: Write> {
    inner: W,
    compress: Compress,
    buf: Vec<u8>,
    // (total_in, total_out) at the last flush point
    flush_point: (u64, u64),
}

impl<W: Write> std::fmt::Debug for DeflateWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Compress doesn't impl Debug
        f.debug_struct("DeflateWriter")
            .field("total_in", &self.compress.total_in())
            .field("total_out", &self.compress.total_out())
            .finish()
    }
}

impl<W: Write> DeflateWriter<W> {
    pub fn new(inner: W, level: u32) -> Self {
        DeflateWriter {
            inner,
            compress: Compress::new(Compression::new(level), false),
            buf: vec![0; OUTPUT_CHUNK],
            flush_point: (0, 0),
        }
    }

    fn deflate(&mut self, mut input: &[u8], flush: FlushCompress) -> io::Result<()> {
        loop {
            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();
            let status = self
                .compress
                .compress(input, &mut self.buf, flush)
                .map_err(io::Error::other)?;
            let consumed = (self.compress.total_in() - before_in) as usize;
            let produced = (self.compress.total_out() - before_out) as usize;

            self.inner.write_all(&self.buf[..produced])?;
            input = &input[consumed..];

            // the compressor is done once it leaves room in the output buffer
            if status == Status::StreamEnd || (input.is_empty() && produced < self.buf.len()) {
                return Ok(());
            }
        }
    }

    /// Ends the current deflate block so decompression can restart here.
    ///
    /// Returns the offset of the flush point in the compressed output.  Nothing is emitted if
    /// no data arrived since the previous flush point (or since the start).
    pub fn full_flush(&mut self) -> io::Result<u64> {
        if self.compress.total_in() != self.flush_point.0 {
            self.deflate(&[], FlushCompress::Full)?;
            self.flush_point = (self.compress.total_in(), self.compress.total_out());
        }
        Ok(self.flush_point.1)
    }

    /// Terminates the deflate stream and returns the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.deflate(&[], FlushCompress::Finish)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for DeflateWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.deflate(data, FlushCompress::None)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.deflate(&[], FlushCompress::Sync)?;
        self.inner.flush()
    }
}

/// A compressed archive written by [`DeflateWriter`].  Seek targets are offsets into the
/// compressed data, which must be flush points.
pub struct DeflateStream<R> {
    inner: BufReader<R>,
    decompress: Decompress,
    finished: bool,
}

impl<R> std::fmt::Debug for DeflateStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateStream")
            .field("total_in", &self.decompress.total_in())
            .field("total_out", &self.decompress.total_out())
            .field("finished", &self.finished)
            .finish()
    }
}

impl<R: Read + Seek> DeflateStream<R> {
    pub fn new(inner: R) -> Self {
        DeflateStream {
            inner: BufReader::new(inner),
            decompress: Decompress::new(false),
            finished: false,
        }
    }
}

impl<R: Read + Seek> TarStream for DeflateStream<R> {
    fn seek_to(&mut self, target: u64) -> io::Result<()> {
        // seeking a BufReader drops whatever it had buffered
        self.inner.seek(SeekFrom::Start(target))?;
        self.decompress.reset(false);
        self.finished = false;
        Ok(())
    }

    fn read_block(&mut self, block: &mut Block) -> io::Result<usize> {
        let mut filled = 0;

        while filled < block.len() && !self.finished {
            let input = self.inner.fill_buf()?;
            let eof = input.is_empty();
            let flush = if eof {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(input, &mut block[filled..], flush)
                .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;

            self.inner.consume(consumed);
            filled += produced;

            match status {
                Status::StreamEnd => self.finished = true,
                // truncated input: report what we have
                _ if eof && produced == 0 => break,
                _ => {}
            }
        }

        Ok(filled)
    }
}
