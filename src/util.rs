use std::io::{BufRead, Error, ErrorKind, Read, Result};

/// Reads until the buffer is full or the reader hits EOF, retrying on EINTR.
///
/// Returns the number of bytes read, which is less than the length of the buffer only at EOF.
pub fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

/// This function reads the exact amount of bytes required to fill the buffer, possibly performing
/// multiple reads to do so (and also retrying if required to deal with EINTR).
///
/// Unlike [`Read::read_exact`], it's possible to tell an incomplete read (some bytes were read,
/// but the buffer wasn't filled) from a "clean" EOF where the stream ended before any data.
///
/// # Return value
///
///  - `Ok(true)` if the buffer was filled
///  - `Ok(false)` on a clean EOF
///  - an error with `ErrorKind::UnexpectedEof` if the stream ended part way through the buffer
///  - errors from the underlying reader are returned directly
pub fn read_exactish(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    match read_full(reader, buf)? {
        0 if !buf.is_empty() => Ok(false),
        n if n == buf.len() => Ok(true),
        _ => Err(Error::from(ErrorKind::UnexpectedEof)),
    }
}

/// Reads one `\n`-terminated line into `line`, replacing its previous contents.
///
/// Lines are raw bytes: filenames in an index need not be UTF-8.  The terminator is stripped; a
/// carriage return before it is kept.  Returns `Ok(false)` at EOF.
pub fn read_index_line(reader: &mut impl BufRead, line: &mut Vec<u8>) -> Result<bool> {
    line.clear();
    if reader.read_until(b'\n', line)? == 0 {
        return Ok(false);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    Ok(true)
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_read_exactish() {
        let read9 = |r: &mut &[u8]| read_exactish(r, &mut [0; 9]);

        // empty returns false immediately
        let mut r = b"" as &[u8];
        assert_eq!(read9(&mut r).unwrap(), false);
        assert_eq!(read9(&mut r).unwrap(), false); // repeatable

        // read one full buffer and then immediate EOF
        r = b"ninebytes";
        assert_eq!(read9(&mut r).unwrap(), true);
        assert_eq!(read9(&mut r).unwrap(), false);

        // read a full buffer and then fail on a partial one
        r = b"twelve bytes";
        assert_eq!(read9(&mut r).unwrap(), true);
        assert_eq!(read9(&mut r).unwrap_err().kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_read_full_short_reads() {
        // hands out at most three bytes per call, with an interruption in between
        struct Dribble<'a> {
            data: &'a [u8],
            interrupt: bool,
        }
        impl Read for Dribble<'_> {
            fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
                self.interrupt = !self.interrupt;
                if self.interrupt {
                    return Err(ErrorKind::Interrupted.into());
                }
                let n = buf.len().min(3).min(self.data.len());
                buf[..n].copy_from_slice(&self.data[..n]);
                self.data = &self.data[n..];
                Ok(n)
            }
        }

        let mut reader = Dribble {
            data: b"eleven byte",
            interrupt: false,
        };
        let mut buf = [0; 8];
        assert_eq!(read_full(&mut reader, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"eleven b");
        assert_eq!(read_full(&mut reader, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"yte");
        assert_eq!(read_full(&mut reader, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_read_full_broken_reader() {
        struct BrokenReader;
        impl Read for BrokenReader {
            fn read(&mut self, _buffer: &mut [u8]) -> Result<usize> {
                Err(ErrorKind::ConnectionReset.into())
            }
        }

        assert_eq!(
            read_full(&mut BrokenReader, &mut [0; 9]).unwrap_err().kind(),
            ErrorKind::ConnectionReset
        );
    }

    #[test]
    fn test_read_index_line() {
        let mut r = b"first\nsecond\r\n\ncaf\xe9\nlast" as &[u8];
        let mut line = b"stale".to_vec();
        let mut lines = vec![];
        while read_index_line(&mut r, &mut line).unwrap() {
            lines.push(line.clone());
        }
        assert_eq!(
            lines,
            [&b"first"[..], b"second\r", b"", b"caf\xe9", b"last"]
        );
        assert!(line.is_empty());
    }
}
