//! Chunked framing — self-delimiting substreams for filter pipelines.
//!
//! A compressed or encrypted payload embedded in a larger object has no
//! knowable encoded length up front.  Chunking frames it so a filter stack
//! can be attached to a substream and torn down exactly at its end:
//!
//! ```text
//! <varint chunkLen> <chunkLen bytes>   (repeated)
//! <varint 0>                           (terminator)
//! ```
//!
//! [`ChunkedRead`] exposes a plain [`Read`] over the framed bytes; internal
//! state is the finite-state machine {ReadingHeader, ReadingBody(n), Done}.
//! Upstream EOF before the zero-length terminator is a format error.

use std::io::{self, Read, Write};

use crate::varint;

// ── Reader ───────────────────────────────────────────────────────────────────

enum State {
    ReadingHeader,
    ReadingBody(u64),
    Done,
}

pub struct ChunkedRead<R: Read> {
    inner: R,
    state: State,
}

impl<R: Read> ChunkedRead<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, state: State::ReadingHeader }
    }

    /// True once the zero-length terminator has been consumed.
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Unwrap the underlying reader.  The caller is responsible for having
    /// drained the substream first; remaining framed bytes stay unconsumed.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn next_header(&mut self) -> io::Result<()> {
        match varint::read_u64(&mut self.inner) {
            Ok(0) => {
                self.state = State::Done;
                Ok(())
            }
            Ok(n) => {
                self.state = State::ReadingBody(n);
                Ok(())
            }
            Err(e) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("chunked stream ended before terminator: {e}"),
            )),
        }
    }
}

impl<R: Read> Read for ChunkedRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.state {
                State::Done => return Ok(0),
                State::ReadingHeader => self.next_header()?,
                State::ReadingBody(remaining) => {
                    if buf.is_empty() {
                        return Ok(0);
                    }
                    let want = buf.len().min(remaining.min(usize::MAX as u64) as usize);
                    let got = self.inner.read(&mut buf[..want])?;
                    if got == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "chunk body truncated",
                        ));
                    }
                    let left = remaining - got as u64;
                    self.state = if left == 0 {
                        State::ReadingHeader
                    } else {
                        State::ReadingBody(left)
                    };
                    return Ok(got);
                }
            }
        }
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Frames each `write` call as one chunk.  [`ChunkedWrite::finish`] emits the
/// zero-length terminator; dropping without it leaves the stream unterminated.
pub struct ChunkedWrite<W: Write> {
    inner: W,
}

impl<W: Write> ChunkedWrite<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write the terminator and hand back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        varint::write_u64(&mut self.inner, 0)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ChunkedWrite<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        varint::write_u64(&mut self.inner, buf.len() as u64)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
