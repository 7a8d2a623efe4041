//! The medium boundary.
//!
//! A medium supplies bytes to the decode pipeline on demand; it owns no
//! decode state of its own. [`SliceMedium`] and [`ReaderMedium`] are the
//! crate's concrete, testable implementations: a thin cursor wrapper over
//! an in-memory buffer and over any `Read + Seek` source, respectively,
//! generalized to a pull-based, possibly-suspending contract.

use crate::traceclass::StreamId;
use bytes::Bytes;
use std::io::{self, Read, Seek, SeekFrom};

/// Outcome of [`Medium::request_bytes`].
pub enum RequestOutcome {
    /// `size` bytes (possibly fewer than asked for) are available.
    Data(Bytes),
    /// The medium has no more bytes, now or ever, at the current position.
    Eof,
}

/// An opaque handle identifying which stream subsequent reads belong to,
/// returned by [`Medium::borrow_stream`]. The message iterator never
/// inspects it; it only threads it back into medium calls.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct StreamHandle(pub StreamId);

/// The byte-supply contract the message iterator and BFCR are built
/// against. All methods are synchronous and pull-based: a medium blocks
/// (or buffers internally) rather than suspending, which is why the async
/// story is a `Decoder` wrapper layered outside this trait, not a change
/// to it.
pub trait Medium {
    /// Returns up to `max_size` bytes starting at the current position,
    /// advancing the medium's internal cursor by however many bytes are
    /// actually returned. Returned buffers remain valid and unmodified
    /// until the next call (the contract `Bytes`'s immutability gives us
    /// for free).
    fn request_bytes(&mut self, max_size: usize) -> io::Result<RequestOutcome>;

    /// Repositions the medium to an absolute byte offset, if supported.
    fn seek(&mut self, _offset_bytes: u64) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "medium does not support seeking"))
    }

    /// Advances past any inter-packet padding to the start of the next
    /// packet, if the medium has an opinion about packet boundaries beyond
    /// what the content/total size fields already say.
    fn switch_packet(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn borrow_stream(&mut self, stream_id: StreamId) -> StreamHandle {
        StreamHandle(stream_id)
    }

    fn can_seek_beginning(&self) -> bool {
        false
    }
}

/// A medium over an in-memory byte buffer. The common case for tests and
/// for callers who have already mapped or read a whole trace file.
#[derive(Clone, Debug)]
pub struct SliceMedium {
    buf: Bytes,
    cursor: usize,
}

impl SliceMedium {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self { buf: buf.into(), cursor: 0 }
    }
}

impl Medium for SliceMedium {
    fn request_bytes(&mut self, max_size: usize) -> io::Result<RequestOutcome> {
        if self.cursor >= self.buf.len() {
            return Ok(RequestOutcome::Eof);
        }
        let end = (self.cursor + max_size).min(self.buf.len());
        let slice = self.buf.slice(self.cursor..end);
        self.cursor = end;
        Ok(RequestOutcome::Data(slice))
    }

    fn seek(&mut self, offset_bytes: u64) -> io::Result<()> {
        self.cursor = (offset_bytes as usize).min(self.buf.len());
        Ok(())
    }

    fn can_seek_beginning(&self) -> bool {
        true
    }
}

/// A medium over any [`Read`] + [`Seek`] source, reading into a
/// heap-allocated scratch buffer and handing out owned `Bytes` copies.
/// Unlike [`SliceMedium`], successive calls allocate, the tradeoff made
/// for the sake of supporting arbitrary readers rather than only
/// in-memory slices.
pub struct ReaderMedium<R> {
    inner: R,
}

impl<R: Read + Seek> ReaderMedium<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read + Seek> Medium for ReaderMedium<R> {
    fn request_bytes(&mut self, max_size: usize) -> io::Result<RequestOutcome> {
        let mut scratch = vec![0u8; max_size];
        let mut total = 0;
        while total < max_size {
            match self.inner.read(&mut scratch[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if total == 0 {
            return Ok(RequestOutcome::Eof);
        }
        scratch.truncate(total);
        Ok(RequestOutcome::Data(Bytes::from(scratch)))
    }

    fn seek(&mut self, offset_bytes: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset_bytes))?;
        Ok(())
    }

    fn can_seek_beginning(&self) -> bool {
        true
    }
}
