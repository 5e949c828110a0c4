//! Sequential byte cursor over the container input.
//!
//! The reader keeps a bounded lookahead in a [`BytesMut`] buffer. Bytes handed
//! out by [`BitstreamReader::take`] are frozen slices of that buffer, so
//! packets travel through the pipeline without being copied.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::{DemuxConfig, DemuxError, Result};

pub struct BitstreamReader<R> {
    inner: R,
    buffer: BytesMut,
    /// Absolute offset of `buffer[0]`
    position: u64,
    eof: bool,
    chunk_size: usize,
    max_lookahead: usize,
}

impl BitstreamReader<File> {
    /// Opens a container file read-only.
    pub fn open(path: impl AsRef<Path>, config: &DemuxConfig) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::new(file, config)
    }
}

impl<R: Read + Seek> BitstreamReader<R> {
    /// Wraps a seekable source. Offsets are absolute positions in the source.
    pub fn new(mut inner: R, config: &DemuxConfig) -> io::Result<Self> {
        let position = inner.stream_position()?;
        Ok(Self {
            inner,
            buffer: BytesMut::with_capacity(config.read_chunk_size),
            position,
            eof: false,
            chunk_size: config.read_chunk_size,
            max_lookahead: config.max_lookahead,
        })
    }

    /// Absolute offset of the next unread byte
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Unread bytes currently buffered
    #[inline]
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// True once the source is exhausted and the buffer is empty
    pub fn is_exhausted(&self) -> bool {
        self.eof && self.buffer.is_empty()
    }

    pub fn max_lookahead(&self) -> usize {
        self.max_lookahead
    }

    /// Buffers at least `want` bytes, or everything left in the source.
    ///
    /// Returns the number of buffered bytes, which is smaller than `want`
    /// only at the end of the input.
    pub fn fill(&mut self, want: usize) -> Result<usize> {
        if want > self.max_lookahead {
            return Err(DemuxError::Lookahead {
                requested: want,
                limit: self.max_lookahead,
            });
        }
        while self.buffer.len() < want && !self.eof {
            let start = self.buffer.len();
            let chunk = self.chunk_size.max(want - start);
            self.buffer.resize(start + chunk, 0);
            let read = loop {
                match self.inner.read(&mut self.buffer[start..]) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.buffer.truncate(start);
                        return Err(e.into());
                    }
                }
            };
            self.buffer.truncate(start + read);
            if read == 0 {
                trace!(position = self.position + start as u64, "end of input");
                self.eof = true;
            }
        }
        Ok(self.buffer.len())
    }

    /// Drops `n` buffered bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buffer.len());
        self.buffer.advance(n);
        self.position += n as u64;
    }

    /// Hands out `n` buffered bytes without copying.
    pub fn take(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buffer.len());
        self.position += n as u64;
        self.buffer.split_to(n).freeze()
    }

    /// Moves the cursor to an absolute offset, reusing buffered bytes when
    /// the target lies inside the lookahead.
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        let end = self.position + self.buffer.len() as u64;
        if offset >= self.position && offset <= end {
            self.consume((offset - self.position) as usize);
            return Ok(());
        }
        self.inner.seek(SeekFrom::Start(offset))?;
        self.buffer.clear();
        self.position = offset;
        self.eof = false;
        Ok(())
    }
}
