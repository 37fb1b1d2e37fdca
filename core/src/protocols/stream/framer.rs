//! Buffered framing helpers over a [Reader].

use super::DissectError;
use crate::stream::reader::Reader;

use memchr::memchr;
use tokio::io::AsyncReadExt;

/// Bytes requested from the reader per fill.
const READ_SIZE: usize = 4096;

/// Accumulates reader data for parsers that need to look ahead.
#[derive(Debug)]
pub(crate) struct Framer<'r> {
    reader: &'r mut Reader,
    buf: Vec<u8>,
}

impl<'r> Framer<'r> {
    pub(crate) fn new(reader: &'r mut Reader) -> Self {
        Framer {
            reader,
            buf: Vec::with_capacity(READ_SIZE),
        }
    }

    pub(crate) fn reader(&mut self) -> &mut Reader {
        &mut *self.reader
    }

    /// Bytes read but not consumed yet.
    pub(crate) fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Appends the next available bytes. Fails with [DissectError::Eof] once the reader ends.
    pub(crate) async fn fill(&mut self) -> Result<(), DissectError> {
        let start = self.buf.len();
        self.buf.resize(start + READ_SIZE, 0);
        match self.reader.read(&mut self.buf[start..]).await {
            Ok(0) => {
                self.buf.truncate(start);
                Err(DissectError::Eof)
            }
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(())
            }
            Err(error) => {
                self.buf.truncate(start);
                Err(error.into())
            }
        }
    }

    /// Buffers at least `len` bytes.
    pub(crate) async fn fill_to(&mut self, len: usize) -> Result<(), DissectError> {
        while self.buf.len() < len {
            self.fill().await?;
        }
        Ok(())
    }

    pub(crate) fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    /// Consumes and returns the next `n` bytes.
    pub(crate) async fn take(&mut self, n: usize) -> Result<Vec<u8>, DissectError> {
        self.fill_to(n).await?;
        Ok(self.buf.drain(..n).collect())
    }

    /// Consumes the next line and returns it without its line terminator. Fails with
    /// [DissectError::Malformed] once `max` bytes are buffered without a line feed.
    pub(crate) async fn read_line(
        &mut self,
        max: usize,
        malformed: impl Fn(&str) -> DissectError,
    ) -> Result<Vec<u8>, DissectError> {
        loop {
            if let Some(pos) = memchr(b'\n', &self.buf) {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(line);
            }
            if self.buf.len() > max {
                return Err(malformed("line too long"));
            }
            self.fill().await?;
        }
    }

    /// Consumes the next `n` bytes, appending them to `captured` while it holds less than `cap`
    /// bytes.
    pub(crate) async fn read_body(
        &mut self,
        n: usize,
        cap: usize,
        captured: &mut Vec<u8>,
    ) -> Result<(), DissectError> {
        let mut remaining = n;
        while remaining > 0 {
            if self.buf.is_empty() {
                self.fill().await?;
            }
            let step = remaining.min(self.buf.len());
            let room = cap.saturating_sub(captured.len()).min(step);
            captured.extend_from_slice(&self.buf[..room]);
            self.consume(step);
            remaining -= step;
        }
        Ok(())
    }

    /// Consumes everything up to the end of the reader, capturing up to `cap` bytes. Returns the
    /// number of bytes consumed.
    pub(crate) async fn read_to_end(&mut self, cap: usize, captured: &mut Vec<u8>) -> usize {
        let mut total = 0;
        loop {
            let step = self.buf.len();
            let room = cap.saturating_sub(captured.len()).min(step);
            captured.extend_from_slice(&self.buf[..room]);
            self.consume(step);
            total += step;
            if self.fill().await.is_err() {
                return total;
            }
        }
    }
}
