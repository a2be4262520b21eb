use std::cmp::min;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::error::{ChannelError, ChannelResult};

/// Self-delimiting sub-stream framing used to pack several logical messages into one
///  physical packet:
/// ```ascii
/// 0: marker (u8): 0 = another message follows, non-zero = end of labelled sequence
/// 1: payload length (u32 BE) - only present after a zero marker
/// 5: payload bytes
/// ```
/// Entries repeat until the terminal marker. A zero-length payload is legal (it is
///  how pings travel), the decoder treats it as a regular entry.
pub const MARKER_CONTINUE: u8 = 0;
pub const MARKER_END: u8 = 1;

pub fn write_entry(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u8(MARKER_CONTINUE);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

pub fn write_end(buf: &mut BytesMut) {
    buf.put_u8(MARKER_END);
}

pub fn encode<'a>(payloads: impl IntoIterator<Item = &'a [u8]>) -> BytesMut {
    let mut buf = BytesMut::new();
    for payload in payloads {
        write_entry(&mut buf, payload);
    }
    write_end(&mut buf);
    buf
}

/// Reads labelled entries from a buffer, stopping at the first non-zero marker and
///  never reading past a declared payload length.
pub struct LabelledReader<B> {
    inner: B,
    finished: bool,
}

impl<B: Buf> LabelledReader<B> {
    pub fn new(inner: B) -> LabelledReader<B> {
        LabelledReader {
            inner,
            finished: false,
        }
    }

    /// The next payload, or `None` once the end marker was consumed.
    pub fn next_entry(&mut self) -> ChannelResult<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }

        let marker = self.inner.try_get_u8()
            .map_err(|_| ChannelError::incorrect_data("truncated labelled stream: missing marker"))?;
        if marker != MARKER_CONTINUE {
            self.finished = true;
            return Ok(None);
        }

        let declared_len = self.inner.try_get_u32()
            .map_err(|_| ChannelError::incorrect_data("truncated labelled stream: missing length"))?
            as usize;

        if declared_len > self.inner.remaining() {
            // the peer truncated mid-message - distinct from a clean close between messages
            return Err(ChannelError::IncorrectData {
                detail: format!(
                    "labelled entry declares {} bytes, only {} available",
                    declared_len,
                    self.inner.remaining()
                ),
            });
        }

        Ok(Some(self.inner.copy_to_bytes(declared_len)))
    }

    /// Collect all remaining entries, in encoding order.
    pub fn read_all(&mut self) -> ChannelResult<Vec<Bytes>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

/// A view of at most `limit` bytes of an underlying buffer. Reads beyond the limit
///  see end-of-stream even if the transport has more bytes buffered behind it.
pub struct DelimitedReader<'a, B> {
    inner: &'a mut B,
    remaining: usize,
}

impl<'a, B: Buf> DelimitedReader<'a, B> {
    pub fn new(inner: &'a mut B, limit: usize) -> DelimitedReader<'a, B> {
        DelimitedReader {
            inner,
            remaining: limit,
        }
    }

    /// Bytes of the delimited window not consumed yet.
    pub fn unconsumed(&self) -> usize {
        self.remaining
    }

    /// Discard whatever is left of the window, leaving the underlying buffer
    ///  positioned after it.
    pub fn skip_rest(&mut self) {
        let n = min(self.remaining, self.inner.remaining());
        self.inner.advance(n);
        self.remaining = 0;
    }
}

impl<B: Buf> Buf for DelimitedReader<'_, B> {
    fn remaining(&self) -> usize {
        min(self.remaining, self.inner.remaining())
    }

    fn chunk(&self) -> &[u8] {
        let chunk = self.inner.chunk();
        &chunk[..min(chunk.len(), self.remaining)]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.remaining, "advancing past the delimited window");
        self.inner.advance(cnt);
        self.remaining -= cnt;
    }
}
