use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ChannelError, ChannelResult};

/// A logical output stream composed of non-contiguous in-memory chunks, for composing
///  multi-part packets (header + body + trailer) without copying the body.
///
/// Supports back-patched size labels: write a placeholder u32, write the sub-content,
///  then fix up the placeholder once the final size is known - no second pass over
///  the data.
pub struct ChunkedContent {
    chunks: Vec<Chunk>,
    open_labels: Vec<OpenLabel>,
}

enum Chunk {
    Owned(BytesMut),
    Shared(Bytes),
}
impl Chunk {
    fn len(&self) -> usize {
        match self {
            Chunk::Owned(b) => b.len(),
            Chunk::Shared(b) => b.len(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Owned(b) => b.as_ref(),
            Chunk::Shared(b) => b.as_ref(),
        }
    }
}

struct OpenLabel {
    chunk_index: usize,
    offset: usize,
    /// total content length right after the placeholder was written
    len_after_placeholder: u64,
}

impl Default for ChunkedContent {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedContent {
    pub fn new() -> ChunkedContent {
        ChunkedContent {
            chunks: Vec::new(),
            open_labels: Vec::new(),
        }
    }

    /// Total length across all chunks, without materializing a contiguous buffer.
    pub fn total_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.tail_mut().put_slice(bytes);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.tail_mut().put_u8(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.tail_mut().put_u32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.tail_mut().put_u64(value);
    }

    /// Adopt another stream's full content as one chunk, without copying it.
    pub fn append_stream(&mut self, content: Bytes) {
        self.chunks.push(Chunk::Shared(content));
    }

    /// Write a placeholder u32 size label; the matching [Self::end_size_label] patches
    ///  it with the number of bytes written in between. Labels nest.
    pub fn begin_size_label(&mut self) {
        let tail = self.tail_index();
        let offset = self.chunks[tail].len();
        self.tail_mut().put_u32(0);

        let len_after_placeholder = self.total_len();
        self.open_labels.push(OpenLabel {
            chunk_index: tail,
            offset,
            len_after_placeholder,
        });
    }

    pub fn end_size_label(&mut self) -> ChannelResult<()> {
        let label = self.open_labels.pop()
            .ok_or_else(|| ChannelError::logic("end_size_label without matching begin_size_label"))?;

        let content_len = self.total_len() - label.len_after_placeholder;
        if content_len > u32::MAX as u64 {
            return Err(ChannelError::TooLarge {
                size: content_len as usize,
                limit: u32::MAX as usize,
            });
        }

        match &mut self.chunks[label.chunk_index] {
            Chunk::Owned(buf) => {
                buf[label.offset..label.offset + 4].copy_from_slice(&(content_len as u32).to_be_bytes());
                Ok(())
            }
            Chunk::Shared(_) => Err(ChannelError::logic("size label points into a shared chunk")),
        }
    }

    /// The chunks in order, for vectored writes.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(|c| c.as_slice())
    }

    /// Materialize a contiguous buffer - the one copy, done only at the carrier boundary.
    pub fn freeze(self) -> ChannelResult<Bytes> {
        if !self.open_labels.is_empty() {
            return Err(ChannelError::logic("freezing content with an unclosed size label"));
        }

        let mut buf = BytesMut::with_capacity(self.total_len() as usize);
        for chunk in &self.chunks {
            buf.put_slice(chunk.as_slice());
        }
        Ok(buf.freeze())
    }

    fn tail_index(&mut self) -> usize {
        match self.chunks.last() {
            Some(Chunk::Owned(_)) => {}
            _ => self.chunks.push(Chunk::Owned(BytesMut::new())),
        }
        self.chunks.len() - 1
    }

    fn tail_mut(&mut self) -> &mut BytesMut {
        let idx = self.tail_index();
        match &mut self.chunks[idx] {
            Chunk::Owned(buf) => buf,
            Chunk::Shared(_) => unreachable!(),
        }
    }
}
