//! Common frame header and the bounds-checked little-endian cursor used by
//! every frame view.

use bytes::BufMut;

use super::error::{FrameError, FrameResult};

/// Encoded size of [`FrameHeader`].
pub const HEADER_SIZE: usize = 8 + 8 + 8 + 8 + 8 + 4 + 8;

/// Fields shared by every frame, encoded first and in this order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameHeader {
    /// Binding that originated the stream.
    pub origin_id: u64,
    /// Binding the stream is routed to.
    pub routed_id: u64,
    /// Stream id; the low bit marks the initial direction.
    pub stream_id: u64,
    /// Bytes reserved by the sender so far.
    pub sequence: u64,
    /// Bytes acknowledged by the receiver so far.
    pub acknowledge: u64,
    /// Window granted by the receiver.
    pub maximum: u32,
    /// Correlation id for tracing.
    pub trace_id: u64,
}

impl FrameHeader {
    /// Create a header for a stream with an empty window.
    #[must_use]
    pub fn new(origin_id: u64, routed_id: u64, stream_id: u64) -> Self {
        Self {
            origin_id,
            routed_id,
            stream_id,
            ..Self::default()
        }
    }

    /// Set the flow-control fields.
    #[must_use]
    pub fn with_flow(mut self, sequence: u64, acknowledge: u64, maximum: u32) -> Self {
        self.sequence = sequence;
        self.acknowledge = acknowledge;
        self.maximum = maximum;
        self
    }

    /// Set the trace id.
    #[must_use]
    pub fn with_trace(mut self, trace_id: u64) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Decode the header at the start of a frame region.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Malformed`] if the region is shorter than
    /// [`HEADER_SIZE`].
    pub fn peek(buffer: &[u8], offset: usize, limit: usize) -> FrameResult<Self> {
        let mut cursor = Cursor::new(buffer, offset, limit)?;
        cursor.header()
    }

    pub(crate) fn put(&self, out: &mut impl BufMut) {
        out.put_u64_le(self.origin_id);
        out.put_u64_le(self.routed_id);
        out.put_u64_le(self.stream_id);
        out.put_u64_le(self.sequence);
        out.put_u64_le(self.acknowledge);
        out.put_u32_le(self.maximum);
        out.put_u64_le(self.trace_id);
    }
}

/// Read cursor over `buffer[offset..limit]`.
pub(crate) struct Cursor<'a> {
    buffer: &'a [u8],
    position: usize,
    limit: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buffer: &'a [u8], offset: usize, limit: usize) -> FrameResult<Self> {
        if limit > buffer.len() || offset > limit {
            return Err(FrameError::Malformed {
                offset,
                needed: limit.saturating_sub(offset),
                limit: buffer.len(),
            });
        }
        Ok(Self {
            buffer,
            position: offset,
            limit,
        })
    }

    pub(crate) fn position(&self) -> usize {
        self.position
    }

    pub(crate) fn take(&mut self, needed: usize) -> FrameResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(needed)
            .filter(|end| *end <= self.limit)
            .ok_or(FrameError::Malformed {
                offset: self.position,
                needed,
                limit: self.limit,
            })?;
        let slice = &self.buffer[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> FrameResult<[u8; N]> {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(self.take(N)?);
        Ok(bytes)
    }

    pub(crate) fn u8(&mut self) -> FrameResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> FrameResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> FrameResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> FrameResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// Read a `u32` length prefix followed by that many bytes.
    pub(crate) fn payload(&mut self) -> FrameResult<&'a [u8]> {
        let length = self.u32()? as usize;
        self.take(length)
    }

    /// Read a `u16` length prefix followed by that many bytes.
    pub(crate) fn extension(&mut self) -> FrameResult<&'a [u8]> {
        let length = self.u16()? as usize;
        self.take(length)
    }

    pub(crate) fn header(&mut self) -> FrameResult<FrameHeader> {
        Ok(FrameHeader {
            origin_id: self.u64()?,
            routed_id: self.u64()?,
            stream_id: self.u64()?,
            sequence: self.u64()?,
            acknowledge: self.u64()?,
            maximum: self.u32()?,
            trace_id: self.u64()?,
        })
    }
}
