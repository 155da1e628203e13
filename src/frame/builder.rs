//! Staged frame builder writing into a caller-owned buffer.
//!
//! ```ignore
//! let mut buffer = [0u8; 256];
//! let (frame, length) = FrameBuilder::new(&mut buffer)
//!     .header(FrameHeader::new(origin, routed, stream))
//!     .data(data_flags::INIT | data_flags::FIN, 0, 5, b"hello")
//!     .build()?;
//! ```

use super::error::{FrameError, FrameResult};
use super::header::FrameHeader;
use super::types::{BeginFrame, ControlFrame, DataFrame, FlushFrame, Frame, SignalFrame, WindowFrame};

/// Entry stage: the destination buffer is known, the header is not.
pub struct FrameBuilder<'b> {
    buffer: &'b mut [u8],
    offset: usize,
}

impl<'b> FrameBuilder<'b> {
    /// Build at the start of `buffer`.
    pub fn new(buffer: &'b mut [u8]) -> Self {
        Self::at(buffer, 0)
    }

    /// Build at `offset` within `buffer`.
    pub fn at(buffer: &'b mut [u8], offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// Set the common header.
    pub fn header(self, header: FrameHeader) -> TailStage<'b> {
        TailStage {
            buffer: self.buffer,
            offset: self.offset,
            header,
        }
    }
}

/// Header stage: choose the frame type and its fixed fields.
pub struct TailStage<'b> {
    buffer: &'b mut [u8],
    offset: usize,
    header: FrameHeader,
}

impl<'b> TailStage<'b> {
    fn staged<'p>(self, frame: Frame<'p>) -> Staged<'b, 'p> {
        Staged {
            buffer: self.buffer,
            offset: self.offset,
            frame,
            extension: None,
        }
    }

    fn control<'p>(&self) -> ControlFrame<'p> {
        ControlFrame {
            header: self.header,
            extension: &[],
        }
    }

    /// Begin with authorization and affinity.
    pub fn begin<'p>(self, authorization: u64, affinity: u64) -> Staged<'b, 'p> {
        let frame = Frame::Begin(BeginFrame {
            header: self.header,
            authorization,
            affinity,
            extension: &[],
        });
        self.staged(frame)
    }

    /// Data carrying `payload`.
    pub fn data<'p>(self, flags: u8, budget_id: u64, reserved: u32, payload: &'p [u8]) -> Staged<'b, 'p> {
        let frame = Frame::Data(DataFrame {
            header: self.header,
            flags,
            budget_id,
            reserved,
            payload,
            extension: &[],
        });
        self.staged(frame)
    }

    /// End.
    pub fn end<'p>(self) -> Staged<'b, 'p> {
        let frame = Frame::End(self.control());
        self.staged(frame)
    }

    /// Abort.
    pub fn abort<'p>(self) -> Staged<'b, 'p> {
        let frame = Frame::Abort(self.control());
        self.staged(frame)
    }

    /// Reset.
    pub fn reset<'p>(self) -> Staged<'b, 'p> {
        let frame = Frame::Reset(self.control());
        self.staged(frame)
    }

    /// Challenge.
    pub fn challenge<'p>(self) -> Staged<'b, 'p> {
        let frame = Frame::Challenge(self.control());
        self.staged(frame)
    }

    /// Flush.
    pub fn flush<'p>(self, budget_id: u64, reserved: u32) -> Staged<'b, 'p> {
        let frame = Frame::Flush(FlushFrame {
            header: self.header,
            budget_id,
            reserved,
            extension: &[],
        });
        self.staged(frame)
    }

    /// Window.
    pub fn window<'p>(self, budget_id: u64, padding: u32, capabilities: u8) -> Staged<'b, 'p> {
        let frame = Frame::Window(WindowFrame {
            header: self.header,
            budget_id,
            padding,
            capabilities,
        });
        self.staged(frame)
    }

    /// Signal.
    pub fn signal<'p>(self, cancel_id: u64, signal_id: u32, context_id: u32, payload: &'p [u8]) -> Staged<'b, 'p> {
        let frame = Frame::Signal(SignalFrame {
            header: self.header,
            cancel_id,
            signal_id,
            context_id,
            payload,
        });
        self.staged(frame)
    }
}

/// Final stage: optional extension, then [`Staged::build`].
pub struct Staged<'b, 'p> {
    buffer: &'b mut [u8],
    offset: usize,
    frame: Frame<'p>,
    extension: Option<&'p [u8]>,
}

impl<'b, 'p> Staged<'b, 'p> {
    /// Attach an extension. Window and Signal frames have none; setting one
    /// makes [`Staged::build`] fail.
    #[must_use]
    pub fn extension(mut self, extension: &'p [u8]) -> Self {
        self.extension = Some(extension);
        self
    }

    /// Encode into the buffer and return a read-only view of the encoded bytes
    /// together with the encoded length.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Overflow`] if the buffer is too small and
    /// [`FrameError::InvalidExtension`] for an extension on a frame type that
    /// carries none.
    pub fn build(self) -> FrameResult<(Frame<'b>, usize)> {
        let mut frame = self.frame;
        let type_id = frame.type_id();
        if let Some(extension) = self.extension {
            match &mut frame {
                Frame::Begin(f) => f.extension = extension,
                Frame::Data(f) => f.extension = extension,
                Frame::Flush(f) => f.extension = extension,
                Frame::End(f) | Frame::Abort(f) | Frame::Reset(f) | Frame::Challenge(f) => {
                    f.extension = extension;
                }
                Frame::Window(_) | Frame::Signal(_) => {
                    return Err(FrameError::InvalidExtension {
                        message: format!("frame type {type_id:#x} has no extension"),
                    });
                }
            }
        }

        let length = frame.encode(self.buffer, self.offset)?;
        let buffer: &'b [u8] = self.buffer;
        let view = Frame::wrap(type_id, buffer, self.offset, self.offset + length)?;
        Ok((view, length))
    }
}
