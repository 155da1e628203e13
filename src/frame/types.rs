//! Typed frame views.
//!
//! Views copy the fixed-size fields out of the buffer and borrow the
//! variable-length ones (payload, extension), so decoding never allocates.

use bytes::{BufMut, BytesMut};

use super::error::{FrameError, FrameResult};
use super::header::{Cursor, FrameHeader, HEADER_SIZE};
use super::{ABORT, BEGIN, CHALLENGE, DATA, END, FLUSH, RESET, SIGNAL, WINDOW};

const EXTENSION_MAX: usize = u16::MAX as usize;
const PAYLOAD_MAX: usize = u32::MAX as usize;

/// Opens a stream in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginFrame<'a> {
    /// Common header.
    pub header: FrameHeader,
    /// Caller authorization token, checked by route guards.
    pub authorization: u64,
    /// Shard affinity hint.
    pub affinity: u64,
    /// Binding-specific extension, see [`super::ProxyBeginEx`].
    pub extension: &'a [u8],
}

/// Carries payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFrame<'a> {
    /// Common header.
    pub header: FrameHeader,
    /// Bit set of [`super::data_flags`].
    pub flags: u8,
    /// Shared budget the bytes were debited from, or 0.
    pub budget_id: u64,
    /// Bytes of window this frame consumes (payload plus padding).
    pub reserved: u32,
    /// Payload bytes.
    pub payload: &'a [u8],
    /// Binding-specific extension.
    pub extension: &'a [u8],
}

/// Asks the receiver to flush buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushFrame<'a> {
    /// Common header.
    pub header: FrameHeader,
    /// Shared budget, or 0.
    pub budget_id: u64,
    /// Bytes of window this frame consumes.
    pub reserved: u32,
    /// Binding-specific extension.
    pub extension: &'a [u8],
}

/// Grants window to the sender of the opposite direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFrame {
    /// Common header; `acknowledge` and `maximum` carry the grant.
    pub header: FrameHeader,
    /// Shared budget the sender must debit, or 0.
    pub budget_id: u64,
    /// Per-frame overhead the sender must reserve.
    pub padding: u32,
    /// Capability bits advertised by the receiver.
    pub capabilities: u8,
}

/// Timer expiry or out-of-band notification delivered against a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFrame<'a> {
    /// Common header.
    pub header: FrameHeader,
    /// Cancellation token of the timer that fired.
    pub cancel_id: u64,
    /// Signal kind chosen by the scheduler of the timer.
    pub signal_id: u32,
    /// Extra context chosen by the scheduler.
    pub context_id: u32,
    /// Optional payload.
    pub payload: &'a [u8],
}

/// End, Abort, Reset and Challenge carry only an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame<'a> {
    /// Common header.
    pub header: FrameHeader,
    /// Binding-specific extension.
    pub extension: &'a [u8],
}

/// A decoded stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Stream open.
    Begin(BeginFrame<'a>),
    /// Payload.
    Data(DataFrame<'a>),
    /// Graceful close of one direction.
    End(ControlFrame<'a>),
    /// Abrupt close of one direction, sent by the writer.
    Abort(ControlFrame<'a>),
    /// Flush request.
    Flush(FlushFrame<'a>),
    /// Abrupt close of one direction, sent by the reader.
    Reset(ControlFrame<'a>),
    /// Window grant.
    Window(WindowFrame),
    /// Timer or notification.
    Signal(SignalFrame<'a>),
    /// Reader-to-writer challenge.
    Challenge(ControlFrame<'a>),
}

impl<'a> Frame<'a> {
    /// Decode a frame of `type_id` from `buffer[offset..limit]`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::UnknownType`] for an unknown type id and
    /// [`FrameError::Malformed`] when the header or any declared length runs
    /// past `limit`.
    pub fn wrap(type_id: u32, buffer: &'a [u8], offset: usize, limit: usize) -> FrameResult<Self> {
        let mut cursor = Cursor::new(buffer, offset, limit)?;
        if !super::is_known_type(type_id) {
            return Err(FrameError::UnknownType(type_id));
        }
        let header = cursor.header()?;

        let frame = match type_id {
            BEGIN => Frame::Begin(BeginFrame {
                header,
                authorization: cursor.u64()?,
                affinity: cursor.u64()?,
                extension: cursor.extension()?,
            }),
            DATA => Frame::Data(DataFrame {
                header,
                flags: cursor.u8()?,
                budget_id: cursor.u64()?,
                reserved: cursor.u32()?,
                payload: cursor.payload()?,
                extension: cursor.extension()?,
            }),
            FLUSH => Frame::Flush(FlushFrame {
                header,
                budget_id: cursor.u64()?,
                reserved: cursor.u32()?,
                extension: cursor.extension()?,
            }),
            WINDOW => Frame::Window(WindowFrame {
                header,
                budget_id: cursor.u64()?,
                padding: cursor.u32()?,
                capabilities: cursor.u8()?,
            }),
            SIGNAL => Frame::Signal(SignalFrame {
                header,
                cancel_id: cursor.u64()?,
                signal_id: cursor.u32()?,
                context_id: cursor.u32()?,
                payload: cursor.payload()?,
            }),
            END | ABORT | RESET | CHALLENGE => {
                let control = ControlFrame {
                    header,
                    extension: cursor.extension()?,
                };
                match type_id {
                    END => Frame::End(control),
                    ABORT => Frame::Abort(control),
                    RESET => Frame::Reset(control),
                    _ => Frame::Challenge(control),
                }
            }
            other => return Err(FrameError::UnknownType(other)),
        };

        debug_assert_eq!(cursor.position() - offset, frame.sizeof());
        Ok(frame)
    }

    /// Decode a frame occupying the whole of `buffer`.
    ///
    /// # Errors
    ///
    /// See [`Frame::wrap`].
    pub fn decode(type_id: u32, buffer: &'a [u8]) -> FrameResult<Self> {
        Self::wrap(type_id, buffer, 0, buffer.len())
    }

    /// Type id of this frame.
    #[must_use]
    pub fn type_id(&self) -> u32 {
        match self {
            Frame::Begin(_) => BEGIN,
            Frame::Data(_) => DATA,
            Frame::End(_) => END,
            Frame::Abort(_) => ABORT,
            Frame::Flush(_) => FLUSH,
            Frame::Reset(_) => RESET,
            Frame::Window(_) => WINDOW,
            Frame::Signal(_) => SIGNAL,
            Frame::Challenge(_) => CHALLENGE,
        }
    }

    /// Common header.
    #[must_use]
    pub fn header(&self) -> &FrameHeader {
        match self {
            Frame::Begin(f) => &f.header,
            Frame::Data(f) => &f.header,
            Frame::Flush(f) => &f.header,
            Frame::Window(f) => &f.header,
            Frame::Signal(f) => &f.header,
            Frame::End(f) | Frame::Abort(f) | Frame::Reset(f) | Frame::Challenge(f) => &f.header,
        }
    }

    fn header_mut(&mut self) -> &mut FrameHeader {
        match self {
            Frame::Begin(f) => &mut f.header,
            Frame::Data(f) => &mut f.header,
            Frame::Flush(f) => &mut f.header,
            Frame::Window(f) => &mut f.header,
            Frame::Signal(f) => &mut f.header,
            Frame::End(f) | Frame::Abort(f) | Frame::Reset(f) | Frame::Challenge(f) => {
                &mut f.header
            }
        }
    }

    /// Stream id from the header.
    #[must_use]
    pub fn stream_id(&self) -> u64 {
        self.header().stream_id
    }

    /// Whether the frame flows against the data direction.
    #[must_use]
    pub fn is_throttle(&self) -> bool {
        super::is_throttle(self.type_id())
    }

    /// Copy of this view with the routing ids replaced. Flow-control fields,
    /// payload and extension are kept as they are.
    #[must_use]
    pub fn with_ids(&self, origin_id: u64, routed_id: u64, stream_id: u64) -> Self {
        let mut copy = *self;
        let header = copy.header_mut();
        header.origin_id = origin_id;
        header.routed_id = routed_id;
        header.stream_id = stream_id;
        copy
    }

    /// Encoded length in bytes.
    #[must_use]
    pub fn sizeof(&self) -> usize {
        HEADER_SIZE
            + match self {
                Frame::Begin(f) => 8 + 8 + 2 + f.extension.len(),
                Frame::Data(f) => 1 + 8 + 4 + 4 + f.payload.len() + 2 + f.extension.len(),
                Frame::Flush(f) => 8 + 4 + 2 + f.extension.len(),
                Frame::Window(_) => 8 + 4 + 1,
                Frame::Signal(f) => 8 + 4 + 4 + 4 + f.payload.len(),
                Frame::End(f) | Frame::Abort(f) | Frame::Reset(f) | Frame::Challenge(f) => {
                    2 + f.extension.len()
                }
            }
    }

    fn check_lengths(&self) -> FrameResult<()> {
        let (payload, extension) = match self {
            Frame::Begin(f) => (0, f.extension.len()),
            Frame::Data(f) => (f.payload.len(), f.extension.len()),
            Frame::Flush(f) => (0, f.extension.len()),
            Frame::Window(_) => (0, 0),
            Frame::Signal(f) => (f.payload.len(), 0),
            Frame::End(f) | Frame::Abort(f) | Frame::Reset(f) | Frame::Challenge(f) => {
                (0, f.extension.len())
            }
        };
        if payload > PAYLOAD_MAX {
            return Err(FrameError::FieldTooLarge {
                field: "payload",
                length: payload,
                max: PAYLOAD_MAX,
            });
        }
        if extension > EXTENSION_MAX {
            return Err(FrameError::FieldTooLarge {
                field: "extension",
                length: extension,
                max: EXTENSION_MAX,
            });
        }
        Ok(())
    }

    /// Encode into a caller-owned buffer at `offset`, returning the number of
    /// bytes written. Nothing is written if the frame does not fit.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Overflow`] if `buffer[offset..]` is too small and
    /// [`FrameError::FieldTooLarge`] if a length prefix cannot hold a field.
    pub fn encode(&self, buffer: &mut [u8], offset: usize) -> FrameResult<usize> {
        self.check_lengths()?;
        let needed = self.sizeof();
        let capacity = buffer.len().saturating_sub(offset);
        if needed > capacity {
            return Err(FrameError::Overflow { needed, capacity });
        }
        let mut out = &mut buffer[offset..offset + needed];
        self.put(&mut out);
        Ok(needed)
    }

    /// Append the encoded frame to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::FieldTooLarge`] if a length prefix cannot hold a
    /// field.
    pub fn encode_to(&self, out: &mut BytesMut) -> FrameResult<usize> {
        self.check_lengths()?;
        let needed = self.sizeof();
        out.reserve(needed);
        self.put(out);
        Ok(needed)
    }

    fn put(&self, out: &mut impl BufMut) {
        self.header().put(out);
        match self {
            Frame::Begin(f) => {
                out.put_u64_le(f.authorization);
                out.put_u64_le(f.affinity);
                put_extension(out, f.extension);
            }
            Frame::Data(f) => {
                out.put_u8(f.flags);
                out.put_u64_le(f.budget_id);
                out.put_u32_le(f.reserved);
                out.put_u32_le(f.payload.len() as u32);
                out.put_slice(f.payload);
                put_extension(out, f.extension);
            }
            Frame::Flush(f) => {
                out.put_u64_le(f.budget_id);
                out.put_u32_le(f.reserved);
                put_extension(out, f.extension);
            }
            Frame::Window(f) => {
                out.put_u64_le(f.budget_id);
                out.put_u32_le(f.padding);
                out.put_u8(f.capabilities);
            }
            Frame::Signal(f) => {
                out.put_u64_le(f.cancel_id);
                out.put_u32_le(f.signal_id);
                out.put_u32_le(f.context_id);
                out.put_u32_le(f.payload.len() as u32);
                out.put_slice(f.payload);
            }
            Frame::End(f) | Frame::Abort(f) | Frame::Reset(f) | Frame::Challenge(f) => {
                put_extension(out, f.extension);
            }
        }
    }
}

fn put_extension(out: &mut impl BufMut, extension: &[u8]) {
    out.put_u16_le(extension.len() as u16);
    out.put_slice(extension);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FrameHeader {
        FrameHeader::new(0x11, 0x22, 0x33)
            .with_flow(600, 100, 1000)
            .with_trace(0xfeed)
    }

    fn encode(frame: &Frame<'_>) -> Vec<u8> {
        let mut buffer = vec![0u8; frame.sizeof()];
        let written = frame.encode(&mut buffer, 0).unwrap();
        assert_eq!(written, buffer.len());
        buffer
    }

    #[test]
    fn test_data_fidelity() {
        let payload = b"hello world";
        let frame = Frame::Data(DataFrame {
            header: header(),
            flags: 0x03,
            budget_id: 7,
            reserved: 11,
            payload,
            extension: &[],
        });
        let buffer = encode(&frame);
        let decoded = Frame::decode(DATA, &buffer).unwrap();

        assert_eq!(decoded, frame);
        let Frame::Data(data) = decoded else {
            panic!("expected data");
        };
        assert_eq!(data.header.sequence, 600);
        assert_eq!(data.header.maximum, 1000);
        assert_eq!(data.payload, b"hello world");
    }

    #[test]
    fn test_every_type_decodes_to_same_header() {
        let extension = [9u8, 8, 7];
        let frames = [
            Frame::Begin(BeginFrame {
                header: header(),
                authorization: 42,
                affinity: 3,
                extension: &extension,
            }),
            Frame::End(ControlFrame {
                header: header(),
                extension: &[],
            }),
            Frame::Abort(ControlFrame {
                header: header(),
                extension: &[],
            }),
            Frame::Reset(ControlFrame {
                header: header(),
                extension: &extension,
            }),
            Frame::Challenge(ControlFrame {
                header: header(),
                extension: &[],
            }),
            Frame::Flush(FlushFrame {
                header: header(),
                budget_id: 1,
                reserved: 0,
                extension: &[],
            }),
            Frame::Window(WindowFrame {
                header: header(),
                budget_id: 5,
                padding: 16,
                capabilities: 1,
            }),
            Frame::Signal(SignalFrame {
                header: header(),
                cancel_id: 77,
                signal_id: 2,
                context_id: 0,
                payload: b"x",
            }),
        ];

        for frame in frames {
            let buffer = encode(&frame);
            let decoded = Frame::decode(frame.type_id(), &buffer).unwrap();
            assert_eq!(decoded, frame, "type {:#x}", frame.type_id());
            assert_eq!(*decoded.header(), header());
        }
    }

    #[test]
    fn test_wrap_at_offset() {
        let frame = Frame::End(ControlFrame {
            header: header(),
            extension: &[],
        });
        let mut buffer = vec![0xAAu8; 10 + frame.sizeof() + 10];
        frame.encode(&mut buffer, 10).unwrap();

        let decoded = Frame::wrap(END, &buffer, 10, 10 + frame.sizeof()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let frame = Frame::Data(DataFrame {
            header: header(),
            flags: 0,
            budget_id: 0,
            reserved: 4,
            payload: b"abcd",
            extension: &[],
        });
        let buffer = encode(&frame);

        for cut in [0, HEADER_SIZE - 1, HEADER_SIZE + 5, buffer.len() - 1] {
            let result = Frame::wrap(DATA, &buffer, 0, cut);
            assert!(
                matches!(result, Err(FrameError::Malformed { .. })),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn test_oversized_declared_length_is_malformed() {
        let frame = Frame::Data(DataFrame {
            header: header(),
            flags: 0,
            budget_id: 0,
            reserved: 2,
            payload: b"ab",
            extension: &[],
        });
        let mut buffer = encode(&frame);
        let length_at = HEADER_SIZE + 1 + 8 + 4;
        buffer[length_at..length_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());

        assert!(matches!(
            Frame::decode(DATA, &buffer),
            Err(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn test_unknown_type() {
        let buffer = [0u8; 64];
        assert_eq!(
            Frame::decode(0x99, &buffer),
            Err(FrameError::UnknownType(0x99))
        );
    }

    #[test]
    fn test_encode_overflow_writes_nothing() {
        let frame = Frame::Window(WindowFrame {
            header: header(),
            budget_id: 0,
            padding: 0,
            capabilities: 0,
        });
        let mut buffer = vec![0u8; frame.sizeof() - 1];
        let result = frame.encode(&mut buffer, 0);

        assert!(matches!(result, Err(FrameError::Overflow { .. })));
        assert!(buffer.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_with_ids_keeps_flow_fields() {
        let frame = Frame::Window(WindowFrame {
            header: header(),
            budget_id: 0,
            padding: 0,
            capabilities: 0,
        });
        let moved = frame.with_ids(1, 2, 3);

        assert_eq!(moved.header().stream_id, 3);
        assert_eq!(moved.header().acknowledge, 100);
        assert_eq!(moved.header().maximum, 1000);
        assert_eq!(moved.header().trace_id, 0xfeed);
    }

    #[test]
    fn test_encode_to_appends() {
        let frame = Frame::End(ControlFrame {
            header: header(),
            extension: &[],
        });
        let mut out = BytesMut::new();
        frame.encode_to(&mut out).unwrap();
        frame.encode_to(&mut out).unwrap();

        assert_eq!(out.len(), frame.sizeof() * 2);
        let second = Frame::wrap(END, &out, frame.sizeof(), out.len()).unwrap();
        assert_eq!(second, frame);
    }
}
