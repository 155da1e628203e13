//! Reader and writer ends of a half-stream.
//!
//! Bindings never build flow-control headers by hand: an [`Inbound`] tracks a
//! direction the binding reads and grants windows on it, an [`Outbound`]
//! tracks a direction the binding writes and stamps every frame with the
//! ledger's sequence and window.

use bytes::BytesMut;

use super::error::{StreamError, StreamResult};
use super::state::{HalfStream, Transition};
use crate::engine::StreamContext;
use crate::flow::FlowLedger;
use crate::frame::{
    BeginFrame, ControlFrame, DataFrame, FlushFrame, Frame, FrameError, FrameHeader, WindowFrame,
};

fn violation(stream_id: u64, frame: &Frame<'_>, half: &HalfStream) -> StreamError {
    StreamError::ProtocolViolation {
        stream_id,
        message: format!(
            "frame {:#x} not allowed in state {:?}",
            frame.type_id(),
            half.state()
        ),
    }
}

fn reserved_for(length: usize, padding: u32) -> StreamResult<u32> {
    let reserved = length as u64 + u64::from(padding);
    u32::try_from(reserved).map_err(|_| {
        StreamError::Malformed(FrameError::FieldTooLarge {
            field: "reserved",
            length: reserved as usize,
            max: u32::MAX as usize,
        })
    })
}

/// The end of a half-stream this binding reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inbound {
    /// Origin binding, from the Begin.
    pub origin_id: u64,
    /// Routed binding, from the Begin.
    pub routed_id: u64,
    /// Stream id being read.
    pub stream_id: u64,
    /// Trace id, from the Begin.
    pub trace_id: u64,
    half: HalfStream,
}

impl Inbound {
    /// Create an inbound end that has not seen Begin.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver ledger.
    #[must_use]
    pub fn ledger(&self) -> &FlowLedger {
        &self.half.ledger
    }

    /// Whether Begin was accepted and the direction is not closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.half.is_open()
    }

    /// Whether the direction is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.half.is_closed()
    }

    /// Check an arriving stream frame against the state machine and the
    /// receiver ledger.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ProtocolViolation`] for a frame the state does
    /// not allow and [`StreamError::FlowControlViolation`] for one that breaks
    /// the window.
    pub fn accept(&mut self, frame: &Frame<'_>) -> StreamResult<Transition> {
        match self.half.on_frame(frame.type_id()) {
            Transition::Accept => {}
            Transition::Drop => return Ok(Transition::Drop),
            Transition::Reject => {
                return Err(violation(frame.stream_id(), frame, &self.half));
            }
        }

        match frame {
            Frame::Begin(begin) => {
                let header = begin.header;
                self.origin_id = header.origin_id;
                self.routed_id = header.routed_id;
                self.stream_id = header.stream_id;
                self.trace_id = header.trace_id;
                self.half.ledger = FlowLedger::starting_at(header.sequence, header.sequence, 0);
            }
            Frame::Data(data) => {
                self.half.ledger.check_frame(data.header.sequence)?;
                self.half.ledger.on_data(u64::from(data.reserved))?;
            }
            Frame::Flush(flush) => {
                self.half.ledger.check_frame(flush.header.sequence)?;
                self.half.ledger.on_data(u64::from(flush.reserved))?;
            }
            _ => {}
        }
        Ok(Transition::Accept)
    }

    fn header(&self) -> FrameHeader {
        let ledger = &self.half.ledger;
        FrameHeader::new(self.origin_id, self.routed_id, self.stream_id)
            .with_flow(ledger.sequence(), ledger.acknowledge(), ledger.maximum())
            .with_trace(self.trace_id)
    }

    /// Grant a window and send it to the writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the grant regresses or shrinks below the bytes in
    /// flight, or if the Window frame cannot be written.
    pub fn grant(
        &mut self,
        ctx: &mut StreamContext<'_>,
        acknowledge: u64,
        maximum: u32,
        budget_id: u64,
        padding: u32,
        capabilities: u8,
    ) -> StreamResult<()> {
        if self.half.is_closed() {
            return Ok(());
        }
        self.half
            .ledger
            .on_window(acknowledge, maximum, budget_id, padding, capabilities)?;
        ctx.write(&Frame::Window(WindowFrame {
            header: self.header(),
            budget_id,
            padding,
            capabilities,
        }))?;
        Ok(())
    }

    /// Acknowledge `consumed` bytes and grant `maximum`, keeping the current
    /// budget and padding.
    ///
    /// # Errors
    ///
    /// See [`Inbound::grant`].
    pub fn window(
        &mut self,
        ctx: &mut StreamContext<'_>,
        consumed: u64,
        maximum: u32,
    ) -> StreamResult<()> {
        let ledger = self.half.ledger;
        self.grant(
            ctx,
            ledger.acknowledge().saturating_add(consumed),
            maximum,
            ledger.budget_id(),
            ledger.padding(),
            ledger.capabilities(),
        )
    }

    /// Pass on a window granted to the downstream writer of a relay.
    ///
    /// # Errors
    ///
    /// See [`Inbound::grant`].
    pub fn relay_window(
        &mut self,
        ctx: &mut StreamContext<'_>,
        window: &WindowFrame,
    ) -> StreamResult<()> {
        self.grant(
            ctx,
            window.header.acknowledge,
            window.header.maximum,
            window.budget_id,
            window.padding,
            window.capabilities,
        )
    }

    /// Reset the writer and close this direction. Only closes if Begin was
    /// never seen; does nothing once closed.
    pub fn reset(&mut self, ctx: &mut StreamContext<'_>) {
        if !self.half.is_open() {
            self.half.close();
            return;
        }
        self.half.close();
        let _ = ctx.write(&Frame::Reset(ControlFrame {
            header: self.header(),
            extension: &[],
        }));
    }
}

/// The end of a half-stream this binding writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Outbound {
    /// Origin binding stamped on every frame.
    pub origin_id: u64,
    /// Routed binding stamped on every frame.
    pub routed_id: u64,
    /// Stream id being written.
    pub stream_id: u64,
    /// Trace id stamped on every frame.
    pub trace_id: u64,
    half: HalfStream,
}

impl Outbound {
    /// Create an outbound end for `stream_id`.
    #[must_use]
    pub fn new(origin_id: u64, routed_id: u64, stream_id: u64, trace_id: u64) -> Self {
        Self {
            origin_id,
            routed_id,
            stream_id,
            trace_id,
            half: HalfStream::new(),
        }
    }

    /// Sender ledger.
    #[must_use]
    pub fn ledger(&self) -> &FlowLedger {
        &self.half.ledger
    }

    /// Whether Begin was sent and the direction is not closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.half.is_open()
    }

    /// Whether the direction is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.half.is_closed()
    }

    /// Payload bytes that may be sent now.
    #[must_use]
    pub fn sendable(&self, desired: u64) -> u64 {
        if self.half.is_open() {
            self.half.ledger.sendable(desired)
        } else {
            0
        }
    }

    fn header(&self) -> FrameHeader {
        let ledger = &self.half.ledger;
        FrameHeader::new(self.origin_id, self.routed_id, self.stream_id)
            .with_flow(ledger.sequence(), ledger.acknowledge(), ledger.maximum())
            .with_trace(self.trace_id)
    }

    fn advance(&mut self, frame: &Frame<'_>) -> StreamResult<bool> {
        match self.half.on_frame(frame.type_id()) {
            Transition::Accept => Ok(true),
            Transition::Drop => Ok(false),
            Transition::Reject => Err(violation(self.stream_id, frame, &self.half)),
        }
    }

    /// Open the direction.
    ///
    /// # Errors
    ///
    /// Returns an error if Begin was already sent or cannot be written.
    pub fn begin(
        &mut self,
        ctx: &mut StreamContext<'_>,
        authorization: u64,
        affinity: u64,
        extension: &[u8],
    ) -> StreamResult<()> {
        let frame = Frame::Begin(BeginFrame {
            header: self.header(),
            authorization,
            affinity,
            extension,
        });
        if self.advance(&frame)? {
            ctx.write(&frame)?;
        }
        Ok(())
    }

    /// Send a payload, reserving its length plus padding.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::FlowControlViolation`] if the payload does not
    /// fit the granted window; nothing is written in that case.
    pub fn data(
        &mut self,
        ctx: &mut StreamContext<'_>,
        flags: u8,
        payload: &[u8],
    ) -> StreamResult<()> {
        let reserved = reserved_for(payload.len(), self.half.ledger.padding())?;
        let frame = Frame::Data(DataFrame {
            header: self.header(),
            flags,
            budget_id: self.half.ledger.budget_id(),
            reserved,
            payload,
            extension: &[],
        });
        if !self.advance(&frame)? {
            return Ok(());
        }
        self.half.ledger.on_data(u64::from(reserved))?;
        ctx.write(&frame)?;
        Ok(())
    }

    /// Send as much of `pending` as the window and the shared budget allow,
    /// splitting it into Data frames. Watches the budget when it runs dry.
    /// Returns the payload bytes sent.
    ///
    /// # Errors
    ///
    /// Returns an error if a Data frame cannot be written.
    pub fn drain(&mut self, ctx: &mut StreamContext<'_>, pending: &mut BytesMut) -> StreamResult<usize> {
        let mut sent = 0;
        while !pending.is_empty() {
            let allowed = self.sendable(pending.len() as u64);
            if allowed == 0 {
                break;
            }
            let padding = u64::from(self.half.ledger.padding());
            let budget_id = self.half.ledger.budget_id();
            let claimed = ctx.claim_range(budget_id, padding + 1, allowed + padding);
            if claimed == 0 {
                ctx.watch_budget(budget_id);
                break;
            }

            let chunk = pending.split_to((claimed - padding) as usize);
            self.data(ctx, 0, &chunk)?;
            sent += chunk.len();
        }
        Ok(sent)
    }

    /// Ask the reader to flush.
    ///
    /// # Errors
    ///
    /// Returns an error if the direction is not open or the frame cannot be
    /// written.
    pub fn flush(&mut self, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        let frame = Frame::Flush(FlushFrame {
            header: self.header(),
            budget_id: self.half.ledger.budget_id(),
            reserved: 0,
            extension: &[],
        });
        if self.advance(&frame)? {
            ctx.write(&frame)?;
        }
        Ok(())
    }

    /// Close the direction gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if Begin was never sent.
    pub fn end(&mut self, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        let frame = Frame::End(ControlFrame {
            header: self.header(),
            extension: &[],
        });
        if self.advance(&frame)? {
            ctx.write(&frame)?;
        }
        Ok(())
    }

    /// Close the direction abruptly. Does nothing unless open.
    pub fn abort(&mut self, ctx: &mut StreamContext<'_>) {
        if !self.half.is_open() {
            self.half.close();
            return;
        }
        let frame = Frame::Abort(ControlFrame {
            header: self.header(),
            extension: &[],
        });
        self.half.close();
        let _ = ctx.write(&frame);
    }

    /// Forward a stream frame read elsewhere onto this direction, keeping its
    /// flow-control fields and rewriting only the routing ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame breaks this direction's state or window.
    pub fn relay(&mut self, ctx: &mut StreamContext<'_>, frame: &Frame<'_>) -> StreamResult<()> {
        if !self.advance(frame)? {
            return Ok(());
        }
        match frame {
            Frame::Begin(begin) => {
                let sequence = begin.header.sequence;
                self.half.ledger = FlowLedger::starting_at(sequence, sequence, 0);
            }
            Frame::Data(data) => {
                self.half.ledger.check_frame(data.header.sequence)?;
                self.half.ledger.on_data(u64::from(data.reserved))?;
            }
            Frame::Flush(flush) => {
                self.half.ledger.check_frame(flush.header.sequence)?;
                self.half.ledger.on_data(u64::from(flush.reserved))?;
            }
            _ => {}
        }
        ctx.write(&frame.with_ids(self.origin_id, self.routed_id, self.stream_id))?;
        Ok(())
    }

    /// Apply a throttle frame from the reader.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::FlowControlViolation`] for an invalid window.
    pub fn on_throttle(&mut self, frame: &Frame<'_>) -> StreamResult<Transition> {
        let transition = self.advance(frame)?;
        if !transition {
            return Ok(Transition::Drop);
        }
        if let Frame::Window(window) = frame {
            self.half.ledger.on_window(
                window.header.acknowledge,
                window.header.maximum,
                window.budget_id,
                window.padding,
                window.capabilities,
            )?;
        }
        Ok(Transition::Accept)
    }
}
