//! Terminal binding reflecting every payload back on the reply stream.

use bytes::BytesMut;
use serde::Deserialize;
use tracing::debug;

use super::contract::{BindingHandler, StreamHandler};
use super::error::StreamResult;
use super::half::{Inbound, Outbound};
use super::state::Transition;
use super::stream_id::reply_id;
use crate::engine::{EventKind, StreamContext};
use crate::frame::{Frame, BEGIN};

fn default_window() -> u32 {
    65536
}

/// Echo binding options.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EchoOptions {
    /// Window granted to the sender.
    #[serde(default = "default_window")]
    pub window: u32,
}

impl Default for EchoOptions {
    fn default() -> Self {
        Self {
            window: default_window(),
        }
    }
}

/// Echo server binding.
pub struct EchoBinding {
    binding_id: u64,
    options: EchoOptions,
}

impl EchoBinding {
    /// Create an echo binding.
    #[must_use]
    pub fn new(binding_id: u64, options: EchoOptions) -> Self {
        Self {
            binding_id,
            options,
        }
    }
}

impl BindingHandler for EchoBinding {
    fn new_stream(
        &self,
        type_id: u32,
        buffer: &[u8],
        ctx: &mut StreamContext<'_>,
    ) -> Option<Box<dyn StreamHandler>> {
        if type_id != BEGIN {
            return None;
        }
        let Ok(Frame::Begin(begin)) = Frame::decode(type_id, buffer) else {
            return None;
        };
        let header = begin.header;
        ctx.record(EventKind::StreamsOpened, self.binding_id, 1);

        Some(Box::new(EchoStream {
            binding_id: self.binding_id,
            window: self.options.window,
            inbound: Inbound::new(),
            outbound: Outbound::new(
                header.origin_id,
                header.routed_id,
                reply_id(header.stream_id),
                header.trace_id,
            ),
            pending: BytesMut::new(),
            end_pending: false,
        }))
    }
}

struct EchoStream {
    binding_id: u64,
    window: u32,
    inbound: Inbound,
    outbound: Outbound,
    pending: BytesMut,
    end_pending: bool,
}

impl EchoStream {
    fn drain(&mut self, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        let sent = self.outbound.drain(ctx, &mut self.pending)?;
        ctx.record(EventKind::BytesSent, self.binding_id, sent as u64);

        if self.pending.is_empty() && self.end_pending && self.outbound.is_open() {
            self.outbound.end(ctx)?;
        }
        self.acknowledge(ctx)
    }

    /// Acknowledge everything received except what is still buffered.
    fn acknowledge(&mut self, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        if !self.inbound.is_open() {
            return Ok(());
        }
        let ledger = self.inbound.ledger();
        let target = ledger
            .sequence()
            .saturating_sub(self.pending.len() as u64)
            .max(ledger.acknowledge());
        let consumed = target - ledger.acknowledge();
        if consumed > 0 {
            self.inbound.window(ctx, consumed, self.window)?;
        }
        Ok(())
    }

    fn on_request(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        if self.inbound.accept(frame)? == Transition::Drop {
            return Ok(());
        }
        match frame {
            Frame::Begin(_) => {
                self.outbound.begin(ctx, 0, 0, &[])?;
                self.inbound.window(ctx, 0, self.window)?;
            }
            Frame::Data(data) => {
                ctx.record(EventKind::BytesReceived, self.binding_id, data.payload.len() as u64);
                self.pending.extend_from_slice(data.payload);
                self.drain(ctx)?;
            }
            Frame::Flush(_) => self.drain(ctx)?,
            Frame::End(_) => {
                self.end_pending = true;
                self.drain(ctx)?;
            }
            Frame::Abort(_) => {
                self.pending.clear();
                self.outbound.abort(ctx);
            }
            _ => {}
        }
        Ok(())
    }

    fn on_reply_throttle(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        if self.outbound.on_throttle(frame)? == Transition::Drop {
            return Ok(());
        }
        match frame {
            Frame::Window(_) => self.drain(ctx)?,
            Frame::Reset(_) => {
                self.pending.clear();
                self.inbound.reset(ctx);
            }
            _ => {}
        }
        Ok(())
    }
}

impl StreamHandler for EchoStream {
    fn on_frame(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) {
        let result = if frame.is_throttle() {
            if frame.stream_id() == self.outbound.stream_id {
                self.on_reply_throttle(frame, ctx)
            } else {
                Ok(())
            }
        } else {
            self.on_request(frame, ctx)
        };

        if let Err(error) = result {
            debug!(
                binding = self.binding_id,
                stream = self.inbound.stream_id,
                error = %error,
                "Echo stream failed"
            );
            ctx.record(EventKind::Resets, self.binding_id, 1);
            self.pending.clear();
            self.inbound.reset(ctx);
            self.outbound.abort(ctx);
        }
    }

    fn on_budget_credit(&mut self, _budget_id: u64, ctx: &mut StreamContext<'_>) {
        if let Err(error) = self.drain(ctx) {
            debug!(binding = self.binding_id, error = %error, "Echo drain failed");
            self.inbound.reset(ctx);
            self.outbound.abort(ctx);
        }
    }

    fn is_closed(&self) -> bool {
        self.inbound.is_closed() && self.outbound.is_closed()
    }
}
