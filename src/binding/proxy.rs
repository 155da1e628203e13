//! Generic relay binding.
//!
//! A proxy stream joins two streams: the one it was opened on (upstream) and
//! one it opens towards the resolved exit (downstream). Stream frames are
//! relayed in their direction and throttle frames against it, with flow-control
//! fields untouched, so both sides see one continuous window.

use tracing::{debug, warn};

use super::contract::{BindingHandler, NoopStream, StreamHandler};
use super::error::StreamError;
use super::half::{Inbound, Outbound};
use super::state::Transition;
use super::stream_id::reply_id;
use crate::engine::{EventKind, StreamContext};
use crate::frame::{Frame, ProxyBeginEx, BEGIN};
use crate::route::RouteResolver;

/// Relay binding resolving each stream by its Begin hints.
pub struct ProxyBinding {
    binding_id: u64,
    resolver: RouteResolver,
}

impl ProxyBinding {
    /// Create a proxy binding.
    #[must_use]
    pub fn new(binding_id: u64, resolver: RouteResolver) -> Self {
        Self {
            binding_id,
            resolver,
        }
    }
}

impl BindingHandler for ProxyBinding {
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
        let hints = ProxyBeginEx::decode(begin.extension).ok()?;

        let route = self.resolver.resolve(
            begin.authorization,
            hints.authority.as_deref(),
            hints.alpn.as_deref(),
            hints.port,
        );
        let Some(route) = route else {
            debug!(
                binding = self.binding_id,
                stream = begin.header.stream_id,
                authority = ?hints.authority,
                alpn = ?hints.alpn,
                "No route for stream"
            );
            ctx.record(EventKind::RouteMisses, self.binding_id, 1);
            ctx.record(EventKind::Resets, self.binding_id, 1);
            let mut inbound = Inbound::new();
            if inbound.accept(&Frame::Begin(begin)).is_ok() {
                inbound.reset(ctx);
            }
            return Some(Box::new(NoopStream));
        };

        let header = begin.header;
        let downstream = ctx.supply_initial_id_with_affinity(route.exit, begin.affinity);
        ctx.record(EventKind::StreamsOpened, self.binding_id, 1);

        Some(Box::new(ProxyStream {
            binding_id: self.binding_id,
            up_in: Inbound::new(),
            up_out: Outbound::new(
                header.origin_id,
                header.routed_id,
                reply_id(header.stream_id),
                header.trace_id,
            ),
            down_out: Outbound::new(self.binding_id, route.exit, downstream, header.trace_id),
            down_in: Inbound::new(),
            failed: false,
        }))
    }
}

struct ProxyStream {
    binding_id: u64,
    up_in: Inbound,
    up_out: Outbound,
    down_out: Outbound,
    down_in: Inbound,
    failed: bool,
}

impl ProxyStream {
    fn fail(&mut self, ctx: &mut StreamContext<'_>, error: &StreamError) {
        warn!(
            binding = self.binding_id,
            stream = self.up_in.stream_id,
            error = %error,
            "Relay stopped"
        );
        if matches!(error, StreamError::FlowControlViolation(_)) {
            ctx.record(EventKind::FlowViolations, self.binding_id, 1);
        }
        ctx.record(EventKind::Resets, self.binding_id, 1);
        self.failed = true;
        self.up_in.reset(ctx);
        self.up_out.abort(ctx);
        self.down_out.abort(ctx);
        self.down_in.reset(ctx);
    }

    fn on_upstream(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> Result<(), StreamError> {
        if self.up_in.accept(frame)? == Transition::Drop {
            return Ok(());
        }
        if let Frame::Data(data) = frame {
            ctx.record(EventKind::BytesReceived, self.binding_id, data.payload.len() as u64);
        }
        self.down_out.relay(ctx, frame)
    }

    fn on_downstream(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> Result<(), StreamError> {
        if self.down_in.accept(frame)? == Transition::Drop {
            return Ok(());
        }
        if let Frame::Data(data) = frame {
            ctx.record(EventKind::BytesSent, self.binding_id, data.payload.len() as u64);
        }
        self.up_out.relay(ctx, frame)
    }

    fn on_downstream_throttle(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> Result<(), StreamError> {
        if self.down_out.on_throttle(frame)? == Transition::Drop {
            return Ok(());
        }
        match frame {
            Frame::Window(window) => self.up_in.relay_window(ctx, window)?,
            Frame::Reset(_) => self.up_in.reset(ctx),
            Frame::Challenge(_) => {
                let up = &self.up_in;
                ctx.write(&frame.with_ids(up.origin_id, up.routed_id, up.stream_id))?;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_upstream_throttle(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> Result<(), StreamError> {
        if self.up_out.on_throttle(frame)? == Transition::Drop {
            return Ok(());
        }
        match frame {
            Frame::Window(window) => self.down_in.relay_window(ctx, window)?,
            Frame::Reset(_) => self.down_in.reset(ctx),
            Frame::Challenge(_) => {
                let down = &self.down_in;
                ctx.write(&frame.with_ids(down.origin_id, down.routed_id, down.stream_id))?;
            }
            _ => {}
        }
        Ok(())
    }
}

impl StreamHandler for ProxyStream {
    fn on_frame(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) {
        if self.failed {
            return;
        }
        let stream_id = frame.stream_id();
        let throttle = frame.is_throttle();

        let result = if stream_id == self.up_out.stream_id && throttle {
            self.on_upstream_throttle(frame, ctx)
        } else if stream_id == self.down_out.stream_id && throttle {
            self.on_downstream_throttle(frame, ctx)
        } else if stream_id == reply_id(self.down_out.stream_id) && !throttle {
            self.on_downstream(frame, ctx)
        } else if !throttle {
            self.on_upstream(frame, ctx)
        } else {
            Ok(())
        };

        if let Err(error) = result {
            self.fail(ctx, &error);
        }
    }

    fn is_closed(&self) -> bool {
        self.failed
            || (self.up_in.is_closed()
                && self.up_out.is_closed()
                && self.down_out.is_closed()
                && self.down_in.is_closed())
    }
}
