//! Traits every binding implements.

use crate::engine::StreamContext;
use crate::frame::Frame;

/// A configured binding, shared by every shard of a generation.
///
/// The worker calls [`BindingHandler::new_stream`] for a Begin whose
/// `routed_id` names this binding. By then the reply direction is already
/// registered back to the sender, so anything the handler writes on the reply
/// id reaches it.
pub trait BindingHandler: Send + Sync {
    /// Create the handler for a new stream, or `None` when the frame is not a
    /// usable Begin. The worker resets the stream on `None`.
    ///
    /// A route miss is not a `None`: the binding writes the Reset itself and
    /// returns a closed [`NoopStream`].
    fn new_stream(
        &self,
        type_id: u32,
        buffer: &[u8],
        ctx: &mut StreamContext<'_>,
    ) -> Option<Box<dyn StreamHandler>>;
}

/// Per-stream state machine living on one shard.
pub trait StreamHandler {
    /// Handle a frame for any stream id registered to this handler,
    /// including the Begin that created it.
    fn on_frame(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>);

    /// A budget this handler watched was credited.
    fn on_budget_credit(&mut self, _budget_id: u64, _ctx: &mut StreamContext<'_>) {}

    /// Whether the handler is finished and can be released.
    fn is_closed(&self) -> bool;
}

/// A handler that is already closed and ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStream;

impl StreamHandler for NoopStream {
    fn on_frame(&mut self, _frame: &Frame<'_>, _ctx: &mut StreamContext<'_>) {}

    fn is_closed(&self) -> bool {
        true
    }
}
