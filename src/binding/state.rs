//! Half-stream lifecycle.

use crate::flow::FlowLedger;
use crate::frame::{ABORT, BEGIN, CHALLENGE, DATA, END, FLUSH, RESET, SIGNAL, WINDOW};

/// Lifecycle of one direction of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HalfStreamState {
    /// Begin not yet seen.
    #[default]
    Idle,
    /// Begin seen, End/Abort/Reset not yet.
    Open,
    /// Terminal.
    Closed,
}

/// What to do with a frame given the half-stream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Process the frame.
    Accept,
    /// Protocol violation; the stream must be reset.
    Reject,
    /// Ignore silently.
    Drop,
}

/// One direction of a stream: its state plus its flow-control ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HalfStream {
    state: HalfStreamState,
    /// Sequence, acknowledge and window of this direction.
    pub ledger: FlowLedger,
}

impl HalfStream {
    /// Create an idle half-stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> HalfStreamState {
        self.state
    }

    /// Whether Begin has been seen and the half is not closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == HalfStreamState::Open
    }

    /// Whether the half is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == HalfStreamState::Closed
    }

    /// Force the half closed.
    pub fn close(&mut self) {
        self.state = HalfStreamState::Closed;
    }

    /// Apply a frame of `type_id` to the state machine.
    pub fn on_frame(&mut self, type_id: u32) -> Transition {
        use HalfStreamState::{Closed, Idle, Open};

        match (self.state, type_id) {
            (Closed, _) => Transition::Drop,
            (Idle, BEGIN) => {
                self.state = Open;
                Transition::Accept
            }
            (_, BEGIN) => Transition::Reject,
            (Open, DATA | FLUSH) => Transition::Accept,
            (Open, END | ABORT) => {
                self.state = Closed;
                Transition::Accept
            }
            (Idle, DATA | END | FLUSH | ABORT) => Transition::Reject,
            (_, RESET) => {
                self.state = Closed;
                Transition::Accept
            }
            (Open, WINDOW | CHALLENGE | SIGNAL) => Transition::Accept,
            (Idle, SIGNAL) => Transition::Accept,
            _ => Transition::Drop,
        }
    }
}
