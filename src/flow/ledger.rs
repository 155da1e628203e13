//! Per half-stream flow-control ledger.

use super::error::{FlowError, FlowResult};

/// Sequence, acknowledge and window state for one direction of a stream.
///
/// The same ledger is kept on both ends: the writer uses it to decide how much
/// it may send, the reader uses it to check what arrives and to compute the
/// windows it grants. After every accepted call
/// `0 <= sequence - acknowledge <= maximum` holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowLedger {
    sequence: u64,
    acknowledge: u64,
    maximum: u32,
    budget_id: u64,
    padding: u32,
    capabilities: u8,
}

impl FlowLedger {
    /// Create a ledger with no window.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ledger starting from the flow fields of a Begin header.
    /// `acknowledge` is clamped into `[sequence - maximum, sequence]`.
    #[must_use]
    pub fn starting_at(sequence: u64, acknowledge: u64, maximum: u32) -> Self {
        let floor = sequence.saturating_sub(u64::from(maximum));
        Self {
            sequence,
            acknowledge: acknowledge.min(sequence).max(floor),
            maximum,
            ..Self::default()
        }
    }

    /// Bytes reserved so far.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Bytes acknowledged so far.
    #[must_use]
    pub fn acknowledge(&self) -> u64 {
        self.acknowledge
    }

    /// Granted window.
    #[must_use]
    pub fn maximum(&self) -> u32 {
        self.maximum
    }

    /// Shared budget the writer debits, or 0.
    #[must_use]
    pub fn budget_id(&self) -> u64 {
        self.budget_id
    }

    /// Per-frame overhead.
    #[must_use]
    pub fn padding(&self) -> u32 {
        self.padding
    }

    /// Capability bits from the last window.
    #[must_use]
    pub fn capabilities(&self) -> u8 {
        self.capabilities
    }

    /// Bytes sent but not yet acknowledged.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.sequence - self.acknowledge
    }

    /// Window left before padding is taken into account.
    #[must_use]
    pub fn available(&self) -> u64 {
        u64::from(self.maximum).saturating_sub(self.pending())
    }

    /// Whether nothing more can be sent until the next window.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.sendable(u64::MAX) == 0
    }

    /// Bytes of payload that may be sent now:
    /// `min(desired, maximum - (sequence - acknowledge) - padding)`, floored at 0.
    #[must_use]
    pub fn sendable(&self, desired: u64) -> u64 {
        self.available()
            .saturating_sub(u64::from(self.padding))
            .min(desired)
    }

    /// Record `reserved` bytes as sent. The ledger is unchanged on failure.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::WindowExceeded`] if the reservation would put
    /// more than `maximum` bytes in flight.
    pub fn on_data(&mut self, reserved: u64) -> FlowResult<()> {
        let sequence = self
            .sequence
            .checked_add(reserved)
            .filter(|next| next - self.acknowledge <= u64::from(self.maximum))
            .ok_or(FlowError::WindowExceeded {
                sequence: self.sequence,
                acknowledge: self.acknowledge,
                maximum: self.maximum,
                reserved,
            })?;
        self.sequence = sequence;
        Ok(())
    }

    /// Check that an arriving frame continues this ledger.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::SequenceMismatch`] if `sequence` differs from the
    /// tracked sequence.
    pub fn check_frame(&self, sequence: u64) -> FlowResult<()> {
        if sequence != self.sequence {
            return Err(FlowError::SequenceMismatch {
                expected: self.sequence,
                actual: sequence,
            });
        }
        Ok(())
    }

    /// Apply a window grant. The ledger is unchanged on failure.
    ///
    /// # Errors
    ///
    /// Returns an error if `acknowledge` moves backwards or past `sequence`, or
    /// if `maximum` is smaller than the bytes still in flight.
    pub fn on_window(
        &mut self,
        acknowledge: u64,
        maximum: u32,
        budget_id: u64,
        padding: u32,
        capabilities: u8,
    ) -> FlowResult<()> {
        if acknowledge < self.acknowledge {
            return Err(FlowError::AcknowledgeRegressed {
                current: self.acknowledge,
                proposed: acknowledge,
            });
        }
        if acknowledge > self.sequence {
            return Err(FlowError::AcknowledgeAhead {
                acknowledge,
                sequence: self.sequence,
            });
        }
        let outstanding = self.sequence - acknowledge;
        if outstanding > u64::from(maximum) {
            return Err(FlowError::WindowShrunk {
                outstanding,
                maximum,
            });
        }

        self.acknowledge = acknowledge;
        self.maximum = maximum;
        self.budget_id = budget_id;
        self.padding = padding;
        self.capabilities = capabilities;
        Ok(())
    }

    /// Acknowledge `consumed` more bytes keeping the current window size, as a
    /// reader does before sending a Window. Returns the new acknowledge.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::AcknowledgeAhead`] if more bytes are consumed than
    /// were received.
    pub fn consume(&mut self, consumed: u64) -> FlowResult<u64> {
        let acknowledge = self.acknowledge.saturating_add(consumed);
        self.on_window(
            acknowledge,
            self.maximum,
            self.budget_id,
            self.padding,
            self.capabilities,
        )?;
        Ok(self.acknowledge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(maximum: u32) -> FlowLedger {
        let mut ledger = FlowLedger::new();
        ledger.on_window(0, maximum, 0, 0, 0).unwrap();
        ledger
    }

    #[test]
    fn test_window_exceeded() {
        let mut ledger = granted(1000);

        ledger.on_data(600).unwrap();
        assert_eq!(ledger.sequence(), 600);

        let error = ledger.on_data(600).unwrap_err();
        assert!(matches!(error, FlowError::WindowExceeded { reserved: 600, .. }));
        assert_eq!(ledger.sequence(), 600);
    }

    #[test]
    fn test_window_reopens_after_acknowledge() {
        let mut ledger = granted(1000);
        ledger.on_data(1000).unwrap();
        assert!(ledger.is_exhausted());

        ledger.on_window(400, 1000, 0, 0, 0).unwrap();
        assert_eq!(ledger.sendable(u64::MAX), 400);
        ledger.on_data(400).unwrap();
        assert_eq!(ledger.pending(), 1000);
    }

    #[test]
    fn test_sendable_accounts_for_padding() {
        let mut ledger = FlowLedger::new();
        ledger.on_window(0, 100, 3, 10, 0).unwrap();

        assert_eq!(ledger.sendable(500), 90);
        assert_eq!(ledger.sendable(20), 20);
        assert_eq!(ledger.budget_id(), 3);

        ledger.on_data(95).unwrap();
        assert_eq!(ledger.sendable(500), 0);
    }

    #[test]
    fn test_window_rejections_leave_ledger_unchanged() {
        let mut ledger = granted(100);
        ledger.on_data(80).unwrap();
        ledger.on_window(50, 100, 0, 0, 0).unwrap();
        let before = ledger;

        assert!(matches!(
            ledger.on_window(40, 100, 0, 0, 0),
            Err(FlowError::AcknowledgeRegressed { .. })
        ));
        assert!(matches!(
            ledger.on_window(90, 100, 0, 0, 0),
            Err(FlowError::AcknowledgeAhead { .. })
        ));
        assert!(matches!(
            ledger.on_window(50, 20, 0, 0, 0),
            Err(FlowError::WindowShrunk { outstanding: 30, .. })
        ));
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_check_frame() {
        let mut ledger = granted(10);
        ledger.check_frame(0).unwrap();
        ledger.on_data(4).unwrap();
        assert!(ledger.check_frame(0).is_err());
        ledger.check_frame(4).unwrap();
    }

    #[test]
    fn test_consume() {
        let mut ledger = granted(10);
        ledger.on_data(6).unwrap();
        assert_eq!(ledger.consume(6).unwrap(), 6);
        assert_eq!(ledger.available(), 10);
        assert!(ledger.consume(1).is_err());
    }

    #[test]
    fn test_starting_at_clamps_into_window() {
        let ledger = FlowLedger::starting_at(100, 0, 30);
        assert_eq!(ledger.acknowledge(), 70);
        assert_eq!(ledger.pending(), 30);

        let ledger = FlowLedger::starting_at(100, 150, 30);
        assert_eq!(ledger.acknowledge(), 100);
        assert_eq!(ledger.pending(), 0);

        let ledger = FlowLedger::starting_at(5, 0, 0);
        assert_eq!(ledger.pending(), 0);
    }

    #[test]
    fn test_invariant_holds_across_sequences() {
        let mut ledger = granted(64);
        let steps: [(bool, u64); 12] = [
            (true, 10),
            (true, 60),
            (false, 5),
            (true, 5),
            (true, 50),
            (false, 40),
            (true, 1),
            (false, 200),
            (true, 64),
            (false, 3),
            (true, 30),
            (true, 0),
        ];

        for (is_data, amount) in steps {
            let _ = if is_data {
                ledger.on_data(amount)
            } else {
                let acknowledge = ledger.acknowledge() + amount;
                ledger.on_window(acknowledge, 64, 0, 0, 0)
            };
            assert!(ledger.pending() <= u64::from(ledger.maximum()));
            assert!(ledger.acknowledge() <= ledger.sequence());
        }
    }
}
