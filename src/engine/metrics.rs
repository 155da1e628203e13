//! Write-only event sink for dataplane counters.

use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Kinds of events the core reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// Frames delivered to a binding.
    FramesReceived,
    /// Frames written by a binding.
    FramesSent,
    /// Payload bytes delivered to a binding.
    BytesReceived,
    /// Payload bytes written by a binding.
    BytesSent,
    /// Streams accepted by a binding.
    StreamsOpened,
    /// Stream handlers released.
    StreamsClosed,
    /// Resets issued by the core or a binding.
    Resets,
    /// Streams no route matched.
    RouteMisses,
    /// TLS handshakes that failed.
    HandshakeFailures,
    /// Frames that broke the flow-control invariant.
    FlowViolations,
}

impl EventKind {
    /// Every kind, in registration order.
    pub const ALL: [EventKind; 10] = [
        Self::FramesReceived,
        Self::FramesSent,
        Self::BytesReceived,
        Self::BytesSent,
        Self::StreamsOpened,
        Self::StreamsClosed,
        Self::Resets,
        Self::RouteMisses,
        Self::HandshakeFailures,
        Self::FlowViolations,
    ];

    /// Metric name, without the `_total` suffix the counter encoding adds.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::FramesReceived => "frames_received",
            Self::FramesSent => "frames_sent",
            Self::BytesReceived => "bytes_received",
            Self::BytesSent => "bytes_sent",
            Self::StreamsOpened => "streams_opened",
            Self::StreamsClosed => "streams_closed",
            Self::Resets => "resets",
            Self::RouteMisses => "route_misses",
            Self::HandshakeFailures => "handshake_failures",
            Self::FlowViolations => "flow_violations",
        }
    }

    /// Help text.
    #[must_use]
    pub fn help(&self) -> &'static str {
        match self {
            Self::FramesReceived => "Frames delivered to a binding",
            Self::FramesSent => "Frames written by a binding",
            Self::BytesReceived => "Payload bytes delivered to a binding",
            Self::BytesSent => "Payload bytes written by a binding",
            Self::StreamsOpened => "Streams accepted by a binding",
            Self::StreamsClosed => "Stream handlers released",
            Self::Resets => "Resets issued by the core or a binding",
            Self::RouteMisses => "Streams no route matched",
            Self::HandshakeFailures => "TLS handshakes that failed",
            Self::FlowViolations => "Frames that broke the flow-control invariant",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Accepts `(kind, binding_id, value)` tuples.
pub trait EventSink: Send + Sync {
    /// Record one event.
    fn record(&self, kind: EventKind, binding_id: u64, value: u64);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _kind: EventKind, _binding_id: u64, _value: u64) {}
}

/// Labels attached to every dataplane counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BindingLabels {
    /// Binding id, as 16 hex digits.
    pub binding: String,
}

impl BindingLabels {
    fn of(binding_id: u64) -> Self {
        Self {
            binding: format!("{binding_id:016x}"),
        }
    }
}

type CounterFamily = Family<BindingLabels, Counter<u64, AtomicU64>>;

/// Prometheus counters, one family per [`EventKind`] labelled by binding.
#[derive(Debug)]
pub struct CounterSink {
    registry: Registry,
    families: Vec<CounterFamily>,
}

impl CounterSink {
    /// Create a sink whose metrics are named `r0n_dataplane_*`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_prefix("r0n_dataplane")
    }

    /// Create a sink whose metrics are named `{prefix}_*`.
    #[must_use]
    pub fn with_prefix(prefix: &str) -> Self {
        let mut registry = Registry::with_prefix(prefix);
        let families = EventKind::ALL
            .iter()
            .map(|kind| {
                let family = CounterFamily::default();
                registry.register(kind.name(), kind.help(), family.clone());
                family
            })
            .collect();
        Self { registry, families }
    }

    /// Current value of one counter.
    #[must_use]
    pub fn get(&self, kind: EventKind, binding_id: u64) -> u64 {
        self.families[kind.index()]
            .get_or_create(&BindingLabels::of(binding_id))
            .get()
    }

    /// Render every counter in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder fails to write.
    pub fn to_prometheus(&self) -> Result<String, std::fmt::Error> {
        let mut output = String::new();
        encode(&mut output, &self.registry)?;
        Ok(output)
    }
}

impl Default for CounterSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for CounterSink {
    fn record(&self, kind: EventKind, binding_id: u64, value: u64) {
        self.families[kind.index()]
            .get_or_create(&BindingLabels::of(binding_id))
            .inc_by(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_sink() {
        let sink = CounterSink::new();
        sink.record(EventKind::Resets, 1, 1);
        sink.record(EventKind::Resets, 1, 2);
        sink.record(EventKind::Resets, 2, 5);

        assert_eq!(sink.get(EventKind::Resets, 1), 3);
        assert_eq!(sink.get(EventKind::Resets, 2), 5);
        assert_eq!(sink.get(EventKind::RouteMisses, 1), 0);
    }

    #[test]
    fn test_kind_index_matches_registration_order() {
        for (position, kind) in EventKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), position);
        }
    }

    #[test]
    fn test_to_prometheus() {
        let sink = CounterSink::new();
        sink.record(EventKind::RouteMisses, 0xab, 2);

        let output = sink.to_prometheus().unwrap();
        assert!(output.contains("# HELP r0n_dataplane_route_misses Streams no route matched"));
        assert!(output.contains("# TYPE r0n_dataplane_route_misses counter"));
        assert!(output.contains("r0n_dataplane_route_misses_total{binding=\"00000000000000ab\"} 2"));
        assert!(output.ends_with("# EOF\n"));
    }

    #[test]
    fn test_custom_prefix() {
        let sink = CounterSink::with_prefix("edge");
        sink.record(EventKind::FramesSent, 1, 4);

        let output = sink.to_prometheus().unwrap();
        assert!(output.contains("edge_frames_sent_total{binding=\"0000000000000001\"} 4"));
    }
}
