//! Single-shard frame dispatcher.
//!
//! The worker is the synchronous core of a shard. It owns the handlers of
//! every stream living on the shard, the tables that route stream ids to
//! them and the outbox that orders their writes. The async shard loop in
//! [`super::Engine`] feeds it and carries away what it leaves for the
//! embedder (egress) and for other shards (forwards).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::context::{Envelope, ShardState, StreamContext};
use super::generation::Generation;
use super::metrics::{EventKind, EventSink};
use super::table::{Consumer, HandlerArena, HandlerKey, StreamTables};
use crate::binding::shard_of;
use crate::budget::BudgetPool;
use crate::frame::{
    is_throttle, ControlFrame, Frame, FrameHeader, SignalFrame, BEGIN,
};

/// An encoded frame leaving the shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressFrame {
    /// Frame type id.
    pub type_id: u32,
    /// Encoded frame, header first.
    pub frame: Bytes,
}

impl EgressFrame {
    /// Wrap an encoded frame.
    #[must_use]
    pub fn new(type_id: u32, frame: Bytes) -> Self {
        Self { type_id, frame }
    }

    /// Decode the frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid frame of `type_id`.
    pub fn decode(&self) -> crate::frame::FrameResult<Frame<'_>> {
        Frame::decode(self.type_id, &self.frame)
    }
}

/// Counts reported by [`Worker::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Live stream handlers.
    pub handlers: usize,
    /// Registered stream ids.
    pub streams: usize,
    /// Pending timers.
    pub timers: usize,
}

/// One shard's handlers, tables, outbox and timers.
pub struct Worker {
    shard: usize,
    shards: usize,
    generation: Arc<Generation>,
    arena: HandlerArena,
    tables: StreamTables,
    state: ShardState,
    handler_bindings: HashMap<HandlerKey, u64>,
    /// Handlers called since the last release pass.
    touched: Vec<HandlerKey>,
    pool: Arc<BudgetPool>,
    sink: Arc<dyn EventSink>,
    egress: Vec<EgressFrame>,
    forwards: Vec<(usize, EgressFrame)>,
}

impl Worker {
    /// Create the worker for `shard` of `shards`.
    pub fn new(
        shard: usize,
        shards: usize,
        generation: Arc<Generation>,
        pool: Arc<BudgetPool>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            shard,
            shards: shards.max(1),
            generation,
            arena: HandlerArena::new(),
            tables: StreamTables::new(),
            state: ShardState::new(shard, shards.max(1)),
            handler_bindings: HashMap::new(),
            touched: Vec::new(),
            pool,
            sink,
            egress: Vec::new(),
            forwards: Vec::new(),
        }
    }

    /// Index of this shard.
    #[must_use]
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Generation used for new streams.
    #[must_use]
    pub fn generation(&self) -> &Arc<Generation> {
        &self.generation
    }

    /// Use `generation` for streams opened from now on.
    pub fn reconfigure(&mut self, generation: Arc<Generation>) {
        debug!(
            shard = self.shard,
            revision = generation.revision(),
            "Shard switched generation"
        );
        self.generation = generation;
    }

    /// Take a frame from the embedder.
    pub fn on_inbound(&mut self, type_id: u32, frame: Bytes, now: Instant) {
        if let Ok(header) = FrameHeader::peek(&frame, 0, frame.len()) {
            self.sink
                .record(EventKind::FramesReceived, header.routed_id, 1);
        }
        self.submit(Consumer::External, type_id, frame, now);
    }

    /// Take a frame forwarded by shard `from`.
    pub fn on_lane(&mut self, from: usize, type_id: u32, frame: Bytes, now: Instant) {
        self.submit(Consumer::Remote(from), type_id, frame, now);
    }

    fn submit(&mut self, source: Consumer, type_id: u32, frame: Bytes, now: Instant) {
        self.state.outbox.push_back(Envelope {
            source,
            target: None,
            type_id,
            frame,
        });
        self.drain(now);
    }

    /// Fire every timer due at `now` as a Signal frame.
    pub fn on_timers(&mut self, now: Instant) {
        for timer in self.state.timers.expire(now) {
            let header = FrameHeader::new(timer.origin_id, timer.routed_id, timer.stream_id);
            let signal = Frame::Signal(SignalFrame {
                header,
                cancel_id: timer.cancel_id,
                signal_id: timer.signal_id,
                context_id: 0,
                payload: &[],
            });
            trace!(shard = self.shard, stream_id = timer.stream_id, "Timer fired");
            if let Err(e) = self.state.enqueue(Consumer::External, None, &signal) {
                warn!(shard = self.shard, error = %e, "Failed to encode signal");
            }
        }
        self.drain(now);
    }

    /// Wake the handlers watching `budget_id`. Each watch fires once.
    pub fn on_budget_credit(&mut self, budget_id: u64, now: Instant) {
        let watchers = self.state.take_watchers(budget_id);
        if watchers.is_empty() {
            return;
        }
        for key in watchers {
            let Some(handler) = self.arena.get_mut(key) else {
                continue;
            };
            self.touched.push(key);
            let mut ctx = StreamContext::new(
                &mut self.state,
                &self.pool,
                self.sink.as_ref(),
                Consumer::Handler(key),
                now,
            );
            handler.on_budget_credit(budget_id, &mut ctx);
        }
        self.drain(now);
    }

    /// Wake every watcher, used when credit events were missed.
    pub fn on_budget_credit_all(&mut self, now: Instant) {
        let budgets: Vec<u64> = self.state.watchers.keys().copied().collect();
        for budget_id in budgets {
            self.on_budget_credit(budget_id, now);
        }
    }

    /// Earliest pending timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.state.timers.next_deadline()
    }

    /// Frames for the embedder, in write order.
    pub fn take_egress(&mut self) -> Vec<EgressFrame> {
        std::mem::take(&mut self.egress)
    }

    /// Frames for other shards, with the destination shard.
    pub fn take_forwards(&mut self) -> Vec<(usize, EgressFrame)> {
        std::mem::take(&mut self.forwards)
    }

    /// Current counts.
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            handlers: self.arena.len(),
            streams: self.tables.len(),
            timers: self.state.timers.len(),
        }
    }

    /// Deliver queued frames until the outbox is empty, then release closed
    /// handlers.
    fn drain(&mut self, now: Instant) {
        while let Some(envelope) = self.state.outbox.pop_front() {
            self.route(envelope, now);
        }
        self.release_closed();
    }

    fn route(&mut self, envelope: Envelope, now: Instant) {
        let header = match FrameHeader::peek(&envelope.frame, 0, envelope.frame.len()) {
            Ok(header) => header,
            Err(e) => {
                warn!(shard = self.shard, error = %e, "Dropping unreadable frame");
                return;
            }
        };

        if let Some(target) = envelope.target {
            self.deliver(target, envelope, now);
            return;
        }

        let stream_id = header.stream_id;
        let throttle = is_throttle(envelope.type_id);
        if envelope.type_id == BEGIN && self.tables.stream(stream_id).is_none() {
            self.begin(envelope, header, now);
            return;
        }

        let target = if throttle {
            self.tables.throttle(stream_id)
        } else {
            self.tables.stream(stream_id)
        };
        match target {
            Some(target) => self.deliver(target, envelope, now),
            None if throttle => {
                trace!(shard = self.shard, stream_id, type_id = envelope.type_id, "Dropping throttle for unknown stream");
            }
            None if self.tables.is_retired(stream_id) => {
                trace!(shard = self.shard, stream_id, type_id = envelope.type_id, "Dropping frame for closed stream");
            }
            None => {
                debug!(shard = self.shard, stream_id, type_id = envelope.type_id, "Frame before Begin");
                self.reset_source(&envelope, &header);
            }
        }
    }

    fn deliver(&mut self, target: Consumer, envelope: Envelope, now: Instant) {
        match target {
            Consumer::Handler(key) => self.deliver_local(key, &envelope, now),
            Consumer::External => {
                if let Ok(header) = FrameHeader::peek(&envelope.frame, 0, envelope.frame.len()) {
                    self.sink.record(EventKind::FramesSent, header.routed_id, 1);
                }
                self.egress
                    .push(EgressFrame::new(envelope.type_id, envelope.frame));
            }
            Consumer::Remote(shard) => {
                self.forwards
                    .push((shard, EgressFrame::new(envelope.type_id, envelope.frame)));
            }
        }
    }

    fn deliver_local(&mut self, key: HandlerKey, envelope: &Envelope, now: Instant) {
        let frame = match Frame::decode(envelope.type_id, &envelope.frame) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(shard = self.shard, error = %e, "Malformed frame");
                if !is_throttle(envelope.type_id) {
                    if let Ok(header) = FrameHeader::peek(&envelope.frame, 0, envelope.frame.len()) {
                        self.reset_source(envelope, &header);
                    }
                }
                return;
            }
        };
        let Some(handler) = self.arena.get_mut(key) else {
            return;
        };
        self.touched.push(key);
        let mut ctx = StreamContext::new(
            &mut self.state,
            &self.pool,
            self.sink.as_ref(),
            Consumer::Handler(key),
            now,
        );
        handler.on_frame(&frame, &mut ctx);
    }

    fn begin(&mut self, envelope: Envelope, header: FrameHeader, now: Instant) {
        let stream_id = header.stream_id;
        let owner = shard_of(stream_id, self.shards);
        if owner != self.shard && !matches!(envelope.source, Consumer::Remote(_)) {
            self.tables
                .register(stream_id, envelope.source, Consumer::Remote(owner));
            if let Consumer::Handler(source) = envelope.source {
                self.arena.own(source, stream_id);
            }
            self.deliver(Consumer::Remote(owner), envelope, now);
            return;
        }

        let Some(binding) = self.generation.binding(header.routed_id).cloned() else {
            debug!(
                shard = self.shard,
                stream_id,
                routed_id = header.routed_id,
                "Begin for unknown binding"
            );
            self.tables.retire(stream_id);
            self.reset_source(&envelope, &header);
            return;
        };

        let frame = match Frame::decode(BEGIN, &envelope.frame) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(shard = self.shard, stream_id, error = %e, "Malformed Begin");
                self.reset_source(&envelope, &header);
                return;
            }
        };

        let key = self.arena.reserve();
        self.tables
            .register(stream_id, envelope.source, Consumer::Handler(key));
        self.arena.own(key, stream_id);
        if let Consumer::Handler(source) = envelope.source {
            self.arena.own(source, stream_id);
        }

        let mut ctx = StreamContext::new(
            &mut self.state,
            &self.pool,
            self.sink.as_ref(),
            Consumer::Handler(key),
            now,
        );
        match binding
            .handler
            .new_stream(envelope.type_id, &envelope.frame, &mut ctx)
        {
            Some(mut handler) => {
                handler.on_frame(&frame, &mut ctx);
                self.arena.fill(key, handler);
                self.handler_bindings.insert(key, binding.binding_id);
                self.touched.push(key);
            }
            None => {
                debug!(
                    shard = self.shard,
                    stream_id,
                    binding = %binding.name,
                    "Binding refused stream"
                );
                for id in self.arena.release(key) {
                    self.tables.retire(id);
                }
                self.state.unwatch(key);
                self.reset_source(&envelope, &header);
            }
        }
    }

    /// Send a Reset for the frame's stream back to whoever wrote it.
    fn reset_source(&mut self, envelope: &Envelope, header: &FrameHeader) {
        self.sink.record(EventKind::Resets, header.routed_id, 1);
        let reset = Frame::Reset(ControlFrame {
            header: FrameHeader::new(header.origin_id, header.routed_id, header.stream_id)
                .with_flow(header.sequence, header.acknowledge, header.maximum)
                .with_trace(header.trace_id),
            extension: &[],
        });
        if let Err(e) = self
            .state
            .enqueue(Consumer::External, Some(envelope.source), &reset)
        {
            warn!(shard = self.shard, error = %e, "Failed to encode reset");
        }
    }

    fn release_closed(&mut self) {
        for key in std::mem::take(&mut self.touched) {
            if !self.arena.is_closed(key) {
                continue;
            }
            for stream_id in self.arena.release(key) {
                self.tables.retire(stream_id);
            }
            self.state.unwatch(key);
            let binding_id = self.handler_bindings.remove(&key).unwrap_or_default();
            self.sink.record(EventKind::StreamsClosed, binding_id, 1);
            trace!(shard = self.shard, binding_id, "Stream handler released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{reply_id, BindingHandler, EchoBinding, EchoOptions, ProxyBinding, StreamHandler};
    use crate::engine::{CounterSink, NoopSink};
    use crate::frame::{
        BeginFrame, DataFrame, WindowFrame, DATA, END, RESET, SIGNAL, WINDOW,
    };
    use crate::route::{Route, RouteResolver};
    use bytes::BytesMut;
    use std::time::Duration;

    const NET: u64 = 100;
    const APP: u64 = 200;
    const PROXY: u64 = 300;
    const STREAM: u64 = 7;

    fn encode(frame: &Frame<'_>) -> (u32, Bytes) {
        let mut out = BytesMut::new();
        frame.encode_to(&mut out).unwrap();
        (frame.type_id(), out.freeze())
    }

    fn begin(routed_id: u64, stream_id: u64) -> (u32, Bytes) {
        encode(&Frame::Begin(BeginFrame {
            header: FrameHeader::new(NET, routed_id, stream_id),
            authorization: 0,
            affinity: 0,
            extension: &[],
        }))
    }

    fn data(routed_id: u64, sequence: u64, payload: &[u8]) -> (u32, Bytes) {
        encode(&Frame::Data(DataFrame {
            header: FrameHeader::new(NET, routed_id, STREAM).with_flow(sequence, 0, 65536),
            flags: 0,
            budget_id: 0,
            reserved: payload.len() as u32,
            payload,
            extension: &[],
        }))
    }

    fn window(routed_id: u64, stream_id: u64, maximum: u32) -> (u32, Bytes) {
        encode(&Frame::Window(WindowFrame {
            header: FrameHeader::new(NET, routed_id, stream_id).with_flow(0, 0, maximum),
            budget_id: 0,
            padding: 0,
            capabilities: 0,
        }))
    }

    fn worker_with(generation: Generation, sink: Arc<dyn EventSink>) -> Worker {
        Worker::new(0, 1, Arc::new(generation), Arc::new(BudgetPool::new()), sink)
    }

    fn echo_generation() -> Generation {
        Generation::empty().with_binding(
            "app",
            APP,
            Arc::new(EchoBinding::new(APP, EchoOptions::default())),
        )
    }

    fn send(worker: &mut Worker, (type_id, frame): (u32, Bytes)) {
        worker.on_inbound(type_id, frame, Instant::now());
    }

    fn types(egress: &[EgressFrame]) -> Vec<u32> {
        egress.iter().map(|f| f.type_id).collect()
    }

    #[test]
    fn test_begin_opens_handler_and_echoes() {
        let mut worker = worker_with(echo_generation(), Arc::new(NoopSink));
        send(&mut worker, begin(APP, STREAM));
        assert_eq!(worker.stats().handlers, 1);
        assert_eq!(types(&worker.take_egress()), vec![BEGIN, WINDOW]);

        send(&mut worker, window(APP, reply_id(STREAM), 1024));
        send(&mut worker, data(APP, 0, b"ping"));
        let egress = worker.take_egress();
        assert_eq!(types(&egress), vec![DATA, WINDOW]);
        let Frame::Data(echoed) = egress[0].decode().unwrap() else {
            panic!("expected data");
        };
        assert_eq!(echoed.payload, b"ping");
        assert_eq!(echoed.header.stream_id, reply_id(STREAM));
    }

    #[test]
    fn test_unknown_binding_resets_source() {
        let sink = Arc::new(CounterSink::new());
        let mut worker = worker_with(Generation::empty(), sink.clone());
        send(&mut worker, begin(APP, STREAM));

        let egress = worker.take_egress();
        assert_eq!(types(&egress), vec![RESET]);
        assert_eq!(egress[0].decode().unwrap().stream_id(), STREAM);
        assert_eq!(worker.stats().handlers, 0);
        assert_eq!(sink.get(EventKind::Resets, APP), 1);
    }

    #[test]
    fn test_data_before_begin_resets_and_throttle_is_dropped() {
        let mut worker = worker_with(echo_generation(), Arc::new(NoopSink));
        send(&mut worker, data(APP, 0, b"early"));
        assert_eq!(types(&worker.take_egress()), vec![RESET]);

        send(&mut worker, window(APP, 9, 10));
        assert!(worker.take_egress().is_empty());
    }

    #[test]
    fn test_closed_handlers_are_released() {
        let sink = Arc::new(CounterSink::new());
        let mut worker = worker_with(echo_generation(), sink.clone());
        send(&mut worker, begin(APP, STREAM));
        send(&mut worker, window(APP, reply_id(STREAM), 1024));
        send(
            &mut worker,
            encode(&Frame::End(ControlFrame {
                header: FrameHeader::new(NET, APP, STREAM),
                extension: &[],
            })),
        );

        assert!(types(&worker.take_egress()).contains(&END));
        assert_eq!(worker.stats().handlers, 0);
        assert_eq!(worker.stats().streams, 0);
        assert_eq!(sink.get(EventKind::StreamsClosed, APP), 1);
    }

    #[test]
    fn test_late_frames_on_closed_stream_are_dropped() {
        let sink = Arc::new(CounterSink::new());
        let mut worker = worker_with(echo_generation(), sink.clone());
        send(&mut worker, begin(APP, STREAM));
        send(&mut worker, window(APP, reply_id(STREAM), 1024));
        send(
            &mut worker,
            encode(&Frame::End(ControlFrame {
                header: FrameHeader::new(NET, APP, STREAM),
                extension: &[],
            })),
        );
        worker.take_egress();
        assert_eq!(worker.stats().handlers, 0);

        send(&mut worker, data(APP, 0, b"late"));
        send(
            &mut worker,
            encode(&Frame::End(ControlFrame {
                header: FrameHeader::new(NET, APP, STREAM),
                extension: &[],
            })),
        );
        assert!(worker.take_egress().is_empty());
        assert_eq!(sink.get(EventKind::Resets, APP), 0);

        send(&mut worker, begin(APP, STREAM));
        assert_eq!(types(&worker.take_egress()), vec![BEGIN, WINDOW]);
        assert_eq!(worker.stats().handlers, 1);
    }

    struct WatchBinding;

    struct WatchStream {
        ended: bool,
    }

    impl BindingHandler for WatchBinding {
        fn new_stream(
            &self,
            _type_id: u32,
            _buffer: &[u8],
            ctx: &mut StreamContext<'_>,
        ) -> Option<Box<dyn StreamHandler>> {
            ctx.watch_budget(77);
            ctx.watch_budget(78);
            Some(Box::new(WatchStream { ended: false }))
        }
    }

    impl StreamHandler for WatchStream {
        fn on_frame(&mut self, frame: &Frame<'_>, _ctx: &mut StreamContext<'_>) {
            if matches!(frame, Frame::End(_)) {
                self.ended = true;
            }
        }

        fn is_closed(&self) -> bool {
            self.ended
        }
    }

    #[test]
    fn test_released_handler_stops_watching_budgets() {
        let generation = Generation::empty().with_binding("watch", APP, Arc::new(WatchBinding));
        let mut worker = worker_with(generation, Arc::new(NoopSink));
        send(&mut worker, begin(APP, STREAM));
        send(&mut worker, begin(APP, 9));
        assert_eq!(worker.state.watchers.get(&77).map(Vec::len), Some(2));

        worker.on_budget_credit(78, Instant::now());
        assert!(!worker.state.watchers.contains_key(&78));

        send(
            &mut worker,
            encode(&Frame::End(ControlFrame {
                header: FrameHeader::new(NET, APP, STREAM),
                extension: &[],
            })),
        );
        assert_eq!(worker.stats().handlers, 1);
        assert_eq!(worker.state.watchers.get(&77).map(Vec::len), Some(1));

        send(
            &mut worker,
            encode(&Frame::End(ControlFrame {
                header: FrameHeader::new(NET, APP, 9),
                extension: &[],
            })),
        );
        assert_eq!(worker.stats().handlers, 0);
        assert!(worker.state.watchers.is_empty());
        assert!(worker.state.watching.is_empty());
    }

    #[test]
    fn test_proxy_relays_to_echo() {
        let generation = echo_generation().with_binding(
            "proxy",
            PROXY,
            Arc::new(ProxyBinding::new(PROXY, RouteResolver::new(vec![Route::new(0, APP)]))),
        );
        let mut worker = worker_with(generation, Arc::new(NoopSink));
        send(&mut worker, begin(PROXY, STREAM));
        assert_eq!(worker.stats().handlers, 2);

        let egress = worker.take_egress();
        assert_eq!(types(&egress), vec![BEGIN, WINDOW]);
        assert_eq!(egress[0].decode().unwrap().stream_id(), reply_id(STREAM));
        assert_eq!(egress[1].decode().unwrap().stream_id(), STREAM);
    }

    struct TimerBinding;

    struct TimerStream {
        fired: bool,
    }

    impl BindingHandler for TimerBinding {
        fn new_stream(
            &self,
            _type_id: u32,
            buffer: &[u8],
            ctx: &mut StreamContext<'_>,
        ) -> Option<Box<dyn StreamHandler>> {
            let header = FrameHeader::peek(buffer, 0, buffer.len()).ok()?;
            let deadline = ctx.now() + Duration::from_secs(5);
            ctx.schedule(deadline, header.origin_id, header.routed_id, reply_id(header.stream_id), 42);
            Some(Box::new(TimerStream { fired: false }))
        }
    }

    impl StreamHandler for TimerStream {
        fn on_frame(&mut self, frame: &Frame<'_>, _ctx: &mut StreamContext<'_>) {
            if let Frame::Signal(signal) = frame {
                assert_eq!(signal.signal_id, 42);
                self.fired = true;
            }
        }

        fn is_closed(&self) -> bool {
            self.fired
        }
    }

    #[test]
    fn test_timer_fires_signal_on_throttle_table() {
        let generation = Generation::empty().with_binding("timer", APP, Arc::new(TimerBinding));
        let mut worker = worker_with(generation, Arc::new(NoopSink));
        let start = Instant::now();
        let (type_id, frame) = begin(APP, STREAM);
        worker.on_inbound(type_id, frame, start);

        assert_eq!(worker.next_deadline(), Some(start + Duration::from_secs(5)));
        worker.on_timers(start + Duration::from_secs(1));
        assert_eq!(worker.stats().handlers, 1);

        worker.on_timers(start + Duration::from_secs(5));
        assert_eq!(worker.stats().handlers, 0);
        assert!(!types(&worker.take_egress()).contains(&SIGNAL));
    }

    #[test]
    fn test_reconfigure_only_affects_new_streams() {
        let mut worker = worker_with(echo_generation(), Arc::new(NoopSink));
        send(&mut worker, begin(APP, STREAM));
        worker.take_egress();

        worker.reconfigure(Arc::new(Generation::empty().with_revision(2)));
        assert_eq!(worker.generation().revision(), 2);

        send(&mut worker, window(APP, reply_id(STREAM), 1024));
        send(&mut worker, data(APP, 0, b"still here"));
        assert_eq!(types(&worker.take_egress()), vec![DATA, WINDOW]);

        send(&mut worker, begin(APP, 9));
        assert_eq!(types(&worker.take_egress()), vec![RESET]);
    }
}
