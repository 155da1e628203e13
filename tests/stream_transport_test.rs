//! Integration tests for stream transport: configuration to generation,
//! proxy relaying into echo, flow control, shared budgets and reconfigure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use r0n_dataplane::binding::{reply_id, BindingFactory};
use r0n_dataplane::budget::BudgetPool;
use r0n_dataplane::config::{binding_id, ConfigLoader, DataplaneConfig};
use r0n_dataplane::engine::{
    CounterSink, EgressFrame, Engine, EngineConfig, EventKind, EventSink, Generation, NoopSink,
    Worker,
};
use r0n_dataplane::frame::{
    BeginFrame, ControlFrame, DataFrame, Frame, FrameHeader, ProxyBeginEx, WindowFrame, ABORT,
    BEGIN, DATA, END, RESET, WINDOW,
};
use r0n_dataplane::route::GuardRegistry;
use r0n_dataplane::tls::VaultRegistry;

const CONFIG: &str = r#"
[engine]
workers = 2

[[bindings]]
name = "net"
type = "proxy"
kind = "proxy"

[[bindings.routes]]
exit = "app"

[[bindings.routes.when]]
authority = "*.example.com"
port = "8000-8080"

[[bindings.routes]]
exit = "small"

[[bindings.routes.when]]
alpn = "echo/*"

[[bindings]]
name = "app"
type = "echo"

[[bindings]]
name = "small"
type = "echo"

[bindings.options]
window = 16
"#;

const ORIGIN: u64 = 1;
const STREAM: u64 = 7;

fn id(name: &str) -> u64 {
    binding_id("default", name)
}

fn load(content: &str) -> DataplaneConfig {
    ConfigLoader::new().load_str(content).unwrap()
}

fn attach(config: &DataplaneConfig) -> Generation {
    let (generation, report) = Generation::attach(
        config,
        &BindingFactory::new(),
        &VaultRegistry::new(),
        &GuardRegistry::new(),
    )
    .unwrap();
    assert!(report.is_complete(), "attach failed: {:?}", report.failed);
    generation
}

fn encode(frame: &Frame<'_>) -> (u32, Bytes) {
    let mut out = BytesMut::new();
    frame.encode_to(&mut out).unwrap();
    (frame.type_id(), out.freeze())
}

fn begin(routed_id: u64, stream_id: u64, hints: &ProxyBeginEx, affinity: u64) -> (u32, Bytes) {
    let extension = hints.encode().unwrap();
    encode(&Frame::Begin(BeginFrame {
        header: FrameHeader::new(ORIGIN, routed_id, stream_id),
        authorization: 0,
        affinity,
        extension: &extension,
    }))
}

fn data(routed_id: u64, stream_id: u64, sequence: u64, payload: &[u8]) -> (u32, Bytes) {
    encode(&Frame::Data(DataFrame {
        header: FrameHeader::new(ORIGIN, routed_id, stream_id).with_flow(sequence, 0, 65536),
        flags: 0,
        budget_id: 0,
        reserved: payload.len() as u32,
        payload,
        extension: &[],
    }))
}

fn window(routed_id: u64, stream_id: u64, budget_id: u64, maximum: u32) -> (u32, Bytes) {
    encode(&Frame::Window(WindowFrame {
        header: FrameHeader::new(ORIGIN, routed_id, stream_id).with_flow(0, 0, maximum),
        budget_id,
        padding: 0,
        capabilities: 0,
    }))
}

fn end(routed_id: u64, stream_id: u64, sequence: u64) -> (u32, Bytes) {
    encode(&Frame::End(ControlFrame {
        header: FrameHeader::new(ORIGIN, routed_id, stream_id).with_flow(sequence, 0, 0),
        extension: &[],
    }))
}

fn web_hints() -> ProxyBeginEx {
    ProxyBeginEx::new()
        .with_authority("api.example.com")
        .with_port(8080)
}

struct Harness {
    worker: Worker,
    pool: Arc<BudgetPool>,
    sink: Arc<CounterSink>,
}

impl Harness {
    fn new(generation: Generation) -> Self {
        let pool = Arc::new(BudgetPool::new());
        let sink = Arc::new(CounterSink::new());
        let events: Arc<dyn EventSink> = sink.clone();
        let worker = Worker::new(0, 1, Arc::new(generation), Arc::clone(&pool), events);
        Self { worker, pool, sink }
    }

    fn send(&mut self, (type_id, frame): (u32, Bytes)) -> Vec<EgressFrame> {
        self.worker.on_inbound(type_id, frame, Instant::now());
        self.worker.take_egress()
    }
}

fn types(egress: &[EgressFrame]) -> Vec<u32> {
    egress.iter().map(|f| f.type_id).collect()
}

fn payload(frame: &EgressFrame) -> Vec<u8> {
    match frame.decode().unwrap() {
        Frame::Data(data) => data.payload.to_vec(),
        other => panic!("expected data, got type {:#x}", other.type_id()),
    }
}

#[test]
fn test_proxy_routes_to_echo_and_relays_payload() {
    let mut harness = Harness::new(attach(&load(CONFIG)));
    let net = id("net");

    let opened = harness.send(begin(net, STREAM, &web_hints(), 0));
    assert_eq!(types(&opened), vec![BEGIN, WINDOW]);
    assert_eq!(opened[0].decode().unwrap().stream_id(), reply_id(STREAM));
    assert_eq!(harness.worker.stats().handlers, 2);

    assert!(harness.send(window(net, reply_id(STREAM), 0, 4096)).is_empty());

    let echoed = harness.send(data(net, STREAM, 0, b"hello"));
    assert_eq!(types(&echoed), vec![DATA, WINDOW]);
    assert_eq!(payload(&echoed[0]), b"hello");
    assert_eq!(echoed[0].decode().unwrap().stream_id(), reply_id(STREAM));

    let closed = harness.send(end(net, STREAM, 5));
    assert_eq!(types(&closed), vec![END]);
    assert_eq!(harness.worker.stats().handlers, 0);
    assert_eq!(harness.worker.stats().streams, 0);

    assert_eq!(harness.sink.get(EventKind::StreamsOpened, net), 1);
    assert_eq!(harness.sink.get(EventKind::StreamsOpened, id("app")), 1);
    assert_eq!(harness.sink.get(EventKind::BytesReceived, id("app")), 5);
}

#[test]
fn test_second_route_matches_on_alpn() {
    let mut harness = Harness::new(attach(&load(CONFIG)));
    let hints = ProxyBeginEx::new().with_alpn("echo/1");
    assert_eq!(types(&harness.send(begin(id("net"), STREAM, &hints, 0))), vec![BEGIN, WINDOW]);
    assert_eq!(harness.sink.get(EventKind::StreamsOpened, id("small")), 1);
    assert_eq!(harness.sink.get(EventKind::StreamsOpened, id("app")), 0);
}

#[test]
fn test_route_miss_resets_stream() {
    let mut harness = Harness::new(attach(&load(CONFIG)));
    let net = id("net");

    // Authority matches but the port is outside the range.
    let hints = ProxyBeginEx::new()
        .with_authority("api.example.com")
        .with_port(9000);
    let egress = harness.send(begin(net, STREAM, &hints, 0));

    assert_eq!(types(&egress), vec![RESET]);
    assert_eq!(egress[0].decode().unwrap().stream_id(), STREAM);
    assert_eq!(harness.sink.get(EventKind::RouteMisses, net), 1);
    assert_eq!(harness.worker.stats().handlers, 0);
}

#[test]
fn test_window_overrun_resets_and_aborts() {
    let mut harness = Harness::new(attach(&load(CONFIG)));
    let small = id("small");

    let opened = harness.send(begin(small, STREAM, &ProxyBeginEx::new(), 0));
    assert_eq!(types(&opened), vec![BEGIN, WINDOW]);
    let Frame::Window(granted) = opened[1].decode().unwrap() else {
        panic!("expected window");
    };
    assert_eq!(granted.header.maximum, 16);

    let egress = harness.send(data(small, STREAM, 0, &[0u8; 32]));
    assert_eq!(types(&egress), vec![RESET, ABORT]);
    assert_eq!(harness.sink.get(EventKind::Resets, small), 1);
    assert_eq!(harness.worker.stats().handlers, 0);

    // The peer may still have frames in flight; they are dropped quietly.
    assert!(harness.send(data(small, STREAM, 32, &[0u8; 8])).is_empty());
    assert_eq!(harness.sink.get(EventKind::Resets, small), 1);
}

#[test]
fn test_sequence_gap_is_a_violation() {
    let mut harness = Harness::new(attach(&load(CONFIG)));
    let net = id("net");
    harness.send(begin(net, STREAM, &web_hints(), 0));
    harness.send(window(net, reply_id(STREAM), 0, 4096));

    let egress = harness.send(data(net, STREAM, 3, b"late"));
    assert!(types(&egress).contains(&RESET));
    assert_eq!(harness.sink.get(EventKind::FlowViolations, net), 1);
}

#[test]
fn test_budget_suspends_and_resumes_echo() {
    const BUDGET: u64 = 5;
    let mut harness = Harness::new(attach(&load(CONFIG)));
    let app = id("app");

    harness.send(begin(app, STREAM, &ProxyBeginEx::new(), 0));
    harness.pool.open(BUDGET);
    assert!(harness.send(window(app, reply_id(STREAM), BUDGET, 4096)).is_empty());

    // No credit: the payload stays buffered and is not acknowledged.
    assert!(harness.send(data(app, STREAM, 0, b"suspended")).is_empty());
    assert_eq!(harness.pool.remaining(BUDGET), 0);

    harness.pool.credit(BUDGET, 4);
    harness.worker.on_budget_credit(BUDGET, Instant::now());
    let partial = harness.worker.take_egress();
    assert_eq!(types(&partial), vec![DATA, WINDOW]);
    assert_eq!(payload(&partial[0]), b"susp");

    harness.pool.credit(BUDGET, 100);
    harness.worker.on_budget_credit(BUDGET, Instant::now());
    let rest = harness.worker.take_egress();
    assert_eq!(types(&rest), vec![DATA, WINDOW]);
    assert_eq!(payload(&rest[0]), b"ended");
    assert_eq!(harness.pool.remaining(BUDGET), 95);
}

#[test]
fn test_reconfigure_keeps_live_streams() {
    let first = attach(&load(CONFIG));
    let mut without_small = load(CONFIG);
    without_small.bindings.retain(|b| b.name != "small");
    without_small.bindings[0].routes.truncate(1);
    let second = attach(&without_small).with_revision(2);
    assert_ne!(first.content_hash(), second.content_hash());

    let mut harness = Harness::new(first);
    let small = id("small");
    harness.send(begin(small, STREAM, &ProxyBeginEx::new(), 0));
    harness.send(window(small, reply_id(STREAM), 0, 4096));

    harness.worker.reconfigure(Arc::new(second));

    let echoed = harness.send(data(small, STREAM, 0, b"kept"));
    assert_eq!(types(&echoed), vec![DATA, WINDOW]);

    let refused = harness.send(begin(small, 9, &ProxyBeginEx::new(), 0));
    assert_eq!(types(&refused), vec![RESET]);
}

#[test]
fn test_same_configuration_same_generation_hash() {
    let config = load(CONFIG);
    let mut reordered = config.clone();
    reordered.bindings.reverse();
    assert_eq!(attach(&config).content_hash(), attach(&reordered).content_hash());
}

async fn next(egress: &mut r0n_dataplane::engine::EgressReceiver) -> EgressFrame {
    tokio::time::timeout(Duration::from_secs(5), egress.recv())
        .await
        .expect("egress timed out")
        .expect("egress closed")
}

#[tokio::test]
async fn test_engine_relays_across_shards() {
    let config = load(CONFIG);
    let generation = Arc::new(attach(&config));
    let (mut engine, mut egress) =
        Engine::start(EngineConfig::from(&config.engine), generation, Arc::new(NoopSink)).unwrap();
    assert_eq!(engine.shards(), 2);

    // The upstream stream lives on shard 0; affinity 1 places the echo on shard 1.
    let net = id("net");
    let (type_id, frame) = begin(net, STREAM, &web_hints(), 1);
    engine.dispatch(type_id, frame).unwrap();

    let opened = next(&mut egress).await;
    assert_eq!(opened.type_id, BEGIN);
    assert_eq!(opened.decode().unwrap().stream_id(), reply_id(STREAM));
    assert_eq!(next(&mut egress).await.type_id, WINDOW);

    let (type_id, frame) = window(net, reply_id(STREAM), 0, 4096);
    engine.dispatch(type_id, frame).unwrap();
    let (type_id, frame) = data(net, STREAM, 0, b"across");
    engine.dispatch(type_id, frame).unwrap();

    let echoed = next(&mut egress).await;
    assert_eq!(payload(&echoed), b"across");

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats[0].handlers, 1);
    assert_eq!(stats[1].handlers, 1);

    assert!(engine.status().state.is_healthy());
    engine.shutdown();
    assert!(engine.status().state.is_stopped());
}

#[tokio::test]
async fn test_engine_reconfigure_and_credit() {
    let config = load(CONFIG);
    let (mut engine, mut egress) = Engine::start(
        EngineConfig::from(&config.engine),
        Arc::new(attach(&config)),
        Arc::new(NoopSink),
    )
    .unwrap();

    assert!(!engine.reconfigure(Arc::new(attach(&config))).unwrap());

    let mut changed = config.clone();
    changed.bindings.retain(|b| b.name == "app");
    assert!(engine.reconfigure(Arc::new(attach(&changed).with_revision(3))).unwrap());
    assert_eq!(engine.status().revision, 3);
    assert_eq!(engine.status().bindings, 1);

    // The proxy is gone from the new generation.
    let (type_id, frame) = begin(id("net"), STREAM, &web_hints(), 0);
    engine.dispatch(type_id, frame).unwrap();
    assert_eq!(next(&mut egress).await.type_id, RESET);

    engine.pool().open(9);
    assert_eq!(engine.credit(9, 10), 10);
    engine.shutdown();
}
