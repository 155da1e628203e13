//! Integration tests for the TLS bindings: real rustls handshakes carried
//! as frames through a worker.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use r0n_dataplane::binding::{
    reply_id, AttachContext, AttachError, BindingFactory, BindingHandler, StreamHandler,
};
use r0n_dataplane::budget::BudgetPool;
use r0n_dataplane::config::{binding_id, BindingEntry, ConfigLoader};
use r0n_dataplane::engine::{
    CounterSink, EgressFrame, EventKind, EventSink, Generation, StreamContext, Worker,
};
use r0n_dataplane::frame::{
    BeginFrame, DataFrame, Frame, FrameHeader, ProxyBeginEx, SignalFrame, WindowFrame, ABORT,
    BEGIN, DATA, RESET, WINDOW,
};
use r0n_dataplane::route::GuardRegistry;
use r0n_dataplane::tls::{
    CertificateBundle, MemoryVault, TlsOptions, VaultRegistry, HANDSHAKE_TIMEOUT,
};
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, ClientConnection, RootCertStore};

const ORIGIN: u64 = 1;
const STREAM: u64 = 7;

fn id(name: &str) -> u64 {
    binding_id("default", name)
}

struct Credentials {
    server: CertificateBundle,
    stranger: CertificateBundle,
}

impl Credentials {
    fn generate() -> Self {
        let bundle = |name: &str| {
            let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
            CertificateBundle::from_pem(name, &cert.cert.pem(), &cert.key_pair.serialize_pem())
                .unwrap()
        };
        Self {
            server: bundle("localhost"),
            stranger: bundle("stranger.test"),
        }
    }

    fn server_cert(&self) -> Vec<CertificateDer<'static>> {
        self.server.certificates().to_vec()
    }

    fn vaults(&self) -> VaultRegistry {
        let vault = MemoryVault::new("certs")
            .with_key("localhost", self.server.clone())
            .with_trust("localhost", self.server_cert())
            .with_trust("clients", self.stranger.certificates().to_vec());
        VaultRegistry::new().with_vault(Arc::new(vault))
    }
}

fn server_binding(options: &str, routes: &str) -> String {
    format!(
        r#"
[[vaults]]
name = "certs"

[[bindings]]
name = "tls"
type = "tls"
kind = "server"
vault = "certs"

[bindings.options]
keys = ["localhost"]
{options}

{routes}

[[bindings]]
name = "app"
type = "echo"

[[bindings]]
name = "h2app"
type = "echo"
"#
    )
}

const ALPN_ROUTES: &str = r#"
[[bindings.routes]]
exit = "h2app"

[[bindings.routes.when]]
authority = "localhost"
alpn = "h2"

[[bindings.routes]]
exit = "app"

[[bindings.routes.when]]
authority = "localhost"
alpn = "http/1.1"
"#;

fn worker(content: &str, credentials: &Credentials) -> (Worker, Arc<CounterSink>) {
    worker_with_factory(content, credentials, &BindingFactory::new())
}

fn worker_with_factory(
    content: &str,
    credentials: &Credentials,
    factory: &BindingFactory,
) -> (Worker, Arc<CounterSink>) {
    let config = ConfigLoader::new().load_str(content).unwrap();
    let (generation, report) = Generation::attach(
        &config,
        factory,
        &credentials.vaults(),
        &GuardRegistry::new(),
    )
    .unwrap();
    assert!(report.is_complete(), "attach failed: {:?}", report.failed);

    let sink = Arc::new(CounterSink::new());
    let events: Arc<dyn EventSink> = sink.clone();
    let worker = Worker::new(
        0,
        1,
        Arc::new(generation),
        Arc::new(BudgetPool::new()),
        events,
    );
    (worker, sink)
}

fn encode(frame: &Frame<'_>) -> (u32, Bytes) {
    let mut out = BytesMut::new();
    frame.encode_to(&mut out).unwrap();
    (frame.type_id(), out.freeze())
}

fn send(worker: &mut Worker, (type_id, frame): (u32, Bytes)) {
    worker.on_inbound(type_id, frame, Instant::now());
}

fn begin(routed_id: u64, hints: &ProxyBeginEx) -> (u32, Bytes) {
    let extension = hints.encode().unwrap();
    encode(&Frame::Begin(BeginFrame {
        header: FrameHeader::new(ORIGIN, routed_id, STREAM),
        authorization: 0,
        affinity: 0,
        extension: &extension,
    }))
}

fn window(routed_id: u64, stream_id: u64) -> (u32, Bytes) {
    encode(&Frame::Window(WindowFrame {
        header: FrameHeader::new(ORIGIN, routed_id, stream_id).with_flow(0, 0, 1 << 20),
        budget_id: 0,
        padding: 0,
        capabilities: 0,
    }))
}

fn data(routed_id: u64, sequence: u64, payload: &[u8]) -> (u32, Bytes) {
    encode(&Frame::Data(DataFrame {
        header: FrameHeader::new(ORIGIN, routed_id, STREAM).with_flow(sequence, 0, 0),
        flags: 0,
        budget_id: 0,
        reserved: payload.len() as u32,
        payload,
        extension: &[],
    }))
}

fn client(credentials: &Credentials, protocols: &[&str]) -> ClientConnection {
    client_as(credentials, protocols, None)
}

fn client_as(
    credentials: &Credentials,
    protocols: &[&str],
    identity: Option<&CertificateBundle>,
) -> ClientConnection {
    let mut roots = RootCertStore::empty();
    for certificate in credentials.server_cert() {
        roots.add(certificate).unwrap();
    }
    let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots);
    let mut config = match identity {
        Some(bundle) => builder
            .with_client_auth_cert(
                bundle.certificates().to_vec(),
                bundle.private_key().clone_key(),
            )
            .unwrap(),
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    ClientConnection::new(Arc::new(config), ServerName::try_from("localhost").unwrap()).unwrap()
}

/// Network side of a server stream: carries a rustls client's records as
/// Data frames and feeds the binding's replies back into it.
struct Network {
    routed_id: u64,
    sequence: u64,
    frames: Vec<u32>,
    error: Option<String>,
}

impl Network {
    fn open(worker: &mut Worker, routed_id: u64, hints: &ProxyBeginEx) -> Self {
        send(worker, begin(routed_id, hints));
        send(worker, window(routed_id, reply_id(STREAM)));
        let mut network = Self {
            routed_id,
            sequence: 0,
            frames: Vec::new(),
            error: None,
        };
        network.collect(worker.take_egress(), None);
        network
    }

    fn collect(&mut self, egress: Vec<EgressFrame>, mut client: Option<&mut ClientConnection>) {
        for frame in egress {
            self.frames.push(frame.type_id);
            let Ok(Frame::Data(data)) = frame.decode() else {
                continue;
            };
            assert_eq!(data.header.stream_id, reply_id(STREAM));
            let Some(client) = client.as_deref_mut() else {
                continue;
            };
            let mut records = data.payload;
            while !records.is_empty() {
                if client.read_tls(&mut records).unwrap() == 0 {
                    break;
                }
            }
            if let Err(e) = client.process_new_packets() {
                self.error.get_or_insert(e.to_string());
            }
        }
    }

    /// Exchange records until neither side has anything to say.
    fn pump(&mut self, worker: &mut Worker, client: &mut ClientConnection) {
        for _ in 0..32 {
            let mut records = Vec::new();
            while client.wants_write() {
                client.write_tls(&mut records).unwrap();
            }
            if !records.is_empty() {
                send(worker, data(self.routed_id, self.sequence, &records));
                self.sequence += records.len() as u64;
            }
            let egress = worker.take_egress();
            if egress.is_empty() && records.is_empty() {
                return;
            }
            self.collect(egress, Some(&mut *client));
            if self.error.is_some() {
                return;
            }
        }
    }

    fn saw(&self, type_id: u32) -> bool {
        self.frames.contains(&type_id)
    }
}

#[test]
fn test_server_negotiates_route_alpn_and_echoes() {
    let credentials = Credentials::generate();
    let (mut worker, sink) = worker(&server_binding("", ALPN_ROUTES), &credentials);
    let tls = id("tls");

    let mut network = Network::open(&mut worker, tls, &ProxyBeginEx::new());
    assert!(network.saw(BEGIN));
    assert!(network.saw(WINDOW));

    // Routes are tried in order, so h2 wins over the client's first choice.
    let mut client = client(&credentials, &["http/1.1", "h2"]);
    network.pump(&mut worker, &mut client);
    assert_eq!(network.error, None);
    assert!(!client.is_handshaking());
    assert_eq!(client.alpn_protocol(), Some(&b"h2"[..]));
    assert_eq!(sink.get(EventKind::StreamsOpened, id("h2app")), 1);
    assert_eq!(sink.get(EventKind::StreamsOpened, id("app")), 0);

    client.writer().write_all(b"ping").unwrap();
    network.pump(&mut worker, &mut client);
    let mut echoed = [0u8; 4];
    client.reader().read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"ping");

    assert_eq!(sink.get(EventKind::HandshakeFailures, tls), 0);
    assert_eq!(worker.stats().handlers, 2);
}

#[test]
fn test_server_picks_client_protocol_when_only_one_route_accepts() {
    let credentials = Credentials::generate();
    let (mut worker, sink) = worker(&server_binding("", ALPN_ROUTES), &credentials);

    let mut network = Network::open(&mut worker, id("tls"), &ProxyBeginEx::new());
    let mut client = client(&credentials, &["http/1.1"]);
    network.pump(&mut worker, &mut client);

    assert_eq!(client.alpn_protocol(), Some(&b"http/1.1"[..]));
    assert_eq!(sink.get(EventKind::StreamsOpened, id("app")), 1);
}

#[test]
fn test_server_refuses_unroutable_protocol() {
    let credentials = Credentials::generate();
    let (mut worker, sink) = worker(&server_binding("", ALPN_ROUTES), &credentials);
    let tls = id("tls");

    let mut network = Network::open(&mut worker, tls, &ProxyBeginEx::new());
    let mut client = client(&credentials, &["spdy/3"]);
    network.pump(&mut worker, &mut client);

    assert!(network.error.is_some());
    assert!(network.saw(ABORT));
    assert!(network.saw(RESET));
    assert_eq!(sink.get(EventKind::HandshakeFailures, tls), 1);
    assert_eq!(worker.stats().handlers, 0);
}

#[test]
fn test_server_port_miss_resets_before_handshake() {
    let credentials = Credentials::generate();
    let routes = r#"
[[bindings.routes]]
exit = "app"

[[bindings.routes.when]]
port = 443
"#;
    let (mut worker, sink) = worker(&server_binding("", routes), &credentials);
    let tls = id("tls");

    send(&mut worker, begin(tls, &ProxyBeginEx::new().with_port(8443)));
    let egress = worker.take_egress();
    assert_eq!(egress.iter().map(|f| f.type_id).collect::<Vec<_>>(), vec![RESET]);
    assert_eq!(sink.get(EventKind::RouteMisses, tls), 1);
    assert_eq!(worker.stats().handlers, 0);
}

#[test]
fn test_mutual_required_rejects_anonymous_client() {
    let credentials = Credentials::generate();
    let options = r#"
trust = ["clients"]
mutual = "required"
"#;
    let routes = r#"
[[bindings.routes]]
exit = "app"
"#;
    let (mut worker, sink) = worker(&server_binding(options, routes), &credentials);
    let tls = id("tls");

    let mut network = Network::open(&mut worker, tls, &ProxyBeginEx::new());
    let mut client = client(&credentials, &[]);
    network.pump(&mut worker, &mut client);

    assert!(network.error.is_some());
    assert!(network.saw(ABORT));
    assert!(network.saw(RESET));
    assert_eq!(sink.get(EventKind::HandshakeFailures, tls), 1);
    assert_eq!(sink.get(EventKind::StreamsOpened, id("app")), 0);
}

fn late_timer() -> Instant {
    Instant::now() + TlsOptions::default().handshake_timeout() + Duration::from_secs(1)
}

#[test]
fn test_server_handshake_times_out() {
    let credentials = Credentials::generate();
    let routes = r#"
[[bindings.routes]]
exit = "app"
"#;
    let (mut worker, sink) = worker(&server_binding("", routes), &credentials);
    let tls = id("tls");

    let mut network = Network::open(&mut worker, tls, &ProxyBeginEx::new());
    let mut client = client(&credentials, &[]);
    let mut hello = Vec::new();
    while client.wants_write() {
        client.write_tls(&mut hello).unwrap();
    }
    send(&mut worker, data(tls, 0, &hello));
    network.collect(worker.take_egress(), None);
    assert!(!network.saw(ABORT));
    assert_eq!(worker.stats().timers, 1);

    worker.on_timers(late_timer());
    network.collect(worker.take_egress(), None);

    assert!(network.saw(ABORT));
    assert!(network.saw(RESET));
    assert_eq!(sink.get(EventKind::HandshakeFailures, tls), 1);
    assert_eq!(sink.get(EventKind::StreamsOpened, id("app")), 0);
    assert_eq!(worker.stats().handlers, 0);
}

#[test]
fn test_server_ignores_timeout_signal_after_handshake() {
    let credentials = Credentials::generate();
    let (mut worker, sink) = worker(&server_binding("", ALPN_ROUTES), &credentials);
    let tls = id("tls");

    let mut network = Network::open(&mut worker, tls, &ProxyBeginEx::new());
    let mut client = client(&credentials, &["h2"]);
    network.pump(&mut worker, &mut client);
    assert!(!client.is_handshaking());

    worker.on_timers(late_timer());
    send(
        &mut worker,
        encode(&Frame::Signal(SignalFrame {
            header: FrameHeader::new(ORIGIN, tls, reply_id(STREAM)),
            cancel_id: 0,
            signal_id: HANDSHAKE_TIMEOUT,
            context_id: 0,
            payload: &[],
        })),
    );
    network.collect(worker.take_egress(), Some(&mut client));
    assert!(!network.saw(ABORT));
    assert!(!network.saw(RESET));

    client.writer().write_all(b"still up").unwrap();
    network.pump(&mut worker, &mut client);
    let mut echoed = [0u8; 8];
    client.reader().read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"still up");
    assert_eq!(sink.get(EventKind::HandshakeFailures, tls), 0);
    assert_eq!(worker.stats().handlers, 2);
}

const MUTUAL_REQUESTED: &str = r#"
trust = ["clients"]
mutual = "requested"
"#;

const ANY_ROUTE: &str = r#"
[[bindings.routes]]
exit = "app"
"#;

#[test]
fn test_mutual_requested_accepts_anonymous_client() {
    let credentials = Credentials::generate();
    let (mut worker, sink) = worker(&server_binding(MUTUAL_REQUESTED, ANY_ROUTE), &credentials);
    let tls = id("tls");

    let mut network = Network::open(&mut worker, tls, &ProxyBeginEx::new());
    let mut client = client(&credentials, &[]);
    network.pump(&mut worker, &mut client);

    assert_eq!(network.error, None);
    assert!(!client.is_handshaking());
    assert_eq!(sink.get(EventKind::HandshakeFailures, tls), 0);
    assert_eq!(sink.get(EventKind::StreamsOpened, id("app")), 1);
}

#[test]
fn test_mutual_requested_accepts_trusted_client_certificate() {
    let credentials = Credentials::generate();
    let (mut worker, sink) = worker(&server_binding(MUTUAL_REQUESTED, ANY_ROUTE), &credentials);
    let tls = id("tls");

    let mut network = Network::open(&mut worker, tls, &ProxyBeginEx::new());
    let mut client = client_as(&credentials, &[], Some(&credentials.stranger));
    network.pump(&mut worker, &mut client);

    assert_eq!(network.error, None);
    assert!(!client.is_handshaking());
    assert_eq!(sink.get(EventKind::StreamsOpened, id("app")), 1);

    client.writer().write_all(b"signed").unwrap();
    network.pump(&mut worker, &mut client);
    let mut echoed = [0u8; 6];
    client.reader().read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"signed");
    assert_eq!(sink.get(EventKind::HandshakeFailures, tls), 0);
}

const CHAIN: &str = r#"
[[vaults]]
name = "certs"

[[bindings]]
name = "client"
type = "tls"
kind = "client"
vault = "certs"

[bindings.options]
trust = ["localhost"]
alpn = ["h2"]

[[bindings.routes]]
exit = "server"

[[bindings.routes.when]]
authority = "localhost"

[[bindings]]
name = "server"
type = "tls"
kind = "server"
vault = "certs"

[bindings.options]
keys = ["localhost"]

[[bindings.routes]]
exit = "app"

[[bindings.routes.when]]
alpn = "h2"

[[bindings]]
name = "app"
type = "echo"
"#;

#[test]
fn test_client_binding_handshakes_with_server_binding() {
    let credentials = Credentials::generate();
    let (mut worker, sink) = worker(CHAIN, &credentials);
    let client = id("client");

    send(&mut worker, begin(client, &ProxyBeginEx::new().with_authority("localhost")));
    let opened: Vec<u32> = worker.take_egress().iter().map(|f| f.type_id).collect();
    assert!(opened.contains(&BEGIN));
    assert!(opened.contains(&WINDOW));
    assert_eq!(sink.get(EventKind::StreamsOpened, id("app")), 1);
    assert_eq!(worker.stats().handlers, 3);

    send(&mut worker, window(client, reply_id(STREAM)));
    send(&mut worker, data(client, 0, b"through tls"));

    let mut plaintext = Vec::new();
    for frame in worker.take_egress() {
        if frame.type_id != DATA {
            continue;
        }
        let Frame::Data(data) = frame.decode().unwrap() else {
            unreachable!();
        };
        assert_eq!(data.header.stream_id, reply_id(STREAM));
        plaintext.extend_from_slice(data.payload);
    }
    assert_eq!(plaintext, b"through tls");
    assert_eq!(sink.get(EventKind::HandshakeFailures, client), 0);
    assert_eq!(sink.get(EventKind::HandshakeFailures, id("server")), 0);
}

#[test]
fn test_client_route_miss_resets_application() {
    let credentials = Credentials::generate();
    let (mut worker, sink) = worker(CHAIN, &credentials);
    let client = id("client");

    send(&mut worker, begin(client, &ProxyBeginEx::new().with_authority("elsewhere.test")));
    let egress = worker.take_egress();
    assert_eq!(egress.iter().map(|f| f.type_id).collect::<Vec<_>>(), vec![RESET]);
    assert_eq!(sink.get(EventKind::RouteMisses, client), 1);
}

/// Accepts every stream and never answers, so a handshake toward it stalls.
struct SilentBinding;

struct SilentStream;

impl BindingHandler for SilentBinding {
    fn new_stream(
        &self,
        _type_id: u32,
        _buffer: &[u8],
        _ctx: &mut StreamContext<'_>,
    ) -> Option<Box<dyn StreamHandler>> {
        Some(Box::new(SilentStream))
    }
}

impl StreamHandler for SilentStream {
    fn on_frame(&mut self, _frame: &Frame<'_>, _ctx: &mut StreamContext<'_>) {}

    fn is_closed(&self) -> bool {
        false
    }
}

fn attach_silent(
    _entry: &BindingEntry,
    _ctx: &AttachContext<'_>,
) -> Result<Arc<dyn BindingHandler>, AttachError> {
    Ok(Arc::new(SilentBinding))
}

const STALLED: &str = r#"
[[vaults]]
name = "certs"

[[bindings]]
name = "client"
type = "tls"
kind = "client"
vault = "certs"

[bindings.options]
trust = ["localhost"]

[[bindings.routes]]
exit = "peer"

[[bindings]]
name = "peer"
type = "silent"
"#;

#[test]
fn test_client_handshake_times_out() {
    let credentials = Credentials::generate();
    let factory = BindingFactory::new().with_type("silent", attach_silent);
    let (mut worker, sink) = worker_with_factory(STALLED, &credentials, &factory);
    let client = id("client");

    send(&mut worker, begin(client, &ProxyBeginEx::new().with_authority("localhost")));
    let opened: Vec<u32> = worker.take_egress().iter().map(|f| f.type_id).collect();
    assert!(opened.contains(&BEGIN));
    assert!(!opened.contains(&ABORT));
    assert_eq!(worker.stats().timers, 1);

    worker.on_timers(late_timer());
    let failed: Vec<u32> = worker.take_egress().iter().map(|f| f.type_id).collect();
    assert!(failed.contains(&ABORT));
    assert!(failed.contains(&RESET));
    assert_eq!(sink.get(EventKind::HandshakeFailures, client), 1);
}
