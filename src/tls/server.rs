//! TLS server binding.
//!
//! Terminates TLS on streams opened by the network side and opens a
//! plaintext stream towards the route chosen from the negotiated server name
//! and protocol.

use std::sync::Arc;

use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::server::danger::ClientCertVerifier;
use tokio_rustls::rustls::server::{
    AcceptedAlert, Acceptor, ClientHello, ResolvesServerCert, WebPkiClientVerifier,
};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::ServerConfig;
use tracing::{debug, warn};

use super::alpn::{select_alpn, AlpnSelection};
use super::config::{TlsMutual, TlsOptions};
use super::error::{TlsError, TlsResult};
use super::session::{TlsPipe, TlsSession};
use super::vault::{root_store, CertificateBundle, Vault};
use crate::binding::{
    reply_id, BindingHandler, Inbound, NoopStream, Outbound, StreamError, StreamHandler,
    StreamResult, Transition,
};
use crate::engine::{EventKind, StreamContext};
use crate::frame::{Frame, ProxyBeginEx, BEGIN};
use crate::route::RouteResolver;

/// Signal id of the handshake timer.
pub const HANDSHAKE_TIMEOUT: u32 = 1;

/// Picks the key whose SNI names match the ClientHello, else the first key.
#[derive(Debug)]
struct KeyResolver {
    keys: Vec<(CertificateBundle, Arc<CertifiedKey>)>,
}

impl KeyResolver {
    fn new(bundles: Vec<CertificateBundle>) -> TlsResult<Self> {
        let keys = bundles
            .into_iter()
            .map(|bundle| {
                let certified = bundle.certified_key()?;
                Ok((bundle, certified))
            })
            .collect::<TlsResult<Vec<_>>>()?;
        Ok(Self { keys })
    }
}

impl ResolvesServerCert for KeyResolver {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        hello
            .server_name()
            .and_then(|name| self.keys.iter().find(|(bundle, _)| bundle.matches_sni(name)))
            .or_else(|| self.keys.first())
            .map(|(_, certified)| Arc::clone(certified))
    }
}

fn client_verifier(options: &TlsOptions, vault: &dyn Vault) -> TlsResult<Arc<dyn ClientCertVerifier>> {
    if options.trust.is_empty() && !options.trustcacerts {
        return Err(TlsError::ConfigError {
            message: "mutual authentication requires trust".to_string(),
        });
    }
    let roots = root_store(vault, &options.trust, options.trustcacerts)?;
    let builder = WebPkiClientVerifier::builder_with_provider(
        Arc::new(roots),
        Arc::new(ring::default_provider()),
    );
    let builder = if options.mutual == TlsMutual::Requested {
        builder.allow_unauthenticated()
    } else {
        builder
    };
    builder.build().map_err(|e| TlsError::ConfigError {
        message: e.to_string(),
    })
}

/// Base server configuration: keys, client verification and protocol
/// versions. ALPN is set per connection.
///
/// # Errors
///
/// Returns an error if no key is configured, a key or trust alias cannot be
/// loaded, or rustls rejects the material.
pub fn server_config(options: &TlsOptions, vault: &dyn Vault) -> TlsResult<ServerConfig> {
    if options.keys.is_empty() {
        return Err(TlsError::ConfigError {
            message: "server requires at least one key".to_string(),
        });
    }
    let bundles = options
        .keys
        .iter()
        .map(|alias| vault.key(alias))
        .collect::<TlsResult<Vec<_>>>()?;
    let resolver = KeyResolver::new(bundles)?;

    let builder = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?;
    let builder = match options.mutual {
        TlsMutual::None => builder.with_no_client_auth(),
        TlsMutual::Requested | TlsMutual::Required => {
            builder.with_client_cert_verifier(client_verifier(options, vault)?)
        }
    };
    Ok(builder.with_cert_resolver(Arc::new(resolver)))
}

struct ServerShared {
    binding_id: u64,
    options: TlsOptions,
    resolver: RouteResolver,
    config: ServerConfig,
}

impl ServerShared {
    fn config_for(&self, selection: &AlpnSelection) -> Arc<ServerConfig> {
        let mut config = self.config.clone();
        config.alpn_protocols = selection.protocols();
        Arc::new(config)
    }
}

/// Server side of the `tls` binding.
pub struct TlsServerBinding {
    shared: Arc<ServerShared>,
}

impl TlsServerBinding {
    /// Load credentials and build the binding.
    ///
    /// # Errors
    ///
    /// Returns a credential error when keys or trust are missing or
    /// malformed.
    pub fn new(
        binding_id: u64,
        options: TlsOptions,
        resolver: RouteResolver,
        vault: &dyn Vault,
    ) -> TlsResult<Self> {
        let config = server_config(&options, vault)?;
        debug!(
            binding = binding_id,
            keys = ?options.keys,
            mutual = ?options.mutual,
            "TLS server binding ready"
        );
        Ok(Self {
            shared: Arc::new(ServerShared {
                binding_id,
                options,
                resolver,
                config,
            }),
        })
    }
}

impl BindingHandler for TlsServerBinding {
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
        let binding_id = self.shared.binding_id;

        if self
            .shared
            .resolver
            .resolve_port_only(begin.authorization, hints.port)
            .is_none()
        {
            debug!(
                binding = binding_id,
                stream = begin.header.stream_id,
                port = ?hints.port,
                "No route for port"
            );
            ctx.record(EventKind::RouteMisses, binding_id, 1);
            ctx.record(EventKind::Resets, binding_id, 1);
            let mut inbound = Inbound::new();
            if inbound.accept(&Frame::Begin(begin)).is_ok() {
                inbound.reset(ctx);
            }
            return Some(Box::new(NoopStream));
        }

        let header = begin.header;
        ctx.record(EventKind::StreamsOpened, binding_id, 1);
        let cipher_out = Outbound::new(
            header.origin_id,
            header.routed_id,
            reply_id(header.stream_id),
            header.trace_id,
        );

        Some(Box::new(TlsServerStream {
            shared: Arc::clone(&self.shared),
            pipe: TlsPipe::new(self.shared.options.window, cipher_out, Outbound::default()),
            acceptor: Some(Acceptor::default()),
            authorization: begin.authorization,
            affinity: begin.affinity,
            port: hints.port,
            server_name: None,
            timer: None,
            routed: false,
            failed: false,
        }))
    }
}

struct TlsServerStream {
    shared: Arc<ServerShared>,
    pipe: TlsPipe,
    acceptor: Option<Acceptor>,
    authorization: u64,
    affinity: u64,
    port: Option<u16>,
    server_name: Option<String>,
    timer: Option<u64>,
    routed: bool,
    failed: bool,
}

impl TlsServerStream {
    fn binding_id(&self) -> u64 {
        self.shared.binding_id
    }

    fn fail_handshake(&mut self, ctx: &mut StreamContext<'_>, reason: &str) {
        warn!(
            binding = self.binding_id(),
            stream = self.pipe.cipher_in.stream_id,
            server_name = ?self.server_name,
            reason = %reason,
            "TLS handshake failed"
        );
        ctx.record(EventKind::HandshakeFailures, self.binding_id(), 1);
        ctx.record(EventKind::Resets, self.binding_id(), 1);
        if let Some(timer) = self.timer.take() {
            ctx.cancel(timer);
        }
        self.acceptor = None;
        self.pipe.fail_with_alert(ctx);
        self.failed = true;
    }

    fn fail(&mut self, ctx: &mut StreamContext<'_>, error: &StreamError) {
        warn!(
            binding = self.binding_id(),
            stream = self.pipe.cipher_in.stream_id,
            error = %error,
            "TLS stream stopped"
        );
        if matches!(error, StreamError::FlowControlViolation(_)) {
            ctx.record(EventKind::FlowViolations, self.binding_id(), 1);
        }
        ctx.record(EventKind::Resets, self.binding_id(), 1);
        if let Some(timer) = self.timer.take() {
            ctx.cancel(timer);
        }
        self.pipe.teardown(ctx);
        self.failed = true;
    }

    fn queue_alert(&mut self, mut alert: AcceptedAlert) {
        let mut bytes = Vec::new();
        while let Ok(written) = alert.write(&mut bytes) {
            if written == 0 {
                break;
            }
        }
        self.pipe.queue_ciphertext(&bytes);
    }

    /// Feed the ClientHello reader. Returns `false` once the handshake failed.
    fn accept_hello(&mut self, mut payload: &[u8], ctx: &mut StreamContext<'_>) -> bool {
        let Some(acceptor) = self.acceptor.as_mut() else {
            return true;
        };
        while !payload.is_empty() {
            match acceptor.read_tls(&mut payload) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    self.fail_handshake(ctx, &e.to_string());
                    return false;
                }
            }
        }

        let accepted = match acceptor.accept() {
            Ok(None) => return true,
            Ok(Some(accepted)) => accepted,
            Err((error, alert)) => {
                self.queue_alert(alert);
                self.fail_handshake(ctx, &error.to_string());
                return false;
            }
        };
        self.acceptor = None;

        let hello = accepted.client_hello();
        let server_name = hello.server_name().map(str::to_string);
        let offered: Vec<String> = hello
            .alpn()
            .map(|protocols| {
                protocols
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .collect()
            })
            .unwrap_or_default();
        let selection = select_alpn(
            &self.shared.resolver,
            &self.shared.options,
            self.authorization,
            server_name.as_deref(),
            &offered,
            self.port,
        );
        debug!(
            binding = self.binding_id(),
            server_name = ?server_name,
            offered = ?offered,
            selection = ?selection,
            "ClientHello read"
        );
        self.server_name = server_name;

        match accepted.into_connection(self.shared.config_for(&selection)) {
            Ok(conn) => {
                self.pipe.session = Some(TlsSession::new(conn));
                self.pipe.pump();
                true
            }
            Err((error, alert)) => {
                self.queue_alert(alert);
                self.fail_handshake(ctx, &error.to_string());
                false
            }
        }
    }

    /// Open the application stream once the handshake is done.
    fn route(&mut self, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        if let Some(timer) = self.timer.take() {
            ctx.cancel(timer);
        }
        self.routed = true;

        let alpn = self.pipe.session.as_ref().and_then(TlsSession::alpn);
        let route = self.shared.resolver.resolve(
            self.authorization,
            self.server_name.as_deref(),
            alpn.as_deref(),
            self.port,
        );
        let Some(route) = route else {
            let error = StreamError::RouteNotFound {
                binding_id: self.binding_id(),
                authority: self.server_name.clone(),
                alpn,
            };
            debug!(binding = self.binding_id(), error = %error, "Closing TLS stream");
            ctx.record(EventKind::RouteMisses, self.binding_id(), 1);
            self.pipe.end_plaintext();
            self.pipe.fail_with_alert(ctx);
            self.failed = true;
            return Ok(());
        };

        let mut hints = ProxyBeginEx::new();
        if let Some(name) = &self.server_name {
            hints = hints.with_authority(name.clone());
        }
        if let Some(protocol) = &alpn {
            hints = hints.with_alpn(protocol.clone());
        }
        if let Some(port) = self.port {
            hints = hints.with_port(port);
        }
        let extension = hints.encode()?;

        let exit = route.exit;
        let stream_id = ctx.supply_initial_id_with_affinity(exit, self.affinity);
        self.pipe.plain_out = Outbound::new(
            self.binding_id(),
            exit,
            stream_id,
            self.pipe.cipher_out.trace_id,
        );
        self.pipe
            .plain_out
            .begin(ctx, self.authorization, self.affinity, &extension)
    }

    fn on_network(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        if self.pipe.cipher_in.accept(frame)? == Transition::Drop {
            return Ok(());
        }
        match frame {
            Frame::Begin(begin) => {
                self.pipe.cipher_out.begin(ctx, 0, 0, &[])?;
                self.pipe.cipher_in.window(ctx, 0, self.pipe.window)?;
                let out = &self.pipe.cipher_out;
                let deadline = ctx.now() + self.shared.options.handshake_timeout();
                self.timer = Some(ctx.schedule(
                    deadline,
                    out.origin_id,
                    out.routed_id,
                    out.stream_id,
                    HANDSHAKE_TIMEOUT,
                ));
                debug!(
                    binding = self.binding_id(),
                    stream = begin.header.stream_id,
                    "TLS stream opened"
                );
            }
            Frame::Data(data) => {
                ctx.record(EventKind::BytesReceived, self.binding_id(), data.payload.len() as u64);
                if self.acceptor.is_some() {
                    if !self.accept_hello(data.payload, ctx) {
                        return Ok(());
                    }
                } else if let Err(error) = self.pipe.on_ciphertext(data.payload) {
                    if self.routed {
                        return Err(StreamError::HandshakeFailure(error.to_string()));
                    }
                    self.fail_handshake(ctx, &error.to_string());
                    return Ok(());
                }
                if !self.routed && self.pipe.is_established() {
                    self.route(ctx)?;
                }
            }
            Frame::End(_) => self.pipe.end_ciphertext(),
            Frame::Abort(_) => {
                self.pipe.teardown(ctx);
                self.failed = true;
                return Ok(());
            }
            _ => {}
        }
        self.flush(ctx)
    }

    fn on_network_throttle(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        if let Frame::Signal(signal) = frame {
            if signal.signal_id == HANDSHAKE_TIMEOUT && !self.routed && self.timer.is_some() {
                self.timer = None;
                self.fail_handshake(ctx, "handshake timed out");
            }
            return Ok(());
        }
        if self.pipe.cipher_out.on_throttle(frame)? == Transition::Drop {
            return Ok(());
        }
        if let Frame::Reset(_) = frame {
            self.pipe.teardown(ctx);
            self.failed = true;
            return Ok(());
        }
        self.flush(ctx)
    }

    fn on_application(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        if self.pipe.plain_in.accept(frame)? == Transition::Drop {
            return Ok(());
        }
        match frame {
            Frame::Begin(_) => self.pipe.plain_in.window(ctx, 0, self.pipe.window)?,
            Frame::Data(data) => {
                self.pipe
                    .on_plaintext(data.payload)
                    .map_err(|e| StreamError::HandshakeFailure(e.to_string()))?;
            }
            Frame::End(_) => self.pipe.end_plaintext(),
            Frame::Abort(_) => {
                self.pipe.teardown(ctx);
                self.failed = true;
                return Ok(());
            }
            _ => {}
        }
        self.flush(ctx)
    }

    fn on_application_throttle(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        if self.pipe.plain_out.on_throttle(frame)? == Transition::Drop {
            return Ok(());
        }
        if let Frame::Reset(_) = frame {
            self.pipe.teardown(ctx);
            self.failed = true;
            return Ok(());
        }
        self.flush(ctx)
    }

    fn flush(&mut self, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        self.pipe.flush(ctx)
    }
}

impl StreamHandler for TlsServerStream {
    fn on_frame(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) {
        if self.failed {
            return;
        }
        let stream_id = frame.stream_id();
        let throttle = frame.is_throttle();
        let app_id = self.pipe.plain_out.stream_id;

        let result = if throttle && stream_id == self.pipe.cipher_out.stream_id {
            self.on_network_throttle(frame, ctx)
        } else if self.routed && throttle && stream_id == app_id {
            self.on_application_throttle(frame, ctx)
        } else if self.routed && !throttle && stream_id == reply_id(app_id) {
            self.on_application(frame, ctx)
        } else if !throttle {
            self.on_network(frame, ctx)
        } else {
            Ok(())
        };

        if let Err(error) = result {
            self.fail(ctx, &error);
        }
    }

    fn on_budget_credit(&mut self, _budget_id: u64, ctx: &mut StreamContext<'_>) {
        if self.failed {
            return;
        }
        if let Err(error) = self.flush(ctx) {
            self.fail(ctx, &error);
        }
    }

    fn is_closed(&self) -> bool {
        self.failed || self.pipe.is_closed()
    }
}
