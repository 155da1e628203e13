//! TLS client binding.
//!
//! Encrypts plaintext streams opened by the application side towards the
//! route chosen from their Begin hints.

use std::sync::Arc;

use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, ClientConnection};
use tracing::{debug, warn};

use super::config::TlsOptions;
use super::error::TlsResult;
use super::server::HANDSHAKE_TIMEOUT;
use super::session::{TlsPipe, TlsSession};
use super::vault::{root_store, Vault};
use crate::binding::{
    reply_id, BindingHandler, Inbound, NoopStream, Outbound, StreamError, StreamHandler,
    StreamResult, Transition,
};
use crate::engine::{EventKind, StreamContext};
use crate::frame::{BeginFrame, Frame, ProxyBeginEx, BEGIN};
use crate::route::RouteResolver;

/// Base client configuration: trust roots and an optional client
/// certificate. ALPN is set per stream.
///
/// # Errors
///
/// Returns an error if a trust or key alias cannot be loaded, or rustls
/// rejects the material.
pub fn client_config(options: &TlsOptions, vault: &dyn Vault) -> TlsResult<ClientConfig> {
    let roots = root_store(vault, &options.trust, options.trustcacerts)?;
    let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots);

    match options.keys.first() {
        Some(alias) => {
            let bundle = vault.key(alias)?;
            Ok(builder.with_client_auth_cert(
                bundle.certificates().to_vec(),
                bundle.private_key().clone_key(),
            )?)
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

struct ClientShared {
    binding_id: u64,
    options: TlsOptions,
    resolver: RouteResolver,
    config: ClientConfig,
}

/// Client side of the `tls` binding.
pub struct TlsClientBinding {
    shared: Arc<ClientShared>,
}

impl TlsClientBinding {
    /// Load credentials and build the binding.
    ///
    /// # Errors
    ///
    /// Returns a credential error when trust or the client key is missing or
    /// malformed.
    pub fn new(
        binding_id: u64,
        options: TlsOptions,
        resolver: RouteResolver,
        vault: &dyn Vault,
    ) -> TlsResult<Self> {
        let config = client_config(&options, vault)?;
        debug!(
            binding = binding_id,
            trust = ?options.trust,
            sni = ?options.sni,
            "TLS client binding ready"
        );
        Ok(Self {
            shared: Arc::new(ClientShared {
                binding_id,
                options,
                resolver,
                config,
            }),
        })
    }

    fn refuse(&self, begin: BeginFrame<'_>, ctx: &mut StreamContext<'_>, kind: EventKind) -> Box<dyn StreamHandler> {
        ctx.record(kind, self.shared.binding_id, 1);
        ctx.record(EventKind::Resets, self.shared.binding_id, 1);
        let mut inbound = Inbound::new();
        if inbound.accept(&Frame::Begin(begin)).is_ok() {
            inbound.reset(ctx);
        }
        Box::new(NoopStream)
    }
}

impl BindingHandler for TlsClientBinding {
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
        let shared = &self.shared;

        let route = shared.resolver.resolve(
            begin.authorization,
            hints.authority.as_deref(),
            hints.alpn.as_deref(),
            hints.port,
        );
        let Some(route) = route else {
            debug!(
                binding = shared.binding_id,
                stream = begin.header.stream_id,
                authority = ?hints.authority,
                "No route for stream"
            );
            return Some(self.refuse(begin, ctx, EventKind::RouteMisses));
        };

        let server_name = shared
            .options
            .sni
            .as_ref()
            .and_then(|names| names.first().cloned())
            .or_else(|| hints.authority.clone());
        let protocols = shared
            .options
            .alpn
            .clone()
            .or_else(|| hints.alpn.clone().map(|protocol| vec![protocol]))
            .unwrap_or_default();

        let connection = server_name
            .clone()
            .ok_or_else(|| "no server name".to_string())
            .and_then(|name| ServerName::try_from(name).map_err(|e| e.to_string()))
            .and_then(|name| {
                let mut config = shared.config.clone();
                config.alpn_protocols = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
                ClientConnection::new(Arc::new(config), name).map_err(|e| e.to_string())
            });
        let connection = match connection {
            Ok(connection) => connection,
            Err(reason) => {
                warn!(
                    binding = shared.binding_id,
                    stream = begin.header.stream_id,
                    server_name = ?server_name,
                    reason = %reason,
                    "Cannot start TLS client"
                );
                return Some(self.refuse(begin, ctx, EventKind::HandshakeFailures));
            }
        };

        let header = begin.header;
        let exit = route.exit;
        let network_id = ctx.supply_initial_id_with_affinity(exit, begin.affinity);
        ctx.record(EventKind::StreamsOpened, shared.binding_id, 1);

        let mut pipe = TlsPipe::new(
            shared.options.window,
            Outbound::new(shared.binding_id, exit, network_id, header.trace_id),
            Outbound::new(
                header.origin_id,
                header.routed_id,
                reply_id(header.stream_id),
                header.trace_id,
            ),
        );
        pipe.session = Some(TlsSession::new(connection));

        let mut network_hints = ProxyBeginEx::new();
        if let Some(name) = server_name {
            network_hints = network_hints.with_authority(name);
        }
        if let Some(port) = hints.port {
            network_hints = network_hints.with_port(port);
        }

        Some(Box::new(TlsClientStream {
            shared: Arc::clone(shared),
            pipe,
            hints: network_hints,
            authorization: begin.authorization,
            affinity: begin.affinity,
            timer: None,
            failed: false,
        }))
    }
}

struct TlsClientStream {
    shared: Arc<ClientShared>,
    pipe: TlsPipe,
    hints: ProxyBeginEx,
    authorization: u64,
    affinity: u64,
    timer: Option<u64>,
    failed: bool,
}

impl TlsClientStream {
    fn binding_id(&self) -> u64 {
        self.shared.binding_id
    }

    fn fail_handshake(&mut self, ctx: &mut StreamContext<'_>, reason: &str) {
        warn!(
            binding = self.binding_id(),
            stream = self.pipe.plain_in.stream_id,
            reason = %reason,
            "TLS handshake failed"
        );
        ctx.record(EventKind::HandshakeFailures, self.binding_id(), 1);
        ctx.record(EventKind::Resets, self.binding_id(), 1);
        if let Some(timer) = self.timer.take() {
            ctx.cancel(timer);
        }
        self.pipe.fail_with_alert(ctx);
        self.failed = true;
    }

    fn fail(&mut self, ctx: &mut StreamContext<'_>, error: &StreamError) {
        warn!(
            binding = self.binding_id(),
            stream = self.pipe.plain_in.stream_id,
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

    fn on_application(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        if self.pipe.plain_in.accept(frame)? == Transition::Drop {
            return Ok(());
        }
        match frame {
            Frame::Begin(_) => {
                self.pipe.plain_out.begin(ctx, 0, 0, &[])?;
                self.pipe.plain_in.window(ctx, 0, self.pipe.window)?;

                let extension = self.hints.encode()?;
                self.pipe
                    .cipher_out
                    .begin(ctx, self.authorization, self.affinity, &extension)?;
                self.pipe.pump();

                let out = &self.pipe.plain_out;
                let deadline = ctx.now() + self.shared.options.handshake_timeout();
                self.timer = Some(ctx.schedule(
                    deadline,
                    out.origin_id,
                    out.routed_id,
                    out.stream_id,
                    HANDSHAKE_TIMEOUT,
                ));
            }
            Frame::Data(data) => {
                ctx.record(EventKind::BytesReceived, self.binding_id(), data.payload.len() as u64);
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
        self.pipe.flush(ctx)
    }

    fn on_application_throttle(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        if let Frame::Signal(signal) = frame {
            if signal.signal_id == HANDSHAKE_TIMEOUT && !self.pipe.is_established() && self.timer.is_some() {
                self.timer = None;
                self.fail_handshake(ctx, "handshake timed out");
            }
            return Ok(());
        }
        if self.pipe.plain_out.on_throttle(frame)? == Transition::Drop {
            return Ok(());
        }
        if let Frame::Reset(_) = frame {
            self.pipe.teardown(ctx);
            self.failed = true;
            return Ok(());
        }
        self.pipe.flush(ctx)
    }

    fn on_network(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        if self.pipe.cipher_in.accept(frame)? == Transition::Drop {
            return Ok(());
        }
        match frame {
            Frame::Begin(_) => self.pipe.cipher_in.window(ctx, 0, self.pipe.window)?,
            Frame::Data(data) => {
                let was_established = self.pipe.is_established();
                if let Err(error) = self.pipe.on_ciphertext(data.payload) {
                    if was_established {
                        return Err(StreamError::HandshakeFailure(error.to_string()));
                    }
                    self.fail_handshake(ctx, &error.to_string());
                    return Ok(());
                }
                if !was_established && self.pipe.is_established() {
                    if let Some(timer) = self.timer.take() {
                        ctx.cancel(timer);
                    }
                    debug!(
                        binding = self.binding_id(),
                        alpn = ?self.pipe.session.as_ref().and_then(TlsSession::alpn),
                        "TLS client handshake complete"
                    );
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
        self.pipe.flush(ctx)
    }

    fn on_network_throttle(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        if self.pipe.cipher_out.on_throttle(frame)? == Transition::Drop {
            return Ok(());
        }
        if let Frame::Reset(_) = frame {
            self.pipe.teardown(ctx);
            self.failed = true;
            return Ok(());
        }
        self.pipe.flush(ctx)
    }
}

impl StreamHandler for TlsClientStream {
    fn on_frame(&mut self, frame: &Frame<'_>, ctx: &mut StreamContext<'_>) {
        if self.failed {
            return;
        }
        let stream_id = frame.stream_id();
        let throttle = frame.is_throttle();
        let network_id = self.pipe.cipher_out.stream_id;

        let result = if throttle && stream_id == network_id {
            self.on_network_throttle(frame, ctx)
        } else if !throttle && stream_id == reply_id(network_id) {
            self.on_network(frame, ctx)
        } else if throttle && stream_id == self.pipe.plain_out.stream_id {
            self.on_application_throttle(frame, ctx)
        } else if !throttle {
            self.on_application(frame, ctx)
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
        if let Err(error) = self.pipe.flush(ctx) {
            self.fail(ctx, &error);
        }
    }

    fn is_closed(&self) -> bool {
        self.failed || self.pipe.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{MemoryVault, TlsError};

    #[test]
    fn test_client_config_without_trust() {
        let vault = MemoryVault::new("client");
        let config = client_config(&TlsOptions::default(), &vault).unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_client_config_missing_material() {
        let vault = MemoryVault::new("client");
        let options = TlsOptions {
            trust: vec!["ca".to_string()],
            ..TlsOptions::default()
        };
        assert!(matches!(
            client_config(&options, &vault),
            Err(TlsError::MissingTrust { .. })
        ));

        let options = TlsOptions {
            keys: vec!["me".to_string()],
            ..TlsOptions::default()
        };
        assert!(matches!(
            client_config(&options, &vault),
            Err(TlsError::MissingKey { .. })
        ));
    }
}
