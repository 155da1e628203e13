//! rustls connection driven by frames instead of sockets.
//!
//! Both TLS modes are the same pipe: ciphertext flows between the binding and
//! the network side, plaintext between the binding and the application side.
//! [`TlsPipe`] owns the four half-stream ends and the buffers between them;
//! the server and client handlers only differ in how the session starts and
//! where the route is resolved.

use std::io::{Read, Write};

use bytes::BytesMut;
use tokio_rustls::rustls::Connection;

use super::error::{TlsError, TlsResult};
use crate::binding::{Inbound, Outbound, StreamResult};
use crate::engine::StreamContext;

/// A rustls connection fed from byte slices.
pub struct TlsSession {
    conn: Connection,
}

impl TlsSession {
    /// Wrap a client or server connection.
    pub fn new(conn: impl Into<Connection>) -> Self {
        Self { conn: conn.into() }
    }

    /// Feed ciphertext and append any plaintext it yields to `plain`.
    ///
    /// # Errors
    ///
    /// Returns an error if the records are invalid or the handshake fails.
    /// Any alert rustls queued is still available from
    /// [`TlsSession::take_ciphertext`].
    pub fn receive(&mut self, mut ciphertext: &[u8], plain: &mut BytesMut) -> TlsResult<()> {
        while !ciphertext.is_empty() {
            let read = self
                .conn
                .read_tls(&mut ciphertext)
                .map_err(|e| TlsError::HandshakeError {
                    message: e.to_string(),
                })?;
            if read == 0 {
                break;
            }
            let state = self.conn.process_new_packets()?;
            let available = state.plaintext_bytes_to_read();
            if available > 0 {
                let start = plain.len();
                plain.resize(start + available, 0);
                self.conn
                    .reader()
                    .read_exact(&mut plain[start..])
                    .map_err(|e| TlsError::HandshakeError {
                        message: e.to_string(),
                    })?;
            }
        }
        Ok(())
    }

    /// Queue plaintext for encryption. Plaintext written during the
    /// handshake is held until it completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection refuses more plaintext.
    pub fn send(&mut self, plaintext: &[u8]) -> TlsResult<()> {
        self.conn
            .writer()
            .write_all(plaintext)
            .map_err(|e| TlsError::HandshakeError {
                message: e.to_string(),
            })
    }

    /// Move every pending TLS record into `out`.
    pub fn take_ciphertext(&mut self, out: &mut BytesMut) {
        let mut records = Vec::new();
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut records) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        out.extend_from_slice(&records);
    }

    /// Queue a close_notify alert.
    pub fn close(&mut self) {
        self.conn.send_close_notify();
    }

    /// Whether the handshake is still running.
    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Negotiated application protocol.
    #[must_use]
    pub fn alpn(&self) -> Option<String> {
        self.conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }
}

/// Four half-stream ends joined by a TLS session.
pub(crate) struct TlsPipe {
    pub(crate) window: u32,
    /// Ciphertext from the network side.
    pub(crate) cipher_in: Inbound,
    /// Ciphertext to the network side.
    pub(crate) cipher_out: Outbound,
    /// Plaintext from the application side.
    pub(crate) plain_in: Inbound,
    /// Plaintext to the application side.
    pub(crate) plain_out: Outbound,
    pub(crate) session: Option<TlsSession>,
    cipher_pending: BytesMut,
    plain_pending: BytesMut,
    cipher_ended: bool,
    plain_ended: bool,
}

impl TlsPipe {
    pub(crate) fn new(window: u32, cipher_out: Outbound, plain_out: Outbound) -> Self {
        Self {
            window,
            cipher_in: Inbound::new(),
            cipher_out,
            plain_in: Inbound::new(),
            plain_out,
            session: None,
            cipher_pending: BytesMut::new(),
            plain_pending: BytesMut::new(),
            cipher_ended: false,
            plain_ended: false,
        }
    }

    /// Decrypt ciphertext read from the network side.
    pub(crate) fn on_ciphertext(&mut self, ciphertext: &[u8]) -> TlsResult<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let result = session.receive(ciphertext, &mut self.plain_pending);
        session.take_ciphertext(&mut self.cipher_pending);
        result
    }

    /// Encrypt plaintext read from the application side.
    pub(crate) fn on_plaintext(&mut self, plaintext: &[u8]) -> TlsResult<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.send(plaintext)?;
        session.take_ciphertext(&mut self.cipher_pending);
        Ok(())
    }

    /// Collect records the session produced on its own, such as a
    /// ClientHello.
    pub(crate) fn pump(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.take_ciphertext(&mut self.cipher_pending);
        }
    }

    /// Queue raw bytes for the network side, such as an alert produced
    /// before a session exists.
    pub(crate) fn queue_ciphertext(&mut self, bytes: &[u8]) {
        self.cipher_pending.extend_from_slice(bytes);
    }

    /// The network side ended its ciphertext.
    pub(crate) fn end_ciphertext(&mut self) {
        self.cipher_ended = true;
    }

    /// The application side ended its plaintext; close the session.
    pub(crate) fn end_plaintext(&mut self) {
        self.plain_ended = true;
        if let Some(session) = self.session.as_mut() {
            session.close();
            session.take_ciphertext(&mut self.cipher_pending);
        }
    }

    /// Whether the handshake has completed.
    pub(crate) fn is_established(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_handshaking())
    }

    /// Send what the windows allow, propagate End once drained and
    /// acknowledge consumed input.
    pub(crate) fn flush(&mut self, ctx: &mut StreamContext<'_>) -> StreamResult<()> {
        self.cipher_out.drain(ctx, &mut self.cipher_pending)?;
        if self.plain_out.is_open() {
            self.plain_out.drain(ctx, &mut self.plain_pending)?;
        }

        if self.cipher_pending.is_empty() && self.plain_ended && self.cipher_out.is_open() {
            self.cipher_out.end(ctx)?;
        }
        if self.plain_pending.is_empty() && self.cipher_ended && self.plain_out.is_open() {
            self.plain_out.end(ctx)?;
        }

        if self.plain_pending.is_empty() {
            acknowledge(&mut self.cipher_in, ctx, self.window)?;
        }
        if self.cipher_pending.is_empty() {
            acknowledge(&mut self.plain_in, ctx, self.window)?;
        }
        Ok(())
    }

    /// Abort and reset every end.
    pub(crate) fn teardown(&mut self, ctx: &mut StreamContext<'_>) {
        self.cipher_pending.clear();
        self.plain_pending.clear();
        self.cipher_in.reset(ctx);
        self.cipher_out.abort(ctx);
        self.plain_out.abort(ctx);
        self.plain_in.reset(ctx);
    }

    /// Send what pending ciphertext the window allows, then abort the network
    /// reply and reset the network initial. Used to deliver a fatal alert.
    pub(crate) fn fail_with_alert(&mut self, ctx: &mut StreamContext<'_>) {
        let _ = self.cipher_out.drain(ctx, &mut self.cipher_pending);
        self.teardown(ctx);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cipher_in.is_closed()
            && self.cipher_out.is_closed()
            && (self.plain_in.is_closed() || !self.plain_in.is_open())
            && (self.plain_out.is_closed() || !self.plain_out.is_open())
    }
}

/// Acknowledge everything received on `inbound`.
fn acknowledge(inbound: &mut Inbound, ctx: &mut StreamContext<'_>, window: u32) -> StreamResult<()> {
    if !inbound.is_open() {
        return Ok(());
    }
    let ledger = inbound.ledger();
    let consumed = ledger.sequence() - ledger.acknowledge();
    if consumed > 0 {
        inbound.window(ctx, consumed, window)?;
    }
    Ok(())
}
