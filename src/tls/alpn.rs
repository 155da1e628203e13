//! Handshake-time application protocol selection.

use super::config::TlsOptions;
use crate::route::RouteResolver;

/// Outcome of ALPN selection for one ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlpnSelection {
    /// Advertise this protocol only.
    Selected(String),
    /// Routes exist but none accepts an offered protocol. The empty protocol
    /// is advertised so a client offering ALPN is refused.
    NoAcceptable,
    /// No routes; ALPN is left out of the handshake.
    NotEngaged,
}

impl AlpnSelection {
    /// Protocol list for the per-connection server configuration.
    #[must_use]
    pub fn protocols(&self) -> Vec<Vec<u8>> {
        match self {
            Self::Selected(protocol) => vec![protocol.as_bytes().to_vec()],
            Self::NoAcceptable => vec![Vec::new()],
            Self::NotEngaged => Vec::new(),
        }
    }

    /// Selected protocol, if any.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        match self {
            Self::Selected(protocol) => Some(protocol),
            _ => None,
        }
    }
}

/// Pick the protocol to negotiate.
///
/// Routes are walked in declared order and, for each, the offered protocols
/// in the client's order; the first authorized route matching
/// `(server_name, protocol, port)` decides. Without a server name the route
/// must match on port and on protocol with no hostname.
#[must_use]
pub fn select_alpn(
    resolver: &RouteResolver,
    options: &TlsOptions,
    authorization: u64,
    server_name: Option<&str>,
    offered: &[String],
    port: Option<u16>,
) -> AlpnSelection {
    if resolver.is_empty() {
        return AlpnSelection::NotEngaged;
    }

    let offered: Vec<&str> = offered
        .iter()
        .map(String::as_str)
        .filter(|p| options.accepts_alpn(p))
        .collect();
    if server_name.is_some_and(|name| !options.accepts_sni(name)) {
        return AlpnSelection::NoAcceptable;
    }

    for route in resolver.routes() {
        if !route.authorized(authorization) {
            continue;
        }
        let selected = offered.iter().copied().find(|protocol| match server_name {
            Some(name) => route.matches(Some(name), Some(*protocol), port),
            None => route.matches_unnamed(Some(*protocol), port),
        });
        if let Some(protocol) = selected {
            return AlpnSelection::Selected(protocol.to_string());
        }
    }

    AlpnSelection::NoAcceptable
}
