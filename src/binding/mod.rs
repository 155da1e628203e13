//! # Binding Handler Contract
//!
//! A binding is a configured endpoint that streams are routed to. When a
//! Begin arrives for a binding, the worker asks it for a [`StreamHandler`]
//! and from then on delivers every frame of that stream, in order, to the
//! handler.
//!
//! This module also carries the pieces every binding is built from:
//! stream id arithmetic, the half-stream state machine, ledger-checked
//! stream ends ([`Inbound`], [`Outbound`]) and the registry mapping a
//! configured binding type to its constructor.
//!
//! ## Built-in bindings
//!
//! - `proxy`: relays a stream to the route resolved from its Begin hints
//! - `echo`: reflects every payload back on the reply stream
//! - `tls`: see [`crate::tls`]

mod contract;
mod echo;
mod error;
mod factory;
mod half;
mod proxy;
mod state;
mod stream_id;

pub use contract::{BindingHandler, NoopStream, StreamHandler};
pub use echo::{EchoBinding, EchoOptions};
pub use error::{AttachError, StreamError, StreamResult};
pub use factory::{AttachContext, BindingConstructor, BindingFactory};
pub use half::{Inbound, Outbound};
pub use proxy::ProxyBinding;
pub use state::{HalfStream, HalfStreamState, Transition};
pub use stream_id::{
    initial_id, is_initial, opposite_id, reply_id, shard_of, StreamIdSupplier,
};
