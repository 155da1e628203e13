//! # R0N Dataplane
//!
//! Stream-transport core of the R0N gateway. Every connection is a pair of
//! framed, credit-flow-controlled half streams routed between bindings by
//! sharded workers.
//!
//! ## Features
//!
//! - Little-endian frame codec with zero-copy views
//! - Per-stream credit windows and shared budgets
//! - Route resolution on authority, ALPN and port hints
//! - TLS server and client bindings on rustls
//! - Content-hashed configuration generations with live reconfigure
//!
//! ## Architecture
//!
//! A binding implements [`binding::BindingHandler`] and hands out one
//! [`binding::StreamHandler`] per stream. The [`engine::Engine`] runs one
//! [`engine::Worker`] per shard; each worker owns the handlers of the streams
//! whose initial ids it owns and delivers their frames in order.
//!
//! ```text
//!  embedder ──dispatch──▶ Engine ──▶ Worker[shard] ──▶ StreamHandler
//!      ▲                               │   ▲
//!      └─────────────egress────────────┘   └── lanes from other shards
//! ```
//!
//! ## Configuration
//!
//! Bindings are declared in TOML and loaded by [`config::ConfigLoader`].
//! [`engine::Generation::attach`] turns a loaded configuration into handlers
//! through the [`binding::BindingFactory`].

pub mod binding;
pub mod budget;
pub mod config;
pub mod engine;
pub mod flow;
pub mod frame;
pub mod route;
pub mod tls;
