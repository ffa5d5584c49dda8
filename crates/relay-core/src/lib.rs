//! # relay-core
//!
//! Connection registry and broadcast fan-out for the relay hub.
//!
//! This crate provides the portable core of the server:
//!
//! - **ConnectionHandle** - One live client connection and its outbound sink
//! - **BroadcastRegistry** - Capped membership set plus hub-wide fan-out
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌───────────────────┐     ┌──────────────────┐
//! │  Transport  │────▶│ BroadcastRegistry │────▶│ ConnectionHandle │
//! │  callbacks  │     │  join/leave/count │     │   send(payload)  │
//! └─────────────┘     └───────────────────┘     └──────────────────┘
//! ```
//!
//! The transport layer (WebSocket upgrade, framing, socket I/O) lives in
//! `relay-server`; everything here is I/O-free and testable in isolation.

pub mod connection;
pub mod registry;

pub use connection::{ConnectionHandle, ConnectionId, MessageSink, TransportError};
pub use registry::{BroadcastRegistry, BroadcastReport, RegistryError, DEFAULT_MAX_CONNECTIONS};
