//! # Protocol Layer
//!
//! Client-side lifecycle of calls: associations and their connection pools,
//! bindings and the bind handshake, per-connection state, and the message
//! type exchanged with operation handlers.
//!
//! ## Components
//! - **Association**: registries and idle-connection pools
//! - **Binding**: caller handles and the bind handshake
//! - **Connection**: framed channel with negotiated state and security
//! - **Message**: marshalling boundary for handlers

pub mod association;
pub mod binding;
pub mod connection;
pub mod message;
