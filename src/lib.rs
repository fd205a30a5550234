//! # RPC Runtime
//!
//! A connection-oriented DCE/RPC runtime: bindings that resolve to pooled,
//! negotiated connections on the client, and a listening server that
//! dispatches requests to registered interfaces.
//!
//! ## Layers
//! - [`core`]: PDU headers, bodies, the fragment codec, reassembly
//! - [`transport`]: byte-stream channels per protocol sequence
//! - [`security`]: security contexts and packages
//! - [`protocol`]: connections, associations, bindings, messages
//! - [`service`]: the server dispatch engine
//! - [`runtime`]: process-wide registries with explicit init and teardown
//!
//! ## Example
//! ```rust,no_run
//! use rpc_runtime::prelude::*;
//! use uuid::Uuid;
//!
//! # async fn run() -> rpc_runtime::error::Result<()> {
//! let runtime = RpcRuntime::new(RuntimeConfig::default());
//! let echo = SyntaxId::new(Uuid::from_u128(0xec40), 1, 0);
//!
//! let server = RpcServer::new(runtime.clone());
//! let port = server.register_protseq("ncacn_ip_tcp", "", 16).await?;
//! server.register_interface(
//!     RegisteredInterface::new(echo, NDR_TRANSFER_SYNTAX)
//!         .with_operation(|msg: &mut Message| Ok(msg.response(msg.as_bytes()))),
//! )?;
//! server.listen(1, 16, true).await?;
//!
//! let mut binding = Binding::new(runtime.clone(), "ncacn_ip_tcp", "127.0.0.1", &port)?;
//! binding.bind(&echo, &NDR_TRANSFER_SYNTAX).await?;
//! let reply = binding.call(0, bytes::Bytes::from_static(b"hello")).await?;
//! assert_eq!(&reply[..], b"hello");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod security;
pub mod service;
pub mod transport;
pub mod utils;

/// Commonly used types.
pub mod prelude {
    pub use crate::config::RuntimeConfig;
    pub use crate::core::syntax::{SyntaxId, NDR_TRANSFER_SYNTAX};
    pub use crate::error::{Result, RpcError};
    pub use crate::protocol::binding::Binding;
    pub use crate::protocol::message::Message;
    pub use crate::runtime::RpcRuntime;
    pub use crate::security::{AuthLevel, Credential, KeyExchangeProvider};
    pub use crate::service::{InterfaceFlags, RegisteredInterface, RpcServer};
}
