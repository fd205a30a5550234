//! # Service Layer
//!
//! Server-side dispatch: interface registration, listening endpoints, and
//! the elastic worker pool that runs operation handlers.
//!
//! ## Components
//! - **Interface**: registry of interfaces and their operation tables
//! - **Server**: endpoints, accept loops, per-connection readers
//! - **Worker pool**: bounded, self-shrinking task pool for calls

pub mod interface;
pub mod server;
pub mod worker_pool;

pub use interface::{InterfaceFlags, InterfaceRegistry, OperationHandler, RegisteredInterface};
pub use server::RpcServer;
pub use worker_pool::{PoolStats, WorkerPool};
