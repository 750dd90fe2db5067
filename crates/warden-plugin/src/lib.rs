//! Warden Plugin - Out-of-process evaluators
//!
//! Deciders, reporters and resolvers can live in separate executables. The
//! host talks to each one over its stdin/stdout with newline-delimited JSON.
//!
//! # Architecture
//!
//! ```text
//!   host process                              plugin process
//! ┌─────────────────────────┐            ┌─────────────────────────┐
//! │ PluginHandle            │            │ PluginServer            │
//! │  ├─ capabilities        │  stdin     │  ├─ handshake/configure │
//! │  └─ RpcClient ──────────┼───────────►│  ├─ task per request    │
//! │      pending[id]◄───────┼────────────┤  └─ cancel by id       │
//! └─────────────────────────┘  stdout    └─────────────────────────┘
//! ```
//!
//! A crashed plugin fails every pending call and every later call with a
//! transport error. It never produces `Accept` or `Block` on its own.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod process;
pub mod protocol;
pub mod server;
pub mod transport;

pub use error::{PluginError, Result};
pub use process::{PluginHandle, PluginStatsSnapshot};
pub use protocol::SCHEMA_VERSION;
pub use server::PluginServer;
pub use transport::RpcClient;
