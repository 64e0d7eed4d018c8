#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! rulebookd library: the building blocks of the coordinator.
//!
//! - `executions` — registry of runner executions and their event logs
//! - `runner` — command construction and process-group management
//! - `clients` — connected WebSocket peers and their roles
//! - `protocol` — every frame exchanged over the WebSocket
//! - `ws` — WebSocket transport and message routing
//! - `tunnel` — per-port webhook ingress, forwarding and public tunnels
//! - `diagnostics` — binary, prerequisite and collection checks
//! - `lifecycle` — janitor sweep and shutdown
//! - `auth`, `config`, `routes` — the HTTP shell around them

pub mod auth;
pub mod clients;
pub mod config;
pub mod diagnostics;
pub mod executions;
pub mod lifecycle;
pub mod protocol;
pub mod routes;
pub mod runner;
pub mod state;
pub mod tunnel;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use clients::ClientTable;
pub use config::Config;
pub use executions::ExecutionRegistry;
pub use state::AppState;
pub use tunnel::TunnelManager;
