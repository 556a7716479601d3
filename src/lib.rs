#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! deskrelay library — a WebSocket relay between remote-desktop clients and guacd.
//!
//! One interactive viewer per session plus any number of read-only observers
//! that attach to the same guacd connection.
//!
//! - `guac` — guacd wire protocol: instruction codec, handshake, tunnels
//! - `relay` — pumps and orchestration (open, register, relay, tear down)
//! - `sessions` — live session registry, observers, close signals
//! - `records` — session records created by `POST /api/tunnels`
//! - `assets` — configured remote targets
//! - `routes` / `ws` — HTTP API and WebSocket upgrades
//! - `config` — configuration loading

pub mod assets;
pub mod config;
pub mod error;
pub mod guac;
pub mod records;
pub mod relay;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::{Disconnect, DisconnectCode, RelayError};
pub use relay::Relay;
pub use sessions::SessionManager;
pub use state::AppState;
