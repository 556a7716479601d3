//! guacd wire protocol: instruction codec, connection settings and tunnels.
//!
//! - `instruction` — length-prefixed instruction encode/decode and the frame reader
//! - `config` — [`ConnectionConfig`] (select target + `args` values) and [`ClientInfo`]
//! - `tunnel` — TCP connection to guacd, handshake state machine, reader/writer halves
//! - `error` — [`ProtocolError`] and [`TunnelError`]

pub mod config;
pub mod error;
pub mod instruction;
pub mod tunnel;

pub use config::{ClientInfo, ConnectionConfig};
pub use error::{ProtocolError, TunnelError};
pub use instruction::{decode, encode, split_frames, Instruction, InstructionReader, ReadMode};
pub use tunnel::{HandshakeState, Tunnel, TunnelOptions, TunnelReader, TunnelWriter};
