//! Moves instructions between a client transport and guacd.
//!
//! - `pump` — the per-direction loops for primary and observer relays
//! - `handler` — [`Relay`]: config → tunnel → register → pump → teardown
//!
//! The relay never depends on a particular web framework. Outgoing frames go
//! through a [`FrameSink`]; incoming client messages are any
//! `Stream<Item = Result<String, RelayError>>`. A stream that ends or yields
//! an error is treated as the client going away.

pub mod handler;
pub mod pump;

use std::borrow::Cow;
use std::future::Future;
use std::io;

use tokio::sync::mpsc;

use crate::guac::instruction::{decode, split_frames, Instruction, INTERNAL_OPCODE};

pub use handler::{ObserverParams, PrimaryParams, Relay, RelaySettings};
pub use pump::PumpExit;

/// Message text for a client that simply went away.
pub const NORMAL_USER_EXIT: &str = "normal user exit";

/// Writer side of a client transport.
///
/// `write` may buffer; `flush` hands everything written so far to the
/// transport as one message.
pub trait FrameSink: Send {
    fn write(&mut self, frame: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> + Send;
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Channel-backed sink: every `write` becomes one message on the channel.
impl FrameSink for mpsc::Sender<String> {
    async fn write(&mut self, frame: &[u8]) -> io::Result<usize> {
        let text =
            std::str::from_utf8(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.send(text.to_string())
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(frame.len())
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Write every instruction, then flush once.
pub async fn send_instructions<W: FrameSink>(
    sink: &mut W,
    instructions: &[Instruction],
) -> io::Result<()> {
    for instruction in instructions {
        sink.write(instruction.encode().as_bytes()).await?;
    }
    sink.flush().await
}

/// Relay-internal instruction carrying the tunnel id, sent first on every
/// relay so the client can correlate the connection.
pub fn tunnel_uuid(id: &str) -> Instruction {
    Instruction::new(INTERNAL_OPCODE, [id])
}

/// One client message sorted for the relay.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Inbound<'a> {
    /// Instructions for guacd, in their original order and encoding.
    pub forward: Cow<'a, str>,
    /// Relay-internal pings to echo back to the client.
    pub replies: Vec<Instruction>,
}

/// Sort a client message into what goes to guacd and what the relay answers
/// itself. Clients may batch several instructions into one message; internal
/// ones are taken out and the rest is forwarded. A message that does not
/// split into whole instructions is forwarded untouched.
pub(crate) fn classify(message: &str) -> Inbound<'_> {
    let Ok(frames) = split_frames(message) else {
        return Inbound {
            forward: Cow::Borrowed(message),
            replies: Vec::new(),
        };
    };
    if !frames.iter().any(|f| is_internal_frame(f)) {
        return Inbound {
            forward: Cow::Borrowed(message),
            replies: Vec::new(),
        };
    }

    let mut inbound = Inbound::default();
    let mut forward = String::with_capacity(message.len());
    for frame in frames {
        if !is_internal_frame(frame) {
            forward.push_str(frame);
            continue;
        }
        match decode(frame) {
            Ok(ins) if ins.args().first().is_some_and(|a| a == "ping") => {
                inbound.replies.push(ins);
            }
            _ => {}
        }
    }
    inbound.forward = Cow::Owned(forward);
    inbound
}

fn is_internal_frame(frame: &str) -> bool {
    frame.starts_with("0.,") || frame.starts_with("0.;")
}
