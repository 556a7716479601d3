//! Per-direction relay loops.
//!
//! A primary relay runs two loops: backend → client in a spawned task, and
//! client → backend in the caller's task. An observer relay only runs
//! backend → client; its inbound messages are read so a departed viewer is
//! noticed, answered if they are internal pings, and otherwise dropped.
//!
//! Whichever loop finishes first fires the [`CloseSignal`], which wakes the
//! other one. The first reason recorded on the signal is the one reported to
//! the client, provided the client is still there to hear it.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn, Instrument};

use super::{classify, send_instructions, tunnel_uuid, FrameSink, NORMAL_USER_EXIT};
use crate::error::{Disconnect, DisconnectCode, RelayError};
use crate::guac::{Instruction, Tunnel, TunnelReader, TunnelWriter};
use crate::sessions::{CloseSignal, CloseWatch};

type SharedSink<W> = Arc<Mutex<W>>;

/// How long a closing relay waits for a stalled client to take the final
/// `error`/`disconnect`.
const CLIENT_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How a relay ended.
#[derive(Debug, Clone)]
pub struct PumpExit {
    /// First close reason recorded on the signal.
    pub disconnect: Disconnect,
    /// The client transport failed or closed, so nothing was sent to it.
    pub client_gone: bool,
}

/// Why one direction stopped.
#[derive(Debug)]
enum Ended {
    Client(Disconnect),
    Backend(Disconnect),
    Signal,
}

impl Ended {
    fn disconnect(&self) -> Option<&Disconnect> {
        match self {
            Self::Client(d) | Self::Backend(d) => Some(d),
            Self::Signal => None,
        }
    }
}

/// Relay an interactive session until either side leaves or `signal` fires.
pub async fn run_primary<S, W, C>(
    tunnel_id: &str,
    signal: CloseSignal,
    tunnel: Tunnel<S>,
    sink: W,
    mut client: C,
) -> PumpExit
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    W: FrameSink + 'static,
    C: Stream<Item = Result<String, RelayError>> + Unpin + Send,
{
    let (reader, mut writer) = tunnel.into_split();
    let sink = Arc::new(Mutex::new(sink));
    if let Err(e) = announce(&sink, tunnel_id).await {
        debug!("Client gone before relay start: {e}");
        signal.close(Disconnect::normal(NORMAL_USER_EXIT));
        return finish(&signal, &sink, true).await;
    }

    let backend = tokio::spawn(
        backend_to_client(reader, Arc::clone(&sink), signal.clone()).in_current_span(),
    );
    let client_end = client_to_backend(&mut client, &mut writer, &sink, signal.clone()).await;
    let backend_end = backend.await.unwrap_or_else(|e| {
        warn!("Backend relay task failed: {e}");
        Ended::Backend(Disconnect::new(DisconnectCode::TunnelClosed, e.to_string()))
    });
    writer.shutdown().await;

    let client_gone =
        matches!(client_end, Ended::Client(_)) || matches!(backend_end, Ended::Client(_));
    finish(&signal, &sink, client_gone).await
}

/// Relay a read-only view. There is no writer: observer input cannot reach
/// guacd.
pub async fn run_observer<S, W, C>(
    tunnel_id: &str,
    signal: CloseSignal,
    reader: TunnelReader<S>,
    sink: W,
    mut client: C,
) -> PumpExit
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    W: FrameSink + 'static,
    C: Stream<Item = Result<String, RelayError>> + Unpin + Send,
{
    let sink = Arc::new(Mutex::new(sink));
    if let Err(e) = announce(&sink, tunnel_id).await {
        debug!("Observer gone before relay start: {e}");
        signal.close(Disconnect::normal(NORMAL_USER_EXIT));
        return finish(&signal, &sink, true).await;
    }

    let backend = tokio::spawn(
        backend_to_client(reader, Arc::clone(&sink), signal.clone()).in_current_span(),
    );
    let client_end = drain_observer_input(&mut client, &sink, signal.clone()).await;
    let backend_end = backend.await.unwrap_or_else(|e| {
        warn!("Observer relay task failed: {e}");
        Ended::Backend(Disconnect::new(DisconnectCode::TunnelClosed, e.to_string()))
    });

    let client_gone =
        matches!(client_end, Ended::Client(_)) || matches!(backend_end, Ended::Client(_));
    finish(&signal, &sink, client_gone).await
}

/// Send `error`/`disconnect` to a client whose relay never started.
pub async fn reject<W: FrameSink>(mut sink: W, disconnect: &Disconnect) {
    if let Err(e) = send_instructions(&mut sink, &disconnect.instructions()).await {
        debug!("Could not deliver disconnect: {e}");
    }
    let _ = sink.close().await;
}

async fn announce<W: FrameSink>(sink: &SharedSink<W>, tunnel_id: &str) -> std::io::Result<()> {
    send_instructions(&mut *sink.lock().await, &[tunnel_uuid(tunnel_id)]).await
}

async fn write_frame<W: FrameSink>(sink: &SharedSink<W>, frame: &[u8]) -> std::io::Result<()> {
    let mut sink = sink.lock().await;
    sink.write(frame).await?;
    sink.flush().await
}

fn stop(signal: &CloseSignal, ended: Ended) -> Ended {
    if let Some(disconnect) = ended.disconnect() {
        signal.close(disconnect.clone());
    }
    ended
}

async fn backend_to_client<S, W>(
    mut reader: TunnelReader<S>,
    sink: SharedSink<W>,
    signal: CloseSignal,
) -> Ended
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: FrameSink,
{
    let mut watch: CloseWatch = signal.subscribe();
    loop {
        let frame = tokio::select! {
            _ = watch.closed() => return Ended::Signal,
            frame = reader.read_frame() => frame,
        };
        let ended = match frame {
            Ok(Some(frame)) => {
                if frame.is_empty() {
                    continue;
                }
                // A client that stops reading must not hold up a close.
                let written = tokio::select! {
                    _ = watch.closed() => return Ended::Signal,
                    written = write_frame(&sink, frame.as_bytes()) => written,
                };
                match written {
                    Ok(()) => continue,
                    Err(e) => {
                        debug!("Client write failed: {e}");
                        Ended::Client(Disconnect::normal(NORMAL_USER_EXIT))
                    }
                }
            }
            Ok(None) => {
                debug!(connection_id = %reader.connection_id(), "guacd closed the tunnel");
                Ended::Backend(Disconnect::normal("remote desktop closed the connection"))
            }
            Err(e) => {
                warn!(connection_id = %reader.connection_id(), "Tunnel read failed: {e}");
                Ended::Backend(Disconnect::new(DisconnectCode::TunnelClosed, e.to_string()))
            }
        };
        return stop(&signal, ended);
    }
}

async fn client_to_backend<S, W, C>(
    client: &mut C,
    writer: &mut TunnelWriter<S>,
    sink: &SharedSink<W>,
    signal: CloseSignal,
) -> Ended
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: FrameSink,
    C: Stream<Item = Result<String, RelayError>> + Unpin,
{
    let mut watch = signal.subscribe();
    loop {
        let message = tokio::select! {
            _ = watch.closed() => return Ended::Signal,
            message = client.next() => message,
        };
        let data = match message {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                debug!("Client read failed: {e}");
                return stop(&signal, Ended::Client(Disconnect::normal(NORMAL_USER_EXIT)));
            }
            None => return stop(&signal, Ended::Client(Disconnect::normal(NORMAL_USER_EXIT))),
        };
        if data.is_empty() {
            continue;
        }
        let inbound = classify(&data);
        if !inbound.forward.is_empty() {
            let written = tokio::select! {
                _ = watch.closed() => return Ended::Signal,
                written = writer.write_frame(inbound.forward.as_bytes()) => written,
            };
            if let Err(e) = written {
                warn!("Tunnel write failed: {e}");
                return stop(
                    &signal,
                    Ended::Backend(Disconnect::new(DisconnectCode::TunnelClosed, e.to_string())),
                );
            }
        }
        for reply in &inbound.replies {
            if let Err(ended) = reply_to_client(sink, reply, &mut watch).await {
                return stop(&signal, ended);
            }
        }
    }
}

async fn drain_observer_input<W, C>(
    client: &mut C,
    sink: &SharedSink<W>,
    signal: CloseSignal,
) -> Ended
where
    W: FrameSink,
    C: Stream<Item = Result<String, RelayError>> + Unpin,
{
    let mut watch = signal.subscribe();
    loop {
        let message = tokio::select! {
            _ = watch.closed() => return Ended::Signal,
            message = client.next() => message,
        };
        match message {
            Some(Ok(data)) => {
                let inbound = classify(&data);
                if !inbound.forward.is_empty() {
                    trace!("Dropping observer input");
                }
                for reply in &inbound.replies {
                    if let Err(ended) = reply_to_client(sink, reply, &mut watch).await {
                        return stop(&signal, ended);
                    }
                }
            }
            Some(Err(_)) | None => {
                return stop(&signal, Ended::Client(Disconnect::normal(NORMAL_USER_EXIT)));
            }
        }
    }
}

async fn reply_to_client<W: FrameSink>(
    sink: &SharedSink<W>,
    reply: &Instruction,
    watch: &mut CloseWatch,
) -> Result<(), Ended> {
    let written = tokio::select! {
        _ = watch.closed() => return Err(Ended::Signal),
        written = write_frame(sink, reply.encode().as_bytes()) => written,
    };
    written.map_err(|e| {
        debug!("Client write failed: {e}");
        Ended::Client(Disconnect::normal(NORMAL_USER_EXIT))
    })
}

/// Report the close reason to a live client, then close the transport.
async fn finish<W: FrameSink>(
    signal: &CloseSignal,
    sink: &SharedSink<W>,
    client_gone: bool,
) -> PumpExit {
    let disconnect = signal
        .reason()
        .unwrap_or_else(|| Disconnect::normal(NORMAL_USER_EXIT));
    let delivered = tokio::time::timeout(CLIENT_CLOSE_GRACE, async {
        let mut sink = sink.lock().await;
        let mut delivered = !client_gone;
        if delivered {
            if let Err(e) = send_instructions(&mut *sink, &disconnect.instructions()).await {
                debug!("Could not deliver disconnect: {e}");
                delivered = false;
            }
        }
        let _ = sink.close().await;
        delivered
    })
    .await;
    let client_gone = match delivered {
        Ok(delivered) => !delivered,
        Err(_) => {
            debug!("Client did not take the disconnect in time");
            true
        }
    };
    PumpExit {
        disconnect,
        client_gone,
    }
}
