//! WebSocket transport for relays.
//!
//! ## Connection lifecycle
//!
//! 1. The browser connects to `GET /api/tunnels/{id}/ws?width=&height=&dpi=`
//!    (primary) or `GET /api/sessions/{id}/observe` (observer) and negotiates
//!    the `guacamole` subprotocol.
//! 2. The first message from the relay is the internal tunnel-uuid
//!    instruction `0.,<len>.<id>;`.
//! 3. After that each text message carries one or more raw guacd
//!    instructions in both directions. Internal `0.,4.ping,...;` messages from
//!    the client are echoed back and never reach guacd.
//! 4. When the relay ends while the client is still connected it sends
//!    `error(reason, code)` (omitted for a normal close) and `disconnect()`,
//!    then closes the socket.
//!
//! Setup failures (unknown session, bad display size, guacd unreachable) are
//! reported the same way, in-band, after the upgrade.

use std::io;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::{BoxStream, SplitSink};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tracing::{info_span, Instrument};

use crate::error::RelayError;
use crate::relay::{FrameSink, ObserverParams, PrimaryParams};
use crate::AppState;

/// WebSocket subprotocol spoken by Guacamole clients.
pub const GUACAMOLE_SUBPROTOCOL: &str = "guacamole";

/// [`FrameSink`] over the send half of a WebSocket. Writes accumulate until
/// `flush`, which sends them as a single text message.
pub struct WebSocketWriter<S> {
    sink: S,
    pending: String,
}

impl<S> WebSocketWriter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            pending: String::new(),
        }
    }
}

impl<S> FrameSink for WebSocketWriter<S>
where
    S: Sink<Message, Error = axum::Error> + Unpin + Send,
{
    async fn write(&mut self, frame: &[u8]) -> io::Result<usize> {
        let text =
            std::str::from_utf8(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.pending.push_str(text);
        Ok(frame.len())
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let text = std::mem::take(&mut self.pending);
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.flush().await?;
        self.sink
            .close()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }
}

/// Client messages as instruction text. Ends at the first close frame;
/// control frames are skipped.
pub fn client_frames<St>(stream: St) -> ClientFrames
where
    St: Stream<Item = Result<Message, axum::Error>> + Send + 'static,
{
    stream
        .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|_| RelayError::Client("binary message is not UTF-8".into())),
                ),
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => None,
                Err(e) => Some(Err(RelayError::Client(e.to_string()))),
            })
        })
        .boxed()
}

type ClientFrames = BoxStream<'static, Result<String, RelayError>>;

fn split(socket: WebSocket) -> (WebSocketWriter<SplitSink<WebSocket, Message>>, ClientFrames) {
    let (sink, stream) = socket.split();
    (WebSocketWriter::new(sink), client_frames(stream))
}

/// `GET /api/tunnels/{id}/ws` — interactive relay for a created tunnel.
pub async fn primary_upgrade(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<PrimaryParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let span = info_span!("relay", session_id = %session_id);
    ws.protocols([GUACAMOLE_SUBPROTOCOL])
        .on_upgrade(move |socket| {
            async move {
                let (sink, client) = split(socket);
                state
                    .relay
                    .open_primary(&session_id, params, sink, client)
                    .await;
            }
            .instrument(span)
        })
}

/// `GET /api/sessions/{id}/observe` — read-only view of a live session.
pub async fn observer_upgrade(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<ObserverParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let span = info_span!("observe", session_id = %session_id);
    ws.protocols([GUACAMOLE_SUBPROTOCOL])
        .on_upgrade(move |socket| {
            async move {
                let (sink, client) = split(socket);
                state
                    .relay
                    .open_observer(&session_id, params, sink, client)
                    .await;
            }
            .instrument(span)
        })
}
