//! A single connection to guacd and its handshake.
//!
//! ```text
//! relay                                guacd
//!   | -- select(protocol | conn id) --> |
//!   | <------------- args(names...) --- |
//!   | -- size, audio, video, image,  -> |
//!   |    timezone, connect(values...)   |
//!   | <------------- ready(conn id) --- |
//! ```
//!
//! A tunnel is never reopened. Once the handshake completes it is split into
//! a reader and a writer half that the relay pumps own.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use super::config::{ClientInfo, ConnectionConfig};
use super::error::TunnelError;
use super::instruction::{Instruction, InstructionReader, ReadMode, DEFAULT_MAX_FRAME_SIZE};

/// `args` names with this prefix announce the guacd protocol version.
const VERSION_PREFIX: &str = "VERSION_";

/// Progress of the handshake; failures report the state they happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Disconnected,
    SelectSent,
    AwaitingArgs,
    ConnectSent,
    AwaitingReady,
    Open,
    Failed,
}

impl HandshakeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::SelectSent => "select sent",
            Self::AwaitingArgs => "awaiting args",
            Self::ConnectSent => "connect sent",
            Self::AwaitingReady => "awaiting ready",
            Self::Open => "open",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeouts and framing used when opening tunnels.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub read_mode: ReadMode,
    pub max_frame_size: usize,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(15),
            read_mode: ReadMode::LengthPrefixed,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// An open connection to guacd.
pub struct Tunnel<S> {
    reader: InstructionReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    connection_id: String,
    state: HandshakeState,
}

impl Tunnel<TcpStream> {
    /// Connect to guacd at `address` and run the handshake.
    pub async fn connect(
        address: &str,
        config: &ConnectionConfig,
        client: &ClientInfo,
        options: &TunnelOptions,
    ) -> Result<Self, TunnelError> {
        let stream = match tokio::time::timeout(options.connect_timeout, TcpStream::connect(address))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TunnelError::Connect {
                    address: address.to_string(),
                    source,
                })
            }
            Err(_) => return Err(TunnelError::ConnectTimeout(address.to_string())),
        };
        stream.set_nodelay(true)?;

        tokio::time::timeout(
            options.handshake_timeout,
            Self::handshake(stream, config, client, options),
        )
        .await
        .map_err(|_| TunnelError::HandshakeTimeout)?
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Tunnel<S> {
    /// Run the handshake over an already connected stream.
    pub async fn handshake(
        stream: S,
        config: &ConnectionConfig,
        client: &ClientInfo,
        options: &TunnelOptions,
    ) -> Result<Self, TunnelError> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut tunnel = Self {
            reader: InstructionReader::with_mode(
                read_half,
                options.read_mode,
                options.max_frame_size,
            ),
            writer: write_half,
            connection_id: String::new(),
            state: HandshakeState::Disconnected,
        };

        match tunnel.negotiate(config, client).await {
            Ok(()) => Ok(tunnel),
            Err(e) => {
                debug!(state = %tunnel.state, "Handshake failed: {e}");
                tunnel.state = HandshakeState::Failed;
                Err(e)
            }
        }
    }

    async fn negotiate(
        &mut self,
        config: &ConnectionConfig,
        client: &ClientInfo,
    ) -> Result<(), TunnelError> {
        self.send(&Instruction::new("select", [config.select_target()]))
            .await?;
        self.state = HandshakeState::SelectSent;

        self.state = HandshakeState::AwaitingArgs;
        let args = self.expect("args").await?;
        let values = connect_values(args.args(), config);

        let width = client.width.to_string();
        let height = client.height.to_string();
        let dpi = client.dpi.to_string();
        self.send(&Instruction::new("size", [width, height, dpi]))
            .await?;
        self.send(&Instruction::new("audio", client.audio_mimetypes.iter().cloned()))
            .await?;
        self.send(&Instruction::new("video", Vec::<String>::new()))
            .await?;
        self.send(&Instruction::new("image", client.image_mimetypes.iter().cloned()))
            .await?;
        self.send(&Instruction::new("timezone", [client.timezone.as_str()]))
            .await?;
        self.send(&Instruction::new("connect", values)).await?;
        self.state = HandshakeState::ConnectSent;

        self.state = HandshakeState::AwaitingReady;
        let ready = self.expect("ready").await?;
        let connection_id = ready
            .args()
            .first()
            .ok_or(TunnelError::MissingConnectionId)?;
        self.connection_id.clone_from(connection_id);
        self.state = HandshakeState::Open;
        debug!(connection_id = %self.connection_id, "Tunnel open");
        Ok(())
    }

    async fn expect(&mut self, opcode: &'static str) -> Result<Instruction, TunnelError> {
        let instruction = self
            .reader
            .read_instruction()
            .await?
            .ok_or(TunnelError::Closed)?;
        if instruction.opcode() == opcode {
            return Ok(instruction);
        }
        if instruction.opcode() == "error" {
            let arg = |i: usize| instruction.args().get(i).cloned().unwrap_or_default();
            return Err(TunnelError::Backend {
                message: arg(0),
                status: arg(1),
            });
        }
        Err(TunnelError::UnexpectedInstruction {
            state: self.state,
            expected: opcode,
            got: instruction.opcode().to_string(),
        })
    }

    /// Backend-assigned id, empty until the handshake completes.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn is_open(&self) -> bool {
        self.state == HandshakeState::Open
    }

    async fn send(&mut self, instruction: &Instruction) -> Result<(), TunnelError> {
        self.write_frame(instruction.encode().as_bytes()).await
    }

    /// Write raw bytes and flush.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TunnelError> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }

    /// Split an open tunnel for the two pump directions.
    pub fn into_split(self) -> (TunnelReader<S>, TunnelWriter<S>) {
        (
            TunnelReader {
                reader: self.reader,
                connection_id: self.connection_id,
            },
            TunnelWriter {
                writer: self.writer,
            },
        )
    }

    /// Keep only the read half. Used for observers, which never write.
    pub fn into_reader(self) -> TunnelReader<S> {
        self.into_split().0
    }
}

/// Argument values for `connect`, in the order guacd asked for them.
///
/// Unknown names are answered with an empty string; version announcements
/// are echoed back unchanged.
pub fn connect_values(names: &[String], config: &ConnectionConfig) -> Vec<String> {
    names
        .iter()
        .map(|name| {
            if name.starts_with(VERSION_PREFIX) {
                name.clone()
            } else {
                config.parameter(name).unwrap_or_default().to_string()
            }
        })
        .collect()
}

/// Backend→client half of an open tunnel.
pub struct TunnelReader<S> {
    reader: InstructionReader<ReadHalf<S>>,
    connection_id: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TunnelReader<S> {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn read_frame(&mut self) -> Result<Option<String>, TunnelError> {
        self.reader.read_frame().await
    }
}

/// Client→backend half of an open tunnel.
pub struct TunnelWriter<S> {
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> TunnelWriter<S> {
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TunnelError> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guac::config::params;
    use crate::guac::instruction::encode;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    /// Minimal guacd: records everything up to `connect`, then answers with
    /// `reply` (an already encoded frame).
    async fn fake_guacd(server: DuplexStream, args: Vec<&str>, reply: String) -> Vec<Instruction> {
        let (read_half, mut write_half) = tokio::io::split(server);
        let mut reader = InstructionReader::new(read_half);
        let mut seen = Vec::new();

        let select = reader.read_instruction().await.unwrap().unwrap();
        seen.push(select);
        write_half
            .write_all(encode("args", &args).as_bytes())
            .await
            .unwrap();
        loop {
            let Some(ins) = reader.read_instruction().await.unwrap() else {
                return seen;
            };
            let done = ins.opcode() == "connect";
            seen.push(ins);
            if done {
                break;
            }
        }
        write_half.write_all(reply.as_bytes()).await.unwrap();
        seen
    }

    fn ssh_config() -> ConnectionConfig {
        let mut config = ConnectionConfig::new("ssh");
        config.set_parameter(params::HOSTNAME, "10.0.0.5");
        config.set_parameter(params::PORT, "22");
        config.set_parameter(params::USERNAME, "root");
        config.set_parameter(params::PASSWORD, "x");
        config
    }

    #[tokio::test]
    async fn test_handshake_ssh_example() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let guacd = tokio::spawn(fake_guacd(
            server,
            vec!["hostname", "port", "username", "password"],
            encode("ready", &["abc123"]),
        ));

        let tunnel = Tunnel::handshake(
            client,
            &ssh_config(),
            &ClientInfo::default(),
            &TunnelOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(tunnel.connection_id(), "abc123");
        assert!(tunnel.is_open());

        let seen = guacd.await.unwrap();
        let opcodes: Vec<&str> = seen.iter().map(Instruction::opcode).collect();
        assert_eq!(
            opcodes,
            ["select", "size", "audio", "video", "image", "timezone", "connect"]
        );
        assert_eq!(seen[0].args(), ["ssh"]);
        assert_eq!(seen[1].args(), ["1024", "768", "96"]);
        assert!(seen[3].args().is_empty());
        assert_eq!(seen[6].args(), ["10.0.0.5", "22", "root", "x"]);
    }

    #[tokio::test]
    async fn test_handshake_selects_connection_id_and_fills_missing() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let guacd = tokio::spawn(fake_guacd(
            server,
            vec!["VERSION_1_5_0", "read-only", "color-depth"],
            encode("ready", &["$existing"]),
        ));

        let config = ConnectionConfig::observer("rdp", "$existing");
        let tunnel = Tunnel::handshake(
            client,
            &config,
            &ClientInfo::default(),
            &TunnelOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(tunnel.connection_id(), "$existing");

        let seen = guacd.await.unwrap();
        assert_eq!(seen[0].args(), ["$existing"]);
        let connect = seen.last().unwrap();
        assert_eq!(connect.args(), ["VERSION_1_5_0", "true", ""]);
    }

    #[tokio::test]
    async fn test_handshake_unexpected_opcode_fails() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server);
            let mut reader = InstructionReader::new(read_half);
            let _select = reader.read_instruction().await.unwrap();
            write_half
                .write_all(encode("sync", &["1"]).as_bytes())
                .await
                .unwrap();
            // keep the stream open until the client gives up
            let _ = reader.read_instruction().await;
        });

        let err = Tunnel::handshake(
            client,
            &ssh_config(),
            &ClientInfo::default(),
            &TunnelOptions::default(),
        )
        .await
        .err()
        .unwrap();
        match err {
            TunnelError::UnexpectedInstruction {
                state,
                expected,
                got,
            } => {
                assert_eq!(state, HandshakeState::AwaitingArgs);
                assert_eq!(expected, "args");
                assert_eq!(got, "sync");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_ready_without_id_fails() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(fake_guacd(server, vec!["hostname"], encode::<&str>("ready", &[])));

        let err = Tunnel::handshake(
            client,
            &ssh_config(),
            &ClientInfo::default(),
            &TunnelOptions::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, TunnelError::MissingConnectionId));
    }

    #[tokio::test]
    async fn test_backend_error_during_handshake() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(fake_guacd(
            server,
            vec!["hostname"],
            encode("error", &["Unable to connect", "519"]),
        ));

        let err = Tunnel::handshake(
            client,
            &ssh_config(),
            &ClientInfo::default(),
            &TunnelOptions::default(),
        )
        .await
        .err()
        .unwrap();
        match err {
            TunnelError::Backend { message, status } => {
                assert_eq!(message, "Unable to connect");
                assert_eq!(status, "519");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = Tunnel::connect(
            &addr,
            &ssh_config(),
            &ClientInfo::default(),
            &TunnelOptions::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, TunnelError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_silent_guacd_hits_handshake_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // accepts, reads nothing back, never answers
        let _guacd = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let options = TunnelOptions {
            handshake_timeout: Duration::from_millis(100),
            ..TunnelOptions::default()
        };
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            Tunnel::connect(&addr, &ssh_config(), &ClientInfo::default(), &options),
        )
        .await
        .expect("handshake was not bounded")
        .err()
        .unwrap();
        assert!(matches!(err, TunnelError::HandshakeTimeout));
    }

    #[tokio::test]
    async fn test_delimited_handshake_skips_legacy_rate_frames() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(fake_guacd(
            server,
            vec!["hostname"],
            format!("rate=22050,channels=2;{}", encode("ready", &["$legacy"])),
        ));

        let options = TunnelOptions {
            read_mode: ReadMode::Delimited,
            ..TunnelOptions::default()
        };
        let tunnel = Tunnel::handshake(client, &ssh_config(), &ClientInfo::default(), &options)
            .await
            .unwrap();
        assert_eq!(tunnel.connection_id(), "$legacy");
        assert!(tunnel.is_open());
    }

    #[test]
    fn test_connect_values_order() {
        let names: Vec<String> = ["password", "hostname", "missing"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(connect_values(&names, &ssh_config()), ["x", "10.0.0.5", ""]);
    }
}
