//! In-process guacd stand-in shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deskrelay::guac::{encode, Instruction, InstructionReader};
use deskrelay::Config;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Names guacd asks for in `args`.
pub const ARG_NAMES: [&str; 6] = [
    "VERSION_1_5_0",
    "hostname",
    "port",
    "username",
    "password",
    "read-only",
];

/// One handshaken connection as guacd saw it.
pub struct GuacdConnection {
    pub select: Instruction,
    pub size: Instruction,
    pub connect: Instruction,
    pub connection_id: String,
    reader: InstructionReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl GuacdConnection {
    pub async fn send(&mut self, frame: &str) {
        self.writer.write_all(frame.as_bytes()).await.unwrap();
    }

    /// Next instruction from the relay, `None` once the relay hangs up.
    pub async fn recv(&mut self) -> Option<Instruction> {
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_instruction())
            .await
            .expect("timed out waiting for the relay")
            .ok()
            .flatten()
    }

    /// Value the relay sent for `name` in `connect`.
    pub fn connect_value(&self, name: &str) -> &str {
        let index = ARG_NAMES.iter().position(|n| *n == name).unwrap();
        &self.connect.args()[index]
    }
}

/// Accepts connections, answers the handshake and hands each connection to
/// the test. Selecting an existing connection id joins it; selecting a
/// protocol allocates `$conn-N`.
pub struct MockGuacd {
    pub address: String,
    connections: mpsc::UnboundedReceiver<GuacdConnection>,
}

impl MockGuacd {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (tx, connections) = mpsc::unbounded_channel();
        let counter = Arc::new(AtomicUsize::new(0));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let (read_half, mut writer) = stream.into_split();
                    let mut reader = InstructionReader::new(read_half);
                    let Ok(Some(select)) = reader.read_instruction().await else {
                        return;
                    };
                    writer
                        .write_all(encode("args", &ARG_NAMES).as_bytes())
                        .await
                        .unwrap();
                    let mut size = None;
                    let connect = loop {
                        let Ok(Some(ins)) = reader.read_instruction().await else {
                            return;
                        };
                        match ins.opcode() {
                            "size" => size = Some(ins),
                            "connect" => break ins,
                            _ => {}
                        }
                    };
                    let target = &select.args()[0];
                    let connection_id = if target.starts_with('$') {
                        target.clone()
                    } else {
                        format!("$conn-{}", counter.fetch_add(1, Ordering::SeqCst) + 1)
                    };
                    writer
                        .write_all(encode("ready", &[connection_id.as_str()]).as_bytes())
                        .await
                        .unwrap();
                    let _ = tx.send(GuacdConnection {
                        select,
                        size: size.unwrap(),
                        connect,
                        connection_id,
                        reader,
                        writer,
                    });
                });
            }
        });
        Self {
            address,
            connections,
        }
    }

    pub async fn next_connection(&mut self) -> GuacdConnection {
        tokio::time::timeout(Duration::from_secs(5), self.connections.recv())
            .await
            .expect("timed out waiting for a guacd connection")
            .unwrap()
    }
}

/// Config pointing at `guacd` with one active and one inactive asset.
pub fn config(guacd: &str) -> Config {
    let mut config = Config::parse(
        r#"
        [[assets]]
        id = "win-01"
        protocol = "rdp"
        hostname = "10.0.0.12"
        username = "admin"
        password = "stored"

        [[assets]]
        id = "retired"
        protocol = "vnc"
        hostname = "10.0.0.99"
        active = false
        "#,
    )
    .unwrap();
    config.guacd.address = guacd.to_string();
    config
}

/// Tunnel-uuid instruction the relay sends first.
pub fn uuid_frame(id: &str) -> String {
    encode("", &[id])
}
