//! Per-connection settings sent to guacd during the handshake.

use std::collections::HashMap;

/// Parameter names understood by guacd's protocol plugins.
pub mod params {
    pub const HOSTNAME: &str = "hostname";
    pub const PORT: &str = "port";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const READ_ONLY: &str = "read-only";
    pub const RECORDING_PATH: &str = "recording-path";
    pub const RECORDING_NAME: &str = "recording-name";
    pub const CREATE_RECORDING_PATH: &str = "create-recording-path";
}

/// What to `select` and which values to answer guacd's `args` with.
///
/// With a `connection_id` the tunnel joins an existing guacd connection;
/// without one guacd starts a new `protocol` session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionConfig {
    connection_id: Option<String>,
    protocol: String,
    parameters: HashMap<String, String>,
}

impl ConnectionConfig {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Self::default()
        }
    }

    /// Read-only attach to a running guacd connection.
    pub fn observer(protocol: impl Into<String>, connection_id: impl Into<String>) -> Self {
        let mut config = Self::new(protocol);
        config.set_connection_id(connection_id);
        config.set_parameter(params::READ_ONLY, "true");
        config
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn set_connection_id(&mut self, connection_id: impl Into<String>) {
        self.connection_id = Some(connection_id.into());
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(name.into(), value.into());
    }

    pub fn unset_parameter(&mut self, name: &str) -> Option<String> {
        self.parameters.remove(name)
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    pub fn is_read_only(&self) -> bool {
        self.parameter(params::READ_ONLY) == Some("true")
    }

    /// The `select` argument: the connection id wins over the protocol.
    pub fn select_target(&self) -> &str {
        self.connection_id().unwrap_or(&self.protocol)
    }
}

/// Display and media capabilities announced before `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub audio_mimetypes: Vec<String>,
    pub image_mimetypes: Vec<String>,
    pub timezone: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            dpi: 96,
            audio_mimetypes: vec!["audio/L8".into(), "audio/L16".into()],
            image_mimetypes: vec!["image/jpeg".into(), "image/png".into(), "image/webp".into()],
            timezone: "UTC".into(),
        }
    }
}
