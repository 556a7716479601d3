//! Relay orchestration: look up the record, open the tunnel, register the
//! session, run the pumps and tear everything down again.
//!
//! Setup failures never reach the pumps. The client gets
//! `error(reason, code)` + `disconnect()` on its transport and the relay
//! returns.

use std::collections::HashMap;
use std::sync::Arc;

use futures::Stream;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::pump::{self, reject};
use super::FrameSink;
use crate::assets::AssetCatalog;
use crate::config::Config;
use crate::error::{Disconnect, DisconnectCode, RelayError};
use crate::guac::config::params;
use crate::guac::{ClientInfo, ConnectionConfig, Tunnel, TunnelOptions};
use crate::records::{RecordStatus, RecordStore, SessionRecord};
use crate::sessions::{AccessMode, Observer, Session, SessionManager, SessionState};
use crate::util::expand_tilde;

/// Largest width or height accepted from a client.
const MAX_DIMENSION: u32 = 16_384;

/// Everything needed to reach guacd, fixed at startup.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub guacd_address: String,
    pub tunnel: TunnelOptions,
    /// Media capabilities and default DPI; width/height come per request.
    pub client: ClientInfo,
    /// Merged into every connection of the keyed protocol.
    pub protocol_parameters: HashMap<String, HashMap<String, String>>,
    /// Recording directory, if recording is enabled.
    pub recording_dir: Option<String>,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        let guacd = &config.guacd;
        Self {
            guacd_address: guacd.address.clone(),
            tunnel: guacd.tunnel_options(),
            client: ClientInfo {
                dpi: guacd.dpi,
                audio_mimetypes: guacd.audio_mimetypes.clone(),
                image_mimetypes: guacd.image_mimetypes.clone(),
                timezone: guacd.timezone.clone(),
                ..ClientInfo::default()
            },
            protocol_parameters: guacd.parameters.clone(),
            recording_dir: config
                .recording
                .enabled
                .then(|| expand_tilde(&config.recording.path).into_owned()),
        }
    }
}

/// Query parameters of a primary relay request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrimaryParams {
    pub width: Option<String>,
    pub height: Option<String>,
    pub dpi: Option<String>,
    /// Overrides the asset's stored username.
    pub username: Option<String>,
    /// Overrides the asset's stored password.
    pub password: Option<String>,
}

/// Query parameters of an observer relay request. Missing dimensions fall
/// back to the primary's.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObserverParams {
    pub width: Option<String>,
    pub height: Option<String>,
    pub dpi: Option<String>,
}

/// Shared relay state. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    sessions: SessionManager,
    records: RecordStore,
    assets: AssetCatalog,
    settings: Arc<RelaySettings>,
}

impl Relay {
    pub fn new(settings: RelaySettings, assets: AssetCatalog) -> Self {
        Self {
            sessions: SessionManager::new(),
            records: RecordStore::new(),
            assets,
            settings: Arc::new(settings),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            RelaySettings::from_config(config),
            AssetCatalog::new(config.assets.iter().cloned()),
        )
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn assets(&self) -> &AssetCatalog {
        &self.assets
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Allocate a pending record for an active asset.
    pub async fn create_tunnel(
        &self,
        asset_id: &str,
        mode: AccessMode,
    ) -> Result<SessionRecord, Disconnect> {
        let asset = self.assets.get(asset_id).ok_or_else(|| {
            Disconnect::new(
                DisconnectCode::AssetNotFound,
                format!("asset {asset_id} not found"),
            )
        })?;
        if !asset.active {
            return Err(Disconnect::new(
                DisconnectCode::AssetNotActive,
                format!("asset {asset_id} is not active"),
            ));
        }
        let record = self.records.create(asset, mode).await;
        info!(session_id = %record.id, asset_id, ?mode, "Tunnel created");
        Ok(record)
    }

    /// Run an interactive relay for the record `session_id` until either
    /// side leaves or the session is closed.
    pub async fn open_primary<W, C>(
        &self,
        session_id: &str,
        params: PrimaryParams,
        sink: W,
        client: C,
    ) -> Disconnect
    where
        W: FrameSink + 'static,
        C: Stream<Item = Result<String, RelayError>> + Unpin + Send,
    {
        let Some(record) = self.records.get(session_id).await else {
            let d = Disconnect::new(
                DisconnectCode::SessionNotFound,
                format!("session {session_id} not found"),
            );
            reject(sink, &d).await;
            return d;
        };
        let client_info = match self.client_info(
            params.width.as_deref(),
            params.height.as_deref(),
            params.dpi.as_deref(),
            None,
        ) {
            Ok(info) => info,
            Err(d) => {
                reject(sink, &d).await;
                return d;
            }
        };
        let (config, recording_path) = self.primary_config(&record, &params);

        if let Err(e) = self
            .records
            .mark_connecting(&record.id, client_info.width, client_info.height)
            .await
        {
            let d = Disconnect::new(DisconnectCode::SessionUpdateError, e);
            reject(sink, &d).await;
            return d;
        }

        let tunnel = match Tunnel::connect(
            &self.settings.guacd_address,
            &config,
            &client_info,
            &self.settings.tunnel,
        )
        .await
        {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("Tunnel to guacd failed: {e}");
                let d = Disconnect::from(&e);
                self.mark_closed(&record.id, &d).await;
                reject(sink, &d).await;
                return d;
            }
        };

        let session = Arc::new(Session::new(
            record.id.as_str(),
            record.protocol.as_str(),
            tunnel.connection_id(),
            record.mode,
        ));
        if let Some(previous) = self.sessions.add(Arc::clone(&session)).await {
            previous.close(Disconnect::forced("replaced by a new connection"));
        }

        if let Err(e) = self
            .records
            .mark_connected(&record.id, tunnel.connection_id(), recording_path)
            .await
        {
            let d = Disconnect::new(DisconnectCode::SessionUpdateError, e);
            session.close(d.clone());
            self.sessions.remove_if_same(&session).await;
            tunnel.close().await;
            reject(sink, &d).await;
            return d;
        }

        session.set_state(SessionState::Active);
        info!(connection_id = %session.connection_id, "Relay started");

        let exit = pump::run_primary(&session.id, session.signal(), tunnel, sink, client).await;

        session.close(exit.disconnect.clone());
        let current = self.sessions.remove_if_same(&session).await;
        let observers = session
            .observers
            .disconnect_all(&Disconnect::forced("primary session closed"))
            .await;
        // A replacement session owns the record now.
        if current {
            self.mark_closed(&session.id, &exit.disconnect).await;
        }
        info!(observers, "Relay ended: {}", exit.disconnect);
        exit.disconnect
    }

    /// Attach a read-only viewer to the live session `session_id`.
    pub async fn open_observer<W, C>(
        &self,
        session_id: &str,
        params: ObserverParams,
        sink: W,
        client: C,
    ) -> Disconnect
    where
        W: FrameSink + 'static,
        C: Stream<Item = Result<String, RelayError>> + Unpin + Send,
    {
        let Some(primary) = self.sessions.get(session_id).await else {
            let d = Disconnect::new(
                DisconnectCode::SessionNotFound,
                format!("session {session_id} not found"),
            );
            reject(sink, &d).await;
            return d;
        };
        let record = self.records.get(session_id).await;
        let connected = record
            .as_ref()
            .is_some_and(|r| r.status == RecordStatus::Connected);
        if !connected || primary.is_closed() {
            let d = Disconnect::new(
                DisconnectCode::AssetNotActive,
                format!("session {session_id} is not active"),
            );
            reject(sink, &d).await;
            return d;
        }

        let fallback = record.as_ref().and_then(|r| r.width.zip(r.height));
        let client_info = match self.client_info(
            params.width.as_deref(),
            params.height.as_deref(),
            params.dpi.as_deref(),
            fallback,
        ) {
            Ok(info) => info,
            Err(d) => {
                reject(sink, &d).await;
                return d;
            }
        };

        let config =
            ConnectionConfig::observer(primary.protocol.as_str(), primary.connection_id.as_str());
        let tunnel = match Tunnel::connect(
            &self.settings.guacd_address,
            &config,
            &client_info,
            &self.settings.tunnel,
        )
        .await
        {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("Observer tunnel to guacd failed: {e}");
                let d = Disconnect::from(&e);
                reject(sink, &d).await;
                return d;
            }
        };

        let observer = Arc::new(Observer::new(Uuid::new_v4().to_string()));
        primary.observers.add(Arc::clone(&observer)).await;
        // The primary may have torn down between the lookup and the add.
        if primary.is_closed() {
            observer.close(Disconnect::forced("primary session closed"));
        }
        info!(observer_id = %observer.id, "Observer attached");

        let exit =
            pump::run_observer(&observer.id, observer.signal(), tunnel.into_reader(), sink, client)
                .await;

        primary.observers.delete(&observer.id).await;
        info!(observer_id = %observer.id, "Observer detached: {}", exit.disconnect);
        exit.disconnect
    }

    /// Administrative close of a live session.
    pub async fn force_close(&self, session_id: &str) -> bool {
        self.sessions
            .close(session_id, Disconnect::forced("session closed by administrator"))
            .await
    }

    /// Disconnect one observer. Returns `false` if either id is unknown.
    pub async fn kick_observer(&self, session_id: &str, observer_id: &str) -> bool {
        let Some(session) = self.sessions.get(session_id).await else {
            return false;
        };
        match session.observers.get(observer_id).await {
            Some(observer) => {
                observer.close(Disconnect::forced("observer removed by administrator"));
                true
            }
            None => false,
        }
    }

    /// Close every live session.
    pub async fn shutdown(&self) -> usize {
        self.sessions
            .close_all(&Disconnect::forced("relay shutting down"))
            .await
    }

    /// Guacd parameters for a primary connection, and the recording path if
    /// recording is on.
    fn primary_config(
        &self,
        record: &SessionRecord,
        query: &PrimaryParams,
    ) -> (ConnectionConfig, Option<String>) {
        let protocol = record.protocol.as_str();
        let mut config = ConnectionConfig::new(protocol);
        if let Some(defaults) = self.settings.protocol_parameters.get(protocol) {
            for (name, value) in defaults {
                config.set_parameter(name.as_str(), value.as_str());
            }
        }
        for (name, value) in &record.parameters {
            config.set_parameter(name.as_str(), value.as_str());
        }
        config.set_parameter(params::HOSTNAME, record.hostname.as_str());
        config.set_parameter(params::PORT, record.port.to_string());

        let username = non_empty(query.username.as_deref()).unwrap_or(&record.username);
        let password = non_empty(query.password.as_deref()).unwrap_or(&record.password);
        if !username.is_empty() {
            config.set_parameter(params::USERNAME, username);
        }
        if !password.is_empty() {
            config.set_parameter(params::PASSWORD, password);
        }
        if record.mode == AccessMode::ReadOnly {
            config.set_parameter(params::READ_ONLY, "true");
        }

        let recording_path = self.settings.recording_dir.as_ref().map(|dir| {
            config.set_parameter(params::RECORDING_PATH, dir.as_str());
            config.set_parameter(params::RECORDING_NAME, record.id.as_str());
            config.set_parameter(params::CREATE_RECORDING_PATH, "true");
            format!("{}/{}", dir.trim_end_matches('/'), record.id)
        });
        (config, recording_path)
    }

    /// Display size for the handshake. Width and height are required unless
    /// `fallback` supplies them.
    fn client_info(
        &self,
        width: Option<&str>,
        height: Option<&str>,
        dpi: Option<&str>,
        fallback: Option<(u32, u32)>,
    ) -> Result<ClientInfo, Disconnect> {
        let (width, height) = match (non_empty(width), non_empty(height), fallback) {
            (Some(w), Some(h), _) => (parse_dimension("width", w)?, parse_dimension("height", h)?),
            (None, None, Some(size)) => size,
            (None, _, _) => return Err(parameters_error("missing width")),
            (_, None, _) => return Err(parameters_error("missing height")),
        };
        let dpi = match non_empty(dpi) {
            Some(d) => parse_dimension("dpi", d)?,
            None => self.settings.client.dpi,
        };
        Ok(ClientInfo {
            width,
            height,
            dpi,
            ..self.settings.client.clone()
        })
    }

    async fn mark_closed(&self, session_id: &str, disconnect: &Disconnect) {
        if let Err(e) = self.records.mark_closed(session_id, disconnect).await {
            warn!("Could not close session record: {e}");
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn parameters_error(reason: impl Into<String>) -> Disconnect {
    Disconnect::new(DisconnectCode::ParametersError, reason)
}

fn parse_dimension(name: &str, value: &str) -> Result<u32, Disconnect> {
    match value.parse::<u32>() {
        Ok(v) if v > 0 && v <= MAX_DIMENSION => Ok(v),
        _ => Err(parameters_error(format!("invalid {name}: {value:?}"))),
    }
}
