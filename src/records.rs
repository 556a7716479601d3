//! In-memory session records.
//!
//! A record is allocated by `POST /api/tunnels` and then follows the relay
//! through `connecting → connected → closed`, collecting the guacd
//! connection id, the recording path and the final disconnect code. Records
//! outlive the live [`crate::sessions::Session`] so callers can inspect how a
//! session ended; [`RecordStore::sweep`] prunes them.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::assets::{Asset, Protocol};
use crate::error::Disconnect;
use crate::sessions::AccessMode;
use crate::util::now_ms;

/// Where a record is in its lifecycle.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Connecting,
    Connected,
    Closed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }
}

/// Everything the relay needs to open a session, plus its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub asset_id: String,
    pub asset_name: String,
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    #[serde(skip)]
    pub username: String,
    #[serde(skip)]
    pub password: String,
    #[serde(skip)]
    pub parameters: HashMap<String, String>,
    pub mode: AccessMode,
    pub status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect_reason: Option<String>,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<u64>,
}

impl SessionRecord {
    pub fn new(asset: &Asset, mode: AccessMode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            asset_id: asset.id.clone(),
            asset_name: asset.display_name().to_string(),
            protocol: asset.protocol,
            hostname: asset.hostname.clone(),
            port: asset.port(),
            username: asset.username.clone(),
            password: asset.password.clone(),
            parameters: asset.parameters.clone(),
            mode,
            status: RecordStatus::Pending,
            connection_id: None,
            recording_path: None,
            width: None,
            height: None,
            disconnect_code: None,
            disconnect_reason: None,
            created_at: now_ms(),
            connected_at: None,
            closed_at: None,
        }
    }
}

/// Cloneable handle; all clones share the same map.
#[derive(Clone, Default)]
pub struct RecordStore {
    records: Arc<RwLock<HashMap<String, SessionRecord>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a pending record for `asset`.
    pub async fn create(&self, asset: &Asset, mode: AccessMode) -> SessionRecord {
        let record = SessionRecord::new(asset, mode);
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        record
    }

    pub async fn get(&self, id: &str) -> Option<SessionRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Start a connection attempt. Only a pending record, or a connected one
    /// being taken over by a reconnect, may start one; a closed record never
    /// comes back.
    pub async fn mark_connecting(&self, id: &str, width: u32, height: u32) -> Result<(), String> {
        self.update(id, |r| {
            expect_status(r, &[RecordStatus::Pending, RecordStatus::Connected])?;
            r.status = RecordStatus::Connecting;
            r.width = Some(width);
            r.height = Some(height);
            r.disconnect_code = None;
            r.disconnect_reason = None;
            r.closed_at = None;
            Ok(())
        })
        .await
    }

    pub async fn mark_connected(
        &self,
        id: &str,
        connection_id: &str,
        recording_path: Option<String>,
    ) -> Result<(), String> {
        self.update(id, |r| {
            expect_status(r, &[RecordStatus::Connecting])?;
            r.status = RecordStatus::Connected;
            r.connection_id = Some(connection_id.to_string());
            r.recording_path = recording_path;
            r.connected_at = Some(now_ms());
            Ok(())
        })
        .await
    }

    pub async fn mark_closed(&self, id: &str, disconnect: &Disconnect) -> Result<(), String> {
        self.update(id, |r| {
            r.status = RecordStatus::Closed;
            r.disconnect_code = Some(disconnect.code.code());
            r.disconnect_reason = Some(disconnect.reason.clone());
            r.closed_at = Some(now_ms());
            Ok(())
        })
        .await
    }

    async fn update(
        &self,
        id: &str,
        f: impl FnOnce(&mut SessionRecord) -> Result<(), String>,
    ) -> Result<(), String> {
        let mut records = self.records.write().await;
        match records.get_mut(id) {
            Some(record) => f(record),
            None => Err(format!("Session record {id} not found")),
        }
    }

    /// Drop closed records older than `retention_ms` and pending records
    /// older than `pending_ttl_ms`. Returns the removed ids.
    pub async fn sweep(&self, retention_ms: u64, pending_ttl_ms: u64) -> Vec<String> {
        let now = now_ms();
        let mut records = self.records.write().await;
        let expired: Vec<String> = records
            .values()
            .filter(|r| match r.status {
                RecordStatus::Closed => {
                    now.saturating_sub(r.closed_at.unwrap_or(r.created_at)) > retention_ms
                }
                RecordStatus::Pending => now.saturating_sub(r.created_at) > pending_ttl_ms,
                RecordStatus::Connecting | RecordStatus::Connected => false,
            })
            .map(|r| r.id.clone())
            .collect();
        for id in &expired {
            records.remove(id);
        }
        if !expired.is_empty() {
            info!("Pruned {} session record(s)", expired.len());
        }
        expired
    }
}

fn expect_status(record: &SessionRecord, allowed: &[RecordStatus]) -> Result<(), String> {
    if allowed.contains(&record.status) {
        Ok(())
    } else {
        Err(format!(
            "session {} is {}",
            record.id,
            record.status.as_str()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DisconnectCode;

    fn asset() -> Asset {
        toml::from_str(
            r#"
            id = "lnx"
            protocol = "ssh"
            hostname = "10.0.0.5"
            username = "root"
            password = "x"
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_record_lifecycle() {
        let store = RecordStore::new();
        let record = store.create(&asset(), AccessMode::Interactive).await;
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.port, 22);

        store.mark_connecting(&record.id, 800, 600).await.unwrap();
        store
            .mark_connected(&record.id, "$abc", Some("/rec/x".into()))
            .await
            .unwrap();
        let r = store.get(&record.id).await.unwrap();
        assert_eq!(r.status, RecordStatus::Connected);
        assert_eq!(r.connection_id.as_deref(), Some("$abc"));
        assert_eq!(r.width, Some(800));

        store
            .mark_closed(&record.id, &Disconnect::forced("admin"))
            .await
            .unwrap();
        let r = store.get(&record.id).await.unwrap();
        assert_eq!(r.status, RecordStatus::Closed);
        assert_eq!(
            r.disconnect_code,
            Some(DisconnectCode::ForcedDisconnect.code())
        );
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = RecordStore::new();
        assert!(store.mark_connected("nope", "$x", None).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_record_cannot_reconnect() {
        let store = RecordStore::new();
        let record = store.create(&asset(), AccessMode::Interactive).await;

        // connected must come after connecting
        let err = store.mark_connected(&record.id, "$x", None).await.unwrap_err();
        assert!(err.contains("pending"), "{err}");

        store.mark_connecting(&record.id, 800, 600).await.unwrap();
        // a second attempt while the first is still connecting
        assert!(store.mark_connecting(&record.id, 800, 600).await.is_err());
        store.mark_connected(&record.id, "$x", None).await.unwrap();
        // reconnect over a live session is allowed
        store.mark_connecting(&record.id, 1024, 768).await.unwrap();
        store.mark_connected(&record.id, "$y", None).await.unwrap();

        store
            .mark_closed(&record.id, &Disconnect::normal("bye"))
            .await
            .unwrap();
        let err = store.mark_connecting(&record.id, 800, 600).await.unwrap_err();
        assert!(err.contains("closed"), "{err}");
        let r = store.get(&record.id).await.unwrap();
        assert_eq!(r.status, RecordStatus::Closed);
        assert_eq!(r.disconnect_reason.as_deref(), Some("bye"));
    }

    #[tokio::test]
    async fn test_credentials_not_serialized() {
        let store = RecordStore::new();
        let record = store.create(&asset(), AccessMode::ReadOnly).await;
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("password").is_none());
        assert!(json.get("username").is_none());
        assert_eq!(json["mode"], "read_only");
        assert_eq!(json["status"], "pending");
    }

    #[tokio::test]
    async fn test_sweep() {
        let store = RecordStore::new();
        let pending = store.create(&asset(), AccessMode::Interactive).await;
        let closed = store.create(&asset(), AccessMode::Interactive).await;
        let live = store.create(&asset(), AccessMode::Interactive).await;
        store
            .mark_closed(&closed.id, &Disconnect::normal("bye"))
            .await
            .unwrap();
        store.mark_connecting(&live.id, 800, 600).await.unwrap();
        store.mark_connected(&live.id, "$c", None).await.unwrap();

        // nothing is old enough yet
        assert!(store.sweep(60_000, 60_000).await.is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut removed = store.sweep(0, 0).await;
        removed.sort();
        let mut expected = vec![pending.id, closed.id];
        expected.sort();
        assert_eq!(removed, expected);
        assert!(store.get(&live.id).await.is_some());
    }
}
