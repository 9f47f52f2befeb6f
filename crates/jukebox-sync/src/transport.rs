//! # Sync Transport
//!
//! The replica's side of the wire.
//!
//! ## Request Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    HttpTransport request                                │
//! │                                                                         │
//! │  ReplicaSession ──► transport.fetch_changes(since)                     │
//! │                          │                                              │
//! │                          ▼                                              │
//! │               GET {primary}/sync/changes?since=...                     │
//! │               X-Node-ID: replica-a                                     │
//! │               X-Signature: <shared secret>                             │
//! │                          │                                              │
//! │         ┌────────────────┼──────────────────┬────────────────┐         │
//! │         ▼                ▼                  ▼                ▼         │
//! │      2xx JSON       401 / 403          other status     no response   │
//! │      → body         → AuthFailed       → RemoteRejected → Connection  │
//! │                                                           / Timeout    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`SyncTransport`] is the seam the orchestrator depends on; tests script
//! it instead of standing up a primary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::NodeConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    AckRequest, AckResponse, ApplyRequest, ApplyResponse, ChangesResponse, InitialDataResponse,
    PushedChange, StatusResponse, ACK_PATH, APPLY_PATH, CHANGES_PATH, INITIAL_DATA_PATH,
    NODE_ID_HEADER, SIGNATURE_HEADER, STATUS_PATH,
};

// =============================================================================
// Transport Trait
// =============================================================================

/// Request/response exchange with the primary.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Up to one page of changes recorded after `since` that this node has
    /// not acknowledged.
    async fn fetch_changes(&self, since: DateTime<Utc>) -> SyncResult<ChangesResponse>;

    /// Confirms that this node consumed the given primary change ids.
    async fn acknowledge(&self, change_ids: Vec<String>) -> SyncResult<AckResponse>;

    /// Sends local changes for the primary to apply.
    async fn push_changes(&self, changes: Vec<PushedChange>) -> SyncResult<ApplyResponse>;

    /// Full catalog snapshot for bootstrapping.
    async fn fetch_initial_data(&self) -> SyncResult<InitialDataResponse>;
}

// =============================================================================
// HTTP Transport
// =============================================================================

/// [`SyncTransport`] over HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    node_id: String,
    secret: String,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        node_id: impl Into<String>,
        secret: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> SyncResult<Self> {
        let mut base_url = Url::parse(base_url)?;
        // Without the trailing slash, `join` replaces the last path segment.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("Failed to build HTTP client: {}", e)))?;

        Ok(HttpTransport {
            client,
            base_url,
            node_id: node_id.into(),
            secret: secret.into(),
            request_timeout,
        })
    }

    /// Builds a transport for a replica from its node config.
    pub fn from_config(config: &NodeConfig) -> SyncResult<Self> {
        let url = config
            .sync
            .primary_url
            .as_deref()
            .ok_or_else(|| SyncError::InvalidConfig("sync.primary_url is not set".into()))?;
        let secret = config
            .sync
            .secret
            .as_deref()
            .ok_or_else(|| SyncError::InvalidConfig("sync.secret is not set".into()))?;

        Self::new(
            url,
            config.node_id(),
            secret,
            Duration::from_secs(config.sync.connect_timeout_secs),
            Duration::from_secs(config.sync.request_timeout_secs),
        )
    }

    /// Primary's status endpoint (not part of the sync cycle).
    pub async fn status(&self) -> SyncResult<StatusResponse> {
        let request = self.client.get(self.url(STATUS_PATH)?);
        self.send(request).await
    }

    /// Resolves a route below the base URL, keeping any path prefix.
    fn url(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> SyncResult<T> {
        let response = request
            .header(NODE_ID_HEADER, &self.node_id)
            .header(SIGNATURE_HEADER, &self.secret)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Primary rejected node credentials");
            return Err(SyncError::AuthFailed(body));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::RemoteRejected {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::DeserializationFailed(e.to_string()))
    }

    fn map_send_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.request_timeout.as_secs())
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn fetch_changes(&self, since: DateTime<Utc>) -> SyncResult<ChangesResponse> {
        debug!(since = %since, "Fetching changes from primary");

        let request = self
            .client
            .get(self.url(CHANGES_PATH)?)
            .query(&[("since", since.to_rfc3339())]);
        self.send(request).await
    }

    async fn acknowledge(&self, change_ids: Vec<String>) -> SyncResult<AckResponse> {
        let request = self
            .client
            .post(self.url(ACK_PATH)?)
            .json(&AckRequest { change_ids });
        self.send(request).await
    }

    async fn push_changes(&self, changes: Vec<PushedChange>) -> SyncResult<ApplyResponse> {
        debug!(count = changes.len(), "Pushing changes to primary");

        let request = self
            .client
            .post(self.url(APPLY_PATH)?)
            .json(&ApplyRequest { changes });
        self.send(request).await
    }

    async fn fetch_initial_data(&self) -> SyncResult<InitialDataResponse> {
        let request = self.client.get(self.url(INITIAL_DATA_PATH)?);
        self.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_base_url() {
        let err = HttpTransport::new(
            "not a url",
            "n",
            "s",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_from_config_requires_primary() {
        let config = NodeConfig::default();
        assert!(HttpTransport::from_config(&config).is_err());
    }

    #[test]
    fn test_paths_join_onto_base() {
        let transport = HttpTransport::new(
            "http://10.0.0.2:8787/",
            "n",
            "s",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            transport.url(CHANGES_PATH).unwrap().as_str(),
            "http://10.0.0.2:8787/sync/changes"
        );
    }

    #[test]
    fn test_paths_keep_base_prefix() {
        for base in ["https://archive.example/api/v1", "https://archive.example/api/v1/"] {
            let transport = HttpTransport::new(
                base,
                "n",
                "s",
                Duration::from_secs(1),
                Duration::from_secs(1),
            )
            .unwrap();
            assert_eq!(
                transport.url(APPLY_PATH).unwrap().as_str(),
                "https://archive.example/api/v1/sync/apply"
            );
        }
    }
}
