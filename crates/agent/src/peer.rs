//! Transport to peer nodes that expose their own creatable entity types.
//!
//! Peers answer `GET {base}/capabilities` with a capability listing and
//! `POST {base}/execute-action` with a success/data or error envelope. Calls
//! use a short timeout and are never retried here.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use parley_core::config::PeerConfig;
use parley_core::domain::action::{FieldSpec, PeerRef};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerCapability {
    pub entity_type: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
}

impl PeerCapability {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            label: None,
            description: None,
            fields: BTreeMap::new(),
            required: Vec::new(),
            triggers: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
struct CapabilityListing {
    #[serde(default)]
    capabilities: Vec<PeerCapability>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerExecuteRequest {
    pub entity_type: String,
    pub params: Map<String, Value>,
    pub user_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerExecuteResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer `{node_id}` timed out")]
    Timeout { node_id: String },
    #[error("peer `{node_id}` is unreachable: {message}")]
    Unreachable { node_id: String, message: String },
    #[error("peer `{node_id}` answered with status {status}")]
    Status { node_id: String, status: u16 },
    #[error("peer `{node_id}` sent an unreadable reply: {message}")]
    Decode { node_id: String, message: String },
}

impl PeerError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "peer.timeout",
            Self::Unreachable { .. } => "peer.unreachable",
            Self::Status { .. } => "peer.status",
            Self::Decode { .. } => "peer.decode",
        }
    }
}

pub fn peer_ref(config: &PeerConfig) -> PeerRef {
    PeerRef { node_id: config.node_id.clone(), base_url: config.base_url.clone() }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn capabilities(&self, peer: &PeerRef) -> Result<Vec<PeerCapability>, PeerError>;

    async fn execute_action(
        &self,
        peer: &PeerRef,
        request: &PeerExecuteRequest,
    ) -> Result<PeerExecuteResponse, PeerError>;
}

pub struct HttpPeerTransport {
    client: reqwest::Client,
}

impl HttpPeerTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self { client: reqwest::Client::builder().timeout(timeout).build()? })
    }

    fn transport_error(peer: &PeerRef, error: reqwest::Error) -> PeerError {
        if error.is_timeout() {
            PeerError::Timeout { node_id: peer.node_id.clone() }
        } else if error.is_decode() {
            PeerError::Decode { node_id: peer.node_id.clone(), message: error.to_string() }
        } else {
            PeerError::Unreachable { node_id: peer.node_id.clone(), message: error.to_string() }
        }
    }

    async fn decode<T>(peer: &PeerRef, response: reqwest::Response) -> Result<T, PeerError>
    where
        T: serde::de::DeserializeOwned,
    {
        let status = response.status();
        if !status.is_success() {
            let node_id = peer.node_id.clone();
            return Err(PeerError::Status { node_id, status: status.as_u16() });
        }
        response.json::<T>().await.map_err(|error| PeerError::Decode {
            node_id: peer.node_id.clone(),
            message: error.to_string(),
        })
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn capabilities(&self, peer: &PeerRef) -> Result<Vec<PeerCapability>, PeerError> {
        let url = format!("{}/capabilities", peer.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| Self::transport_error(peer, error))?;
        let listing: CapabilityListing = Self::decode(peer, response).await?;
        Ok(listing.capabilities)
    }

    async fn execute_action(
        &self,
        peer: &PeerRef,
        request: &PeerExecuteRequest,
    ) -> Result<PeerExecuteResponse, PeerError> {
        let url = format!("{}/execute-action", peer.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|error| Self::transport_error(peer, error))?;
        Self::decode(peer, response).await
    }
}

/// Peer transport backed by fixed listings; counts calls so cache behaviour
/// can be observed.
#[derive(Clone, Default)]
pub struct InMemoryPeerTransport {
    listings: Arc<Mutex<HashMap<String, Result<Vec<PeerCapability>, PeerError>>>>,
    responses: Arc<Mutex<HashMap<String, PeerExecuteResponse>>>,
    executed: Arc<Mutex<Vec<(String, PeerExecuteRequest)>>>,
    capability_calls: Arc<AtomicUsize>,
}

impl InMemoryPeerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listing(self, node_id: &str, capabilities: Vec<PeerCapability>) -> Self {
        if let Ok(mut listings) = self.listings.lock() {
            listings.insert(node_id.to_string(), Ok(capabilities));
        }
        self
    }

    pub fn with_failure(self, node_id: &str, error: PeerError) -> Self {
        if let Ok(mut listings) = self.listings.lock() {
            listings.insert(node_id.to_string(), Err(error));
        }
        self
    }

    /// Reply returned for `execute-action` calls on `entity_type`.
    pub fn with_response(self, entity_type: &str, response: PeerExecuteResponse) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(entity_type.to_string(), response);
        }
        self
    }

    pub fn capability_calls(&self) -> usize {
        self.capability_calls.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<(String, PeerExecuteRequest)> {
        self.executed.lock().map(|executed| executed.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PeerTransport for InMemoryPeerTransport {
    async fn capabilities(&self, peer: &PeerRef) -> Result<Vec<PeerCapability>, PeerError> {
        self.capability_calls.fetch_add(1, Ordering::SeqCst);
        let listing = self.listings.lock().ok().and_then(|l| l.get(&peer.node_id).cloned());
        listing.unwrap_or_else(|| {
            Err(PeerError::Unreachable {
                node_id: peer.node_id.clone(),
                message: "no listing registered".to_string(),
            })
        })
    }

    async fn execute_action(
        &self,
        peer: &PeerRef,
        request: &PeerExecuteRequest,
    ) -> Result<PeerExecuteResponse, PeerError> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push((peer.node_id.clone(), request.clone()));
        }
        let response =
            self.responses.lock().ok().and_then(|r| r.get(&request.entity_type).cloned());
        response.ok_or_else(|| PeerError::Timeout { node_id: peer.node_id.clone() })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CapabilityListing, PeerCapability, PeerError, PeerExecuteResponse};

    #[test]
    fn capability_listing_tolerates_missing_optional_keys() {
        let listing: CapabilityListing = serde_json::from_value(json!({
            "node_id": "crm",
            "capabilities": [
                {"entity_type": "lead", "fields": {"name": {"type": "string", "required": true}}},
                {"entity_type": "contact"}
            ]
        }))
        .expect("listing");

        assert_eq!(listing.capabilities.len(), 2);
        assert!(listing.capabilities[0].fields["name"].required);
        assert_eq!(listing.capabilities[1], PeerCapability::new("contact"));
    }

    #[test]
    fn execute_response_defaults_data_to_null() {
        let response: PeerExecuteResponse =
            serde_json::from_value(json!({"success": false, "error": "duplicate lead"}))
                .expect("response");
        assert!(!response.success);
        assert!(response.data.is_null());
        assert_eq!(response.error.as_deref(), Some("duplicate lead"));
    }

    #[test]
    fn errors_expose_stable_classes() {
        let error = PeerError::Timeout { node_id: "crm".to_string() };
        assert_eq!(error.error_class(), "peer.timeout");
        assert_eq!(error.to_string(), "peer `crm` timed out");
    }
}
