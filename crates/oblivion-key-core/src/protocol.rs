//! KeyService wire shapes and the transport seam.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const GENERATE_KEY_PATH: &str = "/api/generate-key";
pub const CHECK_KEY_PATH: &str = "/api/check-key";
pub const POSTBACK_PATH: &str = "/api/postback";
pub const STANDARD_SYSTEM: &str = "standard";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateKeyRequest {
    pub session_id: String,
    pub system: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckKeyRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateKeyResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Hours until the key expires.
    #[serde(default, alias = "expiresInHours", skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckKeyResponse {
    #[serde(default)]
    pub has_key: bool,
    #[serde(default)]
    pub expired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, alias = "expiresInHours", skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<f64>,
}

/// Raw KeyService answer; interpretation happens in the acquisition layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl ServiceReply {
    pub fn new(status: u16, content_type: Option<&str>, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: content_type.map(str::to_string),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, Some("application/json"), value.to_string())
    }

    pub fn html(status: u16, body: impl Into<String>) -> Self {
        Self::new(status, Some("text/html; charset=utf-8"), body)
    }

    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        self.status == 403
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Covers `application/json`, `application/problem+json` and charset suffixes.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .and_then(|value| value.split(';').next())
            .map(|mime| mime.trim().to_ascii_lowercase())
            .is_some_and(|mime| mime == "application/json" || mime.ends_with("+json"))
    }

    /// Decodes the body when it is declared and parses as JSON.
    #[must_use]
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        if !self.is_json() {
            return None;
        }
        serde_json::from_str(&self.body).ok()
    }
}

#[async_trait]
pub trait KeyServiceTransport: Send + Sync {
    type Error: std::fmt::Display + Send;

    async fn generate_key(&self, request: &GenerateKeyRequest)
    -> Result<ServiceReply, Self::Error>;
    async fn check_key(&self, request: &CheckKeyRequest) -> Result<ServiceReply, Self::Error>;
}

#[async_trait]
impl<T: KeyServiceTransport + ?Sized> KeyServiceTransport for Arc<T> {
    type Error = T::Error;

    async fn generate_key(
        &self,
        request: &GenerateKeyRequest,
    ) -> Result<ServiceReply, Self::Error> {
        (**self).generate_key(request).await
    }

    async fn check_key(&self, request: &CheckKeyRequest) -> Result<ServiceReply, Self::Error> {
        (**self).check_key(request).await
    }
}
