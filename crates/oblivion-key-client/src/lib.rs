use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use oblivion_key_core::protocol::{
    CHECK_KEY_PATH, CheckKeyRequest, GENERATE_KEY_PATH, GenerateKeyRequest, POSTBACK_PATH,
};
use oblivion_key_core::{KeyServiceTransport, ServiceReply};

pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 2;
const MIN_TIMEOUT_MS: u64 = 250;

const USER_AGENT: &str = concat!("oblivion-key-client/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct KeyServiceClientConfig {
    pub base_url: String,
    /// `0` disables the per-request timeout.
    pub timeout_ms: u64,
    pub request_attempts: usize,
}

impl KeyServiceClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeyServiceClient {
    base_url: String,
    timeout: Option<Duration>,
    request_attempts: usize,
    http: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum KeyClientError {
    #[error("key_service_base_url_missing")]
    BaseUrlMissing,
    #[error("key_service_invalid_path")]
    InvalidPath,
    #[error("key_service_client_build_failed:{message}")]
    Build { message: String },
    #[error("key_service_request_failed:{message}")]
    Request { message: String },
    #[error("key_service_read_failed:{message}")]
    Read { message: String },
}

impl KeyServiceClient {
    pub fn new(config: KeyServiceClientConfig) -> Result<Self, KeyClientError> {
        let base_url = normalize_base_url(&config.base_url)?;
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|error| KeyClientError::Build {
                message: error.to_string(),
            })?;
        Ok(Self {
            base_url,
            timeout: (config.timeout_ms > 0)
                .then(|| Duration::from_millis(config.timeout_ms.max(MIN_TIMEOUT_MS))),
            request_attempts: config.request_attempts.max(1),
            http,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    #[must_use]
    pub fn postback_path(sid: &str) -> String {
        format!("{POSTBACK_PATH}?sid={}", urlencoding::encode(sid.trim()))
    }

    pub async fn generate_key_reply(
        &self,
        request: &GenerateKeyRequest,
    ) -> Result<ServiceReply, KeyClientError> {
        self.post_json(GENERATE_KEY_PATH, request).await
    }

    pub async fn check_key_reply(
        &self,
        request: &CheckKeyRequest,
    ) -> Result<ServiceReply, KeyClientError> {
        self.post_json(CHECK_KEY_PATH, request).await
    }

    /// Advisory completion signal some development backends expose. The
    /// reply is reported as-is; the gate is still decided by generate-key.
    pub async fn postback(&self, sid: &str) -> Result<ServiceReply, KeyClientError> {
        let url = self
            .endpoint(Self::postback_path(sid).as_str())
            .ok_or(KeyClientError::InvalidPath)?;
        self.send_with_retry(url.as_str(), |http, url| http.get(url))
            .await
    }

    pub async fn post_json<Req>(
        &self,
        path: &str,
        payload: &Req,
    ) -> Result<ServiceReply, KeyClientError>
    where
        Req: Serialize + ?Sized,
    {
        let url = self.endpoint(path).ok_or(KeyClientError::InvalidPath)?;
        self.send_with_retry(url.as_str(), |http, url| http.post(url).json(payload))
            .await
    }

    /// Only connect failures are retried: a request that reached the
    /// service may already have minted a key.
    async fn send_with_retry<B>(&self, url: &str, build: B) -> Result<ServiceReply, KeyClientError>
    where
        B: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let mut last_error: Option<String> = None;

        for attempt in 0..self.request_attempts {
            let mut request = build(&self.http, url)
                .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()));
            if let Some(timeout) = self.timeout {
                request = request.timeout(timeout);
            }

            match request.send().await {
                Ok(response) => return read_reply(response).await,
                Err(error) => {
                    let retryable = error.is_connect();
                    warn!(url, attempt, retryable, %error, "key service request failed");
                    last_error = Some(error.to_string());
                    if !retryable || attempt + 1 >= self.request_attempts {
                        break;
                    }
                }
            }
        }

        Err(KeyClientError::Request {
            message: last_error.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[async_trait]
impl KeyServiceTransport for KeyServiceClient {
    type Error = KeyClientError;

    async fn generate_key(
        &self,
        request: &GenerateKeyRequest,
    ) -> Result<ServiceReply, Self::Error> {
        self.generate_key_reply(request).await
    }

    async fn check_key(&self, request: &CheckKeyRequest) -> Result<ServiceReply, Self::Error> {
        self.check_key_reply(request).await
    }
}

fn normalize_base_url(base_url: &str) -> Result<String, KeyClientError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(KeyClientError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

async fn read_reply(response: reqwest::Response) -> Result<ServiceReply, KeyClientError> {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response
        .text()
        .await
        .map_err(|error| KeyClientError::Read {
            message: error.to_string(),
        })?;
    debug!(status, content_type = content_type.as_deref(), "key service replied");

    Ok(ServiceReply {
        status,
        content_type,
        body,
    })
}
