//! REST client for call lifecycle against the voice service API.
//!
//! Two endpoints matter: `POST /call` provisions a WebSocket transport
//! session and returns its URL, `DELETE /call/{id}` ends the call
//! server-side. Everything else about the call happens on the socket.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{CallError, Result};

/// Request body for `POST /call`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateCallRequest<'a> {
    assistant_id: &'a str,
    transport: TransportRequest,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransportRequest {
    provider: &'static str,
    audio_format: AudioFormat,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioFormat {
    format: &'static str,
    container: &'static str,
    sample_rate: u32,
}

/// Server-provisioned call session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    pub transport: TransportInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub websocket_call_url: String,
}

/// Thin async HTTP client for the call API.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    wire_sample_rate: u32,
}

impl RestClient {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            wire_sample_rate: config.wire_sample_rate,
        }
    }

    /// Provision a WebSocket call and return its session, including the
    /// transport URL to dial.
    pub async fn create_web_call(&self, assistant_id: &str) -> Result<CallSession> {
        let body = CreateCallRequest {
            assistant_id,
            transport: TransportRequest {
                provider: "vapi.websocket",
                audio_format: AudioFormat {
                    format: "pcm_s16le",
                    container: "raw",
                    sample_rate: self.wire_sample_rate,
                },
            },
        };

        debug!(assistant_id, "creating web call");
        let response = self
            .client
            .post(format!("{}/call", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::TransportConnect(e.to_string()))?;

        let session: CallSession = Self::check(response).await?.json().await.map_err(|e| {
            CallError::TransportConnect(format!("malformed call response: {e}"))
        })?;
        info!(call_id = %session.id, "web call created");
        Ok(session)
    }

    /// Tell the server the call is over. Best-effort on the caller's side;
    /// errors here should be logged, not fatal.
    pub async fn end_call(&self, call_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/call/{}", self.base_url, call_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| CallError::TransportConnect(e.to_string()))?;

        Self::check(response).await?;
        info!(call_id, "web call ended");
        Ok(())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CallError::Rest {
            status: status.as_u16(),
            body,
        })
    }
}
