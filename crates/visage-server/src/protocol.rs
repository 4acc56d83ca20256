//! Wire protocol for the WebSocket API.
//!
//! One inbound request frame per job; zero or more `status` frames and
//! exactly one terminal (`success` or `error`) frame back. Binary payloads
//! travel base64-encoded inside JSON text frames.

use base64::Engine;
use serde::{Deserialize, Serialize};

use visage_core::{Error, RenderOptions, ResponseMode, Result};

/// Inbound request frame.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    /// Client-supplied id; the server generates one if absent
    #[serde(default)]
    pub request_id: Option<String>,

    /// Base64-encoded source image
    pub image_data: String,

    /// Base64-encoded driving audio
    pub audio_data: String,

    #[serde(default)]
    pub options: RenderOptions,

    #[serde(default)]
    pub response_mode: ResponseMode,
}

/// Outbound frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        request_id: String,
        stage: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        queue_position: Option<usize>,
    },
    Success {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        video_data: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reference_id: Option<String>,
        elapsed_ms: u64,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error_kind: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn status(
        request_id: impl Into<String>,
        stage: impl Into<String>,
        queue_position: Option<usize>,
    ) -> Self {
        ServerMessage::Status {
            request_id: request_id.into(),
            stage: stage.into(),
            queue_position,
        }
    }

    pub fn success_inline(request_id: impl Into<String>, video: &[u8], elapsed_ms: u64) -> Self {
        ServerMessage::Success {
            request_id: request_id.into(),
            video_data: Some(base64::engine::general_purpose::STANDARD.encode(video)),
            reference_id: None,
            elapsed_ms,
        }
    }

    pub fn success_reference(
        request_id: impl Into<String>,
        reference_id: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        ServerMessage::Success {
            request_id: request_id.into(),
            video_data: None,
            reference_id: Some(reference_id.into()),
            elapsed_ms,
        }
    }

    pub fn error(
        request_id: Option<String>,
        error_kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ServerMessage::Error {
            request_id,
            error_kind: error_kind.into(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap()
    }
}

/// Decode a base64 payload field, tolerating a data-URL prefix
/// (`data:image/png;base64,...`).
pub fn decode_payload(field: &str, data: &str) -> Result<Vec<u8>> {
    let encoded = match data.split_once(',') {
        Some((prefix, rest)) if prefix.contains("base64") => rest,
        _ => data,
    };
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| Error::Validation(format!("invalid base64 in {field}: {err}")))
}
