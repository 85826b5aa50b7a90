//! The wire codec spoken between the coordinator and worker agents.
//!
//! Every message is a tagged JSON union; the `type` field selects the variant.
//! Unknown `type`s are rejected at the boundary rather than silently coerced.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoordinationError;

pub const CONTENT_TYPE: &str = "application/vnd.ccswarm.coordination+json";
pub const CONTENT_TYPE_GZIP: &str = "application/vnd.ccswarm.coordination+json;compression=gzip";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationMessage {
    TaskAssign {
        task_id: String,
        description: String,
        #[serde(default)]
        context: Value,
        #[serde(default)]
        deadline: Option<DateTime<Utc>>,
    },
    TaskAck {
        task_id: String,
        agent_id: String,
    },
    Progress {
        task_id: String,
        agent_id: String,
        progress: f32,
        message: String,
    },
    Result {
        task_id: String,
        agent_id: String,
        status: String,
        summary: String,
    },
    Idle {
        agent_id: String,
    },
    Question {
        question_id: String,
        task_id: String,
        agent_id: String,
        question: String,
        #[serde(default)]
        options: Vec<String>,
    },
    Answer {
        question_id: String,
        task_id: String,
        answer: String,
        #[serde(default)]
        context: Option<Value>,
    },
    PermissionRequest {
        request_id: String,
        action: String,
        resource: String,
        #[serde(default)]
        context: String,
    },
    PermissionResponse {
        request_id: String,
        decision: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Terminate {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl CoordinationMessage {
    /// The `type` discriminator this message encodes as.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TaskAssign { .. } => "task_assign",
            Self::TaskAck { .. } => "task_ack",
            Self::Progress { .. } => "progress",
            Self::Result { .. } => "result",
            Self::Idle { .. } => "idle",
            Self::Question { .. } => "question",
            Self::Answer { .. } => "answer",
            Self::PermissionRequest { .. } => "permission_request",
            Self::PermissionResponse { .. } => "permission_response",
            Self::Terminate { .. } => "terminate",
        }
    }

    /// Serialize to an on-wire payload, optionally gzip-compressed.
    pub fn encode(&self, compress: bool) -> Result<EncodedPayload, CoordinationError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| CoordinationError::CodecMalformed(e.to_string()))?;
        if compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&json)
                .map_err(|e| CoordinationError::CodecMalformed(e.to_string()))?;
            let body = encoder
                .finish()
                .map_err(|e| CoordinationError::CodecMalformed(e.to_string()))?;
            Ok(EncodedPayload {
                content_type: CONTENT_TYPE_GZIP.to_string(),
                body,
            })
        } else {
            Ok(EncodedPayload {
                content_type: CONTENT_TYPE.to_string(),
                body: json,
            })
        }
    }

    /// Parse a received payload, decompressing first if the content-type says so.
    pub fn decode(content_type: &str, body: &[u8]) -> Result<Self, CoordinationError> {
        let json = if content_type.contains("compression=gzip") {
            let mut decoder = GzDecoder::new(body);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CoordinationError::CodecMalformed(e.to_string()))?;
            out
        } else {
            body.to_vec()
        };

        let value: Value = serde_json::from_slice(&json)
            .map_err(|e| CoordinationError::CodecMalformed(e.to_string()))?;

        let type_name = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CoordinationError::CodecMalformed("missing `type` field".into()))?
            .to_string();

        if !Self::is_known_type(&type_name) {
            return Err(CoordinationError::CodecUnknownType { type_name });
        }

        serde_json::from_value(value)
            .map_err(|e| CoordinationError::CodecMalformed(format!("{type_name}: {e}")))
    }

    /// Whether `type_name` names one of this enum's variants. Used by
    /// [`Self::decode`] to tell "unrecognized type" (`codec/unknown-type`)
    /// apart from "recognized type, invalid fields" (`codec/malformed`).
    fn is_known_type(type_name: &str) -> bool {
        matches!(
            type_name,
            "task_assign"
                | "task_ack"
                | "progress"
                | "result"
                | "idle"
                | "question"
                | "answer"
                | "permission_request"
                | "permission_response"
                | "terminate"
        )
    }
}

#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub content_type: String,
    pub body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_uncompressed() {
        let msg = CoordinationMessage::TaskAck {
            task_id: "t1".into(),
            agent_id: "a1".into(),
        };
        let encoded = msg.encode(false).unwrap();
        assert_eq!(encoded.content_type, CONTENT_TYPE);
        let decoded = CoordinationMessage::decode(&encoded.content_type, &encoded.body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trips_compressed() {
        let msg = CoordinationMessage::Progress {
            task_id: "t1".into(),
            agent_id: "a1".into(),
            progress: 0.5,
            message: "halfway".into(),
        };
        let encoded = msg.encode(true).unwrap();
        assert!(encoded.content_type.contains("gzip"));
        let decoded = CoordinationMessage::decode(&encoded.content_type, &encoded.body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_unknown_type() {
        let body = br#"{"type":"self_destruct"}"#;
        let err = CoordinationMessage::decode(CONTENT_TYPE, body).unwrap_err();
        assert_eq!(err.kind(), "codec/unknown-type");
    }

    #[test]
    fn recognized_type_with_missing_fields_is_malformed_not_unknown() {
        let body = br#"{"type":"task_assign"}"#;
        let err = CoordinationMessage::decode(CONTENT_TYPE, body).unwrap_err();
        assert_eq!(err.kind(), "codec/malformed");
    }

    #[test]
    fn rejects_missing_type() {
        let body = br#"{"task_id":"t1"}"#;
        let err = CoordinationMessage::decode(CONTENT_TYPE, body).unwrap_err();
        assert_eq!(err.kind(), "codec/malformed");
    }
}
