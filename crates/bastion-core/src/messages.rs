//! Control messages exchanged with the browser over the transport.
//!
//! Frames are JSON objects tagged by a `type` field. Field names are
//! camelCase on the wire.

use serde::{Deserialize, Deserializer, Serialize};

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Open(OpenPayload),
    Input(InputPayload),
    Resize(ResizePayload),
    Close(SessionRef),
}

/// Request to open a shell on a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    #[serde(deserialize_with = "string_or_number")]
    pub target_id: String,
    pub cols: u16,
    pub rows: u16,
    /// Client-proposed session id. Replaced if already live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, alias = "acceptHostKey")]
    pub accept_host_identity: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPayload {
    pub session_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizePayload {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

/// A bare session reference (`close` in both directions, `ready`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

/// Messages sent by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Ready(SessionRef),
    Output(OutputPayload),
    Error(ErrorPayload),
    Close(SessionRef),
}

impl ServerMessage {
    pub fn ready(session_id: impl Into<String>) -> Self {
        ServerMessage::Ready(SessionRef {
            session_id: session_id.into(),
        })
    }

    pub fn output(session_id: impl Into<String>, data: impl Into<String>) -> Self {
        ServerMessage::Output(OutputPayload {
            session_id: session_id.into(),
            data: data.into(),
        })
    }

    pub fn close(session_id: impl Into<String>) -> Self {
        ServerMessage::Close(SessionRef {
            session_id: session_id.into(),
        })
    }

    pub fn error(payload: ErrorPayload) -> Self {
        ServerMessage::Error(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPayload {
    pub session_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            session_id: None,
            error: error.into(),
            code: Some(code),
            fingerprint: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

/// Machine-readable error codes carried in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TargetNotFound,
    AuthMissing,
    HostIdentityUnverified,
    AuthRejected,
    NetworkError,
    ShellError,
    MalformedMessage,
    SessionLimit,
}

/// Accept ids sent either as JSON strings or numbers.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Unsigned(u64),
        Signed(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Unsigned(n) => n.to_string(),
        Id::Signed(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn open_accepts_numeric_target_and_legacy_flag() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "open",
            "targetId": 101,
            "cols": 120,
            "rows": 40,
            "acceptHostKey": true
        }))
        .unwrap();
        match msg {
            ClientMessage::Open(p) => {
                assert_eq!(p.target_id, "101");
                assert_eq!((p.cols, p.rows), (120, 40));
                assert!(p.accept_host_identity);
                assert!(p.password.is_none());
                assert!(p.session_id.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn open_requires_geometry() {
        let result: Result<ClientMessage, _> = serde_json::from_value(json!({
            "type": "open",
            "targetId": "ct-01"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn error_frame_omits_empty_fields() {
        let msg = ServerMessage::error(ErrorPayload::new(
            ErrorCode::TargetNotFound,
            "Target not found",
        ));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "error": "Target not found", "code": "TARGET_NOT_FOUND"})
        );
    }

    #[test]
    fn host_identity_error_carries_fingerprint() {
        let msg = ServerMessage::error(
            ErrorPayload::new(ErrorCode::HostIdentityUnverified, "Host key not accepted")
                .with_session("s1")
                .with_fingerprint("SHA256:abc"),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["code"], "HOST_IDENTITY_UNVERIFIED");
        assert_eq!(value["fingerprint"], "SHA256:abc");
    }
}
