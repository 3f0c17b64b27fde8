//! Agent wire protocol.
//!
//! One WebSocket text message = one JSON document with a `"type"` field.
//!
//! | Dir             | Type         | Payload                                                  |
//! |-----------------|--------------|----------------------------------------------------------|
//! | agent → server  | `register`   | `agentId, token, tunnelName?, subdomain?, localPort?, description?` |
//! | server → agent  | `welcome`    | `timestamp`                                              |
//! | server → agent  | `registered` | canonical tunnel object + public `url`                   |
//! | server → agent  | `error`      | `message, error?`                                        |
//! | server → agent  | `request`    | `id, method, path, headers, body`                        |
//! | agent → server  | `response`   | `id, statusCode, headers, body`                          |
//! | both            | `ping`/`pong`| `timestamp`                                              |

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normal session close.
pub const CLOSE_NORMAL: u16 = 1000;
/// Token invalid or expired.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// A newer session took over this tunnel id.
pub const CLOSE_DUPLICATE: u16 = 4002;
/// Registration failed (subdomain conflict, storage failure).
pub const CLOSE_REGISTRATION_FAILED: u16 = 4003;

/// First frame an agent must send after the transport opens.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterFrame {
    pub agent_id: String,
    pub token: String,
    pub tunnel_name: Option<String>,
    pub subdomain: Option<String>,
    pub local_port: Option<i32>,
    pub description: Option<String>,
}

/// Outbound `request` frame carrying one public HTTP request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub id: String,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RequestFrame {
    pub fn new(id: String, method: String, path: String, headers: HashMap<String, String>, body: String) -> Self {
        Self {
            frame_type: "request",
            id,
            method,
            path,
            headers,
            body,
        }
    }
}

/// Inbound `response` frame answering one `request` frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub id: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// String bodies pass through verbatim; structured values are
    /// re-serialised by the front-end with a JSON content-type default.
    #[serde(default)]
    pub body: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_frame_field_names() {
        let frame: RegisterFrame = serde_json::from_value(json!({
            "type": "register",
            "agentId": "t1",
            "token": "tok",
            "tunnelName": "My App",
            "localPort": 3000,
        }))
        .unwrap();
        assert_eq!(frame.agent_id, "t1");
        assert_eq!(frame.tunnel_name.as_deref(), Some("My App"));
        assert_eq!(frame.local_port, Some(3000));
        assert!(frame.subdomain.is_none());
    }

    #[test]
    fn test_request_frame_wire_shape() {
        let frame = RequestFrame::new(
            "abc".into(),
            "GET".into(),
            "/ping".into(),
            HashMap::new(),
            String::new(),
        );
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "request");
        assert_eq!(v["id"], "abc");
        assert_eq!(v["method"], "GET");
        assert_eq!(v["path"], "/ping");
    }

    #[test]
    fn test_response_frame_defaults() {
        let frame: ResponseFrame =
            serde_json::from_value(json!({"type": "response", "id": "abc"})).unwrap();
        assert_eq!(frame.status_code, None);
        assert!(frame.headers.is_none());
        assert!(frame.body.is_none());

        let frame: ResponseFrame = serde_json::from_value(json!({
            "type": "response",
            "id": "abc",
            "statusCode": 404,
            "body": "not here",
        }))
        .unwrap();
        assert_eq!(frame.status_code, Some(404));
        assert_eq!(frame.body, Some(json!("not here")));
    }
}
