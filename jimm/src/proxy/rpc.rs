//! JSON-RPC envelope spoken on both legs of a proxied session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

pub const ACCESS_REQUIRED_CODE: &str = "access required";

/// One frame of the protocol. Requests carry `type`/`request`; replies carry
/// `response` or the error triple. `request-id` is nonzero in both directions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(rename = "request-id", default)]
    pub request_id: u64,

    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub type_: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub version: u64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(rename = "error-code", default, skip_serializing_if = "String::is_empty")]
    pub error_code: String,

    #[serde(rename = "error-info", default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<serde_json::Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl RpcMessage {
    pub fn is_request(&self) -> bool {
        !self.type_.is_empty() && !self.request.is_empty()
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty() || !self.error_code.is_empty()
    }

    /// Zero request ids violate the protocol in both directions.
    pub fn is_well_formed(&self) -> bool {
        self.request_id != 0
    }

    pub fn is_login(&self) -> bool {
        self.is_request() && self.type_ == "Admin" && self.request == "Login"
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("RPC messages always serialize")
    }

    /// Reply surfacing a gateway-side error under the caller's request id.
    pub fn error_reply(request_id: u64, error: &Error) -> Self {
        RpcMessage {
            request_id,
            error: error.message().to_owned(),
            error_code: error.kind().code().to_owned(),
            error_info: error.info().cloned(),
            ..RpcMessage::default()
        }
    }

    /// Synthesized reply for a backend call that never answered in time.
    pub fn timeout_reply(request_id: u64) -> Self {
        RpcMessage {
            request_id,
            error: "timed out waiting for the backend reply".to_owned(),
            error_code: crate::error::ErrorKind::Timeout.code().to_owned(),
            ..RpcMessage::default()
        }
    }
}
