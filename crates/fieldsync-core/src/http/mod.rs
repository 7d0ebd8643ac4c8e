//! HTTP seam between the engine and the field server.

use std::future::Future;

use serde_json::Value;

use crate::util::compact_text;
use crate::Result;

mod reqwest_transport;

pub use reqwest_transport::ReqwestTransport;

/// A response that reached the client, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Parsed JSON body; non-JSON bodies are kept as a JSON string.
    pub body: Value,
}

impl HttpResponse {
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Outgoing HTTP used by the dispatcher, cache and connectivity probe.
///
/// `Err(Error::Transport)` means no response was received. Any response,
/// including 4xx/5xx, is returned as `Ok` from `post_json`.
pub trait HttpTransport: Send + Sync + 'static {
    fn post_json(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        body: &Value,
    ) -> impl Future<Output = Result<HttpResponse>> + Send;

    /// GET a JSON document. Non-2xx statuses map to `Error::HttpStatus`,
    /// undecodable bodies to `Error::Serialization`.
    fn get_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> impl Future<Output = Result<Value>> + Send;
}

/// How the server judged one submitted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAck {
    Accepted,
    Rejected { message: String },
}

impl ServerAck {
    /// Accepted only for a 2xx response whose body carries `success: true`
    /// or `status: true`. Either flag is honored.
    pub fn from_response(response: &HttpResponse) -> Self {
        if response.is_success() && body_flag(&response.body) {
            return Self::Accepted;
        }

        let message = server_message(&response.body).unwrap_or_else(|| {
            if response.is_success() {
                "Server rejected the submission".to_string()
            } else {
                format!("HTTP {}", response.status)
            }
        });
        Self::Rejected { message }
    }

    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

fn body_flag(body: &Value) -> bool {
    ["success", "status"]
        .iter()
        .any(|field| body.get(field).and_then(Value::as_bool) == Some(true))
}

/// Extract the human-readable message a server attached to a response.
pub fn server_message(body: &Value) -> Option<String> {
    let text = match body {
        Value::String(text) => Some(text.as_str()),
        Value::Object(_) => ["message", "notif", "error"]
            .iter()
            .find_map(|field| body.get(field).and_then(Value::as_str)),
        _ => None,
    }?;

    let text = compact_text(text);
    (!text.is_empty()).then_some(text)
}
