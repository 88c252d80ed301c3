//! Per-request execution state.
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use http::HeaderName;
use http::HeaderValue;
use http::Method;
use http::Uri;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::json_ext::EMPTY_OBJECT;

pub(crate) const CYCLE_COUNTER_HEADER: &str = "wg-cycle-counter";
pub(crate) const REQUEST_ID_HEADER: &str = "x-request-id";

/// An authenticated user, as handed to hooks in `__wg.user`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub custom_claims: serde_json::Map<String, serde_json::Value>,
}

/// The inbound client request, as seen by hooks and by the resolver.
#[derive(Clone, Debug)]
pub struct ClientRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// Shape of the client request inside a hook envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub(crate) struct ClientRequestSnapshot {
    pub(crate) method: String,
    #[serde(rename = "requestURI")]
    pub(crate) request_uri: String,
    pub(crate) headers: BTreeMap<String, String>,
}

impl ClientRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }

    /// `Wg-Cycle-Counter` of the inbound request plus one, so hooks calling back into the
    /// gateway can detect loops.
    pub(crate) fn cycle_counter(&self) -> i64 {
        self.headers
            .get(CYCLE_COUNTER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .unwrap_or(0)
            + 1
    }

    pub(crate) fn request_id(&self) -> Option<&HeaderValue> {
        self.headers.get(REQUEST_ID_HEADER)
    }

    /// Multi-valued headers are joined with `,`.
    pub(crate) fn snapshot(&self) -> ClientRequestSnapshot {
        let mut headers = BTreeMap::new();
        for name in self.headers.keys() {
            let values = self
                .headers
                .get_all(name)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(",");
            headers.insert(name.as_str().to_string(), values);
        }
        ClientRequestSnapshot {
            method: self.method.to_string(),
            request_uri: self
                .uri
                .path_and_query()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| self.uri.path().to_string()),
            headers,
        }
    }
}

/// Mutable state of one request's execution.
///
/// Owned by the request for its whole lifetime and never shared with another request.
#[derive(Debug)]
pub struct ResolveContext {
    /// Current variables as a JSON object
    pub variables: Bytes,
    /// Cancelled when the client goes away or the server shuts down
    pub cancel: CancellationToken,
    /// The client request; hooks may add headers to it
    pub client_request: ClientRequest,
    pub user: Option<Arc<User>>,
}

impl ResolveContext {
    pub fn new(variables: Bytes, cancel: CancellationToken, client_request: ClientRequest) -> Self {
        let variables = if variables.is_empty() {
            Bytes::from_static(EMPTY_OBJECT)
        } else {
            variables
        };
        Self {
            variables,
            cancel,
            client_request,
            user: None,
        }
    }

    pub fn with_user(mut self, user: Option<User>) -> Self {
        self.user = user.map(Arc::new);
        self
    }

    /// Headers sent along with upstream requests.
    pub fn request_headers(&self) -> &HeaderMap {
        &self.client_request.headers
    }

    /// Apply `setClientRequestHeaders` from a hook response.
    pub(crate) fn set_request_headers(&mut self, headers: &BTreeMap<String, String>) {
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    self.client_request.headers.insert(name, value);
                }
                _ => {
                    tracing::warn!(header = %name, "hook returned an invalid client request header");
                }
            }
        }
    }
}
