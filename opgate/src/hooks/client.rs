//! HTTP client for the external hook server.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderValue;
use http::StatusCode;
use http::header::CONTENT_TYPE;
use tracing::Instrument;

use super::HookCaller;
use super::HookRequest;
use super::HookResponse;
use super::MiddlewareHook;
use crate::configuration::ConfigurationError;
use crate::configuration::Hooks;
use crate::configuration::Retry;
use crate::context::REQUEST_ID_HEADER;
use crate::error::HookError;
use crate::json_ext::is_literal_null;

/// Calls hooks at `<url>/operation/<operation name>/<hook>`.
///
/// Cheap to clone, the underlying connection pool is shared.
#[derive(Clone, Debug)]
pub struct HttpHookClient {
    http_client: reqwest::Client,
    url: Arc<str>,
    retry: Retry,
}

impl HttpHookClient {
    pub fn new(config: &Hooks) -> Result<Self, ConfigurationError> {
        let url = config
            .url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or(ConfigurationError::InvalidConfiguration {
                message: "hooks are enabled but no hook server url is configured",
                error: String::new(),
            })?;
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigurationError::InvalidConfiguration {
                message: "could not build the hook client",
                error: e.to_string(),
            })?;
        Ok(Self {
            http_client,
            url: Arc::from(url.trim_end_matches('/')),
            retry: config.retry.clone(),
        })
    }

    async fn send(
        &self,
        hook: MiddlewareHook,
        url: &str,
        body: Bytes,
        request_id: Option<&HeaderValue>,
    ) -> Result<Option<HookResponse>, HookError> {
        let mut attempt = 0;
        let response = loop {
            let mut builder = self
                .http_client
                .post(url)
                .header(CONTENT_TYPE, mime::APPLICATION_JSON.essence_str())
                .body(body.clone());
            if let Some(request_id) = request_id {
                builder = builder.header(REQUEST_ID_HEADER, request_id.clone());
            }
            let result = builder.send().await;
            let retryable = match &result {
                Ok(response) => is_retryable(response.status()),
                Err(e) => !e.is_builder() && !e.is_redirect(),
            };
            if !retryable || attempt >= self.retry.max_attempts {
                break result;
            }
            attempt += 1;
            match &result {
                Ok(response) => {
                    tracing::debug!(%hook, attempt, status = %response.status(), "retrying hook")
                }
                Err(e) => tracing::debug!(%hook, attempt, error = %e, "retrying hook"),
            }
            tokio::time::sleep(self.retry.delay).await;
        };

        let response = response.map_err(|source| transport_error(hook, source))?;
        let status = response.status();
        let data = response
            .bytes()
            .await
            .map_err(|source| transport_error(hook, source))?;
        if status != StatusCode::OK {
            return Err(HookError::Status {
                hook,
                status,
                body: String::from_utf8_lossy(&data).into_owned(),
            });
        }
        if is_literal_null(&data) {
            return Ok(None);
        }
        let hook_response: HookResponse =
            serde_json::from_slice(&data).map_err(|source| HookError::Decode { hook, source })?;
        if let Some(message) = hook_response.error.as_deref().filter(|m| !m.is_empty()) {
            return Err(HookError::Rejected {
                hook,
                message: message.to_string(),
            });
        }
        Ok(Some(hook_response))
    }
}

/// 429 and 5xx are retried, except 500 which the hook server uses for a definitive failure.
fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error()
            && status != StatusCode::INTERNAL_SERVER_ERROR
            && status != StatusCode::NOT_IMPLEMENTED)
}

fn transport_error(hook: MiddlewareHook, source: reqwest::Error) -> HookError {
    if source.is_timeout() {
        HookError::Timeout { hook }
    } else {
        HookError::Transport { hook, source }
    }
}

#[async_trait]
impl HookCaller for HttpHookClient {
    async fn call(&self, request: HookRequest) -> Result<Option<HookResponse>, HookError> {
        let hook = request.hook;
        let body = serde_json::to_vec(&request.envelope)
            .map_err(|source| HookError::Encode { hook, source })?;
        let url = format!(
            "{}/operation/{}/{}",
            self.url, request.operation_name, hook
        );
        tracing::debug!("forwarding json: {}", String::from_utf8_lossy(&body));

        let span = tracing::debug_span!(
            "hook_call",
            "operation.name" = %request.operation_name,
            hook = %hook
        );
        tokio::select! {
            biased;
            _ = request.cancel.cancelled() => Err(HookError::Cancelled { hook }),
            result = self
                .send(hook, &url, Bytes::from(body), request.request_id.as_ref())
                .instrument(span) => result,
        }
    }
}
