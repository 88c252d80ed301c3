//! Structures exchanged with the external hook server, communicating the state of an
//! operation at the different stages of its pipeline.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderValue;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_json::value::RawValue;
use strum_macros::Display;
use strum_macros::EnumIter;
use tokio_util::sync::CancellationToken;

use crate::context::ClientRequestSnapshot;
use crate::context::ResolveContext;
use crate::context::User;
use crate::error::HookError;
use crate::json_ext::has_variables;

pub mod client;
pub mod pipeline;

pub use client::HttpHookClient;
pub use pipeline::HookPipeline;
pub use pipeline::PipelineResponse;
pub use pipeline::TerminalResponder;

/// Pipeline stages at which the hook server may be called for an operation.
#[derive(
    Clone, Copy, Debug, Display, EnumIter, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum MiddlewareHook {
    MockResolve,
    PreResolve,
    PostResolve,
    CustomResolve,
    MutatingPreResolve,
    MutatingPostResolve,
}

/// Gateway metadata sent under `__wg`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WgMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) user: Option<Arc<User>>,
    pub(crate) client_request: ClientRequestSnapshot,
}

/// JSON document posted to the hook server. Built fresh for every call.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookEnvelope {
    #[serde(rename = "__wg")]
    pub(crate) wg: WgMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) input: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) response: Option<Box<RawValue>>,
    pub(crate) cycle_counter: i64,
}

impl HookEnvelope {
    /// Envelope for the current state of `ctx`, carrying `response` in the post-resolve stages.
    pub(crate) fn encode(
        ctx: &ResolveContext,
        response: Option<&[u8]>,
    ) -> Result<Self, serde_json::Error> {
        let input = if has_variables(&ctx.variables) {
            Some(serde_json::from_slice::<Box<RawValue>>(&ctx.variables)?)
        } else {
            None
        };
        let response = match response {
            Some(response) if !response.is_empty() => {
                Some(serde_json::from_slice::<Box<RawValue>>(response)?)
            }
            _ => None,
        };
        Ok(Self {
            wg: WgMetadata {
                user: ctx.user.clone(),
                client_request: ctx.client_request.snapshot(),
            },
            input,
            response,
            cycle_counter: ctx.client_request.cycle_counter(),
        })
    }
}

/// Decoded reply of the hook server.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub hook: Option<String>,
    /// Replacement response; a literal `null` is kept as `Some`
    #[serde(default, deserialize_with = "deserialize_raw")]
    pub response: Option<Box<RawValue>>,
    /// Replacement variables; a literal `null` is kept as `Some`
    #[serde(default, deserialize_with = "deserialize_raw")]
    pub input: Option<Box<RawValue>>,
    #[serde(default)]
    pub set_client_request_headers: Option<BTreeMap<String, String>>,
}

fn deserialize_raw<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

impl HookResponse {
    pub(crate) fn response_bytes(&self) -> Bytes {
        self.response
            .as_ref()
            .map(|raw| Bytes::copy_from_slice(raw.get().as_bytes()))
            .unwrap_or_default()
    }

    pub(crate) fn input_bytes(&self) -> Option<Bytes> {
        self.input
            .as_ref()
            .map(|raw| Bytes::copy_from_slice(raw.get().as_bytes()))
    }
}

/// One call to the hook server.
#[derive(Clone, Debug)]
pub struct HookRequest {
    pub operation_name: Arc<str>,
    pub hook: MiddlewareHook,
    pub envelope: HookEnvelope,
    /// Forwarded as `X-Request-Id`
    pub request_id: Option<HeaderValue>,
    /// The call returns promptly with [`HookError::Cancelled`] once this is cancelled
    pub cancel: CancellationToken,
}

/// Calls the hook server.
///
/// `Ok(None)` means the hook answered without a response: the request is over and the
/// pipeline must answer the client with a terminal error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HookCaller: Send + Sync + 'static {
    async fn call(&self, request: HookRequest) -> Result<Option<HookResponse>, HookError>;
}
