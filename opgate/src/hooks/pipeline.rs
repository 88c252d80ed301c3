//! Runs the hook stages of an operation around its resolution.
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;

use super::HookCaller;
use super::HookEnvelope;
use super::HookRequest;
use super::HookResponse;
use super::MiddlewareHook;
use crate::context::ResolveContext;
use crate::error::HookError;
use crate::error::PipelineError;
use crate::json_ext::is_literal_null;
use crate::operation::Operation;
use crate::services::resolver::Resolver;
use crate::transform::PostResolveTransformer;

/// Outcome of a pipeline run or of one of its halves.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineResponse {
    /// A terminal response was already reported, nothing else must be written
    pub done: bool,
    /// The response came from a hook instead of the resolver
    pub resolved: bool,
    /// Final bytes, or the variables to resolve with after the pre-resolve half
    pub data: Bytes,
}

impl PipelineResponse {
    fn done() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }
}

/// Reports a terminal response when a hook ends the request.
#[async_trait]
pub trait TerminalResponder: Send + Sync {
    async fn respond(&self, status: StatusCode, message: &str);
}

/// Keeps the terminal response of a one-shot request until the handler builds its reply.
#[derive(Debug, Default)]
pub(crate) struct RecordingResponder {
    recorded: Mutex<Option<(StatusCode, String)>>,
}

impl RecordingResponder {
    pub(crate) fn take(&self) -> Option<(StatusCode, String)> {
        self.recorded.lock().take()
    }
}

#[async_trait]
impl TerminalResponder for RecordingResponder {
    async fn respond(&self, status: StatusCode, message: &str) {
        self.recorded
            .lock()
            .get_or_insert_with(|| (status, message.to_string()));
    }
}

/// The hook stages of one operation.
///
/// Stateless between runs; every run works on the [`ResolveContext`] it is handed.
#[derive(Clone)]
pub struct HookPipeline {
    client: Option<Arc<dyn HookCaller>>,
    operation: Arc<Operation>,
    operation_name: Arc<str>,
    transformer: Option<Arc<PostResolveTransformer>>,
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPipeline")
            .field("operation", &self.operation.name)
            .field("hooks", &self.client.is_some())
            .finish()
    }
}

impl HookPipeline {
    pub fn new(
        client: Option<Arc<dyn HookCaller>>,
        operation: Arc<Operation>,
        transformer: Option<Arc<PostResolveTransformer>>,
    ) -> Self {
        Self {
            client,
            operation_name: Arc::from(operation.name.as_str()),
            operation,
            transformer,
        }
    }

    pub fn operation(&self) -> &Arc<Operation> {
        &self.operation
    }

    pub(crate) fn transformer(&self) -> Option<&Arc<PostResolveTransformer>> {
        self.transformer.as_ref()
    }

    fn enabled(&self, hook: MiddlewareHook) -> bool {
        if self.client.is_none() {
            return false;
        }
        let hooks = &self.operation.hooks;
        match hook {
            MiddlewareHook::PreResolve => hooks.pre_resolve,
            MiddlewareHook::MutatingPreResolve => hooks.mutating_pre_resolve,
            MiddlewareHook::MockResolve => hooks.mock_resolve,
            MiddlewareHook::CustomResolve => hooks.custom_resolve,
            MiddlewareHook::PostResolve => hooks.post_resolve,
            MiddlewareHook::MutatingPostResolve => hooks.mutating_post_resolve,
        }
    }

    /// Calls `hook` and applies its header mutations.
    ///
    /// Breaks when the hook answered without a response, after the terminal response
    /// has been reported.
    async fn call(
        &self,
        ctx: &mut ResolveContext,
        responder: &dyn TerminalResponder,
        hook: MiddlewareHook,
        response: Option<&[u8]>,
    ) -> Result<ControlFlow<(), HookResponse>, HookError> {
        let Some(client) = &self.client else {
            return Ok(ControlFlow::Continue(HookResponse::default()));
        };
        let envelope = HookEnvelope::encode(ctx, response)
            .map_err(|source| HookError::Encode { hook, source })?;
        let request = HookRequest {
            operation_name: self.operation_name.clone(),
            hook,
            envelope,
            request_id: ctx.client_request.request_id().cloned(),
            cancel: ctx.cancel.clone(),
        };
        match client.call(request).await? {
            Some(hook_response) => {
                if let Some(headers) = &hook_response.set_client_request_headers {
                    ctx.set_request_headers(headers);
                }
                Ok(ControlFlow::Continue(hook_response))
            }
            None => {
                tracing::error!(
                    "operation.name" = %self.operation.name,
                    "operation.kind" = %self.operation.kind,
                    "hook {hook} failed"
                );
                responder
                    .respond(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
                    .await;
                Ok(ControlFlow::Break(()))
            }
        }
    }

    /// Runs the pre-resolve stages.
    ///
    /// `resolved` is set when a mock or custom resolve hook supplied the response, which is
    /// then in `data`. Otherwise `data` holds the variables to resolve with.
    pub async fn pre_resolve(
        &self,
        ctx: &mut ResolveContext,
        responder: &dyn TerminalResponder,
    ) -> Result<PipelineResponse, HookError> {
        if self.enabled(MiddlewareHook::PreResolve)
            && self
                .call(ctx, responder, MiddlewareHook::PreResolve, None)
                .await?
                .is_break()
        {
            return Ok(PipelineResponse::done());
        }

        if self.enabled(MiddlewareHook::MutatingPreResolve) {
            let ControlFlow::Continue(hook_response) = self
                .call(ctx, responder, MiddlewareHook::MutatingPreResolve, None)
                .await?
            else {
                return Ok(PipelineResponse::done());
            };
            if let Some(input) = hook_response
                .input_bytes()
                .filter(|input| !is_literal_null(input))
            {
                ctx.variables = input;
            }
        }

        if self.enabled(MiddlewareHook::MockResolve) {
            let ControlFlow::Continue(hook_response) = self
                .call(ctx, responder, MiddlewareHook::MockResolve, None)
                .await?
            else {
                return Ok(PipelineResponse::done());
            };
            return Ok(PipelineResponse {
                done: false,
                resolved: true,
                data: hook_response.response_bytes(),
            });
        }

        if self.enabled(MiddlewareHook::CustomResolve) {
            let ControlFlow::Continue(hook_response) = self
                .call(ctx, responder, MiddlewareHook::CustomResolve, None)
                .await?
            else {
                return Ok(PipelineResponse::done());
            };
            let data = hook_response.response_bytes();
            if !data.is_empty() && !is_literal_null(&data) {
                return Ok(PipelineResponse {
                    done: false,
                    resolved: true,
                    data,
                });
            }
        }

        Ok(PipelineResponse {
            done: false,
            resolved: false,
            data: ctx.variables.clone(),
        })
    }

    /// Runs the post-resolve stages on `response`.
    pub async fn post_resolve(
        &self,
        ctx: &mut ResolveContext,
        responder: &dyn TerminalResponder,
        mut response: Bytes,
    ) -> Result<PipelineResponse, HookError> {
        if self.enabled(MiddlewareHook::PostResolve)
            && self
                .call(ctx, responder, MiddlewareHook::PostResolve, Some(&response[..]))
                .await?
                .is_break()
        {
            return Ok(PipelineResponse::done());
        }

        if self.enabled(MiddlewareHook::MutatingPostResolve) {
            let ControlFlow::Continue(hook_response) = self
                .call(
                    ctx,
                    responder,
                    MiddlewareHook::MutatingPostResolve,
                    Some(&response[..]),
                )
                .await?
            else {
                return Ok(PipelineResponse::done());
            };
            response = hook_response.response_bytes();
        }

        Ok(PipelineResponse {
            done: false,
            resolved: false,
            data: response,
        })
    }

    /// Runs the whole pipeline: pre-resolve hooks, resolution unless a hook supplied the
    /// response, post-resolve transformations, then post-resolve hooks.
    pub async fn run<R>(
        &self,
        ctx: &mut ResolveContext,
        responder: &dyn TerminalResponder,
        resolver: &R,
        plan: &R::Plan,
    ) -> Result<PipelineResponse, PipelineError>
    where
        R: Resolver,
    {
        let pre = self
            .pre_resolve(ctx, responder)
            .await
            .map_err(PipelineError::PreResolve)?;
        if pre.done {
            return Ok(pre);
        }

        let resolved = if pre.resolved {
            pre.data
        } else {
            ctx.variables = pre.data;
            resolver
                .resolve(ctx, plan)
                .await
                .map_err(PipelineError::Resolve)?
        };

        let response = match &self.transformer {
            Some(transformer) => transformer
                .transform(&resolved)
                .map_err(PipelineError::Transform)?,
            None => resolved,
        };

        let post = self
            .post_resolve(ctx, responder, response)
            .await
            .map_err(PipelineError::PostResolve)?;
        Ok(PipelineResponse {
            resolved: pre.resolved,
            ..post
        })
    }
}
