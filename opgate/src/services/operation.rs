//! Execution of one request against a registered operation or an ad-hoc GraphQL document.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use http::HeaderValue;
use http::Method;
use http::StatusCode;
use http::header;
use serde::Deserialize;
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::live::LiveQuery;
use super::resolver::Resolver;
use crate::context::ClientRequest;
use crate::context::ResolveContext;
use crate::context::User;
use crate::error::PipelineError;
use crate::error::ResolveError;
use crate::error::STATUS_CLIENT_CLOSED_REQUEST;
use crate::error::StreamError;
use crate::graphql;
use crate::hooks::HookCaller;
use crate::hooks::HookPipeline;
use crate::hooks::pipeline::RecordingResponder;
use crate::json_ext::EMPTY_OBJECT;
use crate::json_ext::compact;
use crate::json_ext::has_variables;
use crate::json_ext::is_literal_null;
use crate::json_ext::merge_right_into_left;
use crate::operation::ExecutionMode;
use crate::operation::Operation;
use crate::operation::OperationKind;
use crate::operation::RegisteredOperation;
use crate::operation::RequestParams;
use crate::operation::VariablesValidationError;
use crate::operation::parse_form_variables;
use crate::operation::parse_query_variables;
use crate::protocols::ChannelSink;
use crate::protocols::FlushWriter;
use crate::protocols::FlushWriterOptions;
use crate::query_planner::CachingQueryPlanner;
use crate::query_planner::PreparedPlan;
use crate::query_planner::QueryPlanner;

const APPLICATION_JSON: HeaderValue = HeaderValue::from_static("application/json");
const TEXT_EVENT_STREAM: HeaderValue = HeaderValue::from_static("text/event-stream");
const X_ACCEL_BUFFERING: &str = "x-accel-buffering";

/// Identifies the user behind a request.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, request: &ClientRequest) -> Option<User>;
}

/// Treats every request as anonymous.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAuthentication;

#[async_trait]
impl Authenticator for NoAuthentication {
    async fn authenticate(&self, _request: &ClientRequest) -> Option<User> {
        None
    }
}

/// An inbound HTTP request, split into what the handlers need.
#[derive(Debug)]
pub struct OperationRequest {
    pub client_request: ClientRequest,
    pub body: Bytes,
}

/// Body of an ad-hoc GraphQL request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQLRequest {
    query: String,
    #[serde(default)]
    operation_name: Option<String>,
    #[serde(default)]
    variables: Option<Box<RawValue>>,
}

/// Executes requests, shared by every route of the gateway.
pub struct OperationService<P, R>
where
    P: QueryPlanner,
    R: Resolver<Plan = P::Plan>,
{
    planner: CachingQueryPlanner<P>,
    resolver: Arc<R>,
    hook_client: Option<Arc<dyn HookCaller>>,
    authenticator: Arc<dyn Authenticator>,
    ping_interval: Option<Duration>,
}

impl<P, R> Clone for OperationService<P, R>
where
    P: QueryPlanner,
    R: Resolver<Plan = P::Plan>,
{
    fn clone(&self) -> Self {
        Self {
            planner: self.planner.clone(),
            resolver: self.resolver.clone(),
            hook_client: self.hook_client.clone(),
            authenticator: self.authenticator.clone(),
            ping_interval: self.ping_interval,
        }
    }
}

impl<P, R> OperationService<P, R>
where
    P: QueryPlanner,
    R: Resolver<Plan = P::Plan>,
{
    pub fn new(
        planner: CachingQueryPlanner<P>,
        resolver: Arc<R>,
        hook_client: Option<Arc<dyn HookCaller>>,
        authenticator: Arc<dyn Authenticator>,
        ping_interval: Option<Duration>,
    ) -> Self {
        Self {
            planner,
            resolver,
            hook_client,
            authenticator,
            ping_interval,
        }
    }

    /// Serves a request to a registered operation.
    pub async fn call(
        &self,
        registered: Arc<RegisteredOperation>,
        request: OperationRequest,
    ) -> Response {
        let operation = registered.operation().clone();
        let span = tracing::info_span!(
            "operation",
            "operation.name" = %operation.name,
            "operation.kind" = %operation.kind,
        );
        self.call_operation(registered, request)
            .instrument(span)
            .await
    }

    async fn call_operation(
        &self,
        registered: Arc<RegisteredOperation>,
        request: OperationRequest,
    ) -> Response {
        let operation = registered.operation().clone();
        let expected_method = match operation.kind {
            OperationKind::Mutation => Method::POST,
            OperationKind::Query | OperationKind::Subscription => Method::GET,
        };
        if request.client_request.method != expected_method {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        let user = self
            .authenticator
            .authenticate(&request.client_request)
            .await;
        if operation.authorization_required && user.is_none() {
            return text_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }

        let query = request.client_request.uri.query();
        let params = RequestParams::from_query(query);
        let variables = if request.client_request.method == Method::GET {
            parse_query_variables(query, &registered.query_params_allow_list)
        } else if is_form_urlencoded(&request.client_request) {
            parse_form_variables(&request.body)
        } else if request.body.trim_ascii().is_empty() {
            Bytes::from_static(EMPTY_OBJECT)
        } else {
            request.body
        };

        if let Err(error) = registered.validate_variables(&variables) {
            tracing::debug!(%error, "invalid variables");
            return validation_error_response(&error);
        }
        let variables = match compact(&variables) {
            Ok(variables) => variables,
            Err(error) => {
                tracing::debug!(%error, "could not compact variables");
                return text_response(StatusCode::BAD_REQUEST, "invalid variables");
            }
        };

        let prepared = match self
            .planner
            .plan(&operation.content, Some(&operation.name))
            .await
        {
            Ok(prepared) => prepared,
            Err(error) => {
                tracing::error!("could not prepare operation: {error}");
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("could not prepare operation: {error}"),
                );
            }
        };
        let variables = match with_extracted_variables(&prepared, variables) {
            Ok(variables) => variables,
            Err(error) => {
                tracing::error!("could not merge extracted variables: {error}");
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("postProcessVariables failed: {error}"),
                );
            }
        };

        let ctx = ResolveContext::new(
            variables,
            CancellationToken::new(),
            request.client_request,
        )
        .with_user(user);
        let pipeline = Arc::new(HookPipeline::new(
            self.hook_client.clone(),
            operation.clone(),
            registered.transformer.clone(),
        ));
        match ExecutionMode::classify(&operation, &params) {
            ExecutionMode::OneShot => self.one_shot(&pipeline, ctx, &prepared).await,
            mode => self.stream(mode, &params, pipeline, ctx, prepared),
        }
    }

    /// Serves an ad-hoc GraphQL request.
    ///
    /// Queries and mutations are resolved once, subscriptions are streamed. No hooks run.
    pub async fn call_graphql(&self, request: OperationRequest) -> Response {
        let graphql_request: GraphQLRequest = match serde_json::from_slice(&request.body) {
            Ok(graphql_request) => graphql_request,
            Err(error) => {
                return graphql_error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid request: {error}"),
                );
            }
        };
        let span = tracing::info_span!(
            "graphql",
            "operation.name" = graphql_request.operation_name.as_deref().unwrap_or_default(),
        );
        self.call_ad_hoc(graphql_request, request.client_request)
            .instrument(span)
            .await
    }

    async fn call_ad_hoc(
        &self,
        graphql_request: GraphQLRequest,
        client_request: ClientRequest,
    ) -> Response {
        // `operationName: null` and `""` both mean the document's only operation
        let operation_name = graphql_request
            .operation_name
            .filter(|name| !name.is_empty());
        let prepared = match self
            .planner
            .plan(&graphql_request.query, operation_name.as_deref())
            .await
        {
            Ok(prepared) => prepared,
            Err(error) => {
                tracing::debug!(%error, "could not prepare ad-hoc operation");
                return graphql_error_response(StatusCode::BAD_REQUEST, &error.to_string());
            }
        };

        let variables = match graphql_request.variables.as_deref().map(RawValue::get) {
            Some(raw) if !is_literal_null(raw.as_bytes()) => compact(raw.as_bytes()),
            _ => Ok(Bytes::from_static(EMPTY_OBJECT)),
        }
        .and_then(|variables| with_extracted_variables(&prepared, variables));
        let variables = match variables {
            Ok(variables) => variables,
            Err(error) => {
                return graphql_error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid variables: {error}"),
                );
            }
        };

        let user = self.authenticator.authenticate(&client_request).await;
        let params = RequestParams::from_query(client_request.uri.query());
        let ctx = ResolveContext::new(variables, CancellationToken::new(), client_request)
            .with_user(user);
        let operation = Operation::builder()
            .name(operation_name.unwrap_or_default())
            .kind(prepared.kind)
            .content(graphql_request.query)
            .build();
        let pipeline = Arc::new(HookPipeline::new(None, Arc::new(operation), None));
        if prepared.kind == OperationKind::Subscription {
            self.stream(ExecutionMode::Subscription, &params, pipeline, ctx, prepared)
        } else {
            self.one_shot(&pipeline, ctx, &prepared).await
        }
    }

    async fn one_shot(
        &self,
        pipeline: &HookPipeline,
        mut ctx: ResolveContext,
        prepared: &PreparedPlan<P::Plan>,
    ) -> Response {
        // in-flight hook calls stop when the client goes away and this future is dropped
        let _cancel_on_drop = ctx.cancel.clone().drop_guard();
        let responder = RecordingResponder::default();
        match pipeline
            .run(&mut ctx, &responder, &*self.resolver, &prepared.plan)
            .await
        {
            Ok(response) if response.done => match responder.take() {
                Some((status, message)) => text_response(status, &message),
                None => text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
            },
            Ok(response) => json_response(StatusCode::OK, response.data),
            Err(error) => pipeline_error_response(pipeline.operation(), &error),
        }
    }

    fn stream(
        &self,
        mode: ExecutionMode,
        params: &RequestParams,
        pipeline: Arc<HookPipeline>,
        ctx: ResolveContext,
        prepared: Arc<PreparedPlan<P::Plan>>,
    ) -> Response {
        let (sink, body) = ChannelSink::channel();
        let client_gone = sink.closed();
        let cancel = ctx.cancel.clone();
        // live query results were already transformed by the pipeline
        let transformer = match mode {
            ExecutionMode::Subscription => pipeline.transformer().cloned(),
            _ => None,
        };
        let writer = match FlushWriter::new(
            sink,
            FlushWriterOptions::new(params, self.ping_interval),
            transformer,
            &cancel,
        ) {
            Ok(writer) => writer,
            Err(error) => {
                tracing::debug!(%error, "cannot stream the response");
                return text_response(StatusCode::BAD_REQUEST, "Connection not flushable");
            }
        };

        let resolver = self.resolver.clone();
        let run = async move {
            let mut ctx = ctx;
            match mode {
                ExecutionMode::Live { polling_interval } => {
                    LiveQuery::new(&pipeline, &*resolver, &prepared.plan, polling_interval)
                        .run(&mut ctx, &writer)
                        .await
                }
                ExecutionMode::Subscription => {
                    run_subscription(pipeline, &*resolver, &prepared.plan, ctx, writer.clone())
                        .await
                }
                ExecutionMode::OneShot => {}
            }
            writer.close().await;
        };
        tokio::spawn(
            async move {
                let _cancel_on_drop = cancel.clone().drop_guard();
                tokio::select! {
                    _ = client_gone => {
                        tracing::debug!("client disconnected");
                        cancel.cancel();
                    }
                    _ = run => {}
                }
            }
            .in_current_span(),
        );

        streaming_response(params, body)
    }
}

/// Streams the events of an upstream subscription, running the pre-resolve hooks once and
/// the post-resolve hooks on every event.
async fn run_subscription<R: Resolver>(
    pipeline: Arc<HookPipeline>,
    resolver: &R,
    plan: &R::Plan,
    mut ctx: ResolveContext,
    writer: FlushWriter<ChannelSink>,
) {
    let cancel = ctx.cancel.clone();
    let pre = match pipeline.pre_resolve(&mut ctx, &writer).await {
        Ok(pre) if pre.done => return,
        Ok(pre) => pre,
        Err(error) if error.is_cancelled() => return,
        Err(error) => {
            let error = PipelineError::PreResolve(error);
            tracing::error!("subscription failed: {error}");
            writer.write_error(&error.to_string()).await;
            return;
        }
    };
    if pre.resolved {
        match writer.write(pre.data).await {
            Ok(()) | Err(StreamError::ConnectionClosed) => {}
            Err(error) => {
                tracing::error!("could not write the resolved subscription response: {error}");
                writer.write_error(&error.to_string()).await;
            }
        }
        return;
    }
    ctx.variables = pre.data;

    let mut events = match resolver.subscribe(&ctx, plan).await {
        Ok(events) => events,
        Err(ResolveError::Cancelled) => return,
        Err(error) => {
            let error = PipelineError::Resolve(error);
            tracing::error!("subscription failed: {error}");
            writer.write_error(&error.to_string()).await;
            return;
        }
    };
    let writer = writer.with_post_resolve_hooks(pipeline, ctx);

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = events.next() => event,
        };
        match event {
            None => return,
            Some(Ok(payload)) => {
                match writer.write(payload).await {
                    Ok(()) => {}
                    Err(StreamError::ConnectionClosed) => {
                        tracing::debug!("connection closed, stopping subscription");
                        return;
                    }
                    Err(error) => {
                        tracing::error!("could not write subscription event: {error}");
                        writer.write_error(&error.to_string()).await;
                        return;
                    }
                }
                if writer.is_closed().await {
                    return;
                }
            }
            Some(Err(ResolveError::Cancelled)) => return,
            Some(Err(error)) => {
                let error = PipelineError::Resolve(error);
                tracing::error!("subscription failed: {error}");
                writer.write_error(&error.to_string()).await;
                return;
            }
        }
    }
}

fn is_form_urlencoded(request: &ClientRequest) -> bool {
    request
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<mime::Mime>().ok())
        .is_some_and(|content_type| {
            content_type.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str()
        })
}

fn with_extracted_variables<T>(
    prepared: &PreparedPlan<T>,
    variables: Bytes,
) -> Result<Bytes, serde_json::Error> {
    if has_variables(&prepared.extracted_variables) {
        merge_right_into_left(&prepared.extracted_variables, &variables)
    } else {
        Ok(variables)
    }
}

fn pipeline_error_response(operation: &Operation, error: &PipelineError) -> Response {
    if error.is_cancelled() {
        tracing::debug!("client closed the connection");
        let status = StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST)
            .unwrap_or(StatusCode::BAD_REQUEST);
        return empty_response(status);
    }
    if error.is_timeout() {
        tracing::error!(
            "operation.name" = %operation.name,
            "operation.kind" = %operation.kind,
            "request timeout exceeded"
        );
        return empty_response(StatusCode::GATEWAY_TIMEOUT);
    }
    tracing::error!(
        "operation.name" = %operation.name,
        "operation.kind" = %operation.kind,
        "hooks pipeline failed: {error}"
    );
    text_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &format!("hooks pipeline failed: {error}"),
    )
}

fn empty_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn text_response(status: StatusCode, message: &str) -> Response {
    let mut response = Response::new(Body::from(format!("{message}\n")));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response(status: StatusCode, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, APPLICATION_JSON);
    response
}

fn graphql_error_response(status: StatusCode, message: &str) -> Response {
    json_response(status, graphql::Response::from_message(message).to_bytes())
}

fn validation_error_response(error: &VariablesValidationError) -> Response {
    match serde_json::to_vec(error) {
        Ok(body) => json_response(StatusCode::BAD_REQUEST, Bytes::from(body)),
        Err(encode_error) => {
            tracing::error!("error encoding validation error: {encode_error}");
            empty_response(StatusCode::BAD_REQUEST)
        }
    }
}

fn streaming_response(params: &RequestParams, body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    if params.subscribe_once {
        headers.insert(header::CONTENT_TYPE, APPLICATION_JSON);
    } else {
        headers.insert(header::CONTENT_TYPE, TEXT_EVENT_STREAM);
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    }
    response
}
