//! HTTP routes of the gateway.
use std::sync::Arc;

use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use bytes::Bytes;
use http::HeaderMap;
use http::Method;
use http::StatusCode;
use http::Uri;

use super::operation::Authenticator;
use super::operation::NoAuthentication;
use super::operation::OperationRequest;
use super::operation::OperationService;
use super::resolver::Resolver;
use crate::configuration::Configuration;
use crate::configuration::ConfigurationError;
use crate::context::ClientRequest;
use crate::hooks::HookCaller;
use crate::hooks::HttpHookClient;
use crate::operation::OperationRegistry;
use crate::query_planner::CachingQueryPlanner;
use crate::query_planner::QueryPlanner;

struct GatewayState<P, R>
where
    P: QueryPlanner,
    R: Resolver<Plan = P::Plan>,
{
    registry: OperationRegistry,
    service: OperationService<P, R>,
}

/// Builds the [`Router`] serving `/operations/{name}` and `/graphql`.
pub struct GatewayRouterBuilder<P, R>
where
    P: QueryPlanner,
    R: Resolver<Plan = P::Plan>,
{
    configuration: Configuration,
    planner: Arc<P>,
    resolver: Arc<R>,
    authenticator: Arc<dyn Authenticator>,
    hook_client: Option<Arc<dyn HookCaller>>,
}

impl<P, R> GatewayRouterBuilder<P, R>
where
    P: QueryPlanner,
    R: Resolver<Plan = P::Plan>,
{
    pub fn new(configuration: Configuration, planner: Arc<P>, resolver: Arc<R>) -> Self {
        Self {
            configuration,
            planner,
            resolver,
            authenticator: Arc::new(NoAuthentication),
            hook_client: None,
        }
    }

    /// Identifies users, every request is anonymous otherwise.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Replaces the HTTP hook client built from the `hooks` configuration.
    pub fn hook_client(mut self, hook_client: Arc<dyn HookCaller>) -> Self {
        self.hook_client = Some(hook_client);
        self
    }

    pub fn build(self) -> Result<Router, ConfigurationError> {
        let Self {
            configuration,
            planner,
            resolver,
            authenticator,
            hook_client,
        } = self;
        configuration.validate()?;

        let hook_client = match hook_client {
            Some(hook_client) => Some(hook_client),
            None if configuration.hooks.url.as_deref().is_some_and(|url| !url.is_empty()) => {
                Some(Arc::new(HttpHookClient::new(&configuration.hooks)?) as Arc<dyn HookCaller>)
            }
            None => None,
        };
        let registry = OperationRegistry::new(configuration.operations)?;
        tracing::debug!(operations = registry.len(), "registered operations");

        let service = OperationService::new(
            CachingQueryPlanner::new(planner, &configuration.plan_cache),
            resolver,
            hook_client,
            authenticator,
            configuration.streaming.ping_interval(),
        );
        let state = Arc::new(GatewayState { registry, service });

        Ok(Router::new()
            .route(
                "/operations/{*name}",
                get(handle_operation::<P, R>).post(handle_operation::<P, R>),
            )
            .route("/graphql", post(handle_graphql::<P, R>))
            .with_state(state))
    }
}

async fn handle_operation<P, R>(
    State(state): State<Arc<GatewayState<P, R>>>,
    Path(name): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    P: QueryPlanner,
    R: Resolver<Plan = P::Plan>,
{
    let Some(registered) = state.registry.get(name.trim_matches('/')) else {
        tracing::debug!(operation.name = %name, "operation not found");
        return (StatusCode::NOT_FOUND, "operation not found\n").into_response();
    };
    let request = OperationRequest {
        client_request: ClientRequest::new(method, uri, headers),
        body,
    };
    state.service.call(registered, request).await
}

async fn handle_graphql<P, R>(
    State(state): State<Arc<GatewayState<P, R>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    P: QueryPlanner,
    R: Resolver<Plan = P::Plan>,
{
    let request = OperationRequest {
        client_request: ClientRequest::new(method, uri, headers),
        body,
    };
    state.service.call_graphql(request).await
}
