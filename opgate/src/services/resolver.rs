//! The engine that executes prepared plans against upstream data sources.
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::context::ResolveContext;
use crate::error::ResolveError;

/// Stream of subscription events, each a complete GraphQL response.
pub type EventStream = BoxStream<'static, Result<Bytes, ResolveError>>;

/// Executes prepared plans.
///
/// Implementations must return promptly with [`ResolveError::Cancelled`] once
/// `ctx.cancel` is cancelled, and subscription streams must end then.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    type Plan: Send + Sync + 'static;

    /// Resolves `plan` once with the variables and headers of `ctx`.
    async fn resolve(&self, ctx: &ResolveContext, plan: &Self::Plan) -> Result<Bytes, ResolveError>;

    /// Opens the upstream subscription of `plan`.
    async fn subscribe(
        &self,
        ctx: &ResolveContext,
        plan: &Self::Plan,
    ) -> Result<EventStream, ResolveError>;
}

#[cfg(test)]
mockall::mock! {
    pub(crate) Engine {}

    #[async_trait]
    impl Resolver for Engine {
        type Plan = String;

        async fn resolve(&self, ctx: &ResolveContext, plan: &String) -> Result<Bytes, ResolveError>;

        async fn subscribe(
            &self,
            ctx: &ResolveContext,
            plan: &String,
        ) -> Result<EventStream, ResolveError>;
    }
}
