//! Gateway errors.
use std::sync::Arc;

use displaydoc::Display;
use http::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinError;

pub use crate::configuration::ConfigurationError;
use crate::hooks::MiddlewareHook;

/// Status code used when the client went away before we could answer.
pub(crate) const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// Errors raised while calling the external hook server.
///
/// Every variant carries the hook that was being called so that callers can
/// report which stage failed without re-annotating.
#[derive(Error, Display, Debug)]
#[non_exhaustive]
pub enum HookError {
    /// hook {hook} failed with error: {source}
    Transport {
        hook: MiddlewareHook,
        #[source]
        source: reqwest::Error,
    },

    /// hook {hook} timed out
    Timeout { hook: MiddlewareHook },

    /// hook {hook} failed with invalid status code: {status} ({body})
    Status {
        hook: MiddlewareHook,
        status: StatusCode,
        body: String,
    },

    /// hook {hook} failed with error: {message}
    Rejected {
        hook: MiddlewareHook,
        message: String,
    },

    /// hook {hook} response could not be decoded: {source}
    Decode {
        hook: MiddlewareHook,
        #[source]
        source: serde_json::Error,
    },

    /// hook {hook} could not be encoded: {source}
    Encode {
        hook: MiddlewareHook,
        #[source]
        source: serde_json::Error,
    },

    /// hook {hook} was cancelled
    Cancelled { hook: MiddlewareHook },
}

impl HookError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HookError::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            HookError::Timeout { .. } => true,
            HookError::Transport { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

/// Errors raised by the resolve engine.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResolveError {
    /// resolve was cancelled
    Cancelled,

    /// could not resolve response: {0}
    Execution(String),

    /// upstream timed out: {0}
    Timeout(String),
}

/// Errors raised by the post-resolve transformer.
#[derive(Error, Display, Debug)]
#[non_exhaustive]
pub enum TransformError {
    /// response is not valid JSON: {0}
    InvalidJson(#[from] serde_json::Error),

    /// applyGet: from and to must have the same length
    PathMismatch,

    /// applyGet: cannot set value at {0}
    InvalidTarget(String),
}

/// Errors raised by a run of the hook pipeline, annotated with the failing stage.
#[derive(Error, Display, Debug)]
#[non_exhaustive]
pub enum PipelineError {
    /// preResolve hooks failed: {0}
    PreResolve(#[source] HookError),

    /// ResolveGraphQLResponse failed: {0}
    Resolve(#[source] ResolveError),

    /// postResolveTransformer failed: {0}
    Transform(#[source] TransformError),

    /// postResolve hooks failed: {0}
    PostResolve(#[source] HookError),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            PipelineError::PreResolve(e) | PipelineError::PostResolve(e) => e.is_cancelled(),
            PipelineError::Resolve(e) => matches!(e, ResolveError::Cancelled),
            PipelineError::Transform(_) => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            PipelineError::PreResolve(e) | PipelineError::PostResolve(e) => e.is_timeout(),
            PipelineError::Resolve(e) => matches!(e, ResolveError::Timeout(_)),
            PipelineError::Transform(_) => false,
        }
    }
}

/// Errors raised while preparing an execution plan.
///
/// Cloneable because a single failure is handed to every waiter of the same key.
#[derive(Error, Display, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[non_exhaustive]
pub enum PlanError {
    /// operation parsing failed: {0}
    Parse(String),

    /// operation normalization failed: {0}
    Normalize(String),

    /// operation validation failed: {0}
    Validate(String),

    /// operation planning failed: {0}
    Plan(String),

    /// planning task failed: {0}
    JoinError(String),
}

impl From<JoinError> for PlanError {
    fn from(err: JoinError) -> Self {
        PlanError::JoinError(err.to_string())
    }
}

/// Error types for the prepared plan cache
#[derive(Error, Debug, Display, Clone)]
#[non_exhaustive]
pub enum CacheResolverError {
    /// value retrieval failed: {0}
    RetrievalError(Arc<PlanError>),

    /// the in-flight computation for this key was dropped before completing
    WaiterDropped,
}

impl From<PlanError> for CacheResolverError {
    fn from(err: PlanError) -> Self {
        CacheResolverError::RetrievalError(Arc::new(err))
    }
}

/// Errors raised by the streaming response writer.
#[derive(Error, Display, Debug)]
#[non_exhaustive]
pub enum StreamError {
    /// connection does not support flushing
    NotFlushable,

    /// client connection is closed
    ConnectionClosed,

    /// postResolveTransformer failed: {0}
    Transform(#[from] TransformError),
}
