//! Serves registered GraphQL operations as HTTP endpoints, running each request through
//! an external hook pipeline and streaming live queries and subscriptions to the client.

#![warn(unreachable_pub)]

pub mod json_ext;

mod cache;
pub mod configuration;
mod context;
pub mod error;
pub mod graphql;
pub mod hooks;
pub mod operation;
pub mod protocols;
pub mod query_planner;
pub mod services;
pub mod transform;

pub use configuration::Configuration;
pub use context::ClientRequest;
pub use context::ResolveContext;
pub use context::User;
pub use operation::Operation;
pub use operation::OperationKind;
pub use services::router::GatewayRouterBuilder;
