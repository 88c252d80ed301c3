//! Request handling: resolution seam, live queries, request execution and HTTP routes.
pub mod live;
pub mod operation;
pub mod resolver;
pub mod router;

pub use operation::Authenticator;
pub use operation::NoAuthentication;
pub use operation::OperationRequest;
pub use operation::OperationService;
pub use resolver::EventStream;
pub use resolver::Resolver;
