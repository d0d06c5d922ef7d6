//! Namespace proxy
//!
//! Sits between a client and the engine so several projects can share one
//! daemon. Object names are prefixed with the project, created objects are
//! labelled, and lists only show the project's objects.

pub mod rewrite;
pub mod routes;
pub mod scoper;
pub mod server;

pub use rewrite::{Lookup, ObjectKind, ProxyRequest, RewriteContext, Rewriter};
pub use routes::{Route, RouteRegistry};
pub use scoper::{LabelScoper, Scoper, PIPELINE_LABEL, PROJECT_LABEL};
pub use server::{ProxyListener, ProxyServer, UpstreamLookup};
