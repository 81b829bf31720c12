//! HTTP front: routing, CORS, proxying and SSE rewriting

pub mod cors;
pub mod modifier;
pub mod proxy;
mod rejection;
pub mod route;
mod router;
mod server;
pub mod sse;

pub use rejection::Rejection;
pub use router::{AppState, MCP_PROTOCOL_VERSION, create_router};
pub use server::Gateway;
