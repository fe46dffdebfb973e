//! HTTP + SSE transport for the capability hub.

pub mod handlers;
pub mod http;
pub mod sse;

pub use http::{router, ApiError, AppState};
