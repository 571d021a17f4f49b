//! Control-plane HTTP transport (axum).

pub mod routes;
pub mod server;

pub use routes::{RouteError, routes};
pub use server::{ServeError, ServerConfig, ServerHandle, bind, start};
