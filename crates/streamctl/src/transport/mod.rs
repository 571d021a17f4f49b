//! Transport layer for the control plane.
//!
//! Workers and clients reach the registry over HTTP only; the UDP control
//! path lives in [`crate::bridge`].

pub mod http;

pub use http::{ServeError, ServerConfig, ServerHandle, start};
