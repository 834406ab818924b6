//! sidelink control plane
//!
//! Exposes secondary pod networks to external BGP routers:
//! - `network`: attachment discovery and the shared table id pool
//! - `apis`: pod, Service/EndpointSlice and Gateway reconcilers
//! - `routing`: routing daemon control and supervision

pub mod apis;
pub mod config;
pub mod error;
pub mod network;
pub mod routing;
