//! Gateway API integration
//!
//! - `gateway`: validation and status of Gateways of the handled class
//! - `router`: per-Gateway BGP peer and VIP state for the routing daemon

#[allow(clippy::module_inception)]
pub mod gateway;
pub mod router;
