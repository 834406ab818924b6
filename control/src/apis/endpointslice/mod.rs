//! EndpointSlice synchronization for secondary networks
//!
//! - `service`: Service reconciler computing the desired endpoint set
//! - `endpointslice`: slice content and convergence planning
//! - `slice_gc`: cleanup after deleted Services

#[allow(clippy::module_inception)]
pub mod endpointslice;
pub mod service;
pub mod slice_gc;
