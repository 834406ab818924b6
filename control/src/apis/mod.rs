//! Kubernetes API integrations
//!
//! Reconcilers and watchers for pods, Services, EndpointSlices, Gateways and
//! the sidelink custom resources.

pub mod backoff;
pub mod crd;
pub mod endpointslice;
pub mod gateway;
pub mod metrics;
pub mod objects;
pub mod pod;
