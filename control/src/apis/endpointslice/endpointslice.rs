//! EndpointSlice convergence
//!
//! Builds the slices a Service should have from its desired endpoint set and
//! compares them with the slices that exist. The comparison is semantic, so a
//! converged Service plans no writes at all.

use k8s_openapi::api::core::v1::{ObjectReference, Service};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tracing::warn;

pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
pub const MANAGED_BY_LABEL: &str = "endpointslice.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "sidelink.io/endpointslice-controller";

/// Label selector matching every slice this controller manages
pub fn managed_selector() -> String {
    format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY)
}

/// One reachable address of a Service
///
/// Ordered by address first, so a set of endpoints iterates in address order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DesiredEndpoint {
    pub address: IpAddr,
    pub pod_name: String,
    pub pod_uid: Option<String>,
    pub node_name: Option<String>,
}

/// Addresses a Service should expose, recomputed on every reconcile
pub type DesiredEndpointSet = BTreeSet<DesiredEndpoint>;

/// Writes needed to converge a Service's slices
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SlicePlan {
    pub apply: Vec<EndpointSlice>,
    pub delete: Vec<String>,
}

impl SlicePlan {
    pub fn is_empty(&self) -> bool {
        self.apply.is_empty() && self.delete.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "IPv4" => Some(Family::V4),
            "IPv6" => Some(Family::V6),
            _ => None,
        }
    }

    fn address_type(self) -> &'static str {
        match self {
            Family::V4 => "IPv4",
            Family::V6 => "IPv6",
        }
    }
}

/// Name of the managed slice of `service` for one address family
pub fn slice_name(service: &str, address_type: &str) -> String {
    format!("{}-{}", service, address_type.to_ascii_lowercase())
}

fn service_families(service: &Service, endpoints: &DesiredEndpointSet) -> BTreeSet<Family> {
    let mut families: BTreeSet<Family> = service
        .spec
        .as_ref()
        .and_then(|s| s.ip_families.as_ref())
        .map(|f| f.iter().filter_map(|s| Family::parse(s)).collect())
        .unwrap_or_default();
    if families.is_empty() {
        families.insert(Family::V4);
    }
    families.extend(endpoints.iter().map(|e| Family::of(&e.address)));
    families
}

/// Slice ports from the Service ports
///
/// A numeric target port is used as is; a missing or named one falls back to
/// the Service port.
fn slice_ports(service: &Service) -> Vec<EndpointPort> {
    let name = service.name_any();
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| {
                    let port = match &p.target_port {
                        Some(IntOrString::Int(target)) => *target,
                        Some(IntOrString::String(named)) => {
                            warn!(
                                "Service {} uses named target port '{}', not supported; using port {}",
                                name, named, p.port
                            );
                            p.port
                        }
                        None => p.port,
                    };
                    EndpointPort {
                        name: p.name.clone(),
                        port: Some(port),
                        protocol: Some(p.protocol.clone().unwrap_or_else(|| "TCP".to_string())),
                        app_protocol: p.app_protocol.clone(),
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

fn endpoint(namespace: &str, desired: &DesiredEndpoint) -> Endpoint {
    Endpoint {
        addresses: vec![desired.address.to_string()],
        conditions: Some(EndpointConditions {
            ready: Some(true),
            serving: Some(true),
            terminating: Some(false),
        }),
        node_name: desired.node_name.clone(),
        target_ref: Some(ObjectReference {
            kind: Some("Pod".to_string()),
            name: Some(desired.pod_name.clone()),
            namespace: Some(namespace.to_string()),
            uid: desired.pod_uid.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Slices `service` should have for `endpoints`, one per address family
pub fn desired_slices(service: &Service, endpoints: &DesiredEndpointSet) -> Vec<EndpointSlice> {
    let service_name = service.name_any();
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let ports = slice_ports(service);

    service_families(service, endpoints)
        .into_iter()
        .map(|family| EndpointSlice {
            metadata: ObjectMeta {
                name: Some(slice_name(&service_name, family.address_type())),
                namespace: Some(namespace.clone()),
                labels: Some(BTreeMap::from([
                    (SERVICE_NAME_LABEL.to_string(), service_name.clone()),
                    (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
                ])),
                owner_references: service.controller_owner_ref(&()).map(|o| vec![o]),
                ..Default::default()
            },
            address_type: family.address_type().to_string(),
            endpoints: endpoints
                .iter()
                .filter(|e| Family::of(&e.address) == family)
                .map(|e| endpoint(&namespace, e))
                .collect(),
            ports: Some(ports.clone()),
        })
        .collect()
}

type EndpointView = (
    Vec<String>,
    Option<bool>,
    Option<bool>,
    Option<bool>,
    Option<String>,
    Option<(Option<String>, Option<String>, Option<String>)>,
);

type PortView = (Option<String>, Option<i32>, String);

fn endpoint_views(slice: &EndpointSlice) -> Vec<EndpointView> {
    let mut views: Vec<EndpointView> = slice
        .endpoints
        .iter()
        .map(|e| {
            let conditions = e.conditions.clone().unwrap_or_default();
            (
                e.addresses.clone(),
                conditions.ready,
                conditions.serving,
                conditions.terminating,
                e.node_name.clone(),
                e.target_ref
                    .as_ref()
                    .map(|r| (r.kind.clone(), r.name.clone(), r.uid.clone())),
            )
        })
        .collect();
    views.sort();
    views
}

fn port_views(slice: &EndpointSlice) -> Vec<PortView> {
    let mut views: Vec<PortView> = slice
        .ports
        .iter()
        .flatten()
        .map(|p| {
            (
                p.name.clone(),
                p.port,
                p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            )
        })
        .collect();
    views.sort();
    views
}

/// Whether `existing` already carries everything `desired` sets
fn slice_converged(desired: &EndpointSlice, existing: &EndpointSlice) -> bool {
    let labels_present = desired
        .labels()
        .iter()
        .all(|(k, v)| existing.labels().get(k) == Some(v));
    let owners_present = desired
        .owner_references()
        .iter()
        .all(|o| existing.owner_references().iter().any(|e| e.uid == o.uid));

    labels_present
        && owners_present
        && desired.address_type == existing.address_type
        && endpoint_views(desired) == endpoint_views(existing)
        && port_views(desired) == port_views(existing)
}

/// Plan the writes that take `existing` to the slices `endpoints` needs
pub fn plan_slices(
    service: &Service,
    endpoints: &DesiredEndpointSet,
    existing: &[EndpointSlice],
) -> SlicePlan {
    let desired = desired_slices(service, endpoints);
    let current: BTreeMap<String, &EndpointSlice> =
        existing.iter().map(|s| (s.name_any(), s)).collect();

    let apply = desired
        .iter()
        .filter(|d| {
            current
                .get(&d.name_any())
                .map_or(true, |e| !slice_converged(d, e))
        })
        .cloned()
        .collect();

    let wanted: BTreeSet<String> = desired.iter().map(|d| d.name_any()).collect();
    let delete = current
        .keys()
        .filter(|name| !wanted.contains(*name))
        .cloned()
        .collect();

    SlicePlan { apply, delete }
}

/// Ready endpoints in a set of slices, by owning Service name
pub fn ready_services(slices: &[EndpointSlice]) -> BTreeSet<String> {
    slices
        .iter()
        .filter(|s| {
            s.endpoints.iter().any(|e| {
                e.conditions
                    .as_ref()
                    .and_then(|c| c.ready)
                    .unwrap_or(false)
            })
        })
        .filter_map(|s| s.labels().get(SERVICE_NAME_LABEL).cloned())
        .collect()
}
