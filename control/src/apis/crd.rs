//! sidelink custom resources
//!
//! - `GatewayRouter`: one external BGP peer of a Gateway
//! - `L34Route`: VIP prefixes a Gateway advertises for a set of backend Services

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_hold_time() -> u16 {
    90
}

fn default_bgp_port() -> u16 {
    179
}

/// External router peering with a Gateway
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sidelink.io",
    version = "v1alpha1",
    kind = "GatewayRouter",
    plural = "gatewayrouters",
    shortname = "gwr",
    namespaced,
    printcolumn = r#"{"name":"Gateway","type":"string","jsonPath":".spec.gateway"}"#,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".spec.address"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRouterSpec {
    /// Gateway (same namespace) this router peers with
    pub gateway: String,
    /// Peer address
    pub address: String,
    /// Interface the peer is reached through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub bgp: BgpSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BgpSpec {
    #[serde(rename = "localASN")]
    pub local_asn: u32,
    #[serde(rename = "remoteASN")]
    pub remote_asn: u32,
    /// Hold time in seconds
    #[serde(default = "default_hold_time")]
    pub hold_time: u16,
    #[serde(default = "default_bgp_port")]
    pub local_port: u16,
    #[serde(default = "default_bgp_port")]
    pub remote_port: u16,
}

/// VIP prefixes routed to backend Services through parent Gateways
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sidelink.io",
    version = "v1alpha1",
    kind = "L34Route",
    plural = "l34routes",
    namespaced,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct L34RouteSpec {
    /// Gateways (same namespace) that advertise this route
    pub parent_refs: Vec<String>,
    /// Services (same namespace) backing the VIPs
    pub backend_refs: Vec<String>,
    #[serde(rename = "destinationCIDRs")]
    pub destination_cidrs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_gateway_router_defaults() {
        let spec: GatewayRouterSpec = serde_json::from_str(
            r#"{"gateway": "gw-a", "address": "169.254.100.150",
                "bgp": {"localASN": 8103, "remoteASN": 4248829953}}"#,
        )
        .expect("valid spec");

        assert_eq!(spec.bgp.hold_time, 90);
        assert_eq!(spec.bgp.local_port, 179);
        assert_eq!(spec.bgp.remote_port, 179);
        assert_eq!(spec.bgp.remote_asn, 4248829953);
        assert!(spec.interface.is_none());
    }

    #[test]
    fn test_l34route_field_names() {
        let spec: L34RouteSpec = serde_json::from_str(
            r#"{"parentRefs": ["gw-a"], "backendRefs": ["svc-a"],
                "destinationCIDRs": ["20.0.0.1/32"]}"#,
        )
        .expect("valid spec");
        assert_eq!(spec.destination_cidrs, vec!["20.0.0.1/32".to_string()]);
    }

    #[test]
    fn test_crd_metadata() {
        let crd = GatewayRouter::crd();
        assert_eq!(crd.spec.group, "sidelink.io");
        assert_eq!(crd.spec.names.kind, "GatewayRouter");
        assert_eq!(crd.spec.scope, "Namespaced");

        assert_eq!(L34Route::crd().spec.names.plural, "l34routes");
    }
}
