//! Secondary network attachment discovery
//!
//! Resolves the addresses a pod holds on a secondary network. The default
//! implementation reads the annotations Multus maintains on every pod it
//! attaches:
//! - `k8s.v1.cni.cncf.io/networks`: attachments the pod requested
//! - `k8s.v1.cni.cncf.io/network-status`: attachments the CNI actually set up
//!
//! Nothing here is cached; every call re-reads the pod it is given.

use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Deserialize;
use std::net::IpAddr;

#[cfg(test)]
use mockall::automock;

/// Requested attachments (Multus)
pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

/// Attachments reported by the CNI (Multus)
pub const NETWORK_STATUS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/network-status";

/// Result of resolving one (pod, network) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentState {
    /// Attachment is up with at least one address
    Ready(Vec<IpAddr>),
    /// Requested but not (fully) reported yet
    NotReady,
    /// The pod neither requests nor reports this network
    Absent,
}

/// GetIPs collaborator
///
/// Must be idempotent and cheap enough to call on every reconcile.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AttachmentSource: Send + Sync {
    /// Resolve the addresses of `pod` on `network` (`namespace/name`)
    async fn get_ips(&self, pod: &Pod, network: &str) -> Result<AttachmentState>;
}

/// Multus annotation reader
#[derive(Debug, Clone, Default)]
pub struct MultusAttachments;

#[async_trait]
impl AttachmentSource for MultusAttachments {
    async fn get_ips(&self, pod: &Pod, network: &str) -> Result<AttachmentState> {
        resolve(pod, network)
    }
}

#[derive(Debug, Deserialize)]
struct NetworkSelection {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NetworkStatus {
    name: String,
    #[serde(default)]
    ips: Vec<String>,
    #[serde(default)]
    default: bool,
}

/// Qualify a network name with `namespace` unless it already carries one
pub fn qualify(namespace: &str, network: &str) -> String {
    if network.contains('/') {
        network.to_string()
    } else {
        format!("{}/{}", namespace, network)
    }
}

/// Resolve `network` on `pod` from its Multus annotations
pub fn resolve(pod: &Pod, network: &str) -> Result<AttachmentState> {
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let object = format!("pod/{}/{}", namespace, pod.name_any());
    let annotations = pod.annotations();

    let reported = match annotations.get(NETWORK_STATUS_ANNOTATION) {
        Some(raw) => parse_status(raw, &object)?,
        None => Vec::new(),
    };

    let status = reported
        .iter()
        .filter(|s| !s.default)
        .find(|s| qualify(&namespace, &s.name) == network);

    if let Some(status) = status {
        if status.ips.is_empty() {
            return Ok(AttachmentState::NotReady);
        }
        let ips = status
            .ips
            .iter()
            .map(|ip| {
                ip.parse::<IpAddr>().map_err(|_| Error::InvalidAnnotation {
                    object: object.clone(),
                    key: NETWORK_STATUS_ANNOTATION.to_string(),
                    reason: format!("'{}' is not an IP address", ip),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(AttachmentState::Ready(ips));
    }

    let requested = match annotations.get(NETWORKS_ANNOTATION) {
        Some(raw) => parse_requested(raw, &namespace, &object)?,
        None => Vec::new(),
    };

    if requested.iter().any(|r| r == network) {
        Ok(AttachmentState::NotReady)
    } else {
        Ok(AttachmentState::Absent)
    }
}

fn parse_status(raw: &str, object: &str) -> Result<Vec<NetworkStatus>> {
    serde_json::from_str(raw).map_err(|e| Error::InvalidAnnotation {
        object: object.to_string(),
        key: NETWORK_STATUS_ANNOTATION.to_string(),
        reason: e.to_string(),
    })
}

/// Parse the requested networks as qualified names.
///
/// Accepts the JSON list form and the short `[ns/]name[@iface]` comma list.
fn parse_requested(raw: &str, namespace: &str, object: &str) -> Result<Vec<String>> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        let selections: Vec<NetworkSelection> =
            serde_json::from_str(trimmed).map_err(|e| Error::InvalidAnnotation {
                object: object.to_string(),
                key: NETWORKS_ANNOTATION.to_string(),
                reason: e.to_string(),
            })?;
        return Ok(selections
            .into_iter()
            .map(|s| match s.namespace {
                Some(ns) => format!("{}/{}", ns, s.name),
                None => qualify(namespace, &s.name),
            })
            .collect());
    }

    Ok(trimmed
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let name = item.split_once('@').map_or(item, |(name, _)| name);
            qualify(namespace, name)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod_with(annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("worker-0".to_string()),
                namespace: Some("red".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    const STATUS: &str = r#"[
        {"name": "cbr0", "ips": ["10.244.1.7"], "default": true},
        {"name": "red/macvlan-a", "interface": "net1", "ips": ["169.254.100.3", "fd00::3"]}
    ]"#;

    #[test]
    fn test_ready_attachment_returns_secondary_ips() {
        let pod = pod_with(&[
            (NETWORKS_ANNOTATION, "macvlan-a@net1"),
            (NETWORK_STATUS_ANNOTATION, STATUS),
        ]);

        let state = resolve(&pod, "red/macvlan-a").expect("valid annotations");
        assert_eq!(
            state,
            AttachmentState::Ready(vec![
                "169.254.100.3".parse().expect("ip"),
                "fd00::3".parse().expect("ip"),
            ])
        );
    }

    #[test]
    fn test_default_network_is_never_an_attachment() {
        let pod = pod_with(&[(NETWORK_STATUS_ANNOTATION, STATUS)]);
        assert_eq!(
            resolve(&pod, "red/cbr0").expect("valid"),
            AttachmentState::Absent
        );
    }

    #[test]
    fn test_requested_without_status_is_not_ready() {
        let pod = pod_with(&[(NETWORKS_ANNOTATION, "blue/macvlan-b, macvlan-a")]);

        assert_eq!(
            resolve(&pod, "blue/macvlan-b").expect("valid"),
            AttachmentState::NotReady
        );
        assert_eq!(
            resolve(&pod, "red/macvlan-a").expect("valid"),
            AttachmentState::NotReady
        );
    }

    #[test]
    fn test_json_request_form() {
        let pod = pod_with(&[(
            NETWORKS_ANNOTATION,
            r#"[{"name": "macvlan-a", "namespace": "blue", "interface": "net1"}]"#,
        )]);
        assert_eq!(
            resolve(&pod, "blue/macvlan-a").expect("valid"),
            AttachmentState::NotReady
        );
        assert_eq!(
            resolve(&pod, "red/macvlan-a").expect("valid"),
            AttachmentState::Absent
        );
    }

    #[test]
    fn test_status_without_ips_is_not_ready() {
        let pod = pod_with(&[(
            NETWORK_STATUS_ANNOTATION,
            r#"[{"name": "red/macvlan-a", "interface": "net1"}]"#,
        )]);
        assert_eq!(
            resolve(&pod, "red/macvlan-a").expect("valid"),
            AttachmentState::NotReady
        );
    }

    #[test]
    fn test_unrequested_network_is_absent() {
        let pod = pod_with(&[]);
        assert_eq!(
            resolve(&pod, "red/macvlan-a").expect("valid"),
            AttachmentState::Absent
        );
    }

    #[test]
    fn test_malformed_status_is_an_error() {
        let pod = pod_with(&[(NETWORK_STATUS_ANNOTATION, "{not json")]);
        let err = resolve(&pod, "red/macvlan-a").expect_err("malformed");
        assert!(matches!(err, Error::InvalidAnnotation { .. }));
    }

    #[test]
    fn test_bad_ip_in_status_is_an_error() {
        let pod = pod_with(&[(
            NETWORK_STATUS_ANNOTATION,
            r#"[{"name": "red/macvlan-a", "ips": ["not-an-ip"]}]"#,
        )]);
        assert!(resolve(&pod, "red/macvlan-a").is_err());
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify("red", "macvlan-a"), "red/macvlan-a");
        assert_eq!(qualify("red", "blue/macvlan-a"), "blue/macvlan-a");
    }

    #[tokio::test]
    async fn test_multus_source_delegates_to_resolve() {
        let pod = pod_with(&[(NETWORK_STATUS_ANNOTATION, STATUS)]);
        let state = MultusAttachments
            .get_ips(&pod, "red/macvlan-a")
            .await
            .expect("valid");
        assert!(matches!(state, AttachmentState::Ready(ips) if ips.len() == 2));
    }
}
