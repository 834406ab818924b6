//! Helpers over core Kubernetes objects shared by the controllers

use crate::error::{Error, Result};
use crate::network::attachment::qualify;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};

/// Label binding a Service to the class handled by this instance
pub const SERVICE_PROXY_NAME_LABEL: &str = "service.kubernetes.io/service-proxy-name";

/// Service annotation listing the secondary networks backing it
pub const SERVICE_NETWORKS_ANNOTATION: &str = "sidelink.io/networks";

/// `namespace/name` of an object
pub fn object_key<K: ResourceExt>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_else(|| "default".to_string()),
        obj.name_any()
    )
}

/// Whether `service` references `class_name`
pub fn service_handled(service: &Service, class_name: &str) -> bool {
    service
        .labels()
        .get(SERVICE_PROXY_NAME_LABEL)
        .is_some_and(|v| v == class_name)
}

/// Qualified, sorted network names a Service is endpointed on
pub fn service_networks(service: &Service) -> Result<BTreeSet<String>> {
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let Some(raw) = service.annotations().get(SERVICE_NETWORKS_ANNOTATION) else {
        return Ok(BTreeSet::new());
    };

    let names: Vec<String> = serde_json::from_str(raw).map_err(|e| Error::InvalidAnnotation {
        object: format!("service/{}", object_key(service)),
        key: SERVICE_NETWORKS_ANNOTATION.to_string(),
        reason: e.to_string(),
    })?;

    Ok(names
        .iter()
        .filter(|n| !n.is_empty())
        .map(|n| qualify(&namespace, n))
        .collect())
}

/// Label selector match; an absent or empty selector selects nothing
pub fn selector_matches(
    selector: Option<&BTreeMap<String, String>>,
    labels: &BTreeMap<String, String>,
) -> bool {
    match selector {
        Some(selector) if !selector.is_empty() => selector
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|l| l == v)),
        _ => false,
    }
}

/// Whether `service` selects `pod`
pub fn service_selects(service: &Service, pod: &Pod) -> bool {
    service.namespace() == pod.namespace()
        && selector_matches(
            service.spec.as_ref().and_then(|s| s.selector.as_ref()),
            pod.labels(),
        )
}

pub fn pod_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Ready condition is True and the pod is not terminating
pub fn pod_ready(pod: &Pod) -> bool {
    if pod_terminating(pod) {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Networks `pod` needs table ids for: the union over the handled Services
/// selecting it
pub fn required_networks(pod: &Pod, services: &[Service], class_name: &str) -> Result<BTreeSet<String>> {
    let mut networks = BTreeSet::new();
    for service in services
        .iter()
        .filter(|s| service_handled(s, class_name) && service_selects(s, pod))
    {
        networks.extend(service_networks(service)?);
    }
    Ok(networks)
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Object builders shared by controller tests

    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus, ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn service(name: &str, class: &str, networks: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("red".to_string()),
                uid: Some(format!("uid-{}", name)),
                labels: Some(labels(&[(SERVICE_PROXY_NAME_LABEL, class)])),
                annotations: Some(labels(&[(SERVICE_NETWORKS_ANNOTATION, networks)])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(labels(&[("app", name)])),
                ports: Some(vec![ServicePort {
                    name: Some("tcp".to_string()),
                    port: 4000,
                    protocol: Some("TCP".to_string()),
                    target_port: Some(IntOrString::Int(5000)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    pub fn pod(name: &str, app: &str, ready: bool, annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("red".to_string()),
                uid: Some(format!("uid-{}", name)),
                resource_version: Some("1".to_string()),
                labels: Some(labels(&[("app", app)])),
                annotations: Some(labels(annotations)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("worker-1".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[test]
    fn test_service_handled_by_label() {
        let svc = service("svc-a", "sidelink", r#"["macvlan-a"]"#);
        assert!(service_handled(&svc, "sidelink"));
        assert!(!service_handled(&svc, "other"));
    }

    #[test]
    fn test_service_networks_are_qualified() {
        let svc = service("svc-a", "sidelink", r#"["macvlan-a", "blue/macvlan-b", "macvlan-a"]"#);
        let networks = service_networks(&svc).expect("valid annotation");
        assert_eq!(
            networks.into_iter().collect::<Vec<_>>(),
            vec!["blue/macvlan-b".to_string(), "red/macvlan-a".to_string()]
        );
    }

    #[test]
    fn test_service_networks_rejects_garbage() {
        let svc = service("svc-a", "sidelink", "macvlan-a");
        assert!(matches!(
            service_networks(&svc),
            Err(Error::InvalidAnnotation { .. })
        ));
    }

    #[test]
    fn test_empty_selector_selects_nothing() {
        let pod_labels = labels(&[("app", "a")]);
        assert!(!selector_matches(None, &pod_labels));
        assert!(!selector_matches(Some(&BTreeMap::new()), &pod_labels));
        assert!(selector_matches(Some(&labels(&[("app", "a")])), &pod_labels));
        assert!(!selector_matches(
            Some(&labels(&[("app", "a"), ("tier", "x")])),
            &pod_labels
        ));
    }

    #[test]
    fn test_terminating_pod_is_not_ready() {
        let mut p = pod("p1", "svc-a", true, &[]);
        assert!(pod_ready(&p));

        p.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!pod_ready(&p));
    }

    #[test]
    fn test_required_networks_union() {
        let services = vec![
            service("svc-a", "sidelink", r#"["macvlan-a"]"#),
            service("svc-b", "sidelink", r#"["macvlan-b"]"#),
            service("svc-c", "other", r#"["macvlan-c"]"#),
        ];
        let mut p = pod("p1", "svc-a", true, &[]);
        p.metadata.labels = Some(labels(&[("app", "svc-a")]));

        let networks = required_networks(&p, &services, "sidelink").expect("valid");
        assert_eq!(networks.len(), 1);
        assert!(networks.contains("red/macvlan-a"));
    }
}
