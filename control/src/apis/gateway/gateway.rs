//! Gateway reconciler
//!
//! Validates Gateways of the handled class and reports the verdict through
//! the `Accepted` and `Programmed` conditions. Gateways of other classes are
//! left alone. A rejected Gateway gets its status written once and is not
//! retried until it changes.

use crate::apis::backoff::ErrorBackoff;
use crate::apis::metrics::record_reconciliation;
use crate::apis::objects::object_key;
use crate::config::TimeoutConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use gateway_api::apis::standard::gateways::Gateway;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

const FIELD_MANAGER: &str = "sidelink-gateway-controller";

const SUPPORTED_PROTOCOLS: &[&str] = &["TCP", "UDP", "SCTP"];

#[cfg_attr(test, automock)]
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Merge-patch `status` into the Gateway's status subresource
    async fn patch_gateway_status(&self, namespace: &str, name: &str, status: Value)
        -> Result<()>;
}

pub struct GatewayClientImpl {
    client: Client,
}

impl GatewayClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GatewayClient for GatewayClientImpl {
    async fn patch_gateway_status(
        &self,
        namespace: &str,
        name: &str,
        status: Value,
    ) -> Result<()> {
        let api: Api<Gateway> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        match api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct GatewayContext {
    pub client: Arc<dyn GatewayClient>,
    pub gateway_class_name: String,
    pub timeouts: TimeoutConfig,
    pub backoff: ErrorBackoff,
}

impl GatewayContext {
    pub fn new(
        client: Arc<dyn GatewayClient>,
        gateway_class_name: String,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            client,
            gateway_class_name,
            timeouts,
            backoff: ErrorBackoff::new(),
        }
    }
}

/// Check listener constraints; the error is a human readable reason
pub fn validate_listeners(gateway: &Gateway) -> std::result::Result<(), String> {
    let listeners = &gateway.spec.listeners;
    if listeners.is_empty() {
        return Err("Gateway has no listeners".to_string());
    }

    let mut names = HashSet::new();
    for listener in listeners {
        if !names.insert(listener.name.as_str()) {
            return Err(format!("Duplicate listener name '{}'", listener.name));
        }
        if !SUPPORTED_PROTOCOLS.contains(&listener.protocol.as_str()) {
            return Err(format!(
                "Listener '{}' has unsupported protocol {}",
                listener.name, listener.protocol
            ));
        }
        if !(1..=65535).contains(&listener.port) {
            return Err(format!(
                "Listener '{}' has invalid port {}",
                listener.name, listener.port
            ));
        }
    }
    Ok(())
}

/// Current status conditions as JSON values
fn current_conditions(gateway: &Gateway) -> Vec<Value> {
    serde_json::to_value(&gateway.status)
        .ok()
        .and_then(|status| status.get("conditions").and_then(Value::as_array).cloned())
        .unwrap_or_default()
}

/// True when the Gateway's `Accepted` condition is `True`
pub fn gateway_accepted(gateway: &Gateway) -> bool {
    current_conditions(gateway).iter().any(|c| {
        c.get("type").and_then(Value::as_str) == Some("Accepted")
            && c.get("status").and_then(Value::as_str) == Some("True")
    })
}

fn condition(
    previous: &[Value],
    type_: &str,
    ok: bool,
    reason: &str,
    message: &str,
    generation: Option<i64>,
    now: &str,
) -> Value {
    let status = if ok { "True" } else { "False" };
    // Keep the transition time while the status does not flip
    let last_transition = previous
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
        .filter(|c| c.get("status").and_then(Value::as_str) == Some(status))
        .and_then(|c| c.get("lastTransitionTime").cloned())
        .unwrap_or_else(|| Value::String(now.to_string()));

    json!({
        "type": type_,
        "status": status,
        "reason": reason,
        "message": message,
        "observedGeneration": generation,
        "lastTransitionTime": last_transition,
    })
}

/// Status conditions for a validation verdict
pub fn desired_conditions(
    gateway: &Gateway,
    verdict: &std::result::Result<(), String>,
    now: &str,
) -> Vec<Value> {
    let previous = current_conditions(gateway);
    let generation = gateway.metadata.generation;

    match verdict {
        Ok(()) => vec![
            condition(&previous, "Accepted", true, "Accepted", "Gateway is accepted", generation, now),
            condition(&previous, "Programmed", true, "Programmed", "Gateway is programmed", generation, now),
        ],
        Err(reason) => vec![
            condition(&previous, "Accepted", false, "ListenersNotValid", reason, generation, now),
            condition(&previous, "Programmed", false, "Invalid", reason, generation, now),
        ],
    }
}

fn conditions_converged(gateway: &Gateway, desired: &[Value]) -> bool {
    let current = current_conditions(gateway);
    desired.iter().all(|d| {
        current
            .iter()
            .any(|c| c.get("type") == d.get("type") && c == d)
    })
}

/// Reconcile a single Gateway under the reconcile deadline
pub async fn reconcile(gateway: Arc<Gateway>, ctx: Arc<GatewayContext>) -> Result<Action> {
    let start = Instant::now();
    let key = object_key(gateway.as_ref());
    let namespace = gateway.namespace().unwrap_or_else(|| "default".to_string());

    let result = tokio::time::timeout(
        ctx.timeouts.reconcile_timeout(),
        reconcile_gateway(&gateway, &ctx),
    )
    .await
    .map_err(|_| Error::DeadlineExceeded(format!("gateway/{}", key)))
    .and_then(|r| r);

    let label = match &result {
        Ok(_) => "success",
        Err(e) => e.metric_label(),
    };
    record_reconciliation("gateway", &namespace, start.elapsed().as_secs_f64(), label);

    if result.is_ok() {
        ctx.backoff.reset(&key);
    }
    result
}

async fn reconcile_gateway(gateway: &Gateway, ctx: &GatewayContext) -> Result<Action> {
    let key = object_key(gateway);
    let class = &gateway.spec.gateway_class_name;

    if *class != ctx.gateway_class_name {
        debug!("Gateway {} references GatewayClass '{}', ignoring", key, class);
        return Ok(Action::await_change());
    }

    let verdict = validate_listeners(gateway);
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let conditions = desired_conditions(gateway, &verdict, &now);

    if conditions_converged(gateway, &conditions) {
        debug!("Gateway {} status is up to date", key);
    } else {
        let namespace = gateway.namespace().unwrap_or_else(|| "default".to_string());
        ctx.client
            .patch_gateway_status(
                &namespace,
                &gateway.name_any(),
                json!({ "conditions": conditions }),
            )
            .await?;
        info!("Updated Gateway {} status: accepted={}", key, verdict.is_ok());
    }

    match verdict {
        Ok(()) => Ok(Action::requeue(ctx.timeouts.resync_interval())),
        Err(reason) => {
            warn!("Gateway {} rejected: {}", key, reason);
            Ok(Action::await_change())
        }
    }
}

pub fn error_policy(gateway: Arc<Gateway>, error: &Error, ctx: Arc<GatewayContext>) -> Action {
    let key = object_key(gateway.as_ref());
    error!("Gateway reconciliation error on {}: {}", key, error);
    ctx.backoff.action_for(&key, error)
}

/// Start the Gateway controller
pub async fn run(client: Client, ctx: Arc<GatewayContext>) {
    let api: Api<Gateway> = Api::all(client);

    info!("Starting Gateway controller");

    Controller::new(api, WatcherConfig::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => debug!("Reconciled Gateway: {:?}", o),
                Err(e) => debug!("Gateway reconcile failed: {:?}", e),
            }
        })
        .await;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Gateway in namespace `red` with the given listeners `(name, protocol, port)`
    pub fn gateway(name: &str, class: &str, listeners: &[(&str, &str, i32)]) -> Gateway {
        let listeners: Vec<Value> = listeners
            .iter()
            .map(|(n, p, port)| json!({"name": n, "protocol": p, "port": port}))
            .collect();
        serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": {"name": name, "namespace": "red", "generation": 3},
            "spec": {"gatewayClassName": class, "listeners": listeners},
        }))
        .expect("valid gateway")
    }

    /// Same Gateway with `conditions` as its status
    pub fn with_conditions(gateway: &Gateway, conditions: Vec<Value>) -> Gateway {
        let mut value = serde_json::to_value(gateway).expect("serialize");
        value["status"] = json!({ "conditions": conditions });
        serde_json::from_value(value).expect("valid gateway")
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use std::sync::Mutex;

    fn context(client: MockGatewayClient) -> Arc<GatewayContext> {
        Arc::new(GatewayContext::new(
            Arc::new(client),
            "sidelink".to_string(),
            TimeoutConfig::default(),
        ))
    }

    #[test]
    fn test_validate_listeners() {
        assert!(validate_listeners(&gateway("gw", "sidelink", &[("bgp", "TCP", 4000)])).is_ok());
        assert!(validate_listeners(&gateway("gw", "sidelink", &[])).is_err());
        assert!(validate_listeners(&gateway(
            "gw",
            "sidelink",
            &[("a", "TCP", 80), ("a", "UDP", 81)]
        ))
        .is_err());
        assert!(validate_listeners(&gateway("gw", "sidelink", &[("web", "HTTP", 80)])).is_err());
        assert!(validate_listeners(&gateway("gw", "sidelink", &[("zero", "UDP", 0)])).is_err());
    }

    #[test]
    fn test_transition_time_kept_while_status_unchanged() {
        let gw = gateway("gw", "sidelink", &[("tcp", "TCP", 4000)]);
        let first = desired_conditions(&gw, &Ok(()), "2026-01-01T00:00:00Z");
        let gw = with_conditions(&gw, first.clone());

        let again = desired_conditions(&gw, &Ok(()), "2026-02-01T00:00:00Z");
        assert_eq!(again, first);

        let rejected = desired_conditions(&gw, &Err("bad".to_string()), "2026-02-01T00:00:00Z");
        assert_eq!(rejected[0]["lastTransitionTime"], "2026-02-01T00:00:00Z");
        assert_eq!(rejected[0]["status"], "False");
        assert_eq!(rejected[0]["observedGeneration"], 3);
    }

    #[test]
    fn test_gateway_accepted() {
        let gw = gateway("gw", "sidelink", &[("tcp", "TCP", 4000)]);
        assert!(!gateway_accepted(&gw));

        let conditions = desired_conditions(&gw, &Ok(()), "2026-01-01T00:00:00Z");
        assert!(gateway_accepted(&with_conditions(&gw, conditions)));
    }

    #[tokio::test]
    async fn test_valid_gateway_accepted_and_requeued() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let recorded = written.clone();
        let mut mock = MockGatewayClient::new();
        mock.expect_patch_gateway_status()
            .times(1)
            .returning(move |_, name, status| {
                recorded.lock().expect("lock").push((name.to_string(), status));
                Ok(())
            });

        let gw = gateway("gw-a", "sidelink", &[("tcp", "TCP", 4000)]);
        let action = reconcile(Arc::new(gw), context(mock)).await.expect("reconcile");

        assert_eq!(action, Action::requeue(TimeoutConfig::default().resync_interval()));
        let written = written.lock().expect("lock");
        assert_eq!(written[0].0, "gw-a");
        assert_eq!(written[0].1["conditions"][0]["type"], "Accepted");
        assert_eq!(written[0].1["conditions"][0]["status"], "True");
        assert_eq!(written[0].1["conditions"][1]["type"], "Programmed");
    }

    #[tokio::test]
    async fn test_converged_gateway_not_rewritten() {
        let gw = gateway("gw-a", "sidelink", &[("tcp", "TCP", 4000)]);
        let conditions = desired_conditions(&gw, &Ok(()), "2026-01-01T00:00:00Z");
        let gw = with_conditions(&gw, conditions);

        let mut mock = MockGatewayClient::new();
        mock.expect_patch_gateway_status().times(0);

        reconcile(Arc::new(gw), context(mock)).await.expect("reconcile");
    }

    #[tokio::test]
    async fn test_other_class_ignored() {
        let mut mock = MockGatewayClient::new();
        mock.expect_patch_gateway_status().times(0);

        let gw = gateway("gw-b", "other", &[("tcp", "TCP", 4000)]);
        let action = reconcile(Arc::new(gw), context(mock)).await.expect("reconcile");
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_invalid_gateway_rejected_without_retry() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let recorded = written.clone();
        let mut mock = MockGatewayClient::new();
        mock.expect_patch_gateway_status()
            .times(1)
            .returning(move |_, _, status| {
                recorded.lock().expect("lock").push(status);
                Ok(())
            });

        let gw = gateway("gw-a", "sidelink", &[("web", "HTTP", 80)]);
        let action = reconcile(Arc::new(gw), context(mock)).await.expect("reconcile");

        assert_eq!(action, Action::await_change());
        let written = written.lock().expect("lock");
        assert_eq!(written[0]["conditions"][0]["status"], "False");
        assert_eq!(written[0]["conditions"][0]["reason"], "ListenersNotValid");
    }
}
