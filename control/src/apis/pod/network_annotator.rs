//! Pod network annotator
//!
//! Assigns a policy routing table id to every (pod, secondary network) pair a
//! handled Service needs, and publishes the ids with the pod's addresses on
//! the pod as `sidelink.io/network-tables`.
//!
//! Per network the state moves Unassigned -> Pending (attachment not ready)
//! -> Assigned (id issued and published) -> Released (pod gone or network no
//! longer required). Releases only happen after the annotation without the
//! network has been written, so a pod never carries an id the pool considers
//! free. Ids the pool holds for a pod but the pod does not publish (a write
//! that never landed) are released the same way on the next reconcile.

use crate::apis::backoff::ErrorBackoff;
use crate::apis::metrics::record_reconciliation;
use crate::apis::objects::{object_key, pod_terminating, required_networks, service_selects};
use crate::config::TimeoutConfig;
use crate::error::{Error, Result};
use crate::network::table::{published_networks, NETWORK_TABLES_ANNOTATION};
use crate::network::{
    AttachmentSource, AttachmentState, NetworkAssignment, NetworkKey, PodKey, PublishedNetworks,
    TableIds,
};
use async_trait::async_trait;
use common::AllocError;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, Pod, Service};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

const CONTROLLER_NAME: &str = "sidelink-pod-network-annotator";

/// Event reason published when no table id is left
pub const POOL_EXHAUSTED_REASON: &str = "TableIdPoolExhausted";

/// Cluster operations of the annotator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodNetworkClient: Send + Sync {
    /// Services of a namespace
    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>>;

    /// Set (or remove, with `None`) the published assignment.
    ///
    /// The write is rejected with `Conflict` if the pod changed since
    /// `resource_version`.
    async fn patch_pod_networks(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        value: Option<String>,
    ) -> Result<()>;

    /// Warning Event on the pod; failures are logged, never returned
    async fn publish_pool_exhausted(&self, pod: &ObjectReference, note: String);
}

pub struct PodNetworkClientImpl {
    client: Client,
    recorder: Recorder,
}

impl PodNetworkClientImpl {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
        }
    }
}

#[async_trait]
impl PodNetworkClient for PodNetworkClientImpl {
    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&Default::default()).await?;
        Ok(list.items)
    }

    async fn patch_pod_networks(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        value: Option<String>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
                "annotations": { NETWORK_TABLES_ANNOTATION: value }
            }
        });

        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            // Pod is gone; the release watcher frees its ids
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish_pool_exhausted(&self, pod: &ObjectReference, note: String) {
        let event = Event {
            type_: EventType::Warning,
            reason: POOL_EXHAUSTED_REASON.to_string(),
            note: Some(note),
            action: "AllocateTableId".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, pod).await {
            warn!(error = %e, "Failed to publish pool exhaustion event");
        }
    }
}

/// Shared state of the annotator
pub struct PodNetworkContext {
    pub client: Arc<dyn PodNetworkClient>,
    pub attachments: Arc<dyn AttachmentSource>,
    pub table_ids: Arc<TableIds>,
    pub gateway_class_name: String,
    pub timeouts: TimeoutConfig,
    pub backoff: ErrorBackoff,
}

/// What one reconcile decided for a pod
#[derive(Debug, Default)]
struct AssignmentPlan {
    desired: PublishedNetworks,
    /// Held by the pod but not desired; freed once the write lands
    release: Vec<NetworkKey>,
    /// Allocated by this reconcile
    fresh: Vec<NetworkKey>,
    pending: Vec<String>,
    exhausted: Vec<String>,
}

impl PodNetworkContext {
    pub fn new(
        client: Arc<dyn PodNetworkClient>,
        attachments: Arc<dyn AttachmentSource>,
        table_ids: Arc<TableIds>,
        gateway_class_name: String,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            client,
            attachments,
            table_ids,
            gateway_class_name,
            timeouts,
            backoff: ErrorBackoff::new(),
        }
    }

    /// Decide the pod's assignment; allocates but never releases
    async fn plan(
        &self,
        pod: &Pod,
        pod_key: &PodKey,
        required: &BTreeSet<String>,
        published: &PublishedNetworks,
    ) -> Result<AssignmentPlan> {
        let mut plan = AssignmentPlan::default();

        for network in required {
            let key = NetworkKey::new(pod_key, network.as_str());
            match self.attachments.get_ips(pod, network).await? {
                AttachmentState::Ready(addresses) => match self.allocate(&key, &mut plan) {
                    Ok(table_id) => {
                        plan.desired.insert(
                            network.clone(),
                            NetworkAssignment {
                                table_id,
                                addresses: addresses.iter().map(|a| a.to_string()).collect(),
                            },
                        );
                    }
                    Err(AllocError::PoolExhausted { .. }) => plan.exhausted.push(network.clone()),
                    Err(e) => return Err(e.into()),
                },
                AttachmentState::NotReady => {
                    // A transient blip does not cost an assigned network its id
                    match (published.get(network), self.table_ids.lookup(&key)) {
                        (Some(current), Some(id)) if current.table_id == id => {
                            plan.desired.insert(network.clone(), current.clone());
                        }
                        _ => plan.pending.push(network.clone()),
                    }
                }
                AttachmentState::Absent => {
                    debug!("Network {} is not attached to pod {}", network, pod_key);
                }
            }
        }

        plan.release = self
            .table_ids
            .keys_for(pod_key)
            .into_iter()
            .filter(|(network, _)| !plan.desired.contains_key(network))
            .map(|(network, _)| NetworkKey::new(pod_key, network))
            .collect();

        Ok(plan)
    }

    fn allocate(
        &self,
        key: &NetworkKey,
        plan: &mut AssignmentPlan,
    ) -> std::result::Result<u32, AllocError> {
        if let Some(id) = self.table_ids.lookup(key) {
            return Ok(id);
        }
        let id = self.table_ids.allocate(key)?;
        plan.fresh.push(key.clone());
        Ok(id)
    }
}

/// Reconcile a single pod under the reconcile deadline
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<PodNetworkContext>) -> Result<Action> {
    let start = Instant::now();
    let key = object_key(pod.as_ref());
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());

    let result = tokio::time::timeout(ctx.timeouts.reconcile_timeout(), reconcile_pod(&pod, &ctx))
        .await
        .map_err(|_| Error::DeadlineExceeded(format!("pod/{}", key)))
        .and_then(|r| r);

    let label = match &result {
        Ok(_) => "success",
        Err(e) => e.metric_label(),
    };
    record_reconciliation("pod", &namespace, start.elapsed().as_secs_f64(), label);

    if result.is_ok() {
        ctx.backoff.reset(&key);
    }
    result
}

async fn reconcile_pod(pod: &Pod, ctx: &PodNetworkContext) -> Result<Action> {
    let Some(pod_key) = PodKey::from_pod(pod) else {
        return Ok(Action::await_change());
    };
    if pod_terminating(pod) {
        // Ids stay until the pod is gone; the release watcher frees them
        debug!("Pod {} is terminating, leaving its assignment", pod_key);
        return Ok(Action::await_change());
    }

    let services = ctx.client.list_services(&pod_key.namespace).await?;
    let required = required_networks(pod, &services, &ctx.gateway_class_name)?;

    let published = published_networks(pod).unwrap_or_else(|e| {
        warn!("Replacing unreadable assignment on {}: {}", pod_key, e);
        PublishedNetworks::new()
    });

    if required.is_empty() && published.is_empty() && ctx.table_ids.keys_for(&pod_key).is_empty()
    {
        debug!("Pod {} is not selected by any handled Service", pod_key);
        return Ok(Action::await_change());
    }

    let plan = ctx.plan(pod, &pod_key, &required, &published).await?;

    let value = if plan.desired.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&plan.desired)?)
    };
    let current = pod.annotations().get(NETWORK_TABLES_ANNOTATION).cloned();

    if value != current {
        let written = ctx
            .client
            .patch_pod_networks(
                &pod_key.namespace,
                &pod_key.name,
                pod.resource_version(),
                value,
            )
            .await;
        if let Err(e) = written {
            // A rejected write published nothing; other failures may have
            // landed and are settled by the next reconcile
            if matches!(e, Error::Conflict(_)) {
                for key in &plan.fresh {
                    ctx.table_ids.release(key);
                }
            }
            return Err(e);
        }
        info!(
            "Published {} network table(s) on pod {}",
            plan.desired.len(),
            pod_key
        );
    }

    for key in &plan.release {
        if let Some(id) = ctx.table_ids.release(key) {
            info!("Released table id {} of {} on {}", id, key.network, pod_key);
        }
    }

    if !plan.exhausted.is_empty() {
        let (min, max) = ctx.table_ids.range();
        let note = format!(
            "No policy routing table id left in [{}, {}) for network(s) {}",
            min,
            max,
            plan.exhausted.join(", ")
        );
        warn!("Pod {}: {}", pod_key, note);
        ctx.client
            .publish_pool_exhausted(&pod.object_ref(&()), note)
            .await;
        return Err(Error::PoolExhausted(AllocError::PoolExhausted { min, max }));
    }

    if let Some(network) = plan.pending.first() {
        return Err(Error::AttachmentNotReady {
            pod: pod_key.to_string(),
            network: network.clone(),
        });
    }

    Ok(Action::requeue(ctx.timeouts.resync_interval()))
}

pub fn error_policy(pod: Arc<Pod>, error: &Error, ctx: Arc<PodNetworkContext>) -> Action {
    let key = object_key(pod.as_ref());
    match error {
        Error::AttachmentNotReady { network, .. } => {
            debug!("Pod {} waiting for network {}", key, network);
            Action::requeue(ctx.timeouts.attachment_requeue())
        }
        Error::Conflict(_) => {
            debug!("Pod {} changed during reconcile, retrying", key);
            ctx.backoff.action_for(&key, error)
        }
        _ => {
            error!("Pod network reconciliation error on {}: {}", key, error);
            ctx.backoff.action_for(&key, error)
        }
    }
}

/// Start the annotator
///
/// Services trigger the pods they select, so a new or changed Service
/// assigns ids without waiting for pod events.
pub async fn run(client: Client, ctx: Arc<PodNetworkContext>) {
    let pods: Api<Pod> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client);

    info!("Starting pod network annotator");

    let controller = Controller::new(pods, WatcherConfig::default());
    let store = controller.store();

    controller
        .watches(services, WatcherConfig::default(), move |service: Service| {
            store
                .state()
                .into_iter()
                .filter(|pod| service_selects(&service, pod))
                .map(|pod| ObjectRef::from_obj(pod.as_ref()))
                .collect::<Vec<_>>()
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => debug!("Reconciled pod: {:?}", o),
                Err(e) => debug!("Pod reconcile failed: {:?}", e),
            }
        })
        .await;
}
