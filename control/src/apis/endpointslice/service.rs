//! Service reconciler
//!
//! Endpoints a handled Service on its pods' secondary network addresses
//! instead of their pod IPs. An address is only exposed once the pod is
//! ready and carries a published table id for the network, so traffic is
//! never steered to a destination without a policy route.

use super::endpointslice::{
    managed_selector, plan_slices, DesiredEndpoint, DesiredEndpointSet, SERVICE_NAME_LABEL,
};
use crate::apis::backoff::ErrorBackoff;
use crate::apis::metrics::{record_endpointslice_write, record_reconciliation};
use crate::apis::objects::{object_key, pod_ready, service_handled, service_networks, service_selects};
use crate::config::TimeoutConfig;
use crate::error::{Error, Result};
use crate::network::table::published_networks;
use crate::network::{AttachmentSource, AttachmentState};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

/// Field manager for server-side apply of slices
pub const FIELD_MANAGER: &str = "sidelink-endpointslice-controller";

/// Cluster operations of the EndpointSlice controllers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndpointSliceClient: Send + Sync {
    /// Pods of `namespace` matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Managed slices of one Service
    async fn list_managed_slices(&self, namespace: &str, service: &str)
        -> Result<Vec<EndpointSlice>>;

    /// Managed slices across the cluster
    async fn list_all_managed_slices(&self) -> Result<Vec<EndpointSlice>>;

    async fn apply_slice(&self, slice: &EndpointSlice) -> Result<()>;

    /// Delete a slice; a missing slice is not an error
    async fn delete_slice(&self, namespace: &str, name: &str) -> Result<()>;

    /// Current Service, `None` once it is gone
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
}

pub struct EndpointSliceClientImpl {
    client: Client,
}

impl EndpointSliceClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EndpointSliceClient for EndpointSliceClientImpl {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn list_managed_slices(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<EndpointSlice>> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{},{}={}", managed_selector(), SERVICE_NAME_LABEL, service);
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items)
    }

    async fn list_all_managed_slices(&self) -> Result<Vec<EndpointSlice>> {
        let api: Api<EndpointSlice> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(&managed_selector()))
            .await?;
        Ok(list.items)
    }

    async fn apply_slice(&self, slice: &EndpointSlice) -> Result<()> {
        let namespace = slice.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &slice.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(slice),
        )
        .await?;
        Ok(())
    }

    async fn delete_slice(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Shared state of the Service reconciler
pub struct EndpointSliceContext {
    pub client: Arc<dyn EndpointSliceClient>,
    pub attachments: Arc<dyn AttachmentSource>,
    pub gateway_class_name: String,
    pub timeouts: TimeoutConfig,
    pub backoff: ErrorBackoff,
}

impl EndpointSliceContext {
    pub fn new(
        client: Arc<dyn EndpointSliceClient>,
        attachments: Arc<dyn AttachmentSource>,
        gateway_class_name: String,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            client,
            attachments,
            gateway_class_name,
            timeouts,
            backoff: ErrorBackoff::new(),
        }
    }
}

/// `k=v,...` form of a Service selector; `None` when it selects nothing
fn selector_string(service: &Service) -> Option<String> {
    let selector = service.spec.as_ref()?.selector.as_ref()?;
    if selector.is_empty() {
        return None;
    }
    Some(
        selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Compute the endpoint set of `service` from current cluster state
pub async fn desired_endpoints(
    service: &Service,
    ctx: &EndpointSliceContext,
) -> Result<DesiredEndpointSet> {
    let mut endpoints = DesiredEndpointSet::new();
    let networks = service_networks(service)?;
    let Some(selector) = selector_string(service) else {
        return Ok(endpoints);
    };
    if networks.is_empty() {
        return Ok(endpoints);
    }

    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let pods = ctx.client.list_pods(&namespace, &selector).await?;

    for pod in pods.iter().filter(|p| pod_ready(p)) {
        let published = match published_networks(pod) {
            Ok(published) => published,
            Err(e) => {
                warn!("Skipping pod {}: {}", object_key(pod), e);
                continue;
            }
        };

        for network in networks.iter().filter(|n| published.contains_key(*n)) {
            match ctx.attachments.get_ips(pod, network).await {
                Ok(AttachmentState::Ready(addresses)) => {
                    endpoints.extend(addresses.into_iter().map(|address| DesiredEndpoint {
                        address,
                        pod_name: pod.name_any(),
                        pod_uid: pod.uid(),
                        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
                    }));
                }
                Ok(_) => debug!(
                    "Network {} on pod {} has no addresses yet",
                    network,
                    object_key(pod)
                ),
                Err(e) => warn!(
                    "Skipping network {} on pod {}: {}",
                    network,
                    object_key(pod),
                    e
                ),
            }
        }
    }

    Ok(endpoints)
}

/// Delete every managed slice of a Service; returns how many were deleted
pub async fn delete_managed_slices(
    client: &dyn EndpointSliceClient,
    namespace: &str,
    service: &str,
) -> Result<usize> {
    let slices = client.list_managed_slices(namespace, service).await?;
    for slice in &slices {
        client.delete_slice(namespace, &slice.name_any()).await?;
        record_endpointslice_write("delete");
    }
    Ok(slices.len())
}

/// Reconcile a single Service under the reconcile deadline
pub async fn reconcile(service: Arc<Service>, ctx: Arc<EndpointSliceContext>) -> Result<Action> {
    let start = Instant::now();
    let key = object_key(service.as_ref());
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());

    let result = tokio::time::timeout(
        ctx.timeouts.reconcile_timeout(),
        reconcile_service(&service, &ctx),
    )
    .await
    .map_err(|_| Error::DeadlineExceeded(format!("service/{}", key)))
    .and_then(|r| r);

    let label = match &result {
        Ok(_) => "success",
        Err(e) => e.metric_label(),
    };
    record_reconciliation("service", &namespace, start.elapsed().as_secs_f64(), label);

    if result.is_ok() {
        ctx.backoff.reset(&key);
    }
    result
}

async fn reconcile_service(service: &Service, ctx: &EndpointSliceContext) -> Result<Action> {
    let name = service.name_any();
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());

    if service.metadata.deletion_timestamp.is_some()
        || !service_handled(service, &ctx.gateway_class_name)
    {
        let deleted = delete_managed_slices(ctx.client.as_ref(), &namespace, &name).await?;
        if deleted > 0 {
            info!(
                "Service {}/{} is no longer handled, deleted {} slice(s)",
                namespace, name, deleted
            );
        }
        return Ok(Action::await_change());
    }

    // Everything is computed before the first write
    let endpoints = desired_endpoints(service, ctx).await?;
    let existing = ctx.client.list_managed_slices(&namespace, &name).await?;
    let plan = plan_slices(service, &endpoints, &existing);

    if plan.is_empty() {
        debug!("Service {}/{} slices already converged", namespace, name);
        return Ok(Action::requeue(ctx.timeouts.resync_interval()));
    }

    for slice in &plan.apply {
        ctx.client.apply_slice(slice).await?;
        record_endpointslice_write("apply");
    }
    for slice in &plan.delete {
        ctx.client.delete_slice(&namespace, slice).await?;
        record_endpointslice_write("delete");
    }

    info!(
        "Service {}/{}: {} endpoint(s), applied {} slice(s), deleted {}",
        namespace,
        name,
        endpoints.len(),
        plan.apply.len(),
        plan.delete.len()
    );

    Ok(Action::requeue(ctx.timeouts.resync_interval()))
}

pub fn error_policy(service: Arc<Service>, error: &Error, ctx: Arc<EndpointSliceContext>) -> Action {
    let key = object_key(service.as_ref());
    if matches!(error, Error::Conflict(_)) {
        debug!("Service {} slices changed during reconcile, retrying", key);
    } else {
        error!("Service reconciliation error on {}: {}", key, error);
    }
    ctx.backoff.action_for(&key, error)
}

/// Start the Service reconciler
///
/// Pod changes trigger the Services that select the pod; changes to managed
/// slices trigger their owning Service.
pub async fn run(client: Client, ctx: Arc<EndpointSliceContext>) {
    let services: Api<Service> = Api::all(client.clone());
    let slices: Api<EndpointSlice> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);

    info!("Starting EndpointSlice controller");

    let controller = Controller::new(services, WatcherConfig::default());
    let store = controller.store();
    let class_name = ctx.gateway_class_name.clone();

    controller
        .owns(slices, WatcherConfig::default().labels(&managed_selector()))
        .watches(pods, WatcherConfig::default(), move |pod: Pod| {
            store
                .state()
                .into_iter()
                .filter(|svc| service_handled(svc, &class_name) && service_selects(svc, &pod))
                .map(|svc| ObjectRef::from_obj(svc.as_ref()))
                .collect::<Vec<_>>()
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => debug!("Reconciled Service: {:?}", o),
                Err(e) => debug!("Service reconcile failed: {:?}", e),
            }
        })
        .await;
}
