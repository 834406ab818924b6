//! Router reconciler
//!
//! Runs next to the routing daemon of one Gateway. Every trigger recomputes
//! the full desired state (peers from the Gateway's `GatewayRouter`s, VIPs
//! from its `L34Route`s with a ready backend) and hands it to the supervisor,
//! which owns the daemon's command stream.
//!
//! Reconciles and the deletion watch push under one lock, and a reconcile
//! rereads the Gateway under that lock, so a withdrawal is never followed by
//! the state of a Gateway that is already gone.

use super::gateway::gateway_accepted;
use crate::apis::backoff::ErrorBackoff;
use crate::apis::crd::{GatewayRouter, L34Route};
use crate::apis::endpointslice::endpointslice::{managed_selector, ready_services};
use crate::apis::metrics::record_reconciliation;
use crate::apis::objects::object_key;
use crate::config::TimeoutConfig;
use crate::error::{Error, Result};
use crate::routing::{BgpPeer, DesiredRouting, RouterHandle};
use async_trait::async_trait;
use common::Prefix;
use futures::StreamExt;
use gateway_api::apis::standard::gateways::Gateway;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

/// Reads the inputs of a Gateway's routing state
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RouterClient: Send + Sync {
    /// Current Gateway, `None` once it is gone
    async fn get_gateway(&self, namespace: &str, name: &str) -> Result<Option<Gateway>>;

    async fn list_gateway_routers(&self, namespace: &str) -> Result<Vec<GatewayRouter>>;

    async fn list_l34_routes(&self, namespace: &str) -> Result<Vec<L34Route>>;

    /// EndpointSlices managed by the endpoint synchronizer
    async fn list_managed_slices(&self, namespace: &str) -> Result<Vec<EndpointSlice>>;
}

pub struct RouterClientImpl {
    client: Client,
}

impl RouterClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RouterClient for RouterClientImpl {
    async fn get_gateway(&self, namespace: &str, name: &str) -> Result<Option<Gateway>> {
        let api: Api<Gateway> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_gateway_routers(&self, namespace: &str) -> Result<Vec<GatewayRouter>> {
        let api: Api<GatewayRouter> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_l34_routes(&self, namespace: &str) -> Result<Vec<L34Route>> {
        let api: Api<L34Route> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_managed_slices(&self, namespace: &str) -> Result<Vec<EndpointSlice>> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&managed_selector());
        Ok(api.list(&lp).await?.items)
    }
}

pub struct RouterContext {
    pub client: Arc<dyn RouterClient>,
    pub handle: RouterHandle,
    pub gateway_name: String,
    pub gateway_namespace: String,
    pub timeouts: TimeoutConfig,
    pub backoff: ErrorBackoff,
    /// Serializes pushes from reconciles and the deletion watch
    push_lock: tokio::sync::Mutex<()>,
}

impl RouterContext {
    pub fn new(
        client: Arc<dyn RouterClient>,
        handle: RouterHandle,
        gateway_name: String,
        gateway_namespace: String,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            client,
            handle,
            gateway_name,
            gateway_namespace,
            timeouts,
            backoff: ErrorBackoff::new(),
            push_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Withdraw every peer and route
    pub async fn withdraw(&self) -> Result<()> {
        let _push = self.push_lock.lock().await;
        self.handle.resync(DesiredRouting::default()).await
    }
}

fn peer_from_router(router: &GatewayRouter) -> Option<BgpPeer> {
    let address: IpAddr = match router.spec.address.parse() {
        Ok(addr) => addr,
        Err(_) => {
            warn!(
                "GatewayRouter {} has invalid address '{}', skipping",
                object_key(router),
                router.spec.address
            );
            return None;
        }
    };
    let bgp = &router.spec.bgp;
    Some(BgpPeer {
        name: router.name_any(),
        address,
        interface: router.spec.interface.clone(),
        local_asn: bgp.local_asn,
        remote_asn: bgp.remote_asn,
        hold_time: bgp.hold_time,
        local_port: bgp.local_port,
        remote_port: bgp.remote_port,
    })
}

/// Full routing state of `gateway`
///
/// Empty unless the Gateway is accepted. A route's prefixes are included
/// only while one of its backend Services has a ready endpoint.
pub fn desired_routing(
    gateway: &Gateway,
    routers: &[GatewayRouter],
    routes: &[L34Route],
    slices: &[EndpointSlice],
) -> DesiredRouting {
    let mut desired = DesiredRouting::default();
    if !gateway_accepted(gateway) {
        return desired;
    }
    let name = gateway.name_any();

    desired.peers = routers
        .iter()
        .filter(|r| r.spec.gateway == name)
        .filter_map(peer_from_router)
        .map(|peer| (peer.name.clone(), peer))
        .collect();

    let ready = ready_services(slices);
    for route in routes {
        if !route.spec.parent_refs.contains(&name) {
            continue;
        }
        if !route.spec.backend_refs.iter().any(|svc| ready.contains(svc)) {
            debug!("L34Route {} has no ready backend", object_key(route));
            continue;
        }
        for cidr in &route.spec.destination_cidrs {
            match cidr.parse::<Prefix>() {
                Ok(prefix) => {
                    desired.routes.insert(prefix);
                }
                Err(e) => warn!(
                    "L34Route {} has invalid destination '{}': {}",
                    object_key(route),
                    cidr,
                    e
                ),
            }
        }
    }
    desired
}

/// Reconcile the Gateway under the reconcile deadline
pub async fn reconcile(gateway: Arc<Gateway>, ctx: Arc<RouterContext>) -> Result<Action> {
    let start = Instant::now();
    let key = object_key(gateway.as_ref());

    let result = tokio::time::timeout(
        ctx.timeouts.reconcile_timeout(),
        reconcile_routing(&gateway, &ctx),
    )
    .await
    .map_err(|_| Error::DeadlineExceeded(format!("router/{}", key)))
    .and_then(|r| r);

    let label = match &result {
        Ok(_) => "success",
        Err(e) => e.metric_label(),
    };
    record_reconciliation(
        "router",
        &ctx.gateway_namespace,
        start.elapsed().as_secs_f64(),
        label,
    );

    if result.is_ok() {
        ctx.backoff.reset(&key);
    }
    result
}

async fn reconcile_routing(gateway: &Gateway, ctx: &RouterContext) -> Result<Action> {
    let _push = ctx.push_lock.lock().await;
    let namespace = &ctx.gateway_namespace;

    let Some(current) = ctx.client.get_gateway(namespace, &gateway.name_any()).await? else {
        info!("Gateway {} is gone, withdrawing routes", object_key(gateway));
        ctx.handle.resync(DesiredRouting::default()).await?;
        return Ok(Action::await_change());
    };

    let routers = ctx.client.list_gateway_routers(namespace).await?;
    let routes = ctx.client.list_l34_routes(namespace).await?;
    let slices = ctx.client.list_managed_slices(namespace).await?;

    let desired = desired_routing(&current, &routers, &routes, &slices);
    debug!(
        "Gateway {}: {} peer(s), {} route(s)",
        object_key(&current),
        desired.peers.len(),
        desired.routes.len()
    );
    ctx.handle.resync(desired).await?;

    Ok(Action::requeue(ctx.timeouts.resync_interval()))
}

pub fn error_policy(gateway: Arc<Gateway>, error: &Error, ctx: Arc<RouterContext>) -> Action {
    let key = object_key(gateway.as_ref());
    match error {
        Error::DaemonUnavailable(reason) => {
            warn!("Routing daemon unavailable for {}: {}", key, reason);
        }
        _ => error!("Router reconciliation error on {}: {}", key, error),
    }
    ctx.backoff.action_for(&key, error)
}

/// Withdraw everything when the Gateway goes away
async fn watch_gateway_deletion(api: Api<Gateway>, config: WatcherConfig, ctx: Arc<RouterContext>) {
    let stream = watcher(api, config);
    futures::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Delete(gateway)) => {
                info!("Gateway {} deleted, withdrawing routes", object_key(&gateway));
                if let Err(e) = ctx.withdraw().await {
                    warn!("Failed to withdraw routes: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Gateway watcher error: {}", e),
        }
    }
}

/// Start the router controller
///
/// Any change to the Gateway, its routers, its routes or the managed slices
/// of its namespace triggers the one Gateway this process serves, and so
/// does every recovery of the routing daemon.
pub async fn run(
    client: Client,
    ctx: Arc<RouterContext>,
    recoveries: futures::channel::mpsc::Receiver<()>,
) {
    let name = ctx.gateway_name.clone();
    let namespace = ctx.gateway_namespace.clone();

    let gateways: Api<Gateway> = Api::namespaced(client.clone(), &namespace);
    let routers: Api<GatewayRouter> = Api::namespaced(client.clone(), &namespace);
    let routes: Api<L34Route> = Api::namespaced(client.clone(), &namespace);
    let slices: Api<EndpointSlice> = Api::namespaced(client, &namespace);

    let gateway_only = WatcherConfig::default().fields(&format!("metadata.name={}", name));
    let target = ObjectRef::<Gateway>::new(&name).within(&namespace);

    info!("Starting router controller for Gateway {}/{}", namespace, name);

    let to_gateway = {
        let target = target.clone();
        move |_: GatewayRouter| Some(target.clone())
    };
    let route_to_gateway = {
        let target = target.clone();
        move |_: L34Route| Some(target.clone())
    };
    let slice_to_gateway = move |_: EndpointSlice| Some(target.clone());

    let controller = Controller::new(gateways.clone(), gateway_only.clone())
        .watches(routers, WatcherConfig::default(), to_gateway)
        .watches(routes, WatcherConfig::default(), route_to_gateway)
        .watches(
            slices,
            WatcherConfig::default().labels(&managed_selector()),
            slice_to_gateway,
        )
        .reconcile_all_on(recoveries)
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok(o) => debug!("Reconciled routing: {:?}", o),
                Err(e) => debug!("Routing reconcile failed: {:?}", e),
            }
        });

    tokio::join!(
        controller,
        watch_gateway_deletion(gateways, gateway_only, ctx)
    );
}
