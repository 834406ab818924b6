use anyhow::{Context, Result};
use control::apis::endpointslice::{service, slice_gc};
use control::apis::gateway::{gateway, router};
use control::apis::pod::{network_annotator, release_watcher};
use control::config::{ControllerConfig, Mode, RouterConfig};
use control::network::{MultusAttachments, TableIds};
use control::routing::{supervisor, Bird, SupervisorSettings};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use std::env;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Crypto provider for the Kubernetes TLS client
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mode: Mode = env::var("SIDELINK_MODE")
        .unwrap_or_else(|_| "controller-manager".to_string())
        .parse()?;

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let token = CancellationToken::new();

    let handles = match mode {
        Mode::ControllerManager => start_controller_manager(client).await?,
        Mode::Router => start_router(client, token.clone())?,
    };

    info!("sidelink {:?} running, press Ctrl-C to exit", mode);
    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    token.cancel();
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

/// Table ids, pod annotations, EndpointSlices and Gateway status
async fn start_controller_manager(client: Client) -> Result<Vec<JoinHandle<()>>> {
    let config = ControllerConfig::from_env()?;
    info!("GatewayClass: {}", config.gateway_class_name);

    let table_ids = Arc::new(TableIds::new(config.table_id_min, config.table_id_max));

    // Ids published on live pods must be known before anything allocates
    let pods: Api<Pod> = Api::all(client.clone());
    let listed = pods
        .list(&ListParams::default())
        .await
        .context("failed to list pods for table id restore")?;
    let summary = table_ids.restore_from_pods(&listed.items);
    info!(
        "Restored {} table id(s) from {} pod(s) ({} conflict(s), {} unreadable)",
        summary.restored,
        listed.items.len(),
        summary.conflicts,
        summary.invalid
    );

    let attachments = Arc::new(MultusAttachments);
    let mut handles = Vec::new();

    let annotator = Arc::new(network_annotator::PodNetworkContext::new(
        Arc::new(network_annotator::PodNetworkClientImpl::new(client.clone())),
        attachments.clone(),
        table_ids.clone(),
        config.gateway_class_name.clone(),
        config.timeouts.clone(),
    ));
    handles.push(tokio::spawn(network_annotator::run(client.clone(), annotator)));
    handles.push(tokio::spawn(release_watcher::watch_pod_releases(
        client.clone(),
        table_ids,
    )));

    let slice_client = Arc::new(service::EndpointSliceClientImpl::new(client.clone()));
    let slices = Arc::new(service::EndpointSliceContext::new(
        slice_client.clone(),
        attachments,
        config.gateway_class_name.clone(),
        config.timeouts.clone(),
    ));
    handles.push(tokio::spawn(service::run(client.clone(), slices)));
    handles.push(tokio::spawn(slice_gc::watch_service_deletions(
        client.clone(),
        slice_client,
        config.gateway_class_name.clone(),
    )));

    let gateways = Arc::new(gateway::GatewayContext::new(
        Arc::new(gateway::GatewayClientImpl::new(client.clone())),
        config.gateway_class_name,
        config.timeouts,
    ));
    handles.push(tokio::spawn(gateway::run(client, gateways)));

    info!("Controllers started");
    Ok(handles)
}

/// BIRD plus the routing reconciler of one Gateway
fn start_router(client: Client, token: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
    let config = RouterConfig::from_env()?;
    info!(
        "Gateway: {}/{}",
        config.gateway_namespace, config.gateway_name
    );

    let daemon = Arc::new(Bird::new(config.bird.clone()));
    let (handle, recoveries, mut handles) =
        supervisor::spawn(daemon, SupervisorSettings::from(&config.bird), token);

    let ctx = Arc::new(router::RouterContext::new(
        Arc::new(router::RouterClientImpl::new(client.clone())),
        handle,
        config.gateway_name,
        config.gateway_namespace,
        config.timeouts,
    ));
    handles.push(tokio::spawn(async move {
        router::run(client, ctx, recoveries).await;
        error!("Router controller stopped");
    }));

    Ok(handles)
}
