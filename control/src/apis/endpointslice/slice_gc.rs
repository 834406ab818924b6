//! Managed slice garbage collection
//!
//! Deletes the slices of Services that were deleted or stopped being handled.
//! Owner references let the cluster collect them too; this watcher also
//! catches deletes missed while it was down by sweeping after every relist.
//! A Service created while the listing ran is missing from it, so the sweep
//! rereads every Service it is about to orphan and keeps handled ones.

use super::endpointslice::SERVICE_NAME_LABEL;
use super::service::{delete_managed_slices, EndpointSliceClient};
use crate::apis::metrics::record_endpointslice_write;
use crate::apis::objects::{object_key, service_handled};
use crate::error::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{api::Api, Client, ResourceExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Delete managed slices whose Service is neither in `live`
/// (`namespace/name`) nor currently handled
pub async fn sweep(
    client: &dyn EndpointSliceClient,
    live: &HashSet<String>,
    gateway_class_name: &str,
) -> Result<usize> {
    let mut deleted = 0;
    let mut confirmed = HashSet::new();
    for slice in client.list_all_managed_slices().await? {
        let namespace = slice.namespace().unwrap_or_else(|| "default".to_string());
        let service = slice.labels().get(SERVICE_NAME_LABEL).cloned();

        if let Some(service) = &service {
            let owner = format!("{}/{}", namespace, service);
            if live.contains(&owner) || confirmed.contains(&owner) {
                continue;
            }
            match client.get_service(&namespace, service).await? {
                Some(svc) if service_handled(&svc, gateway_class_name) => {
                    debug!("Service {} appeared after the listing, keeping its slices", owner);
                    confirmed.insert(owner);
                    continue;
                }
                _ => {}
            }
        }
        client.delete_slice(&namespace, &slice.name_any()).await?;
        record_endpointslice_write("delete");
        info!("Deleted orphaned EndpointSlice {}/{}", namespace, slice.name_any());
        deleted += 1;
    }
    Ok(deleted)
}

/// Watch Services and clean up after the ones that go away
pub async fn watch_service_deletions(
    client: Client,
    slices: Arc<dyn EndpointSliceClient>,
    gateway_class_name: String,
) {
    let api: Api<Service> = Api::all(client);
    let stream = watcher(api, WatcherConfig::default());
    futures::pin_mut!(stream);

    info!("Starting EndpointSlice garbage collector");

    let mut listed: Option<HashSet<String>> = None;
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Delete(service)) => {
                let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
                match delete_managed_slices(slices.as_ref(), &namespace, &service.name_any()).await
                {
                    Ok(n) if n > 0 => info!(
                        "Service {} deleted, removed {} slice(s)",
                        object_key(&service),
                        n
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(
                        "Failed to delete slices of Service {}: {}",
                        object_key(&service),
                        e
                    ),
                }
            }
            Ok(watcher::Event::Init) => listed = Some(HashSet::new()),
            Ok(watcher::Event::InitApply(service)) => {
                if let Some(live) = listed.as_mut() {
                    if service_handled(&service, &gateway_class_name) {
                        live.insert(object_key(&service));
                    }
                }
            }
            Ok(watcher::Event::InitDone) => {
                if let Some(live) = listed.take() {
                    match sweep(slices.as_ref(), &live, &gateway_class_name).await {
                        Ok(n) => debug!("Slice sweep complete, {} orphan(s) deleted", n),
                        Err(e) => warn!("Slice sweep failed: {}", e),
                    }
                }
            }
            Ok(watcher::Event::Apply(_)) => {}
            Err(e) => warn!("Service watcher error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::endpointslice::endpointslice::{desired_slices, DesiredEndpointSet};
    use crate::apis::endpointslice::service::MockEndpointSliceClient;
    use crate::apis::objects::fixtures::service;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_sweep_deletes_only_orphans() {
        let mut slices = desired_slices(
            &service("svc-a", "sidelink", r#"["macvlan-a"]"#),
            &DesiredEndpointSet::new(),
        );
        slices.extend(desired_slices(
            &service("svc-gone", "sidelink", r#"["macvlan-a"]"#),
            &DesiredEndpointSet::new(),
        ));

        let deleted = Arc::new(Mutex::new(Vec::new()));
        let recorded = deleted.clone();

        let mut mock = MockEndpointSliceClient::new();
        mock.expect_list_all_managed_slices()
            .returning(move || Ok(slices.clone()));
        mock.expect_get_service().returning(|_, _| Ok(None));
        mock.expect_delete_slice().returning(move |ns, name| {
            recorded.lock().expect("lock").push(format!("{}/{}", ns, name));
            Ok(())
        });

        let live = HashSet::from(["red/svc-a".to_string()]);
        let n = sweep(&mock, &live, "sidelink").await.expect("sweep");

        assert_eq!(n, 1);
        assert_eq!(
            deleted.lock().expect("lock").as_slice(),
            &["red/svc-gone-ipv4".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sweep_with_nothing_orphaned_writes_nothing() {
        let slices = desired_slices(
            &service("svc-a", "sidelink", r#"["macvlan-a"]"#),
            &DesiredEndpointSet::new(),
        );
        let mut mock = MockEndpointSliceClient::new();
        mock.expect_list_all_managed_slices()
            .returning(move || Ok(slices.clone()));
        mock.expect_get_service().times(0);
        mock.expect_delete_slice().times(0);

        let live = HashSet::from(["red/svc-a".to_string()]);
        assert_eq!(sweep(&mock, &live, "sidelink").await.expect("sweep"), 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_service_created_during_listing() {
        let slices = desired_slices(
            &service("svc-new", "sidelink", r#"["macvlan-a"]"#),
            &DesiredEndpointSet::new(),
        );
        let mut mock = MockEndpointSliceClient::new();
        mock.expect_list_all_managed_slices()
            .returning(move || Ok(slices.clone()));
        mock.expect_get_service()
            .times(1)
            .returning(|_, name| Ok(Some(service(name, "sidelink", r#"["macvlan-a"]"#))));
        mock.expect_delete_slice().times(0);

        // Listing finished before svc-new existed
        let live = HashSet::new();
        assert_eq!(sweep(&mock, &live, "sidelink").await.expect("sweep"), 0);
    }

    #[tokio::test]
    async fn test_sweep_deletes_slices_of_unhandled_service() {
        let slices = desired_slices(
            &service("svc-a", "sidelink", r#"["macvlan-a"]"#),
            &DesiredEndpointSet::new(),
        );
        let mut mock = MockEndpointSliceClient::new();
        mock.expect_list_all_managed_slices()
            .returning(move || Ok(slices.clone()));
        mock.expect_get_service()
            .returning(|_, name| Ok(Some(service(name, "other-class", r#"["macvlan-a"]"#))));
        mock.expect_delete_slice().times(1).returning(|_, _| Ok(()));

        assert_eq!(
            sweep(&mock, &HashSet::new(), "sidelink").await.expect("sweep"),
            1
        );
    }
}
