//! Pod release watcher
//!
//! Frees the table ids of deleted pods. Deletes missed while the watch was
//! down are caught after every relist: pods that held ids when the listing
//! started and are absent from it lose their ids. Pods that got their first
//! id while the listing ran may be newer than the listing and are left alone.

use crate::network::{PodKey, TableIds};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{api::Api, Client};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Listing state between `Init` and `InitDone`
#[derive(Debug, Default)]
struct Relist {
    /// Pods holding ids when the listing started
    candidates: HashSet<PodKey>,
    seen: Option<HashSet<PodKey>>,
}

/// Apply one watch event to the pool
fn handle_event(event: watcher::Event<Pod>, table_ids: &TableIds, relist: &mut Relist) {
    match event {
        watcher::Event::Delete(pod) => {
            if let Some(key) = PodKey::from_pod(&pod) {
                for (network, id) in table_ids.release_pod(&key) {
                    info!("Released table id {} of {} on deleted pod {}", id, network, key);
                }
            }
        }
        watcher::Event::Init => {
            relist.candidates = table_ids.pods();
            relist.seen = Some(HashSet::new());
        }
        watcher::Event::InitApply(pod) => {
            if let (Some(seen), Some(key)) = (relist.seen.as_mut(), PodKey::from_pod(&pod)) {
                seen.insert(key);
            }
        }
        watcher::Event::InitDone => {
            if let Some(seen) = relist.seen.take() {
                let candidates = std::mem::take(&mut relist.candidates);
                let released = table_ids.release_vanished(&candidates, &seen);
                debug!(
                    "Pod relist complete: {} live pod(s), {} stale id(s) released",
                    seen.len(),
                    released
                );
            }
        }
        watcher::Event::Apply(_) => {}
    }
}

/// Watch pods and release the ids of the ones that disappear
pub async fn watch_pod_releases(client: Client, table_ids: Arc<TableIds>) {
    let api: Api<Pod> = Api::all(client);
    let stream = watcher(api, WatcherConfig::default());
    futures::pin_mut!(stream);

    info!("Starting pod release watcher");

    let mut relist = Relist::default();
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => handle_event(event, &table_ids, &mut relist),
            Err(e) => warn!("Pod release watcher error: {}", e),
        }
    }
}
