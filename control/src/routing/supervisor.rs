//! Routing daemon supervision
//!
//! Two tasks share one daemon:
//! - the process task keeps the daemon running, probes its health and
//!   restarts it after `restart_delay` when it exits
//! - the control task is the only writer of peer and route commands
//!
//! Every transition to healthy bumps an epoch and emits one recovery
//! trigger, so whoever owns the desired state can push it again. The control
//! task forgets what it applied when the epoch changes and re-adds every peer.

use super::daemon::{BgpPeer, DesiredRouting, RoutingDaemon};
use crate::apis::metrics::{record_daemon_restart, record_daemon_resync};
use crate::config::BirdConfig;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMMAND_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Starting,
    /// `epoch` increases on every recovery
    Healthy { epoch: u64 },
    Unavailable,
}

struct Resync {
    desired: DesiredRouting,
    reply: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub restart_delay: Duration,
    pub health_interval: Duration,
}

impl From<&BirdConfig> for SupervisorSettings {
    fn from(config: &BirdConfig) -> Self {
        Self {
            restart_delay: Duration::from_secs(config.restart_delay_secs),
            health_interval: Duration::from_secs(config.health_interval_secs.max(1)),
        }
    }
}

/// Cloneable entry point used by reconcilers
#[derive(Clone)]
pub struct RouterHandle {
    commands: mpsc::Sender<Resync>,
    status: watch::Receiver<DaemonStatus>,
}

impl RouterHandle {
    /// Make the daemon match `desired`
    ///
    /// Fails fast with `DaemonUnavailable` while the daemon is not healthy.
    pub async fn resync(&self, desired: DesiredRouting) -> Result<()> {
        if !matches!(self.status(), DaemonStatus::Healthy { .. }) {
            return Err(Error::DaemonUnavailable(
                "routing daemon is not healthy".to_string(),
            ));
        }

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Resync { desired, reply })
            .await
            .map_err(|_| Error::DaemonUnavailable("routing supervisor stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::DaemonUnavailable("routing supervisor stopped".to_string()))?
    }

    pub fn status(&self) -> DaemonStatus {
        *self.status.borrow()
    }
}

/// Start supervising `daemon`
///
/// Returns the command handle, a stream that yields once per recovery, and
/// the task handles.
pub fn spawn(
    daemon: Arc<dyn RoutingDaemon>,
    settings: SupervisorSettings,
    token: CancellationToken,
) -> (
    RouterHandle,
    futures::channel::mpsc::Receiver<()>,
    Vec<JoinHandle<()>>,
) {
    let (status_tx, status_rx) = watch::channel(DaemonStatus::Starting);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (recovery_tx, recovery_rx) = futures::channel::mpsc::channel(1);

    let process = tokio::spawn(supervise_process(
        daemon.clone(),
        settings,
        status_tx,
        recovery_tx,
        token.clone(),
    ));
    let control = tokio::spawn(run_commands(daemon, command_rx, status_rx.clone(), token));

    let handle = RouterHandle {
        commands: command_tx,
        status: status_rx,
    };
    (handle, recovery_rx, vec![process, control])
}

async fn supervise_process(
    daemon: Arc<dyn RoutingDaemon>,
    settings: SupervisorSettings,
    status: watch::Sender<DaemonStatus>,
    mut recoveries: futures::channel::mpsc::Sender<()>,
    token: CancellationToken,
) {
    let mut epoch = 0u64;

    loop {
        status.send_replace(DaemonStatus::Starting);
        let mut run = daemon.run();
        let mut probe = tokio::time::interval(settings.health_interval);
        let mut healthy = false;

        let exit = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Routing supervisor stopping");
                    return;
                }
                res = &mut run => break res,
                _ = probe.tick() => match daemon.healthcheck().await {
                    Ok(()) if !healthy => {
                        healthy = true;
                        epoch += 1;
                        status.send_replace(DaemonStatus::Healthy { epoch });
                        info!("Routing daemon healthy (epoch {})", epoch);
                        // A full buffer already holds a pending trigger
                        let _ = recoveries.try_send(());
                    }
                    Ok(()) => {}
                    Err(e) if healthy => {
                        healthy = false;
                        status.send_replace(DaemonStatus::Unavailable);
                        warn!("Routing daemon health check failed: {}", e);
                    }
                    Err(e) => debug!("Routing daemon not ready: {}", e),
                },
            }
        };
        drop(run);

        status.send_replace(DaemonStatus::Unavailable);
        record_daemon_restart();
        match exit {
            Ok(()) => warn!("Routing daemon exited, restarting"),
            Err(e) => warn!("Routing daemon failed: {}, restarting", e),
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(settings.restart_delay) => {}
        }
    }
}

async fn run_commands(
    daemon: Arc<dyn RoutingDaemon>,
    mut commands: mpsc::Receiver<Resync>,
    status: watch::Receiver<DaemonStatus>,
    token: CancellationToken,
) {
    let mut applied: BTreeMap<String, BgpPeer> = BTreeMap::new();
    let mut applied_epoch = 0u64;

    loop {
        let command = tokio::select! {
            _ = token.cancelled() => return,
            cmd = commands.recv() => match cmd {
                Some(cmd) => cmd,
                None => return,
            },
        };

        let current = *status.borrow();
        let result = match current {
            DaemonStatus::Healthy { epoch } => {
                if epoch != applied_epoch {
                    applied.clear();
                    applied_epoch = epoch;
                }
                push(daemon.as_ref(), &mut applied, &command.desired).await
            }
            _ => Err(Error::DaemonUnavailable(
                "routing daemon is not healthy".to_string(),
            )),
        };

        match &result {
            Ok(()) => record_daemon_resync("success"),
            Err(e) => {
                record_daemon_resync("error");
                warn!("Routing resync failed: {}", e);
            }
        }
        let _ = command.reply.send(result);
    }
}

/// Apply the difference between `applied` peers and `desired`, then the full
/// route set
async fn push(
    daemon: &dyn RoutingDaemon,
    applied: &mut BTreeMap<String, BgpPeer>,
    desired: &DesiredRouting,
) -> Result<()> {
    let stale: Vec<String> = applied
        .keys()
        .filter(|name| !desired.peers.contains_key(*name))
        .cloned()
        .collect();
    for name in stale {
        daemon.remove_peer(&name).await?;
        applied.remove(&name);
        info!("Removed BGP peer {}", name);
    }

    for (name, peer) in &desired.peers {
        match applied.get(name) {
            Some(current) if current == peer => continue,
            Some(_) => {
                daemon.remove_peer(name).await?;
                applied.remove(name);
            }
            None => {}
        }
        daemon.add_peer(peer).await?;
        applied.insert(name.clone(), peer.clone());
        info!("Added BGP peer {} ({})", name, peer.address);
    }

    daemon.set_routes(&desired.routes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::daemon::fake::{Call, FakeDaemon};
    use futures::StreamExt;
    use std::collections::BTreeSet;

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            restart_delay: Duration::from_millis(10),
            health_interval: Duration::from_millis(10),
        }
    }

    fn routes() -> BTreeSet<common::Prefix> {
        BTreeSet::from(["20.0.0.1/32".parse().expect("prefix")])
    }

    fn desired(peers: &[&str]) -> DesiredRouting {
        let mut d = DesiredRouting::default();
        for name in peers {
            d.peers.insert(
                name.to_string(),
                BgpPeer {
                    name: name.to_string(),
                    address: "169.254.100.254".parse().expect("ip"),
                    interface: None,
                    local_asn: 8103,
                    remote_asn: 4248829953,
                    hold_time: 90,
                    local_port: 179,
                    remote_port: 179,
                },
            );
        }
        d.routes = routes();
        d
    }

    async fn next_recovery(rx: &mut futures::channel::mpsc::Receiver<()>) {
        tokio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .expect("recovery within timeout")
            .expect("stream open");
    }

    #[tokio::test]
    async fn test_resync_pushes_only_changed_peers() {
        let daemon = FakeDaemon::new(true);
        let token = CancellationToken::new();
        let (handle, mut recoveries, _tasks) = spawn(daemon.clone(), settings(), token.clone());
        next_recovery(&mut recoveries).await;

        handle.resync(desired(&["r1", "r2"])).await.expect("resync");
        assert_eq!(
            daemon.take_calls(),
            vec![
                Call::AddPeer("r1".into()),
                Call::AddPeer("r2".into()),
                Call::SetRoutes(routes())
            ]
        );

        handle.resync(desired(&["r2"])).await.expect("resync");
        assert_eq!(
            daemon.take_calls(),
            vec![Call::RemovePeer("r1".into()), Call::SetRoutes(routes())]
        );
        token.cancel();
    }

    #[tokio::test]
    async fn test_changed_peer_is_replaced() {
        let daemon = FakeDaemon::new(true);
        let token = CancellationToken::new();
        let (handle, mut recoveries, _tasks) = spawn(daemon.clone(), settings(), token.clone());
        next_recovery(&mut recoveries).await;

        handle.resync(desired(&["r1"])).await.expect("resync");
        daemon.take_calls();

        let mut changed = desired(&["r1"]);
        if let Some(peer) = changed.peers.get_mut("r1") {
            peer.hold_time = 30;
        }
        handle.resync(changed).await.expect("resync");
        assert_eq!(
            daemon.take_calls(),
            vec![
                Call::RemovePeer("r1".into()),
                Call::AddPeer("r1".into()),
                Call::SetRoutes(routes())
            ]
        );
        token.cancel();
    }

    #[tokio::test]
    async fn test_crash_triggers_one_recovery_and_full_repush() {
        let daemon = FakeDaemon::new(true);
        let token = CancellationToken::new();
        let (handle, mut recoveries, _tasks) = spawn(daemon.clone(), settings(), token.clone());
        next_recovery(&mut recoveries).await;

        handle.resync(desired(&["r1"])).await.expect("resync");
        daemon.take_calls();

        daemon.crash.notify_one();
        next_recovery(&mut recoveries).await;
        assert_eq!(handle.status(), DaemonStatus::Healthy { epoch: 2 });

        // No extra triggers while the daemon stays healthy
        assert!(
            tokio::time::timeout(Duration::from_millis(100), recoveries.next())
                .await
                .is_err()
        );

        handle.resync(desired(&["r1"])).await.expect("resync");
        assert_eq!(
            daemon.take_calls(),
            vec![Call::AddPeer("r1".into()), Call::SetRoutes(routes())]
        );
        token.cancel();
    }

    #[tokio::test]
    async fn test_resync_while_unhealthy_fails_fast() {
        let daemon = FakeDaemon::new(false);
        let token = CancellationToken::new();
        let (handle, _recoveries, _tasks) = spawn(daemon.clone(), settings(), token.clone());

        let err = handle.resync(desired(&["r1"])).await.expect_err("unhealthy");
        assert!(matches!(err, Error::DaemonUnavailable(_)));
        assert!(daemon.take_calls().is_empty());
        token.cancel();
    }

    #[tokio::test]
    async fn test_health_loss_marks_unavailable() {
        let daemon = FakeDaemon::new(true);
        let token = CancellationToken::new();
        let (handle, mut recoveries, _tasks) = spawn(daemon.clone(), settings(), token.clone());
        next_recovery(&mut recoveries).await;

        daemon.set_healthy(false);
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.status() != DaemonStatus::Unavailable {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("unavailable within timeout");

        daemon.set_healthy(true);
        next_recovery(&mut recoveries).await;
        assert_eq!(handle.status(), DaemonStatus::Healthy { epoch: 2 });
        token.cancel();
    }
}
