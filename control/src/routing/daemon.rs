//! Routing daemon control channel

use crate::error::Result;
use async_trait::async_trait;
use common::Prefix;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// BGP session to one external router
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BgpPeer {
    /// Unique peer name (the GatewayRouter name)
    pub name: String,
    pub address: IpAddr,
    pub interface: Option<String>,
    pub local_asn: u32,
    pub remote_asn: u32,
    /// Seconds
    pub hold_time: u16,
    pub local_port: u16,
    pub remote_port: u16,
}

/// Complete routing state for one Gateway
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredRouting {
    /// Peers by name
    pub peers: BTreeMap<String, BgpPeer>,
    /// Prefixes to advertise
    pub routes: BTreeSet<Prefix>,
}

impl DesiredRouting {
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty() && self.routes.is_empty()
    }
}

/// Commands understood by a routing daemon.
///
/// The daemon keeps nothing across its own restarts, so callers push the
/// whole state again after every restart.
#[async_trait]
pub trait RoutingDaemon: Send + Sync {
    /// Run the daemon in the foreground until it exits
    async fn run(&self) -> Result<()>;

    async fn add_peer(&self, peer: &BgpPeer) -> Result<()>;

    async fn remove_peer(&self, name: &str) -> Result<()>;

    /// Replace the advertised prefixes with `routes`
    async fn set_routes(&self, routes: &BTreeSet<Prefix>) -> Result<()>;

    /// `Ok` when the daemon accepts commands
    async fn healthcheck(&self) -> Result<()>;
}

/// In-memory daemon recording the commands it receives
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        AddPeer(String),
        RemovePeer(String),
        SetRoutes(BTreeSet<Prefix>),
    }

    pub struct FakeDaemon {
        calls: Mutex<Vec<Call>>,
        pub healthy: AtomicBool,
        /// `notify_one` makes the running daemon exit with an error
        pub crash: Notify,
    }

    impl FakeDaemon {
        pub fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                healthy: AtomicBool::new(healthy),
                crash: Notify::new(),
            })
        }

        pub fn take_calls(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock().expect("lock"))
        }

        pub fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        fn record(&self, call: Call) {
            self.calls.lock().expect("lock").push(call);
        }
    }

    #[async_trait]
    impl RoutingDaemon for FakeDaemon {
        async fn run(&self) -> Result<()> {
            self.crash.notified().await;
            Err(Error::DaemonUnavailable("crashed".to_string()))
        }

        async fn add_peer(&self, peer: &BgpPeer) -> Result<()> {
            self.record(Call::AddPeer(peer.name.clone()));
            Ok(())
        }

        async fn remove_peer(&self, name: &str) -> Result<()> {
            self.record(Call::RemovePeer(name.to_string()));
            Ok(())
        }

        async fn set_routes(&self, routes: &BTreeSet<Prefix>) -> Result<()> {
            self.record(Call::SetRoutes(routes.clone()));
            Ok(())
        }

        async fn healthcheck(&self) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::DaemonUnavailable("down".to_string()))
            }
        }
    }
}
