//! External routing: BGP peers and VIP advertisement through BIRD

pub mod bird;
pub mod bird_config;
pub mod daemon;
pub mod supervisor;

pub use bird::Bird;
pub use daemon::{BgpPeer, DesiredRouting, RoutingDaemon};
pub use supervisor::{DaemonStatus, RouterHandle, SupervisorSettings};
