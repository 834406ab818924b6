//! BIRD routing daemon
//!
//! The daemon runs in the foreground as a child process. Every command
//! rewrites bird.conf from the in-memory state and asks the daemon to reload
//! it through `birdc configure`.

use super::bird_config::render;
use super::daemon::{BgpPeer, DesiredRouting, RoutingDaemon};
use crate::config::BirdConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use common::Prefix;
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Upper bound for a single birdc invocation
const BIRDC_TIMEOUT: Duration = Duration::from_secs(10);

const RECONFIGURED_MARKERS: &[&str] = &["Reconfigured", "Reconfiguration in progress"];
const HEALTHY_MARKER: &str = "Daemon is up and running";

pub struct Bird {
    config: BirdConfig,
    /// Held for the whole write+reload so reloads never interleave
    state: Mutex<DesiredRouting>,
}

impl Bird {
    pub fn new(config: BirdConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DesiredRouting::default()),
        }
    }

    /// Write the configuration file atomically
    async fn write_config(&self, state: &DesiredRouting) -> Result<()> {
        let path = &self.config.config_path;
        let tmp = path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, render(state)).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn birdc(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.config.birdc_binary);
        cmd.arg("-s")
            .arg(&self.config.socket_path)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(BIRDC_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                Error::DaemonUnavailable(format!("birdc {} timed out", args.join(" ")))
            })?
            .map_err(|e| Error::DaemonUnavailable(format!("failed to run birdc: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            return Err(Error::DaemonUnavailable(format!(
                "birdc {} failed: {}{}",
                args.join(" "),
                stdout.trim(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(stdout)
    }

    async fn apply(&self, state: &DesiredRouting) -> Result<()> {
        self.write_config(state).await?;
        let out = self.birdc(&["configure"]).await?;
        if RECONFIGURED_MARKERS.iter().any(|m| out.contains(m)) {
            debug!(
                "BIRD reconfigured: {} peer(s), {} route(s)",
                state.peers.len(),
                state.routes.len()
            );
            Ok(())
        } else {
            Err(Error::DaemonUnavailable(format!(
                "birdc configure rejected the configuration: {}",
                out.trim()
            )))
        }
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

#[async_trait]
impl RoutingDaemon for Bird {
    async fn run(&self) -> Result<()> {
        // A fresh process starts with nothing configured
        {
            let mut state = self.state.lock().await;
            *state = DesiredRouting::default();
            ensure_parent(&self.config.config_path)?;
            ensure_parent(&self.config.socket_path)?;
            self.write_config(&state).await?;
        }

        info!(
            "Starting BIRD: {} -f -c {} -s {}",
            self.config.binary.display(),
            self.config.config_path.display(),
            self.config.socket_path.display()
        );

        let mut child = Command::new(&self.config.binary)
            .arg("-f")
            .arg("-c")
            .arg(&self.config.config_path)
            .arg("-s")
            .arg(&self.config.socket_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::DaemonUnavailable(format!("failed to start BIRD: {}", e)))?;

        let status = child.wait().await?;
        if status.success() {
            info!("BIRD exited");
            Ok(())
        } else {
            warn!("BIRD exited with {}", status);
            Err(Error::DaemonUnavailable(format!("BIRD exited with {}", status)))
        }
    }

    async fn add_peer(&self, peer: &BgpPeer) -> Result<()> {
        let mut state = self.state.lock().await;
        state.peers.insert(peer.name.clone(), peer.clone());
        self.apply(&state).await
    }

    async fn remove_peer(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.peers.remove(name);
        self.apply(&state).await
    }

    async fn set_routes(&self, routes: &BTreeSet<Prefix>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.routes = routes.clone();
        self.apply(&state).await
    }

    async fn healthcheck(&self) -> Result<()> {
        let out = self.birdc(&["show", "status"]).await?;
        if out.contains(HEALTHY_MARKER) {
            Ok(())
        } else {
            Err(Error::DaemonUnavailable(format!(
                "unexpected BIRD status: {}",
                out.trim()
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");
        path
    }

    fn bird(dir: &TempDir, birdc_body: &str) -> Bird {
        Bird::new(BirdConfig {
            binary: script(dir, "bird", "exit 3"),
            birdc_binary: script(dir, "birdc", birdc_body),
            config_path: dir.path().join("bird.conf"),
            socket_path: dir.path().join("bird.ctl"),
            restart_delay_secs: 0,
            health_interval_secs: 1,
        })
    }

    fn peer(name: &str) -> BgpPeer {
        BgpPeer {
            name: name.to_string(),
            address: "169.254.100.254".parse().expect("ip"),
            interface: None,
            local_asn: 8103,
            remote_asn: 4248829953,
            hold_time: 90,
            local_port: 179,
            remote_port: 179,
        }
    }

    #[tokio::test]
    async fn test_add_peer_writes_config_and_reloads() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("birdc.log");
        let bird = bird(
            &dir,
            &format!("echo \"$@\" >> {}\necho Reconfigured", log.display()),
        );

        bird.add_peer(&peer("router-1")).await.expect("add peer");

        let conf = std::fs::read_to_string(dir.path().join("bird.conf")).expect("conf");
        assert!(conf.contains("protocol bgp NBR_router_2d1"));
        let calls = std::fs::read_to_string(&log).expect("log");
        assert!(calls.trim().ends_with("configure"));
    }

    #[tokio::test]
    async fn test_set_routes_then_remove_peer_keeps_routes() {
        let dir = TempDir::new().expect("tempdir");
        let bird = bird(&dir, "echo Reconfigured");

        bird.add_peer(&peer("router-1")).await.expect("add peer");
        let routes = BTreeSet::from(["20.0.0.1/32".parse().expect("prefix")]);
        bird.set_routes(&routes).await.expect("routes");
        bird.remove_peer("router-1").await.expect("remove");

        let conf = std::fs::read_to_string(dir.path().join("bird.conf")).expect("conf");
        assert!(!conf.contains("protocol bgp"));
        assert!(conf.contains("route 20.0.0.1/32 blackhole;"));
    }

    #[tokio::test]
    async fn test_rejected_configuration_is_unavailable() {
        let dir = TempDir::new().expect("tempdir");
        let bird = bird(&dir, "echo 'bird.conf:3:1 syntax error'");

        let err = bird.add_peer(&peer("router-1")).await.expect_err("rejected");
        assert!(matches!(err, Error::DaemonUnavailable(_)));
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let dir = TempDir::new().expect("tempdir");
        let healthy = bird(&dir, "echo 'BIRD 2.15\nDaemon is up and running'");
        assert!(healthy.healthcheck().await.is_ok());

        let dir = TempDir::new().expect("tempdir");
        let down = bird(&dir, "echo 'Unable to connect to server control socket' >&2\nexit 1");
        assert!(down.healthcheck().await.is_err());
    }

    #[tokio::test]
    async fn test_run_reports_crash() {
        let dir = TempDir::new().expect("tempdir");
        let bird = bird(&dir, "echo Reconfigured");
        bird.add_peer(&peer("router-1")).await.expect("add peer");

        let err = bird.run().await.expect_err("bird exits 3");
        assert!(matches!(err, Error::DaemonUnavailable(_)));

        // State is reset for the new process
        let conf = std::fs::read_to_string(dir.path().join("bird.conf")).expect("conf");
        assert!(!conf.contains("protocol bgp"));
    }
}
