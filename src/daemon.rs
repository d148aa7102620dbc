//! Pre-warmed Daemon Runners
//!
//! Operators can keep sandbox runners warm: each configured daemon is
//! a one-node job whose executable lives in a system image. Incoming
//! workers matching a daemon's signature are routed to its socket via
//! `x-zerovm-daemon`.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;

use crate::config::{DaemonEntry, LimitsConfig};
use crate::error::{Error, Result};
use crate::job::{job_from_json, Worker};
use crate::planner::{ClusterPlanner, ObjectLister};

/// Accepted daemon signature: the executable plus the sorted device set
#[derive(Debug, Clone)]
struct DaemonProfile {
    socket: String,
    exe_url: String,
    devices: Vec<String>,
}

/// Matches planned workers against configured daemon signatures
#[derive(Debug, Default)]
pub struct DaemonMatcher {
    profiles: Vec<DaemonProfile>,
}

/// Daemon configs never touch the object listings
struct DenyLister;

#[async_trait]
impl ObjectLister for DenyLister {
    async fn list_account(&self, account: &str, _mask: &Regex) -> Result<Vec<String>> {
        Err(Error::Storage(account.to_string()))
    }

    async fn list_container(
        &self,
        _account: &str,
        container: &str,
        _mask: Option<&Regex>,
    ) -> Result<Vec<String>> {
        Err(Error::Storage(container.to_string()))
    }
}

impl DaemonMatcher {
    /// A matcher with no daemons configured
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse the configured daemon list. Bad entries are logged and
    /// skipped, never fatal.
    pub async fn load(
        entries: &[DaemonEntry],
        sysimage_devices: &HashMap<String, String>,
        default_content_type: &str,
        limits: LimitsConfig,
    ) -> Self {
        let mut profiles: Vec<DaemonProfile> = Vec::new();
        for entry in entries {
            if profiles.iter().any(|p| p.socket == entry.socket) {
                tracing::warn!("Duplicate daemon config for socket {}", entry.socket);
                continue;
            }
            let raw = match std::fs::read(&entry.config_path) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(
                        "Cannot load daemon config file {}: {}",
                        entry.config_path,
                        e
                    );
                    continue;
                }
            };
            let job = match job_from_json(&raw) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!("Daemon config {} error: {}", entry.config_path, e);
                    continue;
                }
            };
            let mut planner =
                ClusterPlanner::new(sysimage_devices, default_content_type, limits);
            if let Err(e) = planner.plan(&job, false, None, 1, &DenyLister).await {
                tracing::warn!("Daemon config {} error: {}", entry.config_path, e);
                continue;
            }
            if planner.node_list.len() != 1 {
                tracing::warn!("Bad daemon config {}: too many nodes", entry.config_path);
                continue;
            }
            let worker = &planner.nodes[&planner.node_list[0]];
            if !worker.bind_peers.is_empty() || !worker.connect_peers.is_empty() {
                tracing::warn!(
                    "Bad daemon config {}: network channels are present",
                    entry.config_path
                );
                continue;
            }
            let image = match worker.exe.as_image() {
                Some(member) => member,
                None => {
                    tracing::warn!(
                        "Bad daemon config {}: exe path must be in image file",
                        entry.config_path
                    );
                    continue;
                }
            };
            if !sysimage_devices.contains_key(&image.image) {
                tracing::warn!(
                    "Bad daemon config {}: exe is not in a system image device",
                    entry.config_path
                );
                continue;
            }
            profiles.push(DaemonProfile {
                socket: entry.socket.clone(),
                exe_url: worker.exe.url(),
                devices: sorted_devices(worker),
            });
            tracing::info!(
                "Loaded daemon config {} with socket {}",
                entry.config_path,
                entry.socket
            );
        }
        Self { profiles }
    }

    /// Socket id of the daemon whose signature matches this worker
    pub fn match_worker(&self, worker: &Worker) -> Option<&str> {
        if !worker.bind_peers.is_empty() || !worker.connect_peers.is_empty() {
            return None;
        }
        let devices = sorted_devices(worker);
        self.profiles
            .iter()
            .find(|p| p.exe_url == worker.exe.url() && p.devices == devices)
            .map(|p| p.socket.as_str())
    }
}

fn sorted_devices(worker: &Worker) -> Vec<String> {
    let mut devices: Vec<String> = worker.channels.iter().map(|c| c.device.clone()).collect();
    devices.sort();
    devices
}
