//! Cluster Configuration Planner
//!
//! Expands a submitted job description into a concrete set of placed,
//! wired worker invocations: node replication, wildcard expansion,
//! channel classification, the connect/bind graph and wire-level
//! connect strings.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;

use crate::config::LimitsConfig;
use crate::error::{Error, Result};
use crate::job::{classify_channel, Access, Channel, JobConfig, NodeSpec, Worker};
use crate::path::{Location, StoragePath};

/// Enumeration callbacks the planner uses to expand wildcards
#[async_trait]
pub trait ObjectLister: Send + Sync {
    /// Container names in `account` whose name matches `mask`
    async fn list_account(&self, account: &str, mask: &Regex) -> Result<Vec<String>>;

    /// Object names in `container`; entries ending in `/` are filtered
    /// by the implementation. `mask` of `None` lists everything.
    async fn list_container(
        &self,
        account: &str,
        container: &str,
        mask: Option<&Regex>,
    ) -> Result<Vec<String>>;
}

/// Per-node channel and peer-device bookkeeping collected in step A
type ConnectDevices = HashMap<String, HashMap<String, (String, String)>>;

/// Cluster configuration planner; one instance per request
pub struct ClusterPlanner<'a> {
    sysimage_devices: &'a HashMap<String, String>,
    default_content_type: &'a str,
    limits: LimitsConfig,
    /// Materialized workers by unique name
    pub nodes: HashMap<String, Worker>,
    /// Worker names in sorted order
    pub node_list: Vec<String>,
    /// Sum of worker replication factors
    pub total_count: u32,
    node_id: u32,
}

impl<'a> ClusterPlanner<'a> {
    /// Create a new planner instance
    pub fn new(
        sysimage_devices: &'a HashMap<String, String>,
        default_content_type: &'a str,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            sysimage_devices,
            default_content_type,
            limits,
            nodes: HashMap::new(),
            node_list: Vec::new(),
            total_count: 0,
            node_id: 1,
        }
    }

    /// Checks if the device name is a configured system image
    pub fn is_sysimage_device(&self, device: &str) -> bool {
        self.sysimage_devices.contains_key(device)
    }

    /// Host file path for a system-image device
    pub fn sysimage_path(&self, device: &str) -> Option<&str> {
        self.sysimage_devices.get(device).map(|s| s.as_str())
    }

    /// Expand the job into materialized workers.
    ///
    /// `add_user_image` appends an `image` channel to every worker;
    /// `account` enables the placement/path-info pass with the storage
    /// ring's `replica_count`.
    pub async fn plan<L: ObjectLister + ?Sized>(
        &mut self,
        job: &JobConfig,
        add_user_image: bool,
        account: Option<&str>,
        replica_count: u32,
        lister: &L,
    ) -> Result<()> {
        self.nodes.clear();
        self.node_list.clear();
        self.node_id = 1;
        self.total_count = 0;

        let mut connect_devices: ConnectDevices = HashMap::new();
        for def in job {
            let spec = NodeSpec::from_def(def)?;
            let mut node_count = validate_count(def)?;

            let mut read_list: Vec<Channel> = Vec::new();
            let mut write_list: Vec<Channel> = Vec::new();
            let mut other_list: Vec<Channel> = Vec::new();
            if let Some(file_list) = &def.file_list {
                let mut cdr_list: Vec<Channel> = Vec::new();
                for f in file_list {
                    let channel = classify_channel(f, &spec.name, self.default_content_type)?;
                    if let Some(endpoint) = channel.path.as_ref().and_then(|p| p.as_endpoint()) {
                        connect_devices
                            .entry(spec.name.clone())
                            .or_default()
                            .insert(
                                endpoint.node.clone(),
                                (format!("/dev/{}", channel.device), endpoint.device.clone()),
                            );
                        continue;
                    }
                    if channel.access.is_unknown() {
                        if self.is_sysimage_device(&channel.device) {
                            other_list.push(channel);
                            continue;
                        }
                        return Err(Error::ConfigParse(format!(
                            "Unknown device {} in {}",
                            channel.device, spec.name
                        )));
                    }
                    if channel.access.is_readable() {
                        read_list.push(channel);
                    } else if channel.access.is_cdr() {
                        cdr_list.push(channel);
                    } else if channel.access.is_writable() {
                        write_list.push(channel);
                    } else {
                        other_list.push(channel);
                    }
                }
                // pure reads keep insertion order and precede appends;
                // wildcard expansion below applies only to the pure reads
                let pure_reads = read_list.len();
                read_list.append(&mut cdr_list);

                let mut read_group = false;
                for (i, chan) in read_list.iter().enumerate() {
                    let wild = i < pure_reads
                        && chan
                            .path
                            .as_ref()
                            .and_then(|p| p.as_storage())
                            .map(|s| s.has_wildcard())
                            .unwrap_or(false);
                    if wild {
                        read_group = true;
                        let storage = chan.path.as_ref().unwrap().as_storage().unwrap();
                        let matches = self.find_objects(storage, lister).await?;
                        let read_mask = wildcard_mask(&storage.path(), true)?;
                        node_count = matches.len() as u32;
                        for (j, new_path) in matches.into_iter().enumerate() {
                            let captured = capture_wildcards(&read_mask, &new_path.path());
                            let worker = self.get_or_create(&spec, (j + 1) as u32);
                            worker
                                .channels
                                .push(chan.with_path(Some(Location::Storage(new_path))));
                            worker.wildcards = captured;
                        }
                    } else if node_count > 1 {
                        for j in 1..=node_count {
                            let worker = self.get_or_create(&spec, j);
                            worker.channels.push(chan.clone());
                        }
                    } else {
                        let worker = self.get_or_create(&spec, 0);
                        worker.channels.push(chan.clone());
                    }
                }

                for chan in &write_list {
                    match &chan.path {
                        Some(path) if path.url().contains('*') => {
                            if read_group {
                                for j in 1..=node_count {
                                    let name = expanded_name(&spec.name, j);
                                    let wildcards = self
                                        .nodes
                                        .get(&name)
                                        .map(|w| w.wildcards.clone())
                                        .unwrap_or_default();
                                    let new_url =
                                        project_wildcards(&path.url(), &wildcards)?;
                                    let new_path = crate::path::parse_location(Some(&new_url))?;
                                    let worker =
                                        self.nodes.get_mut(&name).ok_or_else(|| {
                                            Error::Internal(format!(
                                                "missing expanded worker {}",
                                                name
                                            ))
                                        })?;
                                    worker.channels.push(chan.with_path(new_path));
                                }
                            } else if node_count > 1 {
                                for j in 1..=node_count {
                                    let name = expanded_name(&spec.name, j);
                                    let stars = path.url().matches('*').count();
                                    let new_url = path.url().replace('*', &name);
                                    let new_path = crate::path::parse_location(Some(&new_url))?;
                                    let worker = self.get_or_create(&spec, j);
                                    worker.channels.push(chan.with_path(new_path));
                                    worker.wildcards = vec![name; stars];
                                }
                            } else {
                                let name = spec.name.clone();
                                let stars = path.url().matches('*').count();
                                let new_url = path.url().replace('*', &name);
                                let new_path = crate::path::parse_location(Some(&new_url))?;
                                let worker = self.get_or_create(&spec, 0);
                                worker.channels.push(chan.with_path(new_path));
                                worker.wildcards = vec![name; stars];
                            }
                        }
                        Some(path) => {
                            if node_count > 1 {
                                return Err(Error::ConfigParse(format!(
                                    "Single path {} for multiple node definition: {}, \
                                     please use wildcard",
                                    path.url(),
                                    spec.name
                                )));
                            }
                            let worker = self.get_or_create(&spec, 0);
                            worker.channels.push(chan.clone());
                        }
                        None => {
                            if chan.device != "stdout" && chan.device != "stderr" {
                                return Err(Error::ConfigParse(format!(
                                    "Immediate response is not available for device {}",
                                    chan.device
                                )));
                            }
                            self.fan_out(&spec, node_count, chan);
                        }
                    }
                }

                for chan in &mut other_list {
                    if self.is_sysimage_device(&chan.device) {
                        chan.access = Access::RANDOM.union(Access::READ);
                    } else if chan.path.is_none() {
                        return Err(Error::ConfigParse(format!(
                            "Path is required for device: {}",
                            chan.device
                        )));
                    }
                    self.fan_out(&spec, node_count, chan);
                }
            }

            // an exec-only node still materializes
            if !self.nodes.contains_key(&spec.name)
                && !self.nodes.contains_key(&expanded_name(&spec.name, 1))
            {
                if node_count > 1 {
                    for j in 1..=node_count {
                        self.get_or_create(&spec, j);
                    }
                } else {
                    self.get_or_create(&spec, 0);
                }
            }
        }

        for def in job {
            let name = match &def.name {
                Some(n) => n.clone(),
                None => continue,
            };
            let devices = connect_devices.get(&name).cloned().unwrap_or_default();
            let mut peers: Vec<String> = def.connect.clone().unwrap_or_default();
            for peer in devices.keys() {
                if !peers.contains(peer) {
                    peers.push(peer.clone());
                }
            }
            if peers.is_empty() {
                continue;
            }
            self.add_all_connections(&name, &peers, &devices)?;
        }

        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort();
        self.node_list = names;

        if add_user_image {
            for name in &self.node_list {
                let worker = self.nodes.get_mut(name).unwrap();
                worker.channels.push(Channel {
                    device: "image".to_string(),
                    access: Access::CDR,
                    path: None,
                    content_type: self.default_content_type.to_string(),
                    meta: HashMap::new(),
                    mode: None,
                    removable: "yes".to_string(),
                });
            }
        }
        if let Some(account) = account {
            self.resolve_path_info(account, replica_count);
        }
        self.total_count = self
            .node_list
            .iter()
            .map(|n| self.nodes[n].replicate)
            .sum();
        Ok(())
    }

    /// Find all stored objects matching a wildcard path
    pub async fn find_objects<L: ObjectLister + ?Sized>(
        &self,
        path: &StoragePath,
        lister: &L,
    ) -> Result<Vec<StoragePath>> {
        let mut found = Vec::new();
        if path.container.contains('*') {
            let container_mask = wildcard_mask(&path.container, false)?;
            let containers = lister
                .list_account(&path.account, &container_mask)
                .await
                .map_err(|_| {
                    Error::ConfigParse(format!(
                        "Error querying object server for account: {}",
                        path.account
                    ))
                })?;
            let object_mask = if path.object.is_empty() {
                None
            } else {
                Some(wildcard_mask(&path.object, false)?)
            };
            for container in containers {
                let objects = lister
                    .list_container(&path.account, &container, object_mask.as_ref())
                    .await
                    .map_err(|_| {
                        Error::ConfigParse(format!(
                            "Error querying object server for container: {}",
                            container
                        ))
                    })?;
                for object in objects {
                    found.push(StoragePath::new(&path.account, &container, object));
                }
            }
        } else {
            let object_mask = wildcard_mask(&path.object, false)?;
            let objects = lister
                .list_container(&path.account, &path.container, Some(&object_mask))
                .await
                .map_err(|_| {
                    Error::ConfigParse(format!(
                        "Error querying object server for container: {}",
                        path.container
                    ))
                })?;
            for object in objects {
                found.push(StoragePath::new(&path.account, &path.container, object));
            }
        }
        if found.is_empty() {
            return Err(Error::ConfigParse(format!(
                "No objects found in path {}",
                path.url()
            )));
        }
        Ok(found)
    }

    /// Render connect strings and stamp the name-service endpoint on
    /// every worker; called once ids are final
    pub fn wire_network(&mut self, ns_address: &str) {
        let node_count = self.node_list.len() as u32;
        for name in self.node_list.clone() {
            let (bind_peers, connect_peers) = {
                let worker = &self.nodes[&name];
                (worker.bind_peers.clone(), worker.connect_peers.clone())
            };
            let mut bind_lines = Vec::with_capacity(bind_peers.len());
            for (dst, dst_dev) in &bind_peers {
                let (dst_id, dst_repl) = self.peer_identity(dst);
                let proto: Vec<String> = (0..dst_repl)
                    .map(|i| format!("tcp:{}:0", dst_id + i * node_count))
                    .collect();
                bind_lines.push(format!(
                    "{},{},0,0,{},{},0,0",
                    proto.join(";"),
                    dst_dev,
                    self.limits.reads,
                    self.limits.rbytes
                ));
            }
            let mut connect_lines = Vec::with_capacity(connect_peers.len());
            for (dst, dst_dev) in &connect_peers {
                let (dst_id, dst_repl) = self.peer_identity(dst);
                let proto: Vec<String> = (0..dst_repl)
                    .map(|i| format!("tcp:{}:", dst_id + i * node_count))
                    .collect();
                connect_lines.push(format!(
                    "{},{},0,0,0,0,{},{}",
                    proto.join(";"),
                    dst_dev,
                    self.limits.writes,
                    self.limits.wbytes
                ));
            }
            let worker = self.nodes.get_mut(&name).unwrap();
            worker.bind = bind_lines;
            worker.connect = connect_lines;
            worker.name_service = Some(ns_address.to_string());
        }
    }

    /// Clone replica siblings for workers with `replicate > 1`,
    /// spacing their ids by the worker count
    pub fn make_replicas(&mut self) {
        let node_count = self.node_list.len() as u32;
        for name in self.node_list.clone() {
            let worker = self.nodes.get_mut(&name).unwrap();
            if worker.replicate <= 1 {
                continue;
            }
            let template = worker.clone();
            for i in 0..worker.replicate - 1 {
                let mut replica = template.clone();
                replica.id = template.id + (i + 1) * node_count;
                replica.replicas = Vec::new();
                worker.replicas.push(replica);
            }
        }
    }

    /// Consume the planner, yielding workers in sorted-name order
    pub fn take_workers(&mut self) -> Vec<Worker> {
        let mut out = Vec::with_capacity(self.node_list.len());
        for name in &self.node_list {
            if let Some(worker) = self.nodes.remove(name) {
                out.push(worker);
            }
        }
        out
    }

    fn peer_identity(&self, name: &str) -> (u32, u32) {
        match self.nodes.get(name) {
            Some(w) => (w.id, w.replicate),
            None => (0, 1),
        }
    }

    fn fan_out(&mut self, spec: &NodeSpec, node_count: u32, chan: &Channel) {
        if node_count > 1 {
            for j in 1..=node_count {
                let worker = self.get_or_create(spec, j);
                worker.channels.push(chan.clone());
            }
        } else {
            let worker = self.get_or_create(spec, 0);
            worker.channels.push(chan.clone());
        }
    }

    fn get_or_create(&mut self, spec: &NodeSpec, index: u32) -> &mut Worker {
        let name = if index == 0 {
            spec.name.clone()
        } else {
            expanded_name(&spec.name, index)
        };
        if !self.nodes.contains_key(&name) {
            let worker = Worker::from_spec(spec, self.node_id, name.clone());
            self.node_id += 1;
            self.nodes.insert(name.clone(), worker);
        }
        self.nodes.get_mut(&name).unwrap()
    }

    fn add_all_connections(
        &mut self,
        declarer: &str,
        peers: &[String],
        devices: &HashMap<String, (String, String)>,
    ) -> Result<()> {
        let declarers = self.resolve_group(declarer).ok_or_else(|| {
            Error::ConfigParse(format!(
                "Non existing node in connect string for node {}",
                declarer
            ))
        })?;
        for from in declarers {
            for peer in peers {
                let (local, remote) = match devices.get(peer) {
                    Some((l, r)) => (Some(l.clone()), Some(r.clone())),
                    None => (None, None),
                };
                self.add_connection(&from, peer, local, remote)?;
            }
        }
        Ok(())
    }

    fn add_connection(
        &mut self,
        from: &str,
        peer: &str,
        local_dev: Option<String>,
        remote_dev: Option<String>,
    ) -> Result<()> {
        let exact = self.nodes.contains_key(peer);
        let targets = self
            .resolve_group(peer)
            .ok_or_else(|| Error::ConfigParse(format!("Non-existing node in connect {}", peer)))?;
        if exact && peer == from {
            return Err(Error::ConfigParse(format!("Cannot bind to itself: {}", peer)));
        }
        for target in targets {
            if target == from {
                continue;
            }
            let local = local_dev
                .clone()
                .unwrap_or_else(|| format!("/dev/in/{}", from));
            let remote = match &remote_dev {
                Some(dev) => {
                    let wildcards = self.nodes[&target].wildcards.clone();
                    resolve_wildcards(dev, &wildcards, &target)?
                }
                None => format!("/dev/out/{}", target),
            };
            self.nodes
                .get_mut(&target)
                .unwrap()
                .bind_peers
                .push((from.to_string(), local));
            self.nodes
                .get_mut(from)
                .ok_or_else(|| Error::Internal(format!("missing connecting worker {}", from)))?
                .connect_peers
                .push((target, remote));
        }
        Ok(())
    }

    /// Resolve a name to the matching worker names: an exact worker,
    /// or the replicated group `name-1..name-k`
    fn resolve_group(&self, name: &str) -> Option<Vec<String>> {
        if self.nodes.contains_key(name) {
            return Some(vec![name.to_string()]);
        }
        let mut out = Vec::new();
        let mut i = 1;
        loop {
            let candidate = expanded_name(name, i);
            if !self.nodes.contains_key(&candidate) {
                break;
            }
            out.push(candidate);
            i += 1;
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn resolve_path_info(&mut self, account: &str, replica_count: u32) {
        let default_path_info = format!("/{}", account);
        for name in self.node_list.clone() {
            let worker = self.nodes.get_mut(&name).unwrap();
            let top_storage = worker
                .channels
                .first()
                .and_then(|c| c.path.as_ref())
                .and_then(|p| p.as_storage())
                .cloned();
            let top_access = worker.channels.first().map(|c| c.access);
            match (top_storage, top_access) {
                (Some(path), Some(access)) if access.reads_data() => {
                    worker.path_info = Some(path.path());
                }
                (Some(path), Some(access))
                    if access.is_writable() && worker.replicate > 0 =>
                {
                    worker.path_info = Some(path.path());
                    worker.replicate = replica_count;
                }
                _ => {
                    worker.path_info = Some(default_path_info.clone());
                }
            }
            // zero-replica promotion runs after placement decisions
            if worker.replicate == 0 {
                worker.replicate = 1;
            }
        }
    }
}

/// `name-i` worker name for a replicated or expanded group
pub fn expanded_name(name: &str, i: u32) -> String {
    format!("{}-{}", name, i)
}

fn validate_count(def: &crate::job::NodeDef) -> Result<u32> {
    match &def.count {
        None => Ok(1),
        Some(value) => match value.as_i64() {
            Some(n) if n > 0 && value.is_i64() => Ok(n as u32),
            _ => Err(Error::ConfigParse(format!("Invalid node count: {}", value))),
        },
    }
}

/// Compile a `*` wildcard into an anchored regex mask; `capture`
/// makes each wildcard a capture group for projection
fn wildcard_mask(pattern: &str, capture: bool) -> Result<Regex> {
    let replacement = if capture { "(.*)" } else { ".*" };
    let escaped = regex::escape(pattern).replace("\\*", replacement);
    Regex::new(&format!("^{}", escaped))
        .map_err(|e| Error::Internal(format!("bad wildcard mask: {}", e)))
}

fn capture_wildcards(mask: &Regex, path: &str) -> Vec<String> {
    match mask.captures(path) {
        Some(caps) => caps
            .iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect(),
        None => Vec::new(),
    }
}

/// Substitute stored captures into a write path, left to right
fn project_wildcards(url: &str, wildcards: &[String]) -> Result<String> {
    let mut out = url.to_string();
    for wc in wildcards {
        out = out.replacen('*', wc, 1);
    }
    if out.contains('*') {
        return Err(Error::ConfigParse(format!(
            "Wildcards in input cannot be resolved into output path {}",
            url
        )));
    }
    Ok(out)
}

/// Substitute a worker's captures into a device parameter
fn resolve_wildcards(param: &str, wildcards: &[String], node_name: &str) -> Result<String> {
    if !param.contains('*') {
        return Ok(param.to_string());
    }
    let mut out = param.to_string();
    for wc in wildcards {
        out = out.replacen('*', wc, 1);
    }
    if out.contains('*') {
        return Err(Error::ConfigParse(format!(
            "Cannot resolve wildcard for node {}",
            node_name
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::job_from_json;

    struct MockLister {
        containers: Vec<String>,
        objects: HashMap<String, Vec<String>>,
    }

    impl MockLister {
        fn new() -> Self {
            Self {
                containers: Vec::new(),
                objects: HashMap::new(),
            }
        }

        fn with_objects(container: &str, objects: &[&str]) -> Self {
            let mut lister = Self::new();
            lister.containers.push(container.to_string());
            lister.objects.insert(
                container.to_string(),
                objects.iter().map(|s| s.to_string()).collect(),
            );
            lister
        }
    }

    #[async_trait]
    impl ObjectLister for MockLister {
        async fn list_account(&self, _account: &str, mask: &Regex) -> Result<Vec<String>> {
            Ok(self
                .containers
                .iter()
                .filter(|c| mask.is_match(c))
                .cloned()
                .collect())
        }

        async fn list_container(
            &self,
            _account: &str,
            container: &str,
            mask: Option<&Regex>,
        ) -> Result<Vec<String>> {
            Ok(self
                .objects
                .get(container)
                .map(|objs| {
                    objs.iter()
                        .filter(|o| mask.map(|m| m.is_match(o)).unwrap_or(true))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn sysimages() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("python".to_string(), "/opt/images/python.tar".to_string());
        map
    }

    fn planner<'a>(sysimages: &'a HashMap<String, String>) -> ClusterPlanner<'a> {
        ClusterPlanner::new(sysimages, "application/octet-stream", LimitsConfig::default())
    }

    #[tokio::test]
    async fn test_single_node_single_read() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"input","path":"swift://acc/data/x"},
                              {"device":"stdout"}]}]"#,
        )
        .unwrap();
        let images = HashMap::new();
        let mut planner = planner(&images);
        planner
            .plan(&job, false, Some("acc"), 3, &MockLister::new())
            .await
            .unwrap();
        assert_eq!(planner.node_list, vec!["a"]);
        let worker = &planner.nodes["a"];
        assert_eq!(worker.id, 1);
        assert_eq!(worker.channels.len(), 2);
        // readable top channel is only a locality hint
        assert_eq!(worker.replicate, 1);
        assert_eq!(worker.path_info.as_deref(), Some("/acc/data/x"));
        assert_eq!(planner.total_count, 1);
    }

    #[tokio::test]
    async fn test_wildcard_read_fan_out() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"input","path":"swift://acc/c/part*"},
                              {"device":"stdout"}]}]"#,
        )
        .unwrap();
        let lister = MockLister::with_objects("c", &["part1", "part2", "part3"]);
        let images = HashMap::new();
        let mut planner = planner(&images);
        planner
            .plan(&job, false, Some("acc"), 3, &lister)
            .await
            .unwrap();
        assert_eq!(planner.node_list, vec!["a-1", "a-2", "a-3"]);
        for (i, name) in planner.node_list.iter().enumerate() {
            let worker = &planner.nodes[name];
            let input = worker.channel("input").unwrap();
            let object = &input.path.as_ref().unwrap().as_storage().unwrap().object;
            assert_eq!(object, &format!("part{}", i + 1));
            assert_eq!(worker.wildcards, vec![format!("part{}", i + 1)]);
        }
        assert_eq!(planner.total_count, 3);
    }

    #[tokio::test]
    async fn test_wildcard_read_projects_into_write() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"input","path":"swift://acc/c/part*"},
                              {"device":"output","path":"swift://acc/out/part*.done"},
                              {"device":"stdout"}]}]"#,
        )
        .unwrap();
        let lister = MockLister::with_objects("c", &["part1", "part2", "part3"]);
        let images = HashMap::new();
        let mut planner = planner(&images);
        planner
            .plan(&job, false, Some("acc"), 3, &lister)
            .await
            .unwrap();
        let expected = ["part1.done", "part2.done", "part3.done"];
        for (name, want) in planner.node_list.iter().zip(expected) {
            let worker = &planner.nodes[name];
            let output = worker.channel("output").unwrap();
            let object = &output.path.as_ref().unwrap().as_storage().unwrap().object;
            assert_eq!(object, want);
            assert!(!object.contains('*'));
        }
    }

    #[tokio::test]
    async fn test_count_fan_out_write_wildcard_uses_worker_name() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},"count":2,
                 "file_list":[{"device":"output","path":"swift://acc/out/*.log"}]}]"#,
        )
        .unwrap();
        let images = HashMap::new();
        let mut planner = planner(&images);
        planner
            .plan(&job, false, None, 1, &MockLister::new())
            .await
            .unwrap();
        assert_eq!(planner.node_list, vec!["a-1", "a-2"]);
        let output = planner.nodes["a-2"].channel("output").unwrap();
        assert_eq!(
            output.path.as_ref().unwrap().as_storage().unwrap().object,
            "a-2.log"
        );
    }

    #[tokio::test]
    async fn test_ambiguous_write_path_rejected() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},"count":2,
                 "file_list":[{"device":"output","path":"swift://acc/out/fixed"}]}]"#,
        )
        .unwrap();
        let images = HashMap::new();
        let mut planner = planner(&images);
        let err = planner
            .plan(&job, false, None, 1, &MockLister::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("please use wildcard"));
    }

    #[tokio::test]
    async fn test_immediate_response_only_for_std_streams() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"output"}]}]"#,
        )
        .unwrap();
        let images = HashMap::new();
        let mut planner = planner(&images);
        let err = planner
            .plan(&job, false, None, 1, &MockLister::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Immediate response"));
    }

    #[tokio::test]
    async fn test_empty_wildcard_match_rejected() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"input","path":"swift://acc/c/part*"}]}]"#,
        )
        .unwrap();
        let lister = MockLister::with_objects("c", &[]);
        let images = HashMap::new();
        let mut planner = planner(&images);
        let err = planner
            .plan(&job, false, None, 1, &lister)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No objects found"));
    }

    #[tokio::test]
    async fn test_unknown_device_rejected_unless_sysimage() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"weird"}]}]"#,
        )
        .unwrap();
        let images = sysimages();
        let mut planner = planner(&images);
        let err = planner
            .plan(&job, false, None, 1, &MockLister::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown device weird"));
    }

    #[tokio::test]
    async fn test_sysimage_device_forced_to_random_read() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"python"},{"device":"stdout"}]}]"#,
        )
        .unwrap();
        let images = sysimages();
        let mut planner = planner(&images);
        planner
            .plan(&job, false, None, 1, &MockLister::new())
            .await
            .unwrap();
        let chan = planner.nodes["a"].channel("python").unwrap();
        assert!(chan.access.is_readable());
        assert!(chan.access.contains(Access::RANDOM));
    }

    #[tokio::test]
    async fn test_inter_node_connect() {
        let job = job_from_json(
            br#"[{"name":"src","exec":{"path":"swift://acc/bin/prog.nexe"},"count":2,
                 "file_list":[{"device":"stdout"},
                              {"device":"X","path":"zvm://dst/Y"}]},
                {"name":"dst","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"stdout"}]}]"#,
        )
        .unwrap();
        let images = HashMap::new();
        let mut planner = planner(&images);
        planner
            .plan(&job, false, None, 1, &MockLister::new())
            .await
            .unwrap();
        assert_eq!(planner.node_list, vec!["dst", "src-1", "src-2"]);
        for src in ["src-1", "src-2"] {
            let worker = &planner.nodes[src];
            assert_eq!(worker.connect_peers, vec![("dst".to_string(), "/dev/Y".to_string())]);
        }
        let dst = &planner.nodes["dst"];
        let mut binds = dst.bind_peers.clone();
        binds.sort();
        assert_eq!(
            binds,
            vec![
                ("src-1".to_string(), "/dev/X".to_string()),
                ("src-2".to_string(), "/dev/X".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_strings_encode_replica_slots() {
        let job = job_from_json(
            br#"[{"name":"src","exec":{"path":"swift://acc/bin/prog.nexe"},"count":2,
                 "file_list":[{"device":"stdout"},
                              {"device":"X","path":"zvm://dst/Y"}]},
                {"name":"dst","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"stdout"}]}]"#,
        )
        .unwrap();
        let images = HashMap::new();
        let mut planner = planner(&images);
        planner
            .plan(&job, false, None, 1, &MockLister::new())
            .await
            .unwrap();
        planner.wire_network("udp:10.0.0.1:5000");
        let dst_id = planner.nodes["dst"].id;
        let src1 = &planner.nodes["src-1"];
        assert_eq!(src1.connect.len(), 1);
        assert!(src1.connect[0].starts_with(&format!("tcp:{}:,", dst_id)));
        assert!(src1.connect[0].contains("/dev/Y"));
        assert_eq!(src1.name_service.as_deref(), Some("udp:10.0.0.1:5000"));
        let dst = &planner.nodes["dst"];
        assert_eq!(dst.bind.len(), 2);
        assert!(dst.bind[0].contains(":0,"));
    }

    #[tokio::test]
    async fn test_self_connect_rejected() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"stdout"}],"connect":["a"]}]"#,
        )
        .unwrap();
        let images = HashMap::new();
        let mut planner = planner(&images);
        let err = planner
            .plan(&job, false, None, 1, &MockLister::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Cannot bind to itself"));
    }

    #[tokio::test]
    async fn test_unknown_peer_rejected() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"stdout"}],"connect":["ghost"]}]"#,
        )
        .unwrap();
        let images = HashMap::new();
        let mut planner = planner(&images);
        let err = planner
            .plan(&job, false, None, 1, &MockLister::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Non-existing node in connect"));
    }

    #[tokio::test]
    async fn test_invalid_count_rejected() {
        for bad in [r#""two""#, "0", "-1", "1.5"] {
            let raw = format!(
                r#"[{{"name":"a","exec":{{"path":"swift://acc/bin/prog.nexe"}},"count":{},
                     "file_list":[{{"device":"stdout"}}]}}]"#,
                bad
            );
            let job = job_from_json(raw.as_bytes()).unwrap();
            let images = HashMap::new();
            let mut planner = planner(&images);
            let err = planner
                .plan(&job, false, None, 1, &MockLister::new())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("Invalid node count"), "count={}", bad);
        }
    }

    #[tokio::test]
    async fn test_writable_top_channel_upgrades_replicate() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"output","path":"swift://acc/out/res"}]}]"#,
        )
        .unwrap();
        let images = HashMap::new();
        let mut planner = planner(&images);
        planner
            .plan(&job, false, Some("acc"), 3, &MockLister::new())
            .await
            .unwrap();
        let worker = &planner.nodes["a"];
        assert_eq!(worker.replicate, 3);
        assert_eq!(worker.path_info.as_deref(), Some("/acc/out/res"));
        assert_eq!(planner.total_count, 3);
    }

    #[tokio::test]
    async fn test_user_image_channel_appended() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"stdout"}]}]"#,
        )
        .unwrap();
        let images = HashMap::new();
        let mut planner = planner(&images);
        planner
            .plan(&job, true, Some("acc"), 1, &MockLister::new())
            .await
            .unwrap();
        let worker = &planner.nodes["a"];
        let image = worker.channels.last().unwrap();
        assert_eq!(image.device, "image");
        assert!(image.access.is_cdr());
        assert_eq!(image.removable, "yes");
    }

    #[tokio::test]
    async fn test_replicas_spaced_by_node_count() {
        let job = job_from_json(
            br#"[{"name":"a","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"output","path":"swift://acc/out/res"}]},
                {"name":"b","exec":{"path":"swift://acc/bin/prog.nexe"},
                 "file_list":[{"device":"stdout"}]}]"#,
        )
        .unwrap();
        let images = HashMap::new();
        let mut planner = planner(&images);
        planner
            .plan(&job, false, Some("acc"), 3, &MockLister::new())
            .await
            .unwrap();
        planner.make_replicas();
        let a = &planner.nodes["a"];
        assert_eq!(a.replicas.len(), 2);
        assert_eq!(a.replicas[0].id, a.id + 2);
        assert_eq!(a.replicas[1].id, a.id + 4);
        assert!(a.replicas[0].replicas.is_empty());
    }

    #[test]
    fn test_project_wildcards() {
        let out = project_wildcards(
            "swift://acc/out/*-*.done",
            &["part1".to_string(), "x".to_string()],
        )
        .unwrap();
        assert_eq!(out, "swift://acc/out/part1-x.done");
        assert!(project_wildcards("swift://acc/out/*-*", &["a".to_string()]).is_err());
    }

    #[test]
    fn test_wildcard_mask_captures() {
        let mask = wildcard_mask("/acc/c/part*", true).unwrap();
        assert_eq!(capture_wildcards(&mask, "/acc/c/part42"), vec!["42"]);
    }
}
