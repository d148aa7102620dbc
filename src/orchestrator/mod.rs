//! Execution Orchestrator
//!
//! Fans a planned job out to the storage cluster's worker hosts:
//! assembles per-worker data sources, opens one backend connection per
//! worker and replica, streams a multiplexed archive of inputs into
//! all of them, demultiplexes each response archive into object PUTs
//! or the client-visible body, and aggregates per-worker diagnostics
//! into one response.

pub mod backend;
pub mod source;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::{future, StreamExt};
use md5::{Digest, Md5};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::StratorunConfig;
use crate::daemon::DaemonMatcher;
use crate::error::{Error, Result};
use crate::job::Worker;
use crate::nameservice::NameService;
use crate::planner::ClusterPlanner;
use crate::storage::{BackendHost, ByteStream, ObjectResponse, StorageBackend};
use crate::tarball::{member_header, member_padding, member_total, TarDemuxer};

use backend::{connect_exec, ExecConnection, Handshake, ResponseHead, Sender};
use source::{DataSource, FinalBody};

/// Content type of the multiplexed worker payload
pub const TAR_MIME: &str = "application/x-tar";
/// Accepted tar submission content types
pub const TAR_MIMES: [&str; 3] = ["application/x-tar", "application/x-gtar", "application/x-ustar"];

/// Largest single streamed member
const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024 + 2;

/// Diagnostic headers aggregated across workers
const NEXE_HEADERS: [&str; 6] = [
    "x-nexe-system",
    "x-nexe-status",
    "x-nexe-retcode",
    "x-nexe-etag",
    "x-nexe-validation",
    "x-nexe-cdr-line",
];

/// Queue depth of each sender task
const PUT_QUEUE_DEPTH: usize = 10;

/// Outcome of one executed job, ready to render as an HTTP response
pub struct JobOutcome {
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: Option<ByteStream>,
    /// One accounting line per worker, in worker order
    pub cdr_lines: Vec<String>,
}

impl std::fmt::Debug for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOutcome")
            .field("headers", &self.headers)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("body", &self.body.as_ref().map(|_| "<stream>"))
            .field("cdr_lines", &self.cdr_lines)
            .finish()
    }
}

/// One backend connection being driven through the job
struct Connection {
    worker: Worker,
    order: usize,
    nexe_headers: HashMap<String, String>,
    conn: Option<ExecConnection>,
    early: Option<ResponseHead>,
    sender: Option<Sender>,
    error: Option<String>,
    daemon_hit: bool,
    immediate: Option<(Vec<u8>, String)>,
}

impl Connection {
    fn new(worker: Worker, order: usize) -> Self {
        let nexe_headers = HashMap::from([
            ("x-nexe-system".to_string(), worker.name.clone()),
            ("x-nexe-status".to_string(), "ZeroVM did not run".to_string()),
            ("x-nexe-retcode".to_string(), "0".to_string()),
            ("x-nexe-etag".to_string(), String::new()),
            ("x-nexe-validation".to_string(), "0".to_string()),
            (
                "x-nexe-cdr-line".to_string(),
                "0.0 0.0 0 0 0 0 0 0 0 0".to_string(),
            ),
        ]);
        Self {
            worker,
            order,
            nexe_headers,
            conn: None,
            early: None,
            sender: None,
            error: None,
            daemon_hit: false,
            immediate: None,
        }
    }
}

/// Drives planned jobs against the storage cluster
pub struct Orchestrator {
    config: Arc<StratorunConfig>,
    storage: Arc<dyn StorageBackend>,
    daemons: Arc<DaemonMatcher>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<StratorunConfig>,
        storage: Arc<dyn StorageBackend>,
        daemons: Arc<DaemonMatcher>,
    ) -> Self {
        Self {
            config,
            storage,
            daemons,
        }
    }

    fn conn_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.conn_timeout_secs)
    }

    fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.node_timeout_secs)
    }

    fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeouts.client_timeout_secs)
    }

    /// Execute a planned job and aggregate the result.
    ///
    /// `user_image` carries the shared image body when the submission
    /// included one; `exe_resp` reuses an already-fetched executable.
    pub async fn execute(
        &self,
        planner: &mut ClusterPlanner<'_>,
        account: &str,
        txn_id: &str,
        user_image: Option<(u64, ByteStream)>,
        exe_resp: Option<(String, ObjectResponse)>,
    ) -> Result<JobOutcome> {
        let total_count = planner.total_count;

        // advertised to workers and used to try co-located hosts first
        let own_address = self.own_address().await?;

        // the name service exists for the duration of multi-node jobs
        // and is torn down on every exit path via Drop
        let name_service = if total_count > 1 {
            let service = NameService::start(total_count).await?;
            planner.wire_network(&format!("udp:{}:{}", own_address, service.port()));
            planner.make_replicas();
            Some(service)
        } else {
            None
        };

        let default_path_info = format!("/{}", account);
        let mut workers = planner.take_workers();
        for worker in &mut workers {
            if worker.path_info.is_none() {
                worker.path_info = Some(default_path_info.clone());
            }
        }

        // step 1: data source assembly
        let mut sources: Vec<DataSource> = Vec::new();
        let mut exe_resp = exe_resp;
        for wi in 0..workers.len() {
            let mut sysmap = DataSource::from_bytes(workers[wi].sysmap_json());
            sysmap.add_fanout(workers[wi].id, "sysmap");
            sources.push(sysmap);
            for replica in &workers[wi].replicas {
                let mut sysmap = DataSource::from_bytes(replica.sysmap_json());
                sysmap.add_fanout(replica.id, "sysmap");
                sources.push(sysmap);
            }
            let worker_id = workers[wi].id;
            let replica_ids: Vec<u32> = workers[wi].replicas.iter().map(|r| r.id).collect();
            for (device, path) in self.remote_objects(&workers[wi]) {
                let existing = sources
                    .iter()
                    .position(|s| s.key.as_deref() == Some(path.as_str()));
                let index = match existing {
                    Some(index) => index,
                    None => {
                        let reused = match exe_resp.take() {
                            Some((exe_path, resp)) if exe_path == path => Some(resp),
                            other => {
                                exe_resp = other;
                                None
                            }
                        };
                        let response = match reused {
                            Some(resp) => resp,
                            None => {
                                let validate =
                                    self.config.execution.prevalidate && device == "boot";
                                self.storage
                                    .get_object(&path, self.config.execution.uses_newest, validate)
                                    .await?
                            }
                        };
                        if response.status >= 300 {
                            return Err(Error::Backend {
                                status: response.status,
                                reason: String::new(),
                                body: format!(
                                    "Error {} while fetching {}",
                                    response.status, path
                                ),
                            });
                        }
                        sources.push(DataSource::from_object(&path, response));
                        sources.len() - 1
                    }
                };
                sources[index].add_fanout(worker_id, &device);
                for replica_id in &replica_ids {
                    sources[index].add_fanout(*replica_id, &device);
                }
                if device == "boot" && sources[index].valid {
                    workers[wi].skip_validation = true;
                }
            }
        }
        if let Some((content_length, body)) = user_image {
            let mut image = DataSource::from_stream(content_length, body);
            for worker in &workers {
                image.add_fanout(worker.id, "image");
                for replica in &worker.replicas {
                    image.add_fanout(replica.id, "image");
                }
            }
            sources.push(image);
        }

        // step 2: size precomputation
        let mut sizes: HashMap<u32, u64> = HashMap::new();
        for src in &sources {
            for fanout in &src.fanout {
                *sizes.entry(fanout.worker_id).or_insert(0) +=
                    member_total(src.content_length);
            }
        }

        // step 3: placement and parallel backend connects
        let mut connections = self
            .open_connections(&workers, &sizes, account, txn_id, &own_address)
            .await?;

        // a 4xx from a worker host is surfaced verbatim
        for conn in &connections {
            if let (Some(error), Some(early)) = (&conn.error, &conn.early) {
                return Err(Error::Backend {
                    status: early.status,
                    reason: early.reason.clone(),
                    body: error.clone(),
                });
            }
        }

        // step 4: multiplexed streaming
        self.stream_sources(&mut connections, sources).await?;

        // step 5: response collection
        let mut collected: Vec<Connection> = future::join_all(
            connections
                .into_iter()
                .map(|conn| self.process_response(conn)),
        )
        .await;
        collected.sort_by_key(|c| c.order);

        // step 6: aggregate response
        let outcome = self.aggregate(collected, txn_id);
        if let Some(service) = &name_service {
            service.stop();
        }
        Ok(outcome)
    }

    /// Readable storage channels (the executable included) this worker
    /// needs streamed in, as (device, object path) pairs
    fn remote_objects(&self, worker: &Worker) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(path) = worker.exe.as_storage() {
            out.push(("boot".to_string(), path.path()));
        }
        for channel in &worker.channels {
            if !channel.access.reads_data() {
                continue;
            }
            if self
                .config
                .execution
                .sysimage_devices
                .contains_key(&channel.device)
            {
                continue;
            }
            if let Some(path) = channel.path.as_ref().and_then(|p| p.as_storage()) {
                if !path.object.is_empty() {
                    out.push((channel.device.clone(), path.path()));
                }
            }
        }
        out
    }

    async fn own_address(&self) -> Result<String> {
        if let Some(hostname) = &self.config.name_service.hostname {
            return Ok(hostname.clone());
        }
        // learn the local address by dialing a cluster host
        let hosts = self.storage.hosts_for_partition(0);
        if let Some(host) = hosts.first() {
            let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
            if socket
                .connect((host.ip.as_str(), host.port))
                .await
                .is_ok()
            {
                if let Ok(addr) = socket.local_addr() {
                    return Ok(addr.ip().to_string());
                }
            }
        }
        Ok("127.0.0.1".to_string())
    }

    async fn open_connections(
        &self,
        workers: &[Worker],
        sizes: &HashMap<u32, u64>,
        account: &str,
        txn_id: &str,
        own_address: &str,
    ) -> Result<Vec<Connection>> {
        let error_limited: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut attempts = Vec::new();
        for (order, worker) in workers.iter().enumerate() {
            let headers = self.exec_headers(worker, account, txn_id);
            let placement = self.placement_for(worker);
            attempts.push(self.connect_worker(
                worker.clone(),
                order,
                placement,
                headers.clone(),
                sizes.get(&worker.id).copied().unwrap_or(0),
                Arc::clone(&error_limited),
                own_address,
            ));
            for replica in &worker.replicas {
                let placement = self.placement_for(replica);
                attempts.push(self.connect_worker(
                    replica.clone(),
                    order,
                    placement,
                    headers.clone(),
                    sizes.get(&replica.id).copied().unwrap_or(0),
                    Arc::clone(&error_limited),
                    own_address,
                ));
            }
        }
        let total = attempts.len();
        let connections: Vec<Connection> = future::join_all(attempts)
            .await
            .into_iter()
            .flatten()
            .collect();
        if connections.len() < total {
            tracing::error!("Cannot find suitable host to execute job on");
            return Err(Error::NoCapacity);
        }
        Ok(connections)
    }

    /// Partition for a worker: hash-derived from its path info when it
    /// names an object, uniformly random otherwise
    fn placement_for(&self, worker: &Worker) -> u64 {
        let path_info = worker.path_info.as_deref().unwrap_or("/");
        let parts: Vec<&str> = path_info.trim_start_matches('/').splitn(3, '/').collect();
        if parts.len() == 3 && parts.iter().all(|p| !p.is_empty()) {
            self.storage.partition_for(parts[0], parts[1], parts[2])
        } else {
            rand::random::<u64>() % self.storage.partition_count().max(1)
        }
    }

    fn exec_headers(&self, worker: &Worker, account: &str, txn_id: &str) -> Vec<(String, String)> {
        let now = Utc::now();
        let timestamp = format!(
            "{:010}.{:05}",
            now.timestamp(),
            now.timestamp_subsec_micros() / 10
        );
        let pool = if worker.connect_peers.is_empty() && worker.bind_peers.is_empty() {
            "default"
        } else {
            "cluster"
        };
        let mut headers = vec![
            ("Content-Type".to_string(), TAR_MIME.to_string()),
            ("x-account-name".to_string(), account.to_string()),
            ("x-timestamp".to_string(), timestamp),
            (
                "x-zerovm-valid".to_string(),
                if worker.skip_validation {
                    "true".to_string()
                } else {
                    "false".to_string()
                },
            ),
            ("x-zerovm-pool".to_string(), pool.to_string()),
            ("x-trans-id".to_string(), txn_id.to_string()),
        ];
        if let Some(socket) = self.daemons.match_worker(worker) {
            headers.push(("x-zerovm-daemon".to_string(), socket.to_string()));
        }
        headers
    }

    async fn connect_worker(
        &self,
        worker: Worker,
        order: usize,
        partition: u64,
        headers: Vec<(String, String)>,
        content_length: u64,
        error_limited: Arc<Mutex<HashSet<String>>>,
        own_address: &str,
    ) -> Option<Connection> {
        let path_info = worker
            .path_info
            .clone()
            .unwrap_or_else(|| "/".to_string());
        let hosts = local_first(self.storage.hosts_for_partition(partition), own_address);
        for host in hosts {
            let key = format!("{}:{}", host.ip, host.port);
            if error_limited.lock().unwrap().contains(&key) {
                continue;
            }
            let outcome = connect_exec(
                &host,
                partition,
                &path_info,
                &headers,
                content_length,
                self.conn_timeout(),
                self.node_timeout(),
            )
            .await;
            match outcome {
                Handshake::Ready(conn) => {
                    let mut connection = Connection::new(worker, order);
                    connection.conn = Some(conn);
                    return Some(connection);
                }
                Handshake::Early(conn, head) => {
                    let mut connection = Connection::new(worker, order);
                    connection.conn = Some(conn);
                    connection.early = Some(head);
                    return Some(connection);
                }
                Handshake::ClientError(head, body) => {
                    let mut connection = Connection::new(worker, order);
                    connection.error = Some(String::from_utf8_lossy(&body).into_owned());
                    connection.early = Some(head);
                    return Some(connection);
                }
                Handshake::HostFailed {
                    insufficient_storage,
                    reason,
                } => {
                    if insufficient_storage {
                        tracing::error!("Insufficient storage on {}", key);
                        error_limited.lock().unwrap().insert(key.clone());
                    } else {
                        tracing::warn!("Worker host failed: {}", reason);
                    }
                }
            }
        }
        None
    }

    async fn stream_sources(
        &self,
        connections: &mut [Connection],
        sources: Vec<DataSource>,
    ) -> Result<()> {
        // one sender per streaming connection; early responders are
        // never written to
        let mut by_worker: HashMap<u32, usize> = HashMap::new();
        for (index, conn) in connections.iter_mut().enumerate() {
            by_worker.insert(conn.worker.id, index);
            if conn.early.is_none() {
                if let Some(writer) = conn.conn.as_mut().and_then(|c| c.take_writer()) {
                    conn.sender = Some(Sender::spawn(writer, PUT_QUEUE_DEPTH));
                }
            }
        }

        for mut src in sources {
            let fanout: Vec<(usize, String)> = src
                .fanout
                .iter()
                .filter_map(|f| by_worker.get(&f.worker_id).map(|i| (*i, f.device.clone())))
                .collect();
            for (conn_index, device) in &fanout {
                let header = member_header(device, src.content_length)?;
                if let Some(sender) = &connections[*conn_index].sender {
                    if !sender.failed() {
                        sender.send(header).await?;
                    }
                }
            }
            let mut transferred: u64 = 0;
            loop {
                let chunk = match tokio::time::timeout(self.client_timeout(), src.next_chunk())
                    .await
                {
                    Err(_) => {
                        tracing::warn!(
                            "Client read timeout ({}s)",
                            self.config.timeouts.client_timeout_secs
                        );
                        return Err(Error::ClientTimeout(
                            self.config.timeouts.client_timeout_secs,
                        ));
                    }
                    Ok(None) => break,
                    Ok(Some(chunk)) => chunk?,
                };
                transferred += chunk.len() as u64;
                if transferred > MAX_FILE_SIZE {
                    return Err(Error::ConfigTooLarge(MAX_FILE_SIZE as usize));
                }
                for (conn_index, _) in &fanout {
                    if let Some(sender) = &connections[*conn_index].sender {
                        if !sender.failed() {
                            sender.send(chunk.clone()).await?;
                        }
                    }
                }
            }
            if transferred < src.content_length {
                return Err(Error::ClientDisconnect(format!(
                    "data source ended after {} of {} bytes",
                    transferred, src.content_length
                )));
            }
            let padding = member_padding(src.content_length);
            if !padding.is_empty() {
                for (conn_index, _) in &fanout {
                    if let Some(sender) = &connections[*conn_index].sender {
                        if !sender.failed() {
                            sender.send(padding.clone()).await?;
                        }
                    }
                }
            }
        }

        for conn in connections.iter_mut() {
            if let Some(sender) = conn.sender.take() {
                sender.join().await?;
            }
        }
        Ok(())
    }

    async fn process_response(&self, mut conn: Connection) -> Connection {
        if conn.error.is_some() {
            return conn;
        }
        let head = match conn.early.take() {
            Some(head) => head,
            None => {
                let inner = match conn.conn.as_mut() {
                    Some(inner) => inner,
                    None => return conn,
                };
                match inner.read_head(self.node_timeout()).await {
                    Ok(head) => head,
                    Err(e) => {
                        tracing::warn!(
                            "Trying to get final status for {}: {}",
                            conn.worker.name,
                            e
                        );
                        conn.error = Some(format!(
                            "Timeout: trying to get final status of POST for {}",
                            conn.worker.name
                        ));
                        return conn;
                    }
                }
            }
        };
        if head.status != 200 {
            let body = match conn.conn.as_mut() {
                Some(inner) => inner
                    .read_bounded_body(head.content_length(), self.node_timeout())
                    .await
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            conn.error = Some(format!(
                "{} {} {}",
                head.status,
                head.reason,
                String::from_utf8_lossy(&body)
            ));
            return conn;
        }
        for key in NEXE_HEADERS {
            if let Some(value) = head.header(key) {
                conn.nexe_headers.insert(key.to_string(), value.to_string());
            }
        }
        if head.header("x-zerovm-daemon").is_some() {
            conn.daemon_hit = true;
        }
        let content_length = head.content_length();
        if content_length == Some(0) {
            return conn;
        }
        let inner = match conn.conn.take() {
            Some(inner) => inner,
            None => return conn,
        };
        let body = inner.into_body_stream(
            content_length,
            self.config.execution.chunk_size,
            self.node_timeout(),
        );
        let mut demux = TarDemuxer::new(body);
        loop {
            let member = match demux.next_member().await {
                Ok(Some(member)) => member,
                Ok(None) => break,
                Err(e) => {
                    conn.error = Some(e.to_string());
                    break;
                }
            };
            if member.name == "sysmap" {
                let mut data = Vec::with_capacity(member.size as usize);
                loop {
                    match demux.read_chunk().await {
                        Ok(Some(chunk)) => data.extend_from_slice(&chunk),
                        Ok(None) => break,
                        Err(e) => {
                            conn.error = Some(e.to_string());
                            return conn;
                        }
                    }
                }
                if let Err(e) = conn.worker.apply_sysmap_update(&data) {
                    conn.error = Some(e.to_string());
                    return conn;
                }
                continue;
            }
            let channel = match conn.worker.channel(&member.name) {
                Some(channel) => channel.clone(),
                None => {
                    conn.error = Some(format!("Channel name {} not found", member.name));
                    return conn;
                }
            };
            match channel.path.as_ref().and_then(|p| p.as_storage()) {
                Some(path) => {
                    let dest = path.path();
                    let (tx, rx) = mpsc::channel::<Bytes>(2);
                    let body: ByteStream = Box::pin(ReceiverStream::new(rx).map(Ok));
                    let put = self.storage.put_object(
                        &dest,
                        &channel.content_type,
                        &channel.meta,
                        member.size,
                        body,
                    );
                    let feed = async {
                        loop {
                            match demux.read_chunk().await {
                                Ok(Some(chunk)) => {
                                    if tx.send(chunk).await.is_err() {
                                        break Ok(());
                                    }
                                }
                                Ok(None) => break Ok(()),
                                Err(e) => break Err(e),
                            }
                        }
                    };
                    let (put_status, feed_result) = tokio::join!(put, feed);
                    if let Err(e) = feed_result {
                        conn.error = Some(e.to_string());
                        return conn;
                    }
                    match put_status {
                        Ok(status) if status < 300 => {}
                        Ok(status) => {
                            conn.error =
                                Some(format!("Status {} when putting {}", status, dest));
                            return conn;
                        }
                        Err(e) => {
                            conn.error = Some(e.to_string());
                            return conn;
                        }
                    }
                }
                None => {
                    let mut data = Vec::with_capacity(member.size as usize);
                    loop {
                        match demux.read_chunk().await {
                            Ok(Some(chunk)) => data.extend_from_slice(&chunk),
                            Ok(None) => break,
                            Err(e) => {
                                conn.error = Some(e.to_string());
                                return conn;
                            }
                        }
                    }
                    // the first immediate-response channel supplies the
                    // client body; later ones are drained
                    if conn.immediate.is_none() {
                        conn.immediate = Some((data, channel.content_type.clone()));
                    }
                }
            }
        }
        conn
    }

    fn aggregate(&self, connections: Vec<Connection>, txn_id: &str) -> JobOutcome {
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut merged: HashMap<String, String> = HashMap::new();
        let mut cached = false;
        let mut body: Option<FinalBody> = None;
        let mut content_type = None;
        let mut content_length: u64 = 0;
        let mut cdr_lines = Vec::new();
        for mut conn in connections {
            if let Some(error) = &conn.error {
                conn.nexe_headers
                    .insert("x-nexe-error".to_string(), error.replace('\n', ""));
            }
            cdr_lines.push(format!(
                "{} {} {} ({}) [{}]\n",
                Utc::now().format("%Y-%m-%d %H:%M:%S"),
                txn_id,
                conn.nexe_headers["x-nexe-system"],
                conn.nexe_headers["x-nexe-cdr-line"],
                conn.nexe_headers["x-nexe-status"],
            ));
            for (key, value) in &conn.nexe_headers {
                merged
                    .entry(key.clone())
                    .and_modify(|existing| {
                        existing.push(',');
                        existing.push_str(value);
                    })
                    .or_insert_with(|| value.clone());
            }
            if conn.daemon_hit {
                cached = true;
            }
            if let Some((data, ctype)) = conn.immediate.take() {
                if !data.is_empty() {
                    content_length += data.len() as u64;
                    let part = source::bytes_stream(data);
                    match &mut body {
                        Some(existing) => existing.append(part),
                        None => {
                            content_type = Some(ctype);
                            body = Some(FinalBody::new(part));
                        }
                    }
                }
            }
        }
        let mut keys: Vec<String> = merged.keys().cloned().collect();
        keys.sort();
        for key in keys {
            headers.push((key.clone(), merged.remove(&key).unwrap()));
        }
        if cached {
            headers.push(("x-nexe-cached".to_string(), "true".to_string()));
        }
        let mut hasher = Md5::new();
        hasher.update(Utc::now().timestamp_micros().to_string().as_bytes());
        headers.push(("Etag".to_string(), hex::encode(hasher.finalize())));
        JobOutcome {
            headers,
            content_type,
            content_length: body.as_ref().map(|_| content_length),
            body: body.map(|b| b.into_stream()),
            cdr_lines,
        }
    }
}

/// Promote the host co-located with this gateway to the front of the
/// candidate list; the rest keep their ring order
fn local_first(mut hosts: Vec<BackendHost>, own_address: &str) -> Vec<BackendHost> {
    if let Some(pos) = hosts.iter().position(|h| h.ip == own_address) {
        let local = hosts.remove(pos);
        hosts.insert(0, local);
    }
    hosts
}
