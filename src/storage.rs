//! Storage Collaborator Interface
//!
//! The middleware consumes the storage cluster through this seam:
//! account/container listings, object GET/PUT, append-style log
//! shipping and ring placement. The HTTP implementation talks to the
//! cluster proxy; tests plug in an in-memory backend.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use md5::{Digest, Md5};
use regex::Regex;

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::planner::ObjectLister;

/// Chunked object body
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// One candidate worker host from the ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHost {
    pub ip: String,
    pub port: u16,
    pub device: String,
}

impl BackendHost {
    /// Parse a config entry of the form `ip:port/device`
    pub fn parse(entry: &str) -> Result<Self> {
        let (addr, device) = entry
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("bad host entry {}", entry)))?;
        let (ip, port) = addr
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("bad host entry {}", entry)))?;
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("bad host entry {}", entry)))?;
        Ok(Self {
            ip: ip.to_string(),
            port,
            device: device.to_string(),
        })
    }
}

/// Ring placement for one worker: a partition and its candidate hosts
#[derive(Debug, Clone)]
pub struct RingPlacement {
    pub partition: u64,
    pub hosts: Vec<BackendHost>,
}

/// Container metadata the middleware cares about
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub cors_allow_origin: Option<String>,
    pub cors_expose_headers: Option<String>,
}

/// A fetched object: status, the headers the orchestrator consumes,
/// and a chunked body
pub struct ObjectResponse {
    pub status: u16,
    pub content_length: u64,
    pub content_type: String,
    /// Stored executable validation marker
    pub valid: bool,
    pub headers: HashMap<String, String>,
    pub body: ByteStream,
}

/// Storage collaborator operations consumed by the core
#[async_trait]
pub trait StorageBackend: ObjectLister {
    /// Storage replica count of the object ring
    fn replica_count(&self) -> u32;

    /// Number of ring partitions
    fn partition_count(&self) -> u64;

    /// Ring partition for an object path
    fn partition_for(&self, account: &str, container: &str, object: &str) -> u64;

    /// Candidate hosts for a partition, in ring order; the caller
    /// promotes the host co-located with the gateway to the front
    fn hosts_for_partition(&self, partition: u64) -> Vec<BackendHost>;

    /// Fetch an object; `newest` requests the newest replica,
    /// `validate` asks for the stored validation marker
    async fn get_object(&self, path: &str, newest: bool, validate: bool)
        -> Result<ObjectResponse>;

    /// Store an object from a chunked body; returns the backend status
    async fn put_object(
        &self,
        path: &str,
        content_type: &str,
        meta: &HashMap<String, String>,
        content_length: u64,
        body: ByteStream,
    ) -> Result<u16>;

    /// Append a log line batch to an accounting object
    async fn append_log(&self, path: &str, body: String) -> Result<u16>;

    /// Container metadata, CORS included
    async fn container_info(&self, account: &str, container: &str) -> Result<ContainerInfo>;
}

/// HTTP storage backend talking to the cluster proxy
pub struct HttpStorage {
    client: reqwest::Client,
    base_url: String,
    hosts: Vec<BackendHost>,
    partition_count: u64,
    replica_count: u32,
}

impl HttpStorage {
    pub fn new(base_url: &str, cluster: &ClusterConfig) -> Result<Self> {
        let hosts = cluster
            .hosts
            .iter()
            .map(|h| BackendHost::parse(h))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            hosts,
            partition_count: cluster.partition_count,
            replica_count: cluster.replica_count,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct Entry {
            name: String,
        }
        let resp = self
            .client
            .get(format!("{}?format=json", self.url(path)))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", path, e)))?;
        if resp.status().as_u16() == 204 {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(Error::Storage(path.to_string()));
        }
        let entries: Vec<Entry> = resp
            .json()
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", path, e)))?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }
}

#[async_trait]
impl ObjectLister for HttpStorage {
    async fn list_account(&self, account: &str, mask: &Regex) -> Result<Vec<String>> {
        let all = self.list(&format!("/{}", account)).await?;
        Ok(all.into_iter().filter(|n| mask.is_match(n)).collect())
    }

    async fn list_container(
        &self,
        account: &str,
        container: &str,
        mask: Option<&Regex>,
    ) -> Result<Vec<String>> {
        let all = self.list(&format!("/{}/{}", account, container)).await?;
        Ok(all
            .into_iter()
            .filter(|n| !n.ends_with('/'))
            .filter(|n| mask.map(|m| m.is_match(n)).unwrap_or(true))
            .collect())
    }
}

#[async_trait]
impl StorageBackend for HttpStorage {
    fn replica_count(&self) -> u32 {
        self.replica_count
    }

    fn partition_count(&self) -> u64 {
        self.partition_count
    }

    fn partition_for(&self, account: &str, container: &str, object: &str) -> u64 {
        ring_partition(account, container, object, self.partition_count)
    }

    fn hosts_for_partition(&self, partition: u64) -> Vec<BackendHost> {
        if self.hosts.is_empty() {
            return Vec::new();
        }
        // rotate the static host list so partitions spread the load
        let start = (partition % self.hosts.len() as u64) as usize;
        let mut out = Vec::with_capacity(self.hosts.len());
        for i in 0..self.hosts.len() {
            out.push(self.hosts[(start + i) % self.hosts.len()].clone());
        }
        out
    }

    async fn get_object(
        &self,
        path: &str,
        newest: bool,
        validate: bool,
    ) -> Result<ObjectResponse> {
        let mut req = self.client.get(self.url(path));
        if newest {
            req = req.header("X-Newest", "true");
        }
        if validate {
            req = req.header("X-Zerovm-Valid", "true");
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", path, e)))?;
        let status = resp.status().as_u16();
        let headers: HashMap<String, String> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let content_length = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let content_type = headers
            .get("content-type")
            .cloned()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let valid = headers
            .get("x-zerovm-valid")
            .map(|v| v == "true")
            .unwrap_or(false);
        let body: ByteStream = Box::pin(
            resp.bytes_stream()
                .map_err(|e| Error::Storage(format!("object read: {}", e))),
        );
        Ok(ObjectResponse {
            status,
            content_length,
            content_type,
            valid,
            headers,
            body,
        })
    }

    async fn put_object(
        &self,
        path: &str,
        content_type: &str,
        meta: &HashMap<String, String>,
        content_length: u64,
        body: ByteStream,
    ) -> Result<u16> {
        let mut req = self
            .client
            .put(self.url(path))
            .header("Content-Type", content_type)
            .header("Content-Length", content_length);
        for (key, value) in meta {
            req = req.header(format!("X-Object-Meta-{}", key), value.as_str());
        }
        let resp = req
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", path, e)))?;
        Ok(resp.status().as_u16())
    }

    async fn append_log(&self, path: &str, body: String) -> Result<u16> {
        let resp = self
            .client
            .post(self.url(path))
            .header("X-Append-To", "-1")
            .header("Content-Type", "text/plain")
            .header("Content-Length", body.len())
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", path, e)))?;
        Ok(resp.status().as_u16())
    }

    async fn container_info(&self, account: &str, container: &str) -> Result<ContainerInfo> {
        let path = format!("/{}/{}", account, container);
        let resp = self
            .client
            .head(self.url(&path))
            .send()
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", path, e)))?;
        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        Ok(ContainerInfo {
            cors_allow_origin: header("x-container-meta-access-control-allow-origin"),
            cors_expose_headers: header("x-container-meta-access-control-expose-headers"),
        })
    }
}

/// Hash an object path onto a ring partition
pub fn ring_partition(account: &str, container: &str, object: &str, partitions: u64) -> u64 {
    let mut hasher = Md5::new();
    hasher.update(format!("/{}/{}/{}", account, container, object).as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % partitions.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_entry() {
        let host = BackendHost::parse("10.0.0.5:6000/sda1").unwrap();
        assert_eq!(host.ip, "10.0.0.5");
        assert_eq!(host.port, 6000);
        assert_eq!(host.device, "sda1");
        assert!(BackendHost::parse("10.0.0.5:6000").is_err());
        assert!(BackendHost::parse("10.0.0.5/sda1").is_err());
    }

    #[test]
    fn test_ring_partition_stable_and_bounded() {
        let a = ring_partition("acc", "cont", "obj", 1024);
        let b = ring_partition("acc", "cont", "obj", 1024);
        assert_eq!(a, b);
        assert!(a < 1024);
        let c = ring_partition("acc", "cont", "other", 1024);
        assert!(a != c || a < 1024);
    }

    #[test]
    fn test_hosts_rotate_by_partition() {
        let cluster = ClusterConfig {
            hosts: vec![
                "10.0.0.1:6000/sda".to_string(),
                "10.0.0.2:6000/sda".to_string(),
                "10.0.0.3:6000/sda".to_string(),
            ],
            partition_count: 8,
            replica_count: 3,
        };
        let storage = HttpStorage::new("http://127.0.0.1:8081", &cluster).unwrap();
        let hosts = storage.hosts_for_partition(4);
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0].ip, "10.0.0.2");
        assert_eq!(hosts[1].ip, "10.0.0.3");
        assert_eq!(hosts[2].ip, "10.0.0.1");
    }
}
