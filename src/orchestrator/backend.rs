//! Worker Host Connections
//!
//! Hand-rolled HTTP/1.1 client for the execution fan-out. Each worker
//! (and each replica) gets one connection: headers go out with
//! `Expect: 100-continue`, the interim response classifies the host,
//! the multiplexed archive is streamed as the body, and the final
//! response carries the worker's output archive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::storage::{BackendHost, ByteStream};

/// Parsed response status line and headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

/// Outcome of the `Expect: 100-continue` handshake with one host
pub enum Handshake {
    /// 100 received, stream the body
    Ready(ExecConnection),
    /// Success without a body to stream
    Early(ExecConnection, ResponseHead),
    /// Client error surfaced verbatim to the caller
    ClientError(ResponseHead, Vec<u8>),
    /// Host unusable, try the next candidate
    HostFailed {
        insufficient_storage: bool,
        reason: String,
    },
}

/// One open connection to a worker host
pub struct ExecConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
}

/// Open a connection to `host` and run the handshake
pub async fn connect_exec(
    host: &BackendHost,
    partition: u64,
    path_info: &str,
    headers: &[(String, String)],
    content_length: u64,
    conn_timeout: Duration,
    node_timeout: Duration,
) -> Handshake {
    let addr = format!("{}:{}", host.ip, host.port);
    let stream = match timeout(conn_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Handshake::HostFailed {
                insufficient_storage: false,
                reason: format!("connect {}: {}", addr, e),
            }
        }
        Err(_) => {
            return Handshake::HostFailed {
                insufficient_storage: false,
                reason: format!("connect {}: timeout", addr),
            }
        }
    };
    let (read_half, mut write_half) = stream.into_split();
    let mut request = format!(
        "POST /{}/{}{} HTTP/1.1\r\nHost: {}\r\n",
        host.device, partition, path_info, addr
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str(&format!(
        "Content-Length: {}\r\nExpect: 100-continue\r\nConnection: close\r\n\r\n",
        content_length
    ));
    if let Err(e) = write_half.write_all(request.as_bytes()).await {
        return Handshake::HostFailed {
            insufficient_storage: false,
            reason: format!("send headers to {}: {}", addr, e),
        };
    }
    let mut conn = ExecConnection {
        reader: BufReader::new(read_half),
        writer: Some(write_half),
    };
    let head = match conn.read_head(node_timeout).await {
        Ok(head) => head,
        Err(e) => {
            return Handshake::HostFailed {
                insufficient_storage: false,
                reason: format!("expect on {}: {}", addr, e),
            }
        }
    };
    match head.status {
        100 => Handshake::Ready(conn),
        200..=299 => Handshake::Early(conn, head),
        507 => Handshake::HostFailed {
            insufficient_storage: true,
            reason: format!("{} has insufficient storage", addr),
        },
        400..=499 => {
            let body = conn
                .read_bounded_body(head.content_length(), node_timeout)
                .await
                .unwrap_or_default();
            Handshake::ClientError(head, body)
        }
        status => Handshake::HostFailed {
            insufficient_storage: false,
            reason: format!("{} failed with: {} {}", addr, status, head.reason),
        },
    }
}

impl ExecConnection {
    /// Parse a status line and headers, bounded by `node_timeout`
    pub async fn read_head(&mut self, node_timeout: Duration) -> Result<ResponseHead> {
        timeout(node_timeout, self.read_head_inner())
            .await
            .map_err(|_| Error::Network("response head timeout".to_string()))?
    }

    async fn read_head_inner(&mut self) -> Result<ResponseHead> {
        let mut line = String::new();
        self.reader.read_line(&mut line).await?;
        let mut parts = line.trim_end().splitn(3, ' ');
        let _version = parts.next().unwrap_or_default();
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Network(format!("bad status line: {:?}", line)))?;
        let reason = parts.next().unwrap_or_default().to_string();
        let mut headers = HashMap::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 || line.trim_end().is_empty() {
                break;
            }
            if let Some((name, value)) = line.trim_end().split_once(':') {
                headers.insert(name.trim().to_lowercase(), value.trim().to_string());
            }
        }
        Ok(ResponseHead {
            status,
            reason,
            headers,
        })
    }

    /// Read a body fully into memory, bounded by content length
    pub async fn read_bounded_body(
        &mut self,
        content_length: Option<u64>,
        node_timeout: Duration,
    ) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        match content_length {
            Some(len) => {
                body.resize(len as usize, 0);
                timeout(node_timeout, self.reader.read_exact(&mut body))
                    .await
                    .map_err(|_| Error::Network("response body timeout".to_string()))??;
            }
            None => {
                timeout(node_timeout, self.reader.read_to_end(&mut body))
                    .await
                    .map_err(|_| Error::Network("response body timeout".to_string()))??;
            }
        }
        Ok(body)
    }

    /// Take the write half for a sender task
    pub fn take_writer(&mut self) -> Option<OwnedWriteHalf> {
        self.writer.take()
    }

    /// Chunked body stream; each read is bounded by `node_timeout`
    pub fn into_body_stream(
        self,
        content_length: Option<u64>,
        chunk_size: usize,
        node_timeout: Duration,
    ) -> ByteStream {
        let state = (self.reader, content_length.unwrap_or(u64::MAX), false);
        Box::pin(stream::unfold(
            state,
            move |(mut reader, mut remaining, mut done)| async move {
                if done || remaining == 0 {
                    return None;
                }
                let want = chunk_size.min(remaining.min(usize::MAX as u64) as usize);
                let mut buf = vec![0u8; want];
                let read = timeout(node_timeout, reader.read(&mut buf)).await;
                match read {
                    Ok(Ok(0)) => None,
                    Ok(Ok(n)) => {
                        buf.truncate(n);
                        remaining = remaining.saturating_sub(n as u64);
                        Some((Ok(Bytes::from(buf)), (reader, remaining, done)))
                    }
                    Ok(Err(e)) => {
                        done = true;
                        Some((
                            Err(Error::Network(format!("response read: {}", e))),
                            (reader, remaining, done),
                        ))
                    }
                    Err(_) => {
                        done = true;
                        Some((
                            Err(Error::Network("response read timeout".to_string())),
                            (reader, remaining, done),
                        ))
                    }
                }
            },
        ))
    }
}

/// Handle to a per-connection sender task with a bounded queue
pub struct Sender {
    tx: Option<mpsc::Sender<Bytes>>,
    failed: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Sender {
    /// Spawn a sender draining a bounded queue into the write half
    pub fn spawn(mut writer: OwnedWriteHalf, queue_depth: usize) -> Sender {
        let (tx, mut rx) = mpsc::channel::<Bytes>(queue_depth);
        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        let handle = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if let Err(e) = writer.write_all(&chunk).await {
                    tracing::warn!("Sender write failed: {}", e);
                    flag.store(true, Ordering::SeqCst);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });
        Sender {
            tx: Some(tx),
            failed,
            handle,
        }
    }

    /// True once a write on this connection has failed
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Queue a chunk; back-pressure suspends the caller
    pub async fn send(&self, chunk: Bytes) -> Result<()> {
        if self.failed() {
            return Ok(());
        }
        if let Some(tx) = &self.tx {
            if tx.send(chunk).await.is_err() && !self.failed() {
                return Err(Error::Network("sender queue closed".to_string()));
            }
        }
        Ok(())
    }

    /// Close the queue and wait for the sender to drain
    pub async fn join(mut self) -> Result<()> {
        self.tx.take();
        self.handle
            .await
            .map_err(|e| Error::Internal(format!("sender task: {}", e)))
    }
}
