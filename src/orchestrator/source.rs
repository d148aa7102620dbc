//! Job Data Sources
//!
//! Everything streamed into a worker archive is a data source: the
//! in-memory sysmap, fetched storage objects, the reused executable
//! response and the client-supplied user image. A source knows its
//! length, yields chunks once, and carries the fan-out list of
//! (worker, device) pairs it feeds.

use bytes::Bytes;
use futures::stream;
use futures::StreamExt;

use crate::error::Result;
use crate::storage::{ByteStream, ObjectResponse};

/// One (worker, device) pair fed by a data source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fanout {
    pub worker_id: u32,
    pub device: String,
}

/// A single-read chunk source with a fan-out list
pub struct DataSource {
    pub content_length: u64,
    /// Dedup key for fetched objects (the object path)
    pub key: Option<String>,
    /// Stored validation marker carried over from a fetched object
    pub valid: bool,
    pub fanout: Vec<Fanout>,
    body: ByteStream,
}

impl DataSource {
    /// In-memory source (sysmap documents)
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let bytes = Bytes::from(data);
        Self {
            content_length: bytes.len() as u64,
            key: None,
            valid: false,
            fanout: Vec::new(),
            body: Box::pin(stream::once(async move { Ok(bytes) })),
        }
    }

    /// Source backed by a fetched object response
    pub fn from_object(path: &str, response: ObjectResponse) -> Self {
        Self {
            content_length: response.content_length,
            key: Some(path.to_string()),
            valid: response.valid,
            fanout: Vec::new(),
            body: response.body,
        }
    }

    /// Source over an arbitrary chunk stream of known length
    pub fn from_stream(content_length: u64, body: ByteStream) -> Self {
        Self {
            content_length,
            key: None,
            valid: false,
            fanout: Vec::new(),
            body,
        }
    }

    /// Attach a (worker, device) pair to the fan-out list
    pub fn add_fanout(&mut self, worker_id: u32, device: &str) {
        self.fanout.push(Fanout {
            worker_id,
            device: device.to_string(),
        });
    }

    /// Next chunk of the source body
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.body.next().await
    }
}

/// Bounded look-ahead cache over a chunked body.
///
/// The cache holds the first `cache_size` bytes for sniffing (tar
/// member search, shebang parsing); the whole body can then be
/// replayed as cache plus remainder.
pub struct CachedBody {
    cache: Vec<Bytes>,
    rest: ByteStream,
}

impl CachedBody {
    /// Read up to `cache_size` bytes from `stream` into the cache
    pub async fn new(mut stream: ByteStream, cache_size: usize) -> Result<Self> {
        let mut cache = Vec::new();
        let mut cached = 0usize;
        while cached < cache_size {
            match stream.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    cached += chunk.len();
                    cache.push(chunk);
                }
                None => break,
            }
        }
        Ok(Self {
            cache,
            rest: stream,
        })
    }

    /// The buffered head of the body
    pub fn cache(&self) -> &[Bytes] {
        &self.cache
    }

    /// Buffered bytes flattened into one buffer
    pub fn cached_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in &self.cache {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Replay the full body: cache first, then the remainder.
    ///
    /// `total_size` bounds the stream, truncating long bodies and
    /// draining the remainder.
    pub fn into_stream(self, total_size: Option<u64>) -> ByteStream {
        let replay = stream::iter(self.cache.into_iter().map(Ok)).chain(self.rest);
        match total_size {
            None => Box::pin(replay),
            Some(limit) => {
                let bounded = replay.scan(limit, |left, chunk| {
                    let chunk = match chunk {
                        Ok(c) => c,
                        Err(e) => return futures::future::ready(Some(Some(Err(e)))),
                    };
                    let out = if *left == 0 {
                        // drain the tail without yielding
                        None
                    } else if (chunk.len() as u64) <= *left {
                        *left -= chunk.len() as u64;
                        Some(Ok(chunk))
                    } else {
                        let take = *left as usize;
                        *left = 0;
                        Some(Ok(chunk.slice(..take)))
                    };
                    futures::future::ready(Some(out))
                });
                Box::pin(bounded.filter_map(futures::future::ready))
            }
        }
    }
}

/// Client-visible response body concatenating worker bodies in order
pub struct FinalBody {
    parts: Vec<ByteStream>,
}

impl FinalBody {
    pub fn new(first: ByteStream) -> Self {
        Self { parts: vec![first] }
    }

    pub fn append(&mut self, part: ByteStream) {
        self.parts.push(part);
    }

    pub fn into_stream(self) -> ByteStream {
        Box::pin(stream::iter(self.parts).flatten())
    }
}

/// Byte stream over an in-memory buffer
pub fn bytes_stream(data: Vec<u8>) -> ByteStream {
    Box::pin(stream::once(async move { Ok(Bytes::from(data)) }))
}
