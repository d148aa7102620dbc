//! Streaming Tar Framing
//!
//! Worker payloads travel as plain ustar streams: one member per data
//! source, padded to the 512-byte block boundary, no end-of-archive
//! blocks (the advertised Content-Length covers members only). The
//! framer produces header and padding bytes for fan-out writes; the
//! demuxer incrementally parses a response stream back into members.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

use crate::error::{Error, Result};

/// Tar block size
pub const BLOCKSIZE: usize = 512;

static ZERO_BLOCK: [u8; BLOCKSIZE] = [0u8; BLOCKSIZE];

/// Serialized ustar header for one regular member
pub fn member_header(name: &str, size: u64) -> Result<Bytes> {
    let mut header = tar::Header::new_ustar();
    header
        .set_path(name)
        .map_err(|e| Error::Internal(format!("bad tar member name {}: {}", name, e)))?;
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    Ok(Bytes::copy_from_slice(header.as_bytes()))
}

/// Zero padding that completes the member payload to a block boundary
pub fn member_padding(size: u64) -> Bytes {
    let remainder = (size % BLOCKSIZE as u64) as usize;
    if remainder == 0 {
        Bytes::new()
    } else {
        Bytes::from_static(&ZERO_BLOCK[..BLOCKSIZE - remainder])
    }
}

/// Total archive cost of a member: header plus padded payload
pub fn member_total(size: u64) -> u64 {
    BLOCKSIZE as u64 + size + member_padding(size).len() as u64
}

/// One member parsed from a response stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarMember {
    pub name: String,
    pub size: u64,
}

/// Incremental tar parser over a chunked byte stream.
///
/// Drive it by alternating `next_member` and `read_chunk` until the
/// member is drained; `next_member` skips any unread remainder of the
/// previous member.
pub struct TarDemuxer<S> {
    stream: S,
    buffer: BytesMut,
    /// Payload bytes left in the current member
    remaining: u64,
    /// Padding after the current member
    padding: usize,
    done: bool,
}

impl<S> TarDemuxer<S>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            remaining: 0,
            padding: 0,
            done: false,
        }
    }

    /// Parse the next member header; `None` at end of stream or on an
    /// end-of-archive zero block
    pub async fn next_member(&mut self) -> Result<Option<TarMember>> {
        // drain whatever is left of the previous member
        while self.remaining > 0 {
            if self.read_chunk().await?.is_none() {
                return Err(Error::ClientDisconnect(
                    "tar member truncated".to_string(),
                ));
            }
        }
        if !self.fill(BLOCKSIZE + self.padding).await? {
            return Ok(None);
        }
        let _ = self.buffer.split_to(self.padding);
        self.padding = 0;
        let block = self.buffer.split_to(BLOCKSIZE);
        if block.iter().all(|b| *b == 0) {
            self.done = true;
            return Ok(None);
        }
        let mut header = tar::Header::new_old();
        header.as_mut_bytes().copy_from_slice(&block);
        let name = header
            .path()
            .map_err(|e| Error::Internal(format!("bad tar header: {}", e)))?
            .to_string_lossy()
            .into_owned();
        let size = header
            .entry_size()
            .map_err(|e| Error::Internal(format!("bad tar size: {}", e)))?;
        self.remaining = size;
        self.padding = member_padding(size).len();
        Ok(Some(TarMember { name, size }))
    }

    /// Next payload chunk of the current member; `None` once drained
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if self.buffer.is_empty() {
            match self.stream.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => {
                    return Err(Error::ClientDisconnect(
                        "tar member truncated".to_string(),
                    ))
                }
            }
        }
        let take = (self.remaining as usize).min(self.buffer.len());
        self.remaining -= take as u64;
        Ok(Some(self.buffer.split_to(take).freeze()))
    }

    /// Buffer at least `want` bytes; false at a clean end of stream
    async fn fill(&mut self, want: usize) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        while self.buffer.len() < want {
            match self.stream.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None if self.buffer.len() <= self.padding => return Ok(false),
                None => {
                    return Err(Error::ClientDisconnect(
                        "tar stream truncated".to_string(),
                    ))
                }
            }
        }
        Ok(true)
    }
}
