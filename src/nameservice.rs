//! Rendezvous Name Service
//!
//! Transient per-job UDP service that collects peer bind/connect
//! registrations and answers each peer with a resolved (ip, port)
//! table once every peer has reported.
//!
//! Wire format, all big-endian:
//! registration = peer_id:u32, bind_count:u32, connect_count:u32,
//! then bind_count records of (connecting_peer_id:u32, port:u16),
//! then connect_count 6-byte placeholders whose first 4 bytes carry
//! connecting_peer_id:u32. The reply is the same buffer with each
//! placeholder overwritten in place as (ipv4:4 bytes, port:u16).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

const INT_SIZE: usize = 4;
const INPUT_RECORD_SIZE: usize = 6;
const OUTPUT_RECORD_SIZE: usize = 6;
const MAX_DATAGRAM: usize = 65535;

/// UDP rendezvous service; lifetime equals one job
pub struct NameService {
    port: u16,
    handle: JoinHandle<()>,
}

impl NameService {
    /// Bind an ephemeral UDP port and start listening for `peers`
    /// registrations
    pub async fn start(peers: u32) -> Result<NameService> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::Network(format!("Cannot bind name service: {}", e)))?;
        let port = socket
            .local_addr()
            .map_err(|e| Error::Network(format!("Cannot bind name service: {}", e)))?
            .port();
        let socket = Arc::new(socket);
        let handle = tokio::spawn(run(socket, peers));
        Ok(NameService { port, handle })
    }

    /// Port the service listens on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Kill the listener task and release the socket; in-flight
    /// replies are best-effort
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for NameService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(socket: Arc<UdpSocket>, peers: u32) {
    let mut bind_map: HashMap<u32, HashMap<u32, u16>> = HashMap::new();
    let mut conn_map: HashMap<u32, (u32, usize, Vec<u8>)> = HashMap::new();
    let mut peer_map: HashMap<u32, SocketAddr> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer_address) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!("Name service recv error: {}", e);
                continue;
            }
        };
        let message = &buf[..len];
        if let Err(e) = register(
            message,
            peer_address,
            &mut bind_map,
            &mut conn_map,
            &mut peer_map,
        ) {
            tracing::warn!("Bad name service registration from {}: {}", peer_address, e);
            continue;
        }
        if peer_map.len() as u32 == peers {
            for (peer_id, (connect_count, offset, reply)) in conn_map.iter_mut() {
                match resolve(*peer_id, *connect_count, *offset, reply, &bind_map, &peer_map) {
                    Ok(()) => {
                        let target = peer_map[peer_id];
                        if let Err(e) = socket.send_to(reply, target).await {
                            tracing::warn!("Name service send to {} failed: {}", target, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Cannot resolve peer {}: {}", peer_id, e);
                    }
                }
            }
            tracing::debug!("Name service answered {} peers", peers);
        }
    }
}

fn register(
    message: &[u8],
    peer_address: SocketAddr,
    bind_map: &mut HashMap<u32, HashMap<u32, u16>>,
    conn_map: &mut HashMap<u32, (u32, usize, Vec<u8>)>,
    peer_map: &mut HashMap<u32, SocketAddr>,
) -> Result<()> {
    if message.len() < 3 * INT_SIZE {
        return Err(Error::Network("registration too short".to_string()));
    }
    let peer_id = BigEndian::read_u32(&message[0..]);
    let bind_count = BigEndian::read_u32(&message[INT_SIZE..]) as usize;
    let connect_count = BigEndian::read_u32(&message[2 * INT_SIZE..]);
    let mut offset = 3 * INT_SIZE;
    if message.len() < offset + bind_count * INPUT_RECORD_SIZE + connect_count as usize * OUTPUT_RECORD_SIZE
    {
        return Err(Error::Network("registration truncated".to_string()));
    }
    for _ in 0..bind_count {
        let connecting_host = BigEndian::read_u32(&message[offset..]);
        let port = BigEndian::read_u16(&message[offset + INT_SIZE..]);
        bind_map
            .entry(peer_id)
            .or_default()
            .insert(connecting_host, port);
        offset += INPUT_RECORD_SIZE;
    }
    conn_map.insert(peer_id, (connect_count, offset, message.to_vec()));
    peer_map.insert(peer_id, peer_address);
    Ok(())
}

fn resolve(
    peer_id: u32,
    connect_count: u32,
    mut offset: usize,
    reply: &mut [u8],
    bind_map: &HashMap<u32, HashMap<u32, u16>>,
    peer_map: &HashMap<u32, SocketAddr>,
) -> Result<()> {
    let own_ip = peer_map[&peer_id].ip();
    for _ in 0..connect_count {
        let connecting_host = BigEndian::read_u32(&reply[offset..]);
        let port = bind_map
            .get(&connecting_host)
            .and_then(|m| m.get(&peer_id))
            .copied()
            .ok_or_else(|| {
                Error::Network(format!(
                    "no bind slot for {} -> {}",
                    connecting_host, peer_id
                ))
            })?;
        let target = peer_map
            .get(&connecting_host)
            .ok_or_else(|| Error::Network(format!("unknown peer {}", connecting_host)))?;
        let mut connect_to = match target.ip() {
            std::net::IpAddr::V4(ip) => ip.octets(),
            std::net::IpAddr::V6(_) => {
                return Err(Error::Network("ipv6 peers are not supported".to_string()))
            }
        };
        if target.ip() == own_ip {
            // both ends on the same host
            connect_to = [127, 0, 0, 1];
        }
        reply[offset..offset + 4].copy_from_slice(&connect_to);
        BigEndian::write_u16(&mut reply[offset + 4..], port);
        offset += OUTPUT_RECORD_SIZE;
    }
    Ok(())
}
