//! Transport abstraction and the UDP datagram transport.
//!
//! The engine is parameterized over the `Transport` capability set: post
//! sends (with partial acceptance), poll completions, poll receives,
//! register memory, report the per-packet data capacity, and exchange
//! opaque routing info through the management handshake.
//!
//! `UdpTransport` is the in-tree implementation: a non-blocking UDP socket
//! with a recycling receive ring. It is unreliable and unordered enough to
//! exercise every recovery path the engine has.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use nix::sys::socket::{setsockopt, sockopt};

use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::packet::PKT_HDR_SIZE;

/// Total bytes of a datapath UDP packet: header plus payload.
pub const UDP_MTU: usize = 1024;

/// Capacity of the opaque routing info blob exchanged during session setup.
pub const ROUTING_INFO_CAP: usize = 32;

/// Opaque transport routing info, carried in management packets.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RoutingInfo {
    len: u8,
    bytes: [u8; ROUTING_INFO_CAP],
}

impl RoutingInfo {
    /// Build from raw bytes. Truncates to `ROUTING_INFO_CAP`.
    pub fn from_bytes(src: &[u8]) -> Self {
        let mut bytes = [0u8; ROUTING_INFO_CAP];
        let len = src.len().min(ROUTING_INFO_CAP);
        bytes[..len].copy_from_slice(&src[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    /// An empty routing info blob.
    pub fn empty() -> Self {
        Self {
            len: 0,
            bytes: [0u8; ROUTING_INFO_CAP],
        }
    }

    /// The valid bytes of the blob.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub(crate) fn wire_len(&self) -> u8 {
        self.len
    }

    pub(crate) fn wire_bytes(&self) -> &[u8; ROUTING_INFO_CAP] {
        &self.bytes
    }

    pub(crate) fn from_wire(len: u8, bytes: [u8; ROUTING_INFO_CAP]) -> Self {
        Self {
            len: len.min(ROUTING_INFO_CAP as u8),
            bytes,
        }
    }
}

impl std::fmt::Debug for RoutingInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoutingInfo({:02x?})", self.as_bytes())
    }
}

/// One packet handed to the transport: a header segment and a payload
/// segment, gathered on the wire.
pub struct TxPkt<R> {
    pub route: R,
    pub hdr: *const u8,
    pub payload: *const u8,
    pub payload_len: usize,
    /// Opaque engine token, reported back in the send completion.
    pub token: u64,
}

/// A completed send.
#[derive(Debug, Clone, Copy)]
pub struct SendCompletion {
    pub token: u64,
}

/// A received packet: header followed by payload. The view is valid only
/// until the next `poll_recv_cq` call on the same transport.
#[derive(Debug, Clone, Copy)]
pub struct RxView {
    pub ptr: *mut u8,
    pub len: usize,
}

/// The transport capability set the engine is parameterized over.
pub trait Transport {
    /// Transport-addressable form of a peer, produced by routing
    /// resolution.
    type Route: Copy + std::fmt::Debug;

    /// Bring up a transport instance on the given physical port.
    fn open(phy_port: u8, numa_node: usize, config: &RpcConfig) -> Result<Self>
    where
        Self: Sized;

    /// Enqueue packets for transmission. May partially accept; returns the
    /// number of packets taken, always a prefix of `pkts`.
    fn post_send(&mut self, pkts: &[TxPkt<Self::Route>]) -> usize;

    /// Report completed sends. The engine frees any buffer it associated
    /// with the completion token.
    fn poll_send_cq(&mut self, out: &mut Vec<SendCompletion>);

    /// Report received packets. Views are valid until the next call.
    fn poll_recv_cq(&mut self, out: &mut Vec<RxView>);

    /// Pin a memory range for device access.
    fn register_memory(&mut self, ptr: *mut u8, len: usize) -> Result<()>;

    /// Unpin a memory range.
    fn deregister_memory(&mut self, ptr: *mut u8, len: usize);

    /// Maximum data bytes per packet: MTU minus headers.
    fn max_data_per_pkt(&self) -> usize;

    /// Opaque routing info for this instance, exchanged during the
    /// management handshake.
    fn routing_info(&self) -> RoutingInfo;

    /// Resolve a peer's routing info into transport-addressable form.
    /// `peer_host` is the peer's management hostname.
    fn resolve_routing_info(&self, info: &RoutingInfo, peer_host: &str) -> Result<Self::Route>;
}

/// UDP datagram transport.
pub struct UdpTransport {
    sock: UdpSocket,
    local_port: u16,
    rx_ring: Vec<Box<[u8]>>,
    tx_scratch: Box<[u8]>,
    completions: Vec<SendCompletion>,
    registered_bytes: usize,
}

const UDP_ROUTING_TAG: u8 = b'U';

impl Transport for UdpTransport {
    type Route = SocketAddr;

    fn open(_phy_port: u8, _numa_node: usize, config: &RpcConfig) -> Result<Self> {
        let sock = UdpSocket::bind(("0.0.0.0", 0))?;
        sock.set_nonblocking(true)?;

        // Datapath bursts overrun the default socket buffers; losses are
        // recoverable but expensive.
        let _ = setsockopt(&sock, sockopt::RcvBuf, &config.socket_buf_size);
        let _ = setsockopt(&sock, sockopt::SndBuf, &config.socket_buf_size);

        let local_port = sock.local_addr()?.port();
        let rx_ring = (0..config.recv_ring_depth)
            .map(|_| vec![0u8; UDP_MTU].into_boxed_slice())
            .collect();

        Ok(Self {
            sock,
            local_port,
            rx_ring,
            tx_scratch: vec![0u8; UDP_MTU].into_boxed_slice(),
            completions: Vec::new(),
            registered_bytes: 0,
        })
    }

    fn post_send(&mut self, pkts: &[TxPkt<SocketAddr>]) -> usize {
        let mut accepted = 0;
        for pkt in pkts {
            let total = PKT_HDR_SIZE + pkt.payload_len;
            debug_assert!(total <= UDP_MTU);
            unsafe {
                std::ptr::copy_nonoverlapping(pkt.hdr, self.tx_scratch.as_mut_ptr(), PKT_HDR_SIZE);
                if pkt.payload_len > 0 {
                    std::ptr::copy_nonoverlapping(
                        pkt.payload,
                        self.tx_scratch.as_mut_ptr().add(PKT_HDR_SIZE),
                        pkt.payload_len,
                    );
                }
            }
            match self.sock.send_to(&self.tx_scratch[..total], pkt.route) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // Best-effort wire: a refused or failed send counts as
                    // transmitted-and-lost.
                    tracing::trace!(error = %e, "datapath send error, counting as lost");
                }
            }
            self.completions.push(SendCompletion { token: pkt.token });
            accepted += 1;
        }
        accepted
    }

    fn poll_send_cq(&mut self, out: &mut Vec<SendCompletion>) {
        out.append(&mut self.completions);
    }

    fn poll_recv_cq(&mut self, out: &mut Vec<RxView>) {
        for i in 0..self.rx_ring.len() {
            match self.sock.recv_from(&mut self.rx_ring[i]) {
                Ok((len, _src)) => {
                    out.push(RxView {
                        ptr: self.rx_ring[i].as_mut_ptr(),
                        len,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::trace!(error = %e, "datapath recv error");
                    break;
                }
            }
        }
    }

    fn register_memory(&mut self, _ptr: *mut u8, len: usize) -> Result<()> {
        // No DMA pinning for a kernel socket; only accounting.
        self.registered_bytes += len;
        Ok(())
    }

    fn deregister_memory(&mut self, _ptr: *mut u8, len: usize) {
        self.registered_bytes = self.registered_bytes.saturating_sub(len);
    }

    fn max_data_per_pkt(&self) -> usize {
        UDP_MTU - PKT_HDR_SIZE
    }

    fn routing_info(&self) -> RoutingInfo {
        let mut bytes = [0u8; 3];
        bytes[0] = UDP_ROUTING_TAG;
        bytes[1..3].copy_from_slice(&self.local_port.to_le_bytes());
        RoutingInfo::from_bytes(&bytes)
    }

    fn resolve_routing_info(&self, info: &RoutingInfo, peer_host: &str) -> Result<SocketAddr> {
        let bytes = info.as_bytes();
        if bytes.len() != 3 || bytes[0] != UDP_ROUTING_TAG {
            return Err(Error::RoutingResolution(format!(
                "malformed UDP routing info: {:?}",
                info
            )));
        }
        let port = u16::from_le_bytes([bytes[1], bytes[2]]);
        (peer_host, port)
            .to_socket_addrs()
            .map_err(|e| Error::RoutingResolution(format!("{}:{}: {}", peer_host, port, e)))?
            .next()
            .ok_or_else(|| {
                Error::RoutingResolution(format!("no address for {}:{}", peer_host, port))
            })
    }
}

impl UdpTransport {
    /// Local UDP port of the datapath socket.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Bytes currently accounted as registered.
    pub fn registered_bytes(&self) -> usize {
        self.registered_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PktHdr, PktType};

    fn open_pair() -> (UdpTransport, UdpTransport) {
        let config = RpcConfig::default();
        (
            UdpTransport::open(0, 0, &config).unwrap(),
            UdpTransport::open(0, 0, &config).unwrap(),
        )
    }

    #[test]
    fn test_routing_info_roundtrip() {
        let (a, b) = open_pair();
        let info = a.routing_info();
        let route = b.resolve_routing_info(&info, "127.0.0.1").unwrap();
        assert_eq!(route.port(), a.local_port());
    }

    #[test]
    fn test_resolve_rejects_garbage() {
        let (a, _b) = open_pair();
        let bad = RoutingInfo::from_bytes(&[0xFF; 8]);
        assert!(a.resolve_routing_info(&bad, "127.0.0.1").is_err());
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let (mut a, mut b) = open_pair();
        let route = b
            .resolve_routing_info(&a.routing_info(), "127.0.0.1")
            .unwrap();

        let hdr = PktHdr::new(3, 5, 0, PktType::Req, 0, 77);
        let payload = *b"hello";
        let pkt = TxPkt {
            route,
            hdr: &hdr as *const PktHdr as *const u8,
            payload: payload.as_ptr(),
            payload_len: payload.len(),
            token: 42,
        };
        assert_eq!(b.post_send(std::slice::from_ref(&pkt)), 1);

        let mut comps = Vec::new();
        b.poll_send_cq(&mut comps);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].token, 42);

        // Receive with a short retry loop; loopback is fast but async.
        let mut views = Vec::new();
        for _ in 0..200 {
            a.poll_recv_cq(&mut views);
            if !views.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(views.len(), 1);
        let view = views[0];
        assert_eq!(view.len, PKT_HDR_SIZE + 5);
        let got = unsafe { std::slice::from_raw_parts(view.ptr, view.len) };
        let got_hdr = PktHdr::from_bytes(got).unwrap();
        assert_eq!({ got_hdr.req_num }, 77);
        assert_eq!(&got[PKT_HDR_SIZE..], b"hello");
    }

    #[test]
    fn test_register_accounting() {
        let (mut a, _b) = open_pair();
        let mut buf = vec![0u8; 4096];
        a.register_memory(buf.as_mut_ptr(), buf.len()).unwrap();
        assert_eq!(a.registered_bytes(), 4096);
        a.deregister_memory(buf.as_mut_ptr(), buf.len());
        assert_eq!(a.registered_bytes(), 0);
    }
}
