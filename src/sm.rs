//! Session management wire format.
//!
//! Session setup and teardown run over an out-of-band UDP channel owned by
//! the Nexus, separate from the datapath. Each management datagram is a
//! fixed-layout record carrying both endpoints and both sides' transport
//! routing info.

use crate::config::MAX_HOSTNAME_LEN;
use crate::error::{Error, Result};
use crate::transport::{ROUTING_INFO_CAP, RoutingInfo};

/// Management packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmPktType {
    /// Client-originated connect request.
    ConnectReq = 1,
    /// Server reply to a connect request.
    ConnectResp = 2,
    /// Client-originated disconnect request.
    DisconnectReq = 3,
    /// Server reply to a disconnect request.
    DisconnectResp = 4,
}

impl TryFrom<u8> for SmPktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(SmPktType::ConnectReq),
            2 => Ok(SmPktType::ConnectResp),
            3 => Ok(SmPktType::DisconnectReq),
            4 => Ok(SmPktType::DisconnectResp),
            _ => Err(Error::InvalidSmPacketType(value)),
        }
    }
}

/// Session management error kinds. The last two are client-local and never
/// appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmErrType {
    NoError = 0,
    /// The requested physical port does not exist at the server.
    InvalidRemotePort = 1,
    /// The server's session table is full.
    TooManySessions = 2,
    /// The server could not allocate session resources.
    OutOfMemory = 3,
    /// Client-local: the server's routing info could not be resolved.
    RoutingResolutionFailure = 4,
    /// Client-local: a retransmission cap was reached and the peer is
    /// presumed lost.
    Timeout = 5,
}

impl TryFrom<u8> for SmErrType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmErrType::NoError),
            1 => Ok(SmErrType::InvalidRemotePort),
            2 => Ok(SmErrType::TooManySessions),
            3 => Ok(SmErrType::OutOfMemory),
            4 => Ok(SmErrType::RoutingResolutionFailure),
            5 => Ok(SmErrType::Timeout),
            _ => Err(Error::InvalidSmPacketType(value)),
        }
    }
}

/// Events delivered to the application's session management callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventType {
    Connected,
    ConnectFailed,
    Disconnected,
    DisconnectFailed,
}

/// One side of a session: management identity plus the session number on
/// that side.
#[derive(Clone, Copy)]
pub struct SmEndpoint {
    /// NUL-padded hostname.
    pub hostname: [u8; MAX_HOSTNAME_LEN],
    /// Endpoint identifier within the host.
    pub app_tid: u32,
    /// Session number local to this side.
    pub session_num: u32,
    /// Physical transport port.
    pub phy_port: u8,
}

impl SmEndpoint {
    pub fn new(host: &str, app_tid: u32, session_num: u32, phy_port: u8) -> Self {
        let mut hostname = [0u8; MAX_HOSTNAME_LEN];
        let bytes = host.as_bytes();
        let len = bytes.len().min(MAX_HOSTNAME_LEN - 1);
        hostname[..len].copy_from_slice(&bytes[..len]);
        Self {
            hostname,
            app_tid,
            session_num,
            phy_port,
        }
    }

    /// The hostname up to its NUL terminator.
    pub fn hostname_str(&self) -> &str {
        let end = self
            .hostname
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_HOSTNAME_LEN);
        std::str::from_utf8(&self.hostname[..end]).unwrap_or("")
    }

    /// True iff `other` names the same endpoint-side session. Both sides
    /// key idempotency on this triple.
    pub fn same_session(&self, other: &SmEndpoint) -> bool {
        self.hostname == other.hostname
            && self.app_tid == other.app_tid
            && self.session_num == other.session_num
    }
}

impl std::fmt::Debug for SmEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, tid {}, session {}, port {}]",
            self.hostname_str(),
            self.app_tid,
            self.session_num,
            self.phy_port
        )
    }
}

const SM_ENDPOINT_WIRE_SIZE: usize = MAX_HOSTNAME_LEN + 4 + 4 + 1;
const ROUTING_WIRE_SIZE: usize = 1 + ROUTING_INFO_CAP;

/// Serialized size of a management datagram.
pub const SM_PKT_SIZE: usize = 2 + 2 * SM_ENDPOINT_WIRE_SIZE + 2 * ROUTING_WIRE_SIZE;

/// A session management datagram.
#[derive(Debug, Clone, Copy)]
pub struct SmPkt {
    pub pkt_type: SmPktType,
    pub err: SmErrType,
    pub client: SmEndpoint,
    pub server: SmEndpoint,
    pub client_routing: RoutingInfo,
    pub server_routing: RoutingInfo,
}

impl SmPkt {
    /// True for client-originated requests.
    pub fn is_request(&self) -> bool {
        matches!(
            self.pkt_type,
            SmPktType::ConnectReq | SmPktType::DisconnectReq
        )
    }

    /// The app TID of the endpoint this datagram must be delivered to:
    /// requests go to the server side, responses to the client side.
    pub fn dst_app_tid(&self) -> u32 {
        if self.is_request() {
            self.server.app_tid
        } else {
            self.client.app_tid
        }
    }

    /// The hostname this datagram must be sent to.
    pub fn dst_hostname(&self) -> &str {
        if self.is_request() {
            self.server.hostname_str()
        } else {
            self.client.hostname_str()
        }
    }

    /// Serialize into a fixed-size wire record.
    pub fn serialize(&self) -> [u8; SM_PKT_SIZE] {
        let mut out = [0u8; SM_PKT_SIZE];
        out[0] = self.pkt_type as u8;
        out[1] = self.err as u8;
        let mut off = 2;
        for ep in [&self.client, &self.server] {
            out[off..off + MAX_HOSTNAME_LEN].copy_from_slice(&ep.hostname);
            off += MAX_HOSTNAME_LEN;
            out[off..off + 4].copy_from_slice(&ep.app_tid.to_le_bytes());
            off += 4;
            out[off..off + 4].copy_from_slice(&ep.session_num.to_le_bytes());
            off += 4;
            out[off] = ep.phy_port;
            off += 1;
        }
        for ri in [&self.client_routing, &self.server_routing] {
            out[off] = ri.wire_len();
            off += 1;
            out[off..off + ROUTING_INFO_CAP].copy_from_slice(ri.wire_bytes());
            off += ROUTING_INFO_CAP;
        }
        debug_assert_eq!(off, SM_PKT_SIZE);
        out
    }

    /// Deserialize from a wire record, validating the type bytes.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < SM_PKT_SIZE {
            return Err(Error::BufferTooSmall {
                required: SM_PKT_SIZE,
                available: buf.len(),
            });
        }
        let pkt_type = SmPktType::try_from(buf[0])?;
        let err = SmErrType::try_from(buf[1])?;
        let mut off = 2;

        let mut read_ep = |buf: &[u8]| -> SmEndpoint {
            let mut hostname = [0u8; MAX_HOSTNAME_LEN];
            hostname.copy_from_slice(&buf[off..off + MAX_HOSTNAME_LEN]);
            off += MAX_HOSTNAME_LEN;
            let app_tid = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
            let session_num = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
            let phy_port = buf[off];
            off += 1;
            SmEndpoint {
                hostname,
                app_tid,
                session_num,
                phy_port,
            }
        };
        let client = read_ep(buf);
        let server = read_ep(buf);

        let mut read_ri = |buf: &[u8]| -> RoutingInfo {
            let len = buf[off];
            off += 1;
            let mut bytes = [0u8; ROUTING_INFO_CAP];
            bytes.copy_from_slice(&buf[off..off + ROUTING_INFO_CAP]);
            off += ROUTING_INFO_CAP;
            RoutingInfo::from_wire(len, bytes)
        };
        let client_routing = read_ri(buf);
        let server_routing = read_ri(buf);

        Ok(Self {
            pkt_type,
            err,
            client,
            server,
            client_routing,
            server_routing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pkt() -> SmPkt {
        SmPkt {
            pkt_type: SmPktType::ConnectReq,
            err: SmErrType::NoError,
            client: SmEndpoint::new("clienthost", 100, 3, 0),
            server: SmEndpoint::new("serverhost", 200, 0, 0),
            client_routing: RoutingInfo::from_bytes(&[b'U', 0x34, 0x12]),
            server_routing: RoutingInfo::empty(),
        }
    }

    #[test]
    fn test_sm_pkt_roundtrip() {
        let pkt = sample_pkt();
        let wire = pkt.serialize();
        let got = SmPkt::deserialize(&wire).unwrap();

        assert_eq!(got.pkt_type, SmPktType::ConnectReq);
        assert_eq!(got.err, SmErrType::NoError);
        assert_eq!(got.client.hostname_str(), "clienthost");
        assert_eq!(got.client.app_tid, 100);
        assert_eq!(got.client.session_num, 3);
        assert_eq!(got.server.hostname_str(), "serverhost");
        assert_eq!(got.server.app_tid, 200);
        assert_eq!(
            got.client_routing.as_bytes(),
            pkt.client_routing.as_bytes()
        );
        assert_eq!(got.server_routing.as_bytes(), &[] as &[u8]);
    }

    #[test]
    fn test_sm_pkt_dst() {
        let mut pkt = sample_pkt();
        assert!(pkt.is_request());
        assert_eq!(pkt.dst_app_tid(), 200);
        assert_eq!(pkt.dst_hostname(), "serverhost");

        pkt.pkt_type = SmPktType::ConnectResp;
        assert!(!pkt.is_request());
        assert_eq!(pkt.dst_app_tid(), 100);
        assert_eq!(pkt.dst_hostname(), "clienthost");
    }

    #[test]
    fn test_sm_pkt_rejects_bad_type() {
        let mut wire = sample_pkt().serialize();
        wire[0] = 0xEE;
        assert!(SmPkt::deserialize(&wire).is_err());

        let short = [0u8; 10];
        assert!(SmPkt::deserialize(&short).is_err());
    }

    #[test]
    fn test_same_session_key() {
        let a = SmEndpoint::new("h", 1, 2, 0);
        let b = SmEndpoint::new("h", 1, 2, 9);
        let c = SmEndpoint::new("h", 1, 3, 0);
        assert!(a.same_session(&b));
        assert!(!a.same_session(&c));
    }
}
