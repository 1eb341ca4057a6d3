//! Packet header and packet types for the datapath.
//!
//! The packet header is 24 bytes and precedes every data packet. It carries
//! everything needed for request/response correlation, fragmentation, and
//! credit return.

use crate::error::{Error, Result};

/// Packet header size in bytes.
pub const PKT_HDR_SIZE: usize = 24;

/// Transport headroom bytes reserved at the front of every header.
pub const PKT_HEADROOM: usize = 2;

/// Magic number for valid data packets.
pub const PKT_HDR_MAGIC: u8 = 0xD7;

/// Maximum message size representable in the header.
pub const WIRE_MAX_MSG_SIZE: usize = u32::MAX as usize;

/// Packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktType {
    /// Request packet (first transmission).
    Req = 1,
    /// Response packet.
    Resp = 2,
    /// Explicit credit return: a header-only packet sent when the receiver
    /// has nothing else to send.
    ExplicitCredit = 3,
    /// Retransmitted request packet soliciting the response again.
    ReqForResp = 4,
}

impl TryFrom<u8> for PktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PktType::Req),
            2 => Ok(PktType::Resp),
            3 => Ok(PktType::ExplicitCredit),
            4 => Ok(PktType::ReqForResp),
            _ => Err(Error::InvalidPacketType(value)),
        }
    }
}

/// Packet header (24 bytes).
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       2     headroom (transport scratch, zeroed at allocation)
/// 2       1     req_type
/// 3       1     pkt_type
/// 4       2     dst_session_num
/// 6       2     pkt_num
/// 8       4     msg_size
/// 12      1     flags
/// 13      1     magic
/// 14      2     reserved
/// 16      8     req_num
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct PktHdr {
    /// Transport headroom, reserved in-place.
    pub headroom: [u8; PKT_HEADROOM],
    /// Request type (application-defined).
    pub req_type: u8,
    /// Packet type byte.
    pkt_type: u8,
    /// Destination session number: the receiver's local session number.
    pub dst_session_num: u16,
    /// Packet number within the message.
    pub pkt_num: u16,
    /// Total message size in data bytes.
    pub msg_size: u32,
    /// Flags, currently unused on the wire.
    pub flags: u8,
    /// Magic number for validation.
    pub magic: u8,
    /// Reserved.
    reserved: [u8; 2],
    /// Request number, monotonic per session.
    pub req_num: u64,
}

impl PktHdr {
    /// Create a new packet header.
    pub fn new(
        req_type: u8,
        msg_size: usize,
        dst_session_num: u16,
        pkt_type: PktType,
        pkt_num: u16,
        req_num: u64,
    ) -> Self {
        debug_assert!(msg_size <= WIRE_MAX_MSG_SIZE);
        Self {
            headroom: [0; PKT_HEADROOM],
            req_type,
            pkt_type: pkt_type as u8,
            dst_session_num,
            pkt_num,
            msg_size: msg_size as u32,
            flags: 0,
            magic: PKT_HDR_MAGIC,
            reserved: [0; 2],
            req_num,
        }
    }

    /// Get the packet type, if valid.
    #[inline]
    pub fn pkt_type(&self) -> Result<PktType> {
        PktType::try_from(self.pkt_type)
    }

    /// Set the packet type.
    #[inline]
    pub fn set_pkt_type(&mut self, pkt_type: PktType) {
        self.pkt_type = pkt_type as u8;
    }

    /// Check if this is a request packet (initial or retransmitted).
    #[inline]
    pub fn is_req(&self) -> bool {
        self.pkt_type == PktType::Req as u8 || self.pkt_type == PktType::ReqForResp as u8
    }

    /// Check if this is a response packet.
    #[inline]
    pub fn is_resp(&self) -> bool {
        self.pkt_type == PktType::Resp as u8
    }

    /// Check if this is an explicit credit return.
    #[inline]
    pub fn is_expl_credit(&self) -> bool {
        self.pkt_type == PktType::ExplicitCredit as u8
    }

    /// Check if the magic number is valid.
    #[inline]
    pub fn check_magic(&self) -> bool {
        let magic = self.magic;
        magic == PKT_HDR_MAGIC
    }

    /// Validate the magic number.
    pub fn validate(&self) -> Result<()> {
        let magic = self.magic;
        if magic != PKT_HDR_MAGIC {
            return Err(Error::InvalidMagic {
                expected: PKT_HDR_MAGIC,
                got: magic,
            });
        }
        Ok(())
    }

    /// Serialize the header to raw memory.
    ///
    /// # Safety
    /// The destination must have space for at least `PKT_HDR_SIZE` bytes.
    #[inline]
    pub unsafe fn write_to(&self, dst: *mut u8) {
        unsafe {
            std::ptr::copy_nonoverlapping(self as *const Self as *const u8, dst, PKT_HDR_SIZE);
        }
    }

    /// Deserialize a header from raw memory.
    ///
    /// # Safety
    /// The source must hold at least `PKT_HDR_SIZE` readable bytes.
    #[inline]
    pub unsafe fn read_from(src: *const u8) -> Self {
        unsafe {
            let mut hdr = std::mem::MaybeUninit::<Self>::uninit();
            std::ptr::copy_nonoverlapping(src, hdr.as_mut_ptr() as *mut u8, PKT_HDR_SIZE);
            hdr.assume_init()
        }
    }

    /// Create a header from a byte slice, validating the magic.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PKT_HDR_SIZE {
            return Err(Error::BufferTooSmall {
                required: PKT_HDR_SIZE,
                available: bytes.len(),
            });
        }
        let hdr = unsafe { Self::read_from(bytes.as_ptr()) };
        hdr.validate()?;
        Ok(hdr)
    }

    /// Number of packets needed for a message of `msg_size` data bytes when
    /// each packet carries up to `max_data_per_pkt` bytes.
    pub fn calc_num_pkts(msg_size: usize, max_data_per_pkt: usize) -> u16 {
        debug_assert!(max_data_per_pkt > 0);
        if msg_size == 0 {
            1
        } else {
            msg_size.div_ceil(max_data_per_pkt) as u16
        }
    }

    /// Data bytes carried by packet `pkt_num` of a `msg_size`-byte message.
    pub fn pkt_data_len(msg_size: usize, max_data_per_pkt: usize, pkt_num: u16) -> usize {
        let offset = pkt_num as usize * max_data_per_pkt;
        debug_assert!(offset < msg_size || msg_size == 0);
        msg_size.saturating_sub(offset).min(max_data_per_pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkt_hdr_size() {
        assert_eq!(std::mem::size_of::<PktHdr>(), PKT_HDR_SIZE);
    }

    #[test]
    fn test_pkt_hdr_roundtrip() {
        let hdr = PktHdr::new(42, 0x0012_3456, 0x1234, PktType::Req, 7, 0x0FFF_FFFF_FFFF);

        assert_eq!(hdr.req_type, 42);
        assert_eq!({ hdr.msg_size }, 0x0012_3456);
        assert_eq!({ hdr.dst_session_num }, 0x1234);
        assert_eq!(hdr.pkt_type().unwrap(), PktType::Req);
        assert_eq!({ hdr.pkt_num }, 7);
        assert_eq!({ hdr.req_num }, 0x0FFF_FFFF_FFFF);
        assert!(hdr.check_magic());
    }

    #[test]
    fn test_pkt_hdr_serialize() {
        let hdr = PktHdr::new(1, 100, 5, PktType::Resp, 10, 12345);
        let mut buf = [0u8; PKT_HDR_SIZE];

        unsafe {
            hdr.write_to(buf.as_mut_ptr());
            let hdr2 = PktHdr::read_from(buf.as_ptr());
            assert_eq!(hdr, hdr2);
        }

        let hdr3 = PktHdr::from_bytes(&buf).unwrap();
        assert_eq!(hdr, hdr3);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = [0u8; PKT_HDR_SIZE];
        let hdr = PktHdr::new(1, 100, 5, PktType::Req, 0, 1);
        unsafe { hdr.write_to(buf.as_mut_ptr()) };
        buf[13] ^= 0xFF;
        assert!(PktHdr::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_pkt_types() {
        for pkt_type in [
            PktType::Req,
            PktType::Resp,
            PktType::ExplicitCredit,
            PktType::ReqForResp,
        ] {
            let hdr = PktHdr::new(0, 0, 0, pkt_type, 0, 0);
            assert_eq!(hdr.pkt_type().unwrap(), pkt_type);
        }
        assert!(PktType::try_from(0u8).is_err());
        assert!(PktType::try_from(5u8).is_err());
    }

    #[test]
    fn test_calc_num_pkts() {
        let dpp = 1000;
        assert_eq!(PktHdr::calc_num_pkts(0, dpp), 1);
        assert_eq!(PktHdr::calc_num_pkts(1, dpp), 1);
        assert_eq!(PktHdr::calc_num_pkts(dpp, dpp), 1);
        assert_eq!(PktHdr::calc_num_pkts(dpp + 1, dpp), 2);
        assert_eq!(PktHdr::calc_num_pkts(dpp * 2, dpp), 2);
        assert_eq!(PktHdr::calc_num_pkts(dpp * 2 + 1, dpp), 3);
    }

    #[test]
    fn test_pkt_data_len() {
        let dpp = 1000;
        assert_eq!(PktHdr::pkt_data_len(2500, dpp, 0), 1000);
        assert_eq!(PktHdr::pkt_data_len(2500, dpp, 1), 1000);
        assert_eq!(PktHdr::pkt_data_len(2500, dpp, 2), 500);
        assert_eq!(PktHdr::pkt_data_len(999, dpp, 0), 999);
    }
}
