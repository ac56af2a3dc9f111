//! ARP wire format for Ethernet/IPv4.
//!
//! Only the fixed-size `HTYPE=1, PTYPE=0x0800, HLEN=6, PLEN=4` layout is
//! supported; anything else on the wire is discarded during decode.

use std::fmt;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Ethernet hardware type in the ARP header.
const HTYPE_ETHERNET: u16 = 1;
/// IPv4 protocol type in the ARP header.
const PTYPE_IPV4: u16 = 0x0800;

/// A 6-byte Ethernet hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, derive_more::From)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const NULL: MacAddr = MacAddr([0; 6]);
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// ARP operation code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

/// A decoded ARP packet, without the Ethernet header.
///
/// The packet socket runs in cooked mode, so this is exactly what crosses
/// the socket boundary in both directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ArpPacket {
    pub op: ArpOp,
    pub sha: MacAddr,
    pub spa: Ipv4Addr,
    pub tha: MacAddr,
    pub tpa: Ipv4Addr,
}

impl ArpPacket {
    /// Encoded size of an Ethernet/IPv4 ARP packet.
    pub const LEN: usize = 28;

    /// An address probe: all-zero sender protocol address, so the target
    /// cannot mistake it for a claim on the address.
    pub fn probe(sha: MacAddr, tpa: Ipv4Addr) -> Self {
        ArpPacket {
            op: ArpOp::Request,
            sha,
            spa: Ipv4Addr::UNSPECIFIED,
            tha: MacAddr::NULL,
            tpa,
        }
    }

    /// A gratuitous request (`SPA == TPA`), used for announcements and
    /// defenses alike.
    pub fn announcement(sha: MacAddr, ip: Ipv4Addr) -> Self {
        ArpPacket {
            op: ArpOp::Request,
            sha,
            spa: ip,
            tha: MacAddr::NULL,
            tpa: ip,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(HTYPE_ETHERNET);
        buf.put_u16(PTYPE_IPV4);
        buf.put_u8(6);
        buf.put_u8(4);
        buf.put_u16(self.op.into());
        buf.put_slice(&self.sha.octets());
        buf.put_slice(&self.spa.octets());
        buf.put_slice(&self.tha.octets());
        buf.put_slice(&self.tpa.octets());
    }

    /// Decodes one packet, discarding frames that are not Ethernet/IPv4 ARP
    /// requests or replies. Trailing bytes (padding from short frames) are
    /// ignored.
    pub fn decode(mut data: &[u8]) -> Option<Self> {
        if data.remaining() < Self::LEN {
            return None;
        }
        if data.get_u16() != HTYPE_ETHERNET || data.get_u16() != PTYPE_IPV4 {
            return None;
        }
        if data.get_u8() != 6 || data.get_u8() != 4 {
            return None;
        }
        let op = ArpOp::try_from(data.get_u16()).ok()?;

        let mut sha = [0; 6];
        data.copy_to_slice(&mut sha);
        let spa = Ipv4Addr::from(data.get_u32());
        let mut tha = [0; 6];
        data.copy_to_slice(&mut tha);
        let tpa = Ipv4Addr::from(data.get_u32());

        Some(ArpPacket {
            op,
            sha: sha.into(),
            spa,
            tha: tha.into(),
            tpa,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        self.encode(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0xab, 0xcd, 0xef]);

    #[test]
    fn probe_layout() {
        let ip = Ipv4Addr::new(192, 0, 2, 10);
        let bytes = ArpPacket::probe(MAC, ip).to_bytes();
        assert_eq!(bytes.len(), ArpPacket::LEN);
        // header
        assert_eq!(&bytes[..8], &[0, 1, 8, 0, 6, 4, 0, 1]);
        // sha, spa
        assert_eq!(&bytes[8..14], &MAC.octets());
        assert_eq!(&bytes[14..18], &[0, 0, 0, 0]);
        // tha, tpa
        assert_eq!(&bytes[18..24], &[0; 6]);
        assert_eq!(&bytes[24..28], &ip.octets());
    }

    #[test]
    fn announcement_is_gratuitous() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let pkt = ArpPacket::announcement(MAC, ip);
        assert_eq!(pkt.spa, pkt.tpa);
        let decoded = ArpPacket::decode(&pkt.to_bytes()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn decode_rejects_foreign_headers() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let good = ArpPacket::announcement(MAC, ip).to_bytes();
        assert!(ArpPacket::decode(&good).is_some());

        // truncated
        assert!(ArpPacket::decode(&good[..ArpPacket::LEN - 1]).is_none());

        // wrong hardware type
        let mut bad = good.clone();
        bad[1] = 6;
        assert!(ArpPacket::decode(&bad).is_none());

        // wrong protocol
        let mut bad = good.clone();
        bad[2] = 0x86;
        assert!(ArpPacket::decode(&bad).is_none());

        // RARP opcode
        let mut bad = good.clone();
        bad[7] = 3;
        assert!(ArpPacket::decode(&bad).is_none());
    }

    #[test]
    fn decode_ignores_trailing_padding() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let mut bytes = ArpPacket::probe(MAC, ip).to_bytes();
        bytes.extend_from_slice(&[0u8; 18]); // frames padded to 60 bytes
        let pkt = ArpPacket::decode(&bytes).unwrap();
        assert_eq!(pkt.tpa, ip);
    }
}
