//! Captured frames and the transport-layer context decoded from them.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::SystemTime;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::{self, TcpOptionNumbers, TcpPacket};
use pnet::packet::Packet;
use thiserror::Error;

pub const CWR: u8 = 0b1000_0000;
pub const ECE: u8 = 0b0100_0000;
pub const URG: u8 = 0b0010_0000;
pub const ACK: u8 = 0b0001_0000;
pub const PSH: u8 = 0b0000_1000;
pub const RST: u8 = 0b0000_0100;
pub const SYN: u8 = 0b0000_0010;
pub const FIN: u8 = 0b0000_0001;

/// Link-layer framing of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Bare IPv4 or IPv6 datagram.
    RawIp,
    /// BSD loopback, a 4-byte host-order address family ahead of the datagram.
    Loopback,
}

impl LinkType {
    /// Maps a pcap `LINKTYPE_*` value.
    pub fn from_pcap(linktype: i32) -> Option<Self> {
        match linktype {
            0 => Some(LinkType::Loopback),
            1 => Some(LinkType::Ethernet),
            12 | 14 | 101 => Some(LinkType::RawIp),
            _ => None,
        }
    }
}

/// A frame handed to intake by a segment source.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Capture timestamp.
    pub timestamp: SystemTime,
    /// Number of bytes captured.
    pub caplen: usize,
    /// Framing of `data`.
    pub link_type: LinkType,
    /// Raw frame bytes.
    pub data: Vec<u8>,
}

impl CapturedFrame {
    pub fn new(timestamp: SystemTime, link_type: LinkType, data: Vec<u8>) -> Self {
        CapturedFrame {
            timestamp,
            caplen: data.len(),
            link_type,
            data,
        }
    }
}

/// Frame decoding failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PduError {
    #[error("truncated {0} header")]
    Truncated(&'static str),

    #[error("unsupported network protocol {0:#06x}")]
    NotIp(u16),

    #[error("not TCP (next header {0})")]
    NotTcp(u8),

    #[error("malformed TCP segment")]
    Malformed,
}

/// TCP options relevant to connection consistency checks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
}

/// Parsed transport-layer context from the frame used for connection tracking.
#[derive(Debug, Clone, Copy)]
pub struct L4Context {
    /// Source socket address.
    pub src: SocketAddr,
    /// Destination socket address.
    pub dst: SocketAddr,
    /// Offset into the frame (or, once owned by an `L4Pdu`, into its payload) where payload
    /// begins.
    pub(crate) offset: usize,
    /// Length of the payload in bytes.
    pub(crate) length: usize,
    /// Raw sequence number of segment.
    pub seq_no: u32,
    /// Raw acknowledgement number of segment.
    pub ack_no: u32,
    /// TCP flags.
    pub flags: u8,
    /// Advertised receive window, unscaled.
    pub window: u16,
    /// Handshake options.
    pub options: TcpOptions,
    /// Checksum verdict, only computed when requested.
    pub checksum_ok: Option<bool>,
    /// Capture timestamp of the frame.
    pub ts: SystemTime,
}

impl L4Context {
    /// Decodes `frame` down to its TCP header.
    pub fn new(frame: &CapturedFrame, verify_checksum: bool) -> Result<Self, PduError> {
        let (network, ethertype) = match frame.link_type {
            LinkType::Ethernet => {
                let eth = EthernetPacket::new(&frame.data).ok_or(PduError::Truncated("ethernet"))?;
                let offset = frame.data.len() - eth.payload().len();
                (offset, eth.get_ethertype().0)
            }
            LinkType::RawIp => {
                let version = frame.data.first().ok_or(PduError::Truncated("ip"))? >> 4;
                (0, ip_ethertype(version))
            }
            LinkType::Loopback => {
                let family = frame.data.get(..4).ok_or(PduError::Truncated("loopback"))?;
                let family = u32::from_ne_bytes([family[0], family[1], family[2], family[3]]);
                let ethertype = match family {
                    2 => EtherTypes::Ipv4.0,
                    24 | 28 | 30 => EtherTypes::Ipv6.0,
                    _ => 0,
                };
                (4, ethertype)
            }
        };
        let datagram = &frame.data[network..];

        if ethertype == EtherTypes::Ipv4.0 {
            let ipv4 = Ipv4Packet::new(datagram).ok_or(PduError::Truncated("ipv4"))?;
            check_tcp(ipv4.get_next_level_protocol())?;
            let segment = ipv4.payload();
            let tcp = TcpPacket::new(segment).ok_or(PduError::Truncated("tcp"))?;
            let (src, dst) = (ipv4.get_source(), ipv4.get_destination());
            let checksum_ok =
                verify_checksum.then(|| tcp::ipv4_checksum(&tcp, &src, &dst) == tcp.get_checksum());
            let offset = payload_offset(frame, segment, &tcp)?;
            Ok(Self::from_tcp(
                &tcp,
                IpAddr::V4(src),
                IpAddr::V4(dst),
                offset,
                checksum_ok,
                frame.timestamp,
            ))
        } else if ethertype == EtherTypes::Ipv6.0 {
            let ipv6 = Ipv6Packet::new(datagram).ok_or(PduError::Truncated("ipv6"))?;
            check_tcp(ipv6.get_next_header())?;
            let segment = ipv6.payload();
            let tcp = TcpPacket::new(segment).ok_or(PduError::Truncated("tcp"))?;
            let (src, dst): (Ipv6Addr, Ipv6Addr) = (ipv6.get_source(), ipv6.get_destination());
            let checksum_ok =
                verify_checksum.then(|| tcp::ipv6_checksum(&tcp, &src, &dst) == tcp.get_checksum());
            let offset = payload_offset(frame, segment, &tcp)?;
            Ok(Self::from_tcp(
                &tcp,
                IpAddr::V6(src),
                IpAddr::V6(dst),
                offset,
                checksum_ok,
                frame.timestamp,
            ))
        } else {
            Err(PduError::NotIp(ethertype))
        }
    }

    fn from_tcp(
        tcp: &TcpPacket,
        src: IpAddr,
        dst: IpAddr,
        (offset, length): (usize, usize),
        checksum_ok: Option<bool>,
        ts: SystemTime,
    ) -> Self {
        let mut options = TcpOptions::default();
        for option in tcp.get_options_iter() {
            let data = option.payload();
            let number = option.get_number();
            if number == TcpOptionNumbers::MSS && data.len() >= 2 {
                options.mss = Some(u16::from_be_bytes([data[0], data[1]]));
            } else if number == TcpOptionNumbers::WSCALE && !data.is_empty() {
                options.window_scale = Some(data[0]);
            }
        }
        #[allow(clippy::unnecessary_cast)]
        let flags = tcp.get_flags() as u8;
        L4Context {
            src: SocketAddr::new(src, tcp.get_source()),
            dst: SocketAddr::new(dst, tcp.get_destination()),
            offset,
            length,
            seq_no: tcp.get_sequence(),
            ack_no: tcp.get_acknowledgement(),
            flags,
            window: tcp.get_window(),
            options,
            checksum_ok,
            ts,
        }
    }

    /// Length of the payload in bytes.
    pub fn length(&self) -> usize {
        self.length
    }
}

fn ip_ethertype(version: u8) -> u16 {
    match version {
        4 => EtherTypes::Ipv4.0,
        6 => EtherTypes::Ipv6.0,
        _ => 0,
    }
}

fn check_tcp(next: IpNextHeaderProtocol) -> Result<(), PduError> {
    if next == IpNextHeaderProtocols::Tcp {
        Ok(())
    } else {
        Err(PduError::NotTcp(next.0))
    }
}

/// Locates the TCP payload inside the frame. The IP layer has already trimmed link-layer padding.
fn payload_offset(
    frame: &CapturedFrame,
    segment: &[u8],
    tcp: &TcpPacket,
) -> Result<(usize, usize), PduError> {
    let header_len = tcp.get_data_offset() as usize * 4;
    if header_len < 20 || header_len > segment.len() {
        return Err(PduError::Malformed);
    }
    let segment_start = segment.as_ptr() as usize - frame.data.as_ptr() as usize;
    Ok((segment_start + header_len, segment.len() - header_len))
}

/// Transport-layer protocol data unit for stream reassembly.
#[derive(Debug)]
pub struct L4Pdu {
    /// Payload bytes of the segment.
    pub(crate) data: Vec<u8>,
    /// Transport layer context, `offset` relative to `data`.
    pub(crate) ctxt: L4Context,
    /// `true` if segment is in the direction of orig -> resp.
    pub(crate) dir: bool,
}

impl L4Pdu {
    /// Copies the payload of `frame` described by `ctxt`.
    pub(crate) fn new(frame: &CapturedFrame, mut ctxt: L4Context, dir: bool) -> Self {
        let data = frame.data[ctxt.offset..ctxt.offset + ctxt.length].to_vec();
        ctxt.offset = 0;
        L4Pdu { data, ctxt, dir }
    }

    #[inline]
    pub(crate) fn payload(&self) -> &[u8] {
        &self.data[self.ctxt.offset..self.ctxt.offset + self.ctxt.length]
    }

    #[inline]
    pub(crate) fn length(&self) -> usize {
        self.ctxt.length
    }

    #[inline]
    pub(crate) fn seq_no(&self) -> u32 {
        self.ctxt.seq_no
    }

    #[inline]
    pub(crate) fn flags(&self) -> u8 {
        self.ctxt.flags
    }

    #[inline]
    pub(crate) fn ts(&self) -> SystemTime {
        self.ctxt.ts
    }
}

/// Host part of `addr`, with IPv4-mapped IPv6 addresses unwrapped.
pub(crate) fn host_of(addr: &SocketAddr) -> IpAddr {
    match addr.ip() {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FrameBuilder;

    #[test]
    fn decodes_ethernet_ipv4_tcp() {
        let frame = FrameBuilder::new("10.0.0.1:40000", "10.0.0.2:80")
            .seq(1000)
            .flags(ACK | PSH)
            .payload(b"hello")
            .build();
        let ctxt = L4Context::new(&frame, false).unwrap();
        assert_eq!(ctxt.src, "10.0.0.1:40000".parse().unwrap());
        assert_eq!(ctxt.dst, "10.0.0.2:80".parse().unwrap());
        assert_eq!(ctxt.seq_no, 1000);
        assert_eq!(ctxt.flags, ACK | PSH);
        assert_eq!(ctxt.length(), 5);
        assert_eq!(&frame.data[ctxt.offset..ctxt.offset + 5], b"hello");
        assert_eq!(ctxt.checksum_ok, None);

        let pdu = L4Pdu::new(&frame, ctxt, true);
        assert_eq!(pdu.payload(), b"hello");
    }

    #[test]
    fn decodes_syn_options() {
        let frame = FrameBuilder::new("10.0.0.1:40000", "10.0.0.2:80")
            .flags(SYN)
            .mss(1460)
            .build();
        let ctxt = L4Context::new(&frame, false).unwrap();
        assert_eq!(ctxt.options.mss, Some(1460));
        assert_eq!(ctxt.length(), 0);
    }

    #[test]
    fn checksum_is_verified_on_request() {
        let good = FrameBuilder::new("10.0.0.1:1", "10.0.0.2:2")
            .payload(b"abc")
            .build();
        assert_eq!(L4Context::new(&good, true).unwrap().checksum_ok, Some(true));

        let mut bad = good.clone();
        let last = bad.data.len() - 1;
        bad.data[last] ^= 0xff;
        assert_eq!(L4Context::new(&bad, true).unwrap().checksum_ok, Some(false));
    }

    #[test]
    fn rejects_non_tcp_and_truncated_frames() {
        let mut frame = FrameBuilder::new("10.0.0.1:1", "10.0.0.2:2").build();
        // IPv4 protocol field set to UDP
        frame.data[14 + 9] = 17;
        assert_eq!(L4Context::new(&frame, false).unwrap_err(), PduError::NotTcp(17));

        let short = CapturedFrame::new(SystemTime::now(), LinkType::Ethernet, vec![0; 6]);
        assert!(L4Context::new(&short, false).is_err());
    }

    #[test]
    fn decodes_raw_ip_frames() {
        let eth = FrameBuilder::new("10.0.0.1:1", "10.0.0.2:2")
            .payload(b"xyz")
            .build();
        let raw = CapturedFrame::new(eth.timestamp, LinkType::RawIp, eth.data[14..].to_vec());
        let ctxt = L4Context::new(&raw, false).unwrap();
        assert_eq!(ctxt.length(), 3);
        assert_eq!(&raw.data[ctxt.offset..], b"xyz");
    }
}
