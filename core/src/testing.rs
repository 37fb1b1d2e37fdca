//! Frame builders for unit tests.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime};

use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpPacket};

use crate::conntrack::pdu::{CapturedFrame, LinkType, ACK, FIN, PSH, SYN};

const ETH_LEN: usize = 14;
const IPV4_LEN: usize = 20;
const TCP_LEN: usize = 20;

/// Builds a single Ethernet/IPv4/TCP frame.
pub(crate) struct FrameBuilder {
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    mss: Option<u16>,
    payload: Vec<u8>,
    ts: SystemTime,
}

impl FrameBuilder {
    pub(crate) fn new(src: &str, dst: &str) -> Self {
        FrameBuilder {
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
            seq: 0,
            ack: 0,
            flags: ACK,
            window: 65535,
            mss: None,
            payload: vec![],
            ts: SystemTime::now(),
        }
    }

    pub(crate) fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub(crate) fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    pub(crate) fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn mss(mut self, mss: u16) -> Self {
        self.mss = Some(mss);
        self
    }

    pub(crate) fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub(crate) fn ts(mut self, ts: SystemTime) -> Self {
        self.ts = ts;
        self
    }

    pub(crate) fn build(self) -> CapturedFrame {
        let (src_ip, dst_ip) = match (self.src.ip(), self.dst.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => (src, dst),
            _ => panic!("FrameBuilder only builds IPv4 frames"),
        };
        let opts_len = if self.mss.is_some() { 4 } else { 0 };
        let tcp_len = TCP_LEN + opts_len + self.payload.len();
        let mut buf = vec![0u8; ETH_LEN + IPV4_LEN + tcp_len];

        let mut eth = MutableEthernetPacket::new(&mut buf[..]).unwrap();
        eth.set_ethertype(EtherTypes::Ipv4);

        let mut ip = MutableIpv4Packet::new(&mut buf[ETH_LEN..]).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length((IPV4_LEN + tcp_len) as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip.set_source(src_ip);
        ip.set_destination(dst_ip);
        let ip_checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(ip_checksum);

        let tcp_start = ETH_LEN + IPV4_LEN;
        let mut tcp_hdr = MutableTcpPacket::new(&mut buf[tcp_start..]).unwrap();
        tcp_hdr.set_source(self.src.port());
        tcp_hdr.set_destination(self.dst.port());
        tcp_hdr.set_sequence(self.seq);
        tcp_hdr.set_acknowledgement(self.ack);
        tcp_hdr.set_data_offset(((TCP_LEN + opts_len) / 4) as u8);
        tcp_hdr.set_window(self.window);
        // flags byte written directly, independent of the packet accessor width
        buf[tcp_start + 13] = self.flags;
        if let Some(mss) = self.mss {
            let [hi, lo] = mss.to_be_bytes();
            buf[tcp_start + TCP_LEN..tcp_start + TCP_LEN + 4].copy_from_slice(&[2, 4, hi, lo]);
        }
        buf[tcp_start + TCP_LEN + opts_len..].copy_from_slice(&self.payload);

        let checksum = tcp::ipv4_checksum(
            &TcpPacket::new(&buf[tcp_start..]).unwrap(),
            &src_ip,
            &dst_ip,
        );
        buf[tcp_start + 16..tcp_start + 18].copy_from_slice(&checksum.to_be_bytes());

        CapturedFrame::new(self.ts, LinkType::Ethernet, buf)
    }
}

/// Tracks both sequence spaces of one TCP connection and builds its frames in turn.
pub(crate) struct Conversation {
    pub(crate) client: SocketAddr,
    pub(crate) server: SocketAddr,
    pub(crate) client_seq: u32,
    pub(crate) server_seq: u32,
    ts: SystemTime,
}

impl Conversation {
    pub(crate) fn new(client: &str, server: &str) -> Self {
        Conversation {
            client: client.parse().unwrap(),
            server: server.parse().unwrap(),
            client_seq: 1000,
            server_seq: 5000,
            ts: SystemTime::now(),
        }
    }

    fn tick(&mut self) -> SystemTime {
        self.ts += Duration::from_millis(1);
        self.ts
    }

    fn frame(&mut self, from_client: bool, flags: u8, payload: &[u8]) -> CapturedFrame {
        let ts = self.tick();
        let (src, dst, seq, ack) = if from_client {
            (self.client, self.server, self.client_seq, self.server_seq)
        } else {
            (self.server, self.client, self.server_seq, self.client_seq)
        };
        FrameBuilder::new(&src.to_string(), &dst.to_string())
            .seq(seq)
            .ack(ack)
            .flags(flags)
            .payload(payload)
            .ts(ts)
            .build()
    }

    /// SYN, SYN/ACK, ACK.
    pub(crate) fn handshake(&mut self) -> Vec<CapturedFrame> {
        let syn = self.frame(true, SYN, &[]);
        self.client_seq = self.client_seq.wrapping_add(1);
        let synack = self.frame(false, SYN | ACK, &[]);
        self.server_seq = self.server_seq.wrapping_add(1);
        let ack = self.frame(true, ACK, &[]);
        vec![syn, synack, ack]
    }

    pub(crate) fn client_data(&mut self, payload: &[u8]) -> CapturedFrame {
        let frame = self.frame(true, ACK | PSH, payload);
        self.client_seq = self.client_seq.wrapping_add(payload.len() as u32);
        frame
    }

    pub(crate) fn server_data(&mut self, payload: &[u8]) -> CapturedFrame {
        let frame = self.frame(false, ACK | PSH, payload);
        self.server_seq = self.server_seq.wrapping_add(payload.len() as u32);
        frame
    }

    /// Splits `payload` into client segments of at most `mss` bytes.
    pub(crate) fn client_segments(&mut self, payload: &[u8], mss: usize) -> Vec<CapturedFrame> {
        payload
            .chunks(mss)
            .map(|chunk| self.client_data(chunk))
            .collect()
    }

    /// FIN from both sides.
    pub(crate) fn teardown(&mut self) -> Vec<CapturedFrame> {
        let client_fin = self.frame(true, FIN | ACK, &[]);
        self.client_seq = self.client_seq.wrapping_add(1);
        let server_fin = self.frame(false, FIN | ACK, &[]);
        self.server_seq = self.server_seq.wrapping_add(1);
        vec![client_fin, server_fin]
    }
}
