#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime};

use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags, TcpPacket};

use tapwire_core::{CapturedFrame, LinkType};

const ETH_LEN: usize = 14;
const IPV4_LEN: usize = 20;
const TCP_LEN: usize = 20;

/// Writes an Ethernet/IPv4/TCP frame with valid checksums.
pub fn tcp_frame(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let (src_ip, dst_ip) = match (src.ip(), dst.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => (src, dst),
        _ => panic!("IPv4 only"),
    };
    let mut buf = vec![0u8; ETH_LEN + IPV4_LEN + TCP_LEN + payload.len()];

    let mut eth = MutableEthernetPacket::new(&mut buf[..]).unwrap();
    eth.set_ethertype(EtherTypes::Ipv4);

    let mut ip = MutableIpv4Packet::new(&mut buf[ETH_LEN..]).unwrap();
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_total_length((IPV4_LEN + TCP_LEN + payload.len()) as u16);
    ip.set_ttl(64);
    ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
    ip.set_source(src_ip);
    ip.set_destination(dst_ip);
    let checksum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(checksum);

    let start = ETH_LEN + IPV4_LEN;
    let mut segment = MutableTcpPacket::new(&mut buf[start..]).unwrap();
    segment.set_source(src.port());
    segment.set_destination(dst.port());
    segment.set_sequence(seq);
    segment.set_acknowledgement(ack);
    segment.set_data_offset(5);
    segment.set_window(65535);
    segment.set_payload(payload);
    buf[start + 13] = flags;
    let checksum = tcp::ipv4_checksum(&TcpPacket::new(&buf[start..]).unwrap(), &src_ip, &dst_ip);
    buf[start + 16..start + 18].copy_from_slice(&checksum.to_be_bytes());
    buf
}

/// One TCP connection, both sequence spaces.
pub struct Session {
    client: SocketAddr,
    server: SocketAddr,
    client_seq: u32,
    server_seq: u32,
    ts: SystemTime,
    pub frames: Vec<CapturedFrame>,
}

impl Session {
    pub fn new(client: &str, server: &str) -> Self {
        Session {
            client: client.parse().unwrap(),
            server: server.parse().unwrap(),
            client_seq: 7_000,
            server_seq: 90_000,
            ts: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            frames: vec![],
        }
    }

    fn push(&mut self, from_client: bool, flags: u8, payload: &[u8]) {
        self.ts += Duration::from_millis(2);
        let (src, dst, seq, ack) = if from_client {
            (self.client, self.server, self.client_seq, self.server_seq)
        } else {
            (self.server, self.client, self.server_seq, self.client_seq)
        };
        let data = tcp_frame(src, dst, seq, ack, flags, payload);
        self.frames
            .push(CapturedFrame::new(self.ts, LinkType::Ethernet, data));
    }

    pub fn handshake(mut self) -> Self {
        self.push(true, TcpFlags::SYN as u8, &[]);
        self.client_seq = self.client_seq.wrapping_add(1);
        self.push(false, (TcpFlags::SYN | TcpFlags::ACK) as u8, &[]);
        self.server_seq = self.server_seq.wrapping_add(1);
        self.push(true, TcpFlags::ACK as u8, &[]);
        self
    }

    pub fn client(mut self, payload: &[u8]) -> Self {
        self.push(true, (TcpFlags::ACK | TcpFlags::PSH) as u8, payload);
        self.client_seq = self.client_seq.wrapping_add(payload.len() as u32);
        self
    }

    pub fn server(mut self, payload: &[u8]) -> Self {
        self.push(false, (TcpFlags::ACK | TcpFlags::PSH) as u8, payload);
        self.server_seq = self.server_seq.wrapping_add(payload.len() as u32);
        self
    }

    pub fn close(mut self) -> Vec<CapturedFrame> {
        self.push(true, (TcpFlags::FIN | TcpFlags::ACK) as u8, &[]);
        self.client_seq = self.client_seq.wrapping_add(1);
        self.push(false, (TcpFlags::FIN | TcpFlags::ACK) as u8, &[]);
        self.frames
    }
}

/// A DNS message with one `example.com` question and, for responses, one A record.
pub fn dns_message(id: u16, response: bool) -> Vec<u8> {
    let mut msg = id.to_be_bytes().to_vec();
    msg.extend_from_slice(if response { &[0x81, 0x80] } else { &[0x01, 0x00] });
    msg.extend_from_slice(&[0, 1, 0, u8::from(response), 0, 0, 0, 0]);
    msg.extend_from_slice(&[7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0]);
    msg.extend_from_slice(&[0, 1, 0, 1]);
    if response {
        msg.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 93, 184, 216, 34]);
    }
    let mut framed = (msg.len() as u16).to_be_bytes().to_vec();
    framed.extend(msg);
    framed
}

/// A Kafka request frame with an empty body.
pub fn kafka_request(
    api_key: i16,
    api_version: i16,
    correlation_id: i32,
    client_id: &str,
) -> Vec<u8> {
    let mut body = vec![];
    body.extend_from_slice(&api_key.to_be_bytes());
    body.extend_from_slice(&api_version.to_be_bytes());
    body.extend_from_slice(&correlation_id.to_be_bytes());
    body.extend_from_slice(&(client_id.len() as i16).to_be_bytes());
    body.extend_from_slice(client_id.as_bytes());
    let mut frame = (body.len() as i32).to_be_bytes().to_vec();
    frame.extend(body);
    frame
}

pub fn kafka_response(correlation_id: i32, payload: &[u8]) -> Vec<u8> {
    let mut body = correlation_id.to_be_bytes().to_vec();
    body.extend_from_slice(payload);
    let mut frame = (body.len() as i32).to_be_bytes().to_vec();
    frame.extend(body);
    frame
}

/// Writes `frames` as a microsecond-resolution Ethernet pcap.
pub fn pcap_bytes(frames: &[CapturedFrame]) -> Vec<u8> {
    let mut out = vec![];
    out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(&65535u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    for frame in frames {
        let since = frame.timestamp.duration_since(SystemTime::UNIX_EPOCH).unwrap();
        out.extend_from_slice(&(since.as_secs() as u32).to_le_bytes());
        out.extend_from_slice(&since.subsec_micros().to_le_bytes());
        out.extend_from_slice(&(frame.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(frame.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&frame.data);
    }
    out
}
