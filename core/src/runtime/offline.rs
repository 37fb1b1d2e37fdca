//! Segment sources replaying capture files.

use super::{SegmentSource, SourceError};
use crate::config::OfflineConfig;
use crate::conntrack::pdu::{CapturedFrame, LinkType};

use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};

const READER_BUFFER: usize = 65536;

/// Magic numbers of nanosecond-resolution files, as read in either byte order.
const NANOSECOND_MAGIC: [u32; 2] = [0xa1b2_3c4d, 0x4d3c_b2a1];

/// Reads frames from a legacy pcap file.
pub struct OfflineSource {
    name: String,
    reader: LegacyPcapReader<Box<dyn Read + Send>>,
    link_type: Option<LinkType>,
    nanosecond: bool,
    mtu: usize,
    oversized: u64,
}

impl OfflineSource {
    /// Opens the capture file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: &OfflineConfig) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.display().to_string(),
            source,
        })?;
        log::info!("Replaying capture file {}", path.display());
        OfflineSource::from_reader(path.display().to_string(), Box::new(file), config.mtu)
    }

    /// Reads a capture from any byte source.
    pub fn from_reader(
        name: String,
        input: Box<dyn Read + Send>,
        mtu: usize,
    ) -> Result<Self, SourceError> {
        let reader = LegacyPcapReader::new(READER_BUFFER, input)
            .map_err(|e| SourceError::Format(format!("{}: {:?}", name, e)))?;
        Ok(OfflineSource {
            name,
            reader,
            link_type: None,
            nanosecond: false,
            mtu,
            oversized: 0,
        })
    }

    /// Frames skipped for exceeding the MTU.
    pub fn oversized(&self) -> u64 {
        self.oversized
    }
}

fn capture_time(nanosecond: bool, sec: u32, frac: u32) -> SystemTime {
    let frac = if nanosecond {
        Duration::from_nanos(u64::from(frac))
    } else {
        Duration::from_micros(u64::from(frac))
    };
    UNIX_EPOCH + Duration::from_secs(u64::from(sec)) + frac
}

impl SegmentSource for OfflineSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self) -> Result<Option<CapturedFrame>, SourceError> {
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let frame = match block {
                        PcapBlockOwned::LegacyHeader(header) => {
                            self.nanosecond = NANOSECOND_MAGIC.contains(&header.magic_number);
                            let linktype = header.network.0;
                            self.reader.consume(offset);
                            match LinkType::from_pcap(linktype) {
                                Some(link_type) => self.link_type = Some(link_type),
                                None => {
                                    return Err(SourceError::Format(format!(
                                        "{}: unsupported link type {}",
                                        self.name, linktype
                                    )))
                                }
                            }
                            None
                        }
                        PcapBlockOwned::Legacy(packet) => {
                            let origlen = packet.origlen as usize;
                            let ts = capture_time(self.nanosecond, packet.ts_sec, packet.ts_usec);
                            let data = packet.data.to_vec();
                            self.reader.consume(offset);
                            if origlen > self.mtu {
                                self.oversized += 1;
                                log::debug!("{}: skipping frame of {} bytes", self.name, origlen);
                                None
                            } else {
                                let link_type = self.link_type.ok_or_else(|| {
                                    SourceError::Format(format!("{}: missing header", self.name))
                                })?;
                                Some(CapturedFrame::new(ts, link_type, data))
                            }
                        }
                        _ => {
                            self.reader.consume(offset);
                            None
                        }
                    };
                    if frame.is_some() {
                        return Ok(frame);
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    self.reader
                        .refill()
                        .map_err(|e| SourceError::Read(format!("{}: {:?}", self.name, e)))?;
                }
                Err(e) => return Err(SourceError::Read(format!("{}: {:?}", self.name, e))),
            }
        }
    }

    fn is_replay(&self) -> bool {
        true
    }
}

/// Hands out frames held in memory.
#[derive(Debug)]
pub struct MemorySource {
    name: String,
    frames: VecDeque<CapturedFrame>,
}

impl MemorySource {
    pub fn new<I: IntoIterator<Item = CapturedFrame>>(name: &str, frames: I) -> Self {
        MemorySource {
            name: name.to_owned(),
            frames: frames.into_iter().collect(),
        }
    }
}

impl SegmentSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self) -> Result<Option<CapturedFrame>, SourceError> {
        Ok(self.frames.pop_front())
    }

    fn is_replay(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::pdu::SYN;
    use crate::testing::FrameBuilder;

    use std::io::Cursor;

    fn pcap_file(magic: u32, linktype: u32, frames: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(&magic.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&65535u32.to_le_bytes());
        out.extend_from_slice(&linktype.to_le_bytes());
        for (sec, frac, data) in frames {
            out.extend_from_slice(&sec.to_le_bytes());
            out.extend_from_slice(&frac.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }
        out
    }

    fn source(bytes: Vec<u8>, mtu: usize) -> OfflineSource {
        OfflineSource::from_reader("test.pcap".to_owned(), Box::new(Cursor::new(bytes)), mtu)
            .unwrap()
    }

    #[test]
    fn frames_are_replayed_in_order() {
        let syn = FrameBuilder::new("10.0.0.1:40000", "10.0.0.2:80")
            .seq(100)
            .flags(SYN)
            .build()
            .data;
        let data = FrameBuilder::new("10.0.0.1:40000", "10.0.0.2:80")
            .seq(101)
            .payload(b"hello")
            .build()
            .data;
        let bytes = pcap_file(
            0xa1b2_c3d4,
            1,
            &[(1_000, 250, syn.clone()), (1_001, 500, data.clone())],
        );
        let mut src = source(bytes, 9702);
        assert!(src.is_replay());

        let first = src.next_frame().unwrap().unwrap();
        assert_eq!(first.link_type, LinkType::Ethernet);
        assert_eq!(first.data, syn);
        assert_eq!(
            first.timestamp,
            UNIX_EPOCH + Duration::from_secs(1_000) + Duration::from_micros(250)
        );
        let second = src.next_frame().unwrap().unwrap();
        assert_eq!(second.data, data);
        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn nanosecond_timestamps() {
        let bytes = pcap_file(0xa1b2_3c4d, 101, &[(5, 7, vec![0x45; 20])]);
        let mut src = source(bytes, 9702);
        let frame = src.next_frame().unwrap().unwrap();
        assert_eq!(frame.link_type, LinkType::RawIp);
        assert_eq!(
            frame.timestamp,
            UNIX_EPOCH + Duration::from_secs(5) + Duration::from_nanos(7)
        );
    }

    #[test]
    fn oversized_frames_are_skipped() {
        let bytes = pcap_file(
            0xa1b2_c3d4,
            1,
            &[(1, 0, vec![0; 200]), (2, 0, vec![0; 60])],
        );
        let mut src = source(bytes, 100);
        let frame = src.next_frame().unwrap().unwrap();
        assert_eq!(frame.data.len(), 60);
        assert_eq!(src.oversized(), 1);
        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn unknown_link_type_fails() {
        let bytes = pcap_file(0xa1b2_c3d4, 147, &[(1, 0, vec![0; 60])]);
        let mut src = source(bytes, 9702);
        assert!(matches!(src.next_frame(), Err(SourceError::Format(_))));
    }
}
