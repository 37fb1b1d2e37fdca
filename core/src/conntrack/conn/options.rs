use crate::conntrack::conn::tcp_conn::reassembly::wrapping_lt;
use crate::conntrack::pdu::{L4Context, ACK, RST, SYN};

use thiserror::Error;

/// Maximum window scale shift (RFC 7323).
const MAX_WINDOW_SCALE: u8 = 14;

/// Segment inconsistent with what the peer advertised.
#[derive(Error, Debug, PartialEq, Eq)]
pub(crate) enum OptionViolation {
    #[error("segment of {len} bytes exceeds the peer's MSS of {mss}")]
    ExceedsMss { len: usize, mss: u16 },

    #[error("segment ending at {end} exceeds the peer's window ending at {limit}")]
    OutOfWindow { end: u32, limit: u32 },
}

#[derive(Debug, Default, Clone, Copy)]
struct Advertised {
    mss: Option<u16>,
    window_scale: Option<u8>,
    ack: Option<u32>,
    window: u32,
}

/// Tracks handshake options and receive windows per direction.
#[derive(Debug, Default)]
pub(crate) struct OptionChecker {
    /// Indexed by direction, `1` for orig -> resp.
    dirs: [Advertised; 2],
}

impl OptionChecker {
    /// Records what the sender of `ctxt` advertises and checks the segment against what the
    /// receiver advertised.
    pub(crate) fn accept(&mut self, ctxt: &L4Context, dir: bool) -> Result<(), OptionViolation> {
        let (own, peer) = if dir { (1, 0) } else { (0, 1) };

        if ctxt.flags & SYN != 0 {
            let sender = &mut self.dirs[own];
            sender.mss = ctxt.options.mss;
            sender.window_scale = ctxt.options.window_scale.map(|s| s.min(MAX_WINDOW_SCALE));
        }

        let receiver = self.dirs[peer];
        let result = if ctxt.flags & (SYN | RST) != 0 {
            Ok(())
        } else {
            self.check_peer(ctxt, &receiver)
        };

        if ctxt.flags & ACK != 0 {
            let sender = &mut self.dirs[own];
            // scaling only applies once both sides negotiated it, never on the SYN itself
            let shift = match (sender.window_scale, receiver.window_scale) {
                (Some(scale), Some(_)) if ctxt.flags & SYN == 0 => scale,
                _ => 0,
            };
            sender.ack = Some(ctxt.ack_no);
            sender.window = (ctxt.window as u32) << shift;
        }
        result
    }

    fn check_peer(&self, ctxt: &L4Context, receiver: &Advertised) -> Result<(), OptionViolation> {
        let len = ctxt.length();
        if let Some(mss) = receiver.mss {
            if len > mss as usize {
                return Err(OptionViolation::ExceedsMss { len, mss });
            }
        }
        if let Some(ack) = receiver.ack {
            if receiver.window > 0 && len > 0 {
                let end = ctxt.seq_no.wrapping_add(len as u32);
                let limit = ack.wrapping_add(receiver.window);
                if wrapping_lt(limit, end) {
                    return Err(OptionViolation::OutOfWindow { end, limit });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::pdu::PSH;
    use crate::testing::FrameBuilder;

    fn ctxt(builder: FrameBuilder) -> L4Context {
        L4Context::new(&builder.build(), false).unwrap()
    }

    #[test]
    fn oversized_segment_violates_peer_mss() {
        let mut checker = OptionChecker::default();
        let syn = ctxt(FrameBuilder::new("10.0.0.1:1", "10.0.0.2:2").flags(SYN).mss(4));
        let synack = ctxt(
            FrameBuilder::new("10.0.0.2:2", "10.0.0.1:1")
                .flags(SYN | ACK)
                .mss(8),
        );
        assert!(checker.accept(&syn, true).is_ok());
        assert!(checker.accept(&synack, false).is_ok());

        let small = ctxt(
            FrameBuilder::new("10.0.0.1:1", "10.0.0.2:2")
                .flags(ACK | PSH)
                .payload(b"12345678"),
        );
        assert!(checker.accept(&small, true).is_ok());

        let big = ctxt(
            FrameBuilder::new("10.0.0.1:1", "10.0.0.2:2")
                .flags(ACK | PSH)
                .payload(b"123456789"),
        );
        assert_eq!(
            checker.accept(&big, true),
            Err(OptionViolation::ExceedsMss { len: 9, mss: 8 })
        );
    }

    #[test]
    fn segment_beyond_advertised_window_is_flagged() {
        let mut checker = OptionChecker::default();
        // resp acknowledges up to 100 with a window of 65535
        let ack = ctxt(
            FrameBuilder::new("10.0.0.2:2", "10.0.0.1:1")
                .flags(ACK)
                .ack(100),
        );
        assert!(checker.accept(&ack, false).is_ok());

        let inside = ctxt(
            FrameBuilder::new("10.0.0.1:1", "10.0.0.2:2")
                .seq(100)
                .payload(b"data"),
        );
        assert!(checker.accept(&inside, true).is_ok());

        let outside = ctxt(
            FrameBuilder::new("10.0.0.1:1", "10.0.0.2:2")
                .seq(100 + 70_000)
                .payload(b"data"),
        );
        assert!(matches!(
            checker.accept(&outside, true),
            Err(OptionViolation::OutOfWindow { .. })
        ));
    }
}
