pub(crate) mod reassembly;

use self::reassembly::{BufferBudget, Limits, TcpFlow};
use crate::conntrack::pdu::{L4Pdu, FIN, RST};
use crate::conntrack::{TrackerConfig, Trackable};

/// Both directions of a TCP connection and the bytes they hold out of order.
pub(crate) struct TcpConn {
    pub(crate) ctos: TcpFlow,
    pub(crate) stoc: TcpFlow,
    /// Out-of-order bytes buffered across both flows.
    buffered: usize,
}

impl TcpConn {
    pub(crate) fn new() -> Self {
        TcpConn {
            ctos: TcpFlow::new(),
            stoc: TcpFlow::new(),
            buffered: 0,
        }
    }

    /// Insert TCP segment ordered into ctos or stoc flow
    #[inline]
    pub(crate) fn reassemble<T: Trackable>(
        &mut self,
        segment: L4Pdu,
        tracked: &mut T,
        budget: &BufferBudget,
        config: &TrackerConfig,
    ) {
        let mut limits = Limits {
            budget,
            buffered: &mut self.buffered,
            per_conn: config.max_buffered_bytes_per_connection,
            allow_missing_init: config.allow_missing_init,
        };
        if segment.dir {
            self.ctos.insert_segment(segment, tracked, &mut limits);
        } else {
            self.stoc.insert_segment(segment, tracked, &mut limits);
        }
    }

    /// Delivers whatever both flows still hold, skipping over missing data.
    pub(crate) fn flush<T: Trackable>(
        &mut self,
        tracked: &mut T,
        budget: &BufferBudget,
        config: &TrackerConfig,
    ) {
        let mut limits = Limits {
            budget,
            buffered: &mut self.buffered,
            per_conn: config.max_buffered_bytes_per_connection,
            allow_missing_init: config.allow_missing_init,
        };
        self.ctos.flush_all(tracked, &mut limits);
        self.stoc.flush_all(tracked, &mut limits);
    }

    /// Out-of-order bytes currently buffered.
    pub(crate) fn buffered(&self) -> usize {
        self.buffered
    }

    /// Returns `true` if the connection should be terminated
    #[inline]
    pub(crate) fn is_terminated(&self) -> bool {
        // Both sides have sent FIN, or a RST has been sent
        (self.ctos.consumed_flags & self.stoc.consumed_flags & FIN
            | self.ctos.consumed_flags & RST
            | self.stoc.consumed_flags & RST)
            != 0
    }

    /// Updates connection termination flags
    #[inline]
    pub(crate) fn update_term_condition(&mut self, flags: u8, dir: bool) {
        if dir {
            self.ctos.consumed_flags |= flags;
        } else {
            self.stoc.consumed_flags |= flags;
        }
    }
}
