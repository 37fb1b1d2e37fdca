use crate::conntrack::pdu::{L4Pdu, FIN, RST, SYN};
use crate::conntrack::Trackable;
use crate::stats::{StatExt, FORCED_FLUSHES};

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

/// Bytes permanently missing ahead of a delivered range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// The range continues the previously delivered one.
    None,
    /// First range of a flow whose start was never observed. Not a gap.
    Unknown,
    /// This many bytes were lost and will never be delivered.
    Lost(usize),
}

/// Reassembly bookkeeping attached to a delivered range.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RangeStats {
    /// Number of segments that make up the range.
    pub packets: usize,
    /// Bytes of the range that waited in the out-of-order buffer.
    pub queued_bytes: usize,
    /// Segments of the range that waited in the out-of-order buffer.
    pub queued_packets: usize,
    /// Retransmitted bytes discarded since the previous range.
    pub overlap_bytes: usize,
    /// Fully retransmitted segments discarded since the previous range.
    pub overlap_packets: usize,
}

/// A contiguous, in-order byte range handed to a [Trackable].
pub struct ScatterGather<'a> {
    data: Cow<'a, [u8]>,
    dir: bool,
    skip: Skip,
    seen: SystemTime,
    stats: RangeStats,
    keep_from: Option<usize>,
}

impl<'a> ScatterGather<'a> {
    /// Range bytes, prefixed by whatever the previous range asked to keep.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// `true` if the range flows from originator to responder.
    pub fn dir(&self) -> bool {
        self.dir
    }

    pub fn skip(&self) -> Skip {
        self.skip
    }

    /// Capture time of the segment that completed the range.
    pub fn seen(&self) -> SystemTime {
        self.seen
    }

    pub fn stats(&self) -> RangeStats {
        self.stats
    }

    /// Retains `data()[offset..]` and prepends it to the next range of this direction.
    pub fn keep_from(&mut self, offset: usize) {
        self.keep_from = Some(offset.min(self.data.len()));
    }
}

/// Out-of-order bytes buffered across every connection sharing this budget.
#[derive(Debug)]
pub struct BufferBudget {
    used: AtomicUsize,
    limit: usize,
}

impl BufferBudget {
    pub fn new(limit: usize) -> Self {
        BufferBudget {
            used: AtomicUsize::new(0),
            limit,
        }
    }

    /// Bytes currently buffered.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub(crate) fn exceeded(&self) -> bool {
        self.used() > self.limit
    }

    pub(crate) fn charge(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Memory accounting handed to each insertion.
pub(crate) struct Limits<'a> {
    pub(crate) budget: &'a BufferBudget,
    /// Bytes buffered by the whole connection, both directions.
    pub(crate) buffered: &'a mut usize,
    pub(crate) per_conn: usize,
    pub(crate) allow_missing_init: bool,
}

impl<'a> Limits<'a> {
    fn over(&self) -> bool {
        *self.buffered > self.per_conn || self.budget.exceeded()
    }

    fn charge(&mut self, bytes: usize) {
        *self.buffered += bytes;
        self.budget.charge(bytes);
    }

    fn release(&mut self, bytes: usize) {
        *self.buffered -= bytes;
        self.budget.release(bytes);
    }
}

/// Represents a uni-directional TCP flow
#[derive(Debug)]
pub(crate) struct TcpFlow {
    /// Expected sequence number of next segment
    pub(super) next_seq: Option<u32>,
    /// Flow status for consumed control packets.
    /// Matches TCP flag bits.
    pub(crate) consumed_flags: u8,
    /// Out-of-order buffer
    pub(crate) ooo_buf: OutOfOrderBuffer,
    /// Bytes the consumer asked to see again with the next range.
    kept: Vec<u8>,
    /// Skip reported with the next delivered range.
    pending_skip: Skip,
    /// Retransmissions discarded since the last delivery.
    overlap_bytes: usize,
    overlap_packets: usize,
}

impl TcpFlow {
    #[inline]
    pub(super) fn new() -> Self {
        TcpFlow {
            next_seq: None,
            consumed_flags: 0,
            ooo_buf: OutOfOrderBuffer::new(),
            kept: vec![],
            pending_skip: Skip::None,
            overlap_bytes: 0,
            overlap_packets: 0,
        }
    }

    /// Attempt to insert incoming data segment into flow.
    /// Buffer future segments and drop old segments.
    /// Forces out-of-order delivery when the buffer exceeds its limits.
    pub(super) fn insert_segment<T: Trackable>(
        &mut self,
        mut segment: L4Pdu,
        tracked: &mut T,
        limits: &mut Limits<'_>,
    ) {
        let length = segment.length();
        let cur_seq = segment.seq_no();
        let flags = segment.flags();

        match self.next_seq {
            Some(next_seq) if next_seq == cur_seq => {
                // Segment is the next expected segment in the sequence
                self.consume(segment, tracked, false);
                self.flush_ooo_buffer(tracked, limits);
            }
            Some(next_seq) if wrapping_lt(next_seq, cur_seq) => {
                // Segment comes after the next expected segment
                self.buffer_ooo_seg(segment, tracked, limits);
            }
            Some(next_seq) => {
                if let Some(trimmed) = overlap(&mut segment, next_seq) {
                    // Segment starts before the next expected segment but has new data
                    self.overlap_bytes += trimmed;
                    self.consume(segment, tracked, false);
                    self.flush_ooo_buffer(tracked, limits);
                } else {
                    log::debug!(
                        "Dropping old segment. cur: {} expect: {}",
                        cur_seq,
                        next_seq
                    );
                    self.consumed_flags |= flags & RST;
                    if length > 0 {
                        self.overlap_bytes += length;
                        self.overlap_packets += 1;
                    }
                }
            }
            None if flags & SYN != 0 => {
                self.next_seq = Some(cur_seq);
                self.consume(segment, tracked, false);
                self.flush_ooo_buffer(tracked, limits);
            }
            None if limits.allow_missing_init => {
                if length == 0 && flags & (FIN | RST) == 0 {
                    // nothing to anchor on yet
                    return;
                }
                self.next_seq = Some(cur_seq);
                self.pending_skip = Skip::Unknown;
                self.consume(segment, tracked, false);
                self.flush_ooo_buffer(tracked, limits);
            }
            None => {
                // Wait for the handshake before delivering anything
                self.buffer_ooo_seg(segment, tracked, limits);
            }
        }
    }

    /// Accepts the segment at `next_seq` and delivers its payload.
    fn consume<T: Trackable>(&mut self, segment: L4Pdu, tracked: &mut T, queued: bool) {
        let flags = segment.flags();
        self.consumed_flags |= flags;
        let mut next_seq = segment.seq_no().wrapping_add(segment.length() as u32);
        if flags & (SYN | FIN) != 0 {
            next_seq = next_seq.wrapping_add(1);
        }
        self.next_seq = Some(next_seq);
        if segment.length() > 0 {
            self.deliver(segment, tracked, queued);
        }
    }

    fn deliver<T: Trackable>(&mut self, segment: L4Pdu, tracked: &mut T, queued: bool) {
        let skip = std::mem::replace(&mut self.pending_skip, Skip::None);
        if let Skip::Lost(_) = skip {
            // kept bytes cannot be continued across a gap
            self.kept.clear();
        }
        let length = segment.length();
        let stats = RangeStats {
            packets: 1,
            queued_bytes: if queued { length } else { 0 },
            queued_packets: queued as usize,
            overlap_bytes: std::mem::take(&mut self.overlap_bytes),
            overlap_packets: std::mem::take(&mut self.overlap_packets),
        };
        let data = if self.kept.is_empty() {
            Cow::Borrowed(segment.payload())
        } else {
            let mut joined = std::mem::take(&mut self.kept);
            joined.extend_from_slice(segment.payload());
            Cow::Owned(joined)
        };
        let mut sg = ScatterGather {
            data,
            dir: segment.dir,
            skip,
            seen: segment.ts(),
            stats,
            keep_from: None,
        };
        tracked.reassembled(&mut sg);
        if let Some(offset) = sg.keep_from {
            self.kept = sg.data[offset..].to_vec();
        }
    }

    /// Insert segment into ooo buffer, forcing delivery while over the memory limits.
    fn buffer_ooo_seg<T: Trackable>(
        &mut self,
        segment: L4Pdu,
        tracked: &mut T,
        limits: &mut Limits<'_>,
    ) {
        log::debug!("insert with seq : {:#?}", segment.seq_no());
        limits.charge(segment.length());
        self.ooo_buf.buf.push_back(segment);
        while limits.over() && self.ooo_buf.len() > 0 {
            FORCED_FLUSHES.inc();
            self.force_flush_oldest(tracked, limits);
        }
    }

    /// Delivers the earliest buffered segment past the gap in front of it.
    fn force_flush_oldest<T: Trackable>(&mut self, tracked: &mut T, limits: &mut Limits<'_>) {
        let segment = match self.ooo_buf.earliest(self.next_seq) {
            Some(index) => match self.ooo_buf.remove(index, limits) {
                Some(segment) => segment,
                None => return,
            },
            None => return,
        };
        let cur_seq = segment.seq_no();
        match self.next_seq {
            Some(next_seq) if !wrapping_lt(next_seq, cur_seq) => {
                // reachable without skipping, take the regular path
                self.insert_segment(segment, tracked, limits);
                return;
            }
            Some(next_seq) => {
                self.pending_skip = Skip::Lost(cur_seq.wrapping_sub(next_seq) as usize);
            }
            None => self.pending_skip = Skip::Unknown,
        }
        log::debug!(
            "Forced flush at seq {} ({:?}), {} bytes still buffered",
            cur_seq,
            self.pending_skip,
            *limits.buffered
        );
        self.next_seq = Some(cur_seq);
        self.consume(segment, tracked, true);
        self.flush_ooo_buffer(tracked, limits);
    }

    /// Delivers everything still buffered, in sequence order, skipping every gap.
    pub(super) fn flush_all<T: Trackable>(&mut self, tracked: &mut T, limits: &mut Limits<'_>) {
        while self.ooo_buf.len() > 0 {
            self.force_flush_oldest(tracked, limits);
        }
        self.kept.clear();
    }

    /// Consumes segments with expected data, retains segments with future data,
    /// and drops segments with old data.
    fn flush_ooo_buffer<T: Trackable>(&mut self, tracked: &mut T, limits: &mut Limits<'_>) {
        let mut index = 0;
        while index < self.ooo_buf.len() {
            let next_seq = match self.next_seq {
                Some(next_seq) => next_seq,
                None => return,
            };
            if self.consumed_flags & RST != 0 {
                return;
            }
            let cur_seq = self.ooo_buf.buf[index].seq_no();
            log::debug!("Flushing...current seq: {:#?}", cur_seq);

            if wrapping_lt(next_seq, cur_seq) {
                index += 1;
                continue;
            }
            let mut segment = match self.ooo_buf.remove(index, limits) {
                Some(segment) => segment,
                None => return,
            };
            if next_seq == cur_seq {
                self.consume(segment, tracked, true);
                index = 0;
            } else if let Some(trimmed) = overlap(&mut segment, next_seq) {
                self.overlap_bytes += trimmed;
                self.consume(segment, tracked, true);
                index = 0;
            } else {
                log::debug!("Dropping old segment during flush.");
                if segment.length() > 0 {
                    self.overlap_bytes += segment.length();
                    self.overlap_packets += 1;
                }
            }
        }
    }
}

/// A buffer to hold reordered TCP segments
#[derive(Debug, Default)]
pub(crate) struct OutOfOrderBuffer {
    pub(crate) buf: VecDeque<L4Pdu>,
}

impl OutOfOrderBuffer {
    fn new() -> Self {
        OutOfOrderBuffer::default()
    }

    /// Returns the number of elements in the buffer
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Removes the segment at `index`, returning its bytes to the budget.
    fn remove(&mut self, index: usize, limits: &mut Limits<'_>) -> Option<L4Pdu> {
        let segment = self.buf.remove(index)?;
        limits.release(segment.length());
        Some(segment)
    }

    /// Index of the segment closest after `next_seq`, or with the lowest sequence number when the
    /// flow has no anchor yet.
    fn earliest(&self, next_seq: Option<u32>) -> Option<usize> {
        let anchor = match next_seq {
            Some(next_seq) => next_seq,
            None => self
                .buf
                .iter()
                .map(L4Pdu::seq_no)
                .reduce(|a, b| if wrapping_lt(b, a) { b } else { a })?,
        };
        self.buf
            .iter()
            .enumerate()
            .min_by_key(|(_, segment)| segment.seq_no().wrapping_sub(anchor))
            .map(|(index, _)| index)
    }
}

pub(crate) fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    // From RFC1323:
    //     TCP determines if a data segment is "old" or "new" by testing
    //     whether its sequence number is within 2**31 bytes of the left edge
    //     of the window, and if it is not, discarding the data as "old".  To
    //     insure that new data is never mistakenly considered old and vice-
    //     versa, the left edge of the sender's window has to be at most
    //     2**31 away from the right edge of the receiver's window.
    lhs.wrapping_sub(rhs) > (1 << 31)
}

/// Check if a segment has overlapping data with the received bytes.
/// Trims the already received prefix and returns its length if there is new data.
fn overlap(segment: &mut L4Pdu, expected_seq: u32) -> Option<usize> {
    let length = segment.length();
    let cur_seq = segment.seq_no();
    let end_seq = cur_seq.wrapping_add(length as u32);

    let new_fin = end_seq == expected_seq && segment.flags() & FIN != 0;
    if wrapping_lt(expected_seq, end_seq) || new_fin {
        let overlap_data_len = expected_seq.wrapping_sub(cur_seq) as usize;
        log::debug!(
            "Overlap with new data size : {:#?}",
            length - overlap_data_len
        );
        segment.ctxt.offset += overlap_data_len;
        segment.ctxt.length -= overlap_data_len;
        segment.ctxt.seq_no = expected_seq;
        Some(overlap_data_len)
    } else {
        None
    }
}
