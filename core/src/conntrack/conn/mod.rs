//! State management for connections.
//!
//! Tracks a TCP connection, checks each segment for plausibility, and performs stream reassembly
//! on behalf of the connection's [Trackable].

pub(crate) mod fsm;
pub(crate) mod options;
pub(crate) mod tcp_conn;

use self::fsm::TcpStateMachine;
use self::options::OptionChecker;
use self::tcp_conn::reassembly::BufferBudget;
use self::tcp_conn::TcpConn;
use crate::conntrack::conn_id::Flow;
use crate::conntrack::pdu::{CapturedFrame, L4Context, L4Pdu};
use crate::conntrack::{TrackerConfig, Trackable};
use crate::stats::{
    StatExt, CONNS_WITH_FSM_ERRORS, REJECT_CHECKSUM, REJECT_FSM, REJECT_OPTIONS,
    SEGMENTS_ACCEPTED,
};

use std::sync::Arc;
use std::time::Instant;

/// Admission checks of one connection.
///
/// Runs before the connection has a consumer, so a rejected first segment allocates nothing.
pub(crate) struct Admission {
    fsm: TcpStateMachine,
    options: OptionChecker,
    /// Set once the first FSM violation has been counted.
    fsm_error_seen: bool,
}

impl Admission {
    pub(crate) fn new(config: &TrackerConfig) -> Self {
        Admission {
            fsm: TcpStateMachine::new(config.allow_missing_init),
            options: OptionChecker::default(),
            fsm_error_seen: false,
        }
    }

    /// Runs the admission checks. Every failure is counted; only those the policy hard-rejects
    /// refuse the segment.
    pub(crate) fn admit(
        &mut self,
        flow: &Flow,
        ctxt: &L4Context,
        dir: bool,
        config: &TrackerConfig,
    ) -> bool {
        let mut accept = true;
        if !self.fsm.check(ctxt.flags, dir) {
            REJECT_FSM.inc();
            if !self.fsm_error_seen {
                self.fsm_error_seen = true;
                CONNS_WITH_FSM_ERRORS.inc();
            }
            log::debug!(
                "{}: implausible flags {:#010b} in {:?}",
                flow,
                ctxt.flags,
                self.fsm.state()
            );
            if config.reject_fsm_errors {
                accept = false;
            }
        }
        if let Err(violation) = self.options.accept(ctxt, dir) {
            REJECT_OPTIONS.inc();
            log::debug!("{}: {}", flow, violation);
            if config.reject_option_errors {
                accept = false;
            }
        }
        if config.verify_checksum && ctxt.checksum_ok == Some(false) {
            REJECT_CHECKSUM.inc();
            log::debug!("{}: bad checksum on seq {}", flow, ctxt.seq_no);
            accept = false;
        }
        if accept {
            SEGMENTS_ACCEPTED.inc();
        } else {
            log::warn!("{}: segment seq {} rejected", flow, ctxt.seq_no);
        }
        accept
    }
}

/// Connection state.
pub(crate) struct Conn<T>
where
    T: Trackable,
{
    /// Timestamp of the last observed packet in the connection.
    pub(crate) last_seen_ts: Instant,
    /// Amount of time (in milliseconds) before the connection should be expired for inactivity.
    pub(crate) inactivity_window: usize,
    /// Client and server endpoints.
    pub(crate) flow: Flow,
    /// Reassembly state.
    pub(crate) tcp_conn: TcpConn,
    admission: Admission,
    budget: Arc<BufferBudget>,
    /// Consumer of reassembled data.
    pub(crate) tracked: T,
}

impl<T> Conn<T>
where
    T: Trackable,
{
    /// Connection whose first segment already passed `admission`.
    pub(super) fn new(
        flow: Flow,
        admission: Admission,
        tracked: T,
        config: &TrackerConfig,
        budget: Arc<BufferBudget>,
    ) -> Self {
        Conn {
            last_seen_ts: Instant::now(),
            inactivity_window: config.stale_timeout,
            flow,
            tcp_conn: TcpConn::new(),
            admission,
            budget,
            tracked,
        }
    }

    /// Returns the `true` if the packet represented by `ctxt` is in the direction of originator ->
    /// responder.
    pub(super) fn packet_dir(&self, ctxt: &L4Context) -> bool {
        self.flow.orig == ctxt.src
    }

    /// Updates a connection on the arrival of a new segment.
    pub(super) fn update(
        &mut self,
        frame: &CapturedFrame,
        ctxt: L4Context,
        dir: bool,
        config: &TrackerConfig,
    ) {
        if !self.admission.admit(&self.flow, &ctxt, dir, config) {
            return;
        }
        self.ingest(frame, ctxt, dir, config);
    }

    /// Reassembles an admitted segment.
    pub(super) fn ingest(
        &mut self,
        frame: &CapturedFrame,
        ctxt: L4Context,
        dir: bool,
        config: &TrackerConfig,
    ) {
        if self.tracked.wants_payload() {
            let pdu = L4Pdu::new(frame, ctxt, dir);
            self.tcp_conn
                .reassemble(pdu, &mut self.tracked, &self.budget, config);
        } else {
            // Ensure FIN is handled
            self.tcp_conn.update_term_condition(ctxt.flags, dir);
        }
    }

    /// Returns `true` if the connection has been naturally terminated.
    pub(super) fn terminated(&self) -> bool {
        self.tcp_conn.is_terminated()
    }

    /// Invokes connection termination tasks that are triggered when any of the following conditions
    /// occur:
    /// - the connection naturally terminates (e.g., FIN/RST)
    /// - the connection expires due to inactivity
    /// - the connection is drained at the end of the run
    pub(crate) fn terminate(&mut self, config: &TrackerConfig) {
        self.tcp_conn
            .flush(&mut self.tracked, &self.budget, config);
        self.tracked.complete();
    }
}

impl<T> Drop for Conn<T>
where
    T: Trackable,
{
    fn drop(&mut self) {
        self.budget.release(self.tcp_conn.buffered());
    }
}
