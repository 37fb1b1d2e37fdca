use crate::conntrack::pdu::{ACK, FIN, RST, SYN};

/// Simplified TCP handshake/teardown states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpState {
    Closed,
    SynSent,
    SynReceived,
    Established,
    Closing,
}

/// Plausibility check of control flags against the connection's handshake progress.
#[derive(Debug)]
pub(crate) struct TcpStateMachine {
    state: TcpState,
    allow_missing_init: bool,
}

impl TcpStateMachine {
    pub(crate) fn new(allow_missing_init: bool) -> Self {
        TcpStateMachine {
            state: TcpState::Closed,
            allow_missing_init,
        }
    }

    pub(crate) fn state(&self) -> TcpState {
        self.state
    }

    /// Advances on a segment with `flags` sent in direction `dir` (`true` is orig -> resp).
    ///
    /// Returns `false` if the segment is not plausible in the current state. The state only moves
    /// on plausible segments.
    pub(crate) fn check(&mut self, flags: u8, dir: bool) -> bool {
        let syn = flags & SYN != 0;
        let ack = flags & ACK != 0;
        if flags & RST != 0 {
            self.state = TcpState::Closing;
            return true;
        }
        match self.state {
            TcpState::Closed => {
                if syn && !ack && dir {
                    self.state = TcpState::SynSent;
                    return true;
                }
            }
            TcpState::SynSent => {
                if syn && ack && !dir {
                    self.state = TcpState::SynReceived;
                    return true;
                }
                if syn && !ack && dir {
                    // retransmitted SYN
                    return true;
                }
            }
            TcpState::SynReceived => {
                if ack && !syn && dir {
                    self.state = TcpState::Established;
                    return self.check_established(flags);
                }
                if syn && ack && !dir {
                    return true;
                }
            }
            TcpState::Established => return self.check_established(flags),
            TcpState::Closing => return !syn,
        }
        if self.allow_missing_init && !syn && self.state == TcpState::Closed {
            self.state = TcpState::Established;
            return self.check_established(flags);
        }
        false
    }

    fn check_established(&mut self, flags: u8) -> bool {
        if flags & SYN != 0 {
            return false;
        }
        if flags & FIN != 0 {
            self.state = TcpState::Closing;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::pdu::PSH;

    #[test]
    fn full_handshake_is_plausible() {
        let mut fsm = TcpStateMachine::new(false);
        assert!(fsm.check(SYN, true));
        assert!(fsm.check(SYN | ACK, false));
        assert!(fsm.check(ACK, true));
        assert_eq!(fsm.state(), TcpState::Established);
        assert!(fsm.check(ACK | PSH, false));
        assert!(fsm.check(FIN | ACK, true));
        assert_eq!(fsm.state(), TcpState::Closing);
        assert!(fsm.check(FIN | ACK, false));
    }

    #[test]
    fn mid_stream_start_depends_on_policy() {
        let mut strict = TcpStateMachine::new(false);
        assert!(!strict.check(ACK | PSH, true));
        assert_eq!(strict.state(), TcpState::Closed);

        let mut lenient = TcpStateMachine::new(true);
        assert!(lenient.check(ACK | PSH, true));
        assert_eq!(lenient.state(), TcpState::Established);
    }

    #[test]
    fn syn_in_established_is_implausible() {
        let mut fsm = TcpStateMachine::new(true);
        assert!(fsm.check(ACK, true));
        assert!(!fsm.check(SYN, true));
        assert_eq!(fsm.state(), TcpState::Established);
    }

    #[test]
    fn synack_from_originator_is_implausible() {
        let mut fsm = TcpStateMachine::new(false);
        assert!(fsm.check(SYN, true));
        assert!(!fsm.check(SYN | ACK, true));
        assert_eq!(fsm.state(), TcpState::SynSent);
    }
}
