//! Bidirectional connection identifiers.
//!
//! Provides endpoint-specific (distinguishes client and server) and generic identifiers for
//! bi-directional TCP connections.

use crate::conntrack::pdu::{L4Context, ACK, SYN};

use std::cmp;
use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

/// Connection 4-tuple.
///
/// The sender of the first observed segment becomes the originator `orig` and the recipient
/// becomes the responder `resp`, except when that segment is a SYN/ACK, whose sender is the
/// responder of the handshake.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct Flow {
    /// The originator (client) endpoint.
    pub orig: SocketAddr,
    /// The responder (server) endpoint.
    pub resp: SocketAddr,
}

impl Flow {
    /// Creates a new flow from the first observed segment `ctxt`.
    pub(crate) fn from_ctxt(ctxt: &L4Context) -> Self {
        if ctxt.flags & SYN != 0 && ctxt.flags & ACK != 0 {
            Flow {
                orig: ctxt.dst,
                resp: ctxt.src,
            }
        } else {
            Flow {
                orig: ctxt.src,
                resp: ctxt.dst,
            }
        }
    }

    /// Converts a flow to a non-directional connection identifier.
    pub fn conn_id(&self) -> ConnId {
        ConnId::new(self.orig, self.resp)
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.orig, self.resp)
    }
}

/// A generic connection identifier.
///
/// Identifies a connection independent of the source and destination socket address order. Does not
/// distinguish between the originator and responder of the connection.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ConnId(SocketAddr, SocketAddr);

impl ConnId {
    /// Returns the connection ID of a segment with `src` and `dst` IP/port pairs.
    pub(crate) fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        ConnId(cmp::max(src, dst), cmp::min(src, dst))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <> {}", self.0, self.1)
    }
}
