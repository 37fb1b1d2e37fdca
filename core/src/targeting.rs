//! Per-flow targeting decisions.
//!
//! The target set holds endpoints of interest, either a full `host:port` authority or a bare host
//! that matches every port. A flow is targeted when either of its endpoints matches. Decisions run
//! on the first segment of a flow, before any stream resources exist, and only read the set as it
//! is at that moment: replacing the targets never reclassifies flows that were already decided.

use crate::conntrack::conn_id::Flow;

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

/// Outcome of a targeting decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Targeting {
    /// The flow is worth reconstructing.
    pub is_targeted: bool,
    /// The matching endpoint initiated the connection, i.e. traffic leaves the target.
    pub is_outgoing: bool,
}

impl Targeting {
    const IGNORED: Targeting = Targeting {
        is_targeted: false,
        is_outgoing: false,
    };
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid target authority {0:?}, expected host or host:port")]
pub struct TargetError(pub String);

#[derive(Debug, Default)]
struct Targets {
    hosts: HashSet<IpAddr>,
    endpoints: HashSet<SocketAddr>,
}

impl Targets {
    fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.endpoints.is_empty()
    }

    fn contains(&self, addr: &SocketAddr) -> bool {
        let host = crate::conntrack::pdu::host_of(addr);
        self.hosts.contains(&host) || self.endpoints.contains(&SocketAddr::new(host, addr.port()))
    }
}

/// Dynamic set of targeted endpoints.
///
/// An empty set targets every flow.
#[derive(Debug, Default)]
pub struct TargetSet {
    targets: RwLock<Targets>,
}

impl TargetSet {
    /// Builds a target set from `host` or `host:port` authorities.
    pub fn new<I, S>(authorities: I) -> Result<Self, TargetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = TargetSet::default();
        set.replace(authorities)?;
        Ok(set)
    }

    /// Replaces the targets. Only decisions made after the call observe the new set.
    ///
    /// Leaves the current set untouched if any authority is invalid.
    pub fn replace<I, S>(&self, authorities: I) -> Result<(), TargetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut targets = Targets::default();
        for authority in authorities {
            match parse_authority(authority.as_ref())? {
                Authority::Host(host) => {
                    targets.hosts.insert(host);
                }
                Authority::Endpoint(endpoint) => {
                    targets.endpoints.insert(endpoint);
                }
            }
        }
        log::info!(
            "Targeting {} hosts and {} endpoints",
            targets.hosts.len(),
            targets.endpoints.len()
        );
        *self.targets.write().unwrap_or_else(PoisonError::into_inner) = targets;
        Ok(())
    }

    /// Decides whether `flow` is targeted.
    ///
    /// A match on the responder means traffic enters the target; a match on the originator only
    /// means it leaves it.
    pub fn decide(&self, flow: &Flow) -> Targeting {
        let targets = self.targets.read().unwrap_or_else(PoisonError::into_inner);
        if targets.is_empty() {
            return Targeting {
                is_targeted: true,
                is_outgoing: false,
            };
        }
        if targets.contains(&flow.resp) {
            Targeting {
                is_targeted: true,
                is_outgoing: false,
            }
        } else if targets.contains(&flow.orig) {
            Targeting {
                is_targeted: true,
                is_outgoing: true,
            }
        } else {
            Targeting::IGNORED
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Authority {
    Host(IpAddr),
    Endpoint(SocketAddr),
}

fn parse_authority(authority: &str) -> Result<Authority, TargetError> {
    let trimmed = authority.trim();
    if let Ok(endpoint) = trimmed.parse::<SocketAddr>() {
        return Ok(Authority::Endpoint(SocketAddr::new(
            crate::conntrack::pdu::host_of(&endpoint),
            endpoint.port(),
        )));
    }
    let host = trimmed.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(host) => Ok(Authority::Host(host)),
        Err(_) => Err(TargetError(authority.to_owned())),
    }
}
