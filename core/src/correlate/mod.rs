//! Request/response matching.
//!
//! Each stream holds one [Correlator] per registered protocol. A correlator stores at most one
//! unmatched half per correlation key until the opposite half arrives, the key is abandoned after
//! too many unmatched repeats, or the [ExpirySweeper](expiry::ExpirySweeper) deletes it.

pub mod expiry;

use crate::output::{Message, RequestResponsePair};
use crate::protocols::stream::ProtocolKind;
use crate::stats::{StatExt, ABANDONED_ENTRIES};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Request and response ordinals of one (stream, protocol).
///
/// Both directions of a stream may advance the pair concurrently.
#[derive(Debug, Default)]
pub struct CounterPair {
    requests: AtomicU64,
    responses: AtomicU64,
}

impl CounterPair {
    /// Returns the ordinal of the next request and advances the counter.
    pub fn next_request(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::AcqRel)
    }

    /// Returns the ordinal of the next response and advances the counter.
    pub fn next_response(&self) -> u64 {
        self.responses.fetch_add(1, Ordering::AcqRel)
    }
}

#[derive(Debug)]
struct Held {
    message: Message,
    /// Halves of the same side stored under this key since it was created.
    attempts: u32,
}

/// Pairing state of one protocol within one stream.
#[derive(Debug)]
pub struct Correlator {
    protocol: ProtocolKind,
    max_attempts: u32,
    held: DashMap<String, Held>,
}

impl Correlator {
    pub fn new(protocol: ProtocolKind, max_attempts: u32) -> Self {
        Correlator {
            protocol,
            max_attempts: max_attempts.max(1),
            held: DashMap::new(),
        }
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    /// Number of unmatched halves.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Registers a request held under `key`.
    pub fn register_request(&self, key: &str, message: Message) -> Option<RequestResponsePair> {
        self.register(key, message)
    }

    /// Registers a response held under `key`.
    pub fn register_response(&self, key: &str, message: Message) -> Option<RequestResponsePair> {
        self.register(key, message)
    }

    /// Matches `message` against the opposite half held under `key`, or holds it.
    ///
    /// On a match the held half is removed and `message` is never stored.
    pub fn register(&self, key: &str, message: Message) -> Option<RequestResponsePair> {
        match self.held.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().message.is_request != message.is_request {
                    let held = occupied.remove();
                    let pair = if message.is_request {
                        RequestResponsePair {
                            request: message,
                            response: held.message,
                        }
                    } else {
                        RequestResponsePair {
                            request: held.message,
                            response: message,
                        }
                    };
                    return Some(pair);
                }
                let held = occupied.get_mut();
                held.attempts += 1;
                if held.attempts >= self.max_attempts {
                    log::debug!(
                        "{}: abandoning key {} after {} unmatched halves",
                        self.protocol,
                        key,
                        held.attempts
                    );
                    ABANDONED_ENTRIES.inc();
                    occupied.remove();
                } else {
                    held.message = message;
                }
                None
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Held {
                    message,
                    attempts: 1,
                });
                None
            }
        }
    }

    /// Deletes every half captured at or before `cutoff`. Returns the number deleted.
    pub fn expire_older_than(&self, cutoff: SystemTime) -> usize {
        let before = self.held.len();
        self.held.retain(|key, held| {
            let keep = held.message.capture_time > cutoff;
            if !keep {
                log::debug!("{}: expiring unmatched key {}", self.protocol, key);
            }
            keep
        });
        before.saturating_sub(self.held.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::output::MessageData;
    use crate::protocols::stream::dns::{DnsQuery, DnsResponse};

    use std::time::Duration;

    pub(crate) fn query(id: u16, at: SystemTime) -> Message {
        Message {
            is_request: true,
            capture_time: at,
            captured_size: 32,
            payload: MessageData::DnsQuery(DnsQuery {
                transaction_id: id,
                num_questions: 0,
                recursion_desired: true,
                queries: vec![],
            }),
        }
    }

    pub(crate) fn answer(id: u16, at: SystemTime) -> Message {
        Message {
            is_request: false,
            capture_time: at,
            captured_size: 48,
            payload: MessageData::DnsResponse(DnsResponse {
                transaction_id: id,
                response_code: "NoError".to_owned(),
                authoritative: false,
                truncated: false,
                recursion_available: true,
                num_answers: 0,
                queries: vec![],
                answers: vec![],
                nameservers: vec![],
                additionals: vec![],
            }),
        }
    }

    #[test]
    fn opposite_halves_pair_in_either_order() {
        let correlator = Correlator::new(ProtocolKind::Dns, 4);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t1 = t0 + Duration::from_millis(20);

        assert!(correlator.register_request("7", query(7, t0)).is_none());
        let pair = correlator.register_response("7", answer(7, t1)).unwrap();
        assert!(pair.request.is_request);
        assert_eq!(pair.elapsed(), Duration::from_millis(20));
        assert!(correlator.is_empty());

        assert!(correlator.register_response("8", answer(8, t1)).is_none());
        let pair = correlator.register_request("8", query(8, t0)).unwrap();
        assert_eq!(pair.request.capture_time, t0);
        assert!(correlator.is_empty());
    }

    #[test]
    fn response_before_request_has_zero_elapsed() {
        let correlator = Correlator::new(ProtocolKind::Dns, 4);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        correlator.register_request("1", query(1, t0));
        let pair = correlator
            .register_response("1", answer(1, t0 - Duration::from_secs(1)))
            .unwrap();
        assert_eq!(pair.elapsed(), Duration::ZERO);
    }

    #[test]
    fn repeated_same_side_halves_are_abandoned() {
        let correlator = Correlator::new(ProtocolKind::Dns, 3);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        correlator.register_request("1", query(1, t0));
        correlator.register_request("1", query(1, t0));
        assert_eq!(correlator.len(), 1);
        correlator.register_request("1", query(1, t0));
        assert!(correlator.is_empty());
    }

    #[test]
    fn expiry_is_bounded_and_idempotent() {
        let correlator = Correlator::new(ProtocolKind::Dns, 4);
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let window = Duration::from_secs(10);
        correlator.register_request("1", query(1, t));
        correlator.register_request("2", query(2, t + Duration::from_secs(5)));

        let now = t + window;
        assert_eq!(correlator.expire_older_than(now - window), 1);
        assert_eq!(correlator.expire_older_than(now - window), 0);
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn counter_pair_is_monotonic() {
        let counters = CounterPair::default();
        assert_eq!(counters.next_request(), 0);
        assert_eq!(counters.next_request(), 1);
        assert_eq!(counters.next_response(), 0);
    }
}
