//! The correlator (C6): owns the outbound pool and the in-flight request table, and performs
//! the sequence rewriting that lets one upstream connection serve many client streams.
//!
//! Kept free of any socket, TLS or mio dependency so its core logic — the part carrying the
//! gateway's correctness properties — can be exercised against plain mock handles.

pub mod error;
pub mod inbound;
pub mod outbound;
pub mod reactor;

use std::collections::HashMap;
use std::rc::{Rc, Weak};

use log::{info, warn};

use crate::carrier::Envelope;

/// What the correlator needs from a client-facing session: a place to deliver a matched
/// response, and a way to ask it to tear itself down when its upstream disappears.
pub trait InboundHandle {
    fn write(&self, bytes: &[u8]);
    fn close(&self);
}

/// What the correlator needs from an upstream-facing session: a place to forward a request.
pub trait OutboundHandle {
    fn write(&self, bytes: &[u8]);
}

impl<T: OutboundHandle> OutboundHandle for Rc<T> {
    fn write(&self, bytes: &[u8]) {
        T::write(self, bytes)
    }
}

struct InFlight<I> {
    client_seq: u32,
    service_id: u32,
    inbound: Weak<I>,
}

/// Owns C2/C3 by composition at the call site (the reactor passes in whatever it needs);
/// here the correlator only owns what its own invariants are about: the outbound pool, the
/// in-flight table and the sequence counter.
pub struct Correlator<I, O> {
    outbound_pool: HashMap<u32, O>,
    in_flight: HashMap<u32, InFlight<I>>,
    next_seq: u32,
    eager_upstream_drop: bool,
}

impl<I, O> Correlator<I, O>
where
    I: InboundHandle,
    O: OutboundHandle + Clone,
{
    pub fn new(eager_upstream_drop: bool) -> Self {
        Self {
            outbound_pool: HashMap::new(),
            in_flight: HashMap::new(),
            next_seq: 0,
            eager_upstream_drop,
        }
    }

    pub fn register_outbound(&mut self, service_id: u32, outbound: O) {
        self.outbound_pool.insert(service_id, outbound);
    }

    pub fn outbound(&self, service_id: u32) -> Option<&O> {
        self.outbound_pool.get(&service_id)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Decodes an inbound frame, rewrites its `seq` to a freshly allocated gateway sequence,
    /// records the in-flight row, and returns the outbound session to forward it on plus the
    /// re-encoded bytes. Returns `None` (drop, keep the client connection open) on a decode
    /// failure or an unknown service.
    pub fn parse_request(&mut self, bytes: &[u8], inbound: &Rc<I>) -> Option<(O, Vec<u8>)> {
        let mut envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("dropping malformed envelope: {err}");
                return None;
            }
        };

        let service_id = envelope.service();
        let outbound = match self.outbound_pool.get(&service_id) {
            Some(outbound) => outbound.clone(),
            None => {
                warn!("dropping request for unknown service {service_id}");
                return None;
            }
        };

        let client_seq = envelope.seq();
        let gateway_seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        envelope.set_seq(gateway_seq);

        self.in_flight.insert(
            gateway_seq,
            InFlight {
                client_seq,
                service_id,
                inbound: Rc::downgrade(inbound),
            },
        );

        let mut buffer = Vec::new();
        envelope.encode(&mut buffer);
        Some((outbound, buffer))
    }

    /// Decodes an upstream frame, looks up its `seq` in the in-flight table, restores the
    /// client's original `seq`, and returns the inbound handle to deliver it to plus the
    /// re-encoded bytes. Returns `None` (drop) on decode failure, an unknown `seq` (stale or
    /// duplicate upstream response), or a client that has already disconnected.
    pub fn parse_response(&mut self, bytes: &[u8]) -> Option<(Rc<I>, Vec<u8>)> {
        let mut envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("dropping malformed upstream envelope: {err}");
                return None;
            }
        };

        let gateway_seq = envelope.seq();
        let row = match self.in_flight.remove(&gateway_seq) {
            Some(row) => row,
            None => {
                warn!("dropping upstream response with unknown seq {gateway_seq}");
                return None;
            }
        };

        let inbound = row.inbound.upgrade()?;
        envelope.set_seq(row.client_seq);

        let mut buffer = Vec::new();
        envelope.encode(&mut buffer);
        Some((inbound, buffer))
    }

    /// Removes the dead upstream from the pool. If `eager_upstream_drop` is enabled, every
    /// in-flight row belonging to this service is also removed and its inbound session asked
    /// to close; otherwise those rows are left to be discovered by the client's own timeout
    /// or disconnect.
    pub fn on_upstream_closed(&mut self, service_id: u32) {
        if self.outbound_pool.remove(&service_id).is_none() {
            return;
        }
        info!("removed outbound pool entry for service {service_id}");

        if !self.eager_upstream_drop {
            return;
        }

        let stale: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, row)| row.service_id == service_id)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in stale {
            if let Some(row) = self.in_flight.remove(&seq) {
                if let Some(inbound) = row.inbound.upgrade() {
                    inbound.close();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct MockInbound {
        written: RefCell<Vec<Vec<u8>>>,
        closed: RefCell<bool>,
    }

    impl InboundHandle for MockInbound {
        fn write(&self, bytes: &[u8]) {
            self.written.borrow_mut().push(bytes.to_vec());
        }

        fn close(&self) {
            *self.closed.borrow_mut() = true;
        }
    }

    #[derive(Clone, Default)]
    struct MockOutbound {
        written: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl OutboundHandle for MockOutbound {
        fn write(&self, bytes: &[u8]) {
            self.written.borrow_mut().push(bytes.to_vec());
        }
    }

    fn encode(seq: u32, service: u32, message: &[u8]) -> Vec<u8> {
        let envelope = Envelope::new(seq, service, message.to_vec());
        let mut buffer = Vec::new();
        envelope.encode(&mut buffer);
        buffer
    }

    #[test]
    fn echoes_request_with_rewritten_seq_and_preserves_message() {
        let mut correlator: Correlator<MockInbound, MockOutbound> = Correlator::new(false);
        correlator.register_outbound(1, MockOutbound::default());

        let client = Rc::new(MockInbound::default());
        let request = encode(42, 1, b"hi");
        let (outbound, forwarded) = correlator.parse_request(&request, &client).expect("service 1 is registered");
        let forwarded_envelope = Envelope::decode(&forwarded).unwrap();
        assert_ne!(forwarded_envelope.seq(), 42);
        assert_eq!(forwarded_envelope.service(), 1);
        assert_eq!(forwarded_envelope.message(), b"hi");

        // upstream echoes the rewritten envelope back unchanged
        let upstream_reply = {
            let mut e = forwarded_envelope;
            let mut buf = Vec::new();
            e.encode(&mut buf);
            buf
        };
        let (inbound, response) = correlator.parse_response(&upstream_reply).expect("row was recorded");
        let response_envelope = Envelope::decode(&response).unwrap();
        assert_eq!(response_envelope.seq(), 42);
        assert_eq!(response_envelope.message(), b"hi");
        assert!(Rc::ptr_eq(&inbound, &client));

        let _ = outbound;
        assert_eq!(correlator.in_flight_len(), 0);
    }

    #[test]
    fn drops_request_for_unknown_service() {
        let mut correlator: Correlator<MockInbound, MockOutbound> = Correlator::new(false);
        let client = Rc::new(MockInbound::default());
        let request = encode(7, 99, b"x");
        assert!(correlator.parse_request(&request, &client).is_none());
        assert_eq!(correlator.in_flight_len(), 0);
    }

    #[test]
    fn drops_malformed_envelope() {
        let mut correlator: Correlator<MockInbound, MockOutbound> = Correlator::new(false);
        let client = Rc::new(MockInbound::default());
        let garbage = [0xffu8; 10];
        assert!(correlator.parse_request(&garbage, &client).is_none());
    }

    #[test]
    fn drops_response_with_unknown_seq() {
        let mut correlator: Correlator<MockInbound, MockOutbound> = Correlator::new(false);
        let reply = encode(12345, 1, b"stale");
        assert!(correlator.parse_response(&reply).is_none());
    }

    #[test]
    fn dead_client_drops_response_silently() {
        let mut correlator: Correlator<MockInbound, MockOutbound> = Correlator::new(false);
        correlator.register_outbound(1, MockOutbound::default());

        let request = encode(1, 1, b"x");
        let (_, forwarded) = {
            let client = Rc::new(MockInbound::default());
            let result = correlator.parse_request(&request, &client).unwrap();
            // client dropped here; only a weak reference survives in the table
            result
        };

        let response = Envelope::decode(&forwarded).unwrap();
        let mut buf = Vec::new();
        response.encode(&mut buf);
        assert!(correlator.parse_response(&buf).is_none());
    }

    #[test]
    fn upstream_death_removes_pool_entry_and_leaves_in_flight_rows_by_default() {
        let mut correlator: Correlator<MockInbound, MockOutbound> = Correlator::new(false);
        correlator.register_outbound(1, MockOutbound::default());
        let client = Rc::new(MockInbound::default());
        correlator.parse_request(&encode(1, 1, b"x"), &client).unwrap();

        correlator.on_upstream_closed(1);

        assert!(correlator.outbound(1).is_none());
        assert_eq!(correlator.in_flight_len(), 1);
        assert!(!*client.closed.borrow());
    }

    #[test]
    fn eager_upstream_drop_closes_pending_inbound_sessions() {
        let mut correlator: Correlator<MockInbound, MockOutbound> = Correlator::new(true);
        correlator.register_outbound(1, MockOutbound::default());
        let client = Rc::new(MockInbound::default());
        correlator.parse_request(&encode(1, 1, b"x"), &client).unwrap();

        correlator.on_upstream_closed(1);

        assert_eq!(correlator.in_flight_len(), 0);
        assert!(*client.closed.borrow());
    }

    #[test]
    fn concurrent_clients_get_distinct_gateway_seqs_for_identical_client_seq() {
        let mut correlator: Correlator<MockInbound, MockOutbound> = Correlator::new(false);
        correlator.register_outbound(1, MockOutbound::default());
        let a = Rc::new(MockInbound::default());
        let b = Rc::new(MockInbound::default());

        let (_, fwd_a) = correlator.parse_request(&encode(1, 1, b"A"), &a).unwrap();
        let (_, fwd_b) = correlator.parse_request(&encode(1, 1, b"B"), &b).unwrap();

        let seq_a = Envelope::decode(&fwd_a).unwrap().seq();
        let seq_b = Envelope::decode(&fwd_b).unwrap().seq();
        assert_ne!(seq_a, seq_b);
        assert_eq!(correlator.in_flight_len(), 2);
    }
}
