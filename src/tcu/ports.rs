use std::collections::VecDeque;

use super::noc::Packet;

/// State of a slave port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    Idle,
    Busy,
    BusyNeedsRetry,
}

/// A slave port accepting one timing request at a time.
///
/// A request arriving while busy is held back until the current one finishes;
/// `request_finished` then hands it back for redelivery, which models the
/// request-retry of the upstream interconnect. Responses go through a queue
/// so that a stalled receiver keeps ordering intact; `recv_resp_retry`
/// drains it. Functional accesses do not touch any of this state.
pub struct SlavePort {
    name: &'static str,
    busy: bool,
    pending_reqs: VecDeque<Packet>,
    pending_resps: VecDeque<Packet>,
    stalled: bool,
}

impl SlavePort {
    pub fn new(name: &'static str) -> SlavePort {
        SlavePort {
            name,
            busy: false,
            pending_reqs: VecDeque::new(),
            pending_resps: VecDeque::new(),
            stalled: false,
        }
    }

    pub fn state(&self) -> PortState {
        match (self.busy, self.pending_reqs.is_empty()) {
            (false, _) => PortState::Idle,
            (true, true) => PortState::Busy,
            (true, false) => PortState::BusyNeedsRetry,
        }
    }

    /// Accept a timing request. Returns the packet when the port was idle;
    /// otherwise the packet is parked until `request_finished`.
    pub fn recv_timing_req(&mut self, pkt: Packet) -> Option<Packet> {
        if self.busy {
            trace!(target: "TcuPort", "{}: reject request at {:#x}, retry later", self.name, pkt.addr);
            self.pending_reqs.push_back(pkt);
            return None;
        }
        trace!(target: "TcuPort", "{}: receive request at {:#x} ({} bytes)", self.name, pkt.addr, pkt.size);
        self.busy = true;
        Some(pkt)
    }

    /// The current request is done; the port becomes free. If a request was
    /// rejected meanwhile, it is returned for redelivery.
    pub fn request_finished(&mut self) -> Option<Packet> {
        assert!(self.busy, "{}: request finished while idle", self.name);
        self.busy = false;
        let retry = self.pending_reqs.pop_front();
        if retry.is_some() {
            trace!(target: "TcuPort", "{}: request finished, sending retry", self.name);
        }
        retry
    }

    /// Queue a response. Returns packets that can be delivered right now,
    /// in order; an empty result means the receiver is stalled.
    pub fn send_response(&mut self, pkt: Packet) -> Vec<Packet> {
        self.pending_resps.push_back(pkt);
        if self.stalled { Vec::new() } else { self.drain_resps() }
    }

    /// The receiver is ready again; drain queued responses in order.
    pub fn recv_resp_retry(&mut self) -> Vec<Packet> {
        self.stalled = false;
        self.drain_resps()
    }

    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    fn drain_resps(&mut self) -> Vec<Packet> {
        self.pending_resps.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(addr: u64) -> Packet {
        Packet::read(addr, 8)
    }

    #[test]
    fn busy_retry_cycle() {
        let mut port = SlavePort::new("test");
        assert_eq!(port.state(), PortState::Idle);

        let first = port.recv_timing_req(pkt(0x10));
        assert!(first.is_some());
        assert_eq!(port.state(), PortState::Busy);

        // A second request while busy is rejected and marks the retry.
        assert!(port.recv_timing_req(pkt(0x20)).is_none());
        assert_eq!(port.state(), PortState::BusyNeedsRetry);

        let retry = port.request_finished().unwrap();
        assert_eq!(retry.addr, 0x20);
        assert_eq!(port.state(), PortState::Idle);
    }

    #[test]
    fn responses_queue_while_stalled() {
        let mut port = SlavePort::new("test");
        port.set_stalled(true);
        assert!(port.send_response(pkt(0x10)).is_empty());
        assert!(port.send_response(pkt(0x20)).is_empty());

        let drained = port.recv_resp_retry();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].addr, 0x10);
        assert_eq!(drained[1].addr, 0x20);
    }
}
