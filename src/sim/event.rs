//! Deterministic event queue for the discrete-event simulation.

use std::collections::BinaryHeap;

use super::Work;

pub struct Entry {
    pub time: u64,
    seq: u64,
    pub tile: usize,
    pub work: Work,
}

// Smaller time comes out first; the sequence number keeps same-cycle events
// in scheduling order (BinaryHeap is a max-heap, hence the reversal).
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.time, other.seq).cmp(&(self.time, self.seq))
    }
}

/// The clock and pending-event heap of one simulation.
pub struct EventQueue {
    cycle: u64,
    seq: u64,
    events: BinaryHeap<Entry>,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue { cycle: 0, seq: 0, events: BinaryHeap::new() }
    }

    /// Query the current cycle count.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Add an event `delay` cycles from now.
    pub fn sched(&mut self, tile: usize, delay: u64, work: Work) {
        let entry = Entry { time: self.cycle + delay, seq: self.seq, tile, work };
        self.seq += 1;
        self.events.push(entry);
    }

    /// Pop the next event and advance the clock to it.
    pub fn pop(&mut self) -> Option<Entry> {
        let entry = self.events.pop()?;
        debug_assert!(entry.time >= self.cycle);
        self.cycle = entry.time;
        Some(entry)
    }

    /// Time of the next event without removing it.
    pub fn peek_time(&self) -> Option<u64> {
        self.events.peek().map(|e| e.time)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_by_time_then_fifo() {
        let mut q = EventQueue::new();
        q.sched(0, 5, Work::ExecCommand);
        q.sched(1, 1, Work::ExecCommand);
        q.sched(2, 1, Work::ExecCommand);

        let e = q.pop().unwrap();
        assert_eq!((e.time, e.tile), (1, 1));
        // Same-cycle events come out in scheduling order.
        let e = q.pop().unwrap();
        assert_eq!((e.time, e.tile), (1, 2));
        let e = q.pop().unwrap();
        assert_eq!((e.time, e.tile), (5, 0));
        assert_eq!(q.cycle(), 5);
        assert!(q.pop().is_none());
    }
}
