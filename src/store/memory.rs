use crate::models::ProbeResult;
use std::collections::VecDeque;

/// Fixed-capacity circular buffer of the most recent results for one
/// monitor. Appending at capacity overwrites the oldest entry.
#[derive(Debug)]
pub struct Ring {
    buf: VecDeque<ProbeResult>,
    capacity: usize,
}

impl Ring {
    pub fn new(capacity: usize) -> Ring {
        Ring {
            buf: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, result: ProbeResult) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(result);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn latest(&self) -> Option<&ProbeResult> {
        self.buf.back()
    }

    pub fn oldest(&self) -> Option<&ProbeResult> {
        self.buf.front()
    }

    /// Reverse-chronological iteration for "latest N" queries.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &ProbeResult> {
        self.buf.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{result_at, ts};
    use super::*;
    use crate::models::ProbeStatus;

    #[test]
    fn holds_everything_below_capacity() {
        let mut ring = Ring::new(1000);
        for i in 0..10 {
            ring.push(result_at("web", ts(i), ProbeStatus::Up));
        }
        assert_eq!(ring.len(), 10);
        assert_eq!(ring.latest().unwrap().timestamp, ts(9));
        assert_eq!(ring.oldest().unwrap().timestamp, ts(0));
    }

    #[test]
    fn overflow_evicts_exactly_the_oldest() {
        let mut ring = Ring::new(1000);
        for i in 0..1001 {
            ring.push(result_at("web", ts(i), ProbeStatus::Up));
        }
        assert_eq!(ring.len(), 1000);
        // the very first entry is gone, the 1001st-newest survives
        assert_eq!(ring.oldest().unwrap().timestamp, ts(1));
        assert_eq!(ring.latest().unwrap().timestamp, ts(1000));
    }

    #[test]
    fn newest_first_iteration() {
        let mut ring = Ring::new(3);
        for i in 0..3 {
            ring.push(result_at("web", ts(i), ProbeStatus::Up));
        }
        let stamps: Vec<_> = ring.iter_newest_first().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![ts(2), ts(1), ts(0)]);
    }
}
