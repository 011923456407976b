//! Per-stream acknowledgement queue.

use std::collections::VecDeque;

use jid::Jid;
use minidom::Element;
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;

use super::{encode_smid, SmConfig};

/// Random bytes issued with every `<enabled/>`.
pub const NONCE_LENGTH: usize = 24;

/// Outbound stanzas between two unsolicited `<r/>`.
pub const REQUEST_ACK_EVERY: u32 = 25;

/// The queue reached its size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream management queue is full ({0} stanzas)")]
pub struct SmQueueFull(pub usize);

/// Next timer a queue wants serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmTimer {
    /// The stream went idle: send `<r/>`.
    RequestAck,
    /// An `<r/>` stayed unanswered: close with `connection-timeout`.
    AckTimeout,
}

/// Increment a stanza counter modulo 2^32.
pub fn inc_h(h: u32) -> u32 {
    h.wrapping_add(1)
}

/// `a <= b` in serial number arithmetic over 2^32.
pub fn sequence_lte(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) < 0x8000_0000
}

/// Everything needed to move a queue to another stream or node.
#[derive(Debug, Clone, PartialEq)]
pub struct SmSnapshot {
    pub jid: Jid,
    pub nonce: Vec<u8>,
    pub elements: Vec<Element>,
    pub in_h: u32,
    pub out_h: u32,
}

#[derive(Debug, Clone)]
struct Entry {
    element: Element,
    h: u32,
}

/// Unacknowledged outbound stanzas of one stream, plus its counters and
/// the deadlines of its ack timers.
#[derive(Debug)]
pub struct SmQueue {
    jid: Jid,
    nonce: Vec<u8>,
    in_h: u32,
    out_h: u32,
    entries: VecDeque<Entry>,
    since_request: u32,
    config: SmConfig,
    request_ack_at: Option<Instant>,
    ack_deadline: Option<Instant>,
}

impl SmQueue {
    /// Fresh queue with a random nonce.
    pub fn new(jid: Jid, config: SmConfig) -> Self {
        let mut nonce = vec![0u8; NONCE_LENGTH];
        rand::rng().fill(&mut nonce[..]);
        Self::with_nonce(jid, nonce, config)
    }

    pub fn with_nonce(jid: Jid, nonce: Vec<u8>, config: SmConfig) -> Self {
        Self {
            jid,
            nonce,
            in_h: 0,
            out_h: 0,
            entries: VecDeque::new(),
            since_request: 0,
            config,
            request_ack_at: None,
            ack_deadline: None,
        }
    }

    /// Rebuild a queue moved from another stream. Entries get consecutive
    /// `h` values ending at `out_h`.
    pub fn from_snapshot(snapshot: SmSnapshot, config: SmConfig) -> Self {
        let count = snapshot.elements.len() as u32;
        let first = snapshot.out_h.wrapping_sub(count).wrapping_add(1);
        let entries = snapshot
            .elements
            .into_iter()
            .enumerate()
            .map(|(i, element)| Entry {
                element,
                h: first.wrapping_add(i as u32),
            })
            .collect();
        Self {
            entries,
            in_h: snapshot.in_h,
            out_h: snapshot.out_h,
            ..Self::with_nonce(snapshot.jid, snapshot.nonce, config)
        }
    }

    pub fn snapshot(&self) -> SmSnapshot {
        SmSnapshot {
            jid: self.jid.clone(),
            nonce: self.nonce.clone(),
            elements: self.entries.iter().map(|e| e.element.clone()).collect(),
            in_h: self.in_h,
            out_h: self.out_h,
        }
    }

    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Resumption id of this queue.
    pub fn smid(&self) -> String {
        encode_smid(&self.jid, &self.nonce)
    }

    pub fn in_h(&self) -> u32 {
        self.in_h
    }

    pub fn out_h(&self) -> u32 {
        self.out_h
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count a stanza received from the client.
    pub fn inc_in(&mut self) {
        self.in_h = inc_h(self.in_h);
    }

    /// Track a new outbound stanza. Returns whether an `<r/>` is due.
    pub fn push(&mut self, element: Element, now: Instant) -> Result<bool, SmQueueFull> {
        if self.entries.len() >= self.config.max_queue_size {
            return Err(SmQueueFull(self.entries.len()));
        }
        self.out_h = inc_h(self.out_h);
        self.entries.push_back(Entry {
            element,
            h: self.out_h,
        });
        if self.entries.len() >= self.config.max_queue_size {
            return Err(SmQueueFull(self.entries.len()));
        }
        if self.ack_deadline.is_none() {
            self.request_ack_at = Some(now + self.config.request_ack_interval);
        }
        self.since_request += 1;
        Ok(self.since_request >= REQUEST_ACK_EVERY)
    }

    /// An `<r/>` was written: wait for the answer.
    pub fn request_sent(&mut self, now: Instant) {
        self.since_request = 0;
        self.request_ack_at = None;
        if self.ack_deadline.is_none() {
            self.ack_deadline = Some(now + self.config.wait_for_ack_timeout);
        }
    }

    /// Process `<a h='N'/>`: forget everything up to `N` and return the
    /// stanzas still unacknowledged, which must be written again.
    pub fn ack(&mut self, h: u32, now: Instant) -> Vec<Element> {
        while let Some(front) = self.entries.front() {
            if !sequence_lte(front.h, h) {
                break;
            }
            self.entries.pop_front();
        }
        self.ack_deadline = None;
        self.request_ack_at = if self.entries.is_empty() {
            None
        } else {
            Some(now + self.config.request_ack_interval)
        };
        self.entries.iter().map(|e| e.element.clone()).collect()
    }

    /// Earliest pending timer.
    pub fn next_timer(&self) -> Option<(Instant, SmTimer)> {
        match (self.ack_deadline, self.request_ack_at) {
            (Some(deadline), _) => Some((deadline, SmTimer::AckTimeout)),
            (None, Some(at)) => Some((at, SmTimer::RequestAck)),
            (None, None) => None,
        }
    }

    /// Stop every timer; the queue is detached from its connection.
    pub fn hibernate(&mut self) {
        self.request_ack_at = None;
        self.ack_deadline = None;
        self.since_request = 0;
    }

    /// `h` of every queued entry, oldest first.
    pub fn sequence(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.h).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn queue(max: usize) -> SmQueue {
        SmQueue::new(
            Jid::new("ortuman@jackal.im/yard").unwrap(),
            SmConfig {
                max_queue_size: max,
                ..SmConfig::default()
            },
        )
    }

    fn msg(id: u32) -> Element {
        Element::builder("message", crate::parser::ns::CLIENT)
            .attr("id", id.to_string())
            .build()
    }

    #[test]
    fn test_inc_h_wraps() {
        assert_eq!(inc_h(0), 1);
        assert_eq!(inc_h(u32::MAX), 0);
        assert!(sequence_lte(u32::MAX, 0));
        assert!(sequence_lte(5, 5));
        assert!(!sequence_lte(6, 5));
    }

    #[test]
    fn test_ack_drops_acknowledged_entries() {
        let now = Instant::now();
        let mut q = queue(250);
        for i in 1..=5 {
            q.push(msg(i), now).unwrap();
        }
        let remaining = q.ack(3, now);
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].attr("id"), Some("4"));
        assert_eq!(q.sequence(), vec![4, 5]);

        // A stale ack changes nothing.
        q.ack(1, now);
        assert_eq!(q.sequence(), vec![4, 5]);

        assert!(q.ack(5, now).is_empty());
        assert!(q.is_empty());
        assert_eq!(q.out_h(), 5);
    }

    #[test]
    fn test_ack_across_wraparound() {
        let now = Instant::now();
        let mut q = SmQueue::from_snapshot(
            SmSnapshot {
                jid: Jid::new("ortuman@jackal.im/yard").unwrap(),
                nonce: vec![1; NONCE_LENGTH],
                elements: vec![msg(1), msg(2)],
                in_h: 0,
                out_h: u32::MAX,
            },
            SmConfig::default(),
        );
        assert_eq!(q.sequence(), vec![u32::MAX - 1, u32::MAX]);
        q.push(msg(3), now).unwrap();
        q.push(msg(4), now).unwrap();
        assert_eq!(q.sequence(), vec![u32::MAX - 1, u32::MAX, 0, 1]);

        let remaining = q.ack(0, now);
        assert_eq!(remaining.len(), 1);
        assert_eq!(q.sequence(), vec![1]);
    }

    #[test]
    fn test_request_every_25_stanzas() {
        let now = Instant::now();
        let mut q = queue(250);
        for i in 1..REQUEST_ACK_EVERY {
            assert!(!q.push(msg(i), now).unwrap());
        }
        assert!(q.push(msg(REQUEST_ACK_EVERY), now).unwrap());
        q.request_sent(now);
        assert!(!q.push(msg(26), now).unwrap());
    }

    #[test]
    fn test_queue_never_exceeds_max() {
        let now = Instant::now();
        let mut q = queue(3);
        q.push(msg(1), now).unwrap();
        q.push(msg(2), now).unwrap();
        assert_eq!(q.push(msg(3), now), Err(SmQueueFull(3)));
        assert_eq!(q.push(msg(4), now), Err(SmQueueFull(3)));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_timers() {
        let now = Instant::now();
        let mut q = queue(250);
        assert!(q.next_timer().is_none());

        q.push(msg(1), now).unwrap();
        let (at, timer) = q.next_timer().unwrap();
        assert_eq!(timer, SmTimer::RequestAck);
        assert_eq!(at, now + Duration::from_secs(60));

        q.request_sent(now);
        let (at, timer) = q.next_timer().unwrap();
        assert_eq!(timer, SmTimer::AckTimeout);
        assert_eq!(at, now + Duration::from_secs(30));

        q.ack(1, now);
        assert!(q.next_timer().is_none());

        q.push(msg(2), now).unwrap();
        q.hibernate();
        assert!(q.next_timer().is_none());
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_counters() {
        let now = Instant::now();
        let mut q = queue(250);
        q.inc_in();
        q.inc_in();
        q.push(msg(1), now).unwrap();
        q.push(msg(2), now).unwrap();
        q.ack(1, now);

        let restored = SmQueue::from_snapshot(q.snapshot(), SmConfig::default());
        assert_eq!(restored.in_h(), 2);
        assert_eq!(restored.out_h(), 2);
        assert_eq!(restored.sequence(), vec![2]);
        assert_eq!(restored.smid(), q.smid());
    }
}
