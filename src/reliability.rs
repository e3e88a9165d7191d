//! Ordered, acknowledged delivery for the control channel.
//!
//! A stop-and-wait design with ACK lists: outbound control packets are
//! retained until acknowledged and retransmitted on a coarse back-off
//! timer; inbound control packets are acknowledged immediately, reordered
//! by packet id, and flushed into a byte queue the TLS adapter reads from.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Retransmit tuning, taken from the session options.
#[derive(Debug, Clone)]
pub struct RetransmitConfig {
    pub initial: Duration,
    pub cap: Duration,
    pub budget: u32,
}

impl From<&Options> for RetransmitConfig {
    fn from(options: &Options) -> Self {
        Self {
            initial: options.retransmit_initial,
            cap: options.retransmit_cap,
            budget: options.retransmit_budget,
        }
    }
}

struct Pending {
    packet_id: u32,
    wire: Vec<u8>,
    sent_at: Instant,
    retries: u32,
}

/// What became of an inbound control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    /// In order; its payload (and possibly buffered successors) is now
    /// readable.
    Delivered,
    /// Already seen; acknowledged again upstream, dropped here.
    Duplicate,
    /// Ahead of the next expected id; buffered.
    Buffered,
    /// Arrived before the hard-reset exchange pinned the id space.
    Unexpected,
}

pub struct Reliability {
    config: RetransmitConfig,
    pending: Vec<Pending>,
    reorder: BTreeMap<u32, Vec<u8>>,
    next_in: Option<u32>,
    ready: VecDeque<u8>,
    deadline: Option<Instant>,
}

impl Reliability {
    pub fn new(config: RetransmitConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            reorder: BTreeMap::new(),
            next_in: None,
            ready: VecDeque::new(),
            deadline: None,
        }
    }

    /// Retain an already-sent packet for retransmission until acknowledged.
    pub fn track(&mut self, packet_id: u32, wire: Vec<u8>) {
        self.pending.push(Pending {
            packet_id,
            wire,
            sent_at: Instant::now(),
            retries: 0,
        });
    }

    /// Process an ACK list from any inbound packet.
    pub fn handle_acks(&mut self, acks: &[u32]) {
        if acks.is_empty() {
            return;
        }
        trace!(?acks, "acknowledged");
        self.pending.retain(|p| !acks.contains(&p.packet_id));
    }

    /// Drop a tracked packet that was answered rather than explicitly
    /// acknowledged (the hard reset).
    pub fn forget(&mut self, packet_id: u32) {
        self.pending.retain(|p| p.packet_id != packet_id);
    }

    /// Pin the inbound id space: the first CONTROL_V1 from the server
    /// follows its hard-reset id.
    pub fn start_at(&mut self, first_id: u32) {
        self.next_in = Some(first_id);
    }

    /// Feed one inbound control payload, reordering as needed.
    pub fn accept(&mut self, packet_id: u32, payload: Vec<u8>) -> Accept {
        let Some(next) = self.next_in else {
            warn!(packet_id, "control packet before hard-reset exchange");
            return Accept::Unexpected;
        };
        if packet_id < next || self.reorder.contains_key(&packet_id) {
            debug!(packet_id, "duplicate control packet");
            return Accept::Duplicate;
        }
        if packet_id != next {
            trace!(packet_id, expected = next, "buffering out-of-order control packet");
            self.reorder.insert(packet_id, payload);
            return Accept::Buffered;
        }

        self.ready.extend(payload);
        let mut next = next + 1;
        while let Some(buffered) = self.reorder.remove(&next) {
            self.ready.extend(buffered);
            next += 1;
        }
        self.next_in = Some(next);
        Accept::Delivered
    }

    /// Copy buffered in-order control bytes out. Returns 0 when empty.
    pub fn take_ready(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.ready.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.ready.pop_front().unwrap_or_default();
        }
        n
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Arm or clear the overall handshake deadline.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub fn in_handshake(&self) -> bool {
        self.deadline.is_some()
    }

    fn backoff(&self, retries: u32) -> Duration {
        Self::backoff_for(&self.config, retries)
    }

    fn backoff_for(config: &RetransmitConfig, retries: u32) -> Duration {
        let factor = 1u32 << retries.min(16);
        config.initial.saturating_mul(factor).min(config.cap)
    }

    /// How long the next transport read may block before the retransmit
    /// timer or the handshake deadline needs attention.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let mut next: Option<Instant> = self.deadline;
        for p in &self.pending {
            let due = p.sent_at + self.backoff(p.retries);
            next = Some(next.map_or(due, |d| d.min(due)));
        }
        next.map(|at| at.saturating_duration_since(now).max(Duration::from_millis(10)))
    }

    /// Fail if the handshake deadline has passed.
    pub fn check_deadline(&self, now: Instant) -> Result<()> {
        match self.deadline {
            Some(deadline) if now >= deadline => Err(Error::HandshakeTimeout),
            _ => Ok(()),
        }
    }

    /// Resend every overdue packet, failing once a packet exhausts its
    /// retry budget.
    pub fn retransmit_due(&mut self, transport: &dyn Transport) -> Result<()> {
        let now = Instant::now();
        self.check_deadline(now)?;
        let config = self.config.clone();
        for p in &mut self.pending {
            if now < p.sent_at + Self::backoff_for(&config, p.retries) {
                continue;
            }
            if p.retries >= self.config.budget {
                warn!(packet_id = p.packet_id, "retransmit budget exhausted");
                return Err(Error::HandshakeTimeout);
            }
            debug!(packet_id = p.packet_id, retry = p.retries + 1, "retransmitting control packet");
            transport.write_packet(&p.wire)?;
            p.retries += 1;
            p.sent_at = now;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;

    fn fast_config() -> RetransmitConfig {
        RetransmitConfig {
            initial: Duration::from_millis(0),
            cap: Duration::from_millis(0),
            budget: 2,
        }
    }

    fn reliability() -> Reliability {
        let mut r = Reliability::new(fast_config());
        r.start_at(1);
        r
    }

    #[test]
    fn test_in_order_delivery() {
        let mut r = reliability();
        assert_eq!(r.accept(1, b"ab".to_vec()), Accept::Delivered);
        assert_eq!(r.accept(2, b"cd".to_vec()), Accept::Delivered);
        let mut buf = [0u8; 8];
        assert_eq!(r.take_ready(&mut buf), 4);
        assert_eq!(&buf[..4], b"abcd");
    }

    #[test]
    fn test_out_of_order_flush() {
        let mut r = reliability();
        assert_eq!(r.accept(3, b"C".to_vec()), Accept::Buffered);
        assert_eq!(r.accept(2, b"B".to_vec()), Accept::Buffered);
        assert!(!r.has_ready());
        assert_eq!(r.accept(1, b"A".to_vec()), Accept::Delivered);
        let mut buf = [0u8; 8];
        assert_eq!(r.take_ready(&mut buf), 3);
        assert_eq!(&buf[..3], b"ABC");
    }

    #[test]
    fn test_duplicates_are_discarded() {
        let mut r = reliability();
        assert_eq!(r.accept(1, b"x".to_vec()), Accept::Delivered);
        assert_eq!(r.accept(1, b"x".to_vec()), Accept::Duplicate);
        // Buffered duplicates too.
        assert_eq!(r.accept(5, b"y".to_vec()), Accept::Buffered);
        assert_eq!(r.accept(5, b"y".to_vec()), Accept::Duplicate);
    }

    #[test]
    fn test_before_reset_is_unexpected() {
        let mut r = Reliability::new(fast_config());
        assert_eq!(r.accept(1, b"x".to_vec()), Accept::Unexpected);
        assert!(!r.has_ready());
    }

    #[test]
    fn test_ack_clears_pending() {
        let mut r = reliability();
        r.track(0, vec![0xaa]);
        r.track(1, vec![0xbb]);
        assert!(r.has_pending());
        r.handle_acks(&[0, 1]);
        assert!(!r.has_pending());
    }

    #[test]
    fn test_retransmit_until_budget_exhausted() {
        let transport = MockTransport::new();
        let mut r = reliability();
        r.track(0, vec![0xaa]);

        // Zero back-off: every call is immediately due.
        r.retransmit_due(&transport).unwrap();
        r.retransmit_due(&transport).unwrap();
        let err = r.retransmit_due(&transport).unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout));
        assert_eq!(transport.sent().len(), 2);
    }

    #[test]
    fn test_deadline_expiry() {
        let mut r = reliability();
        r.set_deadline(Some(Instant::now() - Duration::from_secs(1)));
        assert!(matches!(
            r.check_deadline(Instant::now()),
            Err(Error::HandshakeTimeout)
        ));
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let r = Reliability::new(RetransmitConfig {
            initial: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            budget: 10,
        });
        assert_eq!(r.backoff(0), Duration::from_secs(2));
        assert_eq!(r.backoff(1), Duration::from_secs(4));
        assert_eq!(r.backoff(4), Duration::from_secs(32));
        assert_eq!(r.backoff(5), Duration::from_secs(60));
        assert_eq!(r.backoff(12), Duration::from_secs(60));
    }
}
