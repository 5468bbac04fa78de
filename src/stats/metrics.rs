//! Delivery statistics for fanout subscribers

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free counters shared by a subscriber and its pool tasks
#[derive(Debug)]
pub struct DeliveryStats {
    started_at: Instant,
    received: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    decode_errors: AtomicU64,
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            received: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        }
    }

    /// A payload arrived from the broker
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// A payload was queued for `sessions` local sessions
    pub fn record_delivered(&self, sessions: usize) {
        self.delivered.fetch_add(sessions as u64, Ordering::Relaxed);
    }

    /// Failed delivery attempts that were retried
    pub fn record_retries(&self, retries: u64) {
        if retries > 0 {
            self.retried.fetch_add(retries, Ordering::Relaxed);
        }
    }

    /// A payload was given up on
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// A payload could not be decoded
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Default for DeliveryStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy of [`DeliveryStats`] counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    /// Payloads received from the broker
    pub received: u64,
    /// Session deliveries (one payload to two sessions counts twice)
    pub delivered: u64,
    /// Retried delivery attempts
    pub retried: u64,
    /// Payloads dropped after exhausting retries or on pool shutdown
    pub dropped: u64,
    /// Undecodable payloads
    pub decode_errors: u64,
    /// Time since the counters were created
    pub uptime: Duration,
}
