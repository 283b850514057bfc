//! QoS: token bucket rate limiting per channel.
//!
//! Refill rates:
//!   Command: unlimited (never throttled)
//!   Bulk: configured bytes/sec with a configured burst
//!
//! A frame costs its payload length in tokens. A Bulk frame that finds the
//! bucket short is not dropped; the pump waits `wait_time` and retries.

use std::time::{Duration, Instant};
use tavern_core::wire::Channel;

#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
    channel: Channel,
}

impl TokenBucket {
    /// `rate` is bytes/sec; 0 means unlimited. Ignored for the Command channel.
    pub fn new(channel: Channel, rate: u64, burst: u64) -> Self {
        let (capacity, refill_rate) = match channel {
            Channel::Command => (f64::INFINITY, f64::INFINITY),
            Channel::Bulk if rate == 0 => (f64::INFINITY, f64::INFINITY),
            Channel::Bulk => ((burst.max(1)) as f64, rate as f64),
        };
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
            channel,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Returns true and debits the bucket if `cost` bytes may go now.
    ///
    /// A cost above the burst size is charged as a full bucket so oversized
    /// frames still make progress.
    pub fn allow(&mut self, cost: usize) -> bool {
        if self.capacity.is_infinite() {
            return true;
        }
        self.refill();

        let cost = (cost as f64).min(self.capacity);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// How long until `cost` bytes would be allowed.
    pub fn wait_time(&mut self, cost: usize) -> Duration {
        if self.capacity.is_infinite() {
            return Duration::ZERO;
        }
        self.refill();

        let cost = (cost as f64).min(self.capacity);
        let deficit = cost - self.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / self.refill_rate)
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn tokens(&self) -> f64 {
        self.tokens.min(self.capacity)
    }
}
