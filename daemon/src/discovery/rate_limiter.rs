//! Inbound admission control.
//!
//! [`Limiter`] is a Generic Cell Rate Algorithm token bucket: each key keeps
//! a single theoretical arrival time (TAT) and a cell costs
//! `replenish_all_every / max_tokens`. [`RateLimiter`] combines a per-IP
//! and a global limiter with IP bans and a bypass for peers we are waiting
//! on.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use super::error::DiscoveryError;

/// `max_tokens` cells regenerate over `replenish_all_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub replenish_all_every: Duration,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitedErr {
    /// More tokens than the bucket can ever hold.
    TooLarge,
    /// Allowed again after the given delay.
    TooSoon(Duration),
}

#[derive(Debug)]
pub struct Limiter<K: Hash + Eq> {
    /// Time to replenish the whole bucket.
    tau: Duration,
    /// Cost of one token.
    t: Duration,
    tat_per_key: HashMap<K, Instant>,
}

impl<K: Hash + Eq + Clone> Limiter<K> {
    pub fn new(quota: Quota) -> Result<Self, DiscoveryError> {
        if quota.max_tokens == 0 {
            return Err(DiscoveryError::ConfigError(
                "rate limit quota must allow at least one token".to_string(),
            ));
        }
        if quota.replenish_all_every.is_zero() {
            return Err(DiscoveryError::ConfigError(
                "rate limit replenish period must be positive".to_string(),
            ));
        }

        Ok(Self {
            tau: quota.replenish_all_every,
            t: quota.replenish_all_every / quota.max_tokens,
            tat_per_key: HashMap::new(),
        })
    }

    pub fn allows(&mut self, key: &K, tokens: u32, now: Instant) -> Result<(), RateLimitedErr> {
        let additional = self.t.saturating_mul(tokens);
        if additional > self.tau {
            return Err(RateLimitedErr::TooLarge);
        }

        // unseen keys have a full bucket
        let tat = self.tat_per_key.get(key).copied().unwrap_or(now);

        // earliest = tat + additional - tau, kept free of Instant underflow
        if now + self.tau < tat + additional {
            let wait = (tat + additional) - (now + self.tau);
            return Err(RateLimitedErr::TooSoon(wait));
        }

        self.tat_per_key.insert(key.clone(), tat.max(now) + additional);
        Ok(())
    }

    /// Drop keys whose TAT is older than `time_limit`.
    pub fn prune(&mut self, time_limit: Instant) {
        self.tat_per_key.retain(|_, tat| *tat >= time_limit);
    }

    pub fn len(&self) -> usize {
        self.tat_per_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tat_per_key.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub rate_limited_ip: u64,
    pub rate_limited_global: u64,
    pub banned_dropped: u64,
}

/// Transport-boundary admission policy.
#[derive(Debug)]
pub struct RateLimiter {
    per_ip: Limiter<IpAddr>,
    global: Limiter<()>,
    banned: HashMap<IpAddr, Instant>,
    ban_duration: Duration,
    /// Outstanding requests per IP; answers from these bypass the limiters.
    expected_responses: HashMap<IpAddr, usize>,
    stats: RateLimiterStats,
}

impl RateLimiter {
    pub fn new(
        per_ip: Quota,
        global: Quota,
        ban_duration: Duration,
    ) -> Result<Self, DiscoveryError> {
        Ok(Self {
            per_ip: Limiter::new(per_ip)?,
            global: Limiter::new(global)?,
            banned: HashMap::new(),
            ban_duration,
            expected_responses: HashMap::new(),
            stats: RateLimiterStats::default(),
        })
    }

    /// Whether a datagram from `ip` may be processed.
    pub fn allows(&mut self, ip: IpAddr, now: Instant) -> bool {
        if let Some(until) = self.banned.get(&ip) {
            if *until > now {
                self.stats.banned_dropped += 1;
                return false;
            }
            self.banned.remove(&ip);
        }

        if self.expected_responses.contains_key(&ip) {
            return true;
        }

        if let Err(e) = self.per_ip.allows(&ip, 1, now) {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Rate limited {} ({:?}), banning for {:?}", ip, e, self.ban_duration);
            }
            self.banned.insert(ip, now + self.ban_duration);
            self.stats.rate_limited_ip += 1;
            metrics::counter!("discv5_rate_limited_ip_total").increment(1);
            return false;
        }

        if self.global.allows(&(), 1, now).is_err() {
            self.stats.rate_limited_global += 1;
            metrics::counter!("discv5_rate_limited_global_total").increment(1);
            return false;
        }

        true
    }

    pub fn add_expected_response(&mut self, ip: IpAddr) {
        *self.expected_responses.entry(ip).or_insert(0) += 1;
    }

    pub fn remove_expected_response(&mut self, ip: IpAddr) {
        if let Some(count) = self.expected_responses.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                self.expected_responses.remove(&ip);
            }
        }
    }

    pub fn is_banned(&self, ip: &IpAddr, now: Instant) -> bool {
        self.banned.get(ip).is_some_and(|until| *until > now)
    }

    pub fn stats(&self) -> RateLimiterStats {
        self.stats
    }

    /// Forget state that no longer affects any decision.
    pub fn prune(&mut self, now: Instant) {
        self.per_ip.prune(now);
        self.global.prune(now);
        self.banned.retain(|_, until| *until > now);
    }

    pub fn clear(&mut self) {
        self.per_ip.tat_per_key.clear();
        self.global.tat_per_key.clear();
        self.banned.clear();
        self.expected_responses.clear();
    }
}
