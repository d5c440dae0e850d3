use crate::schema::packet::Position;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A 911 menu waiting on a numeric selection from its sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pending911 {
    pub menu_sent_at: DateTime<Utc>,
    pub position: Option<Position>,
    pub channel: u32,
}

/// A sender locked out by responder action. Expiry is lazy on access with a
/// watchdog sweep as the safety net.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestrictedEntry {
    pub display_name: String,
    pub expires_at: DateTime<Utc>,
    pub restricted_by: String,
}

impl RestrictedEntry {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Minutes left, rounded up so a fresh lockout reads as its full
    /// configured duration; never negative.
    pub fn minutes_left(&self, now: DateTime<Utc>) -> i64 {
        ((self.expires_at - now).num_seconds().max(0) + 59) / 60
    }
}
