// Rate Limit Domain Model: rolling-window posting cadence per (destination, worker)

use serde::{Deserialize, Serialize};

/// Rolling window for the daily cap (24 hours, not calendar-aligned)
pub const ROLLING_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// Per-destination posting limits, supplied at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationLimits {
    pub max_per_day: u32,
    pub min_gap_ms: i64,
}

impl DestinationLimits {
    pub fn new(max_per_day: u32, min_gap_ms: i64) -> Self {
        Self {
            max_per_day,
            min_gap_ms,
        }
    }

    /// Decide whether a post may happen now, given the stored record
    pub fn evaluate(&self, record: Option<&RateLimitRecord>, now_millis: i64) -> PostDecision {
        let Some(record) = record else {
            return PostDecision::allow(PostReason::NoHistory, 0);
        };

        let timestamps = record.in_window(now_millis);
        let daily_count = timestamps.len() as u32;

        if daily_count >= self.max_per_day {
            // Oldest in-window timestamp is the first to leave the window
            let oldest = timestamps.first().copied().unwrap_or(now_millis);
            let wait_ms = (oldest + ROLLING_WINDOW_MS - now_millis).max(0);
            return PostDecision {
                allowed: false,
                wait_ms,
                reason: PostReason::DailyLimit {
                    count: daily_count,
                    max: self.max_per_day,
                },
                daily_count,
            };
        }

        if let Some(&last) = timestamps.last() {
            let elapsed = now_millis - last;
            if elapsed < self.min_gap_ms {
                return PostDecision {
                    allowed: false,
                    wait_ms: self.min_gap_ms - elapsed,
                    reason: PostReason::MinGap {
                        min_gap_ms: self.min_gap_ms,
                    },
                    daily_count,
                };
            }
        }

        PostDecision::allow(PostReason::Ok, daily_count)
    }

    /// Earliest time the next post may happen
    pub fn next_available_at(&self, record: &RateLimitRecord, now_millis: i64) -> i64 {
        let timestamps = record.in_window(now_millis);
        let mut next = now_millis;
        if timestamps.len() as u32 >= self.max_per_day {
            if let Some(&oldest) = timestamps.first() {
                next = next.max(oldest + ROLLING_WINDOW_MS);
            }
        }
        if let Some(&last) = timestamps.last() {
            next = next.max(last + self.min_gap_ms);
        }
        next
    }
}

/// Stored rate-limit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub destination: String,
    pub worker_id: String,
    /// Post timestamps (epoch ms), ascending
    pub post_timestamps: Vec<i64>,
    pub last_post_at: Option<i64>,
    pub daily_count: u32,
    pub updated_at: i64,
}

impl RateLimitRecord {
    pub fn new(destination: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            worker_id: worker_id.into(),
            post_timestamps: Vec::new(),
            last_post_at: None,
            daily_count: 0,
            updated_at: 0,
        }
    }

    /// Store key: `{destination}_{worker}` restricted to `[A-Za-z0-9_-]`
    pub fn key(destination: &str, worker_id: &str) -> String {
        format!("{}_{}", destination, worker_id)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Timestamps inside the rolling window ending at `now_millis`, ascending
    pub fn in_window(&self, now_millis: i64) -> Vec<i64> {
        let window_start = now_millis - ROLLING_WINDOW_MS;
        let mut timestamps: Vec<i64> = self
            .post_timestamps
            .iter()
            .copied()
            .filter(|&ts| ts > window_start)
            .collect();
        timestamps.sort_unstable();
        timestamps
    }

    /// Prune to the window, append `now_millis`, refresh derived fields
    pub fn record(&mut self, now_millis: i64) {
        let mut timestamps = self.in_window(now_millis);
        timestamps.push(now_millis);
        timestamps.sort_unstable();
        self.daily_count = timestamps.len() as u32;
        self.last_post_at = timestamps.last().copied();
        self.post_timestamps = timestamps;
        self.updated_at = now_millis;
    }
}

/// Why a post was allowed or denied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostReason {
    Ok,
    NoHistory,
    Unconfigured,
    DailyLimit { count: u32, max: u32 },
    MinGap { min_gap_ms: i64 },
}

impl std::fmt::Display for PostReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostReason::Ok => write!(f, "OK"),
            PostReason::NoHistory => write!(f, "No posting history"),
            PostReason::Unconfigured => write!(f, "No limits configured for destination"),
            PostReason::DailyLimit { count, max } => {
                write!(f, "Daily limit reached ({}/{})", count, max)
            }
            PostReason::MinGap { min_gap_ms } => write!(
                f,
                "Too soon since last post (min gap: {} min)",
                min_gap_ms / 60_000
            ),
        }
    }
}

/// Answer of `can_post`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDecision {
    pub allowed: bool,
    pub wait_ms: i64,
    pub reason: PostReason,
    pub daily_count: u32,
}

impl PostDecision {
    pub fn allow(reason: PostReason, daily_count: u32) -> Self {
        Self {
            allowed: true,
            wait_ms: 0,
            reason,
            daily_count,
        }
    }
}

/// Monitoring snapshot for one (destination, worker) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub destination: String,
    pub worker_id: String,
    pub daily_count: u32,
    pub max_per_day: Option<u32>,
    pub min_gap_ms: Option<i64>,
    pub last_post_at: Option<i64>,
    pub next_available_at: Option<i64>,
}
