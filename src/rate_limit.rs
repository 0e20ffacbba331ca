// =============================================================================
// Rate Limiter — per-class per-minute budgets with adaptive backoff
// =============================================================================
//
// The broker enforces separate per-minute budgets for different request
// classes. Budgets reset on every wall-clock minute boundary (fixed windows,
// not sliding):
//   - historical: 50/min   - option: 30/min
//   - market:     20/min   - default: 100/min
//
// After `error_threshold` consecutive throttling replies for a class its
// effective limit is cut by `reduction_pct` (never below `min_limit`) for
// `reduction_secs`, then restored.
//
// Each class has its own lock so classes never contend with each other, and
// the check-and-increment is a single critical section so the limit holds
// under any number of concurrent callers.
// =============================================================================

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::runtime_config::RateLimitConfig;

/// Request class with its own budget.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiClass {
    Historical,
    Option,
    Market,
    Default,
}

impl ApiClass {
    pub const ALL: [ApiClass; 4] = [
        ApiClass::Historical,
        ApiClass::Option,
        ApiClass::Market,
        ApiClass::Default,
    ];

    fn index(self) -> usize {
        match self {
            Self::Historical => 0,
            Self::Option => 1,
            Self::Market => 2,
            Self::Default => 3,
        }
    }
}

impl std::fmt::Display for ApiClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Historical => write!(f, "historical"),
            Self::Option => write!(f, "option"),
            Self::Market => write!(f, "market"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// Mutable state of one class.
#[derive(Debug)]
struct RateBucket {
    window_start_minute: i64,
    count: u32,
    default_limit: u32,
    consecutive_errors: u32,
    reduced_until: Option<DateTime<Utc>>,
}

/// Serialisable view of one class (suitable for a dashboard payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateBucketSnapshot {
    pub api_class: ApiClass,
    pub window_start_minute: i64,
    pub count: u32,
    pub limit: u32,
    pub default_limit: u32,
    pub consecutive_errors: u32,
    pub reduced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub buckets: Vec<RateBucketSnapshot>,
}

/// Shared limiter; construct once and hand out `Arc`s.
pub struct RateLimiter {
    buckets: [Mutex<RateBucket>; 4],
    clock: Arc<dyn Clock>,
    error_threshold: u32,
    reduction_pct: u32,
    min_limit: u32,
    reduction: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let minute = minute_of(clock.now());
        let bucket = |limit: u32| {
            Mutex::new(RateBucket {
                window_start_minute: minute,
                count: 0,
                default_limit: limit,
                consecutive_errors: 0,
                reduced_until: None,
            })
        };

        info!(
            historical = config.historical_per_min,
            option = config.option_per_min,
            market = config.market_per_min,
            default = config.default_per_min,
            "RateLimiter initialised"
        );

        Self {
            buckets: [
                bucket(config.historical_per_min),
                bucket(config.option_per_min),
                bucket(config.market_per_min),
                bucket(config.default_per_min),
            ],
            clock,
            error_threshold: config.error_threshold.max(1),
            reduction_pct: config.reduction_pct.min(100),
            min_limit: config.min_limit,
            reduction: Duration::seconds(config.reduction_secs as i64),
        }
    }

    // -------------------------------------------------------------------------
    // Pre-flight checks
    // -------------------------------------------------------------------------

    /// Take one unit of `class` budget for the current minute. Returns `false`
    /// when the budget is spent; the caller must not hit the upstream.
    pub fn try_acquire(&self, class: ApiClass) -> bool {
        let now = self.clock.now();
        let mut bucket = self.buckets[class.index()].lock();
        self.roll(&mut bucket, now);

        let limit = self.effective_limit(&bucket, now);
        if bucket.count >= limit {
            debug!(
                class = %class,
                count = bucket.count,
                limit,
                "request denied — per-minute budget spent"
            );
            return false;
        }
        bucket.count += 1;
        true
    }

    /// Signal an upstream throttling reply for `class`. Never fails.
    pub fn record_error(&self, class: ApiClass) {
        let now = self.clock.now();
        let mut bucket = self.buckets[class.index()].lock();
        self.roll(&mut bucket, now);
        bucket.consecutive_errors += 1;

        if bucket.consecutive_errors >= self.error_threshold {
            bucket.consecutive_errors = 0;
            bucket.reduced_until = Some(now + self.reduction);
            warn!(
                class = %class,
                default_limit = bucket.default_limit,
                reduced_limit = self.reduced_limit(bucket.default_limit),
                until = %(now + self.reduction),
                "repeated upstream throttling — reducing class limit"
            );
        } else {
            debug!(
                class = %class,
                consecutive = bucket.consecutive_errors,
                "upstream throttling recorded"
            );
        }
    }

    /// A successful upstream call breaks any run of throttling errors.
    pub fn record_success(&self, class: ApiClass) {
        self.buckets[class.index()].lock().consecutive_errors = 0;
    }

    /// Current effective limit for `class`.
    pub fn limit(&self, class: ApiClass) -> u32 {
        let now = self.clock.now();
        let mut bucket = self.buckets[class.index()].lock();
        self.roll(&mut bucket, now);
        self.effective_limit(&bucket, now)
    }

    /// Time left until the next minute boundary resets every budget.
    pub fn time_until_reset(&self) -> StdDuration {
        let now = self.clock.now();
        let next = (minute_of(now) + 1) * 60;
        let millis = (next * 1_000 - now.timestamp_millis()).max(0);
        StdDuration::from_millis(millis as u64)
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let now = self.clock.now();
        let buckets = ApiClass::ALL
            .iter()
            .map(|&class| {
                let mut bucket = self.buckets[class.index()].lock();
                self.roll(&mut bucket, now);
                RateBucketSnapshot {
                    api_class: class,
                    window_start_minute: bucket.window_start_minute,
                    count: bucket.count,
                    limit: self.effective_limit(&bucket, now),
                    default_limit: bucket.default_limit,
                    consecutive_errors: bucket.consecutive_errors,
                    reduced: bucket.reduced_until.is_some(),
                }
            })
            .collect();
        RateLimitSnapshot { buckets }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Start a fresh window when the minute has changed and lift an expired
    /// reduction.
    fn roll(&self, bucket: &mut RateBucket, now: DateTime<Utc>) {
        let minute = minute_of(now);
        if minute != bucket.window_start_minute {
            bucket.window_start_minute = minute;
            bucket.count = 0;
        }
        if let Some(until) = bucket.reduced_until {
            if now >= until {
                bucket.reduced_until = None;
                info!(default_limit = bucket.default_limit, "class limit restored");
            }
        }
    }

    fn effective_limit(&self, bucket: &RateBucket, now: DateTime<Utc>) -> u32 {
        match bucket.reduced_until {
            Some(until) if now < until => self.reduced_limit(bucket.default_limit),
            _ => bucket.default_limit,
        }
    }

    fn reduced_limit(&self, default_limit: u32) -> u32 {
        // Widened so very large configured limits cannot overflow; the cut is
        // never above `default_limit`, so it fits back into u32.
        let cut = u64::from(default_limit) * u64::from(100 - self.reduction_pct) / 100;
        let cut = u32::try_from(cut).unwrap_or(default_limit);
        cut.max(self.min_limit).min(default_limit)
    }
}

fn minute_of(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("RateLimiter");
        for class in ApiClass::ALL {
            let bucket = self.buckets[class.index()].lock();
            s.field(&class.to_string(), &(bucket.count, bucket.default_limit));
        }
        s.finish()
    }
}
