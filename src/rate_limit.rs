// In-memory rate limiter for the model-facing endpoints.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Different rate limit types with their constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitType {
    /// Max turn submissions per hour (each one is a gateway call).
    TurnSubmissions,
    /// Max battle creations per hour.
    BattleCreates,
}

impl RateLimitType {
    /// Maximum number of events allowed in the window.
    pub fn max_count(&self) -> usize {
        match self {
            RateLimitType::TurnSubmissions => 60,
            RateLimitType::BattleCreates => 20,
        }
    }

    /// Time window for the rate limit.
    pub fn window(&self) -> Duration {
        match self {
            RateLimitType::TurnSubmissions => Duration::from_secs(3600),
            RateLimitType::BattleCreates => Duration::from_secs(3600),
        }
    }
}

impl std::fmt::Display for RateLimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitType::TurnSubmissions => write!(f, "turn submissions per hour"),
            RateLimitType::BattleCreates => write!(f, "battle creations per hour"),
        }
    }
}

/// Error returned when a rate limit is exceeded.
#[derive(Debug, Clone)]
pub struct RateLimitError {
    pub limit_type: RateLimitType,
    pub max: usize,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Rate limit exceeded: max {} {}",
            self.max, self.limit_type
        )
    }
}

impl std::error::Error for RateLimitError {}

/// Key for the rate limit map: (user_id, limit_type).
type LimitKey = (String, RateLimitType);

/// Thread-safe in-memory rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<LimitKey, Vec<Instant>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check if the user is within the rate limit for the given type.
    /// If within limits, records the event and returns Ok(()).
    /// If exceeded, returns Err(RateLimitError).
    /// In local mode, rate limiting is always bypassed.
    pub fn check_limit(
        &self,
        user_id: &str,
        limit_type: RateLimitType,
    ) -> Result<(), RateLimitError> {
        if crate::config::is_local_mode() {
            return Ok(());
        }
        let mut map = self.inner.lock().unwrap();
        let key = (user_id.to_string(), limit_type);
        let window = limit_type.window();
        let max = limit_type.max_count();
        let now = Instant::now();

        let entries = map.entry(key).or_default();

        // Remove expired entries
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= max {
            return Err(RateLimitError { limit_type, max });
        }

        entries.push(now);
        Ok(())
    }

    /// Get the current count for a user and limit type (for testing/diagnostics).
    pub fn current_count(&self, user_id: &str, limit_type: RateLimitType) -> usize {
        let mut map = self.inner.lock().unwrap();
        let key = (user_id.to_string(), limit_type);
        let window = limit_type.window();
        let now = Instant::now();

        if let Some(entries) = map.get_mut(&key) {
            entries.retain(|t| now.duration_since(*t) < window);
            entries.len()
        } else {
            0
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
