use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use super::Clock;

pub const SCOPE_IP: &str = "ip";
pub const SCOPE_GROUP_QPM: &str = "group_qpm";

const DEFAULT_LIMITER_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("rate limit backend error: {0}")]
    Backend(String),
    #[error("rate limit backend timed out after {0:?}")]
    Timeout(Duration),
}

/// Sliding-window storage. `push_and_check` must be atomic per key.
///
/// A key keeps at most `max_count` request timestamps. A request is admitted
/// when fewer are stored, or when the oldest stored one is at least `window`
/// old (it is then evicted). Admitted requests append `now_ms`.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn push_and_check(
        &self,
        key: &str,
        max_count: u64,
        window: Duration,
        now_ms: u64,
    ) -> Result<bool, LimiterError>;
}

#[derive(Debug)]
struct WindowState {
    stamps: VecDeque<u64>,
    expires_at_ms: u64,
    last_access_ms: u64,
}

/// Process-local backing; DashMap shard locks make each check-and-push atomic.
#[derive(Debug)]
pub struct InMemoryRateLimitBackend {
    windows: DashMap<String, WindowState>,
    key_expiration: Duration,
}

impl Default for InMemoryRateLimitBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(20 * 60))
    }
}

impl InMemoryRateLimitBackend {
    pub fn new(key_expiration: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            key_expiration,
        }
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drops windows whose TTL passed or that sat idle past the key expiration.
    pub fn gc(&self, now_ms: u64) -> usize {
        let idle_ms = duration_to_millis(self.key_expiration);
        let before = self.windows.len();
        self.windows.retain(|_, state| {
            now_ms < state.expires_at_ms && now_ms.saturating_sub(state.last_access_ms) < idle_ms
        });
        before.saturating_sub(self.windows.len())
    }
}

#[async_trait]
impl RateLimitBackend for InMemoryRateLimitBackend {
    async fn push_and_check(
        &self,
        key: &str,
        max_count: u64,
        window: Duration,
        now_ms: u64,
    ) -> Result<bool, LimiterError> {
        let window_ms = duration_to_millis(window);
        let max = usize::try_from(max_count).unwrap_or(usize::MAX);

        let mut state = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowState {
                stamps: VecDeque::new(),
                expires_at_ms: 0,
                last_access_ms: now_ms,
            });
        state.last_access_ms = now_ms;
        if now_ms >= state.expires_at_ms {
            state.stamps.clear();
        }
        while state.stamps.len() > max {
            state.stamps.pop_front();
        }

        if state.stamps.len() < max {
            state.stamps.push_back(now_ms);
            state.expires_at_ms = now_ms.saturating_add(window_ms);
            return Ok(true);
        }

        let oldest = state.stamps.front().copied().unwrap_or(0);
        if now_ms.saturating_sub(oldest) < window_ms {
            return Ok(false);
        }
        state.stamps.pop_front();
        state.stamps.push_back(now_ms);
        state.expires_at_ms = now_ms.saturating_add(window_ms);
        Ok(true)
    }
}

/// Admission control over a [`RateLimitBackend`].
#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn RateLimitBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            timeout: DEFAULT_LIMITER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns whether one more request for `scope:identity` fits in the
    /// window. `max_count == 0` disables the limit.
    pub async fn allow(
        &self,
        scope: &str,
        identity: &str,
        max_count: u64,
        window: Duration,
    ) -> Result<bool, LimiterError> {
        if max_count == 0 {
            return Ok(true);
        }
        let key = format!("{scope}:{identity}");
        let now_ms = self.clock.now_millis();
        tokio::time::timeout(
            self.timeout,
            self.backend.push_and_check(&key, max_count, window, now_ms),
        )
        .await
        .map_err(|_| LimiterError::Timeout(self.timeout))?
    }
}

pub(crate) fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
