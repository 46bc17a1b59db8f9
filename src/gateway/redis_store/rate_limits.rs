use std::time::Duration;

use async_trait::async_trait;

use super::RedisStore;
use crate::gateway::limits::{LimiterError, RateLimitBackend, duration_to_millis};

// KEYS[1] holds the newest-first list of admitted request timestamps (ms).
const RATE_LIMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local max_requests = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])

local count = redis.call("LLEN", key)
if count > max_requests then
  redis.call("LTRIM", key, 0, max_requests - 1)
  count = max_requests
end

if count < max_requests then
  redis.call("LPUSH", key, now_ms)
  redis.call("PEXPIRE", key, window_ms)
  return 1
end

local oldest = tonumber(redis.call("LINDEX", key, -1)) or 0
if now_ms - oldest >= window_ms then
  redis.call("LPUSH", key, now_ms)
  redis.call("LTRIM", key, 0, max_requests - 1)
  redis.call("PEXPIRE", key, window_ms)
  return 1
end
return 0
"#;

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl RedisStore {
    fn key_rate_limit(&self, key: &str) -> String {
        format!("{}:rate_limit:{key}", self.prefix)
    }
}

#[async_trait]
impl RateLimitBackend for RedisStore {
    async fn push_and_check(
        &self,
        key: &str,
        max_count: u64,
        window: Duration,
        now_ms: u64,
    ) -> Result<bool, LimiterError> {
        let mut conn = self
            .connection()
            .await
            .map_err(|err| LimiterError::Backend(format!("redis error: {err}")))?;

        let script = redis::Script::new(RATE_LIMIT_SCRIPT);
        let code: i64 = script
            .key(self.key_rate_limit(key))
            .arg(u64_to_i64(max_count))
            .arg(u64_to_i64(duration_to_millis(window).max(1)))
            .arg(u64_to_i64(now_ms))
            .invoke_async(&mut conn)
            .await
            .map_err(|err| LimiterError::Backend(format!("redis error: {err}")))?;

        match code {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(LimiterError::Backend(format!(
                "unexpected rate limit script response: {code}"
            ))),
        }
    }
}
