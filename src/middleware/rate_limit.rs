use std::time::Duration;

use crate::errors::AppError;

/// Fixed-window attempt counter kept in Redis.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub attempts: u64,
    pub window: Duration,
}

/// 5 attempts per 15 minutes.
pub const AUTH_LIMIT: RateLimit = RateLimit { attempts: 5, window: Duration::from_secs(900) };

impl RateLimit {
    /// Counts one attempt against `key`. The window starts with the first
    /// attempt; Redis errors let the request through.
    pub async fn hit(&self, redis: &mut redis::aio::MultiplexedConnection, key: &str) -> Result<(), AppError> {
        let counted: redis::RedisResult<(u64,)> = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("EX")
            .arg(self.window.as_secs())
            .arg("NX")
            .ignore()
            .cmd("INCR")
            .arg(key)
            .query_async(redis)
            .await;

        match counted {
            Ok((count,)) if self.exceeded(count) => Err(AppError::TooManyRequests),
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!("rate limit skipped for {key}: {e}");
                Ok(())
            }
        }
    }

    fn exceeded(&self, count: u64) -> bool {
        count > self.attempts
    }
}

/// Key for per-email throttling of an auth endpoint.
pub fn email_key(action: &str, email: &str) -> String {
    format!("rate:{action}:{}", email.trim().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        assert_eq!(email_key("login", " Ann@Example.org "), "rate:login:ann@example.org");
    }

    #[test]
    fn allows_exactly_the_budget() {
        assert!(!AUTH_LIMIT.exceeded(5));
        assert!(AUTH_LIMIT.exceeded(6));
    }
}
