use std::time::Duration;

/// Retry an upstream call while it answers 429, sleeping a fixed delay
/// between attempts. Rate limiting alone never fails the call; every other
/// error is returned immediately.
///
/// Usage: `retry_api!(ctx.settings.rate_limit_delay, "finance page", api.fetch_page(&req))`
///
/// The expression is re-evaluated on each retry attempt. This is a macro
/// because async closures that return borrowed futures can't satisfy `Fn`.
macro_rules! retry_api {
    ($delay:expr, $what:expr, $expr:expr) => {{
        let mut _attempt: u32 = 0;
        loop {
            match $expr.await {
                Ok(val) => break Ok::<_, $crate::api::ApiError>(val),
                Err(e) if e.is_rate_limited() => {
                    _attempt += 1;
                    let wait: std::time::Duration = $delay;
                    log::warn!(
                        "Rate limited (429) on {}. Waiting {:?} before retry {}",
                        $what,
                        wait,
                        _attempt
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

pub(crate) use retry_api;

/// Bounded exponential backoff for failing sweep windows.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
