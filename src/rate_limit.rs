/*!
This module provides `TokenBucket`, a fixed-window rate limiter admitting up to `threshold`
operations per `period`.

The bucket starts full. Once at least one `period` has elapsed since the last refill the bucket
is reset to exactly `threshold` tokens and the window restarts at that moment. Tokens never
accumulate across missed windows and are not trickled in smoothly: a full burst of `threshold`
operations is admitted right at the start of every window.

# Example

```rust
use flowgate::rate_limit::TokenBucket;
use std::time::{Duration, Instant};

let limiter = TokenBucket::new(5, Duration::from_millis(200));

// Whole window allowance is available at once
for _ in 0..5 {
    assert!(limiter.try_acquire());
}
assert!(!limiter.try_acquire());

// Blocks until the next window starts
let started = Instant::now();
limiter.acquire();
assert!(started.elapsed() >= Duration::from_millis(100));
```
!*/

use crate::config::{ConfigError, RateLimiterConfig};
use crate::sync::{deadline_after, lock, wait, wait_until};
use log::{debug, trace};

use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Source of current time for window bookkeeping.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Reads `Instant::now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonoClock;

impl Clock for MonoClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<T: Clock> Clock for &T {
    fn now(&self) -> Instant {
        (*self).now()
    }
}

#[derive(Debug)]
struct Window {
    tokens: u64,
    // Start of the current window
    checkpoint: Instant,
}

/// Fixed-window token bucket.
///
/// The token count and the window start are updated together under one lock, so concurrent
/// callers can not both refill the same window and admission never exceeds `threshold` per
/// window.
///
/// Blocking acquisition waits against the real time; `clock` only needs to follow it when
/// `acquire` is used.
pub struct TokenBucket<C: Clock = MonoClock> {
    threshold: u64,
    period: Duration,
    clock: C,
    window: Mutex<Window>,
    refilled: Condvar,
}

impl<C: Clock> fmt::Debug for TokenBucket<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("threshold", &self.threshold)
            .field("period", &self.period)
            .field("window", &*lock(&self.window))
            .finish()
    }
}

impl TokenBucket<MonoClock> {
    /// Creates full bucket admitting `threshold` operations per `period`.
    ///
    /// Panics if `threshold == 0` or `period` is zero.
    pub fn new(threshold: u64, period: Duration) -> TokenBucket<MonoClock> {
        TokenBucket::with_clock(threshold, period, MonoClock)
    }

    /// Creates bucket from validated `config`.
    pub fn with_config(config: &RateLimiterConfig) -> Result<TokenBucket<MonoClock>, ConfigError> {
        config.validate()?;
        Ok(TokenBucket::new(config.threshold, config.period))
    }
}

impl<C: Clock> TokenBucket<C> {
    /// Creates full bucket reading time from `clock`.
    ///
    /// Panics if `threshold == 0` or `period` is zero.
    pub fn with_clock(threshold: u64, period: Duration, clock: C) -> TokenBucket<C> {
        assert!(threshold > 0, "TokenBucket::new bad threshold");
        assert!(!period.is_zero(), "TokenBucket::new bad period");

        let checkpoint = clock.now();
        TokenBucket {
            threshold,
            period,
            clock,
            window: Mutex::new(Window {
                tokens: threshold,
                checkpoint,
            }),
            refilled: Condvar::new(),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of operations that would be admitted right now without waiting.
    pub fn available(&self) -> u64 {
        let mut window = lock(&self.window);
        self.refill(&mut window, self.clock.now());
        window.tokens
    }

    fn refill(&self, window: &mut Window, now: Instant) {
        if now.saturating_duration_since(window.checkpoint) >= self.period {
            trace!(
                "token bucket refilled to {} ({} left from previous window)",
                self.threshold,
                window.tokens
            );
            window.tokens = self.threshold;
            window.checkpoint = now;
            self.refilled.notify_all();
        }
    }

    fn take(window: &mut Window) -> bool {
        if window.tokens > 0 {
            window.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Takes one token if available in the current window. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let mut window = lock(&self.window);
        self.refill(&mut window, self.clock.now());
        Self::take(&mut window)
    }

    /// Takes one token, blocking until a window with a free token starts.
    pub fn acquire(&self) {
        self.acquire_until(None);
    }

    /// Like `acquire` but gives up after `timeout`, returning `false`.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        self.acquire_until(deadline_after(timeout))
    }

    /// Like `acquire` but gives up at `deadline`, returning `false`.
    pub fn acquire_deadline(&self, deadline: Instant) -> bool {
        self.acquire_until(Some(deadline))
    }

    fn acquire_until(&self, deadline: Option<Instant>) -> bool {
        let mut window = lock(&self.window);

        loop {
            let now = self.clock.now();
            self.refill(&mut window, now);
            if Self::take(&mut window) {
                return true;
            }

            // Bucket is empty until the window ends; an unrepresentable end leaves only the deadline
            let until_refill = window
                .checkpoint
                .checked_add(self.period)
                .map(|window_end| window_end.saturating_duration_since(now));
            let mut wake_at = until_refill.and_then(deadline_after);
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    debug!("gave up waiting for token bucket permit");
                    return false;
                }
                wake_at = Some(wake_at.map_or(deadline, |wake_at| wake_at.min(deadline)));
            }

            trace!("waiting {:?} for token bucket refill", until_refill);
            window = match wake_at {
                None => wait(&self.refilled, window),
                Some(wake_at) => {
                    wait_until(&self.refilled, window, wake_at).unwrap_or_else(|window| window)
                }
            };
        }
    }
}
