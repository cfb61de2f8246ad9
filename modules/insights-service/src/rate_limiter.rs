//! Token-bucket rate limiter for LLM calls.
//!
//! Primary bucket: requests per minute. Optional secondary bucket: tokens
//! per minute, debited after the provider reports usage; that bucket may go
//! negative, in which case the next `acquire` waits until it refills.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

pub struct RateLimiter {
    state: Mutex<BucketState>,
    rpm: u32,
    tpm: Option<u32>,
    closed: AtomicBool,
    notify: Notify,
}

struct BucketState {
    requests: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rpm: u32, tpm: Option<u32>) -> Self {
        Self {
            state: Mutex::new(BucketState {
                requests: rpm as f64,
                tokens: tpm.unwrap_or(0) as f64,
                last_refill: Instant::now(),
            }),
            rpm,
            tpm,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Block until a request slot is available. Returns false when the
    /// limiter has been closed (shutdown), so callers can bail out.
    pub async fn acquire(&self) -> bool {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            // Compute the wait under the lock, sleep outside it.
            let wait = {
                let mut state = self.state.lock().unwrap();
                self.refill(&mut state);
                if state.requests >= 1.0 && state.tokens >= 0.0 {
                    state.requests -= 1.0;
                    None
                } else {
                    let request_wait = if state.requests >= 1.0 {
                        0.0
                    } else {
                        (1.0 - state.requests) * 60.0 / self.rpm as f64
                    };
                    let token_wait = match self.tpm {
                        Some(tpm) if state.tokens < 0.0 => -state.tokens * 60.0 / tpm as f64,
                        _ => 0.0,
                    };
                    Some(Duration::from_secs_f64(request_wait.max(token_wait).max(0.05)))
                }
            };
            let wait = match wait {
                None => return true,
                Some(w) => w,
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Debit the token bucket once actual usage is known. No-op when no
    /// TPM limit is configured.
    pub fn debit_tokens(&self, tokens: i64) {
        if self.tpm.is_none() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.tokens -= tokens as f64;
    }

    /// Cancel blocked `acquire`s; used during shutdown.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.last_refill = Instant::now();
        state.requests = (state.requests + elapsed * self.rpm as f64 / 60.0).min(self.rpm as f64);
        if let Some(tpm) = self.tpm {
            state.tokens = (state.tokens + elapsed * tpm as f64 / 60.0).min(tpm as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn acquire_spends_burst_capacity() {
        let limiter = RateLimiter::new(60, None);
        // The bucket starts full, so an initial burst goes through.
        for _ in 0..10 {
            assert!(limiter.acquire().await);
        }
    }

    #[tokio::test]
    async fn acquire_waits_when_bucket_is_empty() {
        // 1200 rpm refills 20 requests/sec, so an empty bucket recovers
        // one slot in ~50ms.
        let limiter = RateLimiter::new(1200, None);
        {
            let mut state = limiter.state.lock().unwrap();
            state.requests = 0.0;
            state.last_refill = Instant::now();
        }
        let start = Instant::now();
        assert!(limiter.acquire().await);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn negative_token_bucket_delays_next_acquire() {
        // 60000 tpm refills 1000 tokens/sec; 100 tokens of debt is ~100ms.
        let limiter = RateLimiter::new(6000, Some(60000));
        assert!(limiter.acquire().await);
        limiter.debit_tokens(60100);
        let start = Instant::now();
        assert!(limiter.acquire().await);
        assert!(start.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test]
    async fn close_cancels_blocked_acquire() {
        let limiter = Arc::new(RateLimiter::new(60, None));
        {
            let mut state = limiter.state.lock().unwrap();
            state.requests = 0.0;
            // Pin the refill clock so the waiter stays blocked.
            state.last_refill = Instant::now();
        }
        let l2 = limiter.clone();
        let waiter = tokio::spawn(async move { l2.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.close();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire did not cancel")
            .unwrap();
        assert!(!got);
        // Once closed, acquire refuses immediately.
        assert!(!limiter.acquire().await);
    }
}
