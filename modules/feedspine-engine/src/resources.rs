//! Shared resources injected into adapters and enrichers: one HTTP
//! client, a token-bucket rate limiter, and a global concurrency
//! semaphore. Pool lifetime follows the orchestrator's open scope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::info;

use feedspine_core::FeedSpineError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_MAX_CONCURRENT: usize = 8;

// ---------------------------------------------------------------------------
// Token-bucket rate limiter
// ---------------------------------------------------------------------------

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket refilling at `rate` per second with a burst of one, so
/// requests pace out evenly. `acquire` suspends until a token is
/// available.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `requests_per_second` must be positive; values below a very slow
    /// floor are clamped.
    pub fn new(requests_per_second: f64) -> Self {
        let rate = requests_per_second.max(0.001);
        Self {
            rate,
            capacity: 1.0,
            bucket: Mutex::new(Bucket {
                tokens: 1.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for the refill when the bucket is dry.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
                bucket.last_refill = Instant::now();
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

// ---------------------------------------------------------------------------
// ResourcePool
// ---------------------------------------------------------------------------

pub struct ResourcePool {
    http: reqwest::Client,
    rate_limiter: Option<RateLimiter>,
    semaphore: Arc<Semaphore>,
    open: AtomicBool,
}

impl ResourcePool {
    pub fn new(
        requests_per_second: Option<f64>,
        max_concurrent: Option<usize>,
    ) -> Result<Self, FeedSpineError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| FeedSpineError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            rate_limiter: requests_per_second.map(RateLimiter::new),
            semaphore: Arc::new(Semaphore::new(
                max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT).max(1),
            )),
            open: AtomicBool::new(false),
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Wait for a rate-limit token. No-op when the pool has no limiter.
    pub async fn throttle(&self) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }
    }

    /// Take a slot on the global concurrency semaphore. Returns None
    /// once the pool is closed.
    pub async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// Release the pool. Pending and future `acquire_slot` calls fail,
    /// so nothing can hold a slot past the orchestrator scope.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.semaphore.close();
        info!("resource pool closed");
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
