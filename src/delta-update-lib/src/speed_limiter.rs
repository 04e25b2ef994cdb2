use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Download throttle shared by every chunk of every concurrent update.
/// The engine only brackets chunks and asks for budget, it never touches the
/// limiter's internal state.
#[async_trait]
pub trait SpeedLimiter: Send + Sync {
    fn begin_chunk(&self) {}

    fn end_chunk(&self) {}

    /// Wait until `bytes` may be transferred.
    async fn acquire(&self, bytes: u64);
}

/// Calls `end_chunk` on drop, so the bracket closes on every exit path.
pub struct SpeedLimiterGuard<'a> {
    limiter: Option<&'a dyn SpeedLimiter>,
}

impl<'a> SpeedLimiterGuard<'a> {
    pub fn begin(limiter: Option<&'a dyn SpeedLimiter>) -> Self {
        if let Some(limiter) = limiter {
            limiter.begin_chunk();
        }
        Self { limiter }
    }
}

impl Drop for SpeedLimiterGuard<'_> {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter {
            limiter.end_chunk();
        }
    }
}

struct BucketState {
    available: f64,
    last_refill: Instant,
}

/// Token bucket, burst of one second worth of budget. Large requests go into
/// debt and the caller sleeps until the debt is paid back.
pub struct TokenBucketSpeedLimiter {
    bytes_per_sec: u64,
    state: Mutex<BucketState>,
    active_chunks: AtomicUsize,
}

impl TokenBucketSpeedLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            state: Mutex::new(BucketState {
                available: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
            active_chunks: AtomicUsize::new(0),
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    pub fn active_chunks(&self) -> usize {
        self.active_chunks.load(Ordering::SeqCst)
    }

    fn reserve(&self, bytes: u64) -> Duration {
        if self.bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        let rate = self.bytes_per_sec as f64;
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.available = (state.available + elapsed * rate).min(rate);
        state.last_refill = now;
        state.available -= bytes as f64;
        if state.available >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.available / rate)
        }
    }
}

#[async_trait]
impl SpeedLimiter for TokenBucketSpeedLimiter {
    fn begin_chunk(&self) {
        self.active_chunks.fetch_add(1, Ordering::SeqCst);
    }

    fn end_chunk(&self) {
        self.active_chunks.fetch_sub(1, Ordering::SeqCst);
    }

    async fn acquire(&self, bytes: u64) {
        let wait = self.reserve(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
