use std::time::Duration;

use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

// A token bucket paced at `rate` grants per second
//
// The bucket starts empty: callers pay the full pacing cost from the
// first call, and `burst` only bounds how many tokens accumulate while
// the bucket sits idle. Waiters queue on the mutex in FIFO order and
// hold it across their sleep, so grants are handed out in arrival
// order even under contention.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate: f64,
    capacity: f64,
}

impl TokenBucket {
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
            rate: f64::from(rate.max(1)),
            capacity: f64::from(burst.max(1)),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
    }

    // Block until a token is available and consume it
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());

        if state.tokens < 1.0 {
            let missing = 1.0 - state.tokens;
            let wait = Duration::from_secs_f64(missing / self.rate);
            sleep(wait).await;
            self.refill(&mut state, Instant::now());
        }

        state.tokens = (state.tokens - 1.0).max(0.0);
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .finish()
    }
}
