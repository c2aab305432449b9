use std::time::{Duration, Instant};

/// Window over which the burst bitrate is enforced.
pub const BURST_WINDOW: Duration = Duration::from_millis(5);

/// Window over which the average bitrate is enforced.
pub const AVERAGE_WINDOW: Duration = Duration::from_millis(100);

struct TokenBucket {
	bytes_per_second: f64,
	capacity: f64,
	tokens: f64,
	last_refill: Instant,
}

impl TokenBucket {
	fn new(rate_bps: u64, window: Duration) -> Self {
		let bytes_per_second = rate_bps as f64 / 8.0;
		let capacity = bytes_per_second * window.as_secs_f64();

		Self {
			bytes_per_second,
			capacity,
			tokens: capacity,
			last_refill: Instant::now(),
		}
	}

	fn refill(&mut self, now: Instant) {
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.bytes_per_second).min(self.capacity);
		self.last_refill = now;
	}

	/// Update the rate without discarding tokens already accumulated.
	fn set_rate(&mut self, rate_bps: u64, window: Duration, now: Instant) {
		self.refill(now);
		self.bytes_per_second = rate_bps as f64 / 8.0;
		self.capacity = self.bytes_per_second * window.as_secs_f64();
		self.tokens = self.tokens.min(self.capacity);
	}

	fn time_until(&self, bytes: f64) -> Duration {
		if self.tokens >= bytes {
			return Duration::ZERO;
		}
		Duration::from_secs_f64((bytes - self.tokens) / self.bytes_per_second)
	}
}

/// Dual-rate token bucket pacing the UDP sender: a small-window burst bucket
/// and a long-window average bucket, both of which must hold enough tokens
/// before a packet may leave.
pub struct NetworkThrottler {
	burst: TokenBucket,
	average: TokenBucket,
}

impl NetworkThrottler {
	pub fn new(bitrate_bps: u64, burst_bitrate_bps: u64) -> Self {
		Self {
			burst: TokenBucket::new(burst_bitrate_bps, BURST_WINDOW),
			average: TokenBucket::new(bitrate_bps, AVERAGE_WINDOW),
		}
	}

	pub fn update_rates(&mut self, bitrate_bps: u64, burst_bitrate_bps: u64) {
		let now = Instant::now();
		self.burst.set_rate(burst_bitrate_bps, BURST_WINDOW, now);
		self.average.set_rate(bitrate_bps, AVERAGE_WINDOW, now);
	}

	/// Sleep until both buckets can cover `bytes`, then deduct it from each.
	pub async fn wait_bytes(&mut self, bytes: usize) {
		let bytes = bytes as f64;

		loop {
			let now = Instant::now();
			self.burst.refill(now);
			self.average.refill(now);

			if self.burst.tokens >= bytes && self.average.tokens >= bytes {
				self.burst.tokens -= bytes;
				self.average.tokens -= bytes;
				return;
			}

			let wait = self.burst.time_until(bytes).max(self.average.time_until(bytes));
			tokio::time::sleep(wait).await;
		}
	}
}
