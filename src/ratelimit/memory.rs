use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{Decision, Denial, Metric, RateLimitStore, Window};
use crate::config::Limits;
use crate::strng::Strng;
use crate::trace;

#[derive(Debug, Clone, Copy, Default)]
struct Counter {
	window_id: i64,
	req: u64,
	tok: u64,
}

/// In-process backend. One lock guards the whole map: the reservation must
/// be all-or-nothing across every scope key, and the critical section is a
/// handful of map operations.
pub struct MemoryStore {
	counters: Mutex<HashMap<(Strng, Window), Counter>>,
}

const WINDOWS: [Window; 2] = [Window::Minute, Window::Day];

impl MemoryStore {
	pub fn new() -> Self {
		MemoryStore {
			counters: Mutex::new(HashMap::new()),
		}
	}

	/// Periodically evict counters whose window has passed. Without this the
	/// map grows one entry per (scope, window) ever seen.
	pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) {
		let store = Arc::clone(self);
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(interval);
			tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tick.tick().await;
				store.reap(Utc::now());
			}
		});
	}

	fn reap(&self, now: DateTime<Utc>) {
		let mut counters = self.counters.lock();
		let before = counters.len();
		counters.retain(|(_, window), c| c.window_id == window.id(now));
		trace!(evicted = before - counters.len(), "rate limit counters reaped");
	}

	#[cfg(test)]
	fn counter(&self, key: &Strng, window: Window, now: DateTime<Utc>) -> (u64, u64) {
		let counters = self.counters.lock();
		match counters.get(&(key.clone(), window)) {
			Some(c) if c.window_id == window.id(now) => (c.req, c.tok),
			_ => (0, 0),
		}
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

fn current<'a>(
	counters: &'a mut HashMap<(Strng, Window), Counter>,
	key: &Strng,
	window: Window,
	now: DateTime<Utc>,
) -> &'a mut Counter {
	let id = window.id(now);
	let c = counters.entry((key.clone(), window)).or_default();
	if c.window_id != id {
		*c = Counter {
			window_id: id,
			req: 0,
			tok: 0,
		};
	}
	c
}

fn check(
	counter: &Counter,
	limits: &Limits,
	key: &Strng,
	window: Window,
	est: u64,
	now: DateTime<Utc>,
) -> Option<Denial> {
	let (req_lim, tok_lim) = match window {
		Window::Minute => (limits.requests_per_minute, limits.tokens_per_minute),
		Window::Day => (limits.requests_per_day, limits.tokens_per_day),
	};
	if req_lim != 0 && counter.req + 1 > req_lim {
		return Some(Denial {
			scope: key.clone(),
			window,
			metric: Metric::Requests,
			limit: req_lim,
			remaining: req_lim.saturating_sub(counter.req),
			retry_after: window.seconds_remaining(now),
		});
	}
	// The first request of a window is admitted even when its estimate alone
	// exceeds the budget; otherwise an oversized request could never run.
	if tok_lim != 0 && counter.tok != 0 && counter.tok + est > tok_lim {
		return Some(Denial {
			scope: key.clone(),
			window,
			metric: Metric::Tokens,
			limit: tok_lim,
			remaining: tok_lim.saturating_sub(counter.tok),
			retry_after: window.seconds_remaining(now),
		});
	}
	None
}

#[async_trait]
impl RateLimitStore for MemoryStore {
	async fn check_and_reserve(
		&self,
		keys: &[(Strng, Limits)],
		est: u64,
		now: DateTime<Utc>,
	) -> anyhow::Result<Decision> {
		let mut counters = self.counters.lock();
		// Check every key and window first; a denial must not mutate anything.
		for (key, limits) in keys {
			for window in WINDOWS {
				let c = *current(&mut counters, key, window, now);
				if let Some(denial) = check(&c, limits, key, window, est, now) {
					return Ok(Decision::Denied(denial));
				}
			}
		}
		for (key, _) in keys {
			for window in WINDOWS {
				let c = current(&mut counters, key, window, now);
				c.req += 1;
				c.tok += est;
			}
		}
		Ok(Decision::Allowed)
	}

	async fn adjust(&self, keys: &[Strng], delta: i64, now: DateTime<Utc>) -> anyhow::Result<()> {
		let mut counters = self.counters.lock();
		for key in keys {
			for window in WINDOWS {
				// Only the live window; an expired reservation has already
				// been forgotten.
				if let Some(c) = counters.get_mut(&(key.clone(), window))
					&& c.window_id == window.id(now)
				{
					c.tok = if delta < 0 {
						c.tok.saturating_sub(delta.unsigned_abs())
					} else {
						c.tok.saturating_add(delta as u64)
					};
				}
			}
		}
		Ok(())
	}

	async fn cancel(&self, keys: &[Strng], est: u64, now: DateTime<Utc>) -> anyhow::Result<()> {
		let mut counters = self.counters.lock();
		for key in keys {
			for window in WINDOWS {
				if let Some(c) = counters.get_mut(&(key.clone(), window))
					&& c.window_id == window.id(now)
				{
					c.req = c.req.saturating_sub(1);
					c.tok = c.tok.saturating_sub(est);
				}
			}
		}
		Ok(())
	}
}
