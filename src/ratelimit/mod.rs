use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{Config, LimitOverrides, Limits};
use crate::strng;
use crate::strng::Strng;
use crate::warn;

pub mod distributed;
pub mod memory;

/// The dimensions a request is accounted against. Every request always
/// counts against `global`; the rest apply when known.
#[derive(Debug, Clone, Default)]
pub struct ScopeKeys {
	pub provider: Option<Strng>,
	/// Canonical model name; aliases share their canonical bucket.
	pub model: Option<Strng>,
	pub api_key: Option<Strng>,
	pub user_id: Option<Strng>,
}

pub const GLOBAL_KEY: Strng = strng::literal!("global");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
	Minute,
	Day,
}

impl Window {
	const fn len_secs(&self) -> i64 {
		match self {
			Window::Minute => 60,
			Window::Day => 86_400,
		}
	}

	/// Identifier of the window containing `now`. Windows are aligned to
	/// wall-clock boundaries in UTC.
	pub fn id(&self, now: DateTime<Utc>) -> i64 {
		now.timestamp().div_euclid(self.len_secs())
	}

	/// Seconds until this window rolls over; always in `[1, window_len]`.
	pub fn seconds_remaining(&self, now: DateTime<Utc>) -> u64 {
		let len = self.len_secs();
		(len - now.timestamp().rem_euclid(len)) as u64
	}
}

impl std::fmt::Display for Window {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Window::Minute => write!(f, "minute"),
			Window::Day => write!(f, "day"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
	Requests,
	Tokens,
}

impl std::fmt::Display for Metric {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Metric::Requests => write!(f, "requests"),
			Metric::Tokens => write!(f, "tokens"),
		}
	}
}

/// The first failing (key, window, metric), reported back to the caller.
#[derive(Debug, Clone)]
pub struct Denial {
	pub scope: Strng,
	pub window: Window,
	pub metric: Metric,
	pub limit: u64,
	pub remaining: u64,
	pub retry_after: u64,
}

impl Denial {
	pub fn limit_name(&self) -> String {
		format!("{}_per_{}", self.metric, self.window)
	}
}

#[derive(Debug)]
pub enum Decision {
	Allowed,
	Denied(Denial),
}

/// A granted reservation: the keys that were debited and the estimate they
/// were debited by. Reconciled by `adjust` or reversed by `cancel`.
#[derive(Debug, Clone, Default)]
pub struct Reservation {
	pub keys: Vec<Strng>,
	pub est: u64,
}

impl Reservation {
	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}
}

#[derive(Debug)]
pub enum ReserveOutcome {
	Allowed(Reservation),
	Denied(Denial),
}

/// Storage backend: counters keyed by `(scope, window)`, with the reservation
/// applied atomically across every key or not at all.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
	async fn check_and_reserve(
		&self,
		keys: &[(Strng, Limits)],
		est: u64,
		now: DateTime<Utc>,
	) -> anyhow::Result<Decision>;

	/// Apply `actual - estimate` to the token counters. Negative deltas are
	/// refunds; counters clamp at zero.
	async fn adjust(&self, keys: &[Strng], delta: i64, now: DateTime<Utc>) -> anyhow::Result<()>;

	/// Reverse a reservation that never produced a usable response.
	async fn cancel(&self, keys: &[Strng], est: u64, now: DateTime<Utc>) -> anyhow::Result<()>;
}

pub struct RateLimiter {
	enabled: bool,
	base: Limits,
	overrides: LimitOverrides,
	/// provider -> alias -> canonical
	aliases: HashMap<Strng, HashMap<Strng, Strng>>,
	store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
	pub fn new(cfg: &Config, store: Arc<dyn RateLimitStore>) -> Self {
		let aliases = cfg
			.providers
			.keys()
			.map(|p| (p.clone(), cfg.model_aliases(p)))
			.collect();
		RateLimiter {
			enabled: cfg.rate_limiting.enabled,
			base: cfg.rate_limiting.limits,
			overrides: cfg.rate_limiting.overrides.clone(),
			aliases,
			store,
		}
	}

	pub fn disabled() -> Self {
		RateLimiter {
			enabled: false,
			base: Limits::default(),
			overrides: LimitOverrides::default(),
			aliases: HashMap::new(),
			store: Arc::new(memory::MemoryStore::new()),
		}
	}

	pub fn enabled(&self) -> bool {
		self.enabled
	}

	/// Map a requested model to its configured canonical name. Unknown names
	/// bucket under themselves.
	pub fn canonical_model(&self, provider: &Strng, requested: &Strng) -> Strng {
		self
			.aliases
			.get(provider)
			.and_then(|a| a.get(requested))
			.cloned()
			.unwrap_or_else(|| requested.clone())
	}

	/// Ordered scope keys with each key's effective limits. Overrides mask
	/// only the fields they set.
	fn keys_with_limits(&self, scope: &ScopeKeys) -> Vec<(Strng, Limits)> {
		let mut out = vec![(GLOBAL_KEY, self.base)];
		if let Some(p) = &scope.provider {
			out.push((strng::format!("provider:{p}"), self.base));
		}
		if let Some(m) = &scope.model {
			let limits = self
				.overrides
				.per_model
				.get(m.as_str())
				.map(|mask| mask.apply(self.base))
				.unwrap_or(self.base);
			out.push((strng::format!("model:{m}"), limits));
		}
		if let Some(k) = &scope.api_key {
			let limits = self
				.overrides
				.per_key
				.get(k.as_str())
				.map(|mask| mask.apply(self.base))
				.unwrap_or(self.base);
			out.push((strng::format!("key:{k}"), limits));
		}
		if let Some(u) = &scope.user_id {
			let limits = self
				.overrides
				.per_user
				.get(u.as_str())
				.map(|mask| mask.apply(self.base))
				.unwrap_or(self.base);
			out.push((strng::format!("user:{u}"), limits));
		}
		out
	}

	/// Reserve `est` tokens and one request across every applicable scope
	/// key, or deny with the first failing limit. A backend transport error
	/// fails open: blocking all traffic on a store outage is worse than
	/// briefly not enforcing limits.
	pub async fn check_and_reserve(
		&self,
		scope: &ScopeKeys,
		est: u64,
		now: DateTime<Utc>,
	) -> ReserveOutcome {
		if !self.enabled {
			return ReserveOutcome::Allowed(Reservation::default());
		}
		let keys = self.keys_with_limits(scope);
		match self.store.check_and_reserve(&keys, est, now).await {
			Ok(Decision::Allowed) => ReserveOutcome::Allowed(Reservation {
				keys: keys.into_iter().map(|(k, _)| k).collect(),
				est,
			}),
			Ok(Decision::Denied(denial)) => ReserveOutcome::Denied(denial),
			Err(e) => {
				warn!("rate limit store unavailable, allowing request: {e}");
				ReserveOutcome::Allowed(Reservation {
					keys: keys.into_iter().map(|(k, _)| k).collect(),
					est,
				})
			},
		}
	}

	pub async fn adjust(&self, reservation: &Reservation, delta: i64, now: DateTime<Utc>) {
		if !self.enabled || reservation.is_empty() || delta == 0 {
			return;
		}
		if let Err(e) = self.store.adjust(&reservation.keys, delta, now).await {
			warn!("rate limit adjust failed: {e}");
		}
	}

	pub async fn cancel(&self, reservation: &Reservation, now: DateTime<Utc>) {
		if !self.enabled || reservation.is_empty() {
			return;
		}
		if let Err(e) = self
			.store
			.cancel(&reservation.keys, reservation.est, now)
			.await
		{
			warn!("rate limit cancel failed: {e}");
		}
	}
}
