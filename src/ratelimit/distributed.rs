use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;

use super::{Decision, Denial, Metric, RateLimitStore, Window};
use crate::config::Limits;
use crate::strng::Strng;

/// Distributed backend: the whole reservation decision runs as one atomic
/// server-side script. Counter keys embed the window id, so a fresh window is
/// a fresh key and expiry is handled by TTL alone.
///
/// KEYS: `[minute_1, day_1, minute_2, day_2, ...]`, one pair per scope key.
/// ARGV: `[est, ttl_minute, ttl_day]` then four limits per scope
/// (`rpm, tpm, rpd, tpd`), parallel to KEYS.
/// Returns `{1}` on success, or
/// `{0, index, window, metric, limit, remaining, retry_after}` without
/// having mutated anything (window/metric: 1=minute/requests, 2=day/tokens).
const RESERVE_SCRIPT: &str = r#"
local est = tonumber(ARGV[1])
local ttl_min = tonumber(ARGV[2])
local ttl_day = tonumber(ARGV[3])
local pairs_n = #KEYS / 2
for i = 1, pairs_n do
  local base = 3 + (i - 1) * 4
  local limits = {tonumber(ARGV[base + 1]), tonumber(ARGV[base + 2]),
                  tonumber(ARGV[base + 3]), tonumber(ARGV[base + 4])}
  local ttls = {ttl_min, ttl_day}
  for w = 1, 2 do
    local key = KEYS[2 * (i - 1) + w]
    local req = tonumber(redis.call('HGET', key, 'req') or '0')
    local tok = tonumber(redis.call('HGET', key, 'tok') or '0')
    local req_lim = limits[2 * w - 1]
    local tok_lim = limits[2 * w]
    if req_lim > 0 and req + 1 > req_lim then
      return {0, i, w, 1, req_lim, req_lim - req, ttls[w]}
    end
    if tok_lim > 0 and tok > 0 and tok + est > tok_lim then
      return {0, i, w, 2, tok_lim, tok_lim - tok, ttls[w]}
    end
  end
end
for i = 1, pairs_n do
  local mkey = KEYS[2 * i - 1]
  local dkey = KEYS[2 * i]
  redis.call('HINCRBY', mkey, 'req', 1)
  redis.call('HINCRBY', mkey, 'tok', est)
  redis.call('EXPIRE', mkey, ttl_min)
  redis.call('HINCRBY', dkey, 'req', 1)
  redis.call('HINCRBY', dkey, 'tok', est)
  redis.call('EXPIRE', dkey, ttl_day)
end
return {1}
"#;

/// Token reconciliation. Touches only keys that still exist; creating a
/// counter here would give it no TTL.
const ADJUST_SCRIPT: &str = r#"
local delta = tonumber(ARGV[1])
for i = 1, #KEYS do
  if redis.call('EXISTS', KEYS[i]) == 1 then
    local tok = tonumber(redis.call('HGET', KEYS[i], 'tok') or '0') + delta
    if tok < 0 then tok = 0 end
    redis.call('HSET', KEYS[i], 'tok', tok)
  end
end
return 1
"#;

const CANCEL_SCRIPT: &str = r#"
local est = tonumber(ARGV[1])
for i = 1, #KEYS do
  if redis.call('EXISTS', KEYS[i]) == 1 then
    local req = tonumber(redis.call('HGET', KEYS[i], 'req') or '0') - 1
    if req < 0 then req = 0 end
    local tok = tonumber(redis.call('HGET', KEYS[i], 'tok') or '0') - est
    if tok < 0 then tok = 0 end
    redis.call('HSET', KEYS[i], 'req', req, 'tok', tok)
  end
end
return 1
"#;

pub struct DistributedStore {
	conn: ConnectionManager,
	reserve: Script,
	adjust: Script,
	cancel: Script,
}

impl DistributedStore {
	pub async fn connect(url: &str) -> anyhow::Result<Self> {
		let client = redis::Client::open(url)?;
		let conn = client.get_connection_manager().await?;
		Ok(DistributedStore {
			conn,
			reserve: Script::new(RESERVE_SCRIPT),
			adjust: Script::new(ADJUST_SCRIPT),
			cancel: Script::new(CANCEL_SCRIPT),
		})
	}
}

fn window_keys(scope: &Strng, now: DateTime<Utc>) -> (String, String) {
	(
		format!("rl:{{{scope}}}:m:{}", Window::Minute.id(now)),
		format!("rl:{{{scope}}}:d:{}", Window::Day.id(now)),
	)
}

#[async_trait]
impl RateLimitStore for DistributedStore {
	async fn check_and_reserve(
		&self,
		keys: &[(Strng, Limits)],
		est: u64,
		now: DateTime<Utc>,
	) -> anyhow::Result<Decision> {
		let mut invocation = self.reserve.prepare_invoke();
		for (scope, _) in keys {
			let (mkey, dkey) = window_keys(scope, now);
			invocation.key(mkey).key(dkey);
		}
		invocation
			.arg(est)
			.arg(Window::Minute.seconds_remaining(now))
			.arg(Window::Day.seconds_remaining(now));
		for (_, limits) in keys {
			invocation
				.arg(limits.requests_per_minute)
				.arg(limits.tokens_per_minute)
				.arg(limits.requests_per_day)
				.arg(limits.tokens_per_day);
		}

		let mut conn = self.conn.clone();
		let result: Vec<i64> = invocation.invoke_async(&mut conn).await?;
		match result.as_slice() {
			[1, ..] => Ok(Decision::Allowed),
			[0, index, window, metric, limit, remaining, retry_after] => {
				let scope = keys
					.get((*index as usize).saturating_sub(1))
					.map(|(k, _)| k.clone())
					.unwrap_or_default();
				Ok(Decision::Denied(Denial {
					scope,
					window: if *window == 1 { Window::Minute } else { Window::Day },
					metric: if *metric == 1 { Metric::Requests } else { Metric::Tokens },
					limit: *limit as u64,
					remaining: (*remaining).max(0) as u64,
					retry_after: (*retry_after).max(1) as u64,
				}))
			},
			other => anyhow::bail!("unexpected rate limit script result: {other:?}"),
		}
	}

	async fn adjust(&self, keys: &[Strng], delta: i64, now: DateTime<Utc>) -> anyhow::Result<()> {
		let mut invocation = self.adjust.prepare_invoke();
		for scope in keys {
			let (mkey, dkey) = window_keys(scope, now);
			invocation.key(mkey).key(dkey);
		}
		invocation.arg(delta);
		let mut conn = self.conn.clone();
		let _: i64 = invocation.invoke_async(&mut conn).await?;
		Ok(())
	}

	async fn cancel(&self, keys: &[Strng], est: u64, now: DateTime<Utc>) -> anyhow::Result<()> {
		let mut invocation = self.cancel.prepare_invoke();
		for scope in keys {
			let (mkey, dkey) = window_keys(scope, now);
			invocation.key(mkey).key(dkey);
		}
		invocation.arg(est);
		let mut conn = self.conn.clone();
		let _: i64 = invocation.invoke_async(&mut conn).await?;
		Ok(())
	}
}
