use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;

use crate::config::{CostTrackingConfig, TrackerMode};
use crate::llm::ResponseMetadata;
use crate::pricing::PriceTable;
use crate::strng::Strng;
use crate::{debug, warn};

pub mod sink;

use sink::CostSink;

/// One normalized record per completed request.
#[derive(Debug, Clone, Serialize)]
pub struct CostRecord {
	pub timestamp: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub request_id: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_id: Option<Strng>,
	pub ip: String,
	pub provider: Strng,
	pub model: Strng,
	pub endpoint: String,
	pub is_streaming: bool,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub total_tokens: u64,
	pub input_cost: f64,
	pub output_cost: f64,
	pub total_cost: f64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<Strng>,
}

/// Request-scoped context the cost record needs beyond response metadata.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
	pub user_id: Option<Strng>,
	pub ip: String,
	pub endpoint: String,
	pub requested_model: Strng,
}

/// 24h rolling aggregate for the health endpoint: one bucket per clock hour.
#[derive(Debug, Default)]
struct StatsWindow {
	buckets: [StatsBucket; 24],
}

#[derive(Debug, Default, Clone, Copy)]
struct StatsBucket {
	hour_id: i64,
	requests: u64,
	input_tokens: u64,
	output_tokens: u64,
	total_cost: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CostStats {
	pub requests: u64,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub total_cost: f64,
}

impl StatsWindow {
	fn observe(&mut self, record: &CostRecord) {
		let hour_id = record.timestamp.timestamp().div_euclid(3600);
		let bucket = &mut self.buckets[hour_id.rem_euclid(24) as usize];
		if bucket.hour_id != hour_id {
			*bucket = StatsBucket {
				hour_id,
				..Default::default()
			};
		}
		bucket.requests += 1;
		bucket.input_tokens += record.input_tokens;
		bucket.output_tokens += record.output_tokens;
		bucket.total_cost += record.total_cost;
	}

	fn snapshot(&self, now: DateTime<Utc>) -> CostStats {
		let hour_id = now.timestamp().div_euclid(3600);
		let mut out = CostStats::default();
		for bucket in &self.buckets {
			if hour_id - bucket.hour_id < 24 {
				out.requests += bucket.requests;
				out.input_tokens += bucket.input_tokens;
				out.output_tokens += bucket.output_tokens;
				out.total_cost += bucket.total_cost;
			}
		}
		out
	}
}

/// Computes cost from usage and writes records through every registered sink,
/// either inline (sync mode) or via a bounded queue drained by worker tasks.
pub struct CostTracker {
	pricing: Arc<PriceTable>,
	sinks: Vec<Arc<dyn CostSink>>,
	mode: TrackerMode,
	tx: Mutex<Option<mpsc::Sender<CostRecord>>>,
	workers: Mutex<Option<JoinSet<()>>>,
	stats: Mutex<StatsWindow>,
}

impl CostTracker {
	pub fn new(
		cfg: &CostTrackingConfig,
		pricing: Arc<PriceTable>,
		sinks: Vec<Arc<dyn CostSink>>,
	) -> Arc<Self> {
		let tracker = Arc::new(CostTracker {
			pricing,
			sinks,
			mode: cfg.mode.clone(),
			tx: Mutex::new(None),
			workers: Mutex::new(None),
			stats: Mutex::new(StatsWindow::default()),
		});
		if cfg.mode == TrackerMode::Async {
			let (tx, rx) = mpsc::channel::<CostRecord>(cfg.queue_size.max(1));
			let rx = Arc::new(tokio::sync::Mutex::new(rx));
			let mut workers = JoinSet::new();
			for _ in 0..cfg.workers.max(1) {
				let rx = rx.clone();
				let tracker = tracker.clone();
				let flush_interval = cfg.flush_interval;
				workers.spawn(async move {
					let mut flush = tokio::time::interval(flush_interval);
					flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
					loop {
						let record = tokio::select! {
							record = async { rx.lock().await.recv().await } => record,
							_ = flush.tick() => {
								tracker.flush_all().await;
								continue;
							},
						};
						match record {
							Some(record) => tracker.write_all(&record).await,
							// Channel closed: drain is complete, exit.
							None => break,
						}
					}
					tracker.flush_all().await;
				});
			}
			*tracker.tx.lock() = Some(tx);
			*tracker.workers.lock() = Some(workers);
		}
		tracker
	}

	/// Build and submit the record for a completed request. In async mode a
	/// full queue falls back to an inline write rather than dropping the
	/// record.
	pub async fn record_response(&self, ctx: &RequestContext, meta: &ResponseMetadata) {
		let record = self.build_record(ctx, meta, Utc::now());
		self.stats.lock().observe(&record);
		let tx = self.tx.lock().clone();
		match (&self.mode, tx) {
			(TrackerMode::Async, Some(tx)) => match tx.try_send(record) {
				Ok(()) => {},
				Err(TrySendError::Full(record)) => {
					debug!("cost queue full, writing inline");
					self.write_all(&record).await;
				},
				Err(TrySendError::Closed(record)) => {
					self.write_all(&record).await;
				},
			},
			_ => self.write_all(&record).await,
		}
	}

	pub fn build_record(
		&self,
		ctx: &RequestContext,
		meta: &ResponseMetadata,
		now: DateTime<Utc>,
	) -> CostRecord {
		// Bill under the name the caller asked for; the response model is a
		// fallback for requests where we could not read one (e.g. Gemini).
		let model = if ctx.requested_model.is_empty() {
			meta.model.clone().unwrap_or_default()
		} else {
			ctx.requested_model.clone()
		};
		let (input_cost, output_cost) =
			match self
				.pricing
				.resolve_fuzzy(&meta.provider, &model, meta.input_tokens)
			{
				Ok(price) => {
					if price.is_estimate {
						debug!(
							model = %model,
							matched = %price.canonical,
							"pricing matched by edit distance, costs are estimates"
						);
					}
					(
						cost_of(meta.input_tokens, price.rate.input),
						cost_of(meta.output_tokens, price.rate.output),
					)
				},
				Err(e) => {
					warn!(provider = %meta.provider, model = %model, "no pricing found, recording zero cost: {e}");
					(0.0, 0.0)
				},
			};
		let total_tokens = if meta.total_tokens != 0 {
			meta.total_tokens
		} else {
			meta.input_tokens + meta.output_tokens
		};
		CostRecord {
			timestamp: now,
			request_id: meta.request_id.clone(),
			user_id: ctx.user_id.clone(),
			ip: ctx.ip.clone(),
			provider: meta.provider.clone(),
			model,
			endpoint: ctx.endpoint.clone(),
			is_streaming: meta.is_streaming,
			input_tokens: meta.input_tokens,
			output_tokens: meta.output_tokens,
			total_tokens,
			input_cost,
			output_cost,
			total_cost: input_cost + output_cost,
			finish_reason: meta.finish_reason.clone(),
		}
	}

	async fn write_all(&self, record: &CostRecord) {
		for sink in &self.sinks {
			if let Err(e) = sink.write_record(record).await {
				warn!(sink = sink.name(), "cost sink write failed: {e}");
			}
		}
	}

	async fn flush_all(&self) {
		for sink in &self.sinks {
			if let Err(e) = sink.flush().await {
				warn!(sink = sink.name(), "cost sink flush failed: {e}");
			}
		}
	}

	pub fn stats_24h(&self, now: DateTime<Utc>) -> CostStats {
		self.stats.lock().snapshot(now)
	}

	/// Close the queue and wait for the workers to drain what remains.
	pub async fn shutdown(&self) {
		drop(self.tx.lock().take());
		let workers = self.workers.lock().take();
		if let Some(mut workers) = workers {
			while workers.join_next().await.is_some() {}
		}
		self.flush_all().await;
	}
}

fn cost_of(tokens: u64, per_million: f64) -> f64 {
	(tokens as f64 / 1_000_000.0) * per_million
}

#[cfg(test)]
pub(crate) fn test_record(input: u64, output: u64, total_cost: f64) -> CostRecord {
	CostRecord {
		timestamp: Utc::now(),
		request_id: Some(crate::strng::literal!("req-1")),
		user_id: Some(crate::strng::literal!("u1")),
		ip: "10.0.0.1".to_string(),
		provider: crate::strng::literal!("openai"),
		model: crate::strng::literal!("gpt-4o"),
		endpoint: "/openai/v1/chat/completions".to_string(),
		is_streaming: false,
		input_tokens: input,
		output_tokens: output,
		total_tokens: input + output,
		input_cost: total_cost / 2.0,
		output_cost: total_cost / 2.0,
		total_cost,
		finish_reason: Some(crate::strng::literal!("stop")),
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use async_trait::async_trait;
	use chrono::TimeZone;

	use super::*;
	use crate::config::TransportConfig;
	use crate::pricing::{ModelPricing, PricingTier};
	use crate::strng;

	struct MemorySink(tokio::sync::Mutex<Vec<CostRecord>>);

	#[async_trait]
	impl CostSink for MemorySink {
		fn name(&self) -> &'static str {
			"memory"
		}
		async fn write_record(&self, record: &CostRecord) -> anyhow::Result<()> {
			self.0.lock().await.push(record.clone());
			Ok(())
		}
	}

	fn pricing() -> Arc<PriceTable> {
		let mut table = PriceTable::default();
		table.insert(
			strng::literal!("openai"),
			strng::literal!("gpt-4o"),
			&[strng::literal!("gpt-4o-2024-05-13")],
			ModelPricing {
				tiers: vec![PricingTier {
					threshold: 0,
					input: 2.5,
					output: 10.0,
				}],
				overrides: Default::default(),
			},
		);
		Arc::new(table)
	}

	fn meta(input: u64, output: u64) -> ResponseMetadata {
		ResponseMetadata {
			provider: strng::literal!("openai"),
			model: Some(strng::literal!("gpt-4o-2024-05-13")),
			request_id: Some(strng::literal!("chatcmpl-1")),
			input_tokens: input,
			output_tokens: output,
			total_tokens: input + output,
			is_streaming: false,
			finish_reason: Some(strng::literal!("stop")),
		}
	}

	fn ctx() -> RequestContext {
		RequestContext {
			user_id: Some(strng::literal!("u1")),
			ip: "10.0.0.1".to_string(),
			endpoint: "/openai/v1/chat/completions".to_string(),
			requested_model: strng::literal!("gpt-4o"),
		}
	}

	fn sync_config() -> CostTrackingConfig {
		CostTrackingConfig {
			enabled: true,
			transport: TransportConfig::Metrics {},
			mode: TrackerMode::Sync,
			queue_size: 8,
			workers: 1,
			flush_interval: std::time::Duration::from_secs(5),
		}
	}

	#[tokio::test]
	async fn record_costs_add_up() {
		let tracker = CostTracker::new(&sync_config(), pricing(), vec![]);
		let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
		let record = tracker.build_record(&ctx(), &meta(10, 5), now);
		assert_eq!(record.total_tokens, 15);
		let expected_in = (10.0 / 1e6) * 2.5;
		let expected_out = (5.0 / 1e6) * 10.0;
		assert!((record.input_cost - expected_in).abs() < 1e-12);
		assert!((record.output_cost - expected_out).abs() < 1e-12);
		assert!((record.total_cost - (expected_in + expected_out)).abs() < 1e-12);
		assert_eq!(record.model, "gpt-4o");
	}

	#[tokio::test]
	async fn unknown_model_records_zero_cost() {
		let tracker = CostTracker::new(&sync_config(), pricing(), vec![]);
		let mut m = meta(10, 5);
		m.provider = strng::literal!("anthropic");
		let mut c = ctx();
		c.requested_model = strng::literal!("claude-nonexistent-xyz");
		let record = tracker.build_record(&c, &m, Utc::now());
		assert_eq!(record.total_cost, 0.0);
		assert_eq!(record.total_tokens, 15);
	}

	#[tokio::test]
	async fn async_mode_drains_on_shutdown() {
		let sink = Arc::new(MemorySink(tokio::sync::Mutex::new(vec![])));
		let cfg = CostTrackingConfig {
			mode: TrackerMode::Async,
			..sync_config()
		};
		let tracker = CostTracker::new(&cfg, pricing(), vec![sink.clone()]);
		for _ in 0..5 {
			tracker.record_response(&ctx(), &meta(10, 5)).await;
		}
		tracker.shutdown().await;
		assert_eq!(sink.0.lock().await.len(), 5);
	}

	#[tokio::test]
	async fn full_queue_falls_back_inline() {
		let sink = Arc::new(MemorySink(tokio::sync::Mutex::new(vec![])));
		let cfg = CostTrackingConfig {
			mode: TrackerMode::Async,
			queue_size: 1,
			workers: 1,
			..sync_config()
		};
		let tracker = CostTracker::new(&cfg, pricing(), vec![sink.clone()]);
		// Flood faster than the worker can drain; nothing may be lost.
		for _ in 0..20 {
			tracker.record_response(&ctx(), &meta(1, 1)).await;
		}
		tracker.shutdown().await;
		assert_eq!(sink.0.lock().await.len(), 20);
	}

	#[test]
	fn stats_window_rolls() {
		let mut window = StatsWindow::default();
		let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
		let mut record = test_record(10, 5, 0.5);
		record.timestamp = t0;
		window.observe(&record);
		record.timestamp = t0 + chrono::TimeDelta::hours(1);
		window.observe(&record);

		let snap = window.snapshot(t0 + chrono::TimeDelta::hours(1));
		assert_eq!(snap.requests, 2);
		assert!((snap.total_cost - 1.0).abs() < 1e-12);

		// 24 hours later the first bucket has aged out.
		let snap = window.snapshot(t0 + chrono::TimeDelta::hours(24));
		assert_eq!(snap.requests, 1);
	}
}
