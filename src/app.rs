use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::routing::get;

use crate::config::{Config, RateLimitBackendKind, TransportConfig};
use crate::cost::CostTracker;
use crate::cost::sink::{CostSink, MetricsSink, SinkRegistry};
use crate::llm::AIProvider;
use crate::proxy;
use crate::proxy::upstream::UpstreamClient;
use crate::ratelimit::{RateLimitStore, RateLimiter};
use crate::{info, warn};

/// Process-wide singletons, constructed once at startup and immutable
/// thereafter. Handlers receive this explicitly as axum state.
pub struct App {
	pub cfg: Arc<Config>,
	pub limiter: Arc<RateLimiter>,
	pub cost: Option<Arc<CostTracker>>,
	pub metrics: Option<Arc<MetricsSink>>,
	pub upstream: UpstreamClient,
}

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

impl App {
	pub async fn build(cfg: Arc<Config>, sink_registry: &SinkRegistry) -> anyhow::Result<Arc<App>> {
		let store: Arc<dyn RateLimitStore> = match cfg.rate_limiting.backend {
			RateLimitBackendKind::Memory => {
				let store = Arc::new(crate::ratelimit::memory::MemoryStore::new());
				store.spawn_reaper(REAPER_INTERVAL);
				store
			},
			RateLimitBackendKind::Distributed => {
				let url = cfg
					.rate_limiting
					.redis_url
					.as_deref()
					.context("distributed rate limiting requires redis_url")?;
				Arc::new(crate::ratelimit::distributed::DistributedStore::connect(url).await?)
			},
		};
		let limiter = Arc::new(RateLimiter::new(&cfg, store));

		let mut metrics = None;
		let cost = if cfg.cost_tracking.enabled {
			let sink: Arc<dyn CostSink> = match &cfg.cost_tracking.transport {
				// The metrics emitter is kept by the app too, so /metrics can
				// serve its registry.
				TransportConfig::Metrics {} => {
					let sink = Arc::new(MetricsSink::new());
					metrics = Some(sink.clone());
					sink
				},
				other => sink_registry.build(other)?,
			};
			let pricing = Arc::new(cfg.price_table());
			Some(CostTracker::new(&cfg.cost_tracking, pricing, vec![sink]))
		} else {
			None
		};

		let upstream = UpstreamClient::new(&cfg.upstream)?;
		Ok(Arc::new(App {
			cfg,
			limiter,
			cost,
			metrics,
			upstream,
		}))
	}

	/// `scheme://authority` for a vendor, honoring any configured override.
	pub fn upstream_base(&self, provider: AIProvider) -> String {
		self
			.cfg
			.providers
			.get(&provider.name())
			.and_then(|p| p.upstream.clone())
			.map(|u| u.trim_end_matches('/').to_string())
			.unwrap_or_else(|| format!("https://{}", provider.default_authority()))
	}

	pub fn router(self: &Arc<Self>) -> Router {
		Router::new()
			.route("/health", get(proxy::health))
			.route("/metrics", get(proxy::metrics))
			.fallback(proxy::handler)
			.with_state(self.clone())
	}

	pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
		let addr = SocketAddr::from(([0, 0, 0, 0], self.cfg.port));
		let listener = tokio::net::TcpListener::bind(addr).await?;
		info!("listening on {}", listener.local_addr()?);

		let router = self.router();
		axum::serve(
			listener,
			router.into_make_service_with_connect_info::<SocketAddr>(),
		)
		.with_graceful_shutdown(shutdown_signal())
		.await?;

		// Drain the cost queue before exiting.
		if let Some(cost) = &self.cost {
			cost.shutdown().await;
		}
		info!("shutdown complete");
		Ok(())
	}
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!("failed to listen for ctrl-c: {e}");
		}
	};
	#[cfg(unix)]
	{
		let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("install SIGTERM handler");
		tokio::select! {
			_ = ctrl_c => {},
			_ = term.recv() => {},
		}
	}
	#[cfg(not(unix))]
	ctrl_c.await;
	info!("shutdown signal received, draining");
}
