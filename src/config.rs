use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::Value;

use crate::pricing::{ModelPricing, PriceRate, PriceTable, PricingTier};
use crate::serdes::{self, de_u64_separators, de_u64_separators_option};
use crate::strng;
use crate::strng::Strng;

/// Fully validated process configuration. Built once at startup, immutable
/// for the process lifetime.
#[derive(Debug)]
pub struct Config {
	pub enabled: bool,
	pub port: u16,
	pub upstream: UpstreamConfig,
	pub cost_tracking: CostTrackingConfig,
	pub rate_limiting: RateLimitingConfig,
	pub key_substitution: KeySubstitutionConfig,
	pub providers: HashMap<Strng, ProviderConfig>,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
	pub connect_timeout: Duration,
	pub first_byte_timeout: Duration,
	pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CostTrackingConfig {
	pub enabled: bool,
	pub transport: TransportConfig,
	pub mode: TrackerMode,
	pub queue_size: usize,
	pub workers: usize,
	pub flush_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerMode {
	Sync,
	Async,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
	File { path: PathBuf },
	Table { table: String },
	Metrics {},
}

#[derive(Debug, Clone)]
pub struct RateLimitingConfig {
	pub enabled: bool,
	pub backend: RateLimitBackendKind,
	pub redis_url: Option<String>,
	pub limits: Limits,
	pub overrides: LimitOverrides,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitBackendKind {
	Memory,
	Distributed,
}

/// Zero means unlimited for that metric/window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
	#[serde(default, deserialize_with = "de_u64_separators")]
	pub requests_per_minute: u64,
	#[serde(default, deserialize_with = "de_u64_separators")]
	pub tokens_per_minute: u64,
	#[serde(default, deserialize_with = "de_u64_separators")]
	pub requests_per_day: u64,
	#[serde(default, deserialize_with = "de_u64_separators")]
	pub tokens_per_day: u64,
}

/// An override masks only the fields it sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsMask {
	#[serde(default, deserialize_with = "de_u64_separators_option")]
	pub requests_per_minute: Option<u64>,
	#[serde(default, deserialize_with = "de_u64_separators_option")]
	pub tokens_per_minute: Option<u64>,
	#[serde(default, deserialize_with = "de_u64_separators_option")]
	pub requests_per_day: Option<u64>,
	#[serde(default, deserialize_with = "de_u64_separators_option")]
	pub tokens_per_day: Option<u64>,
}

impl LimitsMask {
	pub fn apply(&self, base: Limits) -> Limits {
		Limits {
			requests_per_minute: self.requests_per_minute.unwrap_or(base.requests_per_minute),
			tokens_per_minute: self.tokens_per_minute.unwrap_or(base.tokens_per_minute),
			requests_per_day: self.requests_per_day.unwrap_or(base.requests_per_day),
			tokens_per_day: self.tokens_per_day.unwrap_or(base.tokens_per_day),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitOverrides {
	#[serde(default)]
	pub per_model: HashMap<String, LimitsMask>,
	#[serde(default)]
	pub per_key: HashMap<String, LimitsMask>,
	#[serde(default)]
	pub per_user: HashMap<String, LimitsMask>,
}

#[derive(Debug, Clone)]
pub struct KeySubstitutionConfig {
	pub enabled: bool,
	pub prefix: String,
	pub keys: HashMap<String, SecretString>,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
	pub enabled: bool,
	/// Scheme+authority override for the vendor endpoint, mainly for tests
	/// and self-hosted gateways.
	pub upstream: Option<String>,
	pub models: HashMap<Strng, ModelConfig>,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
	pub enabled: bool,
	pub aliases: Vec<Strng>,
	pub pricing: Option<ModelPricing>,
}

// Raw YAML shapes. Decoded through the JSON transcode so config errors carry
// a field path.

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
	#[serde(default = "default_true")]
	enabled: bool,
	#[serde(default)]
	server: RawServer,
	#[serde(default)]
	features: RawFeatures,
	#[serde(default)]
	providers: HashMap<String, RawProvider>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServer {
	port: Option<u16>,
	connect_timeout_secs: Option<u64>,
	first_byte_timeout_secs: Option<u64>,
	idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFeatures {
	#[serde(default)]
	cost_tracking: Option<RawCostTracking>,
	#[serde(default)]
	rate_limiting: Option<RawRateLimiting>,
	#[serde(default)]
	key_substitution: Option<RawKeySubstitution>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCostTracking {
	#[serde(default = "default_true")]
	enabled: bool,
	transport: Option<TransportConfig>,
	mode: Option<TrackerMode>,
	queue_size: Option<usize>,
	workers: Option<usize>,
	flush_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRateLimiting {
	#[serde(default = "default_true")]
	enabled: bool,
	backend: Option<RateLimitBackendKind>,
	redis_url: Option<String>,
	#[serde(default)]
	limits: Limits,
	#[serde(default)]
	overrides: LimitOverrides,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawKeySubstitution {
	#[serde(default = "default_true")]
	enabled: bool,
	#[serde(default = "default_key_prefix")]
	prefix: String,
	#[serde(default)]
	keys: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProvider {
	#[serde(default = "default_true")]
	enabled: bool,
	upstream: Option<String>,
	#[serde(default)]
	models: HashMap<String, RawModel>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModel {
	#[serde(default = "default_true")]
	enabled: bool,
	#[serde(default)]
	aliases: Vec<String>,
	pricing: Option<PricingSpec>,
}

/// Pricing is polymorphic: either a single `{input, output, overrides?}`
/// rate or a list of `{threshold, input, output}` tiers. Anything else is
/// rejected at decode time.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PricingSpec {
	Tiered(Vec<PricingTier>),
	Single {
		input: f64,
		output: f64,
		#[serde(default)]
		overrides: HashMap<String, PriceRate>,
	},
}

fn default_true() -> bool {
	true
}

fn default_key_prefix() -> String {
	"iw:".to_string()
}

const KNOWN_PROVIDERS: &[&str] = &["openai", "anthropic", "gemini"];

/// Overlay `overlay` onto `base`: maps merge recursively, everything else is
/// replaced. `merge(base, {})` is `base`, and merging the same overlay twice
/// equals merging it once.
pub fn deep_merge(base: &mut Value, overlay: Value) {
	match (base, overlay) {
		(Value::Object(base_map), Value::Object(overlay_map)) => {
			for (k, v) in overlay_map {
				match base_map.get_mut(&k) {
					Some(slot) => deep_merge(slot, v),
					None => {
						base_map.insert(k, v);
					},
				}
			}
		},
		(slot, v) => *slot = v,
	}
}

/// Load configuration from a directory holding `base.yml`, with the
/// `ENVIRONMENT` variable selecting an `<env>.yml` overlay.
pub fn load_dir(dir: &Path) -> anyhow::Result<Config> {
	let base_path = dir.join("base.yml");
	let contents = std::fs::read_to_string(&base_path)
		.with_context(|| format!("read {}", base_path.display()))?;
	let mut value = serdes::yamlviajson::to_value(&contents)
		.with_context(|| format!("parse {}", base_path.display()))?;

	if let Ok(environment) = env::var("ENVIRONMENT") {
		let overlay_path = dir.join(format!("{environment}.yml"));
		if overlay_path.exists() {
			let contents = std::fs::read_to_string(&overlay_path)
				.with_context(|| format!("read {}", overlay_path.display()))?;
			let overlay = serdes::yamlviajson::to_value(&contents)
				.with_context(|| format!("parse {}", overlay_path.display()))?;
			deep_merge(&mut value, overlay);
		}
	}
	from_value(value)
}

pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	let value = serdes::yamlviajson::to_value(contents)?;
	from_value(value)
}

fn from_value(value: Value) -> anyhow::Result<Config> {
	let raw: RawConfig = serde_path_to_error::deserialize(value)?;
	validate(raw)
}

fn validate(raw: RawConfig) -> anyhow::Result<Config> {
	let port = parse_env::<u16>("PORT")?
		.or(raw.server.port)
		.unwrap_or(8080);

	let mut providers = HashMap::new();
	for (name, p) in raw.providers {
		if !KNOWN_PROVIDERS.contains(&name.as_str()) {
			anyhow::bail!(
				"unknown provider {name:?}; supported: {}",
				KNOWN_PROVIDERS.join(", ")
			);
		}
		let mut models = HashMap::new();
		for (model_name, m) in p.models {
			let pricing = m
				.pricing
				.map(|spec| build_pricing(&name, &model_name, spec))
				.transpose()?;
			models.insert(
				strng::new(&model_name),
				ModelConfig {
					enabled: m.enabled,
					aliases: m.aliases.iter().map(strng::new).collect(),
					pricing,
				},
			);
		}
		providers.insert(
			strng::new(&name),
			ProviderConfig {
				enabled: p.enabled,
				upstream: p.upstream,
				models,
			},
		);
	}

	let rl = raw.features.rate_limiting;
	let rate_limiting = match rl {
		Some(rl) => {
			let backend = rl.backend.unwrap_or(RateLimitBackendKind::Memory);
			if rl.enabled && backend == RateLimitBackendKind::Distributed && rl.redis_url.is_none() {
				anyhow::bail!("rate_limiting.backend is \"distributed\" but redis_url is not set");
			}
			RateLimitingConfig {
				enabled: rl.enabled,
				backend,
				redis_url: rl.redis_url,
				limits: rl.limits,
				overrides: rl.overrides,
			}
		},
		None => RateLimitingConfig {
			enabled: false,
			backend: RateLimitBackendKind::Memory,
			redis_url: None,
			limits: Limits::default(),
			overrides: LimitOverrides::default(),
		},
	};

	let ct = raw.features.cost_tracking;
	let cost_tracking = match ct {
		Some(ct) => {
			if ct.enabled && ct.transport.is_none() {
				anyhow::bail!("cost_tracking is enabled but no transport is configured");
			}
			CostTrackingConfig {
				enabled: ct.enabled,
				transport: ct.transport.unwrap_or(TransportConfig::Metrics {}),
				mode: ct.mode.unwrap_or(TrackerMode::Async),
				queue_size: ct.queue_size.unwrap_or(1024),
				workers: ct.workers.unwrap_or(2).max(1),
				flush_interval: Duration::from_secs(ct.flush_interval_secs.unwrap_or(5)),
			}
		},
		None => CostTrackingConfig {
			enabled: false,
			transport: TransportConfig::Metrics {},
			mode: TrackerMode::Sync,
			queue_size: 0,
			workers: 0,
			flush_interval: Duration::from_secs(5),
		},
	};

	let key_substitution = match raw.features.key_substitution {
		Some(ks) => KeySubstitutionConfig {
			enabled: ks.enabled,
			prefix: ks.prefix,
			keys: ks
				.keys
				.into_iter()
				.map(|(k, v)| (k, SecretString::from(v)))
				.collect(),
		},
		None => KeySubstitutionConfig {
			enabled: false,
			prefix: default_key_prefix(),
			keys: HashMap::new(),
		},
	};

	Ok(Config {
		enabled: raw.enabled,
		port,
		upstream: UpstreamConfig {
			connect_timeout: Duration::from_secs(raw.server.connect_timeout_secs.unwrap_or(10)),
			first_byte_timeout: Duration::from_secs(raw.server.first_byte_timeout_secs.unwrap_or(60)),
			idle_timeout: Duration::from_secs(raw.server.idle_timeout_secs.unwrap_or(300)),
		},
		cost_tracking,
		rate_limiting,
		key_substitution,
		providers,
	})
}

fn build_pricing(provider: &str, model: &str, spec: PricingSpec) -> anyhow::Result<ModelPricing> {
	let pricing = match spec {
		PricingSpec::Tiered(tiers) => {
			if tiers.is_empty() {
				anyhow::bail!("providers.{provider}.models.{model}.pricing: tier list is empty");
			}
			ModelPricing {
				tiers,
				overrides: HashMap::new(),
			}
		},
		PricingSpec::Single {
			input,
			output,
			overrides,
		} => ModelPricing {
			tiers: vec![PricingTier {
				threshold: 0,
				input,
				output,
			}],
			overrides: overrides
				.into_iter()
				.map(|(k, v)| (strng::new(&k), v))
				.collect(),
		},
	};
	Ok(pricing)
}

impl Config {
	pub fn price_table(&self) -> PriceTable {
		let mut table = PriceTable::default();
		for (provider, p) in &self.providers {
			if !p.enabled {
				continue;
			}
			for (model, m) in &p.models {
				if !m.enabled {
					continue;
				}
				if let Some(pricing) = &m.pricing {
					table.insert(provider.clone(), model.clone(), &m.aliases, pricing.clone());
				}
			}
		}
		table
	}

	/// alias -> canonical, across all enabled providers of the given name.
	pub fn model_aliases(&self, provider: &Strng) -> HashMap<Strng, Strng> {
		let mut out = HashMap::new();
		if let Some(p) = self.providers.get(provider) {
			for (model, m) in &p.models {
				for alias in &m.aliases {
					out.insert(alias.clone(), model.clone());
				}
			}
		}
		out
	}
}

fn parse_env<T: FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(name) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", name, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}
