use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use tokio::io::AsyncWriteExt;

use super::CostRecord;
use crate::config::TransportConfig;

/// A destination for cost records. Sinks are looked up by type string and
/// only need to know how to write one record.
#[async_trait]
pub trait CostSink: Send + Sync {
	fn name(&self) -> &'static str;
	async fn write_record(&self, record: &CostRecord) -> anyhow::Result<()>;
	async fn flush(&self) -> anyhow::Result<()> {
		Ok(())
	}
}

/// Writes records to a remote table. The table client itself (session setup,
/// retries, marshalling) lives outside this crate; anything that can put a
/// record is usable.
#[async_trait]
pub trait TableWriter: Send + Sync {
	async fn put_record(&self, table: &str, record: &CostRecord) -> anyhow::Result<()>;
}

type SinkFactory = Box<dyn Fn(&TransportConfig) -> anyhow::Result<Arc<dyn CostSink>> + Send + Sync>;

/// Factory registry keyed by transport type string.
pub struct SinkRegistry {
	factories: HashMap<&'static str, SinkFactory>,
}

impl SinkRegistry {
	/// Registry with the built-in `file` and `metrics` transports. The
	/// `table` transport needs a [`TableWriter`] injected first.
	pub fn with_defaults() -> Self {
		let mut registry = SinkRegistry {
			factories: HashMap::new(),
		};
		registry.register("file", |t| {
			let TransportConfig::File { path } = t else {
				anyhow::bail!("file sink requires a path");
			};
			Ok(Arc::new(FileSink::create(path)?) as Arc<dyn CostSink>)
		});
		registry.register("metrics", |t| {
			let TransportConfig::Metrics {} = t else {
				anyhow::bail!("metrics sink takes no options");
			};
			Ok(Arc::new(MetricsSink::new()) as Arc<dyn CostSink>)
		});
		registry.register("table", |_| {
			anyhow::bail!("table transport requires an external writer; register one first")
		});
		registry
	}

	pub fn register(
		&mut self,
		name: &'static str,
		factory: impl Fn(&TransportConfig) -> anyhow::Result<Arc<dyn CostSink>> + Send + Sync + 'static,
	) {
		self.factories.insert(name, Box::new(factory));
	}

	pub fn register_table_writer(&mut self, writer: Arc<dyn TableWriter>) {
		self.register("table", move |t| {
			let TransportConfig::Table { table } = t else {
				anyhow::bail!("table sink requires a table name");
			};
			Ok(Arc::new(TableSink {
				table: table.clone(),
				writer: writer.clone(),
			}) as Arc<dyn CostSink>)
		});
	}

	pub fn build(&self, transport: &TransportConfig) -> anyhow::Result<Arc<dyn CostSink>> {
		let name = match transport {
			TransportConfig::File { .. } => "file",
			TransportConfig::Table { .. } => "table",
			TransportConfig::Metrics {} => "metrics",
		};
		let factory = self
			.factories
			.get(name)
			.ok_or_else(|| anyhow::anyhow!("unknown cost transport: {name}"))?;
		factory(transport)
	}
}

/// Appends newline-delimited JSON. The mutex orders writers within the
/// process; O_APPEND keeps concurrent processes from interleaving lines.
pub struct FileSink {
	path: PathBuf,
	file: tokio::sync::Mutex<tokio::fs::File>,
}

impl FileSink {
	pub fn create(path: &Path) -> anyhow::Result<Self> {
		if let Some(dir) = path.parent()
			&& !dir.as_os_str().is_empty()
		{
			std::fs::create_dir_all(dir)?;
		}
		let file = std::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(path)?;
		Ok(FileSink {
			path: path.to_path_buf(),
			file: tokio::sync::Mutex::new(tokio::fs::File::from_std(file)),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

#[async_trait]
impl CostSink for FileSink {
	fn name(&self) -> &'static str {
		"file"
	}

	async fn write_record(&self, record: &CostRecord) -> anyhow::Result<()> {
		let mut line = serde_json::to_vec(record)?;
		line.push(b'\n');
		let mut file = self.file.lock().await;
		file.write_all(&line).await?;
		Ok(())
	}

	async fn flush(&self) -> anyhow::Result<()> {
		let mut file = self.file.lock().await;
		file.flush().await?;
		Ok(())
	}
}

pub struct TableSink {
	table: String,
	writer: Arc<dyn TableWriter>,
}

#[async_trait]
impl CostSink for TableSink {
	fn name(&self) -> &'static str {
		"table"
	}

	async fn write_record(&self, record: &CostRecord) -> anyhow::Result<()> {
		self.writer.put_record(&self.table, record).await
	}
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ModelLabels {
	provider: String,
	model: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TokenLabels {
	provider: String,
	model: String,
	direction: String,
}

/// Emits cost records as Prometheus counters.
pub struct MetricsSink {
	registry: Registry,
	requests: Family<ModelLabels, Counter>,
	tokens: Family<TokenLabels, Counter>,
	cost: Family<ModelLabels, Counter<f64, std::sync::atomic::AtomicU64>>,
}

impl MetricsSink {
	pub fn new() -> Self {
		let mut registry = Registry::default();
		let requests = Family::<ModelLabels, Counter>::default();
		registry.register(
			"llmproxy_requests",
			"Completed requests by provider and model",
			requests.clone(),
		);
		let tokens = Family::<TokenLabels, Counter>::default();
		registry.register(
			"llmproxy_tokens",
			"Token usage by provider, model and direction",
			tokens.clone(),
		);
		let cost = Family::<ModelLabels, Counter<f64, std::sync::atomic::AtomicU64>>::default();
		registry.register(
			"llmproxy_cost_usd",
			"Accumulated cost in USD by provider and model",
			cost.clone(),
		);
		MetricsSink {
			registry,
			requests,
			tokens,
			cost,
		}
	}

	pub fn encode(&self) -> String {
		let mut out = String::new();
		let _ = prometheus_client::encoding::text::encode(&mut out, &self.registry);
		out
	}
}

impl Default for MetricsSink {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl CostSink for MetricsSink {
	fn name(&self) -> &'static str {
		"metrics"
	}

	async fn write_record(&self, record: &CostRecord) -> anyhow::Result<()> {
		let labels = ModelLabels {
			provider: record.provider.to_string(),
			model: record.model.to_string(),
		};
		self.requests.get_or_create(&labels).inc();
		self
			.tokens
			.get_or_create(&TokenLabels {
				provider: labels.provider.clone(),
				model: labels.model.clone(),
				direction: "input".to_string(),
			})
			.inc_by(record.input_tokens);
		self
			.tokens
			.get_or_create(&TokenLabels {
				provider: labels.provider.clone(),
				model: labels.model.clone(),
				direction: "output".to_string(),
			})
			.inc_by(record.output_tokens);
		self.cost.get_or_create(&labels).inc_by(record.total_cost);
		Ok(())
	}
}
