use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use llm_proxy::cost::sink::SinkRegistry;
use llm_proxy::{app, config, llm, telemetry};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Multi-tenant reverse proxy for hosted LLM vendor APIs", long_about = None)]
struct Args {
	/// Use config from bytes
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from a single file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Directory with base.yml plus optional ENVIRONMENT overlays
	#[arg(long, value_name = "dir", default_value = "./config")]
	config_dir: PathBuf,

	/// Parse and validate the configuration, then exit
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();
	let args = Args::parse();

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("build runtime")
		.block_on(async move {
			let cfg = match (&args.config, &args.file) {
				(Some(_), Some(_)) => anyhow::bail!("only one of --config or --file"),
				(Some(contents), None) => config::parse_config(contents)?,
				(None, Some(file)) => {
					let contents = std::fs::read_to_string(file)?;
					config::parse_config(&contents)?
				},
				(None, None) => config::load_dir(&args.config_dir)?,
			};
			if args.validate_only {
				println!(
					"configuration ok: {} providers, rate_limiting={}, cost_tracking={}",
					cfg.providers.len(),
					cfg.rate_limiting.enabled,
					cfg.cost_tracking.enabled
				);
				return Ok(());
			}
			if !cfg.enabled {
				info!("proxy is disabled by configuration, exiting");
				return Ok(());
			}

			// Tokenizer singletons take ~200ms to build; do it off the
			// request path.
			tokio::task::spawn_blocking(llm::preload_tokenizers);

			let registry = SinkRegistry::with_defaults();
			let app = app::App::build(Arc::new(cfg), &registry).await?;
			app.run().await
		})
}
