use std::env;

use tracing_subscriber::EnvFilter;

pub mod log;

/// Install the global tracing subscriber. `LOG_LEVEL` seeds the default filter
/// (RUST_LOG still wins when set); `LOG_FORMAT=json` selects JSON output.
pub fn setup_logging() {
	let level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper=warn,reqwest=warn")));
	let json = env::var("LOG_FORMAT")
		.map(|f| f.eq_ignore_ascii_case("json"))
		.unwrap_or(false);

	let builder = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false);
	if json {
		builder.json().flatten_event(true).init();
	} else {
		builder.init();
	}
}
