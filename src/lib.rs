pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use bytes::Bytes;
pub use tracing::{debug, error, info, trace, warn};

pub mod app;
pub mod config;
pub mod cost;
pub mod http;
pub mod llm;
pub mod parse;
pub mod pricing;
pub mod proxy;
pub mod ratelimit;
pub mod serdes;
pub mod strng;
pub mod telemetry;

pub use strng::Strng;
