use bytes::Bytes;
use serde_json::Value;
use tiktoken_rs::CoreBPE;
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};

use crate::http::{Body, HeaderName};
use crate::strng;
use crate::strng::Strng;
use crate::telemetry::log::MetadataLog;

pub mod anthropic;
pub mod gemini;
pub mod openai;

/// Normalized response metadata, filled in by the vendor adapter.
/// For streams it is populated incrementally behind a [`MetadataLog`]; the
/// final values are read once the stream completes.
#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata {
	pub provider: Strng,
	pub model: Option<Strng>,
	pub request_id: Option<Strng>,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub total_tokens: u64,
	pub is_streaming: bool,
	pub finish_reason: Option<Strng>,
}

/// The vendors this proxy fronts. Each is a closed variant: URL shape,
/// credential header, streaming framing and usage schema are all per-vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AIProvider {
	OpenAI,
	Anthropic,
	Gemini,
}

pub const ALL_PROVIDERS: &[AIProvider] = &[AIProvider::OpenAI, AIProvider::Anthropic, AIProvider::Gemini];

#[derive(thiserror::Error, Debug)]
pub enum AIError {
	#[error("failed to parse response: {0}")]
	ResponseParsing(#[from] serde_json::Error),
	#[error("failed to decompress response: {0}")]
	Decompress(anyhow::Error),
	#[error("response was missing usage fields")]
	IncompleteResponse,
}

impl AIProvider {
	pub fn from_prefix(seg: &str) -> Option<AIProvider> {
		match seg {
			"openai" => Some(AIProvider::OpenAI),
			"anthropic" => Some(AIProvider::Anthropic),
			"gemini" => Some(AIProvider::Gemini),
			_ => None,
		}
	}

	pub fn name(&self) -> Strng {
		match self {
			AIProvider::OpenAI => openai::NAME,
			AIProvider::Anthropic => anthropic::NAME,
			AIProvider::Gemini => gemini::NAME,
		}
	}

	/// First path segment claimed by this vendor on the proxy's surface.
	pub fn path_prefix(&self) -> &'static str {
		match self {
			AIProvider::OpenAI => "openai",
			AIProvider::Anthropic => "anthropic",
			AIProvider::Gemini => "gemini",
		}
	}

	pub fn default_authority(&self) -> &'static str {
		match self {
			AIProvider::OpenAI => openai::DEFAULT_HOST_STR,
			AIProvider::Anthropic => anthropic::DEFAULT_HOST_STR,
			AIProvider::Gemini => gemini::DEFAULT_HOST_STR,
		}
	}

	/// Headers that may carry a client credential eligible for substitution.
	pub fn credential_headers(&self) -> &'static [HeaderName] {
		static OPENAI: std::sync::LazyLock<Vec<HeaderName>> =
			std::sync::LazyLock::new(|| vec![HeaderName::from_static("authorization")]);
		static ANTHROPIC: std::sync::LazyLock<Vec<HeaderName>> = std::sync::LazyLock::new(|| {
			vec![
				HeaderName::from_static("x-api-key"),
				HeaderName::from_static("authorization"),
			]
		});
		static GEMINI: std::sync::LazyLock<Vec<HeaderName>> =
			std::sync::LazyLock::new(|| vec![HeaderName::from_static("x-goog-api-key")]);
		match self {
			AIProvider::OpenAI => &OPENAI,
			AIProvider::Anthropic => &ANTHROPIC,
			AIProvider::Gemini => &GEMINI,
		}
	}

	/// Whether the request asks for a streamed response. OpenAI and Anthropic
	/// signal it in the JSON body; Gemini in the URL.
	pub fn is_streaming_request(&self, path: &str, body: Option<&Value>) -> bool {
		match self {
			AIProvider::OpenAI | AIProvider::Anthropic => body
				.and_then(|b| b.get("stream"))
				.and_then(Value::as_bool)
				.unwrap_or(false),
			AIProvider::Gemini => gemini::is_streaming_path(path),
		}
	}

	/// The model the caller asked for, before canonical-name resolution.
	pub fn request_model(&self, path: &str, body: Option<&Value>) -> Option<Strng> {
		match self {
			AIProvider::OpenAI | AIProvider::Anthropic => body
				.and_then(|b| b.get("model"))
				.and_then(Value::as_str)
				.map(strng::new),
			AIProvider::Gemini => gemini::model_from_path(path),
		}
	}

	/// Best-effort pre-dispatch token estimate, used only for sizing the
	/// rate-limit reservation. Never fails: unparseable bodies fall back to a
	/// bytes/4 heuristic.
	pub fn estimate_tokens(&self, body_bytes: &[u8], body: Option<&Value>) -> u64 {
		let fallback = (body_bytes.len() as u64) / 4;
		let Some(body) = body else {
			return fallback;
		};
		match self {
			AIProvider::OpenAI => {
				let model = body.get("model").and_then(Value::as_str).unwrap_or_default();
				match openai_chat_texts(body) {
					Some(texts) => num_tokens_from_messages(model, &texts),
					None => fallback,
				}
			},
			AIProvider::Anthropic => anthropic::estimate_tokens(body).unwrap_or(fallback),
			AIProvider::Gemini => gemini::estimate_tokens(body).unwrap_or(fallback),
		}
	}

	/// Parse a buffered (non-streaming) response body. The body may be
	/// gzip-compressed regardless of headers; the magic bytes decide.
	pub async fn parse_buffered_response(&self, bytes: &Bytes) -> Result<ResponseMetadata, AIError> {
		let decoded = crate::http::compression::decode_if_gzip(bytes, MAX_BODY_SIZE)
			.await
			.map_err(AIError::Decompress)?;
		let mut meta = match self {
			AIProvider::OpenAI => openai::parse_response(&decoded)?,
			AIProvider::Anthropic => anthropic::parse_response(&decoded)?,
			AIProvider::Gemini => gemini::parse_response(&decoded)?,
		};
		meta.provider = self.name();
		meta.is_streaming = false;
		Ok(meta)
	}

	/// Tee the streamed response through this vendor's event parser. Bytes
	/// flow to the client unchanged; `log` accumulates metadata as events are
	/// decoded. `log` must already hold the initial [`ResponseMetadata`].
	pub fn observe_streaming(
		&self,
		body: Body,
		log: MetadataLog,
		request_path: &str,
	) -> Body {
		match self {
			AIProvider::OpenAI => openai::observe_stream(body, log),
			AIProvider::Anthropic => anthropic::observe_stream(body, log),
			AIProvider::Gemini => gemini::observe_stream(body, log, request_path),
		}
	}
}

/// Request/response bodies are buffered up to this size for inspection.
pub const MAX_BODY_SIZE: usize = 2_097_152;

fn openai_chat_texts(body: &Value) -> Option<Vec<(String, String)>> {
	let messages = body.get("messages")?.as_array()?;
	let mut out = Vec::with_capacity(messages.len());
	for msg in messages {
		let role = msg.get("role").and_then(Value::as_str).unwrap_or_default();
		// Content is either a plain string or a list of typed parts.
		let text = match msg.get("content") {
			Some(Value::String(s)) => s.clone(),
			Some(Value::Array(parts)) => parts
				.iter()
				.filter_map(|p| p.get("text").and_then(Value::as_str))
				.collect::<Vec<_>>()
				.join(""),
			_ => String::new(),
		};
		out.push((role.to_string(), text));
	}
	Some(out)
}

fn num_tokens_from_messages(model: &str, messages: &[(String, String)]) -> u64 {
	let tokenizer = get_tokenizer(model).unwrap_or(Tokenizer::Cl100kBase);
	let bpe = get_bpe_from_tokenizer(tokenizer);

	let tokens_per_message = 3;
	let mut num_tokens: u64 = 0;
	for (_role, text) in messages {
		num_tokens += tokens_per_message;
		// Role is always 1 token
		num_tokens += 1;
		num_tokens += bpe.encode_with_special_tokens(text).len() as u64;
	}
	num_tokens += 3; // every reply is primed with <|start|>assistant<|message|>
	num_tokens
}

/// Tokenizers take about 200ms to load and are lazy loaded. This loads them on
/// demand, outside the request path.
pub fn preload_tokenizers() {
	let _ = tiktoken_rs::cl100k_base_singleton();
	let _ = tiktoken_rs::o200k_base_singleton();
}

fn get_bpe_from_tokenizer<'a>(tokenizer: Tokenizer) -> &'a CoreBPE {
	match tokenizer {
		Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
		_ => tiktoken_rs::cl100k_base_singleton(),
	}
}

#[cfg(test)]
mod tests;
