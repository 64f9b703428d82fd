use serde::Deserialize;
use serde_json::Value;

use crate::http::Body;
use crate::llm::ResponseMetadata;
use crate::parse;
use crate::strng;
use crate::strng::Strng;
use crate::telemetry::log::MetadataLog;
use crate::{debug, trace};

pub const NAME: Strng = strng::literal!("anthropic");
pub const DEFAULT_HOST_STR: &str = "api.anthropic.com";

/// Buffered Messages API response, reduced to the accounting fields.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
	pub id: Option<String>,
	pub model: Option<String>,
	pub stop_reason: Option<String>,
	pub usage: Usage,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
	#[serde(default)]
	pub input_tokens: u64,
	#[serde(default)]
	pub output_tokens: u64,
}

/// Streaming events. The stream is typed: `message_start` carries identity
/// and initial usage, `message_delta` carries the running output count and
/// the stop reason, `message_stop` ends it.
/// https://docs.anthropic.com/en/docs/build-with-claude/streaming
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MessagesStreamEvent {
	MessageStart {
		message: MessageStart,
	},
	MessageDelta {
		delta: MessageDelta,
		usage: MessageDeltaUsage,
	},
	MessageStop,
	Ping,
	#[serde(other)]
	Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageStart {
	pub id: Option<String>,
	pub model: Option<String>,
	pub usage: Usage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageDelta {
	pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MessageDeltaUsage {
	#[serde(default)]
	pub output_tokens: u64,
}

pub fn parse_response(bytes: &[u8]) -> Result<ResponseMetadata, serde_json::Error> {
	let resp: MessagesResponse = serde_json::from_slice(bytes)?;
	Ok(ResponseMetadata {
		provider: NAME,
		model: resp.model.map(strng::new),
		request_id: resp.id.map(strng::new),
		input_tokens: resp.usage.input_tokens,
		output_tokens: resp.usage.output_tokens,
		// The response does not carry a total; it is the sum.
		total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
		is_streaming: false,
		finish_reason: resp.stop_reason.map(strng::new),
	})
}

/// Observe a Messages event stream.
///
/// The final output count is `message_start.output_tokens` (added exactly
/// once) plus the latest `message_delta.output_tokens`. Per vendor docs the
/// delta value is already a running total, which would make adding the start
/// value double-count one token; the accounting here intentionally keeps the
/// historical behavior rather than the documented one.
pub fn observe_stream(body: Body, log: MetadataLog) -> Body {
	let mut start_output: u64 = 0;
	parse::sse::json_events::<MessagesStreamEvent>(body, move |ev| match ev {
		Some(Ok(MessagesStreamEvent::MessageStart { message })) => {
			start_output = message.usage.output_tokens;
			log.merge(|m| {
				m.model = message.model.as_deref().map(strng::new);
				m.request_id = message.id.as_deref().map(strng::new);
				m.input_tokens = message.usage.input_tokens;
				m.output_tokens = start_output;
				m.total_tokens = m.input_tokens + m.output_tokens;
			});
		},
		Some(Ok(MessagesStreamEvent::MessageDelta { delta, usage })) => {
			let output = start_output + usage.output_tokens;
			log.merge(|m| {
				m.output_tokens = output;
				m.total_tokens = m.input_tokens + output;
				if let Some(reason) = &delta.stop_reason {
					m.finish_reason = Some(strng::new(reason));
				}
			});
		},
		Some(Ok(MessagesStreamEvent::MessageStop)) => {
			trace!("message_stop");
		},
		Some(Ok(MessagesStreamEvent::Ping | MessagesStreamEvent::Other)) => {},
		Some(Err(e)) => {
			debug!("skipping malformed stream event: {e}");
		},
		None => {},
	})
}

pub fn estimate_tokens(body: &Value) -> Option<u64> {
	let mut chars: u64 = 0;
	if let Some(system) = body.get("system").and_then(Value::as_str) {
		chars += system.len() as u64;
	}
	for msg in body.get("messages")?.as_array()? {
		match msg.get("content") {
			Some(Value::String(s)) => chars += s.len() as u64,
			Some(Value::Array(parts)) => {
				for p in parts {
					if let Some(t) = p.get("text").and_then(Value::as_str) {
						chars += t.len() as u64;
					}
				}
			},
			_ => {},
		}
	}
	Some(chars / 4)
}
