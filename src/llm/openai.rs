use serde::Deserialize;

use crate::http::Body;
use crate::llm::ResponseMetadata;
use crate::parse;
use crate::strng;
use crate::strng::Strng;
use crate::telemetry::log::MetadataLog;
use crate::{debug, trace};

pub const NAME: Strng = strng::literal!("openai");
pub const DEFAULT_HOST_STR: &str = "api.openai.com";

/// Buffered chat completion response, reduced to the accounting fields.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
	pub id: Option<String>,
	pub model: Option<String>,
	pub usage: Option<Usage>,
	#[serde(default)]
	pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
	#[serde(default)]
	pub prompt_tokens: u64,
	#[serde(default)]
	pub completion_tokens: u64,
	#[serde(default)]
	pub total_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
	pub finish_reason: Option<String>,
}

/// One `chat.completion.chunk`. A stream is a sequence of these sharing `id`
/// and `model`; `usage` appears at most once, on the final chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChunk {
	pub id: Option<String>,
	pub model: Option<String>,
	pub usage: Option<Usage>,
	#[serde(default)]
	pub choices: Vec<Choice>,
}

pub fn parse_response(bytes: &[u8]) -> Result<ResponseMetadata, serde_json::Error> {
	let resp: Response = serde_json::from_slice(bytes)?;
	let usage = resp.usage.unwrap_or_default();
	Ok(ResponseMetadata {
		provider: NAME,
		model: resp.model.map(strng::new),
		request_id: resp.id.map(strng::new),
		input_tokens: usage.prompt_tokens,
		output_tokens: usage.completion_tokens,
		total_tokens: usage.total_tokens,
		is_streaming: false,
		finish_reason: resp.choices.first().and_then(|c| c.finish_reason.as_deref().map(strng::new)),
	})
}

/// Observe a chunk stream. Identity fields are captured from the first chunk,
/// `finish_reason` from whichever chunk carries a non-null one, and usage from
/// the final chunk when the upstream includes it. Its absence is fine: the
/// caller treats missing totals as zero.
pub fn observe_stream(body: Body, log: MetadataLog) -> Body {
	let mut seen_identity = false;
	parse::sse::json_events::<StreamChunk>(body, move |ev| match ev {
		Some(Ok(chunk)) => {
			if !seen_identity {
				seen_identity = true;
				log.merge(|m| {
					m.model = chunk.model.as_deref().map(strng::new);
					m.request_id = chunk.id.as_deref().map(strng::new);
				});
			}
			let finish = chunk
				.choices
				.first()
				.and_then(|c| c.finish_reason.as_deref().map(strng::new));
			if finish.is_some() || chunk.usage.is_some() {
				log.merge(|m| {
					if let Some(f) = finish {
						m.finish_reason = Some(f);
					}
					if let Some(u) = chunk.usage {
						m.input_tokens = u.prompt_tokens;
						m.output_tokens = u.completion_tokens;
						m.total_tokens = u.total_tokens;
					}
				});
			}
		},
		Some(Err(e)) => {
			debug!("skipping malformed stream event: {e}");
		},
		None => {
			trace!("stream finished");
		},
	})
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;

	use super::*;

	const BUFFERED: &str = r#"{
		"id": "chatcmpl-123",
		"object": "chat.completion",
		"model": "gpt-4o-2024-05-13",
		"choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
		"usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
	}"#;

	#[test]
	fn buffered_usage() {
		let meta = parse_response(BUFFERED.as_bytes()).unwrap();
		assert_eq!(meta.input_tokens, 10);
		assert_eq!(meta.output_tokens, 5);
		assert_eq!(meta.total_tokens, 15);
		assert_eq!(meta.model.as_deref(), Some("gpt-4o-2024-05-13"));
		assert_eq!(meta.request_id.as_deref(), Some("chatcmpl-123"));
		assert_eq!(meta.finish_reason.as_deref(), Some("stop"));
	}

	fn sse_body(events: &[&str]) -> Body {
		let frames: Vec<Result<bytes::Bytes, std::io::Error>> = events
			.iter()
			.map(|e| Ok(bytes::Bytes::from(format!("data: {e}\n\n"))))
			.collect();
		Body::from_stream(futures_util::stream::iter(frames))
	}

	#[tokio::test]
	async fn stream_usage_on_final_chunk() {
		let log: MetadataLog = Default::default();
		log.set(ResponseMetadata {
			provider: NAME,
			is_streaming: true,
			..Default::default()
		});
		let body = sse_body(&[
			r#"{"id":"c1","model":"gpt-4o","choices":[{"delta":{"content":"he"},"finish_reason":null}]}"#,
			r#"{"id":"c1","model":"gpt-4o","choices":[{"delta":{"content":"y"},"finish_reason":"stop"}]}"#,
			r#"{"id":"c1","model":"gpt-4o","choices":[],"usage":{"prompt_tokens":7,"completion_tokens":2,"total_tokens":9}}"#,
			"[DONE]",
		]);
		let body = observe_stream(body, log.clone());
		body.collect().await.unwrap();

		let meta = log.take().unwrap();
		assert_eq!(meta.model.as_deref(), Some("gpt-4o"));
		assert_eq!(meta.request_id.as_deref(), Some("c1"));
		assert_eq!(meta.finish_reason.as_deref(), Some("stop"));
		assert_eq!((meta.input_tokens, meta.output_tokens, meta.total_tokens), (7, 2, 9));
	}

	#[tokio::test]
	async fn stream_without_usage_keeps_zeroes() {
		let log: MetadataLog = Default::default();
		log.set(ResponseMetadata {
			provider: NAME,
			is_streaming: true,
			..Default::default()
		});
		let body = sse_body(&[
			r#"{"id":"c2","model":"gpt-4o","choices":[{"delta":{"content":"x"},"finish_reason":"stop"}]}"#,
			"[DONE]",
		]);
		let body = observe_stream(body, log.clone());
		body.collect().await.unwrap();

		let meta = log.take().unwrap();
		assert_eq!(meta.total_tokens, 0);
		assert_eq!(meta.finish_reason.as_deref(), Some("stop"));
	}
}
