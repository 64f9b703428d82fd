use serde::Deserialize;
use serde_json::Value;

use crate::http::Body;
use crate::llm::ResponseMetadata;
use crate::parse;
use crate::parse::json_array::JsonArrayDecoder;
use crate::strng;
use crate::strng::Strng;
use crate::telemetry::log::MetadataLog;
use crate::{debug, llm};

pub const NAME: Strng = strng::literal!("gemini");
pub const DEFAULT_HOST_STR: &str = "generativelanguage.googleapis.com";

const STREAM_SUFFIX: &str = ":streamGenerateContent";

/// A generateContent response, or one chunk of a streamed one; both use the
/// same shape, with `usageMetadata` only on the final chunk of a stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
	pub model_version: Option<String>,
	pub response_id: Option<String>,
	pub usage_metadata: Option<UsageMetadata>,
	#[serde(default)]
	pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
	#[serde(default)]
	pub prompt_token_count: u64,
	#[serde(default)]
	pub candidates_token_count: u64,
	#[serde(default)]
	pub total_token_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
	pub finish_reason: Option<String>,
}

/// Streaming is signalled in the URL, not the body.
pub fn is_streaming_path(path: &str) -> bool {
	match path.rsplit('/').next() {
		Some(last) => last.contains(STREAM_SUFFIX),
		None => false,
	}
}

/// `/v1beta/models/gemini-2.5-pro:generateContent` -> `gemini-2.5-pro`
pub fn model_from_path(path: &str) -> Option<Strng> {
	let rest = path.split("models/").nth(1)?;
	let model = rest.split([':', '/', '?']).next()?;
	if model.is_empty() {
		None
	} else {
		Some(strng::new(model))
	}
}

pub fn parse_response(bytes: &[u8]) -> Result<ResponseMetadata, serde_json::Error> {
	let resp: GenerateResponse = serde_json::from_slice(bytes)?;
	Ok(metadata_from(resp))
}

fn metadata_from(resp: GenerateResponse) -> ResponseMetadata {
	let usage = resp.usage_metadata.unwrap_or_default();
	ResponseMetadata {
		provider: NAME,
		model: resp.model_version.map(strng::new),
		request_id: resp.response_id.map(strng::new),
		input_tokens: usage.prompt_token_count,
		output_tokens: usage.candidates_token_count,
		total_tokens: usage.total_token_count,
		is_streaming: false,
		finish_reason: resp
			.candidates
			.first()
			.and_then(|c| c.finish_reason.as_deref().map(strng::new)),
	}
}

/// Observe a streamed response. With `alt=sse` the chunks arrive as SSE
/// events; otherwise the body is one JSON array streamed incrementally, and
/// chunks are carved out of it as their closing brace arrives.
pub fn observe_stream(body: Body, log: MetadataLog, request_path: &str) -> Body {
	if request_path.contains("alt=sse") {
		return parse::sse::json_events::<GenerateResponse>(body, move |ev| match ev {
			Some(Ok(chunk)) => merge_chunk(&log, chunk),
			Some(Err(e)) => debug!("skipping malformed stream event: {e}"),
			None => {},
		});
	}
	let decoder = JsonArrayDecoder::new(llm::MAX_BODY_SIZE);
	parse::passthrough::observe(body, decoder, move |obj| {
		match serde_json::from_slice::<GenerateResponse>(&obj) {
			Ok(chunk) => merge_chunk(&log, chunk),
			Err(e) => debug!("skipping malformed stream chunk: {e}"),
		}
	})
}

fn merge_chunk(log: &MetadataLog, chunk: GenerateResponse) {
	log.merge(|m| {
		if m.model.is_none() {
			m.model = chunk.model_version.as_deref().map(strng::new);
		}
		if m.request_id.is_none() {
			m.request_id = chunk.response_id.as_deref().map(strng::new);
		}
		if let Some(u) = chunk.usage_metadata {
			m.input_tokens = u.prompt_token_count;
			m.output_tokens = u.candidates_token_count;
			m.total_tokens = u.total_token_count;
		}
		if let Some(f) = chunk
			.candidates
			.first()
			.and_then(|c| c.finish_reason.as_deref())
		{
			m.finish_reason = Some(strng::new(f));
		}
	});
}

pub fn estimate_tokens(body: &Value) -> Option<u64> {
	let mut chars: u64 = 0;
	if let Some(parts) = body
		.get("systemInstruction")
		.and_then(|si| si.get("parts"))
		.and_then(Value::as_array)
	{
		for p in parts {
			if let Some(t) = p.get("text").and_then(Value::as_str) {
				chars += t.len() as u64;
			}
		}
	}
	for content in body.get("contents")?.as_array()? {
		let Some(parts) = content.get("parts").and_then(Value::as_array) else {
			continue;
		};
		for p in parts {
			if let Some(t) = p.get("text").and_then(Value::as_str) {
				chars += t.len() as u64;
			}
		}
	}
	Some(chars / 4)
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;

	use super::*;

	#[test]
	fn path_detection() {
		assert!(is_streaming_path(
			"/v1beta/models/gemini-2.5-pro:streamGenerateContent"
		));
		assert!(!is_streaming_path("/v1beta/models/gemini-2.5-pro:generateContent"));
		assert_eq!(
			model_from_path("/v1beta/models/gemini-2.5-pro:streamGenerateContent").as_deref(),
			Some("gemini-2.5-pro")
		);
		assert_eq!(model_from_path("/v1beta/models"), None);
	}

	#[test]
	fn buffered_usage_metadata() {
		let body = r#"{
			"candidates": [{"content": {"parts": [{"text": "hi"}]}, "finishReason": "STOP"}],
			"usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 10, "totalTokenCount": 14},
			"modelVersion": "gemini-2.5-pro"
		}"#;
		let meta = parse_response(body.as_bytes()).unwrap();
		assert_eq!(meta.input_tokens, 4);
		assert_eq!(meta.output_tokens, 10);
		assert_eq!(meta.total_tokens, 14);
		assert_eq!(meta.model.as_deref(), Some("gemini-2.5-pro"));
		assert_eq!(meta.finish_reason.as_deref(), Some("STOP"));
	}

	#[tokio::test]
	async fn array_stream_usage_on_last_chunk() {
		let log: MetadataLog = Default::default();
		log.set(ResponseMetadata {
			provider: NAME,
			is_streaming: true,
			..Default::default()
		});
		let body = Body::from_stream(futures_util::stream::iter(vec![
			Ok::<_, std::io::Error>(bytes::Bytes::from_static(
				br#"[{"candidates": [{"content": {"parts": [{"text": "he"}]}}], "modelVersion": "gemini-2.5-pro"},"#,
			)),
			Ok(bytes::Bytes::from_static(
				br#"{"candidates": [{"content": {"parts": [{"text": "y"}]}, "finishReason": "STOP"}], "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 6, "totalTokenCount": 9}}]"#,
			)),
		]));
		let body = observe_stream(
			body,
			log.clone(),
			"/v1beta/models/gemini-2.5-pro:streamGenerateContent",
		);
		body.collect().await.unwrap();

		let meta = log.take().unwrap();
		assert_eq!((meta.input_tokens, meta.output_tokens, meta.total_tokens), (3, 6, 9));
		assert_eq!(meta.finish_reason.as_deref(), Some("STOP"));
		assert_eq!(meta.model.as_deref(), Some("gemini-2.5-pro"));
	}
}
