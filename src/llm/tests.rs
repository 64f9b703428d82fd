use serde_json::json;

use super::*;

#[test]
fn prefix_registration() {
	for p in ALL_PROVIDERS {
		assert_eq!(AIProvider::from_prefix(p.path_prefix()), Some(*p));
	}
	assert_eq!(AIProvider::from_prefix("meta"), None);
	assert_eq!(AIProvider::from_prefix("health"), None);
}

#[test]
fn streaming_detection_is_vendor_specific() {
	let streaming = json!({"model": "gpt-4o", "stream": true, "messages": []});
	let buffered = json!({"model": "gpt-4o", "messages": []});
	assert!(AIProvider::OpenAI.is_streaming_request("/v1/chat/completions", Some(&streaming)));
	assert!(!AIProvider::OpenAI.is_streaming_request("/v1/chat/completions", Some(&buffered)));
	assert!(AIProvider::Anthropic.is_streaming_request("/v1/messages", Some(&streaming)));

	// Gemini ignores the body; the URL decides.
	assert!(AIProvider::Gemini.is_streaming_request(
		"/v1beta/models/gemini-2.5-pro:streamGenerateContent",
		Some(&buffered)
	));
	assert!(!AIProvider::Gemini.is_streaming_request(
		"/v1beta/models/gemini-2.5-pro:generateContent",
		Some(&streaming)
	));
}

#[test]
fn request_model_extraction() {
	let body = json!({"model": "claude-sonnet-4", "messages": []});
	assert_eq!(
		AIProvider::Anthropic
			.request_model("/v1/messages", Some(&body))
			.as_deref(),
		Some("claude-sonnet-4")
	);
	assert_eq!(
		AIProvider::Gemini
			.request_model("/v1beta/models/gemini-2.5-pro:generateContent", None)
			.as_deref(),
		Some("gemini-2.5-pro")
	);
}

#[test]
fn estimate_falls_back_to_body_size() {
	let raw = vec![b'x'; 400];
	assert_eq!(AIProvider::OpenAI.estimate_tokens(&raw, None), 100);
	// A parseable chat body estimates from its messages instead.
	let body = json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]});
	let est = AIProvider::OpenAI.estimate_tokens(b"{}", Some(&body));
	assert!(est > 0 && est < 20, "estimate {est} out of range");
}

#[tokio::test]
async fn gzip_transparent_metadata() {
	use async_compression::tokio::bufread::GzipEncoder;
	use tokio::io::{AsyncReadExt, BufReader};

	let body = br#"{
		"id": "msg_01",
		"model": "claude-sonnet-4",
		"stop_reason": "end_turn",
		"usage": {"input_tokens": 10, "output_tokens": 25}
	}"#;
	let plain = AIProvider::Anthropic
		.parse_buffered_response(&Bytes::from_static(body))
		.await
		.unwrap();

	let mut enc = GzipEncoder::new(BufReader::new(body.as_slice()));
	let mut compressed = Vec::new();
	enc.read_to_end(&mut compressed).await.unwrap();
	let gz = AIProvider::Anthropic
		.parse_buffered_response(&Bytes::from(compressed))
		.await
		.unwrap();

	assert_eq!(plain.input_tokens, 10);
	assert_eq!(plain.output_tokens, 25);
	assert_eq!(gz.input_tokens, plain.input_tokens);
	assert_eq!(gz.output_tokens, plain.output_tokens);
	assert_eq!(gz.total_tokens, plain.total_tokens);
	assert_eq!(gz.finish_reason, plain.finish_reason);
}
