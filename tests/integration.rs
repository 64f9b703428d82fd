use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use llm_proxy::app::App;
use llm_proxy::config;
use llm_proxy::cost::sink::SinkRegistry;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn start_proxy(cfg_yaml: &str) -> SocketAddr {
	let cfg = config::parse_config(cfg_yaml).expect("config parses");
	let app = App::build(Arc::new(cfg), &SinkRegistry::with_defaults())
		.await
		.expect("app builds");
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let router = app.router();
	tokio::spawn(async move {
		axum::serve(
			listener,
			router.into_make_service_with_connect_info::<SocketAddr>(),
		)
		.await
		.unwrap();
	});
	addr
}

fn base_config(upstream: &str, extra: &str) -> String {
	format!(
		r#"
enabled: true
providers:
  openai:
    enabled: true
    upstream: {upstream}
    models:
      gpt-4o:
        aliases: [gpt-4o-2024-05-13]
        pricing:
          input: 2.5
          output: 10.0
  anthropic:
    enabled: true
    upstream: {upstream}
    models:
      claude-sonnet-4:
        pricing:
          input: 3.0
          output: 15.0
{extra}"#
	)
}

async fn wait_for_file_lines(path: &std::path::Path, n: usize) -> Vec<String> {
	for _ in 0..100 {
		if let Ok(contents) = std::fs::read_to_string(path) {
			let lines: Vec<String> = contents.lines().map(str::to_string).collect();
			if lines.len() >= n {
				return lines;
			}
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	panic!("cost records never appeared in {}", path.display());
}

const OPENAI_BODY: &str = r#"{"id":"chatcmpl-abc","object":"chat.completion","model":"gpt-4o-2024-05-13","choices":[{"index":0,"message":{"role":"assistant","content":"hi there"},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;

#[tokio::test]
async fn buffered_openai_round_trip_records_cost() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.and(body_string_contains("gpt-4o"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-type", "application/json")
				.set_body_raw(OPENAI_BODY, "application/json"),
		)
		.expect(1)
		.mount(&upstream)
		.await;

	let dir = tempfile::tempdir().unwrap();
	let costs = dir.path().join("costs.ndjson");
	let extra = format!(
		r#"features:
  cost_tracking:
    enabled: true
    transport:
      type: file
      path: {}
"#,
		costs.display()
	);
	let proxy = start_proxy(&base_config(&upstream.uri(), &extra)).await;

	let client = reqwest::Client::new();
	let resp = client
		.post(format!("http://{proxy}/openai/v1/chat/completions"))
		.header("content-type", "application/json")
		.header("x-user-id", "alice")
		.body(r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#)
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	// CORS headers are appended to proxied responses.
	assert_eq!(
		resp
			.headers()
			.get("access-control-allow-origin")
			.unwrap()
			.to_str()
			.unwrap(),
		"*"
	);
	// Byte identity: exactly what the upstream sent.
	let body = resp.bytes().await.unwrap();
	assert_eq!(body.as_ref(), OPENAI_BODY.as_bytes());

	let lines = wait_for_file_lines(&costs, 1).await;
	let record: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
	assert_eq!(record["provider"], "openai");
	assert_eq!(record["model"], "gpt-4o");
	assert_eq!(record["user_id"], "alice");
	assert_eq!(record["input_tokens"], 10);
	assert_eq!(record["output_tokens"], 5);
	assert_eq!(record["total_tokens"], 15);
	assert_eq!(record["is_streaming"], false);
	assert_eq!(record["finish_reason"], "stop");
	let expected = (10.0 / 1e6) * 2.5 + (5.0 / 1e6) * 10.0;
	assert!((record["total_cost"].as_f64().unwrap() - expected).abs() < 1e-12);
}

#[tokio::test]
async fn gzip_response_parses_and_passes_through() {
	use async_compression::tokio::bufread::GzipEncoder;
	use tokio::io::{AsyncReadExt, BufReader};

	let anthropic_body = r#"{"id":"msg_01","type":"message","role":"assistant","model":"claude-sonnet-4","content":[{"type":"text","text":"hello"}],"stop_reason":"end_turn","usage":{"input_tokens":10,"output_tokens":25}}"#;
	let mut enc = GzipEncoder::new(BufReader::new(anthropic_body.as_bytes()));
	let mut gzipped = Vec::new();
	enc.read_to_end(&mut gzipped).await.unwrap();

	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-encoding", "gzip")
				.set_body_raw(gzipped.clone(), "application/json"),
		)
		.mount(&upstream)
		.await;

	let dir = tempfile::tempdir().unwrap();
	let costs = dir.path().join("costs.ndjson");
	let extra = format!(
		r#"features:
  cost_tracking:
    enabled: true
    transport:
      type: file
      path: {}
"#,
		costs.display()
	);
	let proxy = start_proxy(&base_config(&upstream.uri(), &extra)).await;

	let resp = reqwest::Client::new()
		.post(format!("http://{proxy}/anthropic/v1/messages"))
		.header("content-type", "application/json")
		.body(r#"{"model":"claude-sonnet-4","messages":[{"role":"user","content":"hi"}]}"#)
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	// The compressed bytes reach the client unmodified.
	let body = resp.bytes().await.unwrap();
	assert_eq!(body.as_ref(), gzipped.as_slice());

	// The parser still extracted usage from the compressed body.
	let lines = wait_for_file_lines(&costs, 1).await;
	let record: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
	assert_eq!(record["input_tokens"], 10);
	assert_eq!(record["output_tokens"], 25);
	assert_eq!(record["total_tokens"], 35);
}

#[tokio::test]
async fn streaming_response_tees_usage_without_altering_bytes() {
	let sse = "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"he\"},\"finish_reason\":null}]}\n\n\
data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"y\"},\"finish_reason\":\"stop\"}]}\n\n\
data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":2,\"total_tokens\":9}}\n\n\
data: [DONE]\n\n";

	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(
			ResponseTemplate::new(200).set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"),
		)
		.mount(&upstream)
		.await;

	let dir = tempfile::tempdir().unwrap();
	let costs = dir.path().join("costs.ndjson");
	let extra = format!(
		r#"features:
  cost_tracking:
    enabled: true
    transport:
      type: file
      path: {}
"#,
		costs.display()
	);
	let proxy = start_proxy(&base_config(&upstream.uri(), &extra)).await;

	let resp = reqwest::Client::new()
		.post(format!("http://{proxy}/openai/v1/chat/completions"))
		.header("content-type", "application/json")
		.body(r#"{"model":"gpt-4o","stream":true,"messages":[{"role":"user","content":"hi"}]}"#)
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	let body = resp.bytes().await.unwrap();
	assert_eq!(body.as_ref(), sse.as_bytes());

	let lines = wait_for_file_lines(&costs, 1).await;
	let record: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
	assert_eq!(record["is_streaming"], true);
	assert_eq!(record["input_tokens"], 7);
	assert_eq!(record["output_tokens"], 2);
	assert_eq!(record["finish_reason"], "stop");
}

#[tokio::test]
async fn rate_limit_denies_third_request_without_upstream_call() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(
			ResponseTemplate::new(200).set_body_raw(OPENAI_BODY, "application/json"),
		)
		.expect(2)
		.mount(&upstream)
		.await;

	let extra = r#"features:
  rate_limiting:
    enabled: true
    backend: memory
    limits:
      requests_per_minute: 2
"#;
	let proxy = start_proxy(&base_config(&upstream.uri(), extra)).await;

	let client = reqwest::Client::new();
	let send = || {
		client
			.post(format!("http://{proxy}/openai/v1/chat/completions"))
			.header("content-type", "application/json")
			.header("x-user-id", "bob")
			.body(r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#)
			.send()
	};
	assert_eq!(send().await.unwrap().status(), 200);
	assert_eq!(send().await.unwrap().status(), 200);

	let denied = send().await.unwrap();
	assert_eq!(denied.status(), 429);
	assert_eq!(
		denied.headers().get("x-ratelimit-exceeded").unwrap(),
		"true"
	);
	let retry_after: u64 = denied
		.headers()
		.get("retry-after")
		.unwrap()
		.to_str()
		.unwrap()
		.parse()
		.unwrap();
	assert!((1..=60).contains(&retry_after));
	let body: serde_json::Value = denied.json().await.unwrap();
	assert_eq!(body["error"]["type"], "rate_limit_exceeded");
	assert!(body["reset_time"].as_str().is_some());
	// The mock's expect(2) verifies no third upstream call was made.
}

#[tokio::test]
async fn streaming_denial_is_an_sse_event() {
	let upstream = MockServer::start().await;
	let extra = r#"features:
  rate_limiting:
    enabled: true
    backend: memory
    limits:
      requests_per_minute: 0
      tokens_per_minute: 0
    overrides:
      per_user:
        carol:
          requests_per_minute: 1
"#;
	let proxy = start_proxy(&base_config(&upstream.uri(), extra)).await;
	let sse = "data: {\"id\":\"c9\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1,\"total_tokens\":4}}\n\ndata: [DONE]\n\n";
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
		.expect(1)
		.mount(&upstream)
		.await;

	let client = reqwest::Client::new();
	let send = || {
		client
			.post(format!("http://{proxy}/openai/v1/chat/completions"))
			.header("content-type", "application/json")
			.header("x-user-id", "carol")
			.body(r#"{"model":"gpt-4o","stream":true,"messages":[{"role":"user","content":"hi"}]}"#)
			.send()
	};
	assert_eq!(send().await.unwrap().status(), 200);

	let denied = send().await.unwrap();
	assert_eq!(denied.status(), 429);
	assert_eq!(
		denied
			.headers()
			.get("content-type")
			.unwrap()
			.to_str()
			.unwrap(),
		"text/event-stream"
	);
	let text = denied.text().await.unwrap();
	assert!(text.starts_with("data: {"));
	assert!(text.contains("rate_limit_exceeded"));
	assert!(text.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn upstream_errors_are_forwarded_verbatim() {
	let upstream = MockServer::start().await;
	let error_body = r#"{"error":{"message":"invalid api key","type":"invalid_request_error"}}"#;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(401).set_body_raw(error_body, "application/json"))
		.mount(&upstream)
		.await;
	let proxy = start_proxy(&base_config(&upstream.uri(), "")).await;

	let resp = reqwest::Client::new()
		.post(format!("http://{proxy}/openai/v1/chat/completions"))
		.header("content-type", "application/json")
		.body(r#"{"model":"gpt-4o","messages":[]}"#)
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 401);
	let body = resp.bytes().await.unwrap();
	assert_eq!(body.as_ref(), error_body.as_bytes());
}

#[tokio::test]
async fn meta_path_identifies_user() {
	let upstream = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/chat/completions"))
		.respond_with(
			ResponseTemplate::new(200).set_body_raw(OPENAI_BODY, "application/json"),
		)
		.mount(&upstream)
		.await;

	let dir = tempfile::tempdir().unwrap();
	let costs = dir.path().join("costs.ndjson");
	let extra = format!(
		r#"features:
  cost_tracking:
    enabled: true
    transport:
      type: file
      path: {}
"#,
		costs.display()
	);
	let proxy = start_proxy(&base_config(&upstream.uri(), &extra)).await;

	let resp = reqwest::Client::new()
		.post(format!("http://{proxy}/meta/dave/openai/v1/chat/completions"))
		.header("content-type", "application/json")
		.body(r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#)
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);

	let lines = wait_for_file_lines(&costs, 1).await;
	let record: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
	assert_eq!(record["user_id"], "dave");
	assert_eq!(record["endpoint"], "/openai/v1/chat/completions");
}

#[tokio::test]
async fn unknown_substituted_key_is_401_without_upstream_call() {
	let upstream = MockServer::start().await;
	// No mounted mocks: any upstream call would 404 and fail the status check.
	let extra = r#"features:
  key_substitution:
    enabled: true
    keys:
      "iw:0123456789abcdef0123456789abcdef": sk-real
"#;
	let proxy = start_proxy(&base_config(&upstream.uri(), extra)).await;

	let resp = reqwest::Client::new()
		.post(format!("http://{proxy}/openai/v1/chat/completions"))
		.header("authorization", "Bearer iw:ffffffffffffffffffffffffffffffff")
		.header("content-type", "application/json")
		.body(r#"{"model":"gpt-4o","messages":[]}"#)
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 401);
	let body: serde_json::Value = resp.json().await.unwrap();
	assert_eq!(body["error"]["type"], "credential_not_found");
	// The message names no credential.
	assert_eq!(body["error"]["message"], "credential not found");
}

#[tokio::test]
async fn health_and_unknown_paths() {
	let upstream = MockServer::start().await;
	let proxy = start_proxy(&base_config(&upstream.uri(), "")).await;
	let client = reqwest::Client::new();

	let resp = client
		.get(format!("http://{proxy}/health"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	let body: serde_json::Value = resp.json().await.unwrap();
	assert_eq!(body["status"], "healthy");
	assert_eq!(body["features"]["cost_tracking"], false);
	assert!(body["providers"]["openai"]["enabled"].as_bool().unwrap());

	let resp = client
		.get(format!("http://{proxy}/mistral/v1/chat"))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 404);

	// CORS preflight short-circuits.
	let resp = client
		.request(
			reqwest::Method::OPTIONS,
			format!("http://{proxy}/openai/v1/chat/completions"),
		)
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 204);
	assert_eq!(
		resp
			.headers()
			.get("access-control-allow-methods")
			.unwrap()
			.to_str()
			.unwrap(),
		"GET, POST, PUT, DELETE, OPTIONS"
	);
}
