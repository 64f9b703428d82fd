use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use ::http::uri::PathAndQuery;
use axum::extract::{ConnectInfo, State};
use chrono::{TimeDelta, Utc};
use ring::digest;
use secrecy::ExposeSecret;
use serde_json::{Value, json};

use crate::app::App;
use crate::config::KeySubstitutionConfig;
use crate::cost::RequestContext;
use crate::http::{self, Body, HeaderValue, Method, Request, Response, StatusCode, header};
use crate::llm::{AIProvider, MAX_BODY_SIZE, ResponseMetadata};
use crate::ratelimit::{Denial, Reservation, ReserveOutcome, ScopeKeys};
use crate::strng;
use crate::strng::Strng;
use crate::telemetry::log::MetadataLog;
use crate::{info, warn};

pub mod complete;
pub mod upstream;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("request body too large")]
	BodyTooLarge,
	#[error("credential not found")]
	CredentialNotFound,
	#[error("upstream connection failed: {0}")]
	UpstreamUnreachable(String),
	#[error("upstream request failed: {0}")]
	UpstreamRequest(String),
	#[error("upstream timed out before responding")]
	UpstreamTimeout,
	#[error("internal error: {0}")]
	Internal(String),
}

impl ProxyError {
	fn status(&self) -> StatusCode {
		match self {
			ProxyError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ProxyError::CredentialNotFound => StatusCode::UNAUTHORIZED,
			ProxyError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamRequest(_) => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	fn error_type(&self) -> &'static str {
		match self {
			ProxyError::BodyTooLarge => "invalid_request_error",
			// Deliberately does not say which credential was missing.
			ProxyError::CredentialNotFound => "credential_not_found",
			ProxyError::UpstreamUnreachable(_) => "upstream_unreachable",
			ProxyError::UpstreamRequest(_) | ProxyError::UpstreamTimeout => "upstream_error",
			ProxyError::Internal(_) => "internal_error",
		}
	}

	pub fn into_response(self) -> Response {
		let message = match &self {
			ProxyError::CredentialNotFound => "credential not found".to_string(),
			other => other.to_string(),
		};
		let body = json!({
			"error": {"type": self.error_type(), "message": message},
		});
		json_response(self.status(), &body)
	}
}

fn json_response(status: StatusCode, body: &Value) -> Response {
	::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(body.to_string()))
		.expect("static response builds")
}

fn not_found() -> Response {
	json_response(
		StatusCode::NOT_FOUND,
		&json!({"error": {"type": "not_found", "message": "unknown path"}}),
	)
}

/// Single entry point for everything that is not `/health` or `/metrics`.
/// The stage order matters: CORS preflight short-circuits before any
/// accounting, the URL rewriter runs before vendor matching, and the
/// rate-limit reservation runs before the upstream dispatch.
pub async fn handler(
	State(app): State<Arc<App>>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	req: Request,
) -> Response {
	if let Some(resp) = http::cors::preflight(&req) {
		return resp;
	}
	let mut resp = route(app, addr, req).await;
	http::cors::append_headers(resp.headers_mut());
	resp
}

async fn route(app: Arc<App>, addr: SocketAddr, mut req: Request) -> Response {
	let start = Instant::now();
	let path_user = match rewrite_meta_path(&mut req) {
		Ok(u) => u,
		Err(resp) => return resp,
	};

	let path = req.uri().path().to_string();
	let first = path.trim_start_matches('/').split('/').next().unwrap_or("");
	let Some(provider) = AIProvider::from_prefix(first) else {
		return not_found();
	};
	const ALLOWED: [Method; 4] = [Method::GET, Method::POST, Method::PUT, Method::DELETE];
	if !ALLOWED.contains(req.method()) {
		return json_response(
			StatusCode::METHOD_NOT_ALLOWED,
			&json!({"error": {"type": "method_not_allowed", "message": "unsupported method"}}),
		);
	}
	if let Some(pc) = app.cfg.providers.get(&provider.name())
		&& !pc.enabled
	{
		return not_found();
	}

	// The vendor prefix is ours; everything after it is forwarded verbatim.
	let pq = req
		.uri()
		.path_and_query()
		.map(|p| p.as_str().to_string())
		.unwrap_or_else(|| path.clone());
	let upstream_pq = match pq.strip_prefix(&format!("/{first}")) {
		Some("") | None => "/".to_string(),
		Some(rest) => rest.to_string(),
	};

	match dispatch(app, provider, addr, req, &path, &upstream_pq, path_user, start).await {
		Ok(resp) => resp,
		Err(e) => e.into_response(),
	}
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
	app: Arc<App>,
	provider: AIProvider,
	addr: SocketAddr,
	req: Request,
	endpoint: &str,
	upstream_pq: &str,
	path_user: Option<Strng>,
	start: Instant,
) -> Result<Response, ProxyError> {
	let (mut parts, mut body) = req.into_parts();
	let bytes = http::inspect_body(&mut body, MAX_BODY_SIZE)
		.await
		.map_err(|_| ProxyError::BodyTooLarge)?;
	let body_json: Option<Value> = if bytes.is_empty() {
		None
	} else {
		serde_json::from_slice(&bytes).ok()
	};

	let streaming = provider.is_streaming_request(upstream_pq, body_json.as_ref());
	let requested_model = provider
		.request_model(upstream_pq, body_json.as_ref())
		.unwrap_or_default();
	let est = provider.estimate_tokens(&bytes, body_json.as_ref());

	// Identity: path-captured user, then header, then credential hash, then IP.
	let ip = http::client_ip(&parts.headers, Some(addr));
	let credential = extract_credential(provider, &parts.headers);
	let api_key_id = credential
		.as_deref()
		.map(|c| key_id(c, &app.cfg.key_substitution));
	let user = path_user
		.or_else(|| {
			parts
				.headers
				.get("x-user-id")
				.and_then(|v| v.to_str().ok())
				.map(strng::new)
		})
		.or_else(|| {
			// Some callers tag the request body instead (e.g. the OpenAI
			// `user` field).
			body_json
				.as_ref()
				.and_then(|b| b.get("user"))
				.and_then(Value::as_str)
				.map(strng::new)
		})
		.or_else(|| api_key_id.clone())
		.unwrap_or_else(|| strng::new(&ip));

	substitute_credentials(provider, &mut parts.headers, &app.cfg.key_substitution)?;

	let canonical = app.limiter.canonical_model(&provider.name(), &requested_model);
	let scope = ScopeKeys {
		provider: Some(provider.name()),
		model: (!requested_model.is_empty()).then_some(canonical),
		api_key: api_key_id,
		user_id: Some(user.clone()),
	};
	let reservation = match app.limiter.check_and_reserve(&scope, est, Utc::now()).await {
		ReserveOutcome::Allowed(r) => r,
		ReserveOutcome::Denied(denial) => return Ok(denial_response(&denial, streaming)),
	};

	let base = app.upstream_base(provider);
	let upstream_resp = match app.upstream.forward(&base, upstream_pq, parts, bytes).await {
		Ok(resp) => resp,
		Err(e) => {
			let limiter = app.limiter.clone();
			tokio::spawn(async move { limiter.cancel(&reservation, Utc::now()).await });
			return Err(e);
		},
	};

	// Upstream errors are forwarded verbatim; the reservation is reversed and
	// no metadata callback fires.
	if !upstream_resp.status().is_success() {
		let limiter = app.limiter.clone();
		tokio::spawn(async move { limiter.cancel(&reservation, Utc::now()).await });
		return Ok(upstream_resp);
	}

	let ctx = RequestContext {
		user_id: Some(user),
		ip,
		endpoint: endpoint.to_string(),
		requested_model,
	};
	let (resp_parts, resp_body) = upstream_resp.into_parts();
	let log = MetadataLog::default();

	let out_body = if streaming {
		log.set(ResponseMetadata {
			provider: provider.name(),
			is_streaming: true,
			..Default::default()
		});
		provider.observe_streaming(resp_body, log.clone(), upstream_pq)
	} else {
		// Buffered: parse a copy, replay the original bytes byte-identically.
		let declared_len = resp_parts
			.headers
			.get(header::CONTENT_LENGTH)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.parse::<usize>().ok());
		if declared_len.is_some_and(|l| l > MAX_BODY_SIZE) {
			warn!(endpoint = %ctx.endpoint, "response too large to parse, recording zero usage");
			log.set(ResponseMetadata {
				provider: provider.name(),
				..Default::default()
			});
			resp_body
		} else {
			let body_bytes = axum::body::to_bytes(resp_body, MAX_BODY_SIZE)
				.await
				.map_err(|e| {
					let limiter = app.limiter.clone();
					let reservation = reservation.clone();
					tokio::spawn(async move { limiter.cancel(&reservation, Utc::now()).await });
					ProxyError::UpstreamRequest(e.to_string())
				})?;
			let meta = match provider.parse_buffered_response(&body_bytes).await {
				Ok(meta) => meta,
				Err(e) => {
					warn!(endpoint = %ctx.endpoint, "failed to parse response metadata: {e}");
					ResponseMetadata {
						provider: provider.name(),
						..Default::default()
					}
				},
			};
			log.set(meta);
			Body::from(body_bytes)
		}
	};

	let hook = completion_hook(app.clone(), ctx, log, reservation, est, start);
	let out_body = complete::on_complete(out_body, hook);
	Ok(Response::from_parts(resp_parts, out_body))
}

/// Runs when the response has been fully flushed to the client, or the client
/// disconnected. Fires at most once per request; the work happens on its own
/// task so the response path never waits on sinks or counters.
fn completion_hook(
	app: Arc<App>,
	ctx: RequestContext,
	log: MetadataLog,
	reservation: Reservation,
	est: u64,
	start: Instant,
) -> impl FnOnce() + Send + 'static {
	move || {
		let mut meta = log.take().unwrap_or_default();
		let duration = start.elapsed();
		tokio::spawn(async move {
			let cut_midflight = meta.is_streaming && meta.finish_reason.is_none();
			if cut_midflight {
				// Report whatever accumulated before the stream was cut.
				meta.finish_reason = Some(strng::literal!("unknown"));
			}
			let actual = if meta.total_tokens != 0 {
				meta.total_tokens
			} else {
				meta.input_tokens + meta.output_tokens
			};
			if cut_midflight && actual == 0 {
				// Nothing was produced; reverse the reservation entirely.
				app.limiter.cancel(&reservation, Utc::now()).await;
			} else {
				app
					.limiter
					.adjust(&reservation, actual as i64 - est as i64, Utc::now())
					.await;
			}
			if let Some(cost) = &app.cost {
				cost.record_response(&ctx, &meta).await;
			}
			info!(
				endpoint = %ctx.endpoint,
				provider = %meta.provider,
				model = meta.model.as_deref().unwrap_or(""),
				user = ctx.user_id.as_deref().unwrap_or(""),
				streaming = meta.is_streaming,
				input_tokens = meta.input_tokens,
				output_tokens = meta.output_tokens,
				duration_ms = duration.as_millis() as u64,
				"request complete"
			);
		});
	}
}

/// `/meta/<user_id>/<vendor>/<rest>` -> `/<vendor>/<rest>`, with the user id
/// captured for identity extraction. Path-based identification exists for
/// clients that cannot set custom headers.
fn rewrite_meta_path(req: &mut Request) -> Result<Option<Strng>, Response> {
	let path = req.uri().path();
	let Some(rest) = path.strip_prefix("/meta/") else {
		return Ok(None);
	};
	let mut parts = rest.splitn(2, '/');
	let user = match parts.next() {
		Some(u) if !u.is_empty() => strng::new(u),
		_ => return Err(not_found()),
	};
	let Some(tail) = parts.next() else {
		return Err(not_found());
	};
	let new_pq = match req.uri().query() {
		Some(q) => format!("/{tail}?{q}"),
		None => format!("/{tail}"),
	};
	let rewritten = http::modify_req_uri(req, |uri| {
		uri.path_and_query = Some(PathAndQuery::try_from(new_pq.as_str())?);
		Ok(())
	});
	match rewritten {
		Ok(()) => Ok(Some(user)),
		Err(_) => Err(not_found()),
	}
}

/// The raw client credential, if any, from this vendor's credential headers.
fn extract_credential(provider: AIProvider, headers: &http::HeaderMap) -> Option<String> {
	for name in provider.credential_headers() {
		if let Some(value) = headers.get(name)
			&& let Ok(value) = value.to_str()
		{
			let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
			if !token.is_empty() {
				return Some(token.to_string());
			}
		}
	}
	None
}

/// Scope identifier for a credential: substitutable keys are already opaque
/// identifiers; anything else is hashed so raw secrets never become counter
/// keys or log fields.
fn key_id(credential: &str, subst: &KeySubstitutionConfig) -> Strng {
	if credential.starts_with(&subst.prefix) {
		return strng::new(credential);
	}
	let hash = digest::digest(&digest::SHA256, credential.as_bytes());
	strng::new(&hex::encode(hash.as_ref())[..16])
}

/// Replace proxy-issued keys with the stored vendor credential. A key that
/// carries our prefix but is not in the store is a hard 401: forwarding it
/// upstream would only leak the miss to the vendor.
fn substitute_credentials(
	provider: AIProvider,
	headers: &mut http::HeaderMap,
	subst: &KeySubstitutionConfig,
) -> Result<(), ProxyError> {
	if !subst.enabled {
		return Ok(());
	}
	for name in provider.credential_headers() {
		let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
			continue;
		};
		let bearer = value.starts_with("Bearer ");
		let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
		if !token.starts_with(&subst.prefix) {
			continue;
		}
		let Some(real) = subst.keys.get(token) else {
			return Err(ProxyError::CredentialNotFound);
		};
		let replacement = if bearer {
			format!("Bearer {}", real.expose_secret())
		} else {
			real.expose_secret().to_string()
		};
		let mut value = HeaderValue::from_str(&replacement)
			.map_err(|_| ProxyError::Internal("stored credential is not a valid header".to_string()))?;
		value.set_sensitive(true);
		headers.insert(name.clone(), value);
	}
	Ok(())
}

/// 429 with the structured body the clients expect. Streaming callers get a
/// one-event SSE stream instead of a JSON body so their parsers stay happy.
fn denial_response(denial: &Denial, streaming: bool) -> Response {
	let retry_after = denial.retry_after.max(1);
	let reset_time = (Utc::now() + TimeDelta::seconds(retry_after as i64)).to_rfc3339();
	let body = json!({
		"error": {
			"type": "rate_limit_exceeded",
			"message": format!(
				"rate limit exceeded: {} for {}",
				denial.limit_name(),
				denial.scope
			),
			"code": denial.limit_name(),
		},
		"retry_after": retry_after,
		"reset_time": reset_time,
	});

	let builder = ::http::Response::builder()
		.status(StatusCode::TOO_MANY_REQUESTS)
		.header(header::RETRY_AFTER, retry_after)
		.header("x-ratelimit-exceeded", "true");
	if streaming {
		builder
			.header(header::CONTENT_TYPE, "text/event-stream")
			.body(Body::from(format!("data: {body}\n\ndata: [DONE]\n\n")))
			.expect("static response builds")
	} else {
		builder
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(body.to_string()))
			.expect("static response builds")
	}
}

/// `/health`: liveness plus a summary of what this instance fronts.
pub async fn health(State(app): State<Arc<App>>) -> Response {
	let providers: serde_json::Map<String, Value> = app
		.cfg
		.providers
		.iter()
		.map(|(name, p)| {
			let models: Vec<String> = p.models.keys().map(|m| m.to_string()).collect();
			(
				name.to_string(),
				json!({"enabled": p.enabled, "models": models}),
			)
		})
		.collect();
	let mut body = json!({
		"status": "healthy",
		"timestamp": Utc::now().to_rfc3339(),
		"providers": providers,
		"features": {"cost_tracking": app.cost.is_some()},
	});
	if let Some(cost) = &app.cost {
		body["cost_stats_24h"] = serde_json::to_value(cost.stats_24h(Utc::now())).unwrap_or_default();
	}
	json_response(StatusCode::OK, &body)
}

pub async fn metrics(State(app): State<Arc<App>>) -> Response {
	match &app.metrics {
		Some(sink) => ::http::Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
			.body(Body::from(sink.encode()))
			.expect("static response builds"),
		None => not_found(),
	}
}
