use std::net::SocketAddr;

pub mod compression;
pub mod cors;

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};
use axum::body::to_bytes;
use bytes::Bytes;

/// Hop-by-hop headers are meaningful only for a single transport-level
/// connection and must not be forwarded upstream.
const HOP_BY_HOP: &[HeaderName] = &[
	header::CONNECTION,
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

pub fn strip_hop_headers(headers: &mut HeaderMap) {
	// Connection may name additional per-hop headers; drop those first.
	let named: Vec<HeaderName> = headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.filter_map(|name| HeaderName::try_from(name.trim()).ok())
		.collect();
	for name in named {
		headers.remove(name);
	}
	for name in HOP_BY_HOP {
		headers.remove(name);
	}
	headers.remove("keep-alive");
	headers.remove(header::HOST);
}

/// Read the body once, cache the bytes, and restore a replayable reader.
/// Stages that inspect the body (token estimation, model extraction) and the
/// upstream dispatch each need a fresh reader.
pub async fn inspect_body(body: &mut Body, limit: usize) -> anyhow::Result<Bytes> {
	let orig = std::mem::replace(body, Body::empty());
	let bytes = to_bytes(orig, limit).await?;
	*body = Body::from(bytes.clone());
	Ok(bytes)
}

/// Client address resolution: `X-Forwarded-For` first hop, then `X-Real-IP`,
/// then the socket peer address.
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
	if let Some(xff) = headers.get("x-forwarded-for")
		&& let Ok(v) = xff.to_str()
		&& let Some(first) = v.split(',').next()
		&& !first.trim().is_empty()
	{
		return first.trim().to_string();
	}
	if let Some(real) = headers.get("x-real-ip")
		&& let Ok(v) = real.to_str()
		&& !v.trim().is_empty()
	{
		return v.trim().to_string();
	}
	remote
		.map(|a| a.ip().to_string())
		.unwrap_or_else(|| "unknown".to_string())
}

pub fn modify_req_uri(
	req: &mut Request,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let nreq = std::mem::take(req);
	let (mut head, body) = nreq.into_parts();
	let mut parts = head.uri.into_parts();
	f(&mut parts)?;
	head.uri = Uri::from_parts(parts)?;
	*req = Request::from_parts(head, body);
	Ok(())
}
