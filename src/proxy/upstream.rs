use bytes::Bytes;
use tokio_stream::StreamExt;

use super::ProxyError;
use crate::config::UpstreamConfig;
use crate::http;
use crate::http::Body;

/// Forwards requests to vendor endpoints over TLS, streaming the response
/// back without buffering. Connect, response-header and idle timeouts are
/// enforced independently; there is no overall deadline on a streaming read.
#[derive(Clone)]
pub struct UpstreamClient {
	client: reqwest::Client,
	cfg: UpstreamConfig,
}

impl UpstreamClient {
	pub fn new(cfg: &UpstreamConfig) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.connect_timeout(cfg.connect_timeout)
			// The proxy is transparent; redirects belong to the caller.
			.redirect(reqwest::redirect::Policy::none())
			.build()?;
		Ok(UpstreamClient {
			client,
			cfg: cfg.clone(),
		})
	}

	/// Send the (already rewritten) request upstream. `base` is
	/// `scheme://authority`; the path and query are forwarded as-is.
	pub async fn forward(
		&self,
		base: &str,
		path_and_query: &str,
		parts: ::http::request::Parts,
		body: Bytes,
	) -> Result<http::Response, ProxyError> {
		let url = format!("{base}{path_and_query}");
		let mut headers = parts.headers;
		http::strip_hop_headers(&mut headers);

		let request = self
			.client
			.request(parts.method, &url)
			.headers(headers)
			.body(body);

		// First-byte timeout covers connect + request write + response head.
		let response = match tokio::time::timeout(self.cfg.first_byte_timeout, request.send()).await {
			Ok(Ok(resp)) => resp,
			Ok(Err(e)) if e.is_connect() => {
				return Err(ProxyError::UpstreamUnreachable(e.to_string()));
			},
			Ok(Err(e)) => return Err(ProxyError::UpstreamRequest(e.to_string())),
			Err(_) => return Err(ProxyError::UpstreamTimeout),
		};

		let status = response.status();
		let mut resp_headers = response.headers().clone();
		http::strip_hop_headers(&mut resp_headers);

		let idle = self.cfg.idle_timeout;
		let stream = response
			.bytes_stream()
			.timeout(idle)
			.map(|item| match item {
				Ok(Ok(chunk)) => Ok(chunk),
				Ok(Err(e)) => Err(std::io::Error::other(e)),
				Err(_) => Err(std::io::Error::other("upstream idle timeout")),
			});

		let mut builder = ::http::Response::builder().status(status);
		if let Some(h) = builder.headers_mut() {
			*h = resp_headers;
		}
		builder
			.body(Body::from_stream(stream))
			.map_err(|e| ProxyError::Internal(e.to_string()))
	}
}
