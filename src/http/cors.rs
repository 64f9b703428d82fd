use ::http::{HeaderValue, Method, StatusCode, header};

use crate::http::{HeaderMap, Request, Response};

const ALLOW_METHODS: HeaderValue = HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS");
const ALLOW_ORIGIN: HeaderValue = HeaderValue::from_static("*");
const ALLOW_HEADERS: HeaderValue = HeaderValue::from_static("*");
const MAX_AGE: HeaderValue = HeaderValue::from_static("86400");

/// Preflight requests short-circuit with permissive headers; for everything
/// else the same headers are appended to the final response.
pub fn preflight(req: &Request) -> Option<Response> {
	if req.method() != Method::OPTIONS {
		return None;
	}
	let resp = ::http::Response::builder()
		.status(StatusCode::NO_CONTENT)
		.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW_ORIGIN)
		.header(header::ACCESS_CONTROL_ALLOW_METHODS, ALLOW_METHODS)
		.header(header::ACCESS_CONTROL_ALLOW_HEADERS, ALLOW_HEADERS)
		.header(header::ACCESS_CONTROL_MAX_AGE, MAX_AGE)
		.body(crate::http::Body::empty())
		.expect("static response builds");
	Some(resp)
}

pub fn append_headers(headers: &mut HeaderMap) {
	headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW_ORIGIN);
	headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, ALLOW_METHODS);
	headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, ALLOW_HEADERS);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	#[test]
	fn options_short_circuits() {
		let req = ::http::Request::builder()
			.method(Method::OPTIONS)
			.uri("/openai/v1/chat/completions")
			.body(Body::empty())
			.unwrap();
		let resp = preflight(&req).expect("preflight response");
		assert_eq!(resp.status(), StatusCode::NO_CONTENT);
		assert_eq!(
			resp.headers()
				.get(header::ACCESS_CONTROL_ALLOW_METHODS)
				.unwrap(),
			"GET, POST, PUT, DELETE, OPTIONS"
		);
	}

	#[test]
	fn non_options_passes() {
		let req = ::http::Request::builder()
			.method(Method::POST)
			.uri("/openai/v1/chat/completions")
			.body(Body::empty())
			.unwrap();
		assert!(preflight(&req).is_none());
	}
}
