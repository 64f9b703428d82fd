use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio_sse_codec::{Event, Frame, SseDecoder};

use super::passthrough;
use crate::http;

const MAX_EVENT_SIZE: usize = 2_097_152;

/// Observe an SSE body as a stream of JSON events of type `T`.
/// `data: [DONE]` is delivered as `None`; every other `data:` payload is
/// decoded and delivered as `Some(result)`. Anthropic-style `event:` lines
/// are framing only; the payload's own type tag is what matters.
pub fn json_events<T: DeserializeOwned>(
	b: http::Body,
	mut f: impl FnMut(Option<anyhow::Result<T>>) + Send + 'static,
) -> http::Body {
	let decoder = SseDecoder::<Bytes>::with_max_size(MAX_EVENT_SIZE);

	passthrough::observe(b, decoder, move |frame| {
		let Some(data) = unwrap_sse_data(frame) else {
			return;
		};
		if data.as_ref() == b"[DONE]" {
			f(None);
			return;
		}
		let obj = serde_json::from_slice::<T>(&data);
		f(Some(obj.map_err(anyhow::Error::from)))
	})
}

fn unwrap_sse_data(frame: Frame<Bytes>) -> Option<Bytes> {
	let Frame::Event(Event::<Bytes> { data, .. }) = frame else {
		return None;
	};
	Some(data)
}
