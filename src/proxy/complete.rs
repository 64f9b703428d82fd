use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use http_body::Body;
use pin_project_lite::pin_project;

use crate::http;

/// Runs a hook exactly once, either when the stream ends cleanly or when the
/// body is dropped (client disconnect). The Option is the once-guard: both
/// paths go through `fire`, and whichever gets there first takes the hook.
struct CompletionGuard {
	hook: Option<Box<dyn FnOnce() + Send>>,
}

impl CompletionGuard {
	fn fire(&mut self) {
		if let Some(hook) = self.hook.take() {
			hook();
		}
	}
}

impl Drop for CompletionGuard {
	fn drop(&mut self) {
		self.fire();
	}
}

pin_project! {
	pub struct CompletionBody {
		#[pin]
		body: http::Body,
		guard: CompletionGuard,
	}
}

/// Wrap `body` so `hook` runs after the response has been fully delivered to
/// the client, or on disconnect, whichever comes first. The hook must not
/// block; spawn anything that does.
pub fn on_complete(body: http::Body, hook: impl FnOnce() + Send + 'static) -> http::Body {
	http::Body::new(CompletionBody {
		body,
		guard: CompletionGuard {
			hook: Some(Box::new(hook)),
		},
	})
}

impl Body for CompletionBody {
	type Data = Bytes;
	type Error = http::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let res = ready!(this.body.poll_frame(cx));
		if res.is_none() {
			this.guard.fire();
		}
		Poll::Ready(res)
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.body.size_hint()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use http_body_util::BodyExt;

	use super::*;

	#[tokio::test]
	async fn fires_once_on_clean_end() {
		let count = Arc::new(AtomicUsize::new(0));
		let c = count.clone();
		let body = on_complete(http::Body::from("hello"), move || {
			c.fetch_add(1, Ordering::SeqCst);
		});
		let bytes = body.collect().await.unwrap().to_bytes();
		assert_eq!(bytes.as_ref(), b"hello");
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn fires_on_drop() {
		let count = Arc::new(AtomicUsize::new(0));
		let c = count.clone();
		let body = on_complete(http::Body::from("hello"), move || {
			c.fetch_add(1, Ordering::SeqCst);
		});
		drop(body);
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}
}
