use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use http_body::Body;
use pin_project_lite::pin_project;
use tokio_util::codec::Decoder;

use crate::http;

pin_project! {
	/// A body that forwards frames unchanged while feeding a copy of every
	/// data frame through a decoder. The downstream consumer never waits on
	/// the observer: decoded items are handed to the callback synchronously
	/// on the same poll, and the frame is released regardless of what the
	/// decoder made of it.
	pub struct ObservedBody<D, F> {
		#[pin]
		body: http::Body,
		decoder: D,
		buffer: BytesMut,
		observer: F,
		finished: bool,
	}
}

/// Wrap `body` so that `observer` sees every item `decoder` can extract from
/// the byte stream, without delaying or altering the stream itself.
pub fn observe<D, F>(body: http::Body, decoder: D, observer: F) -> http::Body
where
	D: Decoder + Send + 'static,
	D::Error: Send + Into<axum_core::BoxError> + 'static,
	F: FnMut(D::Item) + Send + 'static,
{
	http::Body::new(ObservedBody {
		body,
		decoder,
		buffer: BytesMut::new(),
		observer,
		finished: false,
	})
}

impl<D, F> ObservedBody<D, F>
where
	D: Decoder,
	F: FnMut(D::Item),
{
	fn drain(
		finished: bool,
		buffer: &mut BytesMut,
		decoder: &mut D,
		observer: &mut F,
	) -> Result<(), D::Error> {
		loop {
			let decoded = if finished {
				decoder.decode_eof(buffer)
			} else {
				decoder.decode(buffer)
			};
			match decoded {
				Ok(Some(item)) => (observer)(item),
				Ok(None) => return Ok(()),
				Err(e) => return Err(e),
			}
		}
	}
}

impl<D, F> Body for ObservedBody<D, F>
where
	D: Decoder + Send + 'static,
	D::Error: Send + Into<axum_core::BoxError> + 'static,
	F: FnMut(D::Item) + Send + 'static,
{
	type Data = Bytes;
	type Error = http::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let mut this = self.project();
		if *this.finished {
			return Poll::Ready(None);
		}

		// Hand anything already buffered to the observer before touching the
		// inner body again.
		if let Err(e) = Self::drain(*this.finished, this.buffer, this.decoder, this.observer) {
			return Poll::Ready(Some(Err(http::Error::new(e))));
		}

		let frame = match ready!(this.body.as_mut().poll_frame(cx)) {
			Some(Ok(frame)) => {
				if let Some(data) = frame.data_ref() {
					this.buffer.extend_from_slice(data);
				}
				Some(Ok(frame))
			},
			Some(Err(e)) => return Poll::Ready(Some(Err(e))),
			None => {
				*this.finished = true;
				None
			},
		};

		match Self::drain(*this.finished, this.buffer, this.decoder, this.observer) {
			Ok(()) => Poll::Ready(frame),
			Err(e) => Poll::Ready(Some(Err(http::Error::new(e)))),
		}
	}
}
