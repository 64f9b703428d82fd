use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use ::http::HeaderMap;
use bytes::Bytes;
use http_body_util::BodyExt;
use serde::Deserialize;
use tokio_sse_codec::{Event, Frame, SseDecoder};

use super::*;
use crate::http;

#[tokio::test]
async fn observer_sees_events_client_sees_bytes() {
	let msg1 = "data: msg1\n\n";
	let msg2 = "data: msg2\n\n";
	let trailers = HeaderMap::try_from(&HashMap::from([("k".to_string(), "v".to_string())])).unwrap();
	let body = http::Body::new(http_body_util::StreamBody::new(futures_util::stream::iter(
		vec![
			Ok::<_, Infallible>(http_body::Frame::data(Bytes::copy_from_slice(
				msg1.as_bytes(),
			))),
			Ok::<_, Infallible>(http_body::Frame::data(Bytes::copy_from_slice(
				msg2.as_bytes(),
			))),
			Ok::<_, Infallible>(http_body::Frame::trailers(trailers.clone())),
		],
	)));
	let decoder = SseDecoder::<Bytes>::new();

	let events = Arc::new(Mutex::new(vec![]));
	let ev_clone = events.clone();
	let body = passthrough::observe(body, decoder, move |o| match o {
		Frame::Event(Event::<Bytes> { data, .. }) => {
			events.clone().lock().unwrap().push(data);
		},
		Frame::Comment(_) | Frame::Retry(_) => {},
	});
	let got = body.collect().await.unwrap();
	assert_eq!(Some(&trailers), got.trailers());
	let got = got.to_bytes();
	assert_eq!(
		got,
		Bytes::copy_from_slice(format!("{msg1}{msg2}").as_bytes())
	);
	assert_eq!(
		ev_clone.lock().unwrap().clone(),
		vec![
			Bytes::copy_from_slice(b"msg1"),
			Bytes::copy_from_slice(b"msg2"),
		]
	);
}

#[derive(Clone, Eq, PartialEq, Debug, Deserialize)]
struct Chunk {
	n: u8,
}

#[tokio::test]
async fn json_events_with_done_sentinel() {
	let body = http::Body::from_stream(futures_util::stream::iter(vec![
		Ok::<_, std::io::Error>(Bytes::from_static(b"data: {\"n\": 1}\n\n")),
		// An event split mid-frame still decodes once the rest arrives.
		Ok::<_, std::io::Error>(Bytes::from_static(b"data: {\"n\"")),
		Ok::<_, std::io::Error>(Bytes::from_static(b": 2}\n\ndata: not json\n\n")),
		Ok::<_, std::io::Error>(Bytes::from_static(b"data: [DONE]\n\n")),
	]));

	let seen = Arc::new(Mutex::new(vec![]));
	let seen_clone = seen.clone();
	let body = sse::json_events::<Chunk>(body, move |ev| {
		let mut seen = seen.lock().unwrap();
		match ev {
			Some(Ok(c)) => seen.push(format!("chunk-{}", c.n)),
			Some(Err(_)) => seen.push("err".to_string()),
			None => seen.push("done".to_string()),
		}
	});
	let bytes = body.collect().await.unwrap().to_bytes();
	// Byte identity: the malformed event and the sentinel reach the client too.
	assert!(bytes.ends_with(b"data: [DONE]\n\n"));
	assert_eq!(
		seen_clone.lock().unwrap().clone(),
		vec!["chunk-1", "chunk-2", "err", "done"]
	);
}
