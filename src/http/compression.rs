use async_compression::tokio::bufread::GzipDecoder;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Gzip member magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_gzip(body: &[u8]) -> bool {
	body.len() >= 2 && body[..2] == GZIP_MAGIC
}

/// Decode a fully buffered response body, sniffing the gzip magic rather than
/// trusting Content-Encoding. Upstreams have been observed to compress
/// without announcing it when the client sent Accept-Encoding.
pub async fn decode_if_gzip(body: &Bytes, limit: usize) -> anyhow::Result<Bytes> {
	if !is_gzip(body) {
		return Ok(body.clone());
	}
	let reader = GzipDecoder::new(BufReader::new(body.as_ref()));
	read_to_bytes(reader, limit).await
}

async fn read_to_bytes<R>(mut reader: R, limit: usize) -> anyhow::Result<Bytes>
where
	R: AsyncRead + Unpin,
{
	let mut buffer = bytes::BytesMut::new();
	loop {
		let n = reader.read_buf(&mut buffer).await?;
		if buffer.len() > limit {
			anyhow::bail!("decompressed body exceeded buffer size");
		}
		if n == 0 {
			break;
		}
	}
	Ok(buffer.freeze())
}
