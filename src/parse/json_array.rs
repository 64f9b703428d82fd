use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Incremental decoder for a streamed JSON array of objects, the framing the
/// Gemini `:streamGenerateContent` endpoint uses. Yields each balanced
/// top-level `{...}` as its own item; the surrounding `[`, `]`, commas and
/// whitespace are structural and skipped.
pub struct JsonArrayDecoder {
	max_size: usize,
	scanned: usize,
	depth: usize,
	in_string: bool,
	escaped: bool,
	start: Option<usize>,
}

impl JsonArrayDecoder {
	pub fn new(max_size: usize) -> Self {
		Self {
			max_size,
			scanned: 0,
			depth: 0,
			in_string: false,
			escaped: false,
			start: None,
		}
	}
}

impl Decoder for JsonArrayDecoder {
	type Item = Bytes;
	type Error = std::io::Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
		while self.scanned < src.len() {
			let b = src[self.scanned];
			if self.in_string {
				if self.escaped {
					self.escaped = false;
				} else if b == b'\\' {
					self.escaped = true;
				} else if b == b'"' {
					self.in_string = false;
				}
			} else {
				match b {
					b'"' if self.depth > 0 => self.in_string = true,
					b'{' => {
						if self.depth == 0 {
							self.start = Some(self.scanned);
						}
						self.depth += 1;
					},
					b'}' if self.depth > 0 => {
						self.depth -= 1;
						if self.depth == 0 {
							let start = self.start.take().expect("object start recorded");
							let end = self.scanned + 1;
							let chunk = src.split_to(end).freeze();
							self.scanned = 0;
							return Ok(Some(chunk.slice(start..end)));
						}
					},
					_ => {},
				}
			}
			self.scanned += 1;
		}

		if self.start.is_none() && self.depth == 0 && self.scanned > 0 {
			// Nothing pending; drop the structural bytes we already scanned.
			src.advance(self.scanned);
			self.scanned = 0;
		}
		if src.len() > self.max_size {
			return Err(std::io::Error::other("json array element exceeds maximum size"));
		}
		Ok(None)
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
		// A truncated trailing object is unrecoverable; callers treat missing
		// totals as zero.
		self.decode(src)
	}
}
