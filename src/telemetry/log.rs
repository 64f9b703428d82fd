use std::sync::Arc;

use parking_lot::Mutex;

use crate::llm::ResponseMetadata;

/// Shared slot for the metadata a response accumulates after the handler has
/// already returned. The handler seeds it, the vendor stream observer merges
/// usage into it frame by frame on the response body's own polls, and the
/// completion hook drains it exactly once when the body finishes or the
/// client disconnects. Vendor events that arrive after the drain find the
/// slot empty and change nothing, so a torn-down request can never produce a
/// second record.
#[derive(Clone, Default)]
pub struct MetadataLog(Arc<Mutex<Option<ResponseMetadata>>>);

impl MetadataLog {
	/// Seed the slot before the observer is attached to the body.
	pub fn set(&self, meta: ResponseMetadata) {
		*self.0.lock() = Some(meta);
	}

	/// Fold a vendor event into the accumulated metadata. A slot that was
	/// never seeded, or was already drained, is left empty.
	pub fn merge(&self, f: impl FnOnce(&mut ResponseMetadata)) {
		if let Some(meta) = self.0.lock().as_mut() {
			f(meta);
		}
	}

	/// Drain the final state; at most one caller gets it.
	pub fn take(&self) -> Option<ResponseMetadata> {
		self.0.lock().take()
	}
}
