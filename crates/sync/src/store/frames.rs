//! Descriptors of connected guest frames as seen by the sidebar.

use margin_proto::{ContentInfo, DocumentInfo, DocumentMetadata, FrameId, SegmentInfo};

/// A guest frame that described its document.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
	pub id: FrameId,
	pub uri: String,
	pub metadata: DocumentMetadata,
	pub segment: Option<SegmentInfo>,
	pub persistent: bool,
	/// Set by whoever loads annotations for this frame's URIs once the fetch finished.
	pub is_annotation_fetch_complete: bool,
}

impl FrameInfo {
	pub fn new(id: FrameId, info: DocumentInfo) -> Self {
		Self {
			id,
			uri: info.uri,
			metadata: info.metadata,
			segment: info.segment_info,
			persistent: info.persistent,
			is_annotation_fetch_complete: false,
		}
	}

	/// URIs under which annotations for this frame's document may have been saved.
	///
	/// Always starts with the frame's own URI. `doi:` links are included for every document,
	/// other links only for documents with a content fingerprint.
	pub fn search_uris(&self) -> Vec<String> {
		let fingerprinted = self.metadata.document_fingerprint.is_some();
		let mut uris = vec![self.uri.clone()];
		for link in &self.metadata.link {
			if (fingerprinted || link.href.starts_with("doi:")) && !uris.contains(&link.href) {
				uris.push(link.href.clone());
			}
		}
		uris
	}
}

#[derive(Debug, Default)]
pub struct Frames {
	frames: Vec<FrameInfo>,
	content_info: Option<ContentInfo>,
}

impl Frames {
	/// Adds or replaces the frame with `frame.id`.
	///
	/// A replacement describing the same URI keeps the fetch status, since the annotations
	/// loaded for that URI are still valid.
	pub(crate) fn connect(&mut self, mut frame: FrameInfo) {
		if let Some(index) = self.frames.iter().position(|f| f.id == frame.id) {
			let previous = self.frames.remove(index);
			if previous.uri == frame.uri {
				frame.is_annotation_fetch_complete |= previous.is_annotation_fetch_complete;
			}
		}
		self.frames.push(frame);
	}

	pub(crate) fn destroy(&mut self, id: &FrameId) -> Option<FrameInfo> {
		let index = self.frames.iter().position(|f| &f.id == id)?;
		Some(self.frames.remove(index))
	}

	/// Marks the fetch for every frame showing `uri`.
	pub(crate) fn update_fetch_status(&mut self, uri: &str, complete: bool) {
		for frame in self.frames.iter_mut().filter(|f| f.uri == uri) {
			frame.is_annotation_fetch_complete = complete;
		}
	}

	pub(crate) fn set_content_info(&mut self, info: Option<ContentInfo>) {
		self.content_info = info;
	}

	pub fn all(&self) -> &[FrameInfo] {
		&self.frames
	}

	pub fn get(&self, id: &FrameId) -> Option<&FrameInfo> {
		self.frames.iter().find(|f| &f.id == id)
	}

	/// The frame filling the host page, if it is annotatable.
	pub fn main_frame(&self) -> Option<&FrameInfo> {
		self.frames.iter().find(|f| f.id.is_main())
	}

	/// The frame most likely showing the primary content: the main frame, else the first one.
	pub fn default_content_frame(&self) -> Option<&FrameInfo> {
		self.main_frame().or_else(|| self.frames.first())
	}

	/// Search URIs of every frame, deduplicated in connection order.
	pub fn search_uris(&self) -> Vec<String> {
		let mut uris: Vec<String> = Vec::new();
		for uri in self.frames.iter().flat_map(FrameInfo::search_uris) {
			if !uris.contains(&uri) {
				uris.push(uri);
			}
		}
		uris
	}

	/// True once at least one frame is connected and all of them finished loading annotations.
	pub fn all_fetches_complete(&self) -> bool {
		!self.frames.is_empty() && self.frames.iter().all(|f| f.is_annotation_fetch_complete)
	}

	pub fn content_info(&self) -> Option<&ContentInfo> {
		self.content_info.as_ref()
	}
}

#[cfg(test)]
mod tests {
	use margin_proto::Link;
	use pretty_assertions::assert_eq;

	use super::*;

	fn frame(id: FrameId, uri: &str) -> FrameInfo {
		FrameInfo::new(
			id,
			DocumentInfo {
				uri: uri.into(),
				..DocumentInfo::default()
			},
		)
	}

	#[test]
	fn fingerprint_widens_search_uris() {
		let mut f = frame(FrameId::main(), "http://x/doc.pdf");
		f.metadata.link = vec![
			Link::new("urn:x-pdf:abc"),
			Link::new("doi:10.1/xyz"),
			Link::new("http://x/doc.pdf"),
		];
		assert_eq!(f.search_uris(), vec!["http://x/doc.pdf", "doi:10.1/xyz"]);

		f.metadata.document_fingerprint = Some("abc".into());
		assert_eq!(
			f.search_uris(),
			vec!["http://x/doc.pdf", "urn:x-pdf:abc", "doi:10.1/xyz"]
		);
	}

	#[test]
	fn main_and_default_frames() {
		let mut frames = Frames::default();
		frames.connect(frame(FrameId::named("a"), "http://x/a"));
		assert_eq!(frames.main_frame(), None);
		assert_eq!(frames.default_content_frame().map(|f| f.uri.as_str()), Some("http://x/a"));

		frames.connect(frame(FrameId::main(), "http://x/main"));
		assert_eq!(frames.default_content_frame().map(|f| f.uri.as_str()), Some("http://x/main"));
		assert_eq!(frames.search_uris(), vec!["http://x/a", "http://x/main"]);
	}

	#[test]
	fn reconnect_keeps_fetch_status_for_same_uri() {
		let mut frames = Frames::default();
		frames.connect(frame(FrameId::named("book"), "http://b/ch1"));
		frames.update_fetch_status("http://b/ch1", true);
		assert!(frames.all_fetches_complete());

		frames.connect(frame(FrameId::named("book"), "http://b/ch1"));
		assert!(frames.all_fetches_complete());
		frames.connect(frame(FrameId::named("book"), "http://b/ch2"));
		assert!(!frames.all_fetches_complete());
		assert_eq!(frames.all().len(), 1);

		assert!(frames.destroy(&FrameId::named("book")).is_some());
		assert!(!frames.all_fetches_complete());
	}
}
