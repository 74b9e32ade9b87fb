//! Annotation records, frame descriptions and the shared value types around them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Read principal that marks an annotation as world-readable.
pub const WORLD_READ_PRINCIPAL: &str = "group:__world__";

/// Selector type used by paginated documents to locate a chapter.
pub const EPUB_CONTENT_SELECTOR: &str = "EPUBContentSelector";

/// Session-local annotation identity.
///
/// Tags are assigned by the context that first sees an annotation and stay stable for the life of
/// that record, independent of the server-assigned [`AnnotationId`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub String);

impl Tag {
	pub fn new(tag: impl Into<String>) -> Self {
		Self(tag.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Tag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for Tag {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}

/// Server-assigned annotation identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationId(pub String);

impl AnnotationId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for AnnotationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for AnnotationId {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}

/// Identity of a guest frame.
///
/// `None` denotes the main frame, the one filling the host page. Named frames are usually
/// sub-frames or the content frame of a book reader.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub Option<String>);

impl FrameId {
	/// The id-less frame filling the host page.
	pub const fn main() -> Self {
		Self(None)
	}

	pub fn named(id: impl Into<String>) -> Self {
		Self(Some(id.into()))
	}

	pub const fn is_main(&self) -> bool {
		self.0.is_none()
	}
}

impl fmt::Display for FrameId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.0 {
			Some(id) => f.write_str(id),
			None => f.write_str("<main>"),
		}
	}
}

/// Display bucket an annotation is rendered in.
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	Serialize,
	Deserialize,
	strum_macros::EnumString,
	strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Cluster {
	/// Highlights created by the current user.
	UserHighlights,
	/// Annotations and notes created by the current user.
	UserAnnotations,
	/// Anything created by someone else.
	OtherContent,
}

/// A single selector inside a target. Opaque apart from its `type` and string fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector(pub Value);

impl Selector {
	/// Returns the selector's `type` field.
	pub fn kind(&self) -> Option<&str> {
		self.field("type")
	}

	/// Returns a string-valued field of the selector.
	pub fn field(&self, key: &str) -> Option<&str> {
		self.0.get(key).and_then(Value::as_str)
	}
}

/// A region of a document an annotation refers to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub selector: Option<Vec<Selector>>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl Target {
	/// Creates a target carrying the given selectors.
	pub fn with_selectors(source: impl Into<String>, selectors: Vec<Selector>) -> Self {
		Self {
			source: Some(source.into()),
			selector: Some(selectors),
			extra: Map::new(),
		}
	}
}

/// Access control lists of an annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
	#[serde(default)]
	pub read: Vec<String>,
	#[serde(default)]
	pub update: Vec<String>,
	#[serde(default)]
	pub delete: Vec<String>,
}

impl Permissions {
	/// Permissions that only let `user` see and change the annotation.
	pub fn private(user: &str) -> Self {
		Self {
			read: vec![user.to_string()],
			update: vec![user.to_string()],
			delete: vec![user.to_string()],
		}
	}

	/// Permissions sharing the annotation with every member of `group`.
	pub fn shared(user: &str, group: &str) -> Self {
		Self {
			read: vec![format!("group:{group}")],
			update: vec![user.to_string()],
			delete: vec![user.to_string()],
		}
	}
}

/// An annotation record.
///
/// Every field is optional so that a partial record (a server update, a guest's anchoring report)
/// can be told apart from an explicitly supplied value when merging. Fields prefixed with `$` on
/// the wire are local state that the server never sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<AnnotationId>,
	#[serde(rename = "$tag", default, skip_serializing_if = "Option::is_none")]
	pub tag: Option<Tag>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub uri: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub target: Option<Vec<Target>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub group: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub references: Option<Vec<AnnotationId>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub updated: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tags: Option<Vec<String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub permissions: Option<Permissions>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub hidden: Option<bool>,
	/// Set by a guest on a new highlight before it is saved.
	#[serde(rename = "$highlight", default, skip_serializing_if = "Option::is_none")]
	pub highlight: Option<bool>,
	/// Anchoring outcome. `None` while anchoring is still pending.
	#[serde(rename = "$orphan", default, skip_serializing_if = "Option::is_none")]
	pub orphan: Option<bool>,
	/// Set when the orphan flag was inferred from the anchoring timeout.
	#[serde(rename = "$anchorTimeout", default, skip_serializing_if = "Option::is_none")]
	pub anchor_timeout: Option<bool>,
	#[serde(rename = "$cluster", default, skip_serializing_if = "Option::is_none")]
	pub cluster: Option<Cluster>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl Annotation {
	/// Shorthand for a saved record carrying only an id and a document URI.
	pub fn saved(id: impl Into<String>, uri: impl Into<String>) -> Self {
		Self {
			id: Some(AnnotationId::new(id)),
			uri: Some(uri.into()),
			..Self::default()
		}
	}

	/// Copies every explicitly supplied field of `incoming` over `self`.
	///
	/// Absent fields never clear existing values, which keeps local state such as the tag,
	/// anchoring outcome and cluster intact unless the incoming record carries them.
	pub fn merge_from(&mut self, incoming: Annotation) {
		macro_rules! take {
			($($field:ident),* $(,)?) => {
				$(if incoming.$field.is_some() {
					self.$field = incoming.$field;
				})*
			};
		}
		take!(
			id,
			tag,
			uri,
			target,
			group,
			references,
			created,
			updated,
			user,
			text,
			tags,
			permissions,
			hidden,
			highlight,
			orphan,
			anchor_timeout,
			cluster,
		);
		self.extra.extend(incoming.extra);
	}

	/// True for replies: records with a non-empty parent chain.
	pub fn is_reply(&self) -> bool {
		self.references.as_ref().is_some_and(|refs| !refs.is_empty())
	}

	/// True if the first target carries at least one selector.
	pub fn has_selector(&self) -> bool {
		self.target
			.as_ref()
			.and_then(|targets| targets.first())
			.and_then(|target| target.selector.as_ref())
			.is_some_and(|selectors| !selectors.is_empty())
	}

	/// True for page notes: top-level records without a selector.
	pub fn is_page_note(&self) -> bool {
		!self.has_selector() && !self.is_reply()
	}

	/// True for highlights: unsaved records flagged by a guest, or saved top-level records
	/// without any content.
	pub fn is_highlight(&self) -> bool {
		if self.highlight == Some(true) {
			return true;
		}
		if self.is_page_note() || self.is_reply() || self.hidden == Some(true) {
			return false;
		}
		let no_text = self.text.as_deref().is_none_or(str::is_empty);
		let no_tags = self.tags.as_ref().is_none_or(Vec::is_empty);
		no_text && no_tags
	}

	/// True if the record is readable by everyone.
	pub fn is_public(&self) -> bool {
		self.permissions
			.as_ref()
			.is_some_and(|perms| perms.read.iter().any(|p| p == WORLD_READ_PRINCIPAL))
	}

	/// True for records the server has not yet stored.
	pub const fn is_new(&self) -> bool {
		self.id.is_none()
	}

	/// Returns the first EPUB content selector of the first target.
	pub fn epub_content_selector(&self) -> Option<&Selector> {
		self.target
			.as_ref()?
			.first()?
			.selector
			.as_ref()?
			.iter()
			.find(|s| s.kind() == Some(EPUB_CONTENT_SELECTOR))
	}

	/// Reduces the record to the shape guests are allowed to see.
	pub fn format(&self) -> FormattedAnnotation {
		FormattedAnnotation {
			tag: self.tag.clone(),
			cluster: self.cluster,
			target: self.target.clone().unwrap_or_default(),
			uri: self.uri.clone(),
		}
	}
}

/// Minimal annotation shape sent to guests.
///
/// Guests run alongside third-party content, so this carries only what is needed to identify
/// the annotation within the session and anchor it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedAnnotation {
	#[serde(rename = "$tag")]
	pub tag: Option<Tag>,
	#[serde(rename = "$cluster", default, skip_serializing_if = "Option::is_none")]
	pub cluster: Option<Cluster>,
	#[serde(default)]
	pub target: Vec<Target>,
	#[serde(default)]
	pub uri: Option<String>,
}

/// A `<link>` entry from document metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
	pub href: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rel: Option<String>,
	#[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
	pub kind: Option<String>,
}

impl Link {
	pub fn new(href: impl Into<String>) -> Self {
		Self {
			href: href.into(),
			..Self::default()
		}
	}
}

/// Metadata a guest extracts from its document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
	#[serde(default)]
	pub link: Vec<Link>,
	/// Content fingerprint, present for documents such as PDFs whose identity does not depend
	/// on the URL they were loaded from.
	#[serde(rename = "documentFingerprint", default, skip_serializing_if = "Option::is_none")]
	pub document_fingerprint: Option<String>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// Location of the segment (chapter) currently loaded in a guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cfi: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
}

/// Document description reported by a guest when it connects and after each navigation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
	pub uri: String,
	#[serde(default)]
	pub metadata: DocumentMetadata,
	#[serde(rename = "segmentInfo", default, skip_serializing_if = "Option::is_none")]
	pub segment_info: Option<SegmentInfo>,
	/// The guest survives content navigations and should not be torn down.
	#[serde(default)]
	pub persistent: bool,
}

/// Opaque content-provider banner data shown by guests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentInfo(pub Value);

/// Feature flag states keyed by flag name.
pub type FeatureFlags = BTreeMap<String, bool>;

/// Authenticated user profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
	#[serde(default)]
	pub userid: Option<String>,
	#[serde(default)]
	pub features: FeatureFlags,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// Severity of a toast notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastKind {
	Success,
	Error,
	Notice,
}

/// A notification surfaced by the host page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToastMessage {
	#[serde(rename = "type")]
	pub kind: ToastKind,
	pub message: String,
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use serde_json::json;

	use super::*;

	#[test]
	fn local_fields_use_dollar_prefix() {
		let ann = Annotation {
			id: Some("a1".into()),
			tag: Some("t1".into()),
			orphan: Some(false),
			cluster: Some(Cluster::UserHighlights),
			..Annotation::default()
		};
		let value = serde_json::to_value(&ann).unwrap();
		assert_eq!(
			value,
			json!({"id": "a1", "$tag": "t1", "$orphan": false, "$cluster": "user-highlights"})
		);
	}

	#[test]
	fn unknown_fields_survive_round_trip() {
		let raw = json!({"id": "a1", "links": {"html": "http://x"}, "flagged": true});
		let ann: Annotation = serde_json::from_value(raw.clone()).unwrap();
		assert_eq!(ann.extra.len(), 2);
		assert_eq!(serde_json::to_value(&ann).unwrap(), raw);
	}

	#[test]
	fn merge_keeps_local_state_unless_supplied() {
		let mut existing = Annotation {
			tag: Some("t1".into()),
			orphan: Some(false),
			cluster: Some(Cluster::OtherContent),
			text: Some("old".into()),
			..Annotation::default()
		};
		existing.merge_from(Annotation {
			id: Some("x".into()),
			text: Some("new".into()),
			..Annotation::default()
		});
		assert_eq!(existing.id, Some("x".into()));
		assert_eq!(existing.tag, Some("t1".into()));
		assert_eq!(existing.orphan, Some(false));
		assert_eq!(existing.text.as_deref(), Some("new"));

		existing.merge_from(Annotation {
			orphan: Some(true),
			..Annotation::default()
		});
		assert_eq!(existing.orphan, Some(true));
	}

	#[test]
	fn classification() {
		let selector = Selector(json!({"type": "TextQuoteSelector", "exact": "x"}));
		let mut ann = Annotation {
			target: Some(vec![Target::with_selectors("http://x", vec![selector])]),
			..Annotation::default()
		};
		assert!(ann.is_highlight());
		assert!(!ann.is_page_note());

		ann.text = Some("comment".into());
		assert!(!ann.is_highlight());

		ann.references = Some(vec!["parent".into()]);
		assert!(ann.is_reply());
		assert!(!ann.is_page_note());

		let note = Annotation {
			target: Some(vec![Target::default()]),
			..Annotation::default()
		};
		assert!(note.is_page_note());
		assert!(!note.is_highlight());
	}

	#[test]
	fn world_readable_is_public() {
		let mut ann = Annotation::saved("a", "http://x");
		assert!(!ann.is_public());
		ann.permissions = Some(Permissions::shared("acct:u@h", "__world__"));
		assert!(ann.is_public());
		ann.permissions = Some(Permissions::private("acct:u@h"));
		assert!(!ann.is_public());
	}

	#[test]
	fn format_strips_private_fields() {
		let ann = Annotation {
			id: Some("a1".into()),
			tag: Some("t3".into()),
			uri: Some("http://x".into()),
			text: Some("secret".into()),
			user: Some("acct:u@h".into()),
			..Annotation::default()
		};
		let formatted = serde_json::to_value(ann.format()).unwrap();
		assert_eq!(formatted, json!({"$tag": "t3", "target": [], "uri": "http://x"}));
	}

	#[test]
	fn document_info_wire_names() {
		let info: DocumentInfo = serde_json::from_value(json!({
			"uri": "http://b/ch1",
			"metadata": {"title": "Book", "link": [{"href": "urn:x"}], "documentFingerprint": "abc"},
			"segmentInfo": {"cfi": "/2/4", "url": "/ch1.xhtml"},
			"persistent": true,
		}))
		.unwrap();
		assert_eq!(info.metadata.document_fingerprint.as_deref(), Some("abc"));
		assert_eq!(info.metadata.link, vec![Link::new("urn:x")]);
		assert_eq!(info.segment_info.unwrap().cfi.as_deref(), Some("/2/4"));
		assert!(info.persistent);
	}

	#[test]
	fn frame_id_serializes_as_nullable_string() {
		assert_eq!(serde_json::to_value(FrameId::main()).unwrap(), Value::Null);
		assert_eq!(serde_json::to_value(FrameId::named("book")).unwrap(), json!("book"));
	}
}
