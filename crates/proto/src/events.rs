//! Typed event contracts spoken over each kind of channel.
//!
//! Every enum serializes as `{"method": <name>, "arguments": <payload>}`. Method names are part
//! of the contract and are available for logging through `<&'static str>::from(&event)`.

use serde::{Deserialize, Serialize};

use crate::types::{
	Annotation, ContentInfo, DocumentInfo, FeatureFlags, FormattedAnnotation, Tag, ToastMessage,
};

/// Events a guest sends to the sidebar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum_macros::IntoStaticStr)]
#[serde(tag = "method", content = "arguments", rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum GuestToSidebar {
	/// The guest loaded (or navigated to) a document.
	DocumentInfoChanged(DocumentInfo),
	/// The user created a highlight or annotation in the document.
	CreateAnnotation(Annotation),
	/// Anchoring finished for one annotation. Carries `$tag` and `$orphan`, and `id` if known.
	SyncAnchoringStatus(Annotation),
	ShowAnnotations { tags: Vec<Tag>, focus: bool },
	HoverAnnotations(Vec<Tag>),
	ToggleAnnotationSelection(Vec<Tag>),
	/// The guest is going away.
	Close,
}

/// Events the sidebar sends to a guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum_macros::IntoStaticStr)]
#[serde(tag = "method", content = "arguments", rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SidebarToGuest {
	LoadAnnotations(Vec<FormattedAnnotation>),
	DeleteAnnotation(Tag),
	HoverAnnotations(Vec<Tag>),
	SetHighlightsVisible(bool),
	/// Load the segment containing the annotation.
	NavigateToSegment(FormattedAnnotation),
	ScrollToAnnotation(Tag),
	FeatureFlagsUpdated(FeatureFlags),
	ShowContentInfo(ContentInfo),
}

/// Events the host sends to the sidebar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum_macros::IntoStaticStr)]
#[serde(tag = "method", content = "arguments", rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum HostToSidebar {
	SidebarOpened,
	SetHighlightsVisible(bool),
}

/// Events the sidebar sends to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum_macros::IntoStaticStr)]
#[serde(tag = "method", content = "arguments", rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SidebarToHost {
	OpenSidebar,
	CloseSidebar,
	/// Ask the host to turn highlights on, after a highlight was created while they were hidden.
	ShowHighlights,
	PublicAnnotationCountChanged(usize),
	ToastMessagePushed(ToastMessage),
	FeatureFlagsUpdated(FeatureFlags),
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use serde_json::json;

	use super::*;

	#[test]
	fn method_and_arguments_envelope() {
		let event = SidebarToGuest::DeleteAnnotation("t4".into());
		assert_eq!(
			serde_json::to_value(&event).unwrap(),
			json!({"method": "deleteAnnotation", "arguments": "t4"})
		);
		assert_eq!(<&'static str>::from(&event), "deleteAnnotation");
	}

	#[test]
	fn struct_arguments_decode() {
		let event: GuestToSidebar = serde_json::from_value(json!({
			"method": "showAnnotations",
			"arguments": {"tags": ["t1", "t2"], "focus": true},
		}))
		.unwrap();
		assert_eq!(
			event,
			GuestToSidebar::ShowAnnotations {
				tags: vec!["t1".into(), "t2".into()],
				focus: true,
			}
		);
	}

	#[test]
	fn unit_methods_need_no_arguments() {
		let event: HostToSidebar = serde_json::from_value(json!({"method": "sidebarOpened"})).unwrap();
		assert_eq!(event, HostToSidebar::SidebarOpened);
		let close: GuestToSidebar = serde_json::from_value(json!({"method": "close"})).unwrap();
		assert_eq!(close, GuestToSidebar::Close);
	}

	#[test]
	fn unknown_method_is_rejected() {
		let res = serde_json::from_value::<GuestToSidebar>(json!({"method": "eval", "arguments": "x"}));
		assert!(res.is_err());
	}
}
