//! Messages exchanged with the server push endpoint.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::{Annotation, FeatureFlags};

/// Operation carried by an annotation change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NotificationAction {
	Create,
	Update,
	/// Older annotations replayed by the server on request.
	Past,
	Delete,
}

/// Profile payload of a session-change notification.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionModel {
	#[serde(default)]
	pub userid: Option<String>,
	#[serde(default)]
	pub features: FeatureFlags,
	#[serde(default)]
	pub groups: Vec<Value>,
}

/// A classified message received from the push endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
	AnnotationNotification {
		action: NotificationAction,
		payload: Vec<Annotation>,
	},
	SessionChange {
		model: SessionModel,
	},
	/// Reply to the identity check.
	WhoYouAre {
		userid: Option<String>,
	},
	/// Anything else. Carries the raw `type` for logging.
	Unsupported {
		kind: String,
	},
}

#[derive(Deserialize)]
struct NotificationOptions {
	action: NotificationAction,
}

#[derive(Deserialize)]
struct RawNotification {
	options: NotificationOptions,
	#[serde(default)]
	payload: Vec<Value>,
}

/// Decodes each payload record on its own so one bad record does not sink its neighbours.
fn decode_records(action: NotificationAction, records: Vec<Value>) -> Vec<Annotation> {
	records
		.into_iter()
		.enumerate()
		.filter_map(|(index, record)| match serde_json::from_value(record) {
			Ok(annotation) => Some(annotation),
			Err(error) => {
				tracing::warn!(?action, index, %error, "skipping malformed annotation record");
				None
			}
		})
		.collect()
}

#[derive(Deserialize)]
struct RawSessionChange {
	#[serde(default)]
	model: SessionModel,
}

#[derive(Deserialize)]
struct RawWhoYouAre {
	#[serde(default)]
	userid: Option<String>,
}

/// Returns true for JSON values that carry no message at all.
fn is_falsy(value: &Value) -> bool {
	match value {
		Value::Null => true,
		Value::Bool(b) => !b,
		Value::String(s) => s.is_empty(),
		Value::Number(n) => n.as_f64() == Some(0.0),
		Value::Array(_) | Value::Object(_) => false,
	}
}

impl ServerMessage {
	/// Decodes a text frame.
	///
	/// Returns `Ok(None)` for empty bodies (`null`, `false`, `""`), which servers send as
	/// keep-alives. Known message types with a malformed body are an error.
	pub fn decode(text: &str) -> Result<Option<Self>, serde_json::Error> {
		let value: Value = serde_json::from_str(text)?;
		Self::from_value(value)
	}

	/// Classifies an already parsed message.
	pub fn from_value(value: Value) -> Result<Option<Self>, serde_json::Error> {
		if is_falsy(&value) {
			return Ok(None);
		}
		let kind = value.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
		let msg = match kind.as_str() {
			"annotation-notification" => {
				let raw: RawNotification = serde_json::from_value(value)?;
				Self::AnnotationNotification {
					action: raw.options.action,
					payload: decode_records(raw.options.action, raw.payload),
				}
			}
			"session-change" => {
				let raw: RawSessionChange = serde_json::from_value(value)?;
				Self::SessionChange { model: raw.model }
			}
			"whoyouare" => {
				let raw: RawWhoYouAre = serde_json::from_value(value)?;
				Self::WhoYouAre { userid: raw.userid }
			}
			_ => Self::Unsupported { kind },
		};
		Ok(Some(msg))
	}
}

/// A message sent to the push endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMessage(Value);

impl ClientMessage {
	/// Identifies this client so the server can skip echoing its own changes back.
	pub fn client_id(id: &str) -> Self {
		Self(json!({"messageType": "client_id", "value": id}))
	}

	/// Asks the server which user the connection is authenticated as.
	pub fn whoami(request_id: u64) -> Self {
		Self(json!({"type": "whoami", "id": request_id}))
	}

	/// Installs a notification filter.
	pub fn filter(filter: &StreamFilter) -> Self {
		Self(json!({"filter": filter}))
	}

	pub fn from_value(value: Value) -> Self {
		Self(value)
	}

	pub fn as_value(&self) -> &Value {
		&self.0
	}

	pub fn to_text(&self) -> String {
		self.0.to_string()
	}
}

/// How filter clauses combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
	#[default]
	IncludeAny,
	IncludeAll,
	ExcludeAny,
	ExcludeAll,
}

/// Comparison applied by one filter clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
	Equals,
	OneOf,
	Matches,
}

/// A single field condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
	pub field: String,
	pub operator: FilterOperator,
	pub value: Value,
	pub case_sensitive: bool,
}

/// Which notification actions pass the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterActions {
	pub create: bool,
	pub update: bool,
	pub delete: bool,
}

impl Default for FilterActions {
	fn default() -> Self {
		Self {
			create: true,
			update: true,
			delete: true,
		}
	}
}

/// Server-side notification filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamFilter {
	pub match_policy: MatchPolicy,
	pub clauses: Vec<FilterClause>,
	pub actions: FilterActions,
}

impl StreamFilter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a case-insensitive clause.
	#[must_use]
	pub fn add_clause(mut self, field: &str, operator: FilterOperator, value: impl Into<Value>) -> Self {
		self.clauses.push(FilterClause {
			field: field.to_string(),
			operator,
			value: value.into(),
			case_sensitive: false,
		});
		self
	}

	/// Removes all clauses and restores the default policy and actions.
	pub fn reset(&mut self) {
		*self = Self::default();
	}

	/// Filter matching annotations on any of `uris`.
	pub fn for_uris<I, S>(uris: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let uris: Vec<Value> = uris.into_iter().map(|u| Value::String(u.into())).collect();
		Self::new().add_clause("/uri", FilterOperator::OneOf, uris)
	}

	/// Filter matching annotations in `group`.
	pub fn for_group(group: &str) -> Self {
		Self::new().add_clause("/group", FilterOperator::Equals, group)
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn decodes_notification() {
		let msg = ServerMessage::decode(
			r#"{"type":"annotation-notification","options":{"action":"delete"},"payload":[{"id":"a1"}]}"#,
		)
		.unwrap()
		.unwrap();
		assert_eq!(
			msg,
			ServerMessage::AnnotationNotification {
				action: NotificationAction::Delete,
				payload: vec![Annotation {
					id: Some("a1".into()),
					..Annotation::default()
				}],
			}
		);
	}

	#[test]
	fn malformed_record_is_skipped() {
		let msg = ServerMessage::decode(
			r#"{"type":"annotation-notification","options":{"action":"create"},
				"payload":[{"id":"a1","text":"kept"},{"id":"a2","tags":"not-a-list"}]}"#,
		)
		.unwrap()
		.unwrap();
		let ServerMessage::AnnotationNotification { action, payload } = msg else {
			panic!("expected a notification, got {msg:?}");
		};
		assert_eq!(action, NotificationAction::Create);
		assert_eq!(payload.len(), 1);
		assert_eq!(payload[0].id, Some("a1".into()));
	}

	#[test]
	fn falsy_bodies_are_ignored() {
		for text in ["null", "false", "\"\"", "0"] {
			assert_eq!(ServerMessage::decode(text).unwrap(), None, "{text}");
		}
	}

	#[test]
	fn unknown_type_is_unsupported() {
		let msg = ServerMessage::decode(r#"{"type":"ping"}"#).unwrap().unwrap();
		assert_eq!(msg, ServerMessage::Unsupported { kind: "ping".into() });
		let untyped = ServerMessage::decode("[1]").unwrap().unwrap();
		assert_eq!(untyped, ServerMessage::Unsupported { kind: String::new() });
	}

	#[test]
	fn malformed_known_type_is_error() {
		assert!(ServerMessage::decode(r#"{"type":"annotation-notification","options":{}}"#).is_err());
		assert!(ServerMessage::decode("{not json").is_err());
	}

	#[test]
	fn identity_messages() {
		assert_eq!(
			ClientMessage::client_id("abc").as_value(),
			&json!({"messageType": "client_id", "value": "abc"})
		);
		assert_eq!(ClientMessage::whoami(1).as_value(), &json!({"type": "whoami", "id": 1}));
	}

	#[test]
	fn uri_filter_document() {
		let filter = StreamFilter::for_uris(["http://x/1", "urn:x"]);
		assert_eq!(
			ClientMessage::filter(&filter).as_value(),
			&json!({"filter": {
				"match_policy": "include_any",
				"clauses": [{
					"field": "/uri",
					"operator": "one_of",
					"value": ["http://x/1", "urn:x"],
					"case_sensitive": false,
				}],
				"actions": {"create": true, "update": true, "delete": true},
			}})
		);
	}

	#[test]
	fn reset_clears_clauses() {
		let mut filter = StreamFilter::for_group("g1");
		filter.match_policy = MatchPolicy::IncludeAll;
		filter.reset();
		assert_eq!(filter, StreamFilter::default());
	}
}
