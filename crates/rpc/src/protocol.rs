//! The frame-rpc wire envelope.
//!
//! Every message on a channel port is a JSON object carrying `protocol` and `version` markers
//! next to the frame fields:
//!
//! | Frame | Fields |
//! |---|---|
//! | call / notification | `method`, `arguments`, optional `sequence` when a reply is wanted |
//! | reply | `response` (the call's sequence), `arguments: [error, result]` |
//! | connect / close | `method: "connect"` / `method: "close"` |
//!
//! Anything that fails these checks is not a channel message.

use serde_json::{Map, Value, json};

/// Protocol marker carried by every channel message.
pub const PROTOCOL: &str = "frame-rpc";
/// Protocol version carried by every channel message.
pub const VERSION: &str = "1.0.0";

const CONNECT_METHOD: &str = "connect";
const CLOSE_METHOD: &str = "close";

/// Simple counter-based ID generator for call sequences.
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterIdGen(pub u64);

impl CounterIdGen {
	/// Creates a new counter starting at 0.
	#[must_use]
	pub const fn new() -> Self {
		Self(0)
	}

	/// Generates the next unique ID and increments the counter.
	#[allow(clippy::should_implement_trait, reason = "convention")]
	pub fn next(&mut self) -> u64 {
		let id = self.0;
		self.0 += 1;
		id
	}
}

/// A decoded channel frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcFrame {
	/// The sender bound its end of the link.
	Connect,
	/// The sender is going away. Delivered to the peer's handler at most once.
	Close,
	/// An event. `body` holds `method` and `arguments`.
	Call {
		/// Present when the sender awaits a reply.
		sequence: Option<u64>,
		/// The typed event as `{method, arguments}`.
		body: Value,
	},
	/// Reply to an earlier call.
	Reply {
		/// Sequence of the call being answered.
		response: u64,
		/// Handler outcome.
		result: Result<Value, String>,
	},
}

fn envelope() -> Map<String, Value> {
	let mut map = Map::new();
	map.insert("protocol".into(), json!(PROTOCOL));
	map.insert("version".into(), json!(VERSION));
	map
}

impl RpcFrame {
	/// Encodes the frame with its envelope markers.
	pub fn encode(&self) -> Value {
		let mut map = envelope();
		match self {
			Self::Connect => {
				map.insert("method".into(), json!(CONNECT_METHOD));
				map.insert("arguments".into(), json!([]));
			}
			Self::Close => {
				map.insert("method".into(), json!(CLOSE_METHOD));
				map.insert("arguments".into(), json!([]));
			}
			Self::Call { sequence, body } => {
				if let Value::Object(fields) = body {
					map.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
				}
				if let Some(seq) = sequence {
					map.insert("sequence".into(), json!(seq));
				}
			}
			Self::Reply { response, result } => {
				map.insert("response".into(), json!(response));
				let arguments = match result {
					Ok(value) => json!([null, value]),
					Err(message) => json!([message, null]),
				};
				map.insert("arguments".into(), arguments);
			}
		}
		Value::Object(map)
	}

	/// Decodes a frame. Returns `None` for anything that is not a well-formed channel message.
	pub fn decode(value: &Value) -> Option<Self> {
		let obj = value.as_object()?;
		if obj.get("protocol")?.as_str()? != PROTOCOL || obj.get("version")?.as_str()? != VERSION {
			return None;
		}

		if let Some(response) = obj.get("response") {
			let response = response.as_u64()?;
			let args = obj.get("arguments")?.as_array()?;
			let result = match args.first() {
				None | Some(Value::Null) => Ok(args.get(1).cloned().unwrap_or(Value::Null)),
				Some(Value::String(err)) => Err(err.clone()),
				Some(other) => Err(other.to_string()),
			};
			return Some(Self::Reply { response, result });
		}

		let method = obj.get("method")?.as_str()?;
		match method {
			CONNECT_METHOD => Some(Self::Connect),
			CLOSE_METHOD => Some(Self::Close),
			_ => {
				let sequence = match obj.get("sequence") {
					None | Some(Value::Null) => None,
					Some(seq) => Some(seq.as_u64()?),
				};
				let mut body = Map::new();
				body.insert("method".into(), json!(method));
				if let Some(arguments) = obj.get("arguments") {
					body.insert("arguments".into(), arguments.clone());
				}
				Some(Self::Call {
					sequence,
					body: Value::Object(body),
				})
			}
		}
	}
}
