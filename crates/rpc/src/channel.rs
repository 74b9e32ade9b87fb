//! Typed call/event link between exactly two contexts.
//!
//! # Purpose
//!
//! A [`Channel`] binds one [`Port`] and speaks the frame-rpc protocol over it. The outgoing
//! contract `Out` and the incoming contract `In` are event enums, so each side of a link can only
//! send what its peer understands.
//!
//! # Mental model
//!
//! * `notify` is fire-and-forget, `call` resolves exactly once with the peer's reply, or with
//!   [`Error::Closed`] when the link goes away first. There is no timeout at this layer.
//! * Anything sent before [`Channel::connect`] is queued and flushed in order once a port is bound.
//! * Inbound traffic is delivered in order on the [`ChannelEvents`] stream returned by
//!   [`Channel::new`]. Additional observers may [`Channel::subscribe`] to the event payloads.
//! * Messages that are not frame-rpc traffic are surfaced as [`ChannelEvent::Foreign`]; this is
//!   how discovery offers travel over the host link.
//!
//! # Invariants
//!
//! - [`ChannelEvent::Closed`] is emitted at most once, whether the peer sent `close` or dropped
//!   its port.
//! - After [`Channel::destroy`] no further events are delivered and every pending call resolves
//!   with [`Error::Closed`].
//! - A malformed or unknown inbound message is logged and dropped; the pump keeps running.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::port::{Port, PortMessage, PortReceiver, PortSender};
use crate::protocol::{CounterIdGen, PROTOCOL, RpcFrame};

const SUBSCRIBER_CAPACITY: usize = 64;

/// Something that happened on a channel.
#[derive(Debug)]
pub enum ChannelEvent<In> {
	/// The peer bound its end.
	Connected,
	/// The peer sent an event. `reply` is present when the peer awaits an answer.
	Event {
		/// Decoded event.
		event: In,
		/// Reply slot for calls.
		reply: Option<Responder>,
	},
	/// A message that is not channel traffic.
	Foreign(PortMessage),
	/// The peer closed the link or went away.
	Closed,
}

/// Answers one inbound call. Dropping it leaves the caller waiting.
#[derive(Debug)]
pub struct Responder {
	sequence: u64,
	sender: PortSender,
}

impl Responder {
	/// Replies with a successful result.
	pub fn ok<T: Serialize>(self, value: &T) -> Result<()> {
		let value = serde_json::to_value(value)?;
		self.send(Ok(value));
		Ok(())
	}

	/// Replies with an error message.
	pub fn err(self, message: impl Into<String>) {
		self.send(Err(message.into()));
	}

	fn send(self, result: std::result::Result<Value, String>) {
		let frame = RpcFrame::Reply {
			response: self.sequence,
			result,
		};
		if !self.sender.post(frame.encode()) {
			tracing::trace!(sequence = self.sequence, "reply dropped, peer gone");
		}
	}
}

/// Ordered stream of inbound channel events.
#[derive(Debug)]
pub struct ChannelEvents<In> {
	rx: mpsc::UnboundedReceiver<ChannelEvent<In>>,
}

impl<In> ChannelEvents<In> {
	/// Waits for the next event. `None` once the channel is gone.
	pub async fn recv(&mut self) -> Option<ChannelEvent<In>> {
		self.rx.recv().await
	}

	/// Returns a buffered event without waiting.
	pub fn try_recv(&mut self) -> Option<ChannelEvent<In>> {
		self.rx.try_recv().ok()
	}
}

#[derive(Default)]
struct State {
	sender: Option<PortSender>,
	queued: Vec<Value>,
	pending: HashMap<u64, oneshot::Sender<Result<Value>>>,
	ids: CounterIdGen,
	destroyed: bool,
	close_emitted: bool,
}

struct Shared<In> {
	state: Mutex<State>,
	events: mpsc::UnboundedSender<ChannelEvent<In>>,
	subscribers: broadcast::Sender<In>,
	cancel: CancellationToken,
}

impl<In> Shared<In> {
	fn destroy(&self) {
		let sender = {
			let mut state = self.state.lock();
			if state.destroyed {
				return;
			}
			state.destroyed = true;
			state.queued.clear();
			state.pending.clear();
			state.sender.take()
		};
		if let Some(sender) = sender {
			sender.post(RpcFrame::Close.encode());
		}
		self.cancel.cancel();
	}

	fn mark_closed(&self) {
		let first = {
			let mut state = self.state.lock();
			let first = !state.close_emitted;
			state.close_emitted = true;
			state.pending.clear();
			first
		};
		if first {
			let _ = self.events.send(ChannelEvent::Closed);
		}
	}
}

impl<In> Drop for Shared<In> {
	fn drop(&mut self) {
		self.destroy();
	}
}

impl<In: DeserializeOwned + Clone> Shared<In> {
	fn dispatch(&self, msg: PortMessage) {
		let Some(frame) = RpcFrame::decode(&msg.data) else {
			if msg.data.get("protocol").and_then(Value::as_str) == Some(PROTOCOL) {
				tracing::warn!("dropping malformed channel message");
			} else {
				let _ = self.events.send(ChannelEvent::Foreign(msg));
			}
			return;
		};

		match frame {
			RpcFrame::Connect => {
				let _ = self.events.send(ChannelEvent::Connected);
			}
			RpcFrame::Close => self.mark_closed(),
			RpcFrame::Reply { response, result } => {
				let waiter = self.state.lock().pending.remove(&response);
				match waiter {
					Some(tx) => {
						let _ = tx.send(result.map_err(Error::Remote));
					}
					None => tracing::trace!(response, "reply for unknown call"),
				}
			}
			RpcFrame::Call { sequence, body } => {
				let method = body.get("method").and_then(Value::as_str).unwrap_or_default().to_string();
				let event = match serde_json::from_value::<In>(body) {
					Ok(event) => event,
					Err(error) => {
						tracing::warn!(%method, %error, "dropping unrecognized channel event");
						return;
					}
				};
				tracing::trace!(%method, ?sequence, "channel event");
				let _ = self.subscribers.send(event.clone());
				let reply = sequence.and_then(|sequence| {
					let sender = self.state.lock().sender.clone()?;
					Some(Responder { sequence, sender })
				});
				let _ = self.events.send(ChannelEvent::Event { event, reply });
			}
		}
	}
}

async fn pump<In: DeserializeOwned + Clone>(
	shared: Weak<Shared<In>>,
	cancel: CancellationToken,
	mut receiver: PortReceiver,
) {
	loop {
		let msg = tokio::select! {
			biased;
			_ = cancel.cancelled() => return,
			msg = receiver.recv() => msg,
		};
		let Some(shared) = shared.upgrade() else {
			return;
		};
		match msg {
			Some(msg) => shared.dispatch(msg),
			None => {
				shared.mark_closed();
				return;
			}
		}
	}
}

/// A typed link to one peer context.
///
/// Cloning yields another handle to the same link. The link is destroyed when
/// [`Channel::destroy`] is called or the last handle is dropped.
pub struct Channel<Out, In> {
	shared: Arc<Shared<In>>,
	_out: PhantomData<fn(Out)>,
}

impl<Out, In> Clone for Channel<Out, In> {
	fn clone(&self) -> Self {
		Self {
			shared: self.shared.clone(),
			_out: PhantomData,
		}
	}
}

impl<Out, In> std::fmt::Debug for Channel<Out, In> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.shared.state.lock();
		f.debug_struct("Channel")
			.field("connected", &state.sender.is_some())
			.field("destroyed", &state.destroyed)
			.field("pending", &state.pending.len())
			.finish()
	}
}

impl<Out, In> Channel<Out, In>
where
	Out: Serialize,
	In: DeserializeOwned + Clone + Send + 'static,
{
	/// Creates an unbound channel and the stream its inbound events arrive on.
	pub fn new() -> (Self, ChannelEvents<In>) {
		let (events, rx) = mpsc::unbounded_channel();
		let (subscribers, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
		let shared = Arc::new(Shared {
			state: Mutex::new(State::default()),
			events,
			subscribers,
			cancel: CancellationToken::new(),
		});
		let channel = Self {
			shared,
			_out: PhantomData,
		};
		(channel, ChannelEvents { rx })
	}

	/// Binds the channel to a port, announces it to the peer and flushes queued messages.
	///
	/// Must be called from within a tokio runtime.
	pub fn connect(&self, port: Port) -> Result<()> {
		let (sender, receiver) = port.into_split();
		{
			let mut state = self.shared.state.lock();
			if state.destroyed {
				return Err(Error::Closed);
			}
			if state.sender.is_some() {
				return Err(Error::AlreadyConnected);
			}
			sender.post(RpcFrame::Connect.encode());
			for frame in state.queued.drain(..) {
				sender.post(frame);
			}
			state.sender = Some(sender);
		}
		tokio::spawn(pump(Arc::downgrade(&self.shared), self.shared.cancel.clone(), receiver));
		Ok(())
	}

	/// Sends an event without waiting for a reply.
	pub fn notify(&self, event: &Out) -> Result<()> {
		let body = serde_json::to_value(event)?;
		let frame = RpcFrame::Call { sequence: None, body }.encode();
		let mut guard = self.shared.state.lock();
		let state = &mut *guard;
		if state.destroyed {
			return Err(Error::Closed);
		}
		match &state.sender {
			Some(sender) => {
				if sender.post(frame) {
					Ok(())
				} else {
					Err(Error::Closed)
				}
			}
			None => {
				state.queued.push(frame);
				Ok(())
			}
		}
	}

	/// Sends an event and waits for the peer's reply.
	pub async fn call<R: DeserializeOwned>(&self, event: &Out) -> Result<R> {
		let body = serde_json::to_value(event)?;
		let rx = {
			let mut guard = self.shared.state.lock();
			let state = &mut *guard;
			if state.destroyed {
				return Err(Error::Closed);
			}
			let sequence = state.ids.next();
			let frame = RpcFrame::Call {
				sequence: Some(sequence),
				body,
			}
			.encode();
			let (tx, rx) = oneshot::channel();
			state.pending.insert(sequence, tx);
			match &state.sender {
				Some(sender) => {
					if !sender.post(frame) {
						state.pending.remove(&sequence);
						return Err(Error::Closed);
					}
				}
				None => state.queued.push(frame),
			}
			rx
		};
		let value = rx.await.map_err(|_| Error::Closed)??;
		Ok(serde_json::from_value(value)?)
	}

	/// Observes inbound event payloads alongside the primary event stream.
	pub fn subscribe(&self) -> broadcast::Receiver<In> {
		self.shared.subscribers.subscribe()
	}

	/// Tells the peer the link is closing, releases the port and fails pending calls. Idempotent.
	pub fn destroy(&self) {
		self.shared.destroy();
	}

	/// True once a port is bound and the channel has not been destroyed.
	pub fn is_connected(&self) -> bool {
		let state = self.shared.state.lock();
		state.sender.is_some() && !state.destroyed
	}

	/// True after [`Channel::destroy`].
	pub fn is_destroyed(&self) -> bool {
		self.shared.state.lock().destroyed
	}
}

#[cfg(test)]
mod tests;
