//! Transferable two-endpoint transport.
//!
//! A [`MessageChannel`] creates two entangled [`Port`]s. Whatever is posted on one end is
//! received on the other, in order. Ports are plain values and can themselves travel inside a
//! [`PortMessage`], which is how discovery hands a link's endpoints to the two contexts it joins.
//!
//! Messages posted before the receiving end starts reading are buffered, so a peer that is slow
//! to start listening never loses anything.

use serde_json::Value;
use tokio::sync::mpsc;

/// A message travelling over a port, optionally carrying further ports.
#[derive(Debug)]
pub struct PortMessage {
	/// Structured payload.
	pub data: Value,
	/// Ports transferred alongside the payload.
	pub ports: Vec<Port>,
}

impl PortMessage {
	/// Creates a message without transferred ports.
	pub fn new(data: Value) -> Self {
		Self { data, ports: Vec::new() }
	}
}

/// Sending half of a port. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PortSender {
	tx: mpsc::UnboundedSender<PortMessage>,
}

impl PortSender {
	/// Posts a payload to the entangled port.
	///
	/// Returns `false` if the other end has been dropped.
	pub fn post(&self, data: Value) -> bool {
		self.tx.send(PortMessage::new(data)).is_ok()
	}

	/// Posts a payload together with transferred ports.
	pub fn post_with_ports(&self, data: Value, ports: Vec<Port>) -> bool {
		self.tx.send(PortMessage { data, ports }).is_ok()
	}

	/// True once the entangled port has been dropped.
	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// Receiving half of a port.
#[derive(Debug)]
pub struct PortReceiver {
	rx: mpsc::UnboundedReceiver<PortMessage>,
}

impl PortReceiver {
	/// Waits for the next message. `None` once the other end is gone and the buffer is drained.
	pub async fn recv(&mut self) -> Option<PortMessage> {
		self.rx.recv().await
	}

	/// Returns a buffered message without waiting.
	pub fn try_recv(&mut self) -> Option<PortMessage> {
		self.rx.try_recv().ok()
	}
}

/// One endpoint of a [`MessageChannel`].
#[derive(Debug)]
pub struct Port {
	sender: PortSender,
	receiver: PortReceiver,
}

impl Port {
	/// Posts a payload to the entangled port.
	pub fn post(&self, data: Value) -> bool {
		self.sender.post(data)
	}

	/// Posts a payload together with transferred ports.
	pub fn post_with_ports(&self, data: Value, ports: Vec<Port>) -> bool {
		self.sender.post_with_ports(data, ports)
	}

	/// Waits for the next message from the entangled port.
	pub async fn recv(&mut self) -> Option<PortMessage> {
		self.receiver.recv().await
	}

	/// Returns a buffered message without waiting.
	pub fn try_recv(&mut self) -> Option<PortMessage> {
		self.receiver.try_recv()
	}

	/// Returns a clone of the sending half.
	pub fn sender(&self) -> PortSender {
		self.sender.clone()
	}

	/// Splits the port into its halves.
	pub fn into_split(self) -> (PortSender, PortReceiver) {
		(self.sender, self.receiver)
	}
}

/// Factory for entangled port pairs.
#[derive(Debug)]
pub struct MessageChannel;

impl MessageChannel {
	/// Creates two entangled ports.
	#[allow(clippy::new_ret_no_self, reason = "mirrors the platform constructor")]
	pub fn new() -> (Port, Port) {
		let (tx1, rx1) = mpsc::unbounded_channel();
		let (tx2, rx2) = mpsc::unbounded_channel();
		let port1 = Port {
			sender: PortSender { tx: tx2 },
			receiver: PortReceiver { rx: rx1 },
		};
		let port2 = Port {
			sender: PortSender { tx: tx1 },
			receiver: PortReceiver { rx: rx2 },
		};
		(port1, port2)
	}
}
