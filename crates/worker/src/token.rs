use tokio_util::sync::CancellationToken;

/// Hands out increasing generation numbers to one owner.
///
/// An actor tags each unit of restartable work (a connection attempt, a link, a retry timer) with
/// a fresh generation and drops any result whose generation is no longer current.
#[derive(Debug, Default)]
pub struct GenerationClock {
	last: u64,
}

impl GenerationClock {
	/// Creates a clock whose first generation is 1.
	pub fn new() -> Self {
		Self::default()
	}

	pub fn next(&mut self) -> u64 {
		self.last = self.last.wrapping_add(1);
		self.last
	}

	/// Starts a generation that in-flight work can also observe being cancelled.
	pub fn start(&mut self) -> GenerationToken {
		GenerationToken {
			generation: self.next(),
			cancel: CancellationToken::new(),
		}
	}
}

/// Cancellation shared between an owner and the task working for one generation.
#[derive(Debug, Clone)]
pub struct GenerationToken {
	generation: u64,
	cancel: CancellationToken,
}

impl GenerationToken {
	pub const fn generation(&self) -> u64 {
		self.generation
	}

	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	/// Resolves once any clone of this token is cancelled.
	pub async fn cancelled(&self) {
		self.cancel.cancelled().await;
	}
}
