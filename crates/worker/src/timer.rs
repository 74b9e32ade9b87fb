use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Handle to one scheduled task.
#[derive(Debug, Clone)]
pub struct TimerHandle {
	cancel: CancellationToken,
}

impl TimerHandle {
	/// Prevents the task from running if it has not fired yet.
	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	/// True once cancelled, individually or through its set.
	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}
}

/// Delayed tasks owned by one component.
///
/// Every task is tied to the set: [`TimerSet::cancel_all`] or dropping the set prevents tasks that
/// have not fired from running, so a torn-down component never mutates state afterwards.
#[derive(Debug, Default)]
pub struct TimerSet {
	cancel: CancellationToken,
}

impl TimerSet {
	pub fn new() -> Self {
		Self::default()
	}

	/// Runs `task` after `delay` unless cancelled first.
	///
	/// Must be called from within a tokio runtime.
	pub fn schedule<F>(&self, name: &'static str, delay: Duration, task: F) -> TimerHandle
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let cancel = self.cancel.child_token();
		let handle = TimerHandle { cancel: cancel.clone() };
		tracing::trace!(timer = name, ?delay, "worker.schedule");
		tokio::spawn(async move {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => {
					tracing::trace!(timer = name, "worker.timer_cancelled");
				}
				_ = tokio::time::sleep(delay) => task.await,
			}
		});
		handle
	}

	/// Cancels every task scheduled so far. The set stays usable.
	pub fn cancel_all(&mut self) {
		self.cancel.cancel();
		self.cancel = CancellationToken::new();
	}
}

impl Drop for TimerSet {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

/// Restartable trailing deadline.
///
/// Designed for actor loops: [`Debounce::touch`] (re)arms the deadline and
/// [`Debounce::fired`] resolves once it passes without another touch.
///
/// ```ignore
/// tokio::select! {
///     _ = debounce.fired(), if debounce.is_armed() => flush(),
///     msg = rx.recv() => { buffer(msg); debounce.touch(); }
/// }
/// ```
#[derive(Debug)]
pub struct Debounce {
	window: Duration,
	deadline: Option<Instant>,
}

impl Debounce {
	pub fn new(window: Duration) -> Self {
		Self { window, deadline: None }
	}

	/// Arms the deadline, restarting it if already armed.
	pub fn touch(&mut self) {
		self.deadline = Some(Instant::now() + self.window);
	}

	pub fn is_armed(&self) -> bool {
		self.deadline.is_some()
	}

	/// Disarms without firing.
	pub fn cancel(&mut self) {
		self.deadline = None;
	}

	/// Resolves when the armed deadline passes and disarms. Pending forever while disarmed.
	///
	/// Cancel safe: dropping the future keeps the deadline armed.
	pub async fn fired(&mut self) {
		match self.deadline {
			Some(deadline) => {
				tokio::time::sleep_until(deadline).await;
				self.deadline = None;
			}
			None => std::future::pending().await,
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	fn counter_task(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
		let counter = counter.clone();
		async move {
			counter.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn scheduled_task_runs_after_delay() {
		let set = TimerSet::new();
		let fired = Arc::new(AtomicUsize::new(0));
		set.schedule("test", Duration::from_millis(100), counter_task(&fired));

		tokio::time::sleep(Duration::from_millis(99)).await;
		assert_eq!(fired.load(Ordering::SeqCst), 0);
		tokio::time::sleep(Duration::from_millis(2)).await;
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn cancelled_tasks_never_run() {
		let mut set = TimerSet::new();
		let fired = Arc::new(AtomicUsize::new(0));
		let single = set.schedule("single", Duration::from_millis(10), counter_task(&fired));
		single.cancel();
		set.schedule("bulk", Duration::from_millis(10), counter_task(&fired));
		set.cancel_all();
		set.schedule("after", Duration::from_millis(10), counter_task(&fired));

		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn dropping_the_set_cancels_tasks() {
		let set = TimerSet::new();
		let fired = Arc::new(AtomicUsize::new(0));
		let handle = set.schedule("dropped", Duration::from_millis(10), counter_task(&fired));
		drop(set);
		assert!(handle.is_cancelled());
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(fired.load(Ordering::SeqCst), 0);
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn debounce_restarts_on_touch() {
		let mut debounce = Debounce::new(Duration::from_millis(10));
		let start = Instant::now();
		debounce.touch();
		tokio::time::sleep(Duration::from_millis(6)).await;
		debounce.touch();
		debounce.fired().await;
		assert!(start.elapsed() >= Duration::from_millis(16));
		assert!(!debounce.is_armed());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn disarmed_debounce_never_fires() {
		let mut debounce = Debounce::new(Duration::from_millis(10));
		debounce.touch();
		debounce.cancel();
		let res = tokio::time::timeout(Duration::from_millis(50), debounce.fired()).await;
		assert!(res.is_err());
	}
}
