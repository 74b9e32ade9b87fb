use std::time::Duration;

/// Highest exponent applied to the base delay.
const MAX_EXPONENT: u32 = 20;

/// Exponential reconnect backoff with a fixed retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
	/// Delay unit; retry `n` waits `base * 2^n`.
	pub base: Duration,
	/// Retries allowed before giving up.
	pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			base: Duration::from_secs(1),
			max_attempts: 10,
		}
	}
}

impl ReconnectPolicy {
	/// Delay before retry number `attempt` (counting from 1), or `None` once the budget is spent.
	pub fn delay(&self, attempt: u32) -> Option<Duration> {
		if attempt == 0 || attempt > self.max_attempts {
			return None;
		}
		let factor = 1u32 << attempt.min(MAX_EXPONENT);
		Some(self.base.saturating_mul(factor))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn doubles_from_first_attempt() {
		let policy = ReconnectPolicy::default();
		assert_eq!(policy.delay(1), Some(Duration::from_secs(2)));
		assert_eq!(policy.delay(2), Some(Duration::from_secs(4)));
		assert_eq!(policy.delay(10), Some(Duration::from_secs(1024)));
	}

	#[test]
	fn budget_is_finite() {
		let policy = ReconnectPolicy {
			base: Duration::from_millis(10),
			max_attempts: 3,
		};
		assert!(policy.delay(3).is_some());
		assert_eq!(policy.delay(4), None);
		assert_eq!(policy.delay(0), None);
	}

	#[test]
	fn delays_never_decrease() {
		let policy = ReconnectPolicy {
			base: Duration::from_secs(3600),
			max_attempts: 40,
		};
		let delays: Vec<_> = (1..=40).filter_map(|n| policy.delay(n)).collect();
		assert_eq!(delays.len(), 40);
		assert!(delays.windows(2).all(|w| w[0] <= w[1]));
	}
}
