use std::time::Duration;

/// Linear reconnect backoff with a ceiling and an attempt cap.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }
}

/// Attempt counter for one controller. Reset once a session is established.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// Consume one attempt. `None` once the cap is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }
        self.attempts += 1;
        Some(self.policy.delay_for(self.attempts))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        matches!(self.policy.max_attempts, Some(max) if self.attempts >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_grows_then_gives_up() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        let delays: Vec<_> = std::iter::from_fn(|| state.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15),
                Duration::from_secs(20),
                Duration::from_secs(25),
            ]
        );
        assert!(state.exhausted());
        assert_eq!(state.next_delay(), None);
    }

    #[test]
    fn delays_never_decrease_and_respect_ceiling() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(700),
            max_delay: Duration::from_secs(3),
            max_attempts: None,
        };
        let mut state = ReconnectState::new(policy);
        let mut last = Duration::ZERO;
        for _ in 0..50 {
            let delay = state.next_delay().unwrap();
            assert!(delay >= last);
            assert!(delay <= Duration::from_secs(3));
            last = delay;
        }
        assert_eq!(last, Duration::from_secs(3));
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        state.next_delay();
        state.next_delay();
        state.reset();
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.next_delay(), Some(Duration::from_secs(5)));
    }
}
