//! Consecutive-failure breaker for the downstream analytics sink.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    pub threshold: u32,
    pub cooldown_ms: u64,
    opened_at_ms: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown_ms: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            threshold: threshold.max(1),
            cooldown_ms,
            opened_at_ms: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self, now_ms: u64) {
        self.failures += 1;
        if self.state == CircuitState::HalfOpen || self.failures >= self.threshold {
            self.state = CircuitState::Open;
            self.opened_at_ms = now_ms;
        }
    }

    /// An open breaker lets a single probe through once the cooldown has passed.
    pub fn allow(&mut self, now_ms: u64) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                if now_ms.saturating_sub(self.opened_at_ms) >= self.cooldown_ms {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_opens_on_threshold() {
        let mut cb = CircuitBreaker::new(3, 1_000);
        assert!(cb.allow(0));
        cb.record_failure(0);
        cb.record_failure(0);
        assert!(cb.allow(0));
        cb.record_failure(0);
        assert!(!cb.allow(10));
        assert_eq!(cb.state, CircuitState::Open);
    }

    #[test]
    fn test_circuit_resets_on_success() {
        let mut cb = CircuitBreaker::new(2, 1_000);
        cb.record_failure(0);
        cb.record_failure(0);
        assert!(!cb.allow(0));
        cb.record_success();
        assert!(cb.allow(0));
        assert_eq!(cb.state, CircuitState::Closed);
    }

    #[test]
    fn test_half_open_single_probe() {
        let mut cb = CircuitBreaker::new(1, 100);
        cb.record_failure(50);
        assert!(!cb.allow(149));
        assert!(cb.allow(150));
        assert_eq!(cb.state, CircuitState::HalfOpen);
        assert!(!cb.allow(151));
        cb.record_failure(160);
        assert_eq!(cb.state, CircuitState::Open);
        assert!(!cb.allow(200));
        assert!(cb.allow(260));
        cb.record_success();
        assert!(cb.allow(261));
    }
}
