//! Bounded-retry bookkeeping.
//!
//! Retries are modeled as an explicit attempt counter with a terminal
//! exhausted state, not as exception-driven looping.

/// Counts attempts against a fixed budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    made: u32,
    max_attempts: u32,
}

impl RetryBudget {
    /// A budget allowing up to `max_attempts` attempts (minimum 1).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            made: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Record the start of an attempt. Returns false once the budget is spent.
    pub fn start_attempt(&mut self) -> bool {
        if self.made >= self.max_attempts {
            return false;
        }
        self.made += 1;
        true
    }

    /// Restore the full budget, forgetting prior attempts.
    pub fn reset(&mut self) {
        self.made = 0;
    }

    pub fn attempts_made(&self) -> u32 {
        self.made
    }

    pub fn exhausted(&self) -> bool {
        self.made >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_exactly_max_attempts() {
        let mut budget = RetryBudget::new(3);
        assert!(budget.start_attempt());
        assert!(budget.start_attempt());
        assert!(budget.start_attempt());
        assert!(!budget.start_attempt());
        assert_eq!(budget.attempts_made(), 3);
        assert!(budget.exhausted());
    }

    #[test]
    fn reset_restores_full_budget() {
        let mut budget = RetryBudget::new(2);
        assert!(budget.start_attempt());
        assert!(budget.start_attempt());
        assert!(budget.exhausted());

        budget.reset();
        assert!(!budget.exhausted());
        assert!(budget.start_attempt());
        assert_eq!(budget.attempts_made(), 1);
    }

    #[test]
    fn zero_budget_still_allows_one_attempt() {
        let mut budget = RetryBudget::new(0);
        assert!(budget.start_attempt());
        assert!(!budget.start_attempt());
    }
}
