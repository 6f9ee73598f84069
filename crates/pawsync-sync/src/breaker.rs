/// Yield check that suppresses removals when a scrape comes back abnormally
/// small. Evaluated fresh on every run.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreaker {
    ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Closed,
    Tripped { scraped: usize, expected: usize },
}

impl BreakerDecision {
    pub fn is_tripped(&self) -> bool {
        matches!(self, Self::Tripped { .. })
    }
}

impl CircuitBreaker {
    pub fn new(ratio: f64) -> Self {
        Self { ratio }
    }

    /// `expected` is the number of stored rows that were pending or
    /// available before this run.
    pub fn evaluate(&self, scraped: usize, expected: usize) -> BreakerDecision {
        if expected > 0 && (scraped as f64 / expected as f64) < self.ratio {
            BreakerDecision::Tripped { scraped, expected }
        } else {
            BreakerDecision::Closed
        }
    }

    pub fn diagnostic(&self, scraped: usize, expected: usize) -> String {
        format!(
            "circuit breaker: scraped {scraped} of {expected} expected (<{}%)",
            (self.ratio * 100.0).round() as u32
        )
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(0.30)
    }
}
