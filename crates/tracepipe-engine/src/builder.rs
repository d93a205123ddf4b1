use std::time::Duration;

use tracepipe_types::CdcRecord;

use crate::Error;

// NOTE: Builders never throw to the pool. Every failure mode comes back as
// a classified outcome; the retry policy is a pure function of that outcome
// and the attempt count, which keeps the worker loop free of error-type
// matching and makes the policy testable in isolation.

/// Result of applying one CDC record to a derived store
#[derive(Debug)]
pub enum BuildOutcome {
    /// State changed
    Applied,
    /// Nothing to do (already applied, or the event type is not relevant)
    Skipped,
    /// Worth retrying: I/O timeout, lock contention, batch not yet readable
    Transient(Error),
    /// Never going to work: schema violation, unrepairable reference
    Permanent(Error),
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Applied | BuildOutcome::Skipped)
    }

    /// Classify an engine error into the matching outcome
    pub fn from_error(err: Error) -> Self {
        match &err {
            Error::Store(tracepipe_store::Error::Database(_))
            | Error::Store(tracepipe_store::Error::Io(_))
            | Error::Referential(_) => BuildOutcome::Transient(err),
            Error::Store(_) | Error::Types(_) => BuildOutcome::Permanent(err),
        }
    }
}

/// A derived-state builder, idempotent per `event_id`
pub trait Builder: Send + Sync {
    /// Stable identifier, used in the dedup index and DLQ records
    fn id(&self) -> &'static str;

    fn apply(&self, record: &CdcRecord) -> BuildOutcome;
}

/// What the pool should do with a record after one builder attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Done,
    RetryAfter(Duration),
    Deadletter,
}

/// Exponential backoff with a cap and a bounded attempt budget
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 2,
            cap: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt's retry
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let factor = self.factor.saturating_pow(exp);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Pure decision from an outcome and the attempt that produced it
    pub fn decide(&self, outcome: &BuildOutcome, attempt: u32) -> RetryDecision {
        match outcome {
            BuildOutcome::Applied | BuildOutcome::Skipped => RetryDecision::Done,
            BuildOutcome::Permanent(_) => RetryDecision::Deadletter,
            BuildOutcome::Transient(_) => {
                if attempt >= self.max_attempts {
                    RetryDecision::Deadletter
                } else {
                    RetryDecision::RetryAfter(self.backoff(attempt))
                }
            }
        }
    }
}
