//! Retry backoff schedule for failed jobs.

use std::time::Duration;

/// Delays (seconds) applied after the 1st, 2nd, ... failure. The last entry
/// repeats once the schedule is exhausted.
pub const BACKOFF_SCHEDULE_SECS: [u64; 5] = [30, 60, 120, 180, 300];

/// Backoff before the job becomes eligible again, given its retry count
/// *after* the failure was recorded.
pub fn backoff_for_retry(retry_count: u32, custom: Option<Duration>) -> Duration {
    if let Some(custom) = custom {
        return custom;
    }
    let idx = (retry_count.max(1) as usize - 1).min(BACKOFF_SCHEDULE_SECS.len() - 1);
    Duration::from_secs(BACKOFF_SCHEDULE_SECS[idx])
}

/// What `fail_job` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Another attempt is scheduled.
    Retrying { retry_count: u32, delay: Duration },
    /// No automatic retry will happen.
    Terminal { retry_count: u32 },
}

impl FailOutcome {
    pub fn decide(
        prev_retry_count: u32,
        max_retries: u32,
        should_retry: bool,
        custom: Option<Duration>,
    ) -> Self {
        let retry_count = prev_retry_count.saturating_add(1);
        if should_retry && retry_count < max_retries {
            FailOutcome::Retrying {
                retry_count,
                delay: backoff_for_retry(retry_count, custom),
            }
        } else {
            FailOutcome::Terminal {
                retry_count: retry_count.max(max_retries),
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FailOutcome::Terminal { .. })
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            FailOutcome::Retrying { retry_count, .. } | FailOutcome::Terminal { retry_count } => {
                *retry_count
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_caps_at_last_entry() {
        let delays: Vec<u64> = (1..=8)
            .map(|n| backoff_for_retry(n, None).as_secs())
            .collect();
        assert_eq!(delays, vec![30, 60, 120, 180, 300, 300, 300, 300]);
    }

    #[test]
    fn custom_delay_wins() {
        assert_eq!(
            backoff_for_retry(1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn non_retryable_is_terminal_regardless_of_budget() {
        let outcome = FailOutcome::decide(0, 10, false, None);
        assert_eq!(outcome, FailOutcome::Terminal { retry_count: 10 });
    }

    #[test]
    fn last_retry_becomes_terminal() {
        assert!(matches!(
            FailOutcome::decide(1, 3, true, None),
            FailOutcome::Retrying { retry_count: 2, .. }
        ));
        assert_eq!(
            FailOutcome::decide(2, 3, true, None),
            FailOutcome::Terminal { retry_count: 3 }
        );
    }
}
