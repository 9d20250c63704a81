//! Retry policy and error classification for transaction submission
//!
//! Submission retries are unbounded: a message is retried at a fixed
//! interval until it lands, is classified ignorable, or the chain stops.
//! Repeated failures raise an operator alarm instead of giving up.

use std::time::Duration;

use tracing::debug;

use crate::connection::ClientError;

/// Revert reasons meaning the effect is already in place on chain
pub const IGNORABLE_REASONS: &[&str] = &["order exist", "header already have", "invalid start block"];

/// Writer retry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep between attempts
    pub retry_interval: Duration,
    /// Consecutive failures per alarm
    pub alarm_threshold: u32,
    /// Receipt polls without a receipt per stuck-transaction alarm
    pub max_receipt_polls: u32,
    pub receipt_poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
            alarm_threshold: 10,
            max_receipt_polls: 60,
            receipt_poll_interval: Duration::from_secs(3),
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Sleep and try again, optionally re-reading the pending nonce
    Retryable { refresh_nonce: bool },
    /// The desired effect already exists; complete without a transaction
    Ignorable,
    /// The message can never be submitted
    Fatal,
}

/// Classifies typed client errors for the writer loop
#[derive(Debug, Clone)]
pub struct Classifier {
    ignorable: Vec<String>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Classifier {
    /// Built-in ignorable reasons plus `extra`
    pub fn new(extra: Vec<String>) -> Self {
        let mut ignorable: Vec<String> = IGNORABLE_REASONS.iter().map(|s| s.to_string()).collect();
        ignorable.extend(
            extra
                .into_iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty()),
        );
        Self { ignorable }
    }

    pub fn classify(&self, error: &ClientError) -> ErrorClass {
        if let Some(detail) = error.detail() {
            let detail = detail.to_lowercase();
            if let Some(reason) = self.ignorable.iter().find(|r| detail.contains(r.as_str())) {
                debug!(reason = %reason, "Ignorable failure");
                return ErrorClass::Ignorable;
            }
        }

        match error {
            ClientError::NonceTooLow
            | ClientError::ReplacementUnderpriced
            | ClientError::AlreadyKnown => ErrorClass::Retryable {
                refresh_nonce: true,
            },
            ClientError::Signing(_) => ErrorClass::Fatal,
            ClientError::Transport(_)
            | ClientError::InsufficientFunds
            | ClientError::Reverted(_)
            | ClientError::Rpc { .. }
            | ClientError::Decode(_) => ErrorClass::Retryable {
                refresh_nonce: false,
            },
        }
    }
}

/// Consecutive-failure counter that fires every `threshold` failures
#[derive(Debug, Clone)]
pub struct AlarmCounter {
    threshold: u32,
    failures: u32,
}

impl AlarmCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: 0,
        }
    }

    /// Count a failure. True when an alarm is due; the counter then restarts.
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        if self.failures >= self.threshold {
            self.failures = 0;
            true
        } else {
            false
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_errors_refresh() {
        let classifier = Classifier::default();
        for err in [
            ClientError::NonceTooLow,
            ClientError::ReplacementUnderpriced,
            ClientError::AlreadyKnown,
        ] {
            assert_eq!(
                classifier.classify(&err),
                ErrorClass::Retryable {
                    refresh_nonce: true
                },
                "{err}"
            );
        }
    }

    #[test]
    fn test_ignorable_reverts() {
        let classifier = Classifier::default();
        assert_eq!(
            classifier.classify(&ClientError::Reverted("Order Exist".into())),
            ErrorClass::Ignorable
        );
        assert_eq!(
            classifier.classify(&ClientError::Rpc {
                code: -32000,
                message: "header already have".into()
            }),
            ErrorClass::Ignorable
        );
        assert_eq!(
            classifier.classify(&ClientError::Reverted("invalid proof".into())),
            ErrorClass::Retryable {
                refresh_nonce: false
            }
        );
    }

    #[test]
    fn test_configured_extras() {
        let classifier = Classifier::new(vec![" Already Relayed ".into(), "".into()]);
        assert_eq!(
            classifier.classify(&ClientError::Reverted("already relayed".into())),
            ErrorClass::Ignorable
        );
    }

    #[test]
    fn test_transport_and_funds_retry() {
        let classifier = Classifier::default();
        assert_eq!(
            classifier.classify(&ClientError::Transport("unexpected EOF".into())),
            ErrorClass::Retryable {
                refresh_nonce: false
            }
        );
        assert_eq!(
            classifier.classify(&ClientError::InsufficientFunds),
            ErrorClass::Retryable {
                refresh_nonce: false
            }
        );
        assert_eq!(
            classifier.classify(&ClientError::Signing("bad key".into())),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_alarm_counter_fires_and_resets() {
        let mut counter = AlarmCounter::new(3);
        assert!(!counter.record_failure());
        assert!(!counter.record_failure());
        assert!(counter.record_failure());
        assert_eq!(counter.failures(), 0);
        assert!(!counter.record_failure());
    }
}
