use crate::driver::RetryPolicy;
use crate::Result;
use tracing::{error, warn};

/// Run `operation` until it succeeds or the policy stops retrying.
///
/// Only errors the policy classifies as retryable are attempted again, at
/// most `policy.retries` extra times with `policy.pause` between attempts.
pub fn with_retries<T, F>(policy: &RetryPolicy, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !policy.should_retry(&e) {
                    return Err(e);
                }
                attempt += 1;
                if attempt > policy.retries {
                    error!(
                        "Failed to execute '{}' after {} attempts: {}",
                        operation_name, attempt, e
                    );
                    return Err(e);
                }
                warn!(
                    "Operation '{}' failed. Retrying in {:?} (Attempt {}/{}): {}",
                    operation_name, policy.pause, attempt, policy.retries, e
                );
                std::thread::sleep(policy.pause);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataSourceError;
    use std::time::Duration;

    fn policy(retry_on: &[&str]) -> RetryPolicy {
        RetryPolicy {
            retries: 2,
            pause: Duration::from_millis(1),
            retry_on: retry_on.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_default_policy_does_not_retry() {
        let mut calls = 0;
        let result: Result<()> = with_retries(&RetryPolicy::default(), "query", || {
            calls += 1;
            Err(DataSourceError::ExecutionError("IO Error: connection reset".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retries_matching_errors_until_success() {
        let mut calls = 0;
        let result = with_retries(&policy(&["connection reset"]), "query", || {
            calls += 1;
            if calls < 3 {
                Err(DataSourceError::ExecutionError("IO Error: connection reset".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_gives_up_after_retries() {
        let mut calls = 0;
        let result: Result<()> = with_retries(&policy(&["reset"]), "query", || {
            calls += 1;
            Err(DataSourceError::ExecutionError("reset".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_config_errors_never_retried() {
        let mut calls = 0;
        let result: Result<()> = with_retries(&policy(&["token"]), "connect", || {
            calls += 1;
            Err(DataSourceError::ConfigError("MotherDuck token is missing".into()))
        });
        assert!(matches!(result, Err(DataSourceError::ConfigError(_))));
        assert_eq!(calls, 1);
    }
}
