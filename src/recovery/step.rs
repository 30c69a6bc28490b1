//! Timeout-bounded execution of a single recovery step.

use std::{future::Future, time::Duration};

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    error::{CollaboratorError, RecoveryStep, StepError},
    session::ConnectionId,
};

/// Run `call` as `step`, failing with [`StepError::TimedOut`] once `limit`
/// elapses.
pub(super) async fn run_step<T, F>(step: RecoveryStep, limit: Duration, call: F) -> Result<T, StepError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(StepError::Failed { step, source }),
        Err(_) => Err(StepError::TimedOut {
            step,
            timeout: limit,
        }),
    }
}

/// Run a step whose failure is logged and otherwise ignored.
///
/// An absent resource counts as success. Returns true if the step completed.
pub(super) async fn best_effort<F>(
    connection: ConnectionId,
    step: RecoveryStep,
    limit: Duration,
    call: F,
) -> bool
where
    F: Future<Output = Result<(), CollaboratorError>>,
{
    match run_step(step, limit, call).await {
        Ok(()) => true,
        Err(StepError::Failed { source, .. }) if source.is_not_found() => {
            debug!(%connection, %step, "nothing to do");
            true
        }
        Err(error) => {
            warn!(%connection, %step, %error, "best-effort recovery step failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tracing_test::traced_test;

    use super::*;

    const CONN: ConnectionId = ConnectionId::new(3);

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn elapsed_limit_is_a_timeout() {
        let result: Result<(), _> = run_step(RecoveryStep::Reconnect, Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(
            result,
            Err(StepError::TimedOut {
                step: RecoveryStep::Reconnect,
                timeout: Duration::from_secs(1),
            })
        );
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn collaborator_error_is_wrapped() {
        let result: Result<bool, _> = run_step(RecoveryStep::Verify, Duration::from_secs(1), async {
            Err(CollaboratorError::Unavailable("probe down".into()))
        })
        .await;
        let error = result.expect_err("must fail");
        assert_eq!(error.step(), Some(RecoveryStep::Verify));
        assert!(error.to_string().contains("probe down"));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn missing_cache_counts_as_done() {
        let done = best_effort(CONN, RecoveryStep::ClearCache, Duration::from_secs(1), async {
            Err(CollaboratorError::NotFound("cache".into()))
        })
        .await;
        assert!(done);
    }

    #[rstest]
    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn best_effort_failure_is_logged() {
        let done = best_effort(CONN, RecoveryStep::PurgeSession, Duration::from_secs(1), async {
            Err(CollaboratorError::Rejected("read-only store".into()))
        })
        .await;
        assert!(!done);
        assert!(logs_contain("best-effort recovery step failed"));
        assert!(logs_contain("purge_session"));
    }
}
