//! Concurrent precondition checks ahead of a commit.
//!
//! Each [`Precondition`] pairs an existence/membership probe with the error
//! to raise when the probe comes back the wrong way. All probes of one
//! evaluation run concurrently and all of them run to completion, even
//! after one has failed, so the caller can clean up exactly once.

use std::future::Future;

use futures::future::{BoxFuture, FutureExt, join_all};

use crate::error::{CacheError, SessionError};

/// A single read-based condition.
pub struct Precondition<'a> {
    probe: BoxFuture<'a, Result<bool, CacheError>>,
    /// Probe result that counts as a violation.
    violated_when: bool,
    error: SessionError,
}

impl<'a> Precondition<'a> {
    /// Violated when the probe reports `false`.
    pub fn holds<F>(probe: F, error: SessionError) -> Self
    where
        F: Future<Output = Result<bool, CacheError>> + Send + 'a,
    {
        Self {
            probe: probe.boxed(),
            violated_when: false,
            error,
        }
    }

    /// Violated when the probe reports `true`.
    pub fn lacks<F>(probe: F, error: SessionError) -> Self
    where
        F: Future<Output = Result<bool, CacheError>> + Send + 'a,
    {
        Self {
            probe: probe.boxed(),
            violated_when: true,
            error,
        }
    }
}

/// Result of evaluating a precondition set.
#[derive(Debug)]
pub enum Verdict {
    /// Every condition held.
    Satisfied,
    /// At least one condition was violated or could not be read. Carries the
    /// first failure in declaration order.
    Violated(SessionError),
}

/// Run every probe concurrently and report the first failure.
pub async fn evaluate(preconditions: Vec<Precondition<'_>>) -> Verdict {
    let (probes, checks): (Vec<_>, Vec<_>) = preconditions
        .into_iter()
        .map(|p| (p.probe, (p.violated_when, p.error)))
        .unzip();

    let results = join_all(probes).await;

    let mut first = None;
    for (result, (violated_when, error)) in results.into_iter().zip(checks) {
        let failure = match result {
            Ok(observed) if observed == violated_when => Some(error),
            Ok(_) => None,
            Err(e) => Some(SessionError::Cache(e)),
        };
        if let Some(failure) = failure {
            tracing::debug!(error = %failure, "Precondition failed");
            first.get_or_insert(failure);
        }
    }

    match first {
        Some(err) => Verdict::Violated(err),
        None => Verdict::Satisfied,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn registered(ss: &str) -> SessionError {
        SessionError::SubSessionAlreadyExists {
            ss_id: ss.to_string(),
        }
    }

    #[tokio::test]
    async fn test_all_hold() {
        let verdict = evaluate(vec![
            Precondition::holds(async { Ok(true) }, registered("a")),
            Precondition::lacks(async { Ok(false) }, registered("b")),
        ])
        .await;
        assert!(matches!(verdict, Verdict::Satisfied));
    }

    #[tokio::test]
    async fn test_first_violation_in_declaration_order_wins() {
        let verdict = evaluate(vec![
            Precondition::holds(async { Ok(true) }, registered("a")),
            Precondition::lacks(
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(true)
                },
                registered("b"),
            ),
            Precondition::holds(async { Ok(false) }, registered("c")),
        ])
        .await;
        match verdict {
            Verdict::Violated(SessionError::SubSessionAlreadyExists { ss_id }) => {
                assert_eq!(ss_id, "b")
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_every_probe_runs_after_a_failure() {
        let ran = Arc::new(AtomicUsize::new(0));
        let probe = |result: bool| {
            let ran = Arc::clone(&ran);
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(result)
            }
        };

        let verdict = evaluate(vec![
            Precondition::holds(probe(false), registered("a")),
            Precondition::holds(probe(true), registered("b")),
            Precondition::holds(probe(false), registered("c")),
        ])
        .await;

        assert!(matches!(verdict, Verdict::Violated(_)));
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_probe_error_is_reported() {
        let verdict = evaluate(vec![Precondition::holds(
            async { Err(CacheError::Connection("down".to_string())) },
            registered("a"),
        )])
        .await;
        assert!(matches!(
            verdict,
            Verdict::Violated(SessionError::Cache(CacheError::Connection(_)))
        ));
    }

    #[tokio::test]
    async fn test_probes_run_concurrently() {
        let slow = || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(true)
        };
        let started = tokio::time::Instant::now();
        let verdict = evaluate(vec![
            Precondition::holds(slow(), registered("a")),
            Precondition::holds(slow(), registered("b")),
            Precondition::holds(slow(), registered("c")),
        ])
        .await;
        assert!(matches!(verdict, Verdict::Satisfied));
        assert!(started.elapsed() < Duration::from_millis(250));
    }
}
