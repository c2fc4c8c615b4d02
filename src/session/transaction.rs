//! Watch → validate → commit, one phase per type.
//!
//! A [`Watching`] transaction can only become [`Validated`] by passing its
//! preconditions, and only a `Validated` one can commit. Every exit path
//! that does not commit releases the watch first.

use crate::cache::{CommitOutcome, SessionCache, WatchHandle, WriteBatch};
use crate::error::SessionError;
use crate::session::precondition::{Precondition, Verdict, evaluate};

/// Phase 1: keys are watched, nothing has been checked yet.
pub struct Watching {
    op: &'static str,
    handle: Box<dyn WatchHandle>,
}

impl Watching {
    /// Open a watch on `keys` for the operation named `op`.
    pub async fn begin(
        cache: &dyn SessionCache,
        op: &'static str,
        keys: &[String],
    ) -> Result<Self, SessionError> {
        let handle = cache.watch(keys).await?;
        tracing::debug!(op, keys = ?keys, "Watch opened");
        Ok(Self { op, handle })
    }

    /// Evaluate `preconditions`; on any failure the watch is released and the
    /// first failure is returned.
    pub async fn validate(
        self,
        preconditions: Vec<Precondition<'_>>,
    ) -> Result<Validated, SessionError> {
        match evaluate(preconditions).await {
            Verdict::Satisfied => {
                tracing::debug!(op = self.op, "Preconditions satisfied");
                Ok(self.skip_validation())
            }
            Verdict::Violated(err) => Err(self.fail(err).await),
        }
    }

    /// Move on to commit without further checks, for operations whose only
    /// validation is the reads they perform while watching.
    pub fn skip_validation(self) -> Validated {
        Validated {
            op: self.op,
            handle: self.handle,
        }
    }

    /// Release the watch and hand back `err` for the caller to raise.
    pub async fn fail(self, err: SessionError) -> SessionError {
        if let Err(release_err) = self.handle.release().await {
            tracing::warn!(op = self.op, error = %release_err, "Failed to release watch");
        }
        err
    }
}

/// Phase 2: preconditions held; the batch may be submitted.
pub struct Validated {
    op: &'static str,
    handle: Box<dyn WatchHandle>,
}

impl Validated {
    /// Submit `batch` conditioned on the watch set being untouched.
    pub async fn commit(self, batch: WriteBatch) -> Result<(), SessionError> {
        let writes = batch.len();
        match self.handle.commit(batch).await? {
            CommitOutcome::Committed => {
                tracing::debug!(op = self.op, writes, "Transaction committed");
                Ok(())
            }
            CommitOutcome::Aborted => {
                tracing::warn!(op = self.op, "Transaction aborted by concurrent write");
                Err(SessionError::ConcurrencyAborted)
            }
        }
    }
}
