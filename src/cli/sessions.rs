//! Session inspection and cleanup commands.

use std::io::Write;

use clap::Subcommand;

use crate::pairing::{RetryConfig, TransactionMetrics, retry_on_abort};
use crate::session::SessionEngine;

#[derive(Subcommand, Debug, Clone)]
pub enum InspectCommand {
    /// Show the user and client bindings of a main session
    Main {
        /// Main session id
        ms_id: String,
    },

    /// Show the parent and token presence of a sub session
    Sub {
        /// Sub session id
        ss_id: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum DetachCommand {
    /// Remove a main session and every sub session attached to it
    Main {
        /// Main session id
        ms_id: String,
    },

    /// Remove a single sub session and its client binding
    Sub {
        /// Sub session id
        ss_id: String,
    },
}

/// Run an inspect command, writing the report to `out`.
pub async fn run_inspect_command(
    cmd: InspectCommand,
    engine: &SessionEngine,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match cmd {
        InspectCommand::Main { ms_id } => inspect_main(engine, &ms_id, out).await,
        InspectCommand::Sub { ss_id } => inspect_sub(engine, &ss_id, out).await,
    }
}

/// Run a detach command under `retry`, writing the outcome to `out`.
pub async fn run_detach_command(
    cmd: DetachCommand,
    engine: &SessionEngine,
    retry: &RetryConfig,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let metrics = TransactionMetrics::new();
    match cmd {
        DetachCommand::Main { ms_id } => {
            if engine.get_user(&ms_id).await?.is_none() {
                writeln!(out, "Main session {} not found.", ms_id)?;
                return Ok(());
            }
            retry_on_abort(retry, &metrics, "detach_main", || engine.detach_main(&ms_id)).await?;
            writeln!(out, "Detached main session {}.", ms_id)?;
        }
        DetachCommand::Sub { ss_id } => {
            retry_on_abort(retry, &metrics, "detach_sub", || engine.detach_sub(&ss_id)).await?;
            writeln!(out, "Detached sub session {}.", ss_id)?;
        }
    }
    Ok(())
}

async fn inspect_main(
    engine: &SessionEngine,
    ms_id: &str,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let Some(user) = engine.get_user(ms_id).await? else {
        writeln!(out, "Main session {} not found.", ms_id)?;
        return Ok(());
    };

    writeln!(out, "Main session: {}", ms_id)?;
    writeln!(out, "  User: {} ({})", user.username, user.user_id)?;

    let clients = engine.list_client_bindings(ms_id).await?;
    if clients.is_empty() {
        writeln!(out, "  No sub sessions attached.")?;
        return Ok(());
    }

    writeln!(out, "  Sub sessions ({}):", clients.len())?;
    for client_id in &clients {
        let ss_id = engine.get_sub_session(ms_id, client_id).await?;
        writeln!(
            out,
            "    - {} -> {}",
            client_id,
            ss_id.as_deref().unwrap_or("(gone)")
        )?;
    }
    Ok(())
}

async fn inspect_sub(
    engine: &SessionEngine,
    ss_id: &str,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let Some(record) = engine.get_sub_session_record(ss_id).await? else {
        writeln!(out, "Sub session {} not found.", ss_id)?;
        return Ok(());
    };
    let tokens = engine.get_token_pair(ss_id).await?;

    writeln!(out, "Sub session: {}", ss_id)?;
    writeln!(out, "  Main session: {}", record.ms_id)?;
    writeln!(out, "  Client: {}", record.client_id)?;
    writeln!(out, "  Access token: {}", presence(tokens.access.is_some()))?;
    writeln!(out, "  Refresh token: {}", presence(tokens.refresh.is_some()))?;
    Ok(())
}

fn presence(present: bool) -> &'static str {
    if present { "present" } else { "none" }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::cache::{
        CommitOutcome, MemoryCache, ScanPage, SessionCache, WatchHandle, WriteBatch,
    };
    use crate::error::{CacheError, SessionError};

    /// Store whose next `aborts` commits report a concurrent write.
    struct Contended {
        inner: MemoryCache,
        aborts: AtomicU32,
    }

    struct AbortingWatch(Box<dyn WatchHandle>);

    #[async_trait]
    impl WatchHandle for AbortingWatch {
        async fn commit(self: Box<Self>, _batch: WriteBatch) -> Result<CommitOutcome, CacheError> {
            self.0.release().await?;
            Ok(CommitOutcome::Aborted)
        }

        async fn release(self: Box<Self>) -> Result<(), CacheError> {
            self.0.release().await
        }
    }

    #[async_trait]
    impl SessionCache for Contended {
        async fn exists(&self, key: &str) -> Result<bool, CacheError> {
            self.inner.exists(key).await
        }

        async fn is_member(&self, set: &str, member: &str) -> Result<bool, CacheError> {
            self.inner.is_member(set, member).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn hash_get(
            &self,
            key: &str,
            fields: &[&str],
        ) -> Result<Vec<Option<String>>, CacheError> {
            self.inner.hash_get(key, fields).await
        }

        async fn scan(
            &self,
            cursor: u64,
            pattern: &str,
            count: usize,
        ) -> Result<ScanPage, CacheError> {
            self.inner.scan(cursor, pattern, count).await
        }

        async fn watch(&self, keys: &[String]) -> Result<Box<dyn WatchHandle>, CacheError> {
            let handle = self.inner.watch(keys).await?;
            let contended = self
                .aborts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if contended {
                Ok(Box::new(AbortingWatch(handle)))
            } else {
                Ok(handle)
            }
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_factor: 0.0,
        }
    }

    async fn contended() -> (Arc<Contended>, SessionEngine) {
        let cache = Arc::new(Contended {
            inner: MemoryCache::new(),
            aborts: AtomicU32::new(0),
        });
        let engine = SessionEngine::new(cache.clone());
        engine.attach_main("u1", "ms1", "alice").await.unwrap();
        engine.attach_sub("ms1", "ss1", "tv").await.unwrap();
        (cache, engine)
    }

    async fn seeded() -> SessionEngine {
        let engine = SessionEngine::new(Arc::new(MemoryCache::new()));
        engine.attach_main("u1", "ms1", "alice").await.unwrap();
        engine.attach_sub("ms1", "ss1", "tv").await.unwrap();
        engine.attach_sub("ms1", "ss2", "phone").await.unwrap();
        engine.set_token("ss1", "at", Some("rt")).await.unwrap();
        engine
    }

    async fn render_inspect(engine: &SessionEngine, cmd: InspectCommand) -> String {
        let mut out = Vec::new();
        run_inspect_command(cmd, engine, &mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_inspect_main_lists_bindings() {
        let engine = seeded().await;
        let text = render_inspect(
            &engine,
            InspectCommand::Main {
                ms_id: "ms1".to_string(),
            },
        )
        .await;

        assert!(text.contains("User: alice (u1)"));
        assert!(text.contains("Sub sessions (2):"));
        assert!(text.contains("- phone -> ss2"));
        assert!(text.contains("- tv -> ss1"));
    }

    #[tokio::test]
    async fn test_inspect_sub_hides_token_values() {
        let engine = seeded().await;
        let text = render_inspect(
            &engine,
            InspectCommand::Sub {
                ss_id: "ss1".to_string(),
            },
        )
        .await;

        assert!(text.contains("Main session: ms1"));
        assert!(text.contains("Client: tv"));
        assert!(text.contains("Access token: present"));
        assert!(!text.contains("rt\n"));
    }

    #[tokio::test]
    async fn test_inspect_unknown() {
        let engine = seeded().await;
        let text = render_inspect(
            &engine,
            InspectCommand::Main {
                ms_id: "ms9".to_string(),
            },
        )
        .await;
        assert_eq!(text, "Main session ms9 not found.\n");
    }

    #[tokio::test]
    async fn test_detach_main_cascades() {
        let engine = seeded().await;
        let mut out = Vec::new();
        run_detach_command(
            DetachCommand::Main {
                ms_id: "ms1".to_string(),
            },
            &engine,
            &RetryConfig::default(),
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "Detached main session ms1.\n");
        assert!(engine.get_main_session("ss1").await.unwrap().is_none());
        assert!(engine.list_client_bindings("ms1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detach_unknown_sub_is_an_error() {
        let engine = seeded().await;
        let mut out = Vec::new();
        let result = run_detach_command(
            DetachCommand::Sub {
                ss_id: "ss9".to_string(),
            },
            &engine,
            &RetryConfig::default(),
            &mut out,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_detach_retries_aborted_commit() {
        let (cache, engine) = contended().await;
        cache.aborts.store(2, Ordering::SeqCst);

        let mut out = Vec::new();
        run_detach_command(
            DetachCommand::Sub {
                ss_id: "ss1".to_string(),
            },
            &engine,
            &fast_retry(),
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "Detached sub session ss1.\n");
        assert!(engine.get_sub_session_record("ss1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_detach_gives_up_when_retries_disabled() {
        let (cache, engine) = contended().await;
        cache.aborts.store(1, Ordering::SeqCst);

        let mut out = Vec::new();
        let err = run_detach_command(
            DetachCommand::Main {
                ms_id: "ms1".to_string(),
            },
            &engine,
            &RetryConfig::disabled(),
            &mut out,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::ConcurrencyAborted)
        ));
        assert!(engine.get_user("ms1").await.unwrap().is_some());
    }
}
