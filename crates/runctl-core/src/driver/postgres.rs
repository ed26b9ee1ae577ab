//! Relational backend (PostgreSQL via `sqlx`). No native watch primitive,
//! so the watcher polls with adaptive backoff: 1s, doubling on unchanged
//! counts up to 30s, resetting to 1s the moment a drop is observed.
use super::{Driver, Handle, QueuedRun, ReleaseRequest, RepoSnapshot, SlotCallback};
use crate::error::{Error, Result};
use crate::repo::RepoRef;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgSslMode};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

pub struct PostgresDriver {
    pool: PgPool,
    lease_ttl: Duration,
    watchers: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

fn to_nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(0)
}

impl PostgresDriver {
    pub async fn connect(
        host: &str,
        port: u16,
        database: &str,
        username: &str,
        password: &str,
        ssl_mode: &str,
        max_connections: u32,
        connection_timeout: Duration,
        lease_ttl: Duration,
    ) -> Result<Arc<Self>> {
        let ssl_mode = match ssl_mode {
            "disable" => PgSslMode::Disable,
            "allow" => PgSslMode::Allow,
            "require" => PgSslMode::Require,
            "verify-ca" => PgSslMode::VerifyCa,
            "verify-full" => PgSslMode::VerifyFull,
            _ => PgSslMode::Prefer,
        };
        let options = sqlx::postgres::PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database)
            .username(username)
            .password(password)
            .ssl_mode(ssl_mode);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connection_timeout)
            .connect_with(options)
            .await
            .map_err(Error::backend)?;
        let driver = Arc::new(Self {
            pool,
            lease_ttl,
            watchers: AsyncMutex::new(Vec::new()),
        });
        driver.migrate().await?;
        driver.clone().spawn_sweeper();
        Ok(driver)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS concurrency_slots (
                id BIGSERIAL PRIMARY KEY,
                repo_key TEXT NOT NULL,
                run_key TEXT NOT NULL,
                state TEXT NOT NULL CHECK (state IN ('queued', 'running', 'released')),
                acquired_at TIMESTAMPTZ,
                expires_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (repo_key, run_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::backend)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS concurrency_slots_repo_key_idx ON concurrency_slots (repo_key)")
            .execute(&self.pool)
            .await
            .map_err(Error::backend)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS concurrency_slots_expires_at_idx ON concurrency_slots (expires_at)")
            .execute(&self.pool)
            .await
            .map_err(Error::backend)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS concurrency_slots_state_idx ON concurrency_slots (state)")
            .execute(&self.pool)
            .await
            .map_err(Error::backend)?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS repository_states (
                repo_key TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::backend)?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_run_states (
                run_key TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Error::backend)?;
        Ok(())
    }

    fn spawn_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
            loop {
                ticker.tick().await;
                let result = sqlx::query(
                    "DELETE FROM concurrency_slots WHERE state = 'running' AND expires_at < now()",
                )
                .execute(&self.pool)
                .await;
                match result {
                    Ok(res) if res.rows_affected() > 0 => {
                        tracing::info!(reclaimed = res.rows_affected(), "swept expired slots (postgresql)");
                    }
                    Err(err) => tracing::warn!(error = %err, "postgresql sweeper failed"),
                    _ => {}
                }
            }
        });
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    async fn acquire_slot(&self, repo: &RepoRef, run_key: &str) -> Result<(bool, Option<Handle>)> {
        let Some(limit) = repo.effective_limit() else {
            return Ok((true, None));
        };
        let repo_key = repo.key();
        let ttl_secs = self.lease_ttl.as_secs() as i64;

        let mut tx = self.pool.begin().await.map_err(Error::backend)?;
        let running: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM concurrency_slots WHERE repo_key = $1 AND state = 'running' AND expires_at > now()",
        )
        .bind(&repo_key)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::backend)?;
        if running as u32 >= limit {
            tx.rollback().await.ok();
            return Ok((false, None));
        }

        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO concurrency_slots (repo_key, run_key, state, acquired_at, expires_at)
            VALUES ($1, $2, 'running', now(), now() + ($3 || ' seconds')::interval)
            ON CONFLICT (repo_key, run_key) DO UPDATE
              SET state = 'running',
                  acquired_at = now(),
                  expires_at = now() + ($3 || ' seconds')::interval,
                  updated_at = now()
              WHERE concurrency_slots.state <> 'running'
            RETURNING id
            "#,
        )
        .bind(&repo_key)
        .bind(run_key)
        .bind(ttl_secs.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::backend)?;

        let id = match inserted {
            Some((id,)) => id,
            None => {
                // ON CONFLICT's WHERE guard skipped the update: the row
                // already exists and is running. Idempotent duplicate —
                // same resolution as the other two backends.
                let (id,): (i64,) = sqlx::query_as(
                    "SELECT id FROM concurrency_slots WHERE repo_key = $1 AND run_key = $2",
                )
                .bind(&repo_key)
                .bind(run_key)
                .fetch_one(&mut *tx)
                .await
                .map_err(Error::backend)?;
                id
            }
        };
        tx.commit().await.map_err(Error::backend)?;
        tracing::info!(repo_key, run_key, limit, "slot acquired (postgresql)");
        Ok((true, Some(Handle::Postgres(id))))
    }

    async fn release_slot(&self, req: ReleaseRequest<'_>) -> Result<bool> {
        let result = match req.handle {
            Some(Handle::Postgres(id)) => {
                sqlx::query(
                    "UPDATE concurrency_slots SET state = 'released', updated_at = now() \
                     WHERE id = $1 AND repo_key = $2 AND run_key = $3 AND state = 'running'",
                )
                .bind(id)
                .bind(req.repo_key)
                .bind(req.run_key)
                .execute(&self.pool)
                .await
            }
            Some(other) => {
                return Err(Error::InvalidHandle {
                    driver: "postgresql",
                    observed: other.driver_name().to_string(),
                })
            }
            None => {
                sqlx::query(
                    "UPDATE concurrency_slots SET state = 'released', updated_at = now() \
                     WHERE repo_key = $1 AND run_key = $2 AND state = 'running'",
                )
                .bind(req.repo_key)
                .bind(req.run_key)
                .execute(&self.pool)
                .await
            }
        };
        let released = result.map_err(Error::backend)?.rows_affected() > 0;
        if released {
            tracing::info!(repo_key = req.repo_key, run_key = req.run_key, "slot released (postgresql)");
        }
        Ok(released)
    }

    async fn get_current_slots(&self, repo_key: &str) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM concurrency_slots WHERE repo_key = $1 AND state = 'running' AND expires_at > now()",
        )
        .bind(repo_key)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::backend)?;
        Ok(count as u32)
    }

    async fn get_running_pipeline_runs(&self, repo_key: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT run_key FROM concurrency_slots WHERE repo_key = $1 AND state = 'running' AND expires_at > now()",
        )
        .bind(repo_key)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::backend)?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn get_queued_pipeline_runs(&self, repo_key: &str) -> Result<Vec<QueuedRun>> {
        let rows = sqlx::query(
            "SELECT run_key, created_at FROM concurrency_slots \
             WHERE repo_key = $1 AND state = 'queued' AND (expires_at IS NULL OR expires_at > now()) \
             ORDER BY created_at ASC",
        )
        .bind(repo_key)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::backend)?;
        Ok(rows
            .into_iter()
            .map(|row| QueuedRun {
                run_key: row.get("run_key"),
                created_at: to_nanos(row.get::<DateTime<Utc>, _>("created_at")),
            })
            .collect())
    }

    async fn watch_slot_availability(
        &self,
        repo_key: &str,
        on_release: SlotCallback,
    ) -> Result<()> {
        let pool = self.pool.clone();
        let repo_key = repo_key.to_string();
        let handle = tokio::spawn(async move {
            let mut interval = Duration::from_secs(1);
            let mut last_count: Option<i64> = None;
            loop {
                // Jitter the sleep so many watchers on the same repo don't
                // all poll in lockstep against the pool.
                let jitter = Duration::from_millis(rand::random::<u64>() % 250);
                tokio::time::sleep(interval + jitter).await;
                let count: Result<i64, sqlx::Error> = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM concurrency_slots WHERE repo_key = $1 AND state = 'running' AND expires_at > now()",
                )
                .bind(&repo_key)
                .fetch_one(&pool)
                .await;
                let count = match count {
                    Ok(c) => c,
                    Err(err) => {
                        tracing::warn!(error = %err, repo_key, "postgresql watcher poll failed");
                        continue;
                    }
                };
                let dropped = last_count.map(|prev| count < prev).unwrap_or(false);
                if dropped {
                    interval = Duration::from_secs(1);
                    on_release().await;
                } else {
                    interval = (interval * 2).min(Duration::from_secs(30));
                }
                last_count = Some(count);
            }
        });
        self.watchers.lock().await.push(handle);
        Ok(())
    }

    async fn set_repository_state(&self, repo_key: &str, state: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO repository_states (repo_key, state, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (repo_key) DO UPDATE SET state = $2, updated_at = now()",
        )
        .bind(repo_key)
        .bind(state)
        .execute(&self.pool)
        .await
        .map_err(Error::backend)?;
        Ok(())
    }

    async fn get_repository_state(&self, repo_key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM repository_states WHERE repo_key = $1")
                .bind(repo_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::backend)?;
        Ok(row.map(|(s,)| s))
    }

    async fn set_pipeline_run_state(
        &self,
        run_key: &str,
        state: &str,
        repo: Option<&RepoRef>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO pipeline_run_states (run_key, state, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (run_key) DO UPDATE SET state = $2, updated_at = now()",
        )
        .bind(run_key)
        .bind(state)
        .execute(&self.pool)
        .await
        .map_err(Error::backend)?;

        if state == "queued" {
            if let Some(repo) = repo {
                sqlx::query(
                    r#"
                    INSERT INTO concurrency_slots (repo_key, run_key, state, created_at)
                    VALUES ($1, $2, 'queued', now())
                    ON CONFLICT (repo_key, run_key) DO UPDATE
                      SET state = 'queued', updated_at = now()
                      WHERE concurrency_slots.state = 'released'
                    "#,
                )
                .bind(repo.key())
                .bind(run_key)
                .execute(&self.pool)
                .await
                .map_err(Error::backend)?;
            }
        }
        Ok(())
    }

    async fn get_pipeline_run_state(&self, run_key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM pipeline_run_states WHERE run_key = $1")
                .bind(run_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::backend)?;
        Ok(row.map(|(s,)| s))
    }

    async fn cleanup_repository(&self, repo_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM concurrency_slots WHERE repo_key = $1")
            .bind(repo_key)
            .execute(&self.pool)
            .await
            .map_err(Error::backend)?;
        sqlx::query("DELETE FROM repository_states WHERE repo_key = $1")
            .bind(repo_key)
            .execute(&self.pool)
            .await
            .map_err(Error::backend)?;
        Ok(())
    }

    async fn get_all_repositories_with_state(&self) -> Result<Vec<RepoSnapshot>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT repo_key, state FROM repository_states")
                .fetch_all(&self.pool)
                .await
                .map_err(Error::backend)?;
        Ok(rows
            .into_iter()
            .map(|(repo_key, state)| RepoSnapshot { repo_key, state })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        for handle in self.watchers.lock().await.drain(..) {
            handle.abort();
        }
        self.pool.close().await;
        Ok(())
    }
}
