//! Replicated-KV-with-leases backend (etcd). Running slots are leases
//! under `/pac/leases/{repoKey}/{runKey}`; a lease's TTL is the upper
//! bound on slot retention after a controller dies mid-run. Queued
//! entries get their own keyspace since the distilled spec only documents
//! the lease and auxiliary-state keys — `/pac/queued/{repoKey}/{runKey}`
//! plus a `/pac/queued_by_run/{runKey}` reverse index so a state
//! transition away from "queued" can find and clear the repo-scoped entry
//! without the caller having to supply the repo again.
use super::{Driver, Handle, QueuedRun, ReleaseRequest, RepoSnapshot, SlotCallback};
use crate::error::{Error, Result};
use crate::repo::RepoRef;
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

pub struct EtcdDriver {
    client: Client,
    lease_ttl: Duration,
    watchers: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

fn lease_key(repo_key: &str, run_key: &str) -> String {
    format!("/pac/leases/{repo_key}/{run_key}")
}
fn lease_prefix(repo_key: &str) -> String {
    format!("/pac/leases/{repo_key}/")
}
fn queued_key(repo_key: &str, run_key: &str) -> String {
    format!("/pac/queued/{repo_key}/{run_key}")
}
fn queued_prefix(repo_key: &str) -> String {
    format!("/pac/queued/{repo_key}/")
}
fn queued_by_run_key(run_key: &str) -> String {
    format!("/pac/queued_by_run/{run_key}")
}
fn repo_state_key(repo_key: &str) -> String {
    format!("/pac/concurrency/{repo_key}/state")
}
fn run_state_key(run_key: &str) -> String {
    format!("/pac/concurrency/pr/{run_key}/state")
}

/// Recover a repo key from a `/pac/concurrency/.../state` key. `repo_key`
/// is itself `"namespace/name"`, so this can't be split positionally like
/// the queued/lease keys — strip the fixed prefix/suffix instead. Returns
/// `None` for the `pr/{runKey}/state` per-run auxiliary-state sub-namespace.
fn repo_key_from_state_key(key: &str) -> Option<&str> {
    const PREFIX: &str = "/pac/concurrency/";
    const SUFFIX: &str = "/state";
    let repo_key = key.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    if repo_key.starts_with("pr/") {
        return None;
    }
    Some(repo_key)
}

impl EtcdDriver {
    pub async fn connect(
        endpoints: &[String],
        dial_timeout: Duration,
        username: Option<&str>,
        password: Option<&str>,
        lease_ttl: Duration,
    ) -> Result<Arc<Self>> {
        let mut options = etcd_client::ConnectOptions::new().with_connect_timeout(dial_timeout);
        if let (Some(user), Some(pass)) = (username, password) {
            options = options.with_user(user, pass);
        }
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(Error::backend)?;
        Ok(Arc::new(Self {
            client,
            lease_ttl,
            watchers: AsyncMutex::new(Vec::new()),
        }))
    }

    async fn spawn_keepalive(&self, lease_id: i64) -> Result<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(Error::backend)?;
        let interval = (self.lease_ttl / 3).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if keeper.keep_alive().await.is_err() {
                    break;
                }
                match stream.message().await {
                    Ok(Some(_)) => {}
                    _ => break,
                }
            }
        });
        Ok(())
    }

    async fn existing_lease(&self, key: &str) -> Result<Option<i64>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(Error::backend)?;
        Ok(resp.kvs().first().map(|kv| kv.lease()))
    }
}

#[async_trait]
impl Driver for EtcdDriver {
    async fn acquire_slot(&self, repo: &RepoRef, run_key: &str) -> Result<(bool, Option<Handle>)> {
        let Some(limit) = repo.effective_limit() else {
            return Ok((true, None));
        };
        let repo_key = repo.key();
        let key = lease_key(&repo_key, run_key);
        let mut client = self.client.clone();

        if let Some(lease_id) = self.existing_lease(&key).await? {
            return Ok((true, Some(Handle::Etcd(lease_id))));
        }

        let lease = client
            .lease_grant(self.lease_ttl.as_secs().max(1) as i64, None)
            .await
            .map_err(Error::backend)?;
        let lease_id = lease.id();

        let count = client
            .get(
                lease_prefix(&repo_key),
                Some(GetOptions::new().with_prefix().with_count_only()),
            )
            .await
            .map_err(Error::backend)?
            .count() as u32;
        if count >= limit {
            client.lease_revoke(lease_id).await.ok();
            return Ok((false, None));
        }

        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key.clone(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(
                key.clone(),
                run_key,
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        let resp = client.txn(txn).await.map_err(Error::backend)?;
        if !resp.succeeded() {
            client.lease_revoke(lease_id).await.ok();
            // Someone else's acquire for this exact run won the race
            // between our existence check and the commit: idempotent
            // success, not a failure.
            return match self.existing_lease(&key).await? {
                Some(winner) => Ok((true, Some(Handle::Etcd(winner)))),
                None => Ok((false, None)),
            };
        }

        self.spawn_keepalive(lease_id).await?;
        self.clear_queued(&repo_key, run_key).await?;
        tracing::info!(repo_key, run_key, limit, "slot acquired (etcd)");
        Ok((true, Some(Handle::Etcd(lease_id))))
    }

    async fn release_slot(&self, req: ReleaseRequest<'_>) -> Result<bool> {
        let mut client = self.client.clone();
        let key = lease_key(req.repo_key, req.run_key);
        let lease_id = match req.handle {
            Some(Handle::Etcd(id)) => Some(id),
            Some(other) => {
                return Err(Error::InvalidHandle {
                    driver: "etcd",
                    observed: other.driver_name().to_string(),
                })
            }
            None => self.existing_lease(&key).await?,
        };
        // Check the key is still present under a live lease before
        // revoking: a second release of an already-released slot (lease
        // already gone) must report `false`, not re-announce a release.
        if self.existing_lease(&key).await?.is_none() {
            return Ok(false);
        }
        let Some(lease_id) = lease_id else {
            return Ok(false);
        };
        // Revoking an already-gone lease errors on the wire but is a
        // no-op as far as the caller is concerned.
        client.lease_revoke(lease_id).await.ok();
        tracing::info!(repo_key = req.repo_key, run_key = req.run_key, "slot released (etcd)");
        Ok(true)
    }

    async fn get_current_slots(&self, repo_key: &str) -> Result<u32> {
        let mut client = self.client.clone();
        let count = client
            .get(
                lease_prefix(repo_key),
                Some(GetOptions::new().with_prefix().with_count_only()),
            )
            .await
            .map_err(Error::backend)?
            .count();
        Ok(count as u32)
    }

    async fn get_running_pipeline_runs(&self, repo_key: &str) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let resp = client
            .get(lease_prefix(repo_key), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(Error::backend)?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| String::from_utf8_lossy(kv.value()).to_string())
            .collect())
    }

    async fn get_queued_pipeline_runs(&self, repo_key: &str) -> Result<Vec<QueuedRun>> {
        let mut client = self.client.clone();
        let resp = client
            .get(queued_prefix(repo_key), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(Error::backend)?;
        let prefix = queued_prefix(repo_key);
        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                let key = String::from_utf8_lossy(kv.key()).to_string();
                let run_key = key.strip_prefix(&prefix)?.to_string();
                let created_at = String::from_utf8_lossy(kv.value()).parse().ok()?;
                Some(QueuedRun { run_key, created_at })
            })
            .collect())
    }

    async fn watch_slot_availability(
        &self,
        repo_key: &str,
        on_release: SlotCallback,
    ) -> Result<()> {
        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client
            .watch(
                lease_prefix(repo_key),
                Some(WatchOptions::new().with_prefix()),
            )
            .await
            .map_err(Error::backend)?;
        // Keep the watcher alive for the driver's lifetime; dropping it
        // would cancel the underlying etcd watch stream.
        let handle = tokio::spawn(async move {
            let _watcher = &mut watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        let released = resp
                            .events()
                            .iter()
                            .any(|ev| ev.event_type() == etcd_client::EventType::Delete);
                        if released {
                            on_release().await;
                        }
                    }
                    _ => break,
                }
            }
        });
        self.watchers.lock().await.push(handle);
        Ok(())
    }

    async fn set_repository_state(&self, repo_key: &str, state: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(repo_state_key(repo_key), state, None)
            .await
            .map_err(Error::backend)?;
        Ok(())
    }

    async fn get_repository_state(&self, repo_key: &str) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let resp = client
            .get(repo_state_key(repo_key), None)
            .await
            .map_err(Error::backend)?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).to_string()))
    }

    async fn set_pipeline_run_state(
        &self,
        run_key: &str,
        state: &str,
        repo: Option<&RepoRef>,
    ) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(run_state_key(run_key), state, None)
            .await
            .map_err(Error::backend)?;
        if state == "queued" {
            if let Some(repo) = repo {
                let repo_key = repo.key();
                let created_at = now_nanos().to_string();
                client
                    .put(queued_key(&repo_key, run_key), created_at.clone(), None)
                    .await
                    .map_err(Error::backend)?;
                client
                    .put(
                        queued_by_run_key(run_key),
                        format!("{repo_key}|{created_at}"),
                        None,
                    )
                    .await
                    .map_err(Error::backend)?;
            }
        } else {
            // Transitioning away from "queued": find which repo's queued
            // index this run was filed under via the reverse index, then
            // drop both entries. Absent if the run was never queued.
            let mut client = self.client.clone();
            let resp = client
                .get(queued_by_run_key(run_key), None)
                .await
                .map_err(Error::backend)?;
            if let Some(kv) = resp.kvs().first() {
                let value = String::from_utf8_lossy(kv.value()).to_string();
                if let Some((repo_key, _created_at)) = value.split_once('|') {
                    self.clear_queued(repo_key, run_key).await.ok();
                }
            }
        }
        Ok(())
    }

    async fn get_pipeline_run_state(&self, run_key: &str) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let resp = client
            .get(run_state_key(run_key), None)
            .await
            .map_err(Error::backend)?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).to_string()))
    }

    async fn cleanup_repository(&self, repo_key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .delete(lease_prefix(repo_key), Some(etcd_client::DeleteOptions::new().with_prefix()))
            .await
            .map_err(Error::backend)?;
        client
            .delete(queued_prefix(repo_key), Some(etcd_client::DeleteOptions::new().with_prefix()))
            .await
            .map_err(Error::backend)?;
        client
            .delete(repo_state_key(repo_key), None)
            .await
            .map_err(Error::backend)?;
        Ok(())
    }

    async fn get_all_repositories_with_state(&self) -> Result<Vec<RepoSnapshot>> {
        let mut client = self.client.clone();
        let resp = client
            .get("/pac/concurrency/", Some(GetOptions::new().with_prefix()))
            .await
            .map_err(Error::backend)?;
        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                let key = String::from_utf8_lossy(kv.key()).to_string();
                let repo_key = repo_key_from_state_key(&key)?;
                Some(RepoSnapshot {
                    repo_key: repo_key.to_string(),
                    state: String::from_utf8_lossy(kv.value()).to_string(),
                })
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        for handle in self.watchers.lock().await.drain(..) {
            handle.abort();
        }
        Ok(())
    }
}

impl EtcdDriver {
    async fn clear_queued(&self, repo_key: &str, run_key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .delete(queued_key(repo_key, run_key), None)
            .await
            .map_err(Error::backend)?;
        client
            .delete(queued_by_run_key(run_key), None)
            .await
            .map_err(Error::backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::repo_key_from_state_key;

    #[test]
    fn recovers_namespaced_repo_key() {
        assert_eq!(
            repo_key_from_state_key("/pac/concurrency/ns/p/state"),
            Some("ns/p")
        );
    }

    #[test]
    fn skips_per_run_auxiliary_state() {
        assert_eq!(
            repo_key_from_state_key("/pac/concurrency/pr/ns/r1/state"),
            None
        );
    }

    #[test]
    fn ignores_unrelated_keys() {
        assert_eq!(repo_key_from_state_key("/pac/leases/ns/p/r1"), None);
    }
}
