//! C3: the per-process registry of per-repo priority queues, layered on a
//! driver. Owns `QueueEntry` storage exclusively; the driver owns `Slot`
//! storage. See the module-level design note on avoiding a cyclic
//! reference — this holds a one-way `Arc<dyn Driver>`, never the reverse.
use crate::driver::{Driver, ReleaseRequest, SlotCallback};
use crate::error::Result;
use crate::metrics;
use crate::queue::PriorityQueue;
use crate::repo::RepoRef;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

pub struct QueueManager {
    driver: Arc<dyn Driver>,
    queues: RwLock<HashMap<String, PriorityQueue<String>>>,
}

impl QueueManager {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Reconstruct every repo's in-memory queue from the driver's
    /// persisted state. Called once at startup; a failure for one repo is
    /// logged and skipped rather than aborting the remainder.
    pub async fn init_queues(&self) -> Result<()> {
        let repos = match self.driver.get_all_repositories_with_state().await {
            Ok(repos) => repos,
            Err(err) => {
                tracing::warn!(error = %err, "InitQueues: could not list repositories, starting with empty queue state");
                return Ok(());
            }
        };
        for repo in repos {
            if let Err(err) = self.seed_repo(&repo.repo_key).await {
                tracing::warn!(repo_key = %repo.repo_key, error = %err, "InitQueues: failed to seed repo, continuing with remainder");
            }
        }
        Ok(())
    }

    /// Re-run the same reconstruction `InitQueues` does for a single repo;
    /// used to repair in-memory/driver divergence (`StateDrift`).
    pub async fn sync_state_from_driver(&self, repo_key: &str) -> Result<()> {
        self.seed_repo(repo_key).await
    }

    async fn seed_repo(&self, repo_key: &str) -> Result<()> {
        let queued = self.driver.get_queued_pipeline_runs(repo_key).await?;
        let mut queue = PriorityQueue::new();
        for (i, entry) in queued.into_iter().enumerate() {
            // A driver with no timestamp-aware listing (or one returning
            // `0`) still needs a stable order: fabricate an
            // always-increasing key from arrival order. The memory
            // backend always returns an empty list here — correct, since
            // it has nothing to recover.
            let creation_time = if entry.created_at != 0 {
                entry.created_at
            } else {
                now_nanos() + i as i64 * 1_000_000
            };
            queue.add(entry.run_key, creation_time);
        }
        metrics::QUEUE_DEPTH
            .with_label_values(&[repo_key])
            .set(queue.len() as i64);
        self.queues.write().insert(repo_key.to_string(), queue);
        Ok(())
    }

    pub async fn add_to_pending_queue(&self, repo: &RepoRef, run_keys: &[String]) -> Result<()> {
        {
            let mut queues = self.queues.write();
            let queue = queues.entry(repo.key()).or_insert_with(PriorityQueue::new);
            for key in run_keys {
                queue.add(key.clone(), now_nanos());
            }
            metrics::QUEUE_DEPTH
                .with_label_values(&[repo.key().as_str()])
                .set(queue.len() as i64);
        }
        for key in run_keys {
            self.driver
                .set_pipeline_run_state(key, "queued", Some(repo))
                .await?;
        }
        Ok(())
    }

    /// Add `run_keys` to the pending queue, then attempt to promote up to
    /// `repo`'s limit worth of entries straight to running. Returns the
    /// keys that were actually acquired.
    pub async fn add_list_to_running_queue(
        &self,
        repo: &RepoRef,
        run_keys: &[String],
    ) -> Result<Vec<String>> {
        self.add_to_pending_queue(repo, run_keys).await?;
        let Some(limit) = repo.effective_limit() else {
            return Ok(run_keys.to_vec());
        };

        let mut acquired = Vec::new();
        for _ in 0..limit {
            let entry = {
                let mut queues = self.queues.write();
                let Some(queue) = queues.get_mut(&repo.key()) else {
                    break;
                };
                let popped = queue.pop_item();
                metrics::QUEUE_DEPTH
                    .with_label_values(&[repo.key().as_str()])
                    .set(queue.len() as i64);
                popped
            };
            let Some(entry) = entry else { break };

            match self.driver.acquire_slot(repo, &entry.key).await {
                Ok((true, _handle)) => acquired.push(entry.key),
                Ok((false, _)) => self.requeue(repo, entry.key, entry.creation_time),
                Err(err) => {
                    tracing::warn!(
                        repo_key = %repo.key(), run_key = %entry.key, error = %err,
                        "AddListToRunningQueue: acquire failed, re-queueing"
                    );
                    self.requeue(repo, entry.key, entry.creation_time);
                }
            }
        }
        Ok(acquired)
    }

    fn requeue(&self, repo: &RepoRef, run_key: String, creation_time: i64) {
        let mut queues = self.queues.write();
        if let Some(queue) = queues.get_mut(&repo.key()) {
            queue.add(run_key, creation_time);
            metrics::QUEUE_DEPTH
                .with_label_values(&[repo.key().as_str()])
                .set(queue.len() as i64);
        }
    }

    pub fn queued_pipeline_runs(&self, repo_key: &str) -> Vec<String> {
        self.queues
            .read()
            .get(repo_key)
            .map(|q| q.pending_items())
            .unwrap_or_default()
    }

    pub async fn running_pipeline_runs(&self, repo_key: &str) -> Result<Vec<String>> {
        self.driver.get_running_pipeline_runs(repo_key).await
    }

    /// Drop `run_key` from the in-memory queue only — no driver call.
    /// Used once a run has been promoted to running elsewhere (e.g. a
    /// direct `AcquireSlot` outside the `AddListToRunningQueue` promotion
    /// loop), so `QueuedPipelineRuns` stops reporting an already-running
    /// run as still waiting.
    pub fn drop_from_queue(&self, repo_key: &str, run_key: &str) {
        let mut queues = self.queues.write();
        if let Some(queue) = queues.get_mut(repo_key) {
            queue.remove(&run_key.to_string());
            metrics::QUEUE_DEPTH
                .with_label_values(&[repo_key])
                .set(queue.len() as i64);
        }
    }

    /// Remove `run_key` from the in-memory queue and best-effort release
    /// at the driver. The handle is unknown at this call site, so this
    /// always takes the handle-less `(repoKey, runKey)` release path.
    pub async fn remove_from_queue(&self, repo_key: &str, run_key: &str) -> Result<()> {
        self.drop_from_queue(repo_key, run_key);
        if let Err(err) = self
            .driver
            .release_slot(ReleaseRequest {
                handle: None,
                run_key,
                repo_key,
            })
            .await
        {
            tracing::warn!(repo_key, run_key, error = %err, "RemoveFromQueue: best-effort driver release failed");
        }
        Ok(())
    }

    pub async fn setup_watcher(&self, repo_key: &str, callback: SlotCallback) -> Result<()> {
        self.driver.watch_slot_availability(repo_key, callback).await
    }

    pub async fn remove_repository(&self, repo_key: &str) -> Result<()> {
        self.queues.write().remove(repo_key);
        self.driver.cleanup_repository(repo_key).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::memory::MemoryDriver;
    use std::time::Duration;

    fn repo(limit: Option<u32>) -> RepoRef {
        RepoRef::new("ns", "p", limit)
    }

    #[tokio::test]
    async fn add_list_to_running_queue_admits_up_to_limit() {
        let driver = MemoryDriver::new(Duration::from_secs(60));
        let qm = QueueManager::new(driver);
        let r = repo(Some(2));
        let keys = vec!["r1".to_string(), "r2".to_string(), "r3".to_string()];
        let acquired = qm.add_list_to_running_queue(&r, &keys).await.unwrap();
        assert_eq!(acquired, vec!["r1", "r2"]);
        assert_eq!(qm.queued_pipeline_runs(&r.key()), vec!["r3".to_string()]);
    }

    #[tokio::test]
    async fn unlimited_repo_returns_pending_list_verbatim() {
        let driver = MemoryDriver::new(Duration::from_secs(60));
        let qm = QueueManager::new(driver);
        let r = repo(None);
        let keys = vec!["r1".to_string(), "r2".to_string()];
        let acquired = qm.add_list_to_running_queue(&r, &keys).await.unwrap();
        assert_eq!(acquired, keys);
    }

    #[tokio::test]
    async fn remove_from_queue_drops_entry() {
        let driver = MemoryDriver::new(Duration::from_secs(60));
        let qm = QueueManager::new(driver);
        let r = repo(Some(1));
        qm.add_to_pending_queue(&r, &["r1".to_string()]).await.unwrap();
        qm.remove_from_queue(&r.key(), "r1").await.unwrap();
        assert!(qm.queued_pipeline_runs(&r.key()).is_empty());
    }
}
