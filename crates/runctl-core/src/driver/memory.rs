//! In-process backend: a single mutex guarding every map. No persistence
//! across restarts — `get_all_repositories_with_state` is expected to (and
//! correctly should) come back empty, since `InitQueues` against a memory
//! driver has nothing to recover. Grounded on the lease/Notify pairing
//! `throttle`'s `LeaseSet` uses for its in-memory store, extended here
//! with queued-state tracking and a count-scan admission check.
use super::{Driver, Handle, QueuedRun, ReleaseRequest, RepoSnapshot, SlotCallback, SlotState};
use crate::error::{Error, Result};
use crate::repo::RepoRef;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SlotInfo {
    handle: Uuid,
    state: SlotState,
    created_at: i64,
    expires_at: Option<Instant>,
}

impl SlotInfo {
    fn is_running_and_live(&self) -> bool {
        self.state == SlotState::Running
            && self.expires_at.map(|e| e > Instant::now()).unwrap_or(true)
    }
}

#[derive(Default)]
struct Inner {
    // repo_key -> run_key -> slot
    slots: HashMap<String, HashMap<String, SlotInfo>>,
    repo_states: HashMap<String, String>,
    run_states: HashMap<String, String>,
}

pub struct MemoryDriver {
    inner: std::sync::Mutex<Inner>,
    notifies: std::sync::Mutex<HashMap<String, Arc<Notify>>>,
    lease_ttl: Duration,
    watchers: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

impl MemoryDriver {
    pub fn new(lease_ttl: Duration) -> Arc<Self> {
        let driver = Arc::new(Self {
            inner: std::sync::Mutex::new(Inner::default()),
            notifies: std::sync::Mutex::new(HashMap::new()),
            lease_ttl,
            watchers: AsyncMutex::new(Vec::new()),
        });
        driver.clone().spawn_sweeper();
        driver
    }

    fn notify_for(&self, repo_key: &str) -> Arc<Notify> {
        self.notifies
            .lock()
            .unwrap()
            .entry(repo_key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn spawn_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let mut released_repos = Vec::new();
                {
                    let mut inner = self.inner.lock().unwrap();
                    let now = Instant::now();
                    for (repo_key, runs) in inner.slots.iter_mut() {
                        let mut dropped = false;
                        runs.retain(|_, slot| {
                            let expired = slot.state == SlotState::Running
                                && slot.expires_at.map(|e| e <= now).unwrap_or(false);
                            if expired {
                                dropped = true;
                            }
                            !expired
                        });
                        if dropped {
                            released_repos.push(repo_key.clone());
                        }
                    }
                }
                for repo_key in released_repos {
                    self.notify_for(&repo_key).notify_waiters();
                }
            }
        });
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn acquire_slot(&self, repo: &RepoRef, run_key: &str) -> Result<(bool, Option<Handle>)> {
        let Some(limit) = repo.effective_limit() else {
            return Ok((true, None));
        };
        let repo_key = repo.key();
        let mut inner = self.inner.lock().unwrap();
        let runs = inner.slots.entry(repo_key.clone()).or_default();

        if let Some(existing) = runs.get(run_key) {
            if existing.is_running_and_live() {
                return Ok((true, Some(Handle::Memory(existing.handle))));
            }
        }

        let running = runs.values().filter(|s| s.is_running_and_live()).count() as u32;
        if running >= limit {
            return Ok((false, None));
        }

        let handle = Uuid::new_v4();
        runs.insert(
            run_key.to_string(),
            SlotInfo {
                handle,
                state: SlotState::Running,
                created_at: now_nanos(),
                expires_at: Some(Instant::now() + self.lease_ttl),
            },
        );
        tracing::info!(repo_key = %repo_key, run_key, running = running + 1, limit, "slot acquired (memory)");
        Ok((true, Some(Handle::Memory(handle))))
    }

    async fn release_slot(&self, req: ReleaseRequest<'_>) -> Result<bool> {
        if let Some(handle) = &req.handle {
            if !matches!(handle, Handle::Memory(_)) {
                return Err(Error::InvalidHandle {
                    driver: "memory",
                    observed: handle.driver_name().to_string(),
                });
            }
        }
        let released = {
            let mut inner = self.inner.lock().unwrap();
            match inner
                .slots
                .get_mut(req.repo_key)
                .and_then(|runs| runs.get_mut(req.run_key))
            {
                Some(slot) if slot.state == SlotState::Running => {
                    slot.state = SlotState::Released;
                    true
                }
                _ => false,
            }
        };
        if released {
            tracing::info!(repo_key = req.repo_key, run_key = req.run_key, "slot released (memory)");
            self.notify_for(req.repo_key).notify_waiters();
        }
        Ok(released)
    }

    async fn get_current_slots(&self, repo_key: &str) -> Result<u32> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .slots
            .get(repo_key)
            .map(|runs| runs.values().filter(|s| s.is_running_and_live()).count() as u32)
            .unwrap_or(0))
    }

    async fn get_running_pipeline_runs(&self, repo_key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .slots
            .get(repo_key)
            .map(|runs| {
                runs.iter()
                    .filter(|(_, s)| s.is_running_and_live())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_queued_pipeline_runs(&self, repo_key: &str) -> Result<Vec<QueuedRun>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .slots
            .get(repo_key)
            .map(|runs| {
                runs.iter()
                    .filter(|(_, s)| s.state == SlotState::Queued)
                    .map(|(k, s)| QueuedRun {
                        run_key: k.clone(),
                        created_at: s.created_at,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn watch_slot_availability(
        &self,
        repo_key: &str,
        on_release: SlotCallback,
    ) -> Result<()> {
        let driver_notify = self.notify_for(repo_key);
        let handle = tokio::spawn(async move {
            loop {
                // Poll on a 5s tick as a fallback in case a notification
                // is missed between `notified()` calls (the `Notify`
                // default permit is single-shot).
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = driver_notify.notified() => {}
                }
                on_release().await;
            }
        });
        self.watchers.lock().await.push(handle);
        Ok(())
    }

    async fn set_repository_state(&self, repo_key: &str, state: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .repo_states
            .insert(repo_key.to_string(), state.to_string());
        Ok(())
    }

    async fn get_repository_state(&self, repo_key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().repo_states.get(repo_key).cloned())
    }

    async fn set_pipeline_run_state(
        &self,
        run_key: &str,
        state: &str,
        repo: Option<&RepoRef>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .run_states
            .insert(run_key.to_string(), state.to_string());
        if state == "queued" {
            if let Some(repo) = repo {
                let runs = inner.slots.entry(repo.key()).or_default();
                runs.entry(run_key.to_string()).or_insert_with(|| SlotInfo {
                    handle: Uuid::new_v4(),
                    state: SlotState::Queued,
                    created_at: now_nanos(),
                    expires_at: None,
                });
            }
        }
        Ok(())
    }

    async fn get_pipeline_run_state(&self, run_key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().run_states.get(run_key).cloned())
    }

    async fn cleanup_repository(&self, repo_key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.slots.remove(repo_key);
        inner.repo_states.remove(repo_key);
        self.notifies.lock().unwrap().remove(repo_key);
        Ok(())
    }

    async fn get_all_repositories_with_state(&self) -> Result<Vec<RepoSnapshot>> {
        // Memory backend has no cross-restart persistence; a fresh
        // process always returns an empty set, which is correct: there is
        // nothing to recover.
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<()> {
        for handle in self.watchers.lock().await.drain(..) {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn repo(limit: Option<u32>) -> RepoRef {
        RepoRef::new("ns", "p", limit)
    }

    #[tokio::test]
    async fn unlimited_repo_always_acquires() {
        let d = MemoryDriver::new(Duration::from_secs(60));
        let (ok, handle) = d.acquire_slot(&repo(None), "r1").await.unwrap();
        assert!(ok);
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn limit_enforced_and_idempotent_duplicate() {
        let d = MemoryDriver::new(Duration::from_secs(60));
        let r = repo(Some(2));
        let (ok1, h1) = d.acquire_slot(&r, "r1").await.unwrap();
        let (ok2, h2) = d.acquire_slot(&r, "r2").await.unwrap();
        let (ok3, h3) = d.acquire_slot(&r, "r3").await.unwrap();
        assert!(ok1 && ok2);
        assert!(!ok3);
        assert!(h3.is_none());
        assert_eq!(d.get_current_slots(&r.key()).await.unwrap(), 2);

        // duplicate acquire on an already-running run is idempotent
        let (ok1_again, h1_again) = d.acquire_slot(&r, "r1").await.unwrap();
        assert!(ok1_again);
        assert_eq!(h1, h1_again);
    }

    #[tokio::test]
    async fn release_frees_a_slot() {
        let d = MemoryDriver::new(Duration::from_secs(60));
        let r = repo(Some(1));
        d.acquire_slot(&r, "r1").await.unwrap();
        let released = d
            .release_slot(ReleaseRequest {
                handle: None,
                run_key: "r1",
                repo_key: &r.key(),
            })
            .await
            .unwrap();
        assert!(released);
        assert_eq!(d.get_current_slots(&r.key()).await.unwrap(), 0);
        let (ok, _) = d.acquire_slot(&r, "r2").await.unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn duplicate_release_reports_no_further_change() {
        let d = MemoryDriver::new(Duration::from_secs(60));
        let r = repo(Some(1));
        let repo_key = r.key();
        d.acquire_slot(&r, "r1").await.unwrap();
        let first = d
            .release_slot(ReleaseRequest {
                handle: None,
                run_key: "r1",
                repo_key: &repo_key,
            })
            .await
            .unwrap();
        let second = d
            .release_slot(ReleaseRequest {
                handle: None,
                run_key: "r1",
                repo_key: &repo_key,
            })
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn cleanup_clears_everything() {
        let d = MemoryDriver::new(Duration::from_secs(60));
        let r = repo(Some(1));
        d.acquire_slot(&r, "r1").await.unwrap();
        d.set_repository_state(&r.key(), "active").await.unwrap();
        d.cleanup_repository(&r.key()).await.unwrap();
        assert_eq!(d.get_current_slots(&r.key()).await.unwrap(), 0);
        assert_eq!(d.get_repository_state(&r.key()).await.unwrap(), None);
    }
}
