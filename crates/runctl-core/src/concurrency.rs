//! C4: the public facade composing the driver and queue manager, plus the
//! `activeLeases` bookkeeping that lets `ReleaseSlot` find a handle the
//! caller lost (e.g. a reconciler restart within one process).
use crate::driver::memory::MemoryDriver;
#[cfg(feature = "etcd")]
use crate::driver::etcd::EtcdDriver;
#[cfg(feature = "postgresql")]
use crate::driver::postgres::PostgresDriver;
#[cfg(feature = "etcd")]
use crate::driver::EtcdMode;
use crate::driver::{Driver, DriverConfig, Handle, ReleaseRequest, SlotCallback};
use crate::error::{Error, Result};
use crate::manager::QueueManager;
use crate::metrics;
use crate::repo::RepoRef;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct ConcurrencyManager {
    driver: Arc<dyn Driver>,
    queue_manager: QueueManager,
    active_leases: RwLock<HashMap<String, Handle>>,
}

impl ConcurrencyManager {
    pub fn with_memory_driver(lease_ttl: Duration) -> Self {
        Self::from_driver(MemoryDriver::new(lease_ttl))
    }

    fn from_driver(driver: Arc<dyn Driver>) -> Self {
        Self {
            queue_manager: QueueManager::new(driver.clone()),
            driver,
            active_leases: RwLock::new(HashMap::new()),
        }
    }

    /// Construct the driver (and therefore the backend connection) chosen
    /// by `config`, validating backend-specific sub-config as it goes.
    /// Unknown/unsupported selections fail fast with `ConfigInvalid`,
    /// before any I/O happens.
    pub async fn from_config(config: &DriverConfig) -> Result<Self> {
        match config {
            DriverConfig::Memory { lease_ttl } => Ok(Self::with_memory_driver(*lease_ttl)),

            #[cfg(feature = "etcd")]
            DriverConfig::Etcd {
                endpoints,
                dial_timeout,
                username,
                password,
                mode,
                tls: _,
                lease_ttl,
            } => match mode {
                // `mode=mock` per spec §6: an in-process fake for tests
                // that doesn't require a live etcd cluster. The memory
                // driver already has the right semantics for this.
                EtcdMode::Mock => Ok(Self::with_memory_driver(*lease_ttl)),
                EtcdMode::Real => {
                    if endpoints.is_empty() {
                        return Err(Error::ConfigInvalid(
                            "etcd driver requires at least one endpoint".to_string(),
                        ));
                    }
                    let driver = EtcdDriver::connect(
                        endpoints,
                        *dial_timeout,
                        username.as_deref(),
                        password.as_deref(),
                        *lease_ttl,
                    )
                    .await?;
                    Ok(Self::from_driver(driver))
                }
            },
            #[cfg(not(feature = "etcd"))]
            DriverConfig::Etcd { .. } => Err(Error::ConfigInvalid(
                "driver \"etcd\" selected but this binary was built without the etcd feature"
                    .to_string(),
            )),

            #[cfg(feature = "postgresql")]
            DriverConfig::Postgresql {
                host,
                port,
                database,
                username,
                password,
                ssl_mode,
                max_connections,
                connection_timeout,
                lease_ttl,
            } => {
                let driver = PostgresDriver::connect(
                    host,
                    *port,
                    database,
                    username,
                    password,
                    ssl_mode,
                    *max_connections,
                    *connection_timeout,
                    *lease_ttl,
                )
                .await?;
                Ok(Self::from_driver(driver))
            }
            #[cfg(not(feature = "postgresql"))]
            DriverConfig::Postgresql { .. } => Err(Error::ConfigInvalid(
                "driver \"postgresql\" selected but this binary was built without the postgresql feature"
                    .to_string(),
            )),
        }
    }

    pub async fn init_queues(&self) -> Result<()> {
        self.queue_manager.init_queues().await
    }

    pub async fn add_to_pending_queue(&self, repo: &RepoRef, run_keys: &[String]) -> Result<()> {
        self.queue_manager.add_to_pending_queue(repo, run_keys).await
    }

    pub async fn add_list_to_running_queue(
        &self,
        repo: &RepoRef,
        run_keys: &[String],
    ) -> Result<Vec<String>> {
        let acquired = self
            .queue_manager
            .add_list_to_running_queue(repo, run_keys)
            .await?;
        Ok(acquired)
    }

    pub async fn acquire_slot(
        &self,
        repo: &RepoRef,
        run_key: &str,
    ) -> Result<(bool, Option<Handle>)> {
        let timer = metrics::ACQUIRE_DURATION.start_timer();
        let result = self.driver.acquire_slot(repo, run_key).await;
        timer.observe_duration();

        let (ok, handle) = result?;
        let outcome = if ok { "acquired" } else { "limit_reached" };
        metrics::SLOT_ACQUIRE_TOTAL
            .with_label_values(&[repo.key().as_str(), outcome])
            .inc();

        if ok {
            self.driver
                .set_pipeline_run_state(run_key, "running", None)
                .await?;
            if let Some(handle) = &handle {
                self.active_leases
                    .write()
                    .insert(run_key.to_string(), handle.clone());
            }
            // The run is now running, not waiting — drop it from the
            // queue manager's in-memory queue so `QueuedPipelineRuns`
            // stops reporting it (spec §4.3: read-through to the
            // in-memory queue, which this facade otherwise never prunes
            // on a direct `AcquireSlot` outside the promotion loop).
            self.queue_manager.drop_from_queue(&repo.key(), run_key);
            metrics::RUNNING_SLOTS
                .with_label_values(&[repo.key().as_str()])
                .inc();
        }
        Ok((ok, handle))
    }

    /// Release `run_key`'s slot. `handle` may be omitted — the internal
    /// `activeLeases` map is consulted first, then the driver falls back
    /// to the handle-less `(repoKey, runKey)` path if neither has it.
    /// Idempotent: a duplicate release of an already-released slot makes
    /// no further state write and does not move the metrics (spec §8
    /// property 5).
    pub async fn release_slot(
        &self,
        handle: Option<Handle>,
        run_key: &str,
        repo_key: &str,
    ) -> Result<()> {
        let handle = handle.or_else(|| self.active_leases.read().get(run_key).cloned());
        let released = self
            .driver
            .release_slot(ReleaseRequest {
                handle,
                run_key,
                repo_key,
            })
            .await?;
        self.active_leases.write().remove(run_key);
        if released {
            self.driver
                .set_pipeline_run_state(run_key, "released", None)
                .await?;
            metrics::SLOT_RELEASE_TOTAL
                .with_label_values(&[repo_key])
                .inc();
            metrics::RUNNING_SLOTS.with_label_values(&[repo_key]).dec();
        }
        Ok(())
    }

    pub async fn get_current_slots(&self, repo_key: &str) -> Result<u32> {
        self.driver.get_current_slots(repo_key).await
    }

    pub async fn get_running_pipeline_runs(&self, repo_key: &str) -> Result<Vec<String>> {
        self.driver.get_running_pipeline_runs(repo_key).await
    }

    pub fn queued_pipeline_runs(&self, repo_key: &str) -> Vec<String> {
        self.queue_manager.queued_pipeline_runs(repo_key)
    }

    pub async fn watch_slot_availability(
        &self,
        repo_key: &str,
        callback: SlotCallback,
    ) -> Result<()> {
        self.queue_manager.setup_watcher(repo_key, callback).await
    }

    pub async fn set_repository_state(&self, repo_key: &str, state: &str) -> Result<()> {
        self.driver.set_repository_state(repo_key, state).await
    }

    pub async fn get_repository_state(&self, repo_key: &str) -> Result<Option<String>> {
        self.driver.get_repository_state(repo_key).await
    }

    pub async fn set_pipeline_run_state(
        &self,
        run_key: &str,
        state: &str,
        repo: Option<&RepoRef>,
    ) -> Result<()> {
        self.driver.set_pipeline_run_state(run_key, state, repo).await
    }

    pub async fn get_pipeline_run_state(&self, run_key: &str) -> Result<Option<String>> {
        self.driver.get_pipeline_run_state(run_key).await
    }

    pub async fn cleanup_repository(&self, repo_key: &str) -> Result<()> {
        self.queue_manager.remove_repository(repo_key).await
    }

    pub async fn remove_from_queue(&self, repo_key: &str, run_key: &str) -> Result<()> {
        self.queue_manager.remove_from_queue(repo_key, run_key).await
    }

    pub async fn sync_state_from_driver(&self, repo_key: &str) -> Result<()> {
        self.queue_manager.sync_state_from_driver(repo_key).await
    }

    pub async fn close(&self) -> Result<()> {
        self.driver.close().await
    }
}
