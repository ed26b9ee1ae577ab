//! C2: the backend-specific persistence contract. The queue manager and
//! concurrency manager program against [`Driver`] only; `memory`, `etcd`
//! and `postgres` are interchangeable implementations selected at startup
//! by [`DriverConfig`].
use crate::error::Result;
use crate::repo::RepoRef;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;
#[cfg(feature = "postgresql")]
pub mod postgres;

/// Opaque token returned by [`Driver::acquire_slot`], required (or
/// optional — see [`ReleaseKey`]) by [`Driver::release_slot`]. Variant
/// chosen by whichever backend issued it; a driver that receives a handle
/// of the wrong variant returns [`crate::error::Error::InvalidHandle`]
/// rather than attempting to interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handle {
    Memory(Uuid),
    Etcd(i64),
    Postgres(i64),
}

impl Handle {
    pub fn driver_name(&self) -> &'static str {
        match self {
            Handle::Memory(_) => "memory",
            Handle::Etcd(_) => "etcd",
            Handle::Postgres(_) => "postgresql",
        }
    }
}

/// Arguments to [`Driver::release_slot`]. `handle` is the fast path — O(1)
/// revoke/delete by id, available to the KV and RDBMS backends where the
/// handle *is* the primary key. When `handle` is `None` (the caller lost
/// it, e.g. across a reconciler restart before `activeLeases` was
/// repopulated) the driver falls back to a lookup by the `(repo_key,
/// run_key)` unique constraint; every backend supports the fallback, the
/// memory backend uses it unconditionally since its slot map is keyed
/// that way already. See the "handle-less release" design note.
#[derive(Debug, Clone)]
pub struct ReleaseRequest<'a> {
    pub handle: Option<Handle>,
    pub run_key: &'a str,
    pub repo_key: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Queued,
    Running,
    Released,
}

/// A queued run as returned by a timestamp-aware listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRun {
    pub run_key: String,
    /// Nanoseconds since the Unix epoch; the ordering key `InitQueues`
    /// seeds the priority queue with.
    pub created_at: i64,
}

/// One entry from `GetAllRepositoriesWithState`, driving `InitQueues`
/// recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSnapshot {
    pub repo_key: String,
    pub state: String,
}

/// Invoked by a driver's watcher when it observes a slot released for the
/// subscribed repo. Must not block the notification loop — drivers spawn
/// one task per delivery (or a bounded pool) so a slow callback for one
/// repo cannot stall another's watcher.
pub type SlotCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait Driver: Send + Sync {
    /// Atomically admit `run_key` against `repo`'s current
    /// `concurrency_limit`. `repo.is_unlimited()` short-circuits to an
    /// unconditional `(true, None)` with no slot materialized. A
    /// duplicate call for an already-`running` (repo, run) pair succeeds
    /// idempotently, returning the existing lease — see
    /// `DESIGN.md`'s resolution of the open question in spec §9.
    async fn acquire_slot(&self, repo: &RepoRef, run_key: &str) -> Result<(bool, Option<Handle>)>;

    /// Idempotent: a second release of an already-released (or never
    /// running) slot is a no-op, not an error. Returns whether this call
    /// was the one that actually transitioned a running slot to released,
    /// so callers can avoid double-counting metrics/state writes on a
    /// duplicate release (spec §8 property 5).
    async fn release_slot(&self, req: ReleaseRequest<'_>) -> Result<bool>;

    /// Count of running, non-expired slots for `repo_key`.
    async fn get_current_slots(&self, repo_key: &str) -> Result<u32>;

    async fn get_running_pipeline_runs(&self, repo_key: &str) -> Result<Vec<String>>;

    /// Timestamp-aware where the backend can support it (KV, RDBMS);
    /// ordering is reconstructed by the caller from `created_at`.
    async fn get_queued_pipeline_runs(&self, repo_key: &str) -> Result<Vec<QueuedRun>>;

    /// Fire-and-forget: the returned future resolves once the
    /// subscription is established; the watch itself runs for the
    /// lifetime of the driver (or until `close`).
    async fn watch_slot_availability(&self, repo_key: &str, on_release: SlotCallback)
        -> Result<()>;

    async fn set_repository_state(&self, repo_key: &str, state: &str) -> Result<()>;
    async fn get_repository_state(&self, repo_key: &str) -> Result<Option<String>>;

    /// `repo` is consulted only when `state == "queued"`, to materialize a
    /// queued slot (a driver needs the owning repo's identity to create
    /// one; a plain state update for an already-known run does not).
    async fn set_pipeline_run_state(
        &self,
        run_key: &str,
        state: &str,
        repo: Option<&RepoRef>,
    ) -> Result<()>;
    async fn get_pipeline_run_state(&self, run_key: &str) -> Result<Option<String>>;

    /// Delete every slot and state associated with `repo_key`.
    async fn cleanup_repository(&self, repo_key: &str) -> Result<()>;

    /// For recovery: every repo the driver currently has state for.
    async fn get_all_repositories_with_state(&self) -> Result<Vec<RepoSnapshot>>;

    async fn close(&self) -> Result<()>;
}

/// `etcd-endpoints -mode` from spec §6: `mock` selects an in-process fake
/// so tests don't need a real etcd cluster.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EtcdMode {
    Real,
    Mock,
}

/// Construction-time selection of backend, mirroring §6's enumerated
/// configuration options one-for-one. `runctl-daemon` deserializes this
/// directly from its TOML config (overlaid with CLI flags); an unknown
/// `driver` tag or a variant missing a required field is a
/// `serde`/`ConfigInvalid` failure before any I/O happens.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum DriverConfig {
    Memory {
        #[serde(with = "humantime_serde", default = "default_memory_ttl")]
        lease_ttl: Duration,
    },
    Etcd {
        endpoints: Vec<String>,
        #[serde(with = "humantime_serde", default = "default_dial_timeout")]
        dial_timeout: Duration,
        username: Option<String>,
        password: Option<String>,
        #[serde(default = "default_etcd_mode")]
        mode: EtcdMode,
        #[serde(default)]
        tls: Option<TlsConfig>,
        #[serde(with = "humantime_serde", default = "default_kv_lease_ttl")]
        lease_ttl: Duration,
    },
    Postgresql {
        host: String,
        #[serde(default = "default_pg_port")]
        port: u16,
        database: String,
        username: String,
        password: String,
        #[serde(default = "default_ssl_mode")]
        ssl_mode: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        #[serde(with = "humantime_serde", default = "default_connection_timeout")]
        connection_timeout: Duration,
        #[serde(with = "humantime_serde", default = "default_kv_lease_ttl")]
        lease_ttl: Duration,
    },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TlsConfig {
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

fn default_memory_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_kv_lease_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}
fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_etcd_mode() -> EtcdMode {
    EtcdMode::Real
}
fn default_pg_port() -> u16 {
    5432
}
fn default_ssl_mode() -> String {
    "prefer".to_string()
}
fn default_max_connections() -> u32 {
    10
}
fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
