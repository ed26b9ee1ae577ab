//! The concurrency control core: a distributed, restart-survivable
//! admission controller enforcing per-repo run limits.
//!
//! Four cooperating pieces, leaves first:
//! - [`queue`] (C1) — an in-memory, per-repo FIFO of waiting run keys.
//! - [`driver`] (C2) — the backend contract (`memory`, `etcd`,
//!   `postgresql`) providing atomic slot admission and change
//!   notifications.
//! - [`manager`] (C3) — the per-repo in-memory queue registry layered on a
//!   driver, plus startup recovery.
//! - [`concurrency`] (C4) — the public facade: [`concurrency::ConcurrencyManager`].
pub mod concurrency;
pub mod driver;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod repo;

pub use concurrency::ConcurrencyManager;
pub use error::{Error, Result};
pub use repo::{NamespacedName, RepoRef, RunRef};
