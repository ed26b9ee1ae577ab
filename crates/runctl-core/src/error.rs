//! Error kinds the core distinguishes, by meaning rather than by backend
//! type. `LimitReached` is deliberately absent: per the admission
//! semantics, hitting the limit is an ordinary `Ok((false, None))`, not an
//! error (see [`crate::driver::Driver::acquire_slot`]).
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Driver I/O failure (network, disk, connection pool exhaustion).
    /// The caller should retry on its own schedule.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[source] anyhow::Error),

    /// A transaction/CAS commit lost a race with a concurrent acquirer.
    /// Callers should treat this exactly like `LimitReached`: not fatal,
    /// the run stays queued.
    #[error("lost a race acquiring a slot for {repo_key}/{run_key}")]
    AtomicityViolation { repo_key: String, run_key: String },

    /// `release_slot` was called with a handle that does not match the
    /// handle type this driver issues.
    #[error("invalid lease handle for driver {driver}: got {observed}")]
    InvalidHandle {
        driver: &'static str,
        observed: String,
    },

    /// In-memory queue state disagrees with the driver's persisted state.
    /// Not fatal; logged at warn and repaired via `sync_state_from_driver`.
    #[error("state drift for repo {repo_key}: {detail}")]
    StateDrift { repo_key: String, detail: String },

    /// Bad configuration at construction time: unknown driver name, missing
    /// endpoint, inconsistent TLS pairing, etc. Fail-stop.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        Error::BackendUnavailable(err.into())
    }
}
