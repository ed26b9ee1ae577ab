//! Structured diagnostic logging, set up the way the teacher's
//! `kumo-server-common::diagnostic_logging` does it: a `clap`-selectable
//! render format, an optional rolling file appender, and a reloadable
//! `EnvFilter` so the running process can pick up a new filter without a
//! restart.
use clap::ValueEnum;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

static FILTER_RELOAD_HANDLE: OnceLock<Box<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>> =
    OnceLock::new();

/// Apply a new filter string to the running subscriber. Returns an error if
/// logging hasn't been initialized yet, or if the filter fails to parse.
pub fn set_diagnostic_log_filter(new_filter: &str) -> anyhow::Result<()> {
    let func = FILTER_RELOAD_HANDLE
        .get()
        .ok_or_else(|| anyhow::anyhow!("logging has not been initialized"))?;
    (func)(new_filter)
}

#[derive(Debug, Clone, Copy, ValueEnum, serde::Serialize, serde::Deserialize)]
#[clap(rename_all = "kebab_case")]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

impl Default for DiagnosticFormat {
    fn default() -> Self {
        DiagnosticFormat::Full
    }
}

pub struct LoggingConfig<'a> {
    pub log_dir: Option<PathBuf>,
    pub filter_env_var: &'a str,
    pub default_filter: &'a str,
    pub diag_format: DiagnosticFormat,
}

impl<'a> LoggingConfig<'a> {
    pub fn init(&self) -> anyhow::Result<()> {
        let (non_blocking, _guard);
        let writer = if let Some(log_dir) = &self.log_dir {
            let file_appender = tracing_appender::rolling::hourly(log_dir, "runctl.log");
            (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
            // Leak the guard: the flusher must outlive this function, and
            // the process owns exactly one of these for its whole lifetime.
            Box::leak(Box::new(_guard));
            BoxMakeWriter::new(non_blocking)
        } else {
            BoxMakeWriter::new(std::io::stderr)
        };

        let layer = fmt::layer().with_thread_names(true).with_writer(writer);
        let layer = match self.diag_format {
            DiagnosticFormat::Pretty => layer.pretty().boxed(),
            DiagnosticFormat::Full => layer.boxed(),
            DiagnosticFormat::Compact => layer.compact().boxed(),
            DiagnosticFormat::Json => layer.json().boxed(),
        };

        let env_filter = EnvFilter::try_new(
            std::env::var(self.filter_env_var)
                .as_deref()
                .unwrap_or(self.default_filter),
        )?;
        let (env_filter, reload_handle) = tracing_subscriber::reload::Layer::new(env_filter);
        tracing_subscriber::registry()
            .with(layer.with_filter(env_filter))
            .init();

        FILTER_RELOAD_HANDLE
            .set(Box::new(move |new_filter: &str| {
                let f = EnvFilter::try_new(new_filter)?;
                reload_handle.reload(f)?;
                Ok(())
            }))
            .map_err(|_| anyhow::anyhow!("logging already initialized"))?;

        Ok(())
    }
}
