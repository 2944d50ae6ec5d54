//! Podlite runtime library.
//!
//! This crate provides the host-side API for running pods inside QEMU/KVM
//! microVMs: per-VM event-driven state machines, QMP device hotplug, the
//! guest-agent channel, and host-side storage and network helpers.

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

// Global guard for tracing-appender to keep the writer thread alive
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

pub mod metrics;
pub mod net;
pub mod pod;
pub mod qmp;
pub mod runtime;
pub mod storage;
pub mod util;
pub mod vm;

mod agent;
mod tty;

pub use runtime::core::PodliteRuntime;
pub use runtime::options::{PodliteOptions, VmBootConfig};
pub use runtime::types::VmId;

use podlite_shared::{PodliteError, PodliteResult};
use runtime::layout::FilesystemLayout;

/// Initialize tracing for podlite using the provided filesystem layout.
///
/// Logs are written to `<layout.home_dir()>/logs/podlite.log` with daily
/// rotation. Uses the `RUST_LOG` environment variable for filtering
/// (defaults to `info`). Idempotent: subsequent calls return immediately
/// once initialized.
pub fn init_logging_for(layout: &FilesystemLayout) -> PodliteResult<()> {
    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        PodliteError::Setup(format!(
            "Failed to create logs directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let _ = LOG_GUARD.get_or_init(|| {
        let file_appender = tracing_appender::rolling::daily(logs_dir, "podlite.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        // If global default subscriber is already set, this will return an error.
        // We ignore it to avoid interfering with host-configured tracing.
        util::register_to_tracing(non_blocking, env_filter);

        guard
    });

    Ok(())
}
