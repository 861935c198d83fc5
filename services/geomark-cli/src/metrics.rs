//! Prometheus rendering of pipeline metrics
//!
//! The pipeline crates emit through the `metrics` facade:
//!
//! - `auth_refresh_total` (counter): label `outcome`
//! - `auth_refresh_waiters_total` (counter)
//! - `auth_retries_total` (counter)
//! - `auth_session_terminations_total` (counter): label `reason`
//!
//! With `--metrics` the CLI installs a recorder at startup and prints the
//! text exposition to stderr before exiting.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return its render handle.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}
