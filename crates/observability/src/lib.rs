use std::sync::OnceLock;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the fmt subscriber. `RUST_LOG` wins over the service default.
/// Keep the returned guard alive for the life of the process.
pub fn init_tracing(service_name: &str, verbose: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{service_name}={default_level},{default_level}"))
    });

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .try_init();

    guard
}

pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;

    let _ = PROM_HANDLE.set(handle.clone());
    Ok(handle)
}

/// Prometheus text for the installed recorder, if any.
pub fn render_metrics() -> Option<String> {
    PROM_HANDLE.get().map(PrometheusHandle::render)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_handle_is_shared_and_renders_counters() {
        let first = init_metrics().expect("install recorder");
        let second = init_metrics().expect("reuse recorder");
        metrics::counter!("policy_loop_test_total").increment(2);
        let rendered = render_metrics().expect("rendered");
        assert!(rendered.contains("policy_loop_test_total"));
        assert_eq!(first.render(), second.render());
    }
}
