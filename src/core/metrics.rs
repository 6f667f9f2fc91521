use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    if PROM_HANDLE.set(handle).is_ok() {
        describe_instruments();
    }
    Ok(())
}

fn describe_instruments() {
    metrics::describe_counter!("http_requests_total", "HTTP requests by response status");
    metrics::describe_histogram!("http_request_duration_seconds", "HTTP request latency");
    metrics::describe_counter!("ledger_blocks_appended_total", "Ledger blocks appended by kind");
    metrics::describe_counter!("interventions_opened_total", "Interventions opened by reason");
    metrics::describe_counter!(
        "adapter_transient_failures_total",
        "Transient upstream adapter failures by adapter"
    );
    metrics::describe_counter!("sheets_finalized_total", "Sheets that reached FINALIZED");
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}
