//! Prometheus metrics
//!
//! Counters and histograms for the dispatch path, exposed on
//! `GET /metrics`.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use orchestrator_core::{CommandResult, InterfaceTag};

use crate::ServerError;

/// Install the Prometheus recorder and describe the metric families.
pub fn init_metrics() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Init(format!("metrics recorder: {e}")))?;

    describe_counter!(
        "orchestrator_commands_total",
        "Terminal command results by interface and outcome"
    );
    describe_counter!(
        "orchestrator_buffer_discards_total",
        "Results discarded from full adapter delivery buffers"
    );
    describe_histogram!(
        "orchestrator_command_latency_ms",
        "End-to-end command latency in milliseconds"
    );

    Ok(handle)
}

/// One terminal result crossed the dispatch boundary.
pub fn record_command_result(result: &CommandResult) {
    let outcome = match &result.error {
        None => "success",
        Some(kind) => kind.as_str(),
    };
    counter!(
        "orchestrator_commands_total",
        "interface" => result.interface.as_str(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        "orchestrator_command_latency_ms",
        "interface" => result.interface.as_str()
    )
    .record(result.latency_ms as f64);
}

pub fn record_buffer_discard(interface: InterfaceTag) {
    counter!(
        "orchestrator_buffer_discards_total",
        "interface" => interface.as_str()
    )
    .increment(1);
}
