//! Prometheus metrics recorder and metric names.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::RelayError;

/// Connections admitted (counter).
pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
/// Connections removed (counter, labels: reason).
pub const DISCONNECTIONS_TOTAL: &str = "relay_disconnections_total";
/// Connections currently in the active set (gauge).
pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
/// Broadcast passes run by the dispatch loop (counter).
pub const BROADCASTS_TOTAL: &str = "relay_broadcasts_total";
/// Payloads queued onto mailboxes (counter).
pub const DELIVERIES_TOTAL: &str = "relay_deliveries_total";
/// Connections evicted for a full mailbox (counter). Other removals are
/// only counted in [`DISCONNECTIONS_TOTAL`].
pub const EVICTIONS_TOTAL: &str = "relay_evictions_total";

/// Install the Prometheus recorder as the global metrics recorder.
///
/// Returns the handle used to render `/metrics`. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle, RelayError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

pub(crate) fn record_admitted(active: usize) {
    counter!(CONNECTIONS_TOTAL).increment(1);
    record_active(active);
}

pub(crate) fn record_removed(reason: &'static str, active: usize) {
    counter!(DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
    record_active(active);
}

pub(crate) fn record_broadcast(delivered: usize, evicted: usize) {
    counter!(BROADCASTS_TOTAL).increment(1);
    counter!(DELIVERIES_TOTAL).increment(delivered as u64);
    if evicted > 0 {
        counter!(EVICTIONS_TOTAL).increment(evicted as u64);
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_active(active: usize) {
    gauge!(CONNECTIONS_ACTIVE).set(active as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_without_evictions_renders_counts_only() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            record_broadcast(2, 0);
            record_broadcast(3, 0);
        });
        let output = handle.render();
        assert!(output.contains(&format!("{BROADCASTS_TOTAL} 2")));
        assert!(output.contains(&format!("{DELIVERIES_TOTAL} 5")));
        assert!(!output.contains(EVICTIONS_TOTAL));
    }

    #[test]
    fn recorded_metrics_render() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            record_admitted(1);
            record_broadcast(3, 1);
            record_removed("evicted", 0);
        });
        let output = handle.render();
        assert!(output.contains(CONNECTIONS_TOTAL));
        assert!(output.contains(DELIVERIES_TOTAL));
        assert!(output.contains(EVICTIONS_TOTAL));
        assert!(output.contains("reason=\"evicted\""));
    }

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            CONNECTIONS_TOTAL,
            DISCONNECTIONS_TOTAL,
            CONNECTIONS_ACTIVE,
            BROADCASTS_TOTAL,
            DELIVERIES_TOTAL,
            EVICTIONS_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("relay_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
