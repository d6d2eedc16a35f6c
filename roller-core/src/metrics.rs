//! Prometheus metrics for the ledger

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

/// Counters updated by the ledger actor
pub struct Metrics {
    registry: Registry,

    /// Transfers appended to the log
    pub transfers_total: IntCounter,

    /// Deposits credited from chain scans
    pub deposits_total: IntCounter,

    /// Completed deposit scan windows
    pub scans_total: IntCounter,

    /// Withdrawals matched to outbound payments
    pub settled_total: IntCounter,

    /// Bot leases granted
    pub bot_leases_total: IntCounter,
}

impl Metrics {
    /// Create the metric set on a private registry
    pub fn new() -> Self {
        let registry = Registry::new();

        let transfers_total = IntCounter::new(
            "roller_transfers_total",
            "Total transfers appended to the ledger",
        )
        .expect("valid metric");
        let deposits_total = IntCounter::new(
            "roller_deposits_total",
            "Total deposits credited from chain scans",
        )
        .expect("valid metric");
        let scans_total =
            IntCounter::new("roller_scans_total", "Total deposit scan windows committed")
                .expect("valid metric");
        let settled_total = IntCounter::new(
            "roller_settled_total",
            "Total withdrawals matched to outbound payments",
        )
        .expect("valid metric");
        let bot_leases_total =
            IntCounter::new("roller_bot_leases_total", "Total bot leases granted")
                .expect("valid metric");

        for metric in [
            &transfers_total,
            &deposits_total,
            &scans_total,
            &settled_total,
            &bot_leases_total,
        ] {
            registry
                .register(Box::new(metric.clone()))
                .expect("unique metric");
        }

        Self {
            registry,
            transfers_total,
            deposits_total,
            scans_total,
            settled_total,
            bot_leases_total,
        }
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = Metrics::new();
        metrics.transfers_total.inc();
        metrics.transfers_total.inc();
        metrics.scans_total.inc();

        let text = metrics.render();
        assert!(text.contains("roller_transfers_total 2"));
        assert!(text.contains("roller_scans_total 1"));
        assert!(text.contains("roller_settled_total 0"));
    }
}
