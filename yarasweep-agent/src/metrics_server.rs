//! Prometheus metrics HTTP listener for service mode.
//!
//! Uses the built-in HTTP listener from `metrics-exporter-prometheus`.
//! One-shot runs never install a recorder; their `metrics` macro calls are no-ops.

use std::net::SocketAddr;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use yarasweep_core::config::MetricsConfig;
use yarasweep_core::metrics as m;

/// Parse the listener address from the `[metrics]` section.
pub fn listen_addr(config: &MetricsConfig) -> Result<SocketAddr> {
    format!("{}:{}", config.listen_addr, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics listen address: {}", e))
}

/// Install the global metrics recorder and start the HTTP listener.
///
/// Call once per process. Afterwards every `counter!`, `gauge!` and
/// `histogram!` call is exported in Prometheus format.
///
/// # Errors
///
/// - The listen address does not parse
/// - Socket binding fails
/// - A global recorder is already installed
pub fn install_metrics_recorder(config: &MetricsConfig) -> Result<()> {
    let addr = listen_addr(config)?;

    if addr.ip().is_unspecified() {
        tracing::warn!(
            listen_addr = %addr,
            "metrics endpoint is exposed on all interfaces; restrict listen_addr in untrusted networks"
        );
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                m::SCANNER_SCAN_DURATION_SECONDS.to_owned(),
            ),
            &m::SCAN_DURATION_BUCKETS,
        )
        .map_err(|e| anyhow::anyhow!("invalid histogram buckets: {}", e))?
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {}", e))?;

    m::describe_all();
    metrics::gauge!(m::AGENT_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);

    tracing::info!(listen_addr = %addr, "Prometheus metrics endpoint active");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_from_config() {
        let addr = listen_addr(&MetricsConfig::default()).unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:9464");
    }

    #[test]
    fn invalid_listen_addr_is_rejected() {
        let config = MetricsConfig {
            enabled: true,
            listen_addr: "not-an-ip".to_owned(),
            port: 9464,
        };
        assert!(listen_addr(&config).is_err());
    }
}
