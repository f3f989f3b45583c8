//! Run-mode orchestration.
//!
//! [`run`] picks the mode from the resolved [`RunnerConfig`]:
//!
//! - **One-shot** (no socket path): compile rules, scan the selected target,
//!   deduplicate, optionally report to the console, render and derive the
//!   exit status from the failure thresholds.
//! - **Service** (socket path set): serve scan requests on the Unix socket
//!   while the rule updater runs on its own schedule, until SIGINT/SIGTERM
//!   or the supplied cancellation token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::gauge;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use yarasweep_core::config::{MetricsConfig, RunnerConfig};
use yarasweep_core::metrics as m;
use yarasweep_core::types::{ScanRequest, SeverityCounts};
use yarasweep_rule_updater::{HttpListingFetcher, RuleUpdater, UpdateScheduler};
use yarasweep_scanner::{
    AggregatedResult, BollardRuntime, CompileOptions, ContainerRuntime, RuleSet, ScanDispatcher,
    TargetResolver,
};

use crate::error::AgentError;
use crate::metrics_server;
use crate::output::{OutputWriter, ScanReport};
use crate::publisher::ConsolePublisher;
use crate::server::{RuleBook, ScanServer};

/// Timeout for listing and archive downloads.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Uptime gauge refresh period in service mode.
const UPTIME_INTERVAL: Duration = Duration::from_secs(15);

/// Result of a one-shot run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub counts: SeverityCounts,
    /// A failure threshold was exceeded.
    pub failed: bool,
}

impl RunOutcome {
    /// Process exit status: 1 when a threshold was exceeded, 0 otherwise.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.failed)
    }
}

/// Run in the mode selected by `config`.
///
/// Service mode always yields a passing outcome once shut down cleanly.
pub async fn run(
    config: &RunnerConfig,
    metrics: &MetricsConfig,
    cancel: CancellationToken,
) -> Result<RunOutcome, AgentError> {
    if config.is_service_mode() {
        run_service(config, metrics, cancel).await?;
        Ok(RunOutcome {
            counts: SeverityCounts::default(),
            failed: false,
        })
    } else {
        run_once(config).await
    }
}

/// One-shot scan rendered to stdout.
pub async fn run_once(config: &RunnerConfig) -> Result<RunOutcome, AgentError> {
    let (report, outcome) = scan_once(config).await?;
    OutputWriter::new(config.output).render(&report)?;
    Ok(outcome)
}

/// One-shot scan without rendering.
///
/// Connects to the local container runtime only for image and container targets.
///
/// # Errors
///
/// - `Config`: no target or more than one target selected
/// - `Compile`: the rule file is missing or does not compile
/// - `Scan`: resolution or the walk failed; nothing is rendered
pub async fn scan_once(config: &RunnerConfig) -> Result<(ScanReport, RunOutcome), AgentError> {
    let request = config.selector.to_request()?;
    let runtime = match request {
        ScanRequest::Path(_) => None,
        ScanRequest::Image(_) | ScanRequest::Container(_) => {
            Some(Arc::new(BollardRuntime::connect_local()?))
        }
    };
    scan_once_with(config, request, runtime).await
}

/// One-shot scan of `request` using the given container runtime.
pub async fn scan_once_with<R: ContainerRuntime>(
    config: &RunnerConfig,
    request: ScanRequest,
    runtime: Option<Arc<R>>,
) -> Result<(ScanReport, RunOutcome), AgentError> {
    let rule_file = config.rule_file();
    let options = CompileOptions {
        fail_on_warning: config.fail_on_compile_warning,
    };
    let rules = RuleSet::from_file(&rule_file, options)
        .await
        .map_err(|e| AgentError::Compile(e.to_string()))?;

    let resolver = TargetResolver::new(runtime).with_host_mount(&config.host_mount_path);
    let dispatcher =
        ScanDispatcher::new(Arc::new(rules), resolver).with_max_file_size(config.max_file_size);

    let findings = dispatcher.dispatch(&request).await?.collect().await?;
    let result = AggregatedResult::from_findings(findings);

    match ConsolePublisher::from_config(&config.console) {
        Ok(Some(publisher)) => {
            publisher.publish(&request, &result.findings).await;
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "console reporting disabled"),
    }

    let failed = result.should_fail(&config.thresholds);
    let counts = result.counts;
    info!(
        target = %request,
        total = counts.total,
        high = counts.high,
        medium = counts.medium,
        low = counts.low,
        gated = !config.thresholds.is_disabled(),
        failed,
        "scan finished"
    );

    let report = ScanReport::new(&request, result.findings, counts);
    Ok((report, RunOutcome { counts, failed }))
}

/// Service mode: scan server and rule updater until shutdown.
///
/// # Errors
///
/// Fails only during startup (metrics listener, socket bind, HTTP client).
/// Update cycle failures are logged by the scheduler and never end the service.
pub async fn run_service(
    config: &RunnerConfig,
    metrics: &MetricsConfig,
    cancel: CancellationToken,
) -> Result<(), AgentError> {
    if metrics.enabled {
        metrics_server::install_metrics_recorder(metrics)
            .map_err(|e| AgentError::Server(e.to_string()))?;
    }

    let runtime = match BollardRuntime::connect_local() {
        Ok(runtime) => Some(Arc::new(runtime)),
        Err(e) => {
            warn!(error = %e, "container runtime unavailable, only path scans will be served");
            None
        }
    };
    let resolver = TargetResolver::new(runtime).with_host_mount(&config.host_mount_path);
    let rules = RuleBook::new(
        config.rule_file(),
        CompileOptions {
            fail_on_warning: config.fail_on_compile_warning,
        },
    );

    let mut server = ScanServer::bind(&config.socket_path, rules, resolver)?
        .with_max_file_size(config.max_file_size);
    if !config.inactive_threshold.is_zero() {
        server = server.with_idle_timeout(config.inactive_threshold);
    }

    let fetcher =
        HttpListingFetcher::new(DOWNLOAD_TIMEOUT).map_err(|e| AgentError::Server(e.to_string()))?;
    let updater = RuleUpdater::new(
        fetcher,
        config.rules_path.clone(),
        config.rules_listing_url.clone(),
    )
    .with_compile_options(CompileOptions {
        fail_on_warning: config.fail_on_compile_warning,
    });
    let scheduler = UpdateScheduler::new(updater, config.update_interval);

    let server_task = tokio::spawn(server.run(cancel.clone()));
    let updater_task = scheduler.spawn(cancel.clone());

    info!(
        socket = %config.socket_path,
        rules = %config.rules_path.display(),
        update_interval_secs = config.update_interval.as_secs(),
        "yarasweep agent running in service mode"
    );

    let started = Instant::now();
    let mut uptime = tokio::time::interval(UPTIME_INTERVAL);
    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                match result {
                    Ok(signal) => info!(signal, "shutdown signal received"),
                    Err(e) => error!(error = %e, "signal handling failed, shutting down"),
                }
                break;
            }
            _ = cancel.cancelled() => {
                info!("shutdown requested");
                break;
            }
            _ = uptime.tick() => {
                gauge!(m::AGENT_UPTIME_SECONDS).set(started.elapsed().as_secs_f64());
            }
        }
    }

    cancel.cancel();
    let (server_result, updater_result) = tokio::join!(server_task, updater_task);
    if let Err(e) = server_result {
        error!(error = %e, "scan server task failed");
    }
    match updater_result {
        Ok(cycles) => info!(cycles, "rule updater stopped"),
        Err(e) => error!(error = %e, "rule updater task failed"),
    }

    info!("yarasweep agent shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT and return the name of the signal received.
async fn wait_for_shutdown_signal() -> Result<&'static str, AgentError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}
