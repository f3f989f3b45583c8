//! Console reporting sink.
//!
//! When a console URL and access key are both configured, a one-shot scan
//! announces itself (`POST /scan/start`) and then ships its deduplicated
//! findings (`POST /scan/results`). If the start call fails, the results are
//! still sent under a locally generated scan id. Reporting failures are logged
//! and never change local output or the exit status.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use yarasweep_core::config::ConsoleConfig;
use yarasweep_core::error::ReportingError;
use yarasweep_core::types::{Finding, ScanKind, ScanRequest};

/// Console request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum response body kept in a `Rejected` error.
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct StartScanBody<'a> {
    kind: ScanKind,
    target: &'a str,
    started_at_ms: u128,
}

#[derive(Deserialize)]
struct StartScanResponse {
    #[serde(default)]
    scan_id: String,
}

#[derive(Serialize)]
struct ResultsBody<'a> {
    scan_id: &'a str,
    findings: &'a [Finding],
}

/// HTTP client for the remote console.
#[derive(Debug, Clone)]
pub struct ConsolePublisher {
    client: reqwest::Client,
    base_url: String,
    key: String,
}

impl ConsolePublisher {
    /// Build a publisher for `console`.
    ///
    /// Returns `Ok(None)` when reporting is not configured.
    pub fn from_config(console: &ConsoleConfig) -> Result<Option<Self>, ReportingError> {
        if !console.is_configured() {
            return Ok(None);
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("yarasweep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReportingError::Request(format!("failed to build http client: {e}")))?;
        Ok(Some(Self {
            client,
            base_url: base_url(console),
            key: console.key.clone(),
        }))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Announce a scan and return the console-assigned scan id.
    ///
    /// A response without a usable id falls back to [`local_scan_id`].
    pub async fn start_scan(&self, request: &ScanRequest) -> Result<String, ReportingError> {
        let body = StartScanBody {
            kind: request.kind(),
            target: request.target(),
            started_at_ms: unix_millis(),
        };
        let response = self.post("/scan/start", &body).await?;

        let scan_id = match response.json::<StartScanResponse>().await {
            Ok(parsed) if !parsed.scan_id.is_empty() => parsed.scan_id,
            Ok(_) | Err(_) => {
                let fallback = local_scan_id(request.target());
                debug!(scan_id = %fallback, "console returned no scan id, using local id");
                fallback
            }
        };
        Ok(scan_id)
    }

    /// Upload the findings for `scan_id`.
    pub async fn ingest_results(
        &self,
        scan_id: &str,
        findings: &[Finding],
    ) -> Result<(), ReportingError> {
        self.post("/scan/results", &ResultsBody { scan_id, findings })
            .await?;
        Ok(())
    }

    /// Start a scan record and upload its findings, logging any failure.
    ///
    /// Returns the scan id the results were filed under, or `None` if the
    /// upload failed.
    pub async fn publish(&self, request: &ScanRequest, findings: &[Finding]) -> Option<String> {
        let scan_id = match self.start_scan(request).await {
            Ok(id) => id,
            Err(e) => {
                let fallback = local_scan_id(request.target());
                warn!(
                    error = %e,
                    console = %self.base_url,
                    scan_id = %fallback,
                    "failed to register scan with console, using local id"
                );
                fallback
            }
        };

        match self.ingest_results(&scan_id, findings).await {
            Ok(()) => {
                info!(scan_id = %scan_id, findings = findings.len(), "results sent to console");
                Some(scan_id)
            }
            Err(e) => {
                warn!(error = %e, scan_id = %scan_id, "failed to send results to console");
                None
            }
        }
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, ReportingError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.key)
            .json(body)
            .send()
            .await
            .map_err(|e| ReportingError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
            return Err(ReportingError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

/// Local scan id used when the console does not assign one: `<target>-<unix millis>`.
pub fn local_scan_id(target: &str) -> String {
    format!("{target}-{}", unix_millis())
}

fn base_url(console: &ConsoleConfig) -> String {
    let url = console.url.trim_end_matches('/');
    let url = if url.contains("://") {
        url.to_owned()
    } else {
        format!("https://{url}")
    };
    if console.port == 0 {
        url
    } else {
        format!("{url}:{}", console.port)
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}
