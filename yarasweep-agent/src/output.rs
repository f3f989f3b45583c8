//! Scan result rendering for JSON and table output.
//!
//! All one-shot output flows through [`OutputWriter`], which handles format
//! switching. The payload is [`ScanReport`]: findings wrapped with the target
//! identifier, a timestamp and the severity counts.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use yarasweep_core::config::OutputMode;
use yarasweep_core::types::{Finding, ScanRequest, Severity, SeverityCounts};

use crate::error::AgentError;

/// Writes payloads to stdout in the configured format.
pub struct OutputWriter {
    mode: OutputMode,
}

impl OutputWriter {
    pub fn new(mode: OutputMode) -> Self {
        Self { mode }
    }

    /// Render a payload to stdout.
    pub fn render<T: Render + Serialize>(&self, payload: &T) -> Result<(), AgentError> {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        self.render_to(payload, &mut handle)
    }

    /// Render a payload to an arbitrary writer.
    ///
    /// `Table` delegates to [`Render::render_text`]; `Json` serialises via `serde_json`.
    pub fn render_to<T: Render + Serialize>(
        &self,
        payload: &T,
        w: &mut dyn Write,
    ) -> Result<(), AgentError> {
        match self.mode {
            OutputMode::Table => payload.render_text(w)?,
            OutputMode::Json => {
                serde_json::to_writer_pretty(&mut *w, payload)?;
                writeln!(w)?;
            }
        }
        Ok(())
    }
}

/// Human-readable text rendering.
pub trait Render {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()>;
}

/// One-shot scan report.
///
/// Exactly one of `dir_name`, `image_id` and `container_id` is present,
/// matching the kind of the scanned target.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Unix timestamp (seconds) of report creation.
    pub scanned_at: u64,
    pub counts: SeverityCounts,
    pub findings: Vec<Finding>,
}

impl ScanReport {
    pub fn new(request: &ScanRequest, findings: Vec<Finding>, counts: SeverityCounts) -> Self {
        let target = Some(request.target().to_owned());
        let (dir_name, image_id, container_id) = match request {
            ScanRequest::Path(_) => (target, None, None),
            ScanRequest::Image(_) => (None, target, None),
            ScanRequest::Container(_) => (None, None, target),
        };
        Self {
            dir_name,
            image_id,
            container_id,
            scanned_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            counts,
            findings,
        }
    }

    /// Target identifier regardless of kind.
    pub fn target(&self) -> &str {
        self.dir_name
            .as_deref()
            .or(self.image_id.as_deref())
            .or(self.container_id.as_deref())
            .unwrap_or_default()
    }
}

impl Render for ScanReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "summary:")?;
        writeln!(w, "  {}", self.counts)?;
        writeln!(w)?;

        if self.findings.is_empty() {
            writeln!(w, "{} {}", "No findings for".green(), self.target().bold())?;
            return Ok(());
        }

        writeln!(w, "{:<28} {:<8} Location", "Rule", "Severity")?;
        writeln!(w, "{}", "-".repeat(80))?;

        for f in &self.findings {
            let severity = f.severity.to_string();
            let severity = match f.severity {
                Severity::High => severity.red().bold(),
                Severity::Medium => severity.yellow(),
                Severity::Low => severity.normal(),
            };
            writeln!(w, "{:<28} {:<8} {}", f.rule_id, severity, f.location)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn finding(rule: &str, severity: Severity) -> Finding {
        Finding {
            rule_id: rule.to_owned(),
            severity,
            location: "usr/bin/payload".to_owned(),
            metadata: BTreeMap::new(),
            matched_strings: vec!["$a".to_owned()],
        }
    }

    fn report(request: ScanRequest, findings: Vec<Finding>) -> ScanReport {
        let mut counts = SeverityCounts::default();
        for f in &findings {
            counts.record(f.severity);
        }
        ScanReport::new(&request, findings, counts)
    }

    fn render(mode: OutputMode, report: &ScanReport) -> String {
        let mut buf = Vec::new();
        OutputWriter::new(mode).render_to(report, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn table_prints_summary_before_findings() {
        let report = report(
            ScanRequest::Path("/srv".to_owned()),
            vec![finding("dropper", Severity::High), finding("miner", Severity::Low)],
        );
        let out = render(OutputMode::Table, &report);

        let summary = out.find("summary:").unwrap();
        let totals = out.find("total=2 high=1 medium=0 low=1").unwrap();
        let row = out.find("dropper").unwrap();
        assert!(summary < totals && totals < row);
        assert!(out.contains("usr/bin/payload"));
    }

    #[test]
    fn table_without_findings() {
        let report = report(ScanRequest::Path("/srv".to_owned()), Vec::new());
        let out = render(OutputMode::Table, &report);
        assert!(out.contains("total=0 high=0 medium=0 low=0"));
        assert!(out.contains("No findings for"));
    }

    #[test]
    fn json_wraps_findings_with_target_id() {
        let report = report(
            ScanRequest::Image("nginx:1.27".to_owned()),
            vec![finding("dropper", Severity::High)],
        );
        let out = render(OutputMode::Json, &report);
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();

        assert_eq!(parsed["image_id"], "nginx:1.27");
        assert!(parsed.get("dir_name").is_none());
        assert!(parsed.get("container_id").is_none());
        assert_eq!(parsed["counts"]["high"], 1);
        assert_eq!(parsed["findings"][0]["rule_id"], "dropper");
        assert_eq!(parsed["findings"][0]["severity"], "high");
        assert!(parsed["scanned_at"].as_u64().unwrap() > 0);
    }

    #[test]
    fn report_target_follows_request_kind() {
        let report = report(ScanRequest::Container("0123abcd".to_owned()), Vec::new());
        assert_eq!(report.container_id.as_deref(), Some("0123abcd"));
        assert_eq!(report.target(), "0123abcd");
    }
}
