//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 각 모듈은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`,
//! `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `yarasweep_`
//! - 모듈명: `updater_`, `scanner_`, `server_`, `agent_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(yarasweep_core::metrics::SCANNER_FILES_SCANNED_TOTAL).increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 심각도 레이블 키 (low, medium, high)
pub const LABEL_SEVERITY: &str = "severity";

/// 스캔 종류 레이블 키 (path, image, container)
pub const LABEL_KIND: &str = "kind";

/// 결과 레이블 키 (success, failure, noop)
pub const LABEL_RESULT: &str = "result";

// ─── Rule Updater 메트릭 ────────────────────────────────────────────

/// Updater: 실행된 업데이트 사이클 수 (counter, label: result)
pub const UPDATER_CYCLES_TOTAL: &str = "yarasweep_updater_cycles_total";

/// Updater: 설치된 규칙 세트 수 (counter)
pub const UPDATER_INSTALLS_TOTAL: &str = "yarasweep_updater_installs_total";

/// Updater: 마지막 설치 시각 (gauge, Unix epoch)
pub const UPDATER_LAST_INSTALL_TIMESTAMP: &str = "yarasweep_updater_last_install_timestamp";

// ─── Scanner 메트릭 ─────────────────────────────────────────────────

/// Scanner: 완료된 스캔 수 (counter, label: kind)
pub const SCANNER_SCANS_TOTAL: &str = "yarasweep_scanner_scans_total";

/// Scanner: 스캔된 파일 수 (counter)
pub const SCANNER_FILES_SCANNED_TOTAL: &str = "yarasweep_scanner_files_scanned_total";

/// Scanner: 생성된 탐지 결과 수 (counter, label: severity)
pub const SCANNER_FINDINGS_TOTAL: &str = "yarasweep_scanner_findings_total";

/// Scanner: 스캔 소요 시간 (histogram, 초)
pub const SCANNER_SCAN_DURATION_SECONDS: &str = "yarasweep_scanner_scan_duration_seconds";

/// Scanner: 현재 로드된 규칙 수 (gauge)
pub const SCANNER_RULES_LOADED: &str = "yarasweep_scanner_rules_loaded";

// ─── Server 메트릭 ──────────────────────────────────────────────────

/// Server: 수락된 연결 수 (counter)
pub const SERVER_CONNECTIONS_TOTAL: &str = "yarasweep_server_connections_total";

/// Server: 처리된 스캔 요청 수 (counter, label: result)
pub const SERVER_REQUESTS_TOTAL: &str = "yarasweep_server_requests_total";

// ─── Agent 메트릭 ───────────────────────────────────────────────────

/// Agent: 가동 시간 (gauge, 초)
pub const AGENT_UPTIME_SECONDS: &str = "yarasweep_agent_uptime_seconds";

/// Agent: 빌드 정보 (gauge, 항상 1, label: version)
pub const AGENT_BUILD_INFO: &str = "yarasweep_agent_build_info";

// ─── 히스토그램 버킷 정의 ────────────────────────────────────────────

/// 스캔 소요 시간 히스토그램 버킷 (초)
///
/// 10ms ~ 600s 범위 (이미지 export 포함)
pub const SCAN_DURATION_BUCKETS: [f64; 10] =
    [0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 600.0];

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 전역 레코더 설치 후 한 번만 호출해야 합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // Rule Updater
    describe_counter!(
        UPDATER_CYCLES_TOTAL,
        "Total number of rule update cycles by result"
    );
    describe_counter!(
        UPDATER_INSTALLS_TOTAL,
        "Total number of rule sets installed"
    );
    describe_gauge!(
        UPDATER_LAST_INSTALL_TIMESTAMP,
        "Unix timestamp of the last successful rule install"
    );

    // Scanner
    describe_counter!(SCANNER_SCANS_TOTAL, "Total number of scans completed by kind");
    describe_counter!(
        SCANNER_FILES_SCANNED_TOTAL,
        "Total number of files fed to the match engine"
    );
    describe_counter!(
        SCANNER_FINDINGS_TOTAL,
        "Total number of findings produced by severity"
    );
    describe_histogram!(
        SCANNER_SCAN_DURATION_SECONDS,
        "Time to complete a single scan in seconds"
    );
    describe_gauge!(SCANNER_RULES_LOADED, "Number of compiled rules currently loaded");

    // Server
    describe_counter!(
        SERVER_CONNECTIONS_TOTAL,
        "Total number of accepted scan connections"
    );
    describe_counter!(
        SERVER_REQUESTS_TOTAL,
        "Total number of scan requests handled by result"
    );

    // Agent
    describe_gauge!(AGENT_UPTIME_SECONDS, "Agent uptime in seconds");
    describe_gauge!(AGENT_BUILD_INFO, "Build information (always 1, with version label)");
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_METRIC_NAMES: &[&str] = &[
        UPDATER_CYCLES_TOTAL,
        UPDATER_INSTALLS_TOTAL,
        UPDATER_LAST_INSTALL_TIMESTAMP,
        SCANNER_SCANS_TOTAL,
        SCANNER_FILES_SCANNED_TOTAL,
        SCANNER_FINDINGS_TOTAL,
        SCANNER_SCAN_DURATION_SECONDS,
        SCANNER_RULES_LOADED,
        SERVER_CONNECTIONS_TOTAL,
        SERVER_REQUESTS_TOTAL,
        AGENT_UPTIME_SECONDS,
        AGENT_BUILD_INFO,
    ];

    #[test]
    fn all_metrics_start_with_prefix() {
        for name in ALL_METRIC_NAMES {
            assert!(
                name.starts_with("yarasweep_"),
                "Metric '{}' does not start with 'yarasweep_' prefix",
                name
            );
        }
    }

    #[test]
    fn metric_names_are_unique() {
        let mut names = ALL_METRIC_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL_METRIC_NAMES.len());
    }

    #[test]
    fn describe_all_does_not_panic() {
        describe_all();
    }

    #[test]
    fn scan_duration_buckets_are_sorted() {
        let buckets = SCAN_DURATION_BUCKETS;
        for i in 1..buckets.len() {
            assert!(
                buckets[i] > buckets[i - 1],
                "Bucket values must be in ascending order"
            );
        }
    }
}
