//! 결과 집계 -- 중복 제거, 심각도 집계, 임계값 판정

use std::collections::{BTreeMap, HashSet};

use yarasweep_core::types::{Finding, SeverityCounts, Thresholds};

/// 집계된 스캔 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedResult {
    /// 중복이 제거된 결과 (최초 등장 순서 유지)
    pub findings: Vec<Finding>,
    /// 심각도별 개수
    pub counts: SeverityCounts,
}

impl AggregatedResult {
    /// 결과를 중복 제거하고 집계합니다.
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        let findings = deduplicate(findings);
        let counts = count_severity(&findings);
        Self { findings, counts }
    }

    /// 임계값 초과 여부
    pub fn should_fail(&self, thresholds: &Thresholds) -> bool {
        should_fail(&self.counts, thresholds)
    }
}

/// 규칙 ID + 위치 + 메타데이터가 같은 결과를 제거합니다. 처음 나온 항목이 남습니다.
pub fn deduplicate(findings: Vec<Finding>) -> Vec<Finding> {
    let mut seen: HashSet<(String, String, BTreeMap<String, String>)> = HashSet::new();
    findings
        .into_iter()
        .filter(|f| {
            let (rule, location, metadata) = f.identity();
            seen.insert((rule.to_owned(), location.to_owned(), metadata.clone()))
        })
        .collect()
}

/// 심각도별 개수를 계산합니다.
pub fn count_severity(findings: &[Finding]) -> SeverityCounts {
    let mut counts = SeverityCounts::default();
    for finding in findings {
        counts.record(finding.severity);
    }
    counts
}

/// 어느 등급이든 개수가 상한(> 0)을 초과하면 `true`를 반환합니다.
///
/// 0 이하의 상한은 해당 등급의 검사를 비활성화합니다.
pub fn should_fail(counts: &SeverityCounts, thresholds: &Thresholds) -> bool {
    let breached = |count: u64, ceiling: i64| {
        u64::try_from(ceiling).is_ok_and(|ceiling| ceiling > 0 && count > ceiling)
    };
    breached(counts.high, thresholds.fail_on_high_count)
        || breached(counts.medium, thresholds.fail_on_medium_count)
        || breached(counts.low, thresholds.fail_on_low_count)
        || breached(counts.total, thresholds.fail_on_count)
}
