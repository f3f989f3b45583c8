//! 스캐너 에러 타입
//!
//! [`ScannerError`]는 규칙 컴파일, 스캔 대상 해석, 파일 순회 중 발생하는
//! 모든 에러를 나타냅니다. `From<ScannerError> for ScanError` 구현으로
//! 공통 분류(`EngineCompile`, `InvalidRequest`, `Engine`)로 변환됩니다.
//!
//! # 에러 카테고리
//!
//! - **규칙 컴파일**: `RuleSyntax`, `RulePattern`, `CompileWarnings`
//! - **요청**: `InvalidRequest`
//! - **대상 해석**: `Runtime`, `Extract`
//! - **순회 / I/O**: `Walk`, `Io`, `Channel`

use yarasweep_core::error::{ScanError, YarasweepError};

/// 스캐너 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    /// 규칙 문법 오류
    #[error("rule syntax error at line {line}: {reason}")]
    RuleSyntax {
        /// 오류 위치 (1부터 시작)
        line: usize,
        /// 오류 사유
        reason: String,
    },

    /// 문자열 패턴 컴파일 실패
    #[error("invalid pattern {string_id} in rule '{rule}': {reason}")]
    RulePattern {
        /// 규칙 이름
        rule: String,
        /// 문자열 식별자
        string_id: String,
        /// 실패 사유
        reason: String,
    },

    /// 엄격 모드에서 컴파일 경고 발생
    #[error("rule compilation produced {} warning(s): {}", .0.len(), .0.join("; "))]
    CompileWarnings(Vec<String>),

    /// 잘못된 스캔 요청
    #[error("invalid scan request: {0}")]
    InvalidRequest(String),

    /// 컨테이너 런타임 호출 실패
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// export된 파일시스템 해제 실패
    #[error("extract error: {0}")]
    Extract(String),

    /// 디렉토리 순회 실패
    #[error("walk error: {path}: {reason}")]
    Walk {
        /// 순회 루트
        path: String,
        /// 실패 사유
        reason: String,
    },

    /// 파일 I/O 에러
    #[error("io error: {path}: {source}")]
    Io {
        /// 관련 파일 경로
        path: String,
        /// 원본 I/O 에러
        source: std::io::Error,
    },

    /// 작업 스레드 / 채널 에러
    #[error("channel error: {0}")]
    Channel(String),
}

impl ScannerError {
    /// 규칙 컴파일 단계의 에러인지 반환합니다.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            Self::RuleSyntax { .. } | Self::RulePattern { .. } | Self::CompileWarnings(_)
        )
    }
}

impl From<ScannerError> for ScanError {
    fn from(err: ScannerError) -> Self {
        if err.is_compile_error() {
            return ScanError::EngineCompile(err.to_string());
        }
        match err {
            ScannerError::InvalidRequest(msg) => ScanError::InvalidRequest(msg),
            other => ScanError::Engine(other.to_string()),
        }
    }
}

impl From<ScannerError> for YarasweepError {
    fn from(err: ScannerError) -> Self {
        YarasweepError::Scan(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_display() {
        let err = ScannerError::RuleSyntax {
            line: 12,
            reason: "expected '{'".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("line 12"));
        assert!(msg.contains("expected '{'"));
    }

    #[test]
    fn warnings_display_joins_messages() {
        let err = ScannerError::CompileWarnings(vec!["a".to_owned(), "b".to_owned()]);
        let msg = err.to_string();
        assert!(msg.contains("2 warning(s)"));
        assert!(msg.contains("a; b"));
    }

    #[test]
    fn compile_errors_map_to_engine_compile() {
        let err: ScanError = ScannerError::RulePattern {
            rule: "r".to_owned(),
            string_id: "$a".to_owned(),
            reason: "bad regex".to_owned(),
        }
        .into();
        assert!(matches!(err, ScanError::EngineCompile(_)));

        let err: ScanError = ScannerError::CompileWarnings(vec!["w".to_owned()]).into();
        assert!(matches!(err, ScanError::EngineCompile(_)));
    }

    #[test]
    fn invalid_request_is_preserved() {
        let err: ScanError = ScannerError::InvalidRequest("empty path".to_owned()).into();
        assert!(matches!(err, ScanError::InvalidRequest(ref m) if m == "empty path"));
    }

    #[test]
    fn runtime_errors_map_to_engine() {
        let err: ScanError = ScannerError::Runtime("daemon down".to_owned()).into();
        assert!(matches!(err, ScanError::Engine(_)));

        let top: YarasweepError = ScannerError::Walk {
            path: "/srv".to_owned(),
            reason: "permission denied".to_owned(),
        }
        .into();
        assert!(matches!(top, YarasweepError::Scan(ScanError::Engine(_))));
    }
}
