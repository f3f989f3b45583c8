//! 규칙 업데이터 에러 타입
//!
//! [`RuleUpdaterError`]는 업데이트 사이클 중 발생할 수 있는 모든 에러를 나타냅니다.
//! `From<RuleUpdaterError> for YarasweepError` 구현을 통해 `?` 연산자로
//! 상위 에러 타입으로 전파됩니다.
//!
//! # 에러 카테고리
//!
//! - **목록**: `Listing`, `ListingParse`
//! - **아카이브**: `Download`, `ChecksumMismatch`, `Archive`, `RulesRejected`
//! - **상태 저장**: `Persistence`
//! - **파일 I/O**: `Io`
//!
//! 모든 변형은 비치명적입니다. 현재 사이클만 중단되고 다음 주기에 재시도합니다.

use yarasweep_core::error::{UpdateError, YarasweepError};

/// 규칙 업데이터 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum RuleUpdaterError {
    /// 버전 목록 요청 실패
    #[error("listing fetch failed: {url}: {reason}")]
    Listing {
        /// 요청 URL
        url: String,
        /// 실패 사유
        reason: String,
    },

    /// 버전 목록 파싱 실패
    #[error("listing parse error: {0}")]
    ListingParse(String),

    /// 아카이브 다운로드 실패
    #[error("archive download failed: {url}: {reason}")]
    Download {
        /// 요청 URL
        url: String,
        /// 실패 사유
        reason: String,
    },

    /// 아카이브 체크섬 불일치
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// 목록에 기록된 체크섬
        expected: String,
        /// 실제 계산된 체크섬
        actual: String,
    },

    /// 아카이브 형식 오류 (빈 파일, 손상된 tar, 규칙 없음)
    #[error("archive error: {0}")]
    Archive(String),

    /// 아카이브의 규칙이 컴파일되지 않음
    #[error("archive rules rejected: {0}")]
    RulesRejected(String),

    /// 상태 파일 저장 실패
    #[error("state persistence failed: {path}: {reason}")]
    Persistence {
        /// 상태 파일 경로
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
}

impl From<RuleUpdaterError> for UpdateError {
    fn from(err: RuleUpdaterError) -> Self {
        let msg = err.to_string();
        match err {
            RuleUpdaterError::Listing { .. } => UpdateError::ListingUnavailable(msg),
            RuleUpdaterError::ListingParse(_) => UpdateError::ListingMalformed(msg),
            RuleUpdaterError::Download { .. } => UpdateError::ArchiveUnavailable(msg),
            RuleUpdaterError::ChecksumMismatch { .. }
            | RuleUpdaterError::Archive(_)
            | RuleUpdaterError::RulesRejected(_) => UpdateError::ArchiveCorrupt(msg),
            RuleUpdaterError::Persistence { .. } | RuleUpdaterError::Io { .. } => {
                UpdateError::Persistence(msg)
            }
        }
    }
}

impl From<RuleUpdaterError> for YarasweepError {
    fn from(err: RuleUpdaterError) -> Self {
        YarasweepError::Update(err.into())
    }
}
