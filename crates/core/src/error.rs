//! 에러 타입 — 도메인별 에러 정의
//!
//! 각 크레이트는 자체 상세 에러(`RuleUpdaterError`, `ScannerError`)를 가지며,
//! `From` 구현을 통해 여기 정의된 분류로 변환됩니다.

/// yarasweep 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum YarasweepError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 규칙 업데이트 에러
    #[error("update error: {0}")]
    Update(#[from] UpdateError),

    /// 스캔 에러
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),

    /// 원격 콘솔 리포트 에러
    #[error("reporting error: {0}")]
    Reporting(#[from] ReportingError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// 스캔 대상이 없거나 둘 이상 지정됨
    #[error("invalid scan target: {0}")]
    InvalidTarget(String),
}

/// 규칙 업데이트 에러 분류
///
/// 모든 변형은 비치명적입니다. 업데이트 사이클만 중단되고 다음 주기에 재시도합니다.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// 버전 목록을 가져올 수 없음
    #[error("listing unavailable: {0}")]
    ListingUnavailable(String),

    /// 버전 목록 형식 오류
    #[error("listing malformed: {0}")]
    ListingMalformed(String),

    /// 규칙 아카이브를 가져올 수 없음
    #[error("archive unavailable: {0}")]
    ArchiveUnavailable(String),

    /// 아카이브 검증/해제 실패
    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),

    /// 상태 파일 저장 실패
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// 스캔 에러 분류
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// 요청 형식 오류 (대상 없음 또는 복수 지정)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// 규칙 컴파일 실패 — 해당 실행/세션에 치명적
    #[error("rule compile error: {0}")]
    EngineCompile(String),

    /// 매칭 엔진 또는 대상 해석 실패
    #[error("engine error: {0}")]
    Engine(String),
}

/// 원격 콘솔 리포트 에러
///
/// 로그만 남기며 로컬 출력과 종료 코드에는 영향을 주지 않습니다.
#[derive(Debug, thiserror::Error)]
pub enum ReportingError {
    /// 요청 전송 실패
    #[error("request failed: {0}")]
    Request(String),

    /// 콘솔이 요청을 거부함
    #[error("console rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}
