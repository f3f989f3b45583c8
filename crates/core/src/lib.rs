//! yarasweep 공통 크레이트
//!
//! 규칙 업데이터, 스캐너, 에이전트가 공유하는 타입과 에러, 설정을 정의합니다.
//!
//! # 모듈 구조
//!
//! - [`config`]: `yarasweep.toml` 파싱, 환경변수 오버라이드, 검증
//! - [`error`]: 최상위 에러 타입 (`YarasweepError`)과 도메인별 에러
//! - [`metrics`]: 메트릭 이름 상수와 설명 등록
//! - [`types`]: `Severity`, `Finding`, `ScanRequest`, `SeverityCounts`, `Thresholds`

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

// --- 주요 타입 re-export ---

// 에러
pub use error::{ConfigError, ReportingError, ScanError, UpdateError, YarasweepError};

// 설정
pub use config::{OutputMode, RunnerConfig, YarasweepConfig};

// 도메인 타입
pub use types::{
    Finding, ScanKind, ScanRequest, ScanSelector, Severity, SeverityCounts, Thresholds,
};
