//! yarasweep 스캐너
//!
//! 규칙 파일을 컴파일하고, 스캔 요청(경로, 이미지, 컨테이너)을 파일시스템 루트로
//! 해석한 뒤 파일을 순회하며 매칭 결과를 스트리밍합니다.
//!
//! # 모듈 구성
//!
//! - [`engine`]: YARA 부분집합 규칙 파서, 컴파일러, 매처 (`RuleSet`, `MatchEngine`)
//! - [`resolver`]: 스캔 대상 해석 (`TargetResolver`, `ContainerRuntime`, `BollardRuntime`)
//! - [`dispatcher`]: 요청 처리와 결과 스트림 (`ScanDispatcher`, `FindingStream`)
//! - [`aggregate`]: 중복 제거, 심각도 집계, 임계값 판정
//! - [`error`]: 도메인 에러 타입
//!
//! # 아키텍처
//!
//! ```text
//! ScanRequest -> TargetResolver -> root -> walkdir -> MatchEngine -> FindingStream
//!                    |                                                   |
//!             bollard export                               deduplicate / count / should_fail
//! ```

pub mod aggregate;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod resolver;

// --- 주요 타입 re-export ---

// 에러
pub use error::ScannerError;

// 매칭 엔진
pub use engine::{CompileOptions, MatchEngine, RuleMatch, RuleSet};

// 대상 해석
pub use resolver::{BollardRuntime, ContainerRuntime, ResolvedTarget, TargetResolver};

// 디스패처
pub use dispatcher::{DEFAULT_MAX_FILE_SIZE, FindingStream, ScanDispatcher};

// 집계
pub use aggregate::{AggregatedResult, count_severity, deduplicate, should_fail};
