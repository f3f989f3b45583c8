//! yarasweep 규칙 업데이터
//!
//! 원격 버전 목록을 주기적으로 확인하고, 최신 체크섬이 바뀐 경우에만
//! 규칙 아카이브를 내려받아 원자적으로 설치합니다.
//!
//! # 모듈 구조
//!
//! - [`error`]: 도메인 에러 (`RuleUpdaterError`)
//! - [`store`]: 설치 상태 저장소 (`ArtifactStore`, `ArtifactState`)
//! - [`listing`]: 목록/아카이브 가져오기 (`ListingFetcher`, `HttpListingFetcher`)
//! - [`archive`]: 아카이브 검증, 추출, 원자적 설치
//! - [`updater`]: 단일 업데이트 사이클 (`RuleUpdater`, `UpdateOutcome`)
//! - [`scheduler`]: 주기 실행 (`UpdateScheduler`)
//!
//! # 아키텍처
//!
//! ```text
//! UpdateScheduler --tick--> RuleUpdater --> ListingFetcher --> VersionListing
//!                               |                                   |
//!                               |<------- checksum compare ---------+
//!                               |
//!                               +--> fetch_archive --> .staging/ --> verify/extract
//!                               |                                        |
//!                               |                             malware.yar (rename)
//!                               v
//!                         ArtifactStore (metaListingData.json)
//! ```

pub mod archive;
pub mod error;
pub mod listing;
pub mod scheduler;
pub mod store;
pub mod updater;

pub use error::RuleUpdaterError;
pub use listing::{HttpListingFetcher, ListingFetcher, RuleSetVersion, VersionListing};
pub use scheduler::UpdateScheduler;
pub use store::{ArtifactState, ArtifactStore};
pub use updater::{RuleUpdater, UpdateOutcome};
