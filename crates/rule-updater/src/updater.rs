//! 규칙 업데이터 -- 단일 업데이트 사이클
//!
//! # 상태 전이
//!
//! ```text
//! Idle --> Listing --> Comparing --+--> NoChange ------------------------> Idle
//!                                  |
//!                                  +--> Installing --> (commit state) --> Idle
//! ```
//!
//! 설치는 원자적입니다. 상태 파일의 체크섬은 새 규칙 파일이 제자리에
//! rename 된 뒤에만 갱신되므로, 어느 단계에서 실패하더라도 이전 규칙 파일과
//! 이전 체크섬이 유효하게 남고 다음 주기에 재시도됩니다.
//!
//! 설치 시작 전에 `staging_path`가 기록된 상태를 먼저 저장하여
//! 중단된 사이클을 식별할 수 있게 합니다.
//!
//! 컴파일되지 않는 규칙 세트는 설치하지 않습니다. 체크섬이 갱신되지 않으므로
//! 같은 버전은 다음 주기에 다시 시도됩니다.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use yarasweep_core::config::RULE_FILE_NAME;
use yarasweep_core::metrics as m;
use yarasweep_scanner::engine::CompileOptions;

use crate::archive::{self, InstallReport};
use crate::error::RuleUpdaterError;
use crate::listing::{ListingFetcher, RuleSetVersion};
use crate::store::{ArtifactState, ArtifactStore};

/// 스테이징 디렉토리 이름 (규칙 디렉토리 내부)
pub const STAGING_DIR_NAME: &str = ".staging";

/// 업데이트 사이클 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// 원격 목록이 비어있음 (아무것도 하지 않음)
    EmptyListing,
    /// 최신 체크섬이 이미 설치되어 있음
    NoChange {
        /// 현재 체크섬
        checksum: String,
    },
    /// 새 규칙 세트를 설치함
    Installed {
        /// 새 체크섬
        checksum: String,
        /// 버전 라벨
        version: String,
        /// 병합된 규칙 파일 수
        entries: usize,
    },
}

impl UpdateOutcome {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::EmptyListing => "empty",
            Self::NoChange { .. } => "noop",
            Self::Installed { .. } => "installed",
        }
    }
}

/// 규칙 세트 업데이터
///
/// 사이클은 호출자가 순차적으로 실행해야 합니다 (동시 실행 불가).
/// 일반적으로 [`UpdateScheduler`](crate::scheduler::UpdateScheduler)가 소유합니다.
pub struct RuleUpdater<F> {
    fetcher: F,
    store: ArtifactStore,
    rules_dir: PathBuf,
    listing_url: String,
    compile_options: CompileOptions,
}

impl<F: ListingFetcher> RuleUpdater<F> {
    /// 업데이터를 생성합니다.
    pub fn new(fetcher: F, rules_dir: impl Into<PathBuf>, listing_url: impl Into<String>) -> Self {
        let rules_dir = rules_dir.into();
        Self {
            fetcher,
            store: ArtifactStore::new(rules_dir.clone()),
            rules_dir,
            listing_url: listing_url.into(),
            compile_options: CompileOptions::default(),
        }
    }

    /// 설치 전 검증에 사용할 컴파일 옵션을 설정합니다. 스캐너 설정과 같아야 합니다.
    pub fn with_compile_options(mut self, options: CompileOptions) -> Self {
        self.compile_options = options;
        self
    }

    /// 설치 대상 규칙 파일 경로
    pub fn rule_file(&self) -> PathBuf {
        self.rules_dir.join(RULE_FILE_NAME)
    }

    /// 스테이징 디렉토리 경로
    pub fn staging_dir(&self) -> PathBuf {
        self.rules_dir.join(STAGING_DIR_NAME)
    }

    /// 상태 저장소
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// 업데이트 사이클 한 번을 실행합니다.
    ///
    /// # Errors
    ///
    /// 목록/아카이브 가져오기, 검증, 설치, 상태 저장 실패 시 에러를 반환합니다.
    /// 어떤 경우에도 이전 규칙 파일과 체크섬은 그대로 유지됩니다.
    pub async fn run_cycle(&self) -> Result<UpdateOutcome, RuleUpdaterError> {
        let result = self.cycle().await;
        let label = match &result {
            Ok(outcome) => outcome.metric_label(),
            Err(_) => "failure",
        };
        counter!(m::UPDATER_CYCLES_TOTAL, m::LABEL_RESULT => label).increment(1);
        result
    }

    async fn cycle(&self) -> Result<UpdateOutcome, RuleUpdaterError> {
        let state = self.store.load().await;
        if state.is_interrupted() {
            warn!(
                staging = state.staging_path.as_deref().unwrap_or_default(),
                "previous install was interrupted"
            );
        }

        tokio::fs::create_dir_all(&self.rules_dir)
            .await
            .map_err(|e| RuleUpdaterError::Io {
                path: self.rules_dir.display().to_string(),
                source: e,
            })?;

        let listing = self
            .fetcher
            .fetch_listing(&self.listing_url, &self.rules_dir)
            .await?;

        let Some(latest) = listing.latest() else {
            info!(url = %self.listing_url, "rule listing is empty, nothing to do");
            return Ok(UpdateOutcome::EmptyListing);
        };

        if latest.checksum.is_empty() || latest.url.is_empty() {
            return Err(RuleUpdaterError::ListingParse(
                "latest entry is missing checksum or url".to_owned(),
            ));
        }

        if latest.checksum == state.checksum {
            debug!(checksum = %state.checksum, "rule set is up to date");
            return Ok(UpdateOutcome::NoChange {
                checksum: state.checksum,
            });
        }

        info!(
            current = %state.checksum,
            latest = %latest.checksum,
            version = %latest.version,
            "new rule set available"
        );

        let staging = self.staging_dir();
        self.reset_staging(&staging).await?;

        // 진행 중 표시 (체크섬은 이전 값 유지)
        let in_progress = ArtifactState {
            checksum: state.checksum.clone(),
            rules_path: self.rules_dir.display().to_string(),
            staging_path: Some(staging.display().to_string()),
        };
        self.store.save(&in_progress).await?;

        match self.install(latest, &staging).await {
            Ok(report) => {
                let committed = ArtifactState {
                    checksum: latest.checksum.clone(),
                    rules_path: self.rules_dir.display().to_string(),
                    staging_path: None,
                };
                self.store.save(&committed).await?;
                self.remove_staging(&staging).await;

                counter!(m::UPDATER_INSTALLS_TOTAL).increment(1);
                if let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) {
                    gauge!(m::UPDATER_LAST_INSTALL_TIMESTAMP).set(now.as_secs_f64());
                }

                info!(
                    checksum = %latest.checksum,
                    version = %latest.version,
                    entries = report.entries,
                    bytes = report.bytes,
                    path = %report.rule_file.display(),
                    "rule set installed"
                );

                Ok(UpdateOutcome::Installed {
                    checksum: latest.checksum.clone(),
                    version: latest.version.clone(),
                    entries: report.entries,
                })
            }
            Err(e) => {
                self.remove_staging(&staging).await;
                // 진행 중 표시만 되돌림, 실패해도 이전 체크섬은 이미 보존됨
                let restored = ArtifactState {
                    staging_path: None,
                    ..in_progress
                };
                if let Err(save_err) = self.store.save(&restored).await {
                    warn!(error = %save_err, "failed to clear staging marker");
                }
                Err(e)
            }
        }
    }

    async fn install(
        &self,
        latest: &RuleSetVersion,
        staging: &Path,
    ) -> Result<InstallReport, RuleUpdaterError> {
        let archive_path = self.fetcher.fetch_archive(&latest.url, staging).await?;

        let checksum = latest.checksum.clone();
        let rule_file = self.rule_file();
        let options = self.compile_options;
        tokio::task::spawn_blocking(move || {
            archive::install_archive(&archive_path, &checksum, &rule_file, options)
        })
        .await
        .map_err(|e| RuleUpdaterError::Archive(format!("install task failed: {e}")))?
    }

    async fn reset_staging(&self, staging: &Path) -> Result<(), RuleUpdaterError> {
        match tokio::fs::remove_dir_all(staging).await {
            Ok(()) => debug!(path = %staging.display(), "removed leftover staging content"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RuleUpdaterError::Io {
                    path: staging.display().to_string(),
                    source: e,
                });
            }
        }
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|e| RuleUpdaterError::Io {
                path: staging.display().to_string(),
                source: e,
            })
    }

    async fn remove_staging(&self, staging: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %staging.display(), error = %e, "failed to remove staging directory");
            }
        }
    }
}
