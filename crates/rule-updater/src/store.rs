//! 설치 상태 저장소
//!
//! 마지막으로 설치된 규칙 세트의 체크섬을 `<rules_path>/metaListingData.json`에
//! 보존합니다. 업데이터는 이 값과 원격 목록의 최신 체크섬을 비교하여
//! 재다운로드 여부를 결정합니다.
//!
//! - 읽기 실패(파일 없음, 손상)는 "이전 상태 없음"으로 간주합니다.
//! - 쓰기는 임시 파일 + fsync + rename 으로 파일 전체를 원자적으로 교체합니다.
//! - 상태 파일은 삭제하지 않습니다.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use yarasweep_core::config::STATE_FILE_NAME;

use crate::error::RuleUpdaterError;

/// 보존되는 설치 상태
///
/// 기본값(빈 체크섬)은 실제 체크섬과 절대 같지 않으므로
/// 첫 실행 시 항상 설치가 진행됩니다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactState {
    /// 마지막으로 설치 완료된 규칙 세트의 체크섬
    #[serde(default)]
    pub checksum: String,
    /// 규칙 저장 디렉토리
    #[serde(default)]
    pub rules_path: String,
    /// 진행 중인 설치의 스테이징 경로 (설치 중단 시 남아있음)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_path: Option<String>,
}

impl ArtifactState {
    /// 설치가 중단된 흔적이 있는지 반환합니다.
    pub fn is_interrupted(&self) -> bool {
        self.staging_path.is_some()
    }
}

/// 상태 파일 저장소
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// 규칙 디렉토리를 기준으로 저장소를 생성합니다.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// 규칙 디렉토리를 반환합니다.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 상태 파일 경로를 반환합니다.
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE_NAME)
    }

    /// 상태를 로드합니다. 실패하지 않습니다.
    ///
    /// 파일이 없으면 조용히, 읽기/파싱 에러는 경고 로그와 함께 기본값을 반환합니다.
    pub async fn load(&self) -> ArtifactState {
        let path = self.state_path();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no prior artifact state");
                return ArtifactState::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read artifact state, assuming none");
                return ArtifactState::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse artifact state, assuming none");
                ArtifactState::default()
            }
        }
    }

    /// 상태를 원자적으로 저장합니다.
    ///
    /// # Errors
    ///
    /// 직렬화, 쓰기, fsync, rename 중 하나라도 실패하면
    /// `RuleUpdaterError::Persistence`를 반환합니다. 이 경우 기존 상태 파일은 그대로입니다.
    pub async fn save(&self, state: &ArtifactState) -> Result<(), RuleUpdaterError> {
        let path = self.state_path();
        let persistence = |reason: String| RuleUpdaterError::Persistence {
            path: path.display().to_string(),
            reason,
        };

        let body = serde_json::to_vec_pretty(state).map_err(|e| persistence(e.to_string()))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| persistence(format!("create dir: {e}")))?;

        let tmp = self.dir.join(format!("{STATE_FILE_NAME}.tmp"));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| persistence(format!("create temp file: {e}")))?;
        file.write_all(&body)
            .await
            .map_err(|e| persistence(format!("write temp file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| persistence(format!("fsync temp file: {e}")))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| persistence(format!("rename: {e}")))?;

        debug!(path = %path.display(), checksum = %state.checksum, "artifact state saved");
        Ok(())
    }
}
