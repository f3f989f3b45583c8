//! 원격 버전 목록 / 규칙 아카이브 가져오기
//!
//! [`ListingFetcher`] trait은 네트워크 접근을 추상화합니다.
//! 운영 환경은 [`HttpListingFetcher`]를, 테스트는 카운팅 mock을 사용합니다.
//!
//! # 목록 문서 형식
//!
//! ```json
//! {
//!   "available": {
//!     "v3": [
//!       { "version": "2024.06.01", "checksum": "<sha256>", "url": "https://.../rules.tar.gz" }
//!     ]
//!   }
//! }
//! ```
//!
//! 최신 항목이 먼저 오며 0번 항목이 기준입니다. `v3` 이외의 형식 태그는 무시합니다.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::RuleUpdaterError;

/// 다운로드된 목록 문서 파일명
pub const LISTING_FILE_NAME: &str = "listing.json";

/// 목록 문서 최대 크기 (4 MB)
const MAX_LISTING_SIZE: usize = 4 * 1024 * 1024;

/// 규칙 아카이브 최대 크기 (256 MB)
const MAX_ARCHIVE_SIZE: u64 = 256 * 1024 * 1024;

/// URL에서 파일명을 얻지 못했을 때 사용할 이름
const FALLBACK_ARCHIVE_NAME: &str = "rules-archive";

/// 배포된 규칙 세트 한 건
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSetVersion {
    /// 버전 라벨 (정보용)
    #[serde(default)]
    pub version: String,
    /// 아카이브 체크섬 (변경 감지 키)
    pub checksum: String,
    /// 아카이브 다운로드 URL
    pub url: String,
}

/// 버전 목록 (최신순)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionListing {
    versions: Vec<RuleSetVersion>,
}

#[derive(Deserialize)]
struct ListingDocument {
    available: AvailableSets,
}

#[derive(Deserialize)]
struct AvailableSets {
    #[serde(default)]
    v3: Vec<RuleSetVersion>,
}

impl VersionListing {
    /// 버전 목록을 직접 생성합니다.
    pub fn new(versions: Vec<RuleSetVersion>) -> Self {
        Self { versions }
    }

    /// 목록 문서를 파싱합니다.
    ///
    /// # Errors
    ///
    /// JSON 형식이 맞지 않거나 `available` 필드가 없으면
    /// `RuleUpdaterError::ListingParse`를 반환합니다.
    pub fn parse(raw: &[u8]) -> Result<Self, RuleUpdaterError> {
        let doc: ListingDocument = serde_json::from_slice(raw)
            .map_err(|e| RuleUpdaterError::ListingParse(e.to_string()))?;
        Ok(Self {
            versions: doc.available.v3,
        })
    }

    /// 기준이 되는 최신 항목(0번)을 반환합니다.
    pub fn latest(&self) -> Option<&RuleSetVersion> {
        self.versions.first()
    }

    /// 목록이 비어있는지 반환합니다.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// 전체 항목 수
    pub fn len(&self) -> usize {
        self.versions.len()
    }
}

/// 목록 / 아카이브 가져오기 추상화
///
/// 모든 호출은 단일 시도이며 재시도는 다음 스케줄 주기에 맡깁니다.
pub trait ListingFetcher: Send + Sync + 'static {
    /// 버전 목록을 가져와 파싱합니다.
    ///
    /// 원본 문서는 `<dest_dir>/listing.json`에도 남깁니다.
    ///
    /// # Errors
    ///
    /// - `RuleUpdaterError::Listing`: 전송 실패
    /// - `RuleUpdaterError::ListingParse`: 문서 형식 오류
    fn fetch_listing(
        &self,
        url: &str,
        dest_dir: &Path,
    ) -> impl Future<Output = Result<VersionListing, RuleUpdaterError>> + Send;

    /// 규칙 아카이브를 `dest_dir` 아래에 내려받고 경로를 반환합니다.
    ///
    /// # Errors
    ///
    /// `RuleUpdaterError::Download`: 전송 실패 또는 크기 초과
    fn fetch_archive(
        &self,
        url: &str,
        dest_dir: &Path,
    ) -> impl Future<Output = Result<PathBuf, RuleUpdaterError>> + Send;
}

/// HTTP(S) 기반 구현
///
/// `file://` URL은 로컬 파일시스템에서 읽습니다 (내부 미러, 오프라인 환경).
#[derive(Debug, Clone)]
pub struct HttpListingFetcher {
    client: reqwest::Client,
}

impl HttpListingFetcher {
    /// 요청 타임아웃을 지정하여 생성합니다.
    ///
    /// # Errors
    ///
    /// TLS 백엔드 초기화 실패 시 `RuleUpdaterError::Listing`을 반환합니다.
    pub fn new(timeout: Duration) -> Result<Self, RuleUpdaterError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("yarasweep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RuleUpdaterError::Listing {
                url: String::new(),
                reason: format!("failed to build http client: {e}"),
            })?;
        Ok(Self { client })
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, RuleUpdaterError> {
        let listing_err = |reason: String| RuleUpdaterError::Listing {
            url: url.to_owned(),
            reason,
        };

        if let Some(path) = url.strip_prefix("file://") {
            let raw = tokio::fs::read(path)
                .await
                .map_err(|e| listing_err(e.to_string()))?;
            if raw.len() > MAX_LISTING_SIZE {
                return Err(listing_err(format!(
                    "listing too large: {} bytes (max: {MAX_LISTING_SIZE})",
                    raw.len()
                )));
            }
            return Ok(raw);
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| listing_err(e.to_string()))?;
        let raw = response
            .bytes()
            .await
            .map_err(|e| listing_err(e.to_string()))?;
        if raw.len() > MAX_LISTING_SIZE {
            return Err(listing_err(format!(
                "listing too large: {} bytes (max: {MAX_LISTING_SIZE})",
                raw.len()
            )));
        }
        Ok(raw.to_vec())
    }
}

impl ListingFetcher for HttpListingFetcher {
    async fn fetch_listing(
        &self,
        url: &str,
        dest_dir: &Path,
    ) -> Result<VersionListing, RuleUpdaterError> {
        let raw = self.get_bytes(url).await?;

        let saved = dest_dir.join(LISTING_FILE_NAME);
        if let Err(e) = tokio::fs::write(&saved, &raw).await {
            debug!(path = %saved.display(), error = %e, "failed to keep listing copy");
        }

        let listing = VersionListing::parse(&raw)?;
        debug!(url, versions = listing.len(), "listing fetched");
        Ok(listing)
    }

    async fn fetch_archive(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, RuleUpdaterError> {
        let download_err = |reason: String| RuleUpdaterError::Download {
            url: url.to_owned(),
            reason,
        };

        let dest = dest_dir.join(archive_file_name(url));

        if let Some(path) = url.strip_prefix("file://") {
            let bytes = tokio::fs::copy(path, &dest)
                .await
                .map_err(|e| download_err(e.to_string()))?;
            if bytes > MAX_ARCHIVE_SIZE {
                return Err(download_err(format!(
                    "archive too large: {bytes} bytes (max: {MAX_ARCHIVE_SIZE})"
                )));
            }
            info!(url, bytes, path = %dest.display(), "archive copied");
            return Ok(dest);
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| download_err(e.to_string()))?;

        if let Some(len) = response.content_length() {
            if len > MAX_ARCHIVE_SIZE {
                return Err(download_err(format!(
                    "archive too large: {len} bytes (max: {MAX_ARCHIVE_SIZE})"
                )));
            }
        }

        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| download_err(format!("create {}: {e}", dest.display())))?;

        let mut written: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| download_err(e.to_string()))?;
            written += chunk.len() as u64;
            if written > MAX_ARCHIVE_SIZE {
                return Err(download_err(format!(
                    "archive exceeds {MAX_ARCHIVE_SIZE} bytes"
                )));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| download_err(format!("write {}: {e}", dest.display())))?;
        }
        file.flush()
            .await
            .map_err(|e| download_err(format!("flush {}: {e}", dest.display())))?;

        info!(url, bytes = written, path = %dest.display(), "archive downloaded");
        Ok(dest)
    }
}

/// URL의 마지막 경로 조각을 안전한 파일명으로 변환합니다.
///
/// 쿼리/프래그먼트는 제거하고 `[A-Za-z0-9._-]` 이외 문자는 `_`로 치환합니다.
pub fn archive_file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    let segment = without_query.rsplit('/').next().unwrap_or_default();
    let name: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.is_empty() || name.chars().all(|c| c == '.') {
        FALLBACK_ARCHIVE_NAME.to_owned()
    } else {
        name
    }
}
