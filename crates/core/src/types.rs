//! 도메인 타입 — 시스템 전역에서 사용되는 공통 타입
//!
//! 스캔 요청, 탐지 결과(IOC), 심각도 집계, 실패 임계값을 정의합니다.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 심각도 레벨
///
/// `Ord` 구현으로 심각도 비교가 가능합니다 (`Low < Medium < High`).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// 낮은 심각도
    #[default]
    Low,
    /// 중간 심각도
    Medium,
    /// 높은 심각도
    High,
}

impl Severity {
    /// 문자열에서 심각도를 파싱합니다.
    ///
    /// 대소문자를 구분하지 않습니다. `critical`은 `High`로, `info`는 `Low`로 접힙니다.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" | "info" | "informational" => Some(Self::Low),
            "medium" | "med" | "moderate" => Some(Self::Medium),
            "high" | "critical" | "crit" => Some(Self::High),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// 매칭 엔진이 생성한 단일 탐지 결과 (IOC)
///
/// 중복 판정은 규칙 ID + 위치 + 메타데이터 기준입니다 ([`Finding::identity`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// 매칭된 규칙 ID
    pub rule_id: String,
    /// 심각도
    pub severity: Severity,
    /// 스캔 루트 기준 파일 경로
    pub location: String,
    /// 규칙 메타데이터
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// 매칭된 문자열 식별자 (예: `$a`)
    #[serde(default)]
    pub matched_strings: Vec<String>,
}

impl Finding {
    /// 중복 판정 키를 반환합니다.
    pub fn identity(&self) -> (&str, &str, &BTreeMap<String, String>) {
        (&self.rule_id, &self.location, &self.metadata)
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} at {}", self.severity, self.rule_id, self.location)
    }
}

/// 스캔 대상 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    /// 로컬 디렉토리
    Path,
    /// 컨테이너 이미지
    Image,
    /// 실행 중인 컨테이너
    Container,
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path => write!(f, "path"),
            Self::Image => write!(f, "image"),
            Self::Container => write!(f, "container"),
        }
    }
}

/// 스캔 요청
///
/// 정확히 하나의 변형만 활성화됩니다. 변형이 어떤 해석기(resolver)를 사용할지 결정합니다.
///
/// 전송 계층에서는 `{"kind": "path", "value": "/srv"}` 형태로 직렬화됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ScanRequest {
    /// 파일시스템 경로
    Path(String),
    /// 이미지 참조 (예: `nginx:1.27`)
    Image(String),
    /// 컨테이너 ID
    Container(String),
}

impl ScanRequest {
    /// 요청 종류를 반환합니다.
    pub fn kind(&self) -> ScanKind {
        match self {
            Self::Path(_) => ScanKind::Path,
            Self::Image(_) => ScanKind::Image,
            Self::Container(_) => ScanKind::Container,
        }
    }

    /// 대상 식별자 (경로, 이미지명, 컨테이너 ID)를 반환합니다.
    pub fn target(&self) -> &str {
        match self {
            Self::Path(v) | Self::Image(v) | Self::Container(v) => v,
        }
    }
}

impl fmt::Display for ScanRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.target())
    }
}

/// CLI/설정에서 들어온 스캔 대상 선택자
///
/// 세 필드 중 정확히 하나만 채워져 있어야 [`ScanRequest`]로 변환됩니다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSelector {
    /// 로컬 디렉토리 경로
    pub local: String,
    /// 이미지명
    pub image_name: String,
    /// 컨테이너 ID
    pub container_id: String,
}

impl ScanSelector {
    /// 선택자를 스캔 요청으로 변환합니다.
    ///
    /// # Errors
    ///
    /// 비어있거나 둘 이상 지정된 경우 `ConfigError::InvalidTarget`을 반환합니다.
    pub fn to_request(&self) -> Result<ScanRequest, ConfigError> {
        let candidates = [
            (!self.local.trim().is_empty()).then(|| ScanRequest::Path(self.local.clone())),
            (!self.image_name.trim().is_empty())
                .then(|| ScanRequest::Image(self.image_name.clone())),
            (!self.container_id.trim().is_empty())
                .then(|| ScanRequest::Container(self.container_id.clone())),
        ];

        let mut set = candidates.into_iter().flatten();
        match (set.next(), set.next()) {
            (Some(request), None) => Ok(request),
            (None, _) => Err(ConfigError::InvalidTarget(
                "set exactly one of --local, --image-name or --container-id".to_owned(),
            )),
            (Some(_), Some(_)) => Err(ConfigError::InvalidTarget(
                "only one of --local, --image-name or --container-id may be set".to_owned(),
            )),
        }
    }
}

/// 심각도별 탐지 결과 수
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub total: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

impl SeverityCounts {
    /// 결과 하나를 집계에 추가합니다.
    pub fn record(&mut self, severity: Severity) {
        self.total += 1;
        match severity {
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }
}

impl fmt::Display for SeverityCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} high={} medium={} low={}",
            self.total, self.high, self.medium, self.low
        )
    }
}

/// 실패 임계값
///
/// 0 이하의 값은 해당 등급에 임계값이 없음을 뜻합니다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// high 등급 상한
    pub fail_on_high_count: i64,
    /// medium 등급 상한
    pub fail_on_medium_count: i64,
    /// low 등급 상한
    pub fail_on_low_count: i64,
    /// 전체 상한
    pub fail_on_count: i64,
}

impl Thresholds {
    /// 모든 등급이 비활성화되어 있는지 반환합니다.
    pub fn is_disabled(&self) -> bool {
        self.fail_on_high_count <= 0
            && self.fail_on_medium_count <= 0
            && self.fail_on_low_count <= 0
            && self.fail_on_count <= 0
    }
}
