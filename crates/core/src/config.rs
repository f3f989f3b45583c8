//! 설정 관리 — yarasweep.toml 파싱 및 런타임 설정
//!
//! [`YarasweepConfig`]는 설정 파일의 최상위 구조체이며,
//! [`RunnerConfig`]는 시작 시 한 번 확정되어 모든 컴포넌트에 명시적으로 전달되는
//! 불변 실행 설정입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`YARASWEEP_RUNNER_RULES_PATH=/opt/rules` 형식)
//! 3. 설정 파일 (`yarasweep.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), yarasweep_core::error::YarasweepError> {
//! use yarasweep_core::config::YarasweepConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = YarasweepConfig::load("yarasweep.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = YarasweepConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, YarasweepError};
use crate::types::{ScanSelector, Thresholds};

/// 규칙 파일 기본 이름 (규칙 디렉토리 내부)
pub const RULE_FILE_NAME: &str = "malware.yar";

/// 설치 상태 파일 이름 (규칙 디렉토리 내부)
pub const STATE_FILE_NAME: &str = "metaListingData.json";

/// 업데이트 주기 상한 (7일)
const MAX_UPDATE_INTERVAL_SECS: u64 = 604_800;

/// yarasweep 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct YarasweepConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 실행 설정
    #[serde(default)]
    pub runner: RunnerSection,
    /// 출력 설정
    #[serde(default)]
    pub output: OutputConfig,
    /// 실패 임계값
    #[serde(default)]
    pub thresholds: Thresholds,
    /// 원격 콘솔 설정
    #[serde(default)]
    pub console: ConsoleConfig,
    /// 메트릭 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl YarasweepConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, YarasweepError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// 파일이 없으면 기본값으로 시작하여 환경변수 오버라이드를 적용합니다.
    ///
    /// 에이전트는 설정 파일 없이 CLI 인자만으로도 실행될 수 있습니다.
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self, YarasweepError> {
        let path = path.as_ref();
        let mut config = match Self::from_file(path).await {
            Ok(config) => config,
            Err(YarasweepError::Config(ConfigError::FileNotFound { .. })) => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, YarasweepError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                YarasweepError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                YarasweepError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, YarasweepError> {
        toml::from_str(toml_str).map_err(|e| {
            YarasweepError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `YARASWEEP_{SECTION}_{FIELD}`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "YARASWEEP_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "YARASWEEP_GENERAL_LOG_FORMAT");

        // Runner
        override_string(&mut self.runner.socket_path, "YARASWEEP_RUNNER_SOCKET_PATH");
        override_string(&mut self.runner.rules_path, "YARASWEEP_RUNNER_RULES_PATH");
        override_string(
            &mut self.runner.rules_listing_url,
            "YARASWEEP_RUNNER_RULES_LISTING_URL",
        );
        override_string(
            &mut self.runner.host_mount_path,
            "YARASWEEP_RUNNER_HOST_MOUNT_PATH",
        );
        override_bool(
            &mut self.runner.fail_on_compile_warning,
            "YARASWEEP_RUNNER_FAIL_ON_COMPILE_WARNING",
        );
        override_u64(
            &mut self.runner.update_interval_secs,
            "YARASWEEP_RUNNER_UPDATE_INTERVAL_SECS",
        );
        override_u64(
            &mut self.runner.inactive_threshold_secs,
            "YARASWEEP_RUNNER_INACTIVE_THRESHOLD_SECS",
        );

        // Output
        override_string(&mut self.output.format, "YARASWEEP_OUTPUT_FORMAT");

        // Thresholds
        override_i64(
            &mut self.thresholds.fail_on_high_count,
            "YARASWEEP_THRESHOLDS_FAIL_ON_HIGH_COUNT",
        );
        override_i64(
            &mut self.thresholds.fail_on_medium_count,
            "YARASWEEP_THRESHOLDS_FAIL_ON_MEDIUM_COUNT",
        );
        override_i64(
            &mut self.thresholds.fail_on_low_count,
            "YARASWEEP_THRESHOLDS_FAIL_ON_LOW_COUNT",
        );
        override_i64(
            &mut self.thresholds.fail_on_count,
            "YARASWEEP_THRESHOLDS_FAIL_ON_COUNT",
        );

        // Console
        override_string(&mut self.console.url, "YARASWEEP_CONSOLE_URL");
        override_u16(&mut self.console.port, "YARASWEEP_CONSOLE_PORT");
        override_string(&mut self.console.key, "YARASWEEP_CONSOLE_KEY");

        // Metrics
        override_bool(&mut self.metrics.enabled, "YARASWEEP_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "YARASWEEP_METRICS_LISTEN_ADDR");
        override_u16(&mut self.metrics.port, "YARASWEEP_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), YarasweepError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_level".to_owned(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            }
            .into());
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_format".to_owned(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            }
            .into());
        }

        if OutputMode::from_str_loose(&self.output.format).is_none() {
            return Err(ConfigError::InvalidValue {
                field: "output.format".to_owned(),
                reason: "must be one of: json, table".to_owned(),
            }
            .into());
        }

        if self.runner.rules_path.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "runner.rules_path".to_owned(),
                reason: "rules path must not be empty".to_owned(),
            }
            .into());
        }

        if self.runner.update_interval_secs == 0
            || self.runner.update_interval_secs > MAX_UPDATE_INTERVAL_SECS
        {
            return Err(ConfigError::InvalidValue {
                field: "runner.update_interval_secs".to_owned(),
                reason: format!("must be 1-{MAX_UPDATE_INTERVAL_SECS}"),
            }
            .into());
        }

        // 서비스 모드는 업데이터를 함께 실행하므로 목록 URL이 필요
        if !self.runner.socket_path.is_empty() && self.runner.rules_listing_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "runner.rules_listing_url".to_owned(),
                reason: "listing url must not be empty when socket_path is set".to_owned(),
            }
            .into());
        }

        if self.runner.max_file_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "runner.max_file_size".to_owned(),
                reason: "must be greater than 0".to_owned(),
            }
            .into());
        }

        Ok(())
    }
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
        }
    }
}

/// 실행 설정 섹션
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    /// 서비스 모드 Unix 소켓 경로. 비어있으면 1회 실행 모드
    pub socket_path: String,
    /// 규칙 저장 디렉토리
    pub rules_path: String,
    /// 원격 버전 목록 URL
    pub rules_listing_url: String,
    /// 호스트 파일시스템 마운트 경로 (컨테이너 배포 시)
    pub host_mount_path: String,
    /// 규칙 컴파일 경고를 에러로 취급
    pub fail_on_compile_warning: bool,
    /// 규칙 업데이트 주기 (초)
    pub update_interval_secs: u64,
    /// 유휴 연결 종료 기준 (초)
    pub inactive_threshold_secs: u64,
    /// 스캔 대상 파일 최대 크기 (바이트)
    pub max_file_size: u64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            socket_path: String::new(),
            rules_path: "/var/lib/yarasweep/rules".to_owned(),
            rules_listing_url: String::new(),
            host_mount_path: String::new(),
            fail_on_compile_warning: false,
            update_interval_secs: 10 * 60 * 60, // 10 hours
            inactive_threshold_secs: 600,
            max_file_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// 출력 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// 출력 형식 (json, table)
    pub format: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "table".to_owned(),
        }
    }
}

/// 원격 콘솔 설정
///
/// `url`과 `key`가 모두 설정된 경우에만 결과를 전송합니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// 콘솔 URL
    pub url: String,
    /// 콘솔 포트 (0이면 URL 기본 포트)
    pub port: u16,
    /// 접근 키
    pub key: String,
}

impl ConsoleConfig {
    /// 리포트 전송이 설정되어 있는지 반환합니다.
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty() && !self.key.is_empty()
    }
}

/// 메트릭 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus 엔드포인트 활성화 여부 (서비스 모드 전용)
    pub enabled: bool,
    /// 바인드 주소
    pub listen_addr: String,
    /// 포트
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9464,
        }
    }
}

/// 결과 출력 형식
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// 구조화된 JSON
    Json,
    /// 사람이 읽는 표
    #[default]
    Table,
}

impl OutputMode {
    /// 문자열에서 출력 형식을 파싱합니다 (대소문자 무시).
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "table" | "text" => Some(Self::Table),
            _ => None,
        }
    }
}

/// 불변 실행 설정
///
/// 시작 시 한 번 확정되어 각 컴포넌트 호출에 명시적으로 전달됩니다.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// 서비스 모드 소켓 경로 (비어있으면 1회 실행)
    pub socket_path: String,
    /// 규칙 저장 디렉토리
    pub rules_path: PathBuf,
    /// 원격 버전 목록 URL
    pub rules_listing_url: String,
    /// 호스트 마운트 경로
    pub host_mount_path: String,
    /// 컴파일 경고를 에러로 취급
    pub fail_on_compile_warning: bool,
    /// 스캔 대상 선택자
    pub selector: ScanSelector,
    /// 콘솔 설정
    pub console: ConsoleConfig,
    /// 출력 형식
    pub output: OutputMode,
    /// 실패 임계값
    pub thresholds: Thresholds,
    /// 업데이트 주기
    pub update_interval: Duration,
    /// 유휴 연결 종료 기준
    pub inactive_threshold: Duration,
    /// 스캔 대상 파일 최대 크기
    pub max_file_size: u64,
}

impl RunnerConfig {
    /// 파일 설정과 스캔 대상 선택자로 실행 설정을 확정합니다.
    pub fn resolve(config: &YarasweepConfig, selector: ScanSelector) -> Self {
        let output = OutputMode::from_str_loose(&config.output.format).unwrap_or_default();
        Self {
            socket_path: config.runner.socket_path.clone(),
            rules_path: PathBuf::from(&config.runner.rules_path),
            rules_listing_url: config.runner.rules_listing_url.clone(),
            host_mount_path: config.runner.host_mount_path.clone(),
            fail_on_compile_warning: config.runner.fail_on_compile_warning,
            selector,
            console: config.console.clone(),
            output,
            thresholds: config.thresholds,
            update_interval: Duration::from_secs(config.runner.update_interval_secs),
            inactive_threshold: Duration::from_secs(config.runner.inactive_threshold_secs),
            max_file_size: config.runner.max_file_size,
        }
    }

    /// 서비스 모드 여부 (소켓 경로가 설정된 경우)
    pub fn is_service_mode(&self) -> bool {
        !self.socket_path.is_empty()
    }

    /// 설치된 규칙 파일 경로
    pub fn rule_file(&self) -> PathBuf {
        self.rules_path.join(RULE_FILE_NAME)
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_u16(target: &mut u16, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u16>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u16 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

fn override_i64(target: &mut i64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<i64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse i64 from env var, ignoring"
            ),
        }
    }
}
