//! 설정 관리 -- ocinspect.toml 파싱 및 런타임 설정
//!
//! [`OcInspectConfig`]는 모든 구성 요소의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`OCINSPECT_INSPECTION_TIMEOUT_MS=250` 형식)
//! 3. 설정 파일 (`ocinspect.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), ocinspect_core::error::InspectError> {
//! use ocinspect_core::config::OcInspectConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = OcInspectConfig::load("ocinspect.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = OcInspectConfig::parse("[inspection]\ntimeout_ms = 250")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, InspectError};

/// 검사 본문 크기 상한 (64 MiB)
pub const MAX_BODY_BYTES_LIMIT: usize = 64 * 1024 * 1024;

/// 동시 검사 작업자 상한
pub const MAX_CONCURRENCY_LIMIT: usize = 1024;

/// 지원하는 엔진 바인딩 이름
pub const SUPPORTED_BINDINGS: &[&str] = &["seclang"];

/// ocinspect 통합 설정
///
/// `ocinspect.toml` 파일의 최상위 구조를 나타냅니다.
/// 각 구성 요소는 자기 섹션만 읽어 사용합니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcInspectConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 규칙 엔진 바인딩 설정
    #[serde(default)]
    pub engine: EngineConfig,
    /// 규칙 번들 설정
    #[serde(default)]
    pub rules: RulesConfig,
    /// 검사 스테이지 설정
    #[serde(default)]
    pub inspection: InspectionConfig,
    /// 결과 상관기 설정
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    /// 메트릭 엔드포인트 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl OcInspectConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, InspectError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, InspectError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                InspectError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                InspectError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, InspectError> {
        toml::from_str(toml_str).map_err(|e| {
            InspectError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `OCINSPECT_{SECTION}_{FIELD}`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "OCINSPECT_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "OCINSPECT_GENERAL_LOG_FORMAT");

        // Engine
        override_string(&mut self.engine.binding, "OCINSPECT_ENGINE_BINDING");
        override_string(&mut self.engine.version_req, "OCINSPECT_ENGINE_VERSION_REQ");

        // Rules
        override_string(&mut self.rules.base_path, "OCINSPECT_RULES_BASE_PATH");
        override_string(
            &mut self.rules.override_path,
            "OCINSPECT_RULES_OVERRIDE_PATH",
        );
        override_string(&mut self.rules.inline, "OCINSPECT_RULES_INLINE");
        override_u64(
            &mut self.rules.reload_interval_secs,
            "OCINSPECT_RULES_RELOAD_INTERVAL_SECS",
        );

        // Inspection
        override_u64(
            &mut self.inspection.timeout_ms,
            "OCINSPECT_INSPECTION_TIMEOUT_MS",
        );
        override_usize(
            &mut self.inspection.max_body_bytes,
            "OCINSPECT_INSPECTION_MAX_BODY_BYTES",
        );
        override_usize(
            &mut self.inspection.max_concurrency,
            "OCINSPECT_INSPECTION_MAX_CONCURRENCY",
        );
        override_usize(
            &mut self.inspection.queue_capacity,
            "OCINSPECT_INSPECTION_QUEUE_CAPACITY",
        );
        override_bool(
            &mut self.inspection.redact_sensitive,
            "OCINSPECT_INSPECTION_REDACT_SENSITIVE",
        );
        override_u64(
            &mut self.inspection.drain_grace_secs,
            "OCINSPECT_INSPECTION_DRAIN_GRACE_SECS",
        );
        override_bool(
            &mut self.inspection.param_inspection,
            "OCINSPECT_INSPECTION_PARAM_INSPECTION",
        );

        // Correlator
        override_u64(
            &mut self.correlator.span_hold_ms,
            "OCINSPECT_CORRELATOR_SPAN_HOLD_MS",
        );
        override_u64(
            &mut self.correlator.attached_retention_secs,
            "OCINSPECT_CORRELATOR_ATTACHED_RETENTION_SECS",
        );
        override_usize(
            &mut self.correlator.output_capacity,
            "OCINSPECT_CORRELATOR_OUTPUT_CAPACITY",
        );

        // Metrics
        override_bool(&mut self.metrics.enabled, "OCINSPECT_METRICS_ENABLED");
        override_string(
            &mut self.metrics.listen_addr,
            "OCINSPECT_METRICS_LISTEN_ADDR",
        );
        override_u16(&mut self.metrics.port, "OCINSPECT_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), InspectError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if !SUPPORTED_BINDINGS.contains(&self.engine.binding.as_str()) {
            return Err(invalid(
                "engine.binding",
                format!("must be one of: {}", SUPPORTED_BINDINGS.join(", ")),
            ));
        }

        if let Err(e) = semver::VersionReq::parse(&self.engine.version_req) {
            return Err(invalid(
                "engine.version_req",
                format!("invalid semver requirement: {e}"),
            ));
        }

        if self.rules.base_path.trim().is_empty() && self.rules.inline.trim().is_empty() {
            return Err(invalid(
                "rules.base_path",
                "either base_path or inline rules must be set".to_owned(),
            ));
        }

        if self.inspection.timeout_ms == 0 {
            return Err(invalid(
                "inspection.timeout_ms",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.inspection.max_body_bytes == 0
            || self.inspection.max_body_bytes > MAX_BODY_BYTES_LIMIT
        {
            return Err(invalid(
                "inspection.max_body_bytes",
                format!("must be between 1 and {MAX_BODY_BYTES_LIMIT}"),
            ));
        }

        if self.inspection.max_concurrency == 0
            || self.inspection.max_concurrency > MAX_CONCURRENCY_LIMIT
        {
            return Err(invalid(
                "inspection.max_concurrency",
                format!("must be between 1 and {MAX_CONCURRENCY_LIMIT}"),
            ));
        }

        if self.inspection.queue_capacity == 0 {
            return Err(invalid(
                "inspection.queue_capacity",
                "must be greater than 0".to_owned(),
            ));
        }

        // 유예 시간이 트랜잭션 예산보다 짧으면 진행 중 검사가 종료 시 중단됨
        if self.inspection.drain_grace_secs.saturating_mul(1_000) < self.inspection.timeout_ms {
            return Err(invalid(
                "inspection.drain_grace_secs",
                format!(
                    "must cover inspection.timeout_ms ({} ms)",
                    self.inspection.timeout_ms
                ),
            ));
        }

        if self.correlator.output_capacity == 0 {
            return Err(invalid(
                "correlator.output_capacity",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(invalid(
                "metrics.port",
                "must be non-zero when metrics are enabled".to_owned(),
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: String) -> InspectError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
    .into()
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
            log_format: "json".to_owned(),
        }
    }
}

/// 규칙 엔진 바인딩 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 바인딩 이름 (seclang)
    pub binding: String,
    /// 허용하는 바인딩 버전 (semver 요구 조건)
    pub version_req: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binding: "seclang".to_owned(),
            version_req: "^1".to_owned(),
        }
    }
}

/// 규칙 번들 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// 기본 규칙 번들 (파일 또는 `*.conf` 디렉토리)
    pub base_path: String,
    /// 환경 오버라이드 번들 (비어 있으면 없음)
    pub override_path: String,
    /// 인라인 규칙 텍스트 (`base_path` 뒤에 기본 규칙으로 병합)
    pub inline: String,
    /// 번들 재적재 확인 주기 (초, 0이면 비활성)
    pub reload_interval_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            base_path: "/etc/ocinspect/crs".to_owned(),
            override_path: String::new(),
            inline: String::new(),
            reload_interval_secs: 30,
        }
    }
}

/// 검사 스테이지 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionConfig {
    /// 트랜잭션당 평가 시간 예산 (ms)
    pub timeout_ms: u64,
    /// 본문 검사 크기 상한 (바이트)
    pub max_body_bytes: usize,
    /// 동시 검사 작업자 수
    pub max_concurrency: usize,
    /// 입력 큐 용량
    pub queue_capacity: usize,
    /// 매칭 메시지에서 민감 값 가리기
    pub redact_sensitive: bool,
    /// 종료 시 진행 중 컨텍스트 대기 시간 (초)
    pub drain_grace_secs: u64,
    /// 규칙 엔진과 별개의 파라미터 이상 검사 (XXE, NoSQL 연산자)
    pub param_inspection: bool,
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 200,
            max_body_bytes: 128 * 1024, // 128KB
            max_concurrency: 16,
            queue_capacity: 1024,
            redact_sensitive: true,
            drain_grace_secs: 10,
            param_inspection: true,
        }
    }
}

/// 결과 상관기 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// 결과를 기다리며 스팬을 보류하는 최대 시간 (ms)
    pub span_hold_ms: u64,
    /// 중복 attach 감지를 위해 연결 완료 ID를 보존하는 시간 (초)
    pub attached_retention_secs: u64,
    /// 출력 채널 용량
    pub output_capacity: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            span_hold_ms: 2_000,
            attached_retention_secs: 300,
            output_capacity: 1024,
        }
    }
}

/// 메트릭 엔드포인트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 수신 주소
    pub listen_addr: String,
    /// 수신 포트
    pub port: u16,
    /// 엔드포인트 경로
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9464,
            endpoint: "/metrics".to_owned(),
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    override_parsed(target, env_key, "bool");
}

fn override_usize(target: &mut usize, env_key: &str) {
    override_parsed(target, env_key, "usize");
}

fn override_u16(target: &mut u16, env_key: &str) {
    override_parsed(target, env_key, "u16");
}

fn override_u64(target: &mut u64, env_key: &str) {
    override_parsed(target, env_key, "u64");
}

fn override_parsed<T: std::str::FromStr>(target: &mut T, env_key: &str, type_name: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = type_name,
                "failed to parse env var, ignoring"
            ),
        }
    }
}
