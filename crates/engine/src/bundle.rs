//! 규칙 번들 -- 디스크 또는 인라인 텍스트에서 읽은 규칙 소스 모음
//!
//! 디렉토리를 지정하면 `*.conf` 파일을 이름 순서로 읽고, `@pmFromFile`이
//! 참조하는 `*.data` 파일도 함께 읽습니다.
//! 파일 하나의 크기는 [`MAX_RULE_FILE_SIZE`]로 제한됩니다.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use ocinspect_core::config::RulesConfig;
use ocinspect_core::error::{ConfigError, RuleViolation, ViolationKind};

/// 규칙 파일 하나의 최대 크기
pub const MAX_RULE_FILE_SIZE: u64 = 10 * 1024 * 1024; // 10MB

/// 인라인 소스 이름
pub const INLINE_SOURCE: &str = "<inline>";

/// 번들을 구성하는 규칙 소스
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSource {
    /// 파일 경로 또는 `<inline>`
    pub name: String,
    pub text: String,
}

/// 규칙 번들
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleBundle {
    sources: Vec<BundleSource>,
    /// 데이터 파일 (파일 이름 → 내용)
    data_files: BTreeMap<String, String>,
}

impl RuleBundle {
    /// 빈 번들
    pub fn empty() -> Self {
        Self::default()
    }

    /// 인라인 텍스트 하나로 된 번들
    pub fn inline(text: impl Into<String>) -> Self {
        let mut bundle = Self::default();
        bundle.push_source(INLINE_SOURCE, text);
        bundle
    }

    /// 소스를 뒤에 추가합니다.
    pub fn push_source(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.sources.push(BundleSource {
            name: name.into(),
            text: text.into(),
        });
    }

    /// 데이터 파일을 추가합니다.
    pub fn insert_data_file(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.data_files.insert(name.into(), content.into());
    }

    /// 규칙 소스 목록
    pub fn sources(&self) -> &[BundleSource] {
        &self.sources
    }

    /// 데이터 파일 목록
    pub fn data_files(&self) -> &BTreeMap<String, String> {
        &self.data_files
    }

    /// 소스가 없는지 여부
    pub fn is_empty(&self) -> bool {
        self.sources.iter().all(|s| s.text.trim().is_empty())
    }

    /// 번들 내용의 SHA-256 다이제스트 (hex)
    ///
    /// 소스 이름과 내용, 데이터 파일을 모두 포함하므로 파일 하나만 바뀌어도 달라집니다.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for source in &self.sources {
            hasher.update(source.name.as_bytes());
            hasher.update([0]);
            hasher.update(source.text.as_bytes());
            hasher.update([0]);
        }
        for (name, content) in &self.data_files {
            hasher.update(name.as_bytes());
            hasher.update([0]);
            hasher.update(content.as_bytes());
            hasher.update([0]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// 파일 또는 디렉토리에서 번들을 읽습니다.
    ///
    /// # Errors
    /// - 경로가 없으면 `ConfigError::FileNotFound`
    /// - 파일을 읽을 수 없거나 크기 제한을 넘으면 위반 목록을 담은 `ConfigError::RuleBundle`
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                io_violation(path, &e)
            }
        })?;

        let mut bundle = Self::default();
        let mut violations = Vec::new();

        if metadata.is_dir() {
            let (conf_files, data_files) = list_directory(path).await?;
            for file in &conf_files {
                match read_bounded(file).await {
                    Ok(text) => bundle.push_source(file.display().to_string(), text),
                    Err(v) => violations.push(v),
                }
            }
            for file in &data_files {
                let Some(name) = file.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                    continue;
                };
                match read_bounded(file).await {
                    Ok(text) => bundle.insert_data_file(name, text),
                    Err(v) => violations.push(v),
                }
            }
        } else {
            match read_bounded(path).await {
                Ok(text) => bundle.push_source(path.display().to_string(), text),
                Err(v) => violations.push(v),
            }
        }

        if !violations.is_empty() {
            return Err(ConfigError::RuleBundle { violations });
        }

        tracing::debug!(
            path = %path.display(),
            sources = bundle.sources.len(),
            data_files = bundle.data_files.len(),
            "read rule bundle"
        );
        Ok(bundle)
    }

    /// 설정된 기본/오버라이드 번들을 읽습니다.
    ///
    /// 기본 번들은 `base_path`의 규칙 뒤에 `inline` 텍스트를 붙인 것입니다.
    /// `override_path`가 비어 있으면 오버라이드 번들은 비어 있습니다.
    ///
    /// # Errors
    /// 경로를 읽을 수 없으면 에러를 반환합니다.
    pub async fn load_configured(config: &RulesConfig) -> Result<(Self, Self), ConfigError> {
        let mut base = if config.base_path.is_empty() {
            Self::default()
        } else {
            Self::from_path(&config.base_path).await?
        };
        if !config.inline.trim().is_empty() {
            base.push_source(INLINE_SOURCE, config.inline.clone());
        }

        let overrides = if config.override_path.is_empty() {
            Self::default()
        } else {
            Self::from_path(&config.override_path).await?
        };

        Ok((base, overrides))
    }
}

async fn list_directory(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), ConfigError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| io_violation(dir, &e))?;

    let mut conf_files = Vec::new();
    let mut data_files = Vec::new();

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_violation(dir, &e))?
    {
        let path = entry.path();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("conf") => conf_files.push(path),
            Some("data") => data_files.push(path),
            _ => {}
        }
    }

    // 디렉토리 순서는 플랫폼마다 다르므로 이름 순으로 정렬
    conf_files.sort();
    data_files.sort();
    Ok((conf_files, data_files))
}

async fn read_bounded(path: &Path) -> Result<String, RuleViolation> {
    let source = path.display().to_string();
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| RuleViolation::new(&source, 0, ViolationKind::Io, e.to_string()))?;

    if metadata.len() > MAX_RULE_FILE_SIZE {
        return Err(RuleViolation::new(
            &source,
            0,
            ViolationKind::Limit,
            format!(
                "file too large: {} bytes (max: {MAX_RULE_FILE_SIZE})",
                metadata.len()
            ),
        ));
    }

    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RuleViolation::new(&source, 0, ViolationKind::Io, e.to_string()))
}

fn io_violation(path: &Path, error: &std::io::Error) -> ConfigError {
    ConfigError::RuleBundle {
        violations: vec![RuleViolation::new(
            path.display().to_string(),
            0,
            ViolationKind::Io,
            error.to_string(),
        )],
    }
}
