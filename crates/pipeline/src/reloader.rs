//! 규칙 재적재기 -- 설정된 번들을 주기적으로 다시 읽어 바뀌면 활성화
//!
//! 번들 다이제스트가 바뀌었을 때만 새 규칙 집합을 컴파일합니다. 거부된 번들은
//! 위반 사항을 한 번만 로그로 남기고 이전 규칙 집합을 계속 사용합니다.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ocinspect_core::config::RulesConfig;
use ocinspect_core::error::{InspectError, PipelineError};
use ocinspect_core::pipeline::{HealthStatus, Pipeline};
use ocinspect_engine::{EngineBinding, RuleBundle, RuleSet, RuleSetLoader};

use crate::config::PipelineConfig;
use crate::error::InspectionPipelineError;
use crate::supervisor::EngineSupervisor;

/// 재적재 확인 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// 번들이 바뀌지 않음
    Unchanged,
    /// 새 규칙 집합 활성화
    Activated { version: String },
    /// 번들 거부, 이전 규칙 집합 유지
    Rejected { violations: usize },
    /// 번들을 읽지 못했거나 활성화하지 못함
    Failed { reason: String },
}

struct ReloadShared<B: EngineBinding> {
    supervisor: Arc<EngineSupervisor<B>>,
    rules: RulesConfig,
    last_digest: Mutex<Option<String>>,
}

impl<B: EngineBinding> ReloadShared<B> {
    fn last_digest(&self) -> Option<String> {
        self.last_digest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_last_digest(&self, digest: Option<String>) {
        *self
            .last_digest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = digest;
    }

    async fn activate(
        &self,
        base: RuleBundle,
        overrides: RuleBundle,
    ) -> Result<Arc<RuleSet<B>>, InspectionPipelineError> {
        let supervisor = Arc::clone(&self.supervisor);
        tokio::task::spawn_blocking(move || supervisor.load_and_activate(&base, &overrides))
            .await
            .map_err(|e| InspectionPipelineError::Channel(format!("rule compilation task failed: {e}")))?
            .map_err(InspectionPipelineError::from)
    }

    async fn check_once(&self) -> ReloadOutcome {
        let (base, overrides) = match RuleBundle::load_configured(&self.rules).await {
            Ok(bundles) => bundles,
            Err(e) => {
                warn!(error = %e, "failed to read rule bundles, keeping active rule set");
                return ReloadOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let digest = RuleSetLoader::digest(&base, &overrides);
        let previous = self.last_digest();
        if previous.as_deref() == Some(digest.as_str()) {
            debug!(%digest, "rule bundles unchanged");
            return ReloadOutcome::Unchanged;
        }

        info!(%digest, "rule bundles changed, reloading");
        self.set_last_digest(Some(digest));

        match self.activate(base, overrides).await {
            Ok(rule_set) => ReloadOutcome::Activated {
                version: rule_set.version(),
            },
            Err(InspectionPipelineError::RuleSet(e)) => ReloadOutcome::Rejected {
                violations: e.violations().len().max(1),
            },
            Err(e) => {
                // 번들 문제가 아니므로 다음 주기에 다시 시도
                self.set_last_digest(previous);
                ReloadOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloaderState {
    Initialized,
    Running,
    Stopped,
}

/// 규칙 재적재기
pub struct RuleReloader<B: EngineBinding> {
    shared: Arc<ReloadShared<B>>,
    interval: Option<Duration>,
    state: ReloaderState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<B: EngineBinding> RuleReloader<B> {
    /// 재적재기를 생성합니다. `interval`이 `None`이면 주기 확인을 하지 않습니다.
    pub fn new(
        supervisor: Arc<EngineSupervisor<B>>,
        rules: RulesConfig,
        interval: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(ReloadShared {
                supervisor,
                rules,
                last_digest: Mutex::new(None),
            }),
            interval,
            state: ReloaderState::Initialized,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// 파이프라인 설정으로 재적재기를 생성합니다.
    pub fn from_config(supervisor: Arc<EngineSupervisor<B>>, config: &PipelineConfig) -> Self {
        Self::new(supervisor, config.rules.clone(), config.reload_interval())
    }

    /// 시작 시 규칙 집합을 읽어 활성화합니다.
    ///
    /// # Errors
    /// 번들을 읽을 수 없거나 거부되면 에러를 반환합니다. 시작 시에는 대신 사용할
    /// 이전 규칙 집합이 없습니다.
    pub async fn load_initial(&self) -> Result<Arc<RuleSet<B>>, InspectionPipelineError> {
        let (base, overrides) = RuleBundle::load_configured(&self.shared.rules).await?;
        let digest = RuleSetLoader::digest(&base, &overrides);
        let rule_set = self.shared.activate(base, overrides).await?;
        self.shared.set_last_digest(Some(digest));
        Ok(rule_set)
    }

    /// 번들을 한 번 확인합니다.
    pub async fn check_once(&self) -> ReloadOutcome {
        self.shared.check_once().await
    }

    /// 마지막으로 처리한 번들 다이제스트
    pub fn last_digest(&self) -> Option<String> {
        self.shared.last_digest()
    }
}

impl<B: EngineBinding> Pipeline for RuleReloader<B> {
    async fn start(&mut self) -> Result<(), InspectError> {
        if self.state == ReloaderState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        self.cancel = CancellationToken::new();
        if let Some(period) = self.interval {
            let shared = Arc::clone(&self.shared);
            let cancel = self.cancel.clone();
            self.task = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let outcome = shared.check_once().await;
                            debug!(?outcome, "rule reload check");
                        }
                    }
                }
                debug!("rule reloader loop stopped");
            }));
            info!(interval_secs = period.as_secs(), "rule reloader started");
        } else {
            info!("rule reloading disabled");
        }

        self.state = ReloaderState::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), InspectError> {
        if self.state != ReloaderState::Running {
            return Err(PipelineError::NotRunning.into());
        }
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "rule reloader task failed");
        }
        self.state = ReloaderState::Stopped;
        info!("rule reloader stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            ReloaderState::Running => {
                if self.shared.supervisor.current_rule_set().is_some() {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded("no active rule set".to_owned())
                }
            }
            ReloaderState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            ReloaderState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}
