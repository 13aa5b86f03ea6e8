//! 검사 스테이지 -- 트랜잭션 정규화, 단계별 평가, 결과 전달의 전체 흐름
//!
//! [`InspectionStage`]는 core의 [`Pipeline`] trait을 구현하여 데몬에서
//! 다른 구성 요소와 동일한 생명주기로 관리됩니다.
//!
//! # 트랜잭션 상태
//! ```text
//! Received -> Normalizing -> AwaitingContext -> Evaluating(1..4) -> Completed
//!                  |                 |                 |
//!                  +-----------------+-----------------+--> Failed | TimedOut
//! ```
//! 종료 상태에 도달하면 컨텍스트를 해제하고, 모은 결과를 상관기에 정확히 한 번 전달합니다.
//!
//! # 내부 아키텍처
//! ```text
//! transaction_sender -> mpsc -> dispatcher -> Semaphore(max_concurrency)
//!   -> worker: Normalizer -> EngineSupervisor::acquire -> ContextGuard (blocking pool)
//!   -> FindingCorrelator -> mpsc -> downstream
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use ocinspect_core::error::{CorrelationError, EngineError, InspectError, PipelineError};
use ocinspect_core::finding::{Finding, InspectionOutcome, InspectionStatus};
use ocinspect_core::metrics as m;
use ocinspect_core::pipeline::{HealthStatus, Pipeline};
use ocinspect_core::record::CorrelatedRecord;
use ocinspect_core::transaction::{NormalizedTransaction, RawTransaction};
use ocinspect_core::types::Phase;
use ocinspect_engine::{EngineBinding, RuleMatch};

use crate::config::PipelineConfig;
use crate::correlator::FindingCorrelator;
use crate::error::InspectionPipelineError;
use crate::normalizer::Normalizer;
use crate::param_inspector::ParamInspection;
use crate::supervisor::{ContextGuard, EngineSupervisor};

/// 민감 값 대체 문자열
pub const REDACTED: &str = "***";

/// 유예 시간이 지나 중단된 트랜잭션의 실패 사유
pub const ABORTED_AT_SHUTDOWN: &str = "aborted at shutdown";

/// 중단 요청 후 작업자가 실패 결과를 전달할 때까지 기다리는 시간
const ABORT_SETTLE: Duration = Duration::from_secs(1);

/// 스테이지 실행 상태
#[derive(Debug, Clone, PartialEq, Eq)]
enum StageState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 트랜잭션 처리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Received,
    Normalizing,
    AwaitingContext,
    Evaluating(Phase),
    Completed,
    Failed,
    TimedOut,
}

impl TxState {
    /// 종료 상태 여부
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => f.write_str("received"),
            Self::Normalizing => f.write_str("normalizing"),
            Self::AwaitingContext => f.write_str("awaiting-context"),
            Self::Evaluating(phase) => write!(f, "evaluating({phase})"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
            Self::TimedOut => f.write_str("timed-out"),
        }
    }
}

/// 상태 전이 기록기
struct Transitions {
    current: TxState,
}

impl Transitions {
    fn new() -> Self {
        Self {
            current: TxState::Received,
        }
    }

    fn advance(&mut self, next: TxState) {
        debug!(from = %self.current, to = %next, "transaction state");
        self.current = next;
    }
}

/// 단일 트랜잭션 검사기
///
/// 스테이지의 작업자가 공유합니다. 복제 비용은 `Arc` 몇 개입니다.
pub struct Inspector<B: EngineBinding> {
    supervisor: Arc<EngineSupervisor<B>>,
    correlator: Arc<FindingCorrelator>,
    normalizer: Normalizer,
    timeout: Duration,
    redact_sensitive: bool,
    param_inspection: ParamInspection,
}

impl<B: EngineBinding> Clone for Inspector<B> {
    fn clone(&self) -> Self {
        Self {
            supervisor: Arc::clone(&self.supervisor),
            correlator: Arc::clone(&self.correlator),
            normalizer: self.normalizer.clone(),
            timeout: self.timeout,
            redact_sensitive: self.redact_sensitive,
            param_inspection: self.param_inspection.clone(),
        }
    }
}

impl<B: EngineBinding> Inspector<B> {
    /// 검사기를 생성합니다. 파라미터 검사는 기본 검사기로 켜져 있습니다.
    pub fn new(
        supervisor: Arc<EngineSupervisor<B>>,
        correlator: Arc<FindingCorrelator>,
        normalizer: Normalizer,
        timeout: Duration,
        redact_sensitive: bool,
    ) -> Self {
        Self {
            supervisor,
            correlator,
            normalizer,
            timeout,
            redact_sensitive,
            param_inspection: ParamInspection::standard(),
        }
    }

    /// 파라미터 검사기 묶음을 바꿉니다.
    pub fn with_param_inspection(mut self, param_inspection: ParamInspection) -> Self {
        self.param_inspection = param_inspection;
        self
    }

    /// 엔진 관리자
    pub fn supervisor(&self) -> &Arc<EngineSupervisor<B>> {
        &self.supervisor
    }

    /// 결과 상관기
    pub fn correlator(&self) -> &Arc<FindingCorrelator> {
        &self.correlator
    }

    /// 트랜잭션을 검사하고 결과를 상관기에 전달합니다.
    ///
    /// # Errors
    /// 상관기가 결과를 거부하면 `CorrelationError`를 반환합니다.
    pub async fn process(&self, raw: RawTransaction) -> Result<(), CorrelationError> {
        match self.inspect(raw).await {
            Some(outcome) => self.correlator.attach(outcome).await,
            None => Ok(()),
        }
    }

    /// 트랜잭션 하나를 검사합니다.
    ///
    /// 상관 ID가 없는 트랜잭션은 결과를 붙일 곳이 없으므로 로그와 카운터만 남기고
    /// `None`을 반환합니다. 그 외에는 항상 상태가 붙은 결과를 반환합니다.
    pub async fn inspect(&self, raw: RawTransaction) -> Option<InspectionOutcome> {
        let Some(correlation_id) = raw.correlation_id().map(str::to_owned) else {
            metrics::counter!(
                m::INSPECTION_NORMALIZATION_ERRORS_TOTAL,
                m::LABEL_KIND => "missing_correlation_id"
            )
            .increment(1);
            warn!(
                method = %raw.method,
                uri = %raw.uri,
                "transaction without correlation id, findings cannot be attached"
            );
            return None;
        };

        let span = info_span!("inspect", correlation_id = %correlation_id);
        let outcome = self.run(correlation_id, raw).instrument(span).await;
        Some(outcome)
    }

    async fn run(&self, correlation_id: String, raw: RawTransaction) -> InspectionOutcome {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut transitions = Transitions::new();

        transitions.advance(TxState::Normalizing);
        let tx = match self.normalizer.normalize(&raw) {
            Ok(tx) => Arc::new(tx),
            Err(e) => {
                metrics::counter!(
                    m::INSPECTION_NORMALIZATION_ERRORS_TOTAL,
                    m::LABEL_KIND => "invalid_transaction"
                )
                .increment(1);
                warn!(error = %e, "transaction rejected by normalizer");
                transitions.advance(TxState::Failed);
                let outcome = InspectionOutcome::new(
                    correlation_id,
                    InspectionStatus::Failed {
                        reason: e.to_string(),
                    },
                );
                return self.finish(outcome, started);
            }
        };
        drop(raw);

        transitions.advance(TxState::AwaitingContext);
        let supervisor = Arc::clone(&self.supervisor);
        let acquired = timeout_at(
            deadline,
            tokio::task::spawn_blocking(move || supervisor.acquire()),
        )
        .await;
        let guard = match acquired {
            Ok(Ok(Ok(guard))) => guard,
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "no evaluation context");
                transitions.advance(TxState::Failed);
                let outcome = InspectionOutcome::new(
                    correlation_id,
                    InspectionStatus::Failed {
                        reason: e.to_string(),
                    },
                );
                return self.finish(outcome, started);
            }
            Ok(Err(join)) => {
                warn!(error = %join, "context acquisition task failed");
                transitions.advance(TxState::Failed);
                let outcome = InspectionOutcome::new(
                    correlation_id,
                    InspectionStatus::Failed {
                        reason: format!("context acquisition failed: {join}"),
                    },
                );
                return self.finish(outcome, started);
            }
            Err(_) => {
                // 늦게 만들어진 컨텍스트는 블로킹 태스크 결과와 함께 해제됨
                warn!(budget_ms = self.timeout.as_millis() as u64, "timed out awaiting context");
                transitions.advance(TxState::TimedOut);
                let outcome = InspectionOutcome::new(correlation_id, InspectionStatus::TimedOut);
                return self.finish(outcome, started);
            }
        };

        let mut outcome = InspectionOutcome::new(correlation_id, InspectionStatus::Completed);
        outcome.rule_set_version = Some(guard.rule_set().version());
        let epoch = guard.epoch();
        let mut slot: Option<ContextGuard<B>> = Some(guard);

        for phase in Phase::ALL {
            let Some(mut guard) = slot.take() else {
                break;
            };
            transitions.advance(TxState::Evaluating(phase));

            let phase_started = Instant::now();
            let shared_tx = Arc::clone(&tx);
            let call = tokio::task::spawn_blocking(move || {
                let result = guard.evaluate_phase(phase, &shared_tx);
                (guard, result)
            });

            match timeout_at(deadline, call).await {
                Ok(Ok((guard, Ok(matches)))) => {
                    metrics::histogram!(
                        m::ENGINE_PHASE_DURATION_SECONDS,
                        m::LABEL_PHASE => phase.as_str()
                    )
                    .record(phase_started.elapsed().as_secs_f64());
                    outcome.phases_completed.push(phase);
                    outcome
                        .findings
                        .extend(matches.into_iter().map(|rm| self.to_finding(rm, &tx)));
                    slot = Some(guard);
                }
                Ok(Ok((guard, Err(e)))) => {
                    drop(guard);
                    warn!(%phase, error = %e, "phase evaluation failed");
                    if e.is_fatal() {
                        self.report_fatal(epoch, &e).await;
                    }
                    outcome.status = InspectionStatus::Failed {
                        reason: e.to_string(),
                    };
                    transitions.advance(TxState::Failed);
                }
                Ok(Err(join)) => {
                    warn!(%phase, error = %join, "phase evaluation task failed");
                    outcome.status = InspectionStatus::Failed {
                        reason: format!("evaluation task failed in {phase}: {join}"),
                    };
                    transitions.advance(TxState::Failed);
                }
                Err(_) => {
                    // 진행 중 호출은 버려지고, 호출이 돌아오면 가드가 컨텍스트를 해제함
                    warn!(
                        %phase,
                        budget_ms = self.timeout.as_millis() as u64,
                        completed = outcome.phases_completed.len(),
                        "inspection timed out"
                    );
                    outcome.status = InspectionStatus::TimedOut;
                    transitions.advance(TxState::TimedOut);
                }
            }
        }

        if let Some(guard) = slot.take() {
            drop(guard);
            transitions.advance(TxState::Completed);
        }

        // 파라미터 이상은 평가를 마친 단계의 것만 포함
        let anomalies = self.param_inspection.inspect(&tx);
        outcome.findings.extend(
            anomalies
                .into_iter()
                .filter(|f| outcome.phases_completed.contains(&f.phase)),
        );
        outcome.findings.sort_by_key(|f| f.phase);

        outcome.truncated = tx.any_truncated();
        if outcome.truncated {
            metrics::counter!(m::INSPECTION_TRUNCATED_BODIES_TOTAL).increment(1);
        }
        self.finish(outcome, started)
    }

    fn finish(&self, mut outcome: InspectionOutcome, started: Instant) -> InspectionOutcome {
        outcome.partial = outcome.status != InspectionStatus::Completed;

        metrics::counter!(
            m::INSPECTION_TRANSACTIONS_TOTAL,
            m::LABEL_STATUS => outcome.status.as_str()
        )
        .increment(1);
        metrics::histogram!(m::INSPECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        for finding in &outcome.findings {
            metrics::counter!(
                m::INSPECTION_FINDINGS_TOTAL,
                m::LABEL_SEVERITY => finding.severity.to_string()
            )
            .increment(1);
        }

        debug!(
            status = %outcome.status,
            findings = outcome.findings.len(),
            anomaly_score = outcome.total_anomaly_score(),
            partial = outcome.partial,
            truncated = outcome.truncated,
            "inspection finished"
        );
        outcome
    }

    /// 종료 유예 시간이 지나 중단된 트랜잭션의 결과
    fn aborted(&self, correlation_id: String) -> InspectionOutcome {
        warn!(correlation_id = %correlation_id, "inspection aborted at shutdown");
        let mut outcome = InspectionOutcome::new(
            correlation_id,
            InspectionStatus::Failed {
                reason: ABORTED_AT_SHUTDOWN.to_owned(),
            },
        );
        outcome.partial = true;
        metrics::counter!(
            m::INSPECTION_TRANSACTIONS_TOTAL,
            m::LABEL_STATUS => outcome.status.as_str()
        )
        .increment(1);
        outcome
    }

    async fn report_fatal(&self, epoch: u64, error: &EngineError) {
        let supervisor = Arc::clone(&self.supervisor);
        let reason = error.to_string();
        if let Err(e) =
            tokio::task::spawn_blocking(move || supervisor.report_fatal(epoch, &reason)).await
        {
            warn!(error = %e, "fatal report task failed");
        }
    }

    fn to_finding(&self, rule_match: RuleMatch, tx: &NormalizedTransaction) -> Finding {
        let match_message = match rule_match.matched_value.as_deref() {
            Some(value) if self.redact_sensitive && !value.is_empty() => {
                rule_match.match_message.replace(value, REDACTED)
            }
            _ => rule_match.match_message,
        };
        Finding {
            rule_id: rule_match.rule_id,
            message: rule_match.message,
            match_message,
            severity: rule_match.severity,
            anomaly_score: rule_match.anomaly_score,
            paranoia_level: rule_match.paranoia_level,
            phase: rule_match.phase,
            matched_field: rule_match.matched_field,
            correlation_id: tx.correlation_id.clone(),
            tags: rule_match.tags,
            truncated: tx.truncated_in(rule_match.phase),
        }
    }
}

/// 검사 스테이지
///
/// # 사용 예시
/// ```ignore
/// use ocinspect_pipeline::{EngineSupervisor, InspectionStageBuilder};
///
/// let (mut stage, records_rx) = InspectionStageBuilder::new()
///     .config(config)
///     .supervisor(supervisor)
///     .build()?;
///
/// stage.start().await?;
/// stage.transaction_sender().send(raw).await?;
/// ```
pub struct InspectionStage<B: EngineBinding> {
    config: PipelineConfig,
    state: StageState,
    inspector: Inspector<B>,
    semaphore: Arc<Semaphore>,
    input_tx: mpsc::Sender<RawTransaction>,
    input_rx: Option<mpsc::Receiver<RawTransaction>>,
    cancel: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
}

impl<B: EngineBinding> InspectionStage<B> {
    /// 현재 상태 이름
    pub fn state_name(&self) -> &str {
        match self.state {
            StageState::Initialized => "initialized",
            StageState::Running => "running",
            StageState::Stopped => "stopped",
        }
    }

    /// 트랜잭션 입력 채널
    pub fn transaction_sender(&self) -> mpsc::Sender<RawTransaction> {
        self.input_tx.clone()
    }

    /// 트랜잭션 검사기
    pub fn inspector(&self) -> &Inspector<B> {
        &self.inspector
    }

    /// 결과 상관기
    pub fn correlator(&self) -> &Arc<FindingCorrelator> {
        &self.inspector.correlator
    }

    /// 엔진 관리자
    pub fn supervisor(&self) -> &Arc<EngineSupervisor<B>> {
        &self.inspector.supervisor
    }

    /// 사용 중인 작업자 수
    pub fn busy_workers(&self) -> usize {
        self.config
            .max_concurrency
            .saturating_sub(self.semaphore.available_permits())
    }
}

impl<B: EngineBinding> Pipeline for InspectionStage<B> {
    async fn start(&mut self) -> Result<(), InspectError> {
        if self.state == StageState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }
        let Some(input_rx) = self.input_rx.take() else {
            return Err(PipelineError::InitFailed(
                "inspection stage input was consumed by a previous run".to_owned(),
            )
            .into());
        };

        info!(
            max_concurrency = self.config.max_concurrency,
            timeout_ms = self.config.timeout_ms,
            "starting inspection stage"
        );

        self.cancel = CancellationToken::new();
        self.sweeper = Some(self.inspector.correlator.spawn_sweeper(self.cancel.clone()));
        self.dispatcher = Some(tokio::spawn(dispatch(
            self.inspector.clone(),
            input_rx,
            Arc::clone(&self.semaphore),
            self.cancel.clone(),
            self.config.drain_grace(),
        )));

        self.state = StageState::Running;
        info!("inspection stage started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), InspectError> {
        if self.state != StageState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        info!("stopping inspection stage");
        self.cancel.cancel();

        // 1. 큐에 남은 트랜잭션까지 처리한 뒤 작업자 종료
        if let Some(dispatcher) = self.dispatcher.take()
            && let Err(e) = dispatcher.await
        {
            warn!(error = %e, "dispatcher task failed");
        }

        // 2. 엔진 컨텍스트 정리와 규칙 집합 해제
        let report = self
            .inspector
            .supervisor
            .shutdown(self.config.drain_grace())
            .await;

        // 3. 보류 중인 스팬 전달
        if let Some(sweeper) = self.sweeper.take()
            && let Err(e) = sweeper.await
        {
            warn!(error = %e, "correlator sweeper task failed");
        }
        if let Err(e) = self.inspector.correlator.flush().await {
            warn!(error = %e, "failed to flush pending spans");
        }

        self.state = StageState::Stopped;
        info!(
            drained = report.drained,
            abandoned = report.abandoned,
            "inspection stage stopped"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            StageState::Running => {
                let engine = self.inspector.supervisor.health();
                if !engine.is_healthy() {
                    return engine;
                }
                if self.semaphore.available_permits() == 0 {
                    HealthStatus::Degraded(format!(
                        "all {} inspection workers busy",
                        self.config.max_concurrency
                    ))
                } else {
                    HealthStatus::Healthy
                }
            }
            StageState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            StageState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

async fn dispatch<B: EngineBinding>(
    inspector: Inspector<B>,
    mut input_rx: mpsc::Receiver<RawTransaction>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    grace: Duration,
) {
    let mut workers = JoinSet::new();
    let abort = CancellationToken::new();

    loop {
        let raw = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                log_worker_exit(joined);
                continue;
            }
            raw = input_rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };
        if !spawn_worker(&mut workers, &inspector, &semaphore, &abort, raw).await {
            break;
        }
    }

    // 이미 큐에 들어온 트랜잭션도 결과를 남김
    input_rx.close();
    let mut queued = 0usize;
    while let Ok(raw) = input_rx.try_recv() {
        queued += 1;
        if !spawn_worker(&mut workers, &inspector, &semaphore, &abort, raw).await {
            break;
        }
    }
    if queued > 0 {
        info!(queued, "inspecting queued transactions before shutdown");
    }

    if timeout(grace, join_all(&mut workers)).await.is_err() {
        // 중단된 작업자도 실패 결과를 상관기에 한 번 전달함
        warn!(
            abandoned = workers.len(),
            "inspection workers still running after drain grace, aborting"
        );
        abort.cancel();
        if timeout(ABORT_SETTLE, join_all(&mut workers)).await.is_err() {
            warn!(
                remaining = workers.len(),
                "inspection workers did not settle, dropping them"
            );
            workers.abort_all();
        }
    }
    debug!("dispatcher stopped");
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        log_worker_exit(joined);
    }
}

async fn spawn_worker<B: EngineBinding>(
    workers: &mut JoinSet<()>,
    inspector: &Inspector<B>,
    semaphore: &Arc<Semaphore>,
    abort: &CancellationToken,
    raw: RawTransaction,
) -> bool {
    let Ok(permit) = Arc::clone(semaphore).acquire_owned().await else {
        warn!("worker semaphore closed");
        return false;
    };
    let inspector = inspector.clone();
    let abort = abort.clone();
    workers.spawn(async move {
        let _permit = permit;
        metrics::gauge!(m::INSPECTION_IN_FLIGHT).increment(1.0);
        let correlation_id = raw.correlation_id().map(str::to_owned);
        // 중단되면 검사 future만 버리고, 결과 전달은 끝까지 수행
        let outcome = tokio::select! {
            biased;
            () = abort.cancelled() => correlation_id.map(|id| inspector.aborted(id)),
            outcome = inspector.inspect(raw) => outcome,
        };
        if let Some(outcome) = outcome
            && let Err(e) = inspector.correlator.attach(outcome).await
        {
            warn!(error = %e, "inspection outcome was not forwarded");
        }
        metrics::gauge!(m::INSPECTION_IN_FLIGHT).decrement(1.0);
    });
    true
}

fn log_worker_exit(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "inspection worker failed");
    }
}

/// 검사 스테이지 빌더
pub struct InspectionStageBuilder<B: EngineBinding> {
    config: PipelineConfig,
    supervisor: Option<Arc<EngineSupervisor<B>>>,
    record_tx: Option<mpsc::Sender<CorrelatedRecord>>,
}

impl<B: EngineBinding> InspectionStageBuilder<B> {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            supervisor: None,
            record_tx: None,
        }
    }

    /// 파이프라인 설정을 지정합니다.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// 엔진 관리자를 지정합니다.
    pub fn supervisor(mut self, supervisor: Arc<EngineSupervisor<B>>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// 외부 하류 레코드 채널을 설정합니다.
    ///
    /// 설정하지 않으면 빌더가 `output_capacity` 크기의 새 채널을 생성합니다.
    pub fn record_sender(mut self, tx: mpsc::Sender<CorrelatedRecord>) -> Self {
        self.record_tx = Some(tx);
        self
    }

    /// 스테이지를 빌드합니다.
    ///
    /// # Returns
    /// - `InspectionStage`: 스테이지 인스턴스
    /// - `Option<mpsc::Receiver<CorrelatedRecord>>`: 하류 레코드 수신 채널
    ///   (외부 record_sender를 설정한 경우 None)
    ///
    /// # Errors
    /// 설정이 유효하지 않거나 엔진 관리자가 없으면 에러를 반환합니다.
    pub fn build(
        self,
    ) -> Result<(InspectionStage<B>, Option<mpsc::Receiver<CorrelatedRecord>>), InspectionPipelineError>
    {
        self.config.validate()?;
        let supervisor = self.supervisor.ok_or_else(|| InspectionPipelineError::Config {
            field: "supervisor".to_owned(),
            reason: "an engine supervisor is required".to_owned(),
        })?;

        let (correlator, record_rx) = match self.record_tx {
            Some(tx) => (
                FindingCorrelator::with_output(
                    self.config.span_hold(),
                    self.config.attached_retention(),
                    tx,
                ),
                None,
            ),
            None => {
                let (correlator, rx) = FindingCorrelator::from_config(&self.config);
                (correlator, Some(rx))
            }
        };

        let header_case = supervisor.binding().info().header_case;
        let inspector = Inspector::new(
            supervisor,
            Arc::new(correlator),
            Normalizer::new(header_case, self.config.max_body_bytes),
            self.config.timeout(),
            self.config.redact_sensitive,
        )
        .with_param_inspection(if self.config.param_inspection {
            ParamInspection::standard()
        } else {
            ParamInspection::disabled()
        });

        let (input_tx, input_rx) = mpsc::channel(self.config.queue_capacity);
        let stage = InspectionStage {
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrency)),
            config: self.config,
            state: StageState::Initialized,
            inspector,
            input_tx,
            input_rx: Some(input_rx),
            cancel: CancellationToken::new(),
            dispatcher: None,
            sweeper: None,
        };
        Ok((stage, record_rx))
    }
}

impl<B: EngineBinding> Default for InspectionStageBuilder<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocinspect_core::error::ConfigError;
    use ocinspect_core::record::{ATTR_PARTIAL, ATTR_STATUS, SpanRecord};
    use ocinspect_engine::{BindingInfo, MergedRules, RuleBundle, SecLangEngine};

    const RULES: &str = r#"
SecRuleEngine On
SecRule ARGS "@contains secret-token" "id:100,phase:2,deny,severity:CRITICAL,msg:'token leak',logdata:'Matched %{MATCHED_VAR}'"
"#;

    fn supervisor() -> Arc<EngineSupervisor<SecLangEngine>> {
        let supervisor = EngineSupervisor::new(SecLangEngine::new().unwrap());
        supervisor
            .load_and_activate(&RuleBundle::inline(RULES), &RuleBundle::empty())
            .unwrap();
        Arc::new(supervisor)
    }

    fn post(id: &str, body: &str) -> RawTransaction {
        RawTransaction::new(id, "POST", "/submit")
            .with_request_header("Content-Type", "application/x-www-form-urlencoded")
            .with_request_body(body)
            .with_response_status(200)
    }

    #[test]
    fn builder_requires_supervisor() {
        let result = InspectionStageBuilder::<SecLangEngine>::new().build();
        assert!(matches!(
            result,
            Err(InspectionPipelineError::Config { ref field, .. }) if field == "supervisor"
        ));
    }

    #[test]
    fn builder_creates_stage() {
        let (stage, rx) = InspectionStageBuilder::new()
            .supervisor(supervisor())
            .build()
            .unwrap();
        assert_eq!(stage.state_name(), "initialized");
        assert!(rx.is_some());
        assert_eq!(stage.busy_workers(), 0);
    }

    #[test]
    fn builder_with_external_sender_returns_no_receiver() {
        let (tx, _rx) = mpsc::channel(4);
        let (_stage, rx) = InspectionStageBuilder::new()
            .supervisor(supervisor())
            .record_sender(tx)
            .build()
            .unwrap();
        assert!(rx.is_none());
    }

    #[test]
    fn builder_rejects_invalid_config() {
        let config = PipelineConfig {
            max_concurrency: 0,
            ..PipelineConfig::default()
        };
        let result = InspectionStageBuilder::new()
            .config(config)
            .supervisor(supervisor())
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn inspect_redacts_matched_value() {
        let (stage, _rx) = InspectionStageBuilder::new()
            .supervisor(supervisor())
            .build()
            .unwrap();
        let outcome = stage
            .inspector()
            .inspect(post("tx-1", "q=secret-token"))
            .await
            .unwrap();
        assert_eq!(outcome.status, InspectionStatus::Completed);
        assert!(!outcome.partial);
        assert_eq!(outcome.phases_completed, Phase::ALL.to_vec());
        let finding = &outcome.findings[0];
        assert_eq!(finding.rule_id, 100);
        assert_eq!(finding.phase, Phase::RequestBody);
        assert!(!finding.match_message.contains("secret-token"));
        assert!(finding.match_message.contains(REDACTED));
    }

    #[tokio::test]
    async fn inspect_without_redaction_keeps_value() {
        let config = PipelineConfig {
            redact_sensitive: false,
            ..PipelineConfig::default()
        };
        let (stage, _rx) = InspectionStageBuilder::new()
            .config(config)
            .supervisor(supervisor())
            .build()
            .unwrap();
        let outcome = stage
            .inspector()
            .inspect(post("tx-2", "q=secret-token"))
            .await
            .unwrap();
        assert!(outcome.findings[0].match_message.contains("secret-token"));
    }

    #[tokio::test]
    async fn param_anomalies_join_engine_findings() {
        let raw = RawTransaction::new("tx-5", "POST", "/login")
            .with_request_header("Content-Type", "application/json")
            .with_request_body(r#"{"user":"secret-token","password":{"$ne":null}}"#)
            .with_response_status(200);

        let (stage, _rx) = InspectionStageBuilder::new()
            .supervisor(supervisor())
            .build()
            .unwrap();
        let outcome = stage.inspector().inspect(raw.clone()).await.unwrap();
        let ids: Vec<u64> = outcome.findings.iter().map(|f| f.rule_id).collect();
        assert_eq!(ids, vec![100, crate::param_inspector::NOSQL_OPERATOR_RULE_ID]);
        assert!(outcome.findings.iter().all(|f| f.phase == Phase::RequestBody));

        let config = PipelineConfig {
            param_inspection: false,
            ..PipelineConfig::default()
        };
        let (stage, _rx) = InspectionStageBuilder::new()
            .config(config)
            .supervisor(supervisor())
            .build()
            .unwrap();
        let outcome = stage.inspector().inspect(raw).await.unwrap();
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.findings[0].rule_id, 100);
    }

    #[tokio::test]
    async fn missing_correlation_id_yields_no_outcome() {
        let (stage, _rx) = InspectionStageBuilder::new()
            .supervisor(supervisor())
            .build()
            .unwrap();
        let mut raw = RawTransaction::new("", "GET", "/");
        raw.correlation_id = None;
        assert!(stage.inspector().inspect(raw).await.is_none());
    }

    #[tokio::test]
    async fn negative_body_length_fails_transaction() {
        let (stage, _rx) = InspectionStageBuilder::new()
            .supervisor(supervisor())
            .build()
            .unwrap();
        let mut raw = post("tx-3", "q=1");
        raw.request_body_length = Some(-5);
        let outcome = stage.inspector().inspect(raw).await.unwrap();
        assert!(matches!(outcome.status, InspectionStatus::Failed { .. }));
        assert!(outcome.partial);
        assert!(outcome.findings.is_empty());
    }

    #[tokio::test]
    async fn inactive_supervisor_fails_transaction() {
        let supervisor = Arc::new(EngineSupervisor::new(SecLangEngine::new().unwrap()));
        let (stage, _rx) = InspectionStageBuilder::new()
            .supervisor(supervisor)
            .build()
            .unwrap();
        let outcome = stage.inspector().inspect(post("tx-4", "q=1")).await.unwrap();
        assert!(matches!(outcome.status, InspectionStatus::Failed { .. }));
        assert!(outcome.rule_set_version.is_none());
    }

    #[tokio::test]
    async fn stage_lifecycle() {
        let (mut stage, _rx) = InspectionStageBuilder::new()
            .supervisor(supervisor())
            .build()
            .unwrap();
        assert!(stage.health_check().await.is_unhealthy());
        stage.start().await.unwrap();
        assert!(stage.start().await.is_err());
        assert!(stage.health_check().await.is_healthy());
        stage.stop().await.unwrap();
        assert_eq!(stage.state_name(), "stopped");
        assert!(stage.stop().await.is_err());
        assert!(stage.start().await.is_err());
    }

    /// 단계마다 지연되는 바인딩
    struct Sluggish(SecLangEngine);

    impl EngineBinding for Sluggish {
        type Compiled = <SecLangEngine as EngineBinding>::Compiled;
        type Context = <SecLangEngine as EngineBinding>::Context;

        fn info(&self) -> BindingInfo {
            self.0.info()
        }

        fn load_rule_set(&self, rules: &MergedRules) -> Result<Self::Compiled, ConfigError> {
            self.0.load_rule_set(rules)
        }

        fn unload_rule_set(&self, compiled: Self::Compiled) {
            self.0.unload_rule_set(compiled);
        }

        fn create_context(
            &self,
            compiled: &Arc<Self::Compiled>,
        ) -> Result<Self::Context, EngineError> {
            self.0.create_context(compiled)
        }

        fn evaluate_phase(
            &self,
            context: &mut Self::Context,
            phase: Phase,
            tx: &NormalizedTransaction,
        ) -> Result<Vec<RuleMatch>, EngineError> {
            std::thread::sleep(Duration::from_millis(300));
            self.0.evaluate_phase(context, phase, tx)
        }

        fn release_context(&self, context: Self::Context) {
            self.0.release_context(context);
        }
    }

    #[tokio::test]
    async fn workers_past_drain_grace_report_failure() {
        let supervisor = EngineSupervisor::new(Sluggish(SecLangEngine::new().unwrap()));
        supervisor
            .load_and_activate(&RuleBundle::inline(RULES), &RuleBundle::empty())
            .unwrap();
        let config = PipelineConfig {
            timeout_ms: 5_000,
            span_hold_ms: 10_000,
            ..PipelineConfig::default()
        };
        let (stage, rx) = InspectionStageBuilder::new()
            .config(config)
            .supervisor(Arc::new(supervisor))
            .build()
            .unwrap();
        let mut rx = rx.unwrap();
        stage
            .correlator()
            .register_span(SpanRecord::new("held"))
            .await
            .unwrap();

        let (input_tx, input_rx) = mpsc::channel(4);
        input_tx.send(post("held", "q=1")).await.unwrap();
        input_tx.send(post("unheld", "q=1")).await.unwrap();
        drop(input_tx);
        let cancel = CancellationToken::new();
        cancel.cancel();

        dispatch(
            stage.inspector().clone(),
            input_rx,
            Arc::new(Semaphore::new(4)),
            cancel,
            Duration::from_millis(20),
        )
        .await;

        let mut seen = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                CorrelatedRecord::EnrichedSpan(span) => {
                    assert_eq!(span.correlation_id, "held");
                    assert_eq!(span.attributes[ATTR_STATUS], "failed");
                    assert_eq!(span.attributes[ATTR_PARTIAL], "true");
                    seen.push(span.correlation_id);
                }
                CorrelatedRecord::Standalone(record) => {
                    assert_eq!(record.correlation_id, "unheld");
                    assert_eq!(
                        record.outcome.status,
                        InspectionStatus::Failed {
                            reason: ABORTED_AT_SHUTDOWN.to_owned()
                        }
                    );
                    seen.push(record.correlation_id);
                }
                other => panic!("unexpected record: {other:?}"),
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["held", "unheld"]);
    }

    #[test]
    fn tx_state_terminal() {
        assert!(TxState::Completed.is_terminal());
        assert!(TxState::TimedOut.is_terminal());
        assert!(!TxState::Evaluating(Phase::RequestBody).is_terminal());
        assert_eq!(TxState::Evaluating(Phase::RequestBody).to_string(), "evaluating(request-body)");
    }
}
