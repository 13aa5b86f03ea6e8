//! 엔진 수명 관리자 -- 공유 엔진 핸들, 규칙 집합 교체, 장애 격리
//!
//! [`EngineSupervisor`]는 현재 엔진 핸들과 활성 규칙 집합을 소유합니다.
//!
//! # 규칙 집합 교체
//! 활성 규칙 집합은 `ArcSwapOption`으로 보관합니다. [`activate`](EngineSupervisor::activate)는
//! 포인터만 바꾸므로 평가 중인 트랜잭션을 멈추지 않습니다. 각 [`ContextGuard`]가
//! 생성 시점의 규칙 집합 `Arc`를 붙잡고 있으므로, 이전 규칙 집합은 마지막
//! 컨텍스트가 해제될 때 해제됩니다.
//!
//! # 장애 처리
//! 바인딩 호출 중 panic 또는 `EngineError::Fatal`이 발생하면 현재 핸들의 세대(epoch)를
//! 폐기합니다. 폐기된 세대의 컨텍스트는 다음 호출에서 실패합니다. 바인딩 생성기가
//! 있으면 새 바인딩으로 활성 규칙을 다시 컴파일하여 한 번 재초기화하고,
//! 실패하면 건강 상태 채널로 `Unhealthy`를 알립니다.
//!
//! # 종료
//! [`shutdown`](EngineSupervisor::shutdown)은 새 컨텍스트를 거부하고, 진행 중인
//! 컨텍스트를 유예 시간까지 기다린 뒤 규칙 집합을 해제합니다.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use ocinspect_core::error::{ConfigError, EngineError};
use ocinspect_core::metrics as m;
use ocinspect_core::pipeline::HealthStatus;
use ocinspect_core::transaction::NormalizedTransaction;
use ocinspect_core::types::Phase;
use ocinspect_engine::{BindingFactory, EngineBinding, RuleBundle, RuleMatch, RuleSet, RuleSetLoader};

/// 컨텍스트 획득 재시도 횟수 (재초기화와 겹칠 때)
const ACQUIRE_ATTEMPTS: usize = 3;

/// 한 세대의 엔진 핸들
pub struct EngineHandle<B: EngineBinding> {
    binding: Arc<B>,
    epoch: u64,
    poisoned: AtomicBool,
    reinit_attempted: AtomicBool,
}

impl<B: EngineBinding> EngineHandle<B> {
    fn new(binding: Arc<B>, epoch: u64) -> Self {
        Self {
            binding,
            epoch,
            poisoned: AtomicBool::new(false),
            reinit_attempted: AtomicBool::new(false),
        }
    }

    /// 핸들 세대
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// 바인딩
    pub fn binding(&self) -> &Arc<B> {
        &self.binding
    }

    /// 폐기 여부
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }
}

/// 진행 중 컨텍스트 수 추적
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightToken {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightToken {
            tracker: Arc::clone(self),
        }
    }

    fn current(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.current() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct InFlightToken {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// 트랜잭션 하나의 평가 컨텍스트 소유자
///
/// `Send`이지만 `Clone`/`Sync`가 아니므로 태스크 경계를 이동(move)으로만 넘습니다.
/// `Drop`에서 바인딩의 `release_context`를 정확히 한 번 호출한 뒤 규칙 집합 참조를
/// 놓습니다.
pub struct ContextGuard<B: EngineBinding> {
    context: Option<B::Context>,
    handle: Arc<EngineHandle<B>>,
    rule_set: Arc<RuleSet<B>>,
    next_phase: Option<Phase>,
    _in_flight: InFlightToken,
    _not_sync: PhantomData<Cell<()>>,
}

impl<B: EngineBinding> ContextGuard<B> {
    /// 컨텍스트가 묶인 규칙 집합
    pub fn rule_set(&self) -> &Arc<RuleSet<B>> {
        &self.rule_set
    }

    /// 컨텍스트를 만든 핸들 세대
    pub fn epoch(&self) -> u64 {
        self.handle.epoch
    }

    /// 다음에 평가할 단계
    pub fn next_phase(&self) -> Option<Phase> {
        self.next_phase
    }

    /// 한 단계를 평가합니다. 블로킹 호출이므로 blocking 풀에서 실행해야 합니다.
    ///
    /// # Errors
    /// - 핸들 세대가 폐기되었으면 `EngineError::Unavailable`
    /// - 순서를 벗어나거나 반복된 단계면 `EngineError::PhaseOrder` (바인딩은 호출되지 않음)
    /// - 바인딩 호출 중 panic이 발생하면 `EngineError::Fatal`
    /// - 그 외 바인딩이 반환한 에러
    pub fn evaluate_phase(
        &mut self,
        phase: Phase,
        tx: &NormalizedTransaction,
    ) -> Result<Vec<RuleMatch>, EngineError> {
        if self.handle.is_poisoned() {
            return Err(EngineError::Unavailable(format!(
                "engine handle epoch {} was abandoned",
                self.handle.epoch
            )));
        }
        let context = self
            .context
            .as_mut()
            .ok_or_else(|| EngineError::Unavailable("context already released".to_owned()))?;
        if self.next_phase != Some(phase) {
            return Err(EngineError::PhaseOrder {
                expected: self.next_phase,
                got: phase,
            });
        }

        let binding = Arc::clone(self.rule_set.binding());
        let result = catch_unwind(AssertUnwindSafe(|| {
            binding.evaluate_phase(context, phase, tx)
        }))
        .unwrap_or_else(|panic| {
            Err(EngineError::Fatal(format!(
                "engine panicked in {phase}: {}",
                panic_message(panic.as_ref())
            )))
        });

        if result.is_ok() {
            self.next_phase = phase.next();
        }
        result
    }
}

impl<B: EngineBinding> Drop for ContextGuard<B> {
    fn drop(&mut self) {
        let Some(context) = self.context.take() else {
            return;
        };
        let binding = self.rule_set.binding();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| binding.release_context(context))) {
            // 해제 중 panic은 핸들을 오염시킨 것으로 간주
            error!(
                epoch = self.handle.epoch,
                reason = %panic_message(panic.as_ref()),
                "engine panicked while releasing context"
            );
            self.handle.poison();
        }
    }
}

impl<B: EngineBinding> fmt::Debug for ContextGuard<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("epoch", &self.handle.epoch)
            .field("rule_set", &self.rule_set.version())
            .field("next_phase", &self.next_phase)
            .finish()
    }
}

/// 종료 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// 유예 시간 안에 모든 컨텍스트가 해제되었는지 여부
    pub drained: bool,
    /// 유예 시간이 지난 뒤에도 남아 있던 컨텍스트 수
    pub abandoned: usize,
}

/// 엔진 수명 관리자
pub struct EngineSupervisor<B: EngineBinding> {
    handle: ArcSwap<EngineHandle<B>>,
    current: ArcSwapOption<RuleSet<B>>,
    factory: Option<Box<dyn BindingFactory<B>>>,
    accepting: AtomicBool,
    in_flight: Arc<InFlight>,
    generation: AtomicU64,
    reinit_lock: Mutex<()>,
    health: watch::Sender<HealthStatus>,
}

impl<B: EngineBinding> EngineSupervisor<B> {
    /// 바인딩 하나로 관리자를 생성합니다. 치명적 에러 후 재초기화하지 않습니다.
    pub fn new(binding: B) -> Self {
        let (health, _) = watch::channel(HealthStatus::Degraded("no rule set activated".to_owned()));
        Self {
            handle: ArcSwap::from_pointee(EngineHandle::new(Arc::new(binding), 0)),
            current: ArcSwapOption::empty(),
            factory: None,
            accepting: AtomicBool::new(true),
            in_flight: Arc::new(InFlight::default()),
            generation: AtomicU64::new(0),
            reinit_lock: Mutex::new(()),
            health,
        }
    }

    /// 바인딩 생성기로 관리자를 생성합니다. 첫 바인딩도 생성기로 만듭니다.
    ///
    /// # Errors
    /// 첫 바인딩 생성에 실패하면 에러를 반환합니다.
    pub fn with_factory(factory: impl BindingFactory<B>) -> Result<Self, EngineError> {
        let binding = factory.create()?;
        let mut supervisor = Self::new(binding);
        supervisor.factory = Some(Box::new(factory));
        Ok(supervisor)
    }

    /// 현재 핸들
    pub fn handle(&self) -> Arc<EngineHandle<B>> {
        self.handle.load_full()
    }

    /// 현재 바인딩
    pub fn binding(&self) -> Arc<B> {
        Arc::clone(&self.handle.load().binding)
    }

    /// 활성 규칙 집합
    pub fn current_rule_set(&self) -> Option<Arc<RuleSet<B>>> {
        self.current.load_full()
    }

    /// 진행 중 컨텍스트 수
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    /// 새 컨텍스트를 받는지 여부
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// 현재 건강 상태
    pub fn health(&self) -> HealthStatus {
        self.health.borrow().clone()
    }

    /// 건강 상태 변경 구독
    pub fn subscribe_health(&self) -> watch::Receiver<HealthStatus> {
        self.health.subscribe()
    }

    /// 규칙 집합을 활성화합니다.
    ///
    /// 규칙 집합이 현재 핸들과 다른 바인딩으로 컴파일되었으면 현재 바인딩으로 다시
    /// 컴파일합니다. 진행 중인 트랜잭션은 자신이 시작한 규칙 집합으로 끝까지 평가됩니다.
    ///
    /// # Errors
    /// - 종료 중이면 `EngineError::ShuttingDown` (`ConfigError`가 아님)
    /// - 재컴파일에 실패하면 `ConfigError`
    pub fn activate(&self, rule_set: RuleSet<B>) -> Result<Arc<RuleSet<B>>, ActivationError> {
        if !self.is_accepting() {
            return Err(ActivationError::Engine(EngineError::ShuttingDown));
        }

        let binding = self.binding();
        let rule_set = if Arc::ptr_eq(rule_set.binding(), &binding) {
            rule_set
        } else {
            rule_set.recompile(binding)?
        };

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let rule_set = Arc::new(rule_set.with_generation(generation));
        let previous = self.current.swap(Some(Arc::clone(&rule_set)));

        metrics::gauge!(m::RULES_ACTIVE).set(rule_set.rule_count() as f64);
        metrics::counter!(m::RULES_ACTIVATIONS_TOTAL).increment(1);
        info!(
            version = %rule_set.version(),
            rules = rule_set.rule_count(),
            previous = %previous.as_ref().map(|p| p.version()).unwrap_or_default(),
            "rule set activated"
        );

        if !self.handle.load().is_poisoned() {
            self.health.send_replace(HealthStatus::Healthy);
        }
        Ok(rule_set)
    }

    /// 번들을 읽어 규칙 집합을 만들고 활성화합니다.
    ///
    /// 번들이 거부되면 위반 사항을 모두 로그로 남기고 이전 규칙 집합을 유지합니다.
    ///
    /// # Errors
    /// 병합/컴파일 실패 시 `ConfigError`, 종료 중이면 `EngineError`를 반환합니다.
    pub fn load_and_activate(
        &self,
        base: &RuleBundle,
        overrides: &RuleBundle,
    ) -> Result<Arc<RuleSet<B>>, ActivationError> {
        let binding = self.binding();
        match RuleSetLoader::load(&binding, base, overrides) {
            Ok(rule_set) => self.activate(rule_set),
            Err(e) => {
                for violation in e.violations() {
                    warn!(%violation, "rule bundle violation");
                }
                warn!(
                    error = %e,
                    active = %self
                        .current_rule_set()
                        .map(|r| r.version())
                        .unwrap_or_default(),
                    "rule set rejected, keeping active rule set"
                );
                Err(e.into())
            }
        }
    }

    /// 활성 규칙 집합에 묶인 평가 컨텍스트를 획득합니다. 블로킹 호출입니다.
    ///
    /// # Errors
    /// - 종료 중이면 `EngineError::ShuttingDown`
    /// - 활성 규칙 집합이 없거나 핸들이 복구 불가능하면 `EngineError::Unavailable`
    /// - 바인딩의 컨텍스트 생성 에러
    pub fn acquire(&self) -> Result<ContextGuard<B>, EngineError> {
        if !self.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }
        let token = self.in_flight.enter();
        // enter 이후 다시 확인해야 shutdown 대기와 경쟁하지 않음
        if !self.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }

        for _ in 0..ACQUIRE_ATTEMPTS {
            let handle = self.handle.load_full();
            if handle.is_poisoned() {
                self.report_fatal(handle.epoch, "handle poisoned by a previous call");
                let replaced = self.handle.load();
                if replaced.epoch == handle.epoch {
                    return Err(EngineError::Unavailable(
                        "engine handle could not be reinitialized".to_owned(),
                    ));
                }
                continue;
            }

            let rule_set = self
                .current
                .load_full()
                .ok_or_else(|| EngineError::Unavailable("no active rule set".to_owned()))?;
            if !Arc::ptr_eq(rule_set.binding(), &handle.binding) {
                // 재초기화 중: 핸들과 규칙 집합이 아직 맞춰지지 않음
                continue;
            }

            let context = catch_unwind(AssertUnwindSafe(|| rule_set.create_context()))
                .unwrap_or_else(|panic| {
                    Err(EngineError::Fatal(format!(
                        "engine panicked while creating context: {}",
                        panic_message(panic.as_ref())
                    )))
                });
            return match context {
                Ok(context) => Ok(ContextGuard {
                    context: Some(context),
                    handle,
                    rule_set,
                    next_phase: Some(Phase::RequestHeaders),
                    _in_flight: token,
                    _not_sync: PhantomData,
                }),
                Err(e) => {
                    if e.is_fatal() {
                        self.report_fatal(handle.epoch, &e.to_string());
                    }
                    Err(e)
                }
            };
        }

        Err(EngineError::Unavailable(
            "engine handle is being reinitialized".to_owned(),
        ))
    }

    /// 핸들 세대의 치명적 에러를 보고합니다.
    ///
    /// 이미 교체된 세대의 보고는 무시됩니다. 세대마다 재초기화는 한 번만 시도합니다.
    pub fn report_fatal(&self, epoch: u64, reason: &str) {
        let handle = self.handle.load_full();
        if handle.epoch != epoch {
            debug!(epoch, current = handle.epoch, "ignoring fatal report for stale epoch");
            return;
        }
        handle.poison();
        if handle.reinit_attempted.swap(true, Ordering::AcqRel) {
            return;
        }

        metrics::counter!(m::ENGINE_FATAL_TOTAL).increment(1);
        error!(epoch, reason, "engine handle failed, abandoning epoch");

        let _lock = self
            .reinit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.reinitialize(&handle);
    }

    fn reinitialize(&self, failed: &EngineHandle<B>) {
        let Some(factory) = &self.factory else {
            self.escalate("engine failed and no binding factory is configured");
            return;
        };

        let binding = match catch_unwind(AssertUnwindSafe(|| factory.create())) {
            Ok(Ok(binding)) => Arc::new(binding),
            Ok(Err(e)) => {
                metrics::counter!(m::ENGINE_REINIT_TOTAL, m::LABEL_RESULT => "failure").increment(1);
                self.escalate(&format!("engine reinitialization failed: {e}"));
                return;
            }
            Err(panic) => {
                metrics::counter!(m::ENGINE_REINIT_TOTAL, m::LABEL_RESULT => "failure").increment(1);
                self.escalate(&format!(
                    "engine reinitialization panicked: {}",
                    panic_message(panic.as_ref())
                ));
                return;
            }
        };

        if let Some(active) = self.current.load_full() {
            match active.recompile(Arc::clone(&binding)) {
                Ok(recompiled) => {
                    self.current.store(Some(Arc::new(recompiled)));
                }
                Err(e) => {
                    metrics::counter!(m::ENGINE_REINIT_TOTAL, m::LABEL_RESULT => "failure")
                        .increment(1);
                    self.escalate(&format!("active rules rejected by new engine: {e}"));
                    return;
                }
            }
        }

        let epoch = failed.epoch + 1;
        self.handle.store(Arc::new(EngineHandle::new(binding, epoch)));
        metrics::counter!(m::ENGINE_REINIT_TOTAL, m::LABEL_RESULT => "success").increment(1);
        warn!(epoch, "engine reinitialized after fatal error");
        self.health.send_replace(HealthStatus::Healthy);
    }

    fn escalate(&self, reason: &str) {
        error!(reason, "engine supervisor is unhealthy");
        self.health
            .send_replace(HealthStatus::Unhealthy(reason.to_owned()));
    }

    /// 새 컨텍스트를 거부하고 진행 중인 컨텍스트를 `grace`까지 기다린 뒤 규칙 집합을 해제합니다.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.accepting.store(false, Ordering::Release);
        info!(in_flight = self.in_flight(), "engine supervisor draining");

        let drained = tokio::time::timeout(grace, self.in_flight.wait_idle())
            .await
            .is_ok();
        let abandoned = self.in_flight();
        if !drained {
            warn!(
                abandoned,
                grace_secs = grace.as_secs_f64(),
                "drain grace expired, rule sets unload when remaining contexts are released"
            );
        }

        if let Some(previous) = self.current.swap(None) {
            debug!(version = %previous.version(), "releasing active rule set");
        }
        metrics::gauge!(m::RULES_ACTIVE).set(0.0);
        self.health
            .send_replace(HealthStatus::Unhealthy("engine supervisor shut down".to_owned()));
        info!(drained, "engine supervisor stopped");

        ShutdownReport { drained, abandoned }
    }
}

impl<B: EngineBinding> fmt::Debug for EngineSupervisor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSupervisor")
            .field("epoch", &self.handle.load().epoch)
            .field(
                "rule_set",
                &self.current.load().as_ref().map(|r| r.version()),
            )
            .field("in_flight", &self.in_flight())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

/// 규칙 집합 활성화 에러
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    /// 규칙 번들 거부
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// 엔진 상태 에러
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<ActivationError> for crate::error::InspectionPipelineError {
    fn from(err: ActivationError) -> Self {
        match err {
            ActivationError::Config(e) => Self::RuleSet(e),
            ActivationError::Engine(e) => Self::Engine(e),
        }
    }
}

/// panic 페이로드에서 메시지를 꺼냅니다.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocinspect_engine::SecLangEngine;

    const RULES: &str = "SecRule REQUEST_METHOD \"@streq POST\" \"id:1,phase:1,msg:'post'\"";

    fn supervisor() -> EngineSupervisor<SecLangEngine> {
        EngineSupervisor::new(SecLangEngine::new().unwrap())
    }

    #[test]
    fn acquire_without_rule_set_is_unavailable() {
        let sup = supervisor();
        assert!(matches!(sup.acquire(), Err(EngineError::Unavailable(_))));
        assert_eq!(sup.in_flight(), 0);
        assert!(!sup.health().is_healthy());
    }

    #[test]
    fn activation_assigns_increasing_generations() {
        let sup = supervisor();
        let v1 = sup
            .load_and_activate(&RuleBundle::inline(RULES), &RuleBundle::empty())
            .unwrap();
        let v2 = sup
            .load_and_activate(&RuleBundle::inline(RULES), &RuleBundle::empty())
            .unwrap();
        assert_eq!(v1.generation(), 1);
        assert_eq!(v2.generation(), 2);
        assert!(v2.version().ends_with("#2"));
        assert!(sup.health().is_healthy());
    }

    #[test]
    fn rejected_bundle_keeps_active_rule_set() {
        let sup = supervisor();
        sup.load_and_activate(&RuleBundle::inline(RULES), &RuleBundle::empty())
            .unwrap();
        let err = sup
            .load_and_activate(
                &RuleBundle::inline(format!("{RULES}\n{RULES}")),
                &RuleBundle::empty(),
            )
            .unwrap_err();
        assert!(matches!(err, ActivationError::Config(_)));
        assert_eq!(sup.current_rule_set().unwrap().generation(), 1);
    }

    #[test]
    fn context_guard_tracks_in_flight() {
        let sup = supervisor();
        sup.load_and_activate(&RuleBundle::inline(RULES), &RuleBundle::empty())
            .unwrap();
        let guard = sup.acquire().unwrap();
        assert_eq!(sup.in_flight(), 1);
        assert_eq!(guard.next_phase(), Some(Phase::RequestHeaders));
        drop(guard);
        assert_eq!(sup.in_flight(), 0);
        assert_eq!(sup.binding().live_contexts(), 0);
    }

    #[test]
    fn context_guard_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<ContextGuard<SecLangEngine>>();
    }

    #[tokio::test]
    async fn shutdown_rejects_new_contexts() {
        let sup = supervisor();
        sup.load_and_activate(&RuleBundle::inline(RULES), &RuleBundle::empty())
            .unwrap();
        let report = sup.shutdown(Duration::from_millis(50)).await;
        assert!(report.drained);
        assert!(matches!(sup.acquire(), Err(EngineError::ShuttingDown)));
        assert!(sup.current_rule_set().is_none());
        assert!(sup.health().is_unhealthy());
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_contexts() {
        let sup = Arc::new(supervisor());
        sup.load_and_activate(&RuleBundle::inline(RULES), &RuleBundle::empty())
            .unwrap();
        let guard = sup.acquire().unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        let report = sup.shutdown(Duration::from_secs(5)).await;
        releaser.await.unwrap();
        assert!(report.drained);
        assert_eq!(report.abandoned, 0);
    }

    #[tokio::test]
    async fn shutdown_reports_abandoned_contexts_after_grace() {
        let sup = supervisor();
        sup.load_and_activate(&RuleBundle::inline(RULES), &RuleBundle::empty())
            .unwrap();
        let guard = sup.acquire().unwrap();
        let report = sup.shutdown(Duration::from_millis(10)).await;
        assert!(!report.drained);
        assert_eq!(report.abandoned, 1);
        drop(guard);
        assert_eq!(sup.in_flight(), 0);
    }

    #[test]
    fn panic_message_extracts_payload() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
