//! 테스트용 스크립트 바인딩 -- 단계별 장애 주입과 호출 횟수 추적

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use semver::Version;

use ocinspect_core::error::{ConfigError, EngineError};
use ocinspect_core::transaction::{NormalizedTransaction, RawTransaction};
use ocinspect_core::types::{HeaderCase, Phase, Severity};
use ocinspect_engine::{BindingInfo, EngineBinding, MergedRules, RuleMatch};

/// 예제 규칙 번들 디렉토리
pub fn sample_rules(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../engine/rules")
        .join(name)
}

/// 단계에 주입할 동작
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// 평가 에러 (복구 가능)
    Error,
    /// 치명적 에러
    Fatal,
    /// 바인딩 panic
    Panic,
    /// 지정 시간 동안 블로킹 후 정상 반환
    Hang(Duration),
}

/// 바인딩 호출 횟수
#[derive(Debug, Default)]
pub struct Counters {
    pub created: AtomicUsize,
    pub released: AtomicUsize,
    pub loaded: AtomicUsize,
    pub unloaded: AtomicUsize,
    pub order_violations: AtomicUsize,
}

impl Counters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn loaded(&self) -> usize {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn unloaded(&self) -> usize {
        self.unloaded.load(Ordering::SeqCst)
    }

    pub fn order_violations(&self) -> usize {
        self.order_violations.load(Ordering::SeqCst)
    }
}

/// 컴파일된 스크립트 규칙
#[derive(Debug)]
pub struct ScriptedRules {
    pub label: String,
    pub rule_ids: Vec<u64>,
}

/// 스크립트 컨텍스트
#[derive(Debug)]
pub struct ScriptedContext {
    pub id: u64,
    rules: Arc<ScriptedRules>,
    next: Option<Phase>,
}

/// 단계별 장애를 주입할 수 있는 바인딩
///
/// 장애가 없으면 단계마다 규칙 ID `1000 + 단계 번호`의 일치를 하나 보고합니다.
/// 일치 메시지는 컨텍스트가 묶인 규칙 집합 레이블입니다.
#[derive(Debug)]
pub struct ScriptedBinding {
    counters: Arc<Counters>,
    faults: Mutex<HashMap<(String, Phase), Fault>>,
    fail_create: AtomicBool,
    check_order: bool,
    next_context: AtomicU64,
    evaluated: Mutex<Vec<(u64, Phase)>>,
}

impl ScriptedBinding {
    pub fn new() -> Self {
        Self::with_counters(Arc::new(Counters::default()))
    }

    pub fn with_counters(counters: Arc<Counters>) -> Self {
        Self {
            counters,
            faults: Mutex::new(HashMap::new()),
            fail_create: AtomicBool::new(false),
            check_order: true,
            next_context: AtomicU64::new(1),
            evaluated: Mutex::new(Vec::new()),
        }
    }

    /// 단계 순서를 스스로 검사하지 않는 바인딩 (네이티브 래퍼처럼 동작)
    pub fn without_order_check() -> Self {
        Self {
            check_order: false,
            ..Self::new()
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// 상관 ID와 단계에 장애를 주입합니다.
    pub fn inject(&self, correlation_id: &str, phase: Phase, fault: Fault) {
        self.faults
            .lock()
            .unwrap()
            .insert((correlation_id.to_owned(), phase), fault);
    }

    pub fn fail_context_creation(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// 컨텍스트별 평가 순서 기록
    pub fn evaluated(&self) -> Vec<(u64, Phase)> {
        self.evaluated.lock().unwrap().clone()
    }
}

impl Default for ScriptedBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBinding for ScriptedBinding {
    type Compiled = ScriptedRules;
    type Context = ScriptedContext;

    fn info(&self) -> BindingInfo {
        BindingInfo {
            name: "scripted".to_owned(),
            version: Version::new(1, 0, 0),
            header_case: HeaderCase::Lower,
        }
    }

    fn load_rule_set(&self, rules: &MergedRules) -> Result<ScriptedRules, ConfigError> {
        self.counters.loaded.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedRules {
            label: rules.version_label(),
            rule_ids: rules.rule_ids(),
        })
    }

    fn unload_rule_set(&self, _compiled: ScriptedRules) {
        self.counters.unloaded.fetch_add(1, Ordering::SeqCst);
    }

    fn create_context(&self, compiled: &Arc<ScriptedRules>) -> Result<ScriptedContext, EngineError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::ResourceExhausted("scripted".to_owned()));
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedContext {
            id: self.next_context.fetch_add(1, Ordering::SeqCst),
            rules: Arc::clone(compiled),
            next: Some(Phase::RequestHeaders),
        })
    }

    fn evaluate_phase(
        &self,
        context: &mut ScriptedContext,
        phase: Phase,
        tx: &NormalizedTransaction,
    ) -> Result<Vec<RuleMatch>, EngineError> {
        if self.check_order && context.next != Some(phase) {
            self.counters.order_violations.fetch_add(1, Ordering::SeqCst);
            return Err(EngineError::PhaseOrder {
                expected: context.next,
                got: phase,
            });
        }
        self.evaluated.lock().unwrap().push((context.id, phase));

        let fault = self
            .faults
            .lock()
            .unwrap()
            .get(&(tx.correlation_id.clone(), phase))
            .copied();
        match fault {
            Some(Fault::Error) => {
                return Err(EngineError::Evaluation {
                    phase,
                    reason: "scripted failure".to_owned(),
                });
            }
            Some(Fault::Fatal) => return Err(EngineError::Fatal("scripted fatal".to_owned())),
            Some(Fault::Panic) => panic!("scripted panic in {phase}"),
            Some(Fault::Hang(duration)) => std::thread::sleep(duration),
            None => {}
        }

        context.next = phase.next();
        Ok(vec![RuleMatch {
            rule_id: 1000 + u64::from(phase.number()),
            message: context.rules.label.clone(),
            match_message: String::new(),
            severity: Severity::Medium,
            anomaly_score: Severity::Medium.anomaly_score(),
            paranoia_level: 1,
            matched_field: None,
            matched_value: None,
            tags: Vec::new(),
            phase,
        }])
    }

    fn release_context(&self, _context: ScriptedContext) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// 최소 GET 트랜잭션
pub fn get(correlation_id: &str) -> RawTransaction {
    RawTransaction::new(correlation_id, "GET", "/health")
        .with_request_header("Host", "api.example.com")
        .with_response_status(200)
}
