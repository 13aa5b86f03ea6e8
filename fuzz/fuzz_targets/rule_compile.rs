#![no_main]

use libfuzzer_sys::fuzz_target;
use ocinspect_engine::{EngineBinding, RuleBundle, RuleSetLoader, SecLangEngine};

// 병합 검증을 통과한 번들은 컴파일까지 진행
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(merged) = RuleSetLoader::merge(&RuleBundle::inline(text), &RuleBundle::empty()) else {
        return;
    };
    if let Ok(engine) = SecLangEngine::new() {
        let _ = engine.load_rule_set(&merged);
    }
});
