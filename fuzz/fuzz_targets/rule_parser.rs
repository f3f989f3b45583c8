#![no_main]

use libfuzzer_sys::fuzz_target;
use yarasweep_scanner::engine::{CompiledRules, parse_rules, parse_rules_recovering};

fuzz_target!(|data: &[u8]| {
    // 규칙 파서는 &str을 받으므로 UTF-8 변환 필요
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(parsed) = parse_rules(source) {
        // 파싱된 규칙은 컴파일 실패해도 크래시는 안 됨
        let _ = CompiledRules::compile(&parsed);
    }
    // 오류 규칙 건너뛰기는 항상 종료되어야 함
    if let Ok((parsed, _)) = parse_rules_recovering(source) {
        let _ = CompiledRules::compile_each(&parsed);
    }
});
