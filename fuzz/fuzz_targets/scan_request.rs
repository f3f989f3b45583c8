#![no_main]

use libfuzzer_sys::fuzz_target;
use yarasweep_core::types::{ScanRequest, ScanSelector};

fuzz_target!(|data: &[u8]| {
    // 서버가 받는 요청 라인
    if let Ok(request) = serde_json::from_slice::<ScanRequest>(data) {
        let _ = request.kind();
        let _ = request.to_string();
    }

    // CLI 선택자 검증은 어떤 입력에서도 패닉 없이 Ok/Err
    if let Ok(selector) = serde_json::from_slice::<ScanSelector>(data) {
        let _ = selector.to_request();
    }
});
