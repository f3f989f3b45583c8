#![no_main]

use libfuzzer_sys::fuzz_target;
use yarasweep_rule_updater::VersionListing;

fuzz_target!(|data: &[u8]| {
    if let Ok(listing) = VersionListing::parse(data) {
        // 0번 항목 접근이 항상 안전해야 함
        let _ = listing.latest();
    }
});
