//! 규칙 업데이터 통합 테스트
//!
//! - 첫 실행 설치 / 동일 목록 반복 시 무동작
//! - 체크섬 변경 시 정확히 한 번 다운로드
//! - 빈 목록 무동작
//! - 손상된 아카이브 / 체크섬 불일치 / 컴파일 불가 규칙 시 이전 규칙 및 상태 유지
//! - 중단된 설치 복구
//! - 스케줄러 즉시 실행, 에러 내성, 취소

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use yarasweep_core::error::UpdateError;
use yarasweep_scanner::CompileOptions;
use yarasweep_rule_updater::{
    ArtifactState, ArtifactStore, HttpListingFetcher, ListingFetcher, RuleSetVersion, RuleUpdater,
    RuleUpdaterError, UpdateOutcome, UpdateScheduler, VersionListing,
};

// =============================================================================
// 테스트 헬퍼
// =============================================================================

fn build_tar(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, data.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Default)]
struct MockState {
    versions: Vec<RuleSetVersion>,
    archive: Vec<u8>,
    fail_listing: bool,
}

/// 호출 횟수를 세는 mock fetcher
#[derive(Clone, Default)]
struct MockFetcher {
    state: Arc<Mutex<MockState>>,
    listing_calls: Arc<AtomicUsize>,
    archive_calls: Arc<AtomicUsize>,
}

impl MockFetcher {
    fn publish(&self, version: &str, archive: Vec<u8>) -> String {
        let checksum = sha256_hex(&archive);
        let mut state = self.state.lock().unwrap();
        state.versions = vec![RuleSetVersion {
            version: version.to_owned(),
            checksum: checksum.clone(),
            url: format!("https://rules.example.com/{version}/rules.tar"),
        }];
        state.archive = archive;
        checksum
    }

    fn publish_raw(&self, checksum: &str, archive: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.versions = vec![RuleSetVersion {
            version: "raw".to_owned(),
            checksum: checksum.to_owned(),
            url: "https://rules.example.com/raw/rules.tar".to_owned(),
        }];
        state.archive = archive;
    }

    fn fail_listing(&self) {
        self.state.lock().unwrap().fail_listing = true;
    }

    fn archive_calls(&self) -> usize {
        self.archive_calls.load(Ordering::SeqCst)
    }

    fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }
}

impl ListingFetcher for MockFetcher {
    async fn fetch_listing(
        &self,
        url: &str,
        _dest_dir: &Path,
    ) -> Result<VersionListing, RuleUpdaterError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if state.fail_listing {
            return Err(RuleUpdaterError::Listing {
                url: url.to_owned(),
                reason: "mock failure".to_owned(),
            });
        }
        Ok(VersionListing::new(state.versions.clone()))
    }

    async fn fetch_archive(&self, _url: &str, dest_dir: &Path) -> Result<PathBuf, RuleUpdaterError> {
        self.archive_calls.fetch_add(1, Ordering::SeqCst);
        let archive = self.state.lock().unwrap().archive.clone();
        let dest = dest_dir.join("rules.tar");
        tokio::fs::write(&dest, archive).await.unwrap();
        Ok(dest)
    }
}

fn rules_v1() -> Vec<u8> {
    build_tar(&[(
        "malware/v1.yar",
        "rule v1 { strings: $a = \"EVIL\" condition: $a }",
    )])
}

fn rules_v2() -> Vec<u8> {
    build_tar(&[(
        "malware/v2.yar",
        "rule v2 { strings: $a = \"WORSE\" condition: $a }",
    )])
}

// =============================================================================
// 업데이트 사이클
// =============================================================================

#[tokio::test]
async fn first_run_installs_rule_set() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = MockFetcher::default();
    let checksum = fetcher.publish("1", rules_v1());

    let updater = RuleUpdater::new(fetcher.clone(), dir.path(), "https://listing");
    let outcome = updater.run_cycle().await.unwrap();

    assert!(matches!(outcome, UpdateOutcome::Installed { checksum: ref c, .. } if *c == checksum));
    assert_eq!(fetcher.archive_calls(), 1);

    let rules = std::fs::read_to_string(updater.rule_file()).unwrap();
    assert!(rules.contains("rule v1"));

    let state = ArtifactStore::new(dir.path()).load().await;
    assert_eq!(state.checksum, checksum);
    assert!(state.staging_path.is_none());
    assert!(!updater.staging_dir().exists());
}

#[tokio::test]
async fn unchanged_listing_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = MockFetcher::default();
    let checksum = fetcher.publish("1", rules_v1());

    let updater = RuleUpdater::new(fetcher.clone(), dir.path(), "https://listing");
    updater.run_cycle().await.unwrap();
    let second = updater.run_cycle().await.unwrap();

    assert_eq!(second, UpdateOutcome::NoChange { checksum });
    assert_eq!(fetcher.listing_calls(), 2);
    assert_eq!(fetcher.archive_calls(), 1);
}

#[tokio::test]
async fn changed_checksum_downloads_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = MockFetcher::default();
    fetcher.publish("1", rules_v1());

    let updater = RuleUpdater::new(fetcher.clone(), dir.path(), "https://listing");
    updater.run_cycle().await.unwrap();

    let new_checksum = fetcher.publish("2", rules_v2());
    let outcome = updater.run_cycle().await.unwrap();

    assert!(matches!(outcome, UpdateOutcome::Installed { ref version, .. } if version == "2"));
    assert_eq!(fetcher.archive_calls(), 2);
    assert_eq!(
        ArtifactStore::new(dir.path()).load().await.checksum,
        new_checksum
    );
    let rules = std::fs::read_to_string(updater.rule_file()).unwrap();
    assert!(rules.contains("rule v2"));
    assert!(!rules.contains("rule v1"));
}

#[tokio::test]
async fn empty_listing_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = MockFetcher::default();

    let updater = RuleUpdater::new(fetcher.clone(), dir.path(), "https://listing");
    let outcome = updater.run_cycle().await.unwrap();

    assert_eq!(outcome, UpdateOutcome::EmptyListing);
    assert_eq!(fetcher.archive_calls(), 0);
    assert!(!updater.rule_file().exists());
    assert!(!updater.store().state_path().exists());
}

#[tokio::test]
async fn corrupt_archive_keeps_previous_rules_and_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = MockFetcher::default();
    let v1 = fetcher.publish("1", rules_v1());

    let updater = RuleUpdater::new(fetcher.clone(), dir.path(), "https://listing");
    updater.run_cycle().await.unwrap();
    let before = std::fs::read(updater.rule_file()).unwrap();

    // 불투명한 체크섬 + 손상된 본문
    fetcher.publish_raw("opaque-v2", vec![0xff; 2048]);
    let err = updater.run_cycle().await.unwrap_err();
    assert!(matches!(
        UpdateError::from(err),
        UpdateError::ArchiveCorrupt(_)
    ));

    assert_eq!(std::fs::read(updater.rule_file()).unwrap(), before);
    let state = ArtifactStore::new(dir.path()).load().await;
    assert_eq!(state.checksum, v1);
    assert!(state.staging_path.is_none());
    assert!(!updater.staging_dir().exists());
}

#[tokio::test]
async fn uncompilable_archive_keeps_previous_rules_and_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = MockFetcher::default();
    let v1 = fetcher.publish("1", rules_v1());

    let updater = RuleUpdater::new(fetcher.clone(), dir.path(), "https://listing");
    updater.run_cycle().await.unwrap();
    let before = std::fs::read(updater.rule_file()).unwrap();

    // 체크섬은 맞지만 규칙이 컴파일되지 않음
    fetcher.publish(
        "2",
        build_tar(&[("malware/v2.yar", "rule v2 { strings: $a = \"WORSE\" condition: ")]),
    );
    let err = updater.run_cycle().await.unwrap_err();
    assert!(matches!(err, RuleUpdaterError::RulesRejected(_)), "{err}");
    assert!(matches!(
        UpdateError::from(err),
        UpdateError::ArchiveCorrupt(_)
    ));

    assert_eq!(std::fs::read(updater.rule_file()).unwrap(), before);
    let state = ArtifactStore::new(dir.path()).load().await;
    assert_eq!(state.checksum, v1);
    assert!(state.staging_path.is_none());
    assert!(!updater.staging_dir().exists());

    // 같은 버전을 다음 주기에 다시 시도
    updater.run_cycle().await.unwrap_err();
    assert_eq!(fetcher.archive_calls(), 3);
}

#[tokio::test]
async fn strict_updater_rejects_rules_with_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = MockFetcher::default();
    fetcher.publish(
        "1",
        build_tar(&[(
            "malware/loose.yar",
            "rule loose { strings: $a = \"x\" $b = \"y\" condition: $a }",
        )]),
    );

    let strict = RuleUpdater::new(fetcher.clone(), dir.path(), "https://listing")
        .with_compile_options(CompileOptions {
            fail_on_warning: true,
        });
    let err = strict.run_cycle().await.unwrap_err();
    assert!(matches!(err, RuleUpdaterError::RulesRejected(_)), "{err}");
    assert!(!strict.rule_file().exists());
    assert!(ArtifactStore::new(dir.path()).load().await.checksum.is_empty());

    let lenient = RuleUpdater::new(fetcher.clone(), dir.path(), "https://listing");
    assert!(matches!(
        lenient.run_cycle().await.unwrap(),
        UpdateOutcome::Installed { .. }
    ));
}

#[tokio::test]
async fn checksum_mismatch_is_not_committed() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = MockFetcher::default();
    fetcher.publish_raw(&"0".repeat(64), rules_v1());

    let updater = RuleUpdater::new(fetcher.clone(), dir.path(), "https://listing");
    let err = updater.run_cycle().await.unwrap_err();

    assert!(matches!(err, RuleUpdaterError::ChecksumMismatch { .. }));
    assert!(!updater.rule_file().exists());
    assert!(ArtifactStore::new(dir.path()).load().await.checksum.is_empty());

    // 다음 주기에 재시도
    fetcher.publish("1", rules_v1());
    updater.run_cycle().await.unwrap();
    assert_eq!(fetcher.archive_calls(), 2);
}

#[tokio::test]
async fn listing_failure_leaves_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    let prior = ArtifactState {
        checksum: "prior".to_owned(),
        rules_path: dir.path().display().to_string(),
        staging_path: None,
    };
    store.save(&prior).await.unwrap();

    let fetcher = MockFetcher::default();
    fetcher.fail_listing();
    let updater = RuleUpdater::new(fetcher.clone(), dir.path(), "https://listing");
    let err = updater.run_cycle().await.unwrap_err();

    assert!(matches!(
        UpdateError::from(err),
        UpdateError::ListingUnavailable(_)
    ));
    assert_eq!(store.load().await, prior);
    assert_eq!(fetcher.archive_calls(), 0);
}

#[tokio::test]
async fn interrupted_install_is_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let staging = dir.path().join(".staging");
    std::fs::create_dir_all(&staging).unwrap();
    std::fs::write(staging.join("half-downloaded.tar"), b"partial").unwrap();

    let store = ArtifactStore::new(dir.path());
    store
        .save(&ArtifactState {
            checksum: String::new(),
            rules_path: dir.path().display().to_string(),
            staging_path: Some(staging.display().to_string()),
        })
        .await
        .unwrap();

    let fetcher = MockFetcher::default();
    let checksum = fetcher.publish("1", rules_v1());
    let updater = RuleUpdater::new(fetcher.clone(), dir.path(), "https://listing");
    updater.run_cycle().await.unwrap();

    let state = store.load().await;
    assert_eq!(state.checksum, checksum);
    assert!(!state.is_interrupted());
    assert!(!staging.exists());
}

#[tokio::test]
async fn file_url_mirror_end_to_end() {
    let mirror = tempfile::tempdir().unwrap();
    let rules_dir = tempfile::tempdir().unwrap();

    let archive = rules_v1();
    let archive_path = mirror.path().join("rules.tar");
    std::fs::write(&archive_path, &archive).unwrap();

    let listing_path = mirror.path().join("listing.json");
    let listing = serde_json::json!({
        "available": {
            "v3": [{
                "version": "2024.06.01",
                "checksum": sha256_hex(&archive),
                "url": format!("file://{}", archive_path.display()),
            }]
        }
    });
    std::fs::write(&listing_path, listing.to_string()).unwrap();

    let fetcher = HttpListingFetcher::new(Duration::from_secs(5)).unwrap();
    let updater = RuleUpdater::new(
        fetcher,
        rules_dir.path(),
        format!("file://{}", listing_path.display()),
    );

    let outcome = updater.run_cycle().await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::Installed { .. }));
    assert!(rules_dir.path().join("listing.json").exists());
    assert!(
        std::fs::read_to_string(updater.rule_file())
            .unwrap()
            .contains("rule v1")
    );
}

// =============================================================================
// 스케줄러
// =============================================================================

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn scheduler_runs_immediately_and_stops_on_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = MockFetcher::default();
    fetcher.publish("1", rules_v1());

    let updater = RuleUpdater::new(fetcher.clone(), dir.path(), "https://listing");
    let scheduler = UpdateScheduler::new(updater, Duration::from_secs(3600));
    let cancel = CancellationToken::new();
    let handle = scheduler.spawn(cancel.clone());

    wait_until(|| fetcher.listing_calls() == 1).await;
    cancel.cancel();

    let cycles = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("scheduler should stop after cancel")
        .unwrap();
    assert_eq!(cycles, 1);
    assert_eq!(fetcher.archive_calls(), 1);
}

#[tokio::test]
async fn scheduler_keeps_running_after_failed_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = MockFetcher::default();
    fetcher.fail_listing();

    let updater = RuleUpdater::new(fetcher.clone(), dir.path(), "https://listing");
    let scheduler = UpdateScheduler::new(updater, Duration::from_millis(20));
    let cancel = CancellationToken::new();
    let handle = scheduler.spawn(cancel.clone());

    wait_until(|| fetcher.listing_calls() >= 3).await;
    cancel.cancel();

    let cycles = handle.await.unwrap();
    assert!(cycles >= 3);
}
