//! 스캔 디스패처 -- 요청 해석, 파일 순회, 매칭 결과 스트리밍
//!
//! [`ScanDispatcher::dispatch`]는 요청 변형에 맞는 해석기로 스캔 루트를 만든 뒤
//! 블로킹 스레드에서 파일을 순회하며 매칭 엔진에 넘깁니다. 결과는
//! [`FindingStream`]으로 하나씩 전달됩니다.
//!
//! ```text
//! ScanRequest --> TargetResolver --> root
//!                                     |
//!                      spawn_blocking(walkdir + MatchEngine)
//!                                     |
//!                               mpsc channel
//!                                     v
//!                               FindingStream (Stream<Item = Result<Finding, ScanError>>)
//! ```
//!
//! 스트림을 중간에 버리면 순회 스레드는 다음 전송에서 멈춥니다.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::Stream;
use metrics::{counter, histogram};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use yarasweep_core::error::ScanError;
use yarasweep_core::metrics as m;
use yarasweep_core::types::{Finding, ScanKind, ScanRequest};

use crate::engine::MatchEngine;
use crate::error::ScannerError;
use crate::resolver::{ContainerRuntime, TargetResolver};

/// 기본 파일 크기 상한 (64 MB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// 결과 채널 버퍼 크기
const FINDING_CHANNEL_CAPACITY: usize = 256;

/// 스캔 디스패처
pub struct ScanDispatcher<R> {
    engine: Arc<dyn MatchEngine>,
    resolver: TargetResolver<R>,
    max_file_size: u64,
}

impl<R: ContainerRuntime> ScanDispatcher<R> {
    /// 새 디스패처를 생성합니다.
    pub fn new(engine: Arc<dyn MatchEngine>, resolver: TargetResolver<R>) -> Self {
        Self {
            engine,
            resolver,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    /// 파일 크기 상한을 설정합니다. 상한을 넘는 파일은 건너뜁니다.
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    /// 요청을 처리합니다.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest`: 값이 비어있거나 컨테이너 ID가 잘못된 경우
    /// - `Engine`: 대상 해석 실패
    ///
    /// 순회 중 발생한 에러는 스트림 항목으로 전달됩니다.
    pub async fn dispatch(&self, request: &ScanRequest) -> Result<FindingStream, ScanError> {
        let kind = request.kind();
        if request.target().trim().is_empty() {
            record_scan(kind, "invalid");
            return Err(ScanError::InvalidRequest(format!(
                "{kind} scan requires a non-empty value"
            )));
        }

        let target = match self.resolver.resolve(request).await {
            Ok(target) => target,
            Err(e) => {
                warn!(kind = %kind, target = %request.target(), error = %e, "scan target resolution failed");
                record_scan(kind, "error");
                return Err(e.into());
            }
        };
        let (root, workspace) = target.into_parts();
        info!(
            kind = %kind,
            target = %request.target(),
            root = %root.display(),
            rules = self.engine.rule_count(),
            "scan started"
        );

        let (tx, rx) = mpsc::channel(FINDING_CHANNEL_CAPACITY);
        let walk = FileWalk {
            root,
            _workspace: workspace,
            engine: Arc::clone(&self.engine),
            max_file_size: self.max_file_size,
            kind,
        };
        tokio::task::spawn_blocking(move || walk.run(tx));

        Ok(FindingStream { rx })
    }
}

/// 스캔 결과 스트림
///
/// 유한하고 재시작할 수 없으며, 엔진이 내보낸 순서를 유지합니다.
pub struct FindingStream {
    rx: mpsc::Receiver<Result<Finding, ScanError>>,
}

impl FindingStream {
    /// 모든 결과를 모읍니다. 첫 에러에서 중단합니다.
    pub async fn collect(mut self) -> Result<Vec<Finding>, ScanError> {
        let mut findings = Vec::new();
        while let Some(item) = self.rx.recv().await {
            findings.push(item?);
        }
        Ok(findings)
    }
}

impl Stream for FindingStream {
    type Item = Result<Finding, ScanError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// 블로킹 스레드에서 실행되는 순회 작업. 임시 디렉토리 수명도 함께 관리합니다.
struct FileWalk {
    root: PathBuf,
    _workspace: Option<TempDir>,
    engine: Arc<dyn MatchEngine>,
    max_file_size: u64,
    kind: ScanKind,
}

impl FileWalk {
    fn run(self, tx: mpsc::Sender<Result<Finding, ScanError>>) {
        let started = Instant::now();
        let mut files: u64 = 0;
        let mut findings: u64 = 0;
        let mut skipped: u64 = 0;

        let result = self.walk(&tx, &mut files, &mut findings, &mut skipped);
        let elapsed = started.elapsed();
        counter!(m::SCANNER_FILES_SCANNED_TOTAL).increment(files);
        histogram!(m::SCANNER_SCAN_DURATION_SECONDS, m::LABEL_KIND => self.kind.to_string())
            .record(elapsed.as_secs_f64());

        match result {
            Ok(()) => {
                record_scan(self.kind, "ok");
                info!(
                    root = %self.root.display(),
                    files,
                    findings,
                    skipped,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "scan completed"
                );
            }
            Err(WalkStop::ReceiverGone) => {
                record_scan(self.kind, "abandoned");
                debug!(root = %self.root.display(), "finding stream dropped, walk stopped");
            }
            Err(WalkStop::Failed(e)) => {
                record_scan(self.kind, "error");
                warn!(root = %self.root.display(), error = %e, "scan failed");
                // 수신자가 없으면 보고할 곳이 없음
                let _ = tx.blocking_send(Err(e.into()));
            }
        }
    }

    fn walk(
        &self,
        tx: &mpsc::Sender<Result<Finding, ScanError>>,
        files: &mut u64,
        findings: &mut u64,
        skipped: &mut u64,
    ) -> Result<(), WalkStop> {
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(WalkStop::Failed(ScannerError::Walk {
                        path: self.root.display().to_string(),
                        reason: e.to_string(),
                    }));
                }
                Err(e) => {
                    debug!(error = %e, "skipping unreadable entry");
                    *skipped += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            match entry.metadata() {
                Ok(meta) if meta.len() > self.max_file_size => {
                    debug!(path = %path.display(), size = meta.len(), "file exceeds size limit, skipped");
                    *skipped += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "metadata unavailable, skipped");
                    *skipped += 1;
                    continue;
                }
            }

            let data = match std::fs::read(path) {
                Ok(data) => data,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "read failed, skipped");
                    *skipped += 1;
                    continue;
                }
            };
            *files += 1;

            let matches = self.engine.scan_bytes(&data);
            if matches.is_empty() {
                continue;
            }
            let location = relative_location(&self.root, path);
            for rule_match in matches {
                *findings += 1;
                counter!(m::SCANNER_FINDINGS_TOTAL, m::LABEL_SEVERITY => rule_match.severity.to_string())
                    .increment(1);
                debug!(rule = %rule_match.rule, location = %location, "rule matched");
                tx.blocking_send(Ok(rule_match.into_finding(location.clone())))
                    .map_err(|_| WalkStop::ReceiverGone)?;
            }
        }
        Ok(())
    }
}

enum WalkStop {
    ReceiverGone,
    Failed(ScannerError),
}

fn record_scan(kind: ScanKind, result: &'static str) {
    counter!(
        m::SCANNER_SCANS_TOTAL,
        m::LABEL_KIND => kind.to_string(),
        m::LABEL_RESULT => result
    )
    .increment(1);
}

/// 스캔 루트 기준 상대 경로. 루트가 파일이면 파일 이름을 사용합니다.
fn relative_location(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().into_owned(),
        _ => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned()),
    }
}
