//! Scan-serving transport for service mode.
//!
//! Listens on a Unix domain socket and speaks newline-delimited JSON.
//! Each request line is a [`ScanRequest`]; the reply is one `finding` line per
//! result followed by a single `done` or `error` line. A connection may carry
//! any number of requests and is closed after the idle timeout.
//!
//! ```text
//! -> {"kind":"path","value":"/srv/www"}
//! <- {"type":"finding","rule_id":"webshell","severity":"high","location":"upload/x.php",...}
//! <- {"type":"done","count":1}
//! ```
//!
//! Rules are loaded through a [`RuleBook`], which recompiles the installed
//! rule file whenever the updater replaces it.

use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use yarasweep_core::error::ScanError;
use yarasweep_core::metrics as m;
use yarasweep_core::types::{Finding, ScanRequest};
use yarasweep_scanner::{
    CompileOptions, ContainerRuntime, DEFAULT_MAX_FILE_SIZE, MatchEngine, RuleSet, ScanDispatcher,
    ScannerError, TargetResolver,
};

use crate::error::AgentError;

/// Default limit on concurrently served connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Default idle timeout for a connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Maximum length of a single request line.
const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// One response line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScanResponse {
    Finding(Finding),
    Done { count: u64 },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
    inode: u64,
}

struct LoadedRules {
    fingerprint: Fingerprint,
    rules: Arc<RuleSet>,
}

/// Installed rule set, recompiled when the file on disk changes.
///
/// The file's modification time, length and inode are compared before every
/// lookup, so a rename-based install by the updater is picked up by the next
/// request. A failed compile is not cached and is retried on the next lookup.
pub struct RuleBook {
    rule_file: PathBuf,
    options: CompileOptions,
    loaded: Mutex<Option<LoadedRules>>,
}

impl RuleBook {
    pub fn new(rule_file: impl Into<PathBuf>, options: CompileOptions) -> Self {
        Self {
            rule_file: rule_file.into(),
            options,
            loaded: Mutex::new(None),
        }
    }

    pub fn rule_file(&self) -> &Path {
        &self.rule_file
    }

    /// Current rule set, compiling it first if the file changed.
    ///
    /// # Errors
    ///
    /// `Io` if the rule file is missing, or any compile error.
    pub async fn current(&self) -> Result<Arc<RuleSet>, ScannerError> {
        let io_err = |e: std::io::Error| ScannerError::Io {
            path: self.rule_file.display().to_string(),
            source: e,
        };

        let meta = tokio::fs::metadata(&self.rule_file).await.map_err(io_err)?;
        let fingerprint = Fingerprint {
            modified: meta.modified().ok(),
            len: meta.len(),
            inode: meta.ino(),
        };

        let mut loaded = self.loaded.lock().await;
        if let Some(current) = loaded.as_ref() {
            if current.fingerprint == fingerprint {
                return Ok(Arc::clone(&current.rules));
            }
        }

        let source = tokio::fs::read_to_string(&self.rule_file)
            .await
            .map_err(io_err)?;
        let options = self.options;
        let rules = tokio::task::spawn_blocking(move || RuleSet::compile(&source, options))
            .await
            .map_err(|e| ScannerError::Channel(format!("rule compile task failed: {e}")))??;
        let rules = Arc::new(rules);

        info!(
            path = %self.rule_file.display(),
            rules = rules.rule_count(),
            reloaded = loaded.is_some(),
            "rule set loaded"
        );
        *loaded = Some(LoadedRules {
            fingerprint,
            rules: Arc::clone(&rules),
        });
        Ok(rules)
    }
}

struct Shared<R> {
    rules: RuleBook,
    resolver: TargetResolver<R>,
    max_file_size: u64,
    idle_timeout: Duration,
}

/// Unix socket scan server.
pub struct ScanServer<R> {
    listener: UnixListener,
    socket_path: PathBuf,
    rules: RuleBook,
    resolver: TargetResolver<R>,
    max_file_size: u64,
    idle_timeout: Duration,
    max_connections: usize,
}

impl<R: ContainerRuntime> ScanServer<R> {
    /// Bind the socket.
    ///
    /// A stale socket file left by a previous run is removed. Any other file
    /// at `socket_path` is an error. Must be called within a Tokio runtime.
    pub fn bind(
        socket_path: impl Into<PathBuf>,
        rules: RuleBook,
        resolver: TargetResolver<R>,
    ) -> Result<Self, AgentError> {
        let socket_path = socket_path.into();
        let server_err =
            |reason: String| AgentError::Server(format!("{}: {reason}", socket_path.display()));

        match std::fs::symlink_metadata(&socket_path) {
            Ok(meta) if meta.file_type().is_socket() => {
                debug!(path = %socket_path.display(), "removing stale socket");
                std::fs::remove_file(&socket_path).map_err(|e| server_err(e.to_string()))?;
            }
            Ok(_) => return Err(server_err("path exists and is not a socket".to_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(server_err(e.to_string())),
        }

        if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| server_err(e.to_string()))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| server_err(format!("failed to bind: {e}")))?;
        info!(path = %socket_path.display(), "scan server listening");

        Ok(Self {
            listener,
            socket_path,
            rules,
            resolver,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        })
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve until `cancel` fires, then wait for open connections and remove the socket.
    pub async fn run(self, cancel: CancellationToken) {
        let shared = Arc::new(Shared {
            rules: self.rules,
            resolver: self.resolver,
            max_file_size: self.max_file_size,
            idle_timeout: self.idle_timeout,
        });
        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let mut stream = match result {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    counter!(m::SERVER_CONNECTIONS_TOTAL).increment(1);

                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        warn!(max = self.max_connections, "max connections reached, rejecting connection");
                        let busy = ScanResponse::Error {
                            message: "server busy".to_owned(),
                        };
                        let _ = write_response(&mut stream, &busy).await;
                        continue;
                    };

                    let shared = Arc::clone(&shared);
                    let cancel = cancel.clone();
                    connections.spawn(async move {
                        let conn_id = uuid::Uuid::new_v4();
                        debug!(%conn_id, "connection accepted");
                        if let Err(e) = handle_connection(stream, &*shared, &cancel).await {
                            debug!(%conn_id, error = %e, "connection ended with error");
                        }
                        drop(permit);
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "connection task panicked");
                    }
                }
                _ = cancel.cancelled() => {
                    info!("scan server received shutdown signal");
                    break;
                }
            }
        }

        while connections.join_next().await.is_some() {}
        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(path = %self.socket_path.display(), error = %e, "failed to remove socket");
        }
        info!("scan server stopped");
    }
}

async fn handle_connection<R: ContainerRuntime>(
    stream: UnixStream,
    shared: &Shared<R>,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        line.clear();
        // at most one byte past the limit is buffered
        let mut limited = (&mut reader).take(MAX_REQUEST_SIZE as u64 + 1);
        let read = tokio::select! {
            result = timeout(shared.idle_timeout, limited.read_until(b'\n', &mut line)) => result,
            _ = cancel.cancelled() => break,
        };
        match read {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(
                    idle_secs = shared.idle_timeout.as_secs(),
                    "closing idle connection"
                );
                break;
            }
        }

        if line.len() > MAX_REQUEST_SIZE {
            counter!(m::SERVER_REQUESTS_TOTAL, m::LABEL_RESULT => "invalid").increment(1);
            let response = ScanResponse::Error {
                message: format!("request exceeds {MAX_REQUEST_SIZE} bytes"),
            };
            write_response(&mut write_half, &response).await?;
            break;
        }
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        let request: ScanRequest = match serde_json::from_slice(trimmed) {
            Ok(request) => request,
            Err(e) => {
                counter!(m::SERVER_REQUESTS_TOTAL, m::LABEL_RESULT => "invalid").increment(1);
                let response = ScanResponse::Error {
                    message: format!("malformed request: {e}"),
                };
                write_response(&mut write_half, &response).await?;
                continue;
            }
        };

        let result = serve_request(&request, shared, &mut write_half, cancel).await?;
        counter!(m::SERVER_REQUESTS_TOTAL, m::LABEL_RESULT => result).increment(1);
    }

    Ok(())
}

/// Serve a single request and return the metric label for its outcome.
async fn serve_request<R, W>(
    request: &ScanRequest,
    shared: &Shared<R>,
    writer: &mut W,
    cancel: &CancellationToken,
) -> std::io::Result<&'static str>
where
    R: ContainerRuntime,
    W: AsyncWrite + Unpin,
{
    let fail = |e: ScanError| {
        let label = match e {
            ScanError::InvalidRequest(_) => "invalid",
            ScanError::EngineCompile(_) | ScanError::Engine(_) => "error",
        };
        (
            label,
            ScanResponse::Error {
                message: e.to_string(),
            },
        )
    };

    let rules = match shared.rules.current().await {
        Ok(rules) => rules,
        Err(e) => {
            warn!(error = %e, path = %shared.rules.rule_file().display(), "rules unavailable");
            let (label, response) = fail(ScanError::EngineCompile(e.to_string()));
            write_response(writer, &response).await?;
            return Ok(label);
        }
    };

    let engine: Arc<dyn MatchEngine> = rules;
    let dispatcher = ScanDispatcher::new(engine, shared.resolver.clone())
        .with_max_file_size(shared.max_file_size);

    let mut findings = match dispatcher.dispatch(request).await {
        Ok(stream) => stream,
        Err(e) => {
            let (label, response) = fail(e);
            write_response(writer, &response).await?;
            return Ok(label);
        }
    };

    let mut count: u64 = 0;
    loop {
        let item = tokio::select! {
            item = findings.next() => item,
            _ = cancel.cancelled() => {
                let response = ScanResponse::Error {
                    message: "server shutting down".to_owned(),
                };
                write_response(writer, &response).await?;
                return Ok("cancelled");
            }
        };
        match item {
            Some(Ok(finding)) => {
                write_response(writer, &ScanResponse::Finding(finding)).await?;
                count += 1;
            }
            Some(Err(e)) => {
                let (label, response) = fail(e);
                write_response(writer, &response).await?;
                return Ok(label);
            }
            None => break,
        }
    }

    debug!(request = %request, count, "request served");
    write_response(writer, &ScanResponse::Done { count }).await?;
    Ok("ok")
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &ScanResponse,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(response).map_err(std::io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
