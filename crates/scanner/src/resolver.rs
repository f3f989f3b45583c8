//! Scan target resolution.
//!
//! [`TargetResolver`] turns a [`ScanRequest`] into a directory the dispatcher
//! can walk:
//!
//! ```text
//! Path(p)        -> p (prefixed with the host mount path when configured)
//! Image(name)    -> docker save  -> image.tar -> layers applied in manifest order -> rootfs/
//! Container(id)  -> docker export -> container.tar -> rootfs/
//! ```
//!
//! Image and container roots live in a temporary directory owned by the
//! returned [`ResolvedTarget`]; dropping it removes the extracted tree.
//!
//! Container runtime access goes through the [`ContainerRuntime`] trait so
//! tests can feed prepared tarballs without a Docker daemon.
//!
//! # Container Reference Validation
//!
//! A container is referenced by its ID (hex, full or abbreviated) or by its
//! name. Both must match `[a-zA-Z0-9][a-zA-Z0-9_.-]*` and be at most
//! 128 characters long.
//!
//! # Layer Whiteouts
//!
//! Whiteout entries delete paths written by lower layers. A whiteout whose
//! parent directory is a symlink is ignored, so a layer cannot redirect the
//! deletion outside the extracted root.

use std::fs::File;
use std::future::Future;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use yarasweep_core::types::ScanRequest;

use crate::error::ScannerError;

/// Docker image manifest file inside a `docker save` archive.
const IMAGE_MANIFEST: &str = "manifest.json";

/// Whiteout prefix marking a deleted path in an image layer.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Opaque whiteout marker: hides everything below the directory from lower layers.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Upper bound on a container ID or name.
const MAX_CONTAINER_REF_LEN: usize = 128;

fn validate_container_id(id: &str) -> Result<(), ScannerError> {
    if id.is_empty() || id.len() > MAX_CONTAINER_REF_LEN {
        return Err(ScannerError::InvalidRequest(format!(
            "invalid container reference: length {} (must be 1-{MAX_CONTAINER_REF_LEN})",
            id.len()
        )));
    }
    let mut chars = id.chars();
    let leading_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    if !leading_ok || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(ScannerError::InvalidRequest(format!(
            "invalid container reference '{id}': expected an ID or a name matching [a-zA-Z0-9][a-zA-Z0-9_.-]*"
        )));
    }
    Ok(())
}

/// Trait abstracting the container runtime calls needed to materialize
/// image and container filesystems.
///
/// Both methods write a tar stream to `dest`.
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Writes the `docker save` archive of `image` to `dest`.
    fn export_image(
        &self,
        image: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<(), ScannerError>> + Send;

    /// Writes the `docker export` archive of container `id` to `dest`.
    fn export_container(
        &self,
        id: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<(), ScannerError>> + Send;
}

/// Production runtime backed by `bollard`.
pub struct BollardRuntime {
    docker: Arc<bollard::Docker>,
}

impl BollardRuntime {
    /// Connects to Docker using the default local socket.
    ///
    /// # Errors
    ///
    /// Returns `ScannerError::Runtime` if the client cannot be created.
    pub fn connect_local() -> Result<Self, ScannerError> {
        let docker = bollard::Docker::connect_with_local_defaults()
            .map_err(|e| ScannerError::Runtime(format!("failed to connect to docker: {e}")))?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }
}

/// Drains a byte stream from the daemon into `dest`.
async fn write_stream<S, B, E>(mut stream: S, dest: &Path, what: &str) -> Result<(), ScannerError>
where
    S: futures::Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let io_err = |e: std::io::Error| ScannerError::Io {
        path: dest.display().to_string(),
        source: e,
    };
    let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ScannerError::Runtime(format!("{what} failed: {e}")))?;
        let chunk = chunk.as_ref();
        file.write_all(chunk).await.map_err(io_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(io_err)?;
    debug!(target_file = %dest.display(), bytes = written, "{what} stream written");
    Ok(())
}

impl ContainerRuntime for BollardRuntime {
    async fn export_image(&self, image: &str, dest: &Path) -> Result<(), ScannerError> {
        let stream = self.docker.export_image(image);
        write_stream(Box::pin(stream), dest, "image export").await
    }

    async fn export_container(&self, id: &str, dest: &Path) -> Result<(), ScannerError> {
        validate_container_id(id)?;
        let stream = self.docker.export_container(id);
        write_stream(Box::pin(stream), dest, "container export").await
    }
}

/// A walkable scan root. Holds the temporary directory for exported targets.
#[derive(Debug)]
pub struct ResolvedTarget {
    root: PathBuf,
    workspace: Option<TempDir>,
}

impl ResolvedTarget {
    /// Directory (or single file) to scan.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Splits into the root path and the temp dir guard.
    pub fn into_parts(self) -> (PathBuf, Option<TempDir>) {
        (self.root, self.workspace)
    }
}

/// Resolves scan requests to filesystem roots.
pub struct TargetResolver<R> {
    runtime: Option<Arc<R>>,
    host_mount_path: Option<PathBuf>,
}

impl<R> Clone for TargetResolver<R> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            host_mount_path: self.host_mount_path.clone(),
        }
    }
}

impl<R: ContainerRuntime> TargetResolver<R> {
    /// Creates a resolver. Without a runtime only path requests can be resolved.
    pub fn new(runtime: Option<Arc<R>>) -> Self {
        Self {
            runtime,
            host_mount_path: None,
        }
    }

    /// Sets the host mount prefix used for path requests. Empty disables it.
    pub fn with_host_mount(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.host_mount_path = (!path.as_os_str().is_empty()).then_some(path);
        self
    }

    /// Materializes the request's filesystem view.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest`: blank value or malformed container ID
    /// - `Walk`: path does not exist
    /// - `Runtime` / `Extract`: export or extraction failed
    pub async fn resolve(&self, request: &ScanRequest) -> Result<ResolvedTarget, ScannerError> {
        let value = request.target().trim();
        if value.is_empty() {
            return Err(ScannerError::InvalidRequest(format!(
                "{} scan requires a non-empty value",
                request.kind()
            )));
        }

        match request {
            ScanRequest::Path(_) => {
                let root = self.local_root(value);
                tokio::fs::metadata(&root)
                    .await
                    .map_err(|e| ScannerError::Walk {
                        path: root.display().to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(ResolvedTarget {
                    root,
                    workspace: None,
                })
            }
            ScanRequest::Image(name) => {
                let runtime = self.runtime()?;
                let workspace = new_workspace()?;
                let tarball = workspace.path().join("image.tar");
                let rootfs = workspace.path().join("rootfs");

                info!(image = %name, "exporting image");
                runtime.export_image(name.trim(), &tarball).await?;
                let layers = run_blocking({
                    let (tarball, rootfs, scratch) =
                        (tarball.clone(), rootfs.clone(), workspace.path().join("image"));
                    move || extract_image(&tarball, &scratch, &rootfs)
                })
                .await?;
                info!(image = %name, layers, "image filesystem extracted");
                remove_quietly(&tarball).await;

                Ok(ResolvedTarget {
                    root: rootfs,
                    workspace: Some(workspace),
                })
            }
            ScanRequest::Container(id) => {
                validate_container_id(value)?;
                let runtime = self.runtime()?;
                let workspace = new_workspace()?;
                let tarball = workspace.path().join("container.tar");
                let rootfs = workspace.path().join("rootfs");

                info!(container_id = %id, "exporting container");
                runtime.export_container(value, &tarball).await?;
                let entries = run_blocking({
                    let (tarball, rootfs) = (tarball.clone(), rootfs.clone());
                    move || {
                        std::fs::create_dir_all(&rootfs).map_err(|e| io_error(&rootfs, e))?;
                        apply_layer(open_archive(&tarball)?, &rootfs)
                    }
                })
                .await?;
                info!(container_id = %id, entries, "container filesystem extracted");
                remove_quietly(&tarball).await;

                Ok(ResolvedTarget {
                    root: rootfs,
                    workspace: Some(workspace),
                })
            }
        }
    }

    fn runtime(&self) -> Result<&R, ScannerError> {
        self.runtime
            .as_deref()
            .ok_or_else(|| ScannerError::Runtime("container runtime is not available".to_owned()))
    }

    fn local_root(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.host_mount_path {
            Some(mount) if !path.starts_with(mount) => {
                let relative: PathBuf = path
                    .components()
                    .filter(|c| matches!(c, Component::Normal(_) | Component::CurDir))
                    .collect();
                mount.join(relative)
            }
            _ => path.to_path_buf(),
        }
    }
}

fn new_workspace() -> Result<TempDir, ScannerError> {
    tempfile::Builder::new()
        .prefix("yarasweep-")
        .tempdir()
        .map_err(|e| io_error(&std::env::temp_dir(), e))
}

async fn run_blocking<T, F>(f: F) -> Result<T, ScannerError>
where
    F: FnOnce() -> Result<T, ScannerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ScannerError::Channel(format!("extract task failed: {e}")))?
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "failed to remove export archive");
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ScannerError {
    ScannerError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

/// Unpacks a `docker save` archive and applies its layers to `rootfs`.
/// Returns the number of layers applied.
fn extract_image(tarball: &Path, scratch: &Path, rootfs: &Path) -> Result<usize, ScannerError> {
    std::fs::create_dir_all(scratch).map_err(|e| io_error(scratch, e))?;
    std::fs::create_dir_all(rootfs).map_err(|e| io_error(rootfs, e))?;

    let file = File::open(tarball).map_err(|e| io_error(tarball, e))?;
    tar::Archive::new(BufReader::new(file))
        .unpack(scratch)
        .map_err(|e| ScannerError::Extract(format!("image archive: {e}")))?;

    let manifest_path = scratch.join(IMAGE_MANIFEST);
    let raw = std::fs::read(&manifest_path)
        .map_err(|e| ScannerError::Extract(format!("missing {IMAGE_MANIFEST}: {e}")))?;
    let manifest: Vec<ManifestEntry> = serde_json::from_slice(&raw)
        .map_err(|e| ScannerError::Extract(format!("invalid {IMAGE_MANIFEST}: {e}")))?;
    let entry = manifest
        .into_iter()
        .next()
        .ok_or_else(|| ScannerError::Extract(format!("{IMAGE_MANIFEST} is empty")))?;

    for layer in &entry.layers {
        let relative = Path::new(layer);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ScannerError::Extract(format!("invalid layer path: {layer}")));
        }
        let entries = apply_layer(open_archive(&scratch.join(relative))?, rootfs)?;
        debug!(layer = %layer, entries, "layer applied");
    }
    Ok(entry.layers.len())
}

/// Opens a tar file, transparently decompressing gzip.
fn open_archive(path: &Path) -> Result<Box<dyn Read>, ScannerError> {
    let mut file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut magic = [0u8; 2];
    let read = file.read(&mut magic).map_err(|e| io_error(path, e))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| io_error(path, e))?;
    let reader = BufReader::new(file);
    if read == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(flate2::read::GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Applies one filesystem layer on top of `rootfs`, honoring whiteouts.
///
/// Device nodes and FIFOs are skipped. Entries that fail to unpack are
/// logged and skipped. Returns the number of entries written.
fn apply_layer(reader: Box<dyn Read>, rootfs: &Path) -> Result<usize, ScannerError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);
    archive.set_overwrite(true);

    let mut written = 0;
    let entries = archive
        .entries()
        .map_err(|e| ScannerError::Extract(format!("layer: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ScannerError::Extract(format!("layer entry: {e}")))?;
        let path = match entry.path() {
            Ok(p) => p.into_owned(),
            Err(e) => {
                debug!(error = %e, "skipping entry with invalid path");
                continue;
            }
        };

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name == OPAQUE_WHITEOUT {
                if let Some(dir) = safe_join(rootfs, path.parent().unwrap_or(Path::new(""))) {
                    clear_dir(&dir);
                }
                continue;
            }
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                if let Some(target) = safe_join(rootfs, &path.with_file_name(hidden)) {
                    remove_path(&target);
                }
                continue;
            }
        }

        let kind = entry.header().entry_type();
        if kind.is_character_special() || kind.is_block_special() || kind.is_fifo() {
            continue;
        }
        match entry.unpack_in(rootfs) {
            Ok(true) => written += 1,
            Ok(false) => debug!(path = %path.display(), "entry outside root skipped"),
            Err(e) => debug!(path = %path.display(), error = %e, "entry unpack failed"),
        }
    }
    Ok(written)
}

/// Joins an archive path under `root` for whiteout handling.
///
/// Returns `None` on traversal or when an existing parent directory is a
/// symlink. The final component may itself be a symlink; removing it only
/// unlinks it.
fn safe_join(root: &Path, relative: &Path) -> Option<PathBuf> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }

    let mut out = root.to_path_buf();
    let Some((last, parents)) = parts.split_last() else {
        return Some(out);
    };
    for part in parents {
        out.push(part);
        if let Ok(meta) = std::fs::symlink_metadata(&out) {
            if meta.file_type().is_symlink() {
                debug!(path = %out.display(), "whiteout below symlink ignored");
                return None;
            }
        }
    }
    out.push(last);
    Some(out)
}

fn remove_path(path: &Path) {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(_) => return,
    };
    if let Err(e) = result {
        debug!(path = %path.display(), error = %e, "whiteout removal failed");
    }
}

fn clear_dir(dir: &Path) {
    // read_dir follows symlinks
    match std::fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        _ => return,
    }
    let Ok(children) = std::fs::read_dir(dir) else {
        return;
    };
    for child in children.flatten() {
        remove_path(&child.path());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_tar(entries: Vec<(&str, Vec<u8>)>) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, data.as_slice()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    /// Runtime that writes prepared tarballs.
    #[derive(Default)]
    struct MockRuntime {
        image: Vec<u8>,
        container: Vec<u8>,
    }

    impl ContainerRuntime for MockRuntime {
        async fn export_image(&self, _image: &str, dest: &Path) -> Result<(), ScannerError> {
            tokio::fs::write(dest, &self.image)
                .await
                .map_err(|e| io_error(dest, e))
        }

        async fn export_container(&self, id: &str, dest: &Path) -> Result<(), ScannerError> {
            validate_container_id(id)?;
            tokio::fs::write(dest, &self.container)
                .await
                .map_err(|e| io_error(dest, e))
        }
    }

    fn symlink_entry(path: &str, target: &Path) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_path(path).unwrap();
        header.set_link_name(target).unwrap();
        header.set_cksum();
        header
    }

    fn image_with_layers(layers: Vec<Vec<u8>>) -> Vec<u8> {
        let names: Vec<String> = (1..=layers.len()).map(|i| format!("l{i}/layer.tar")).collect();
        let manifest = serde_json::json!([{ "Config": "cfg.json", "Layers": names }]);
        let mut entries = vec![("manifest.json", manifest.to_string().into_bytes())];
        entries.extend(names.iter().map(String::as_str).zip(layers));
        build_tar(entries)
    }

    #[test]
    fn container_id_validation() {
        assert!(validate_container_id("abc123DEF").is_ok());
        assert!(validate_container_id(&"f".repeat(64)).is_ok());
        assert!(validate_container_id("").is_err());
        assert!(validate_container_id("abc; rm -rf /").is_err());
        assert!(validate_container_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn container_names_are_accepted() {
        assert!(validate_container_id("web").is_ok());
        assert!(validate_container_id("my_app-1.2").is_ok());
        assert!(validate_container_id("0day").is_ok());
        assert!(validate_container_id("-leading-dash").is_err());
        assert!(validate_container_id(".hidden").is_err());
        assert!(validate_container_id("name/with/slash").is_err());
        assert!(validate_container_id("name with space").is_err());
    }

    #[tokio::test]
    async fn container_can_be_resolved_by_name() {
        let runtime = Arc::new(MockRuntime {
            container: build_tar(vec![("srv/index.html", b"<html>".to_vec())]),
            ..MockRuntime::default()
        });
        let resolver = TargetResolver::new(Some(runtime));
        let target = resolver
            .resolve(&ScanRequest::Container("frontend_web.1".to_owned()))
            .await
            .unwrap();
        assert!(target.root().join("srv/index.html").is_file());
    }

    #[tokio::test]
    async fn whiteouts_do_not_follow_symlinked_parents() {
        let host = tempfile::tempdir().unwrap();
        std::fs::write(host.path().join("precious.txt"), b"keep me").unwrap();
        std::fs::create_dir(host.path().join("data")).unwrap();
        std::fs::write(host.path().join("data/db.bin"), b"keep me too").unwrap();

        let mut links = tar::Builder::new(Vec::new());
        let escape = symlink_entry("escape", host.path());
        links.append(&escape, std::io::empty()).unwrap();
        let linked_data = symlink_entry("linked_data", &host.path().join("data"));
        links.append(&linked_data, std::io::empty()).unwrap();
        let links = links.into_inner().unwrap();

        let whiteouts = build_tar(vec![
            ("escape/.wh.precious.txt", Vec::new()),
            ("linked_data/.wh..wh..opq", Vec::new()),
        ]);

        let runtime = Arc::new(MockRuntime {
            image: image_with_layers(vec![links, whiteouts]),
            ..MockRuntime::default()
        });
        let resolver = TargetResolver::new(Some(runtime));
        let target = resolver
            .resolve(&ScanRequest::Image("evil:1".to_owned()))
            .await
            .unwrap();

        assert_eq!(std::fs::read(host.path().join("precious.txt")).unwrap(), b"keep me");
        assert_eq!(
            std::fs::read(host.path().join("data/db.bin")).unwrap(),
            b"keep me too"
        );
        assert!(
            std::fs::symlink_metadata(target.root().join("escape"))
                .unwrap()
                .file_type()
                .is_symlink()
        );
    }

    #[test]
    fn whiteout_may_remove_a_symlink_itself() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("keep"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        let target = safe_join(root.path(), Path::new("link")).unwrap();
        remove_path(&target);
        assert!(std::fs::symlink_metadata(root.path().join("link")).is_err());
        assert!(outside.path().join("keep").exists());

        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();
        assert_eq!(safe_join(root.path(), Path::new("link/keep")), None);
    }

    #[tokio::test]
    async fn path_is_prefixed_with_host_mount() {
        let mount = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(mount.path().join("srv/app")).unwrap();

        let resolver =
            TargetResolver::<MockRuntime>::new(None).with_host_mount(mount.path().to_path_buf());
        let target = resolver
            .resolve(&ScanRequest::Path("/srv/app".to_owned()))
            .await
            .unwrap();
        assert_eq!(target.root(), mount.path().join("srv/app"));

        // already under the mount: used as is
        let already = mount.path().join("srv").display().to_string();
        let target = resolver
            .resolve(&ScanRequest::Path(already))
            .await
            .unwrap();
        assert_eq!(target.root(), mount.path().join("srv"));
    }

    #[tokio::test]
    async fn missing_path_is_walk_error() {
        let resolver = TargetResolver::<MockRuntime>::new(None);
        let err = resolver
            .resolve(&ScanRequest::Path("/definitely/not/here".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScannerError::Walk { .. }));
    }

    #[tokio::test]
    async fn blank_request_is_invalid() {
        let resolver = TargetResolver::<MockRuntime>::new(None);
        let err = resolver
            .resolve(&ScanRequest::Image("  ".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScannerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn image_without_runtime_fails() {
        let resolver = TargetResolver::<MockRuntime>::new(None);
        let err = resolver
            .resolve(&ScanRequest::Image("nginx:latest".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScannerError::Runtime(_)));
    }

    #[tokio::test]
    async fn image_layers_applied_in_order_with_whiteouts() {
        let base = build_tar(vec![
            ("etc/config", b"v1".to_vec()),
            ("opt/old.sh", b"stale".to_vec()),
            ("var/cache/a", b"cached".to_vec()),
        ]);
        let top = build_tar(vec![
            ("etc/config", b"v2".to_vec()),
            ("opt/.wh.old.sh", Vec::new()),
            ("var/cache/.wh..wh..opq", Vec::new()),
            ("bin/tool", b"payload".to_vec()),
        ]);
        let manifest = br#"[{"Config":"cfg.json","RepoTags":["demo:1"],"Layers":["l1/layer.tar","l2/layer.tar"]}]"#;
        let image = build_tar(vec![
            ("manifest.json", manifest.to_vec()),
            ("l1/layer.tar", base),
            ("l2/layer.tar", top),
        ]);

        let runtime = Arc::new(MockRuntime {
            image,
            ..MockRuntime::default()
        });
        let resolver = TargetResolver::new(Some(runtime));
        let target = resolver
            .resolve(&ScanRequest::Image("demo:1".to_owned()))
            .await
            .unwrap();

        let root = target.root();
        assert_eq!(std::fs::read(root.join("etc/config")).unwrap(), b"v2");
        assert_eq!(std::fs::read(root.join("bin/tool")).unwrap(), b"payload");
        assert!(!root.join("opt/old.sh").exists());
        assert!(!root.join("var/cache/a").exists());
    }

    #[tokio::test]
    async fn container_export_is_extracted_and_cleaned_up() {
        let runtime = Arc::new(MockRuntime {
            container: build_tar(vec![("app/main.py", b"print('hi')".to_vec())]),
            ..MockRuntime::default()
        });
        let resolver = TargetResolver::new(Some(runtime));

        let target = resolver
            .resolve(&ScanRequest::Container("deadbeef".to_owned()))
            .await
            .unwrap();
        let root = target.root().to_path_buf();
        assert!(root.join("app/main.py").is_file());

        drop(target);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn invalid_container_id_rejected_before_export() {
        let resolver = TargetResolver::new(Some(Arc::new(MockRuntime::default())));
        let err = resolver
            .resolve(&ScanRequest::Container("../etc".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScannerError::InvalidRequest(_)));
    }

    #[test]
    fn safe_join_rejects_traversal() {
        let root = Path::new("/tmp/root");
        assert_eq!(
            safe_join(root, Path::new("a/b")),
            Some(PathBuf::from("/tmp/root/a/b"))
        );
        assert_eq!(safe_join(root, Path::new("../etc")), None);
    }
}
