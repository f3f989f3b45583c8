//! 규칙 아카이브 검증 및 설치
//!
//! 모든 함수는 blocking I/O를 수행하므로 async 컨텍스트에서는
//! `tokio::task::spawn_blocking`으로 호출해야 합니다.
//!
//! # 설치 절차
//!
//! ```text
//! archive --> verify (비어있지 않음, SHA-256) --> extract (.yar/.yara 병합)
//!         --> compile 검증 --> malware.yar.tmp --> fsync --> rename --> malware.yar
//! ```
//!
//! rename 이전에 실패하면 기존 규칙 파일은 변경되지 않습니다.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tracing::debug;

use yarasweep_scanner::engine::{CompileOptions, RuleSet};

use crate::error::RuleUpdaterError;

/// gzip 매직 바이트
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// 해제된 규칙 텍스트 최대 크기 (128 MB)
const MAX_RULES_SIZE: u64 = 128 * 1024 * 1024;

/// 규칙 파일로 취급하는 확장자
const RULE_EXTENSIONS: &[&str] = &["yar", "yara"];

/// 설치 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// 설치된 규칙 파일 경로
    pub rule_file: PathBuf,
    /// 병합된 아카이브 엔트리 수
    pub entries: usize,
    /// 설치된 규칙 텍스트 크기
    pub bytes: u64,
}

fn io_err(path: &Path, source: std::io::Error) -> RuleUpdaterError {
    RuleUpdaterError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// 파일의 SHA-256 다이제스트를 소문자 hex로 반환합니다.
pub fn sha256_file(path: &Path) -> Result<String, RuleUpdaterError> {
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| io_err(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// 체크섬이 SHA-256 hex 형식인지 반환합니다.
///
/// 목록의 체크섬이 이 형식이 아니면 불투명한 변경 감지 키로만 사용합니다.
pub fn is_sha256_hex(checksum: &str) -> bool {
    checksum.len() == 64 && checksum.chars().all(|c| c.is_ascii_hexdigit())
}

/// 내려받은 아카이브를 검증합니다.
///
/// # Errors
///
/// - `RuleUpdaterError::Archive`: 빈 파일
/// - `RuleUpdaterError::ChecksumMismatch`: SHA-256 불일치
pub fn verify_archive(path: &Path, expected_checksum: &str) -> Result<(), RuleUpdaterError> {
    let meta = std::fs::metadata(path).map_err(|e| io_err(path, e))?;
    if meta.len() == 0 {
        return Err(RuleUpdaterError::Archive(format!(
            "downloaded archive is empty: {}",
            path.display()
        )));
    }

    if is_sha256_hex(expected_checksum) {
        let actual = sha256_file(path)?;
        if !actual.eq_ignore_ascii_case(expected_checksum) {
            return Err(RuleUpdaterError::ChecksumMismatch {
                expected: expected_checksum.to_lowercase(),
                actual,
            });
        }
        debug!(path = %path.display(), "archive checksum verified");
    } else {
        debug!(
            path = %path.display(),
            checksum = expected_checksum,
            "checksum is not sha256, skipping digest verification"
        );
    }

    Ok(())
}

fn open_archive(path: &Path) -> Result<Box<dyn Read>, RuleUpdaterError> {
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut magic = [0u8; 2];
    let read = file.read(&mut magic).map_err(|e| io_err(path, e))?;
    drop(file);

    let file = BufReader::new(File::open(path).map_err(|e| io_err(path, e))?);
    if read == 2 && magic == GZIP_MAGIC {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn is_rule_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| RULE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// 아카이브에서 규칙 텍스트를 추출합니다.
///
/// `.yar`/`.yara` 엔트리가 있으면 그것만, 없으면 모든 일반 파일을
/// 아카이브 순서대로 이어붙입니다.
///
/// # Errors
///
/// 손상된 아카이브, 일반 파일이 하나도 없는 경우, 크기 초과 시
/// `RuleUpdaterError::Archive`를 반환합니다.
pub fn extract_rules(archive_path: &Path) -> Result<(Vec<u8>, usize), RuleUpdaterError> {
    let reader = open_archive(archive_path)?;
    let mut archive = tar::Archive::new(reader);
    let corrupt = |e: std::io::Error| {
        RuleUpdaterError::Archive(format!("{}: {e}", archive_path.display()))
    };

    let mut rules: Vec<Vec<u8>> = Vec::new();
    let mut others: Vec<Vec<u8>> = Vec::new();
    let mut total: u64 = 0;

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        total += entry.size();
        if total > MAX_RULES_SIZE {
            return Err(RuleUpdaterError::Archive(format!(
                "extracted rules exceed {MAX_RULES_SIZE} bytes"
            )));
        }

        let is_rule = entry.path().map(|p| is_rule_file(&p)).map_err(corrupt)?;
        let mut content = Vec::new();
        entry.read_to_end(&mut content).map_err(corrupt)?;

        if is_rule {
            rules.push(content);
        } else {
            others.push(content);
        }
    }

    let selected = if rules.is_empty() { others } else { rules };
    if selected.is_empty() {
        return Err(RuleUpdaterError::Archive(format!(
            "no rule files in archive: {}",
            archive_path.display()
        )));
    }

    let entries = selected.len();
    let mut merged = Vec::with_capacity(total as usize);
    for content in selected {
        merged.extend_from_slice(&content);
        if !merged.ends_with(b"\n") {
            merged.push(b'\n');
        }
    }
    Ok((merged, entries))
}

/// 규칙 텍스트를 `target`에 원자적으로 기록합니다.
///
/// `<target>.tmp`에 쓰고 fsync 후 rename 합니다.
pub fn write_atomically(target: &Path, content: &[u8]) -> Result<(), RuleUpdaterError> {
    let mut tmp_name = target.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
    file.write_all(content).map_err(|e| io_err(&tmp, e))?;
    file.sync_all().map_err(|e| io_err(&tmp, e))?;
    drop(file);

    std::fs::rename(&tmp, target).map_err(|e| io_err(target, e))?;
    Ok(())
}

/// 병합된 규칙 텍스트가 스캐너에서 컴파일되는지 확인합니다.
///
/// 스캐너와 같은 옵션으로 컴파일하므로, 통과한 규칙 파일은 다음 로드에서도 통과합니다.
pub fn validate_rules(content: &[u8], options: CompileOptions) -> Result<usize, RuleUpdaterError> {
    let source = std::str::from_utf8(content)
        .map_err(|e| RuleUpdaterError::RulesRejected(format!("rules are not valid UTF-8: {e}")))?;
    let rules = RuleSet::check(source, options)
        .map_err(|e| RuleUpdaterError::RulesRejected(e.to_string()))?;
    debug!(rules, "staged rules compiled");
    Ok(rules)
}

/// 아카이브를 검증, 추출하여 `rule_file`에 설치합니다.
///
/// 추출한 규칙이 `options`로 컴파일되지 않으면 기존 파일을 건드리지 않고
/// [`RuleUpdaterError::RulesRejected`]를 반환합니다.
pub fn install_archive(
    archive_path: &Path,
    expected_checksum: &str,
    rule_file: &Path,
    options: CompileOptions,
) -> Result<InstallReport, RuleUpdaterError> {
    verify_archive(archive_path, expected_checksum)?;
    let (content, entries) = extract_rules(archive_path)?;
    validate_rules(&content, options)?;
    write_atomically(rule_file, &content)?;

    Ok(InstallReport {
        rule_file: rule_file.to_path_buf(),
        entries,
        bytes: content.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn build_tar(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn sha256_hex_detection() {
        assert!(is_sha256_hex(&"a".repeat(64)));
        assert!(!is_sha256_hex("abc"));
        assert!(!is_sha256_hex(&"g".repeat(64)));
    }

    #[test]
    fn verify_rejects_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tar");
        std::fs::write(&path, b"").unwrap();
        let err = verify_archive(&path, "whatever").unwrap_err();
        assert!(matches!(err, RuleUpdaterError::Archive(_)));
    }

    #[test]
    fn verify_checks_sha256_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tar");
        std::fs::write(&path, b"hello").unwrap();

        let good = sha256_file(&path).unwrap();
        verify_archive(&path, &good.to_uppercase()).unwrap();

        let bad = "0".repeat(64);
        let err = verify_archive(&path, &bad).unwrap_err();
        assert!(matches!(err, RuleUpdaterError::ChecksumMismatch { .. }));
    }

    #[test]
    fn extract_prefers_rule_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.tar");
        let tar = build_tar(&[
            ("README.md", "docs"),
            ("rules/a.yar", "rule a { condition: true }"),
            ("rules/b.YARA", "rule b { condition: true }\n"),
        ]);
        std::fs::write(&path, tar).unwrap();

        let (content, entries) = extract_rules(&path).unwrap();
        let text = String::from_utf8(content).unwrap();
        assert_eq!(entries, 2);
        assert!(text.contains("rule a"));
        assert!(text.contains("rule b"));
        assert!(!text.contains("docs"));
    }

    #[test]
    fn extract_falls_back_to_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.tar.gz");
        let tar = build_tar(&[("malware", "rule m { condition: true }")]);
        std::fs::write(&path, gzip(&tar)).unwrap();

        let (content, entries) = extract_rules(&path).unwrap();
        assert_eq!(entries, 1);
        assert!(String::from_utf8(content).unwrap().starts_with("rule m"));
    }

    #[test]
    fn extract_rejects_archive_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tar");
        std::fs::write(&path, build_tar(&[])).unwrap();
        let err = extract_rules(&path).unwrap_err();
        assert!(matches!(err, RuleUpdaterError::Archive(_)));
    }

    #[test]
    fn install_keeps_previous_file_on_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let rule_file = dir.path().join("malware.yar");
        std::fs::write(&rule_file, b"rule old { condition: true }").unwrap();

        let archive = dir.path().join("bad.tar");
        std::fs::write(&archive, vec![0xffu8; 1024]).unwrap();

        assert!(install_archive(&archive, "c", &rule_file, CompileOptions::default()).is_err());
        assert_eq!(
            std::fs::read(&rule_file).unwrap(),
            b"rule old { condition: true }"
        );
    }

    #[test]
    fn install_replaces_rule_file() {
        let dir = tempfile::tempdir().unwrap();
        let rule_file = dir.path().join("malware.yar");
        std::fs::write(&rule_file, b"old").unwrap();

        let archive = dir.path().join("rules.tar");
        std::fs::write(&archive, build_tar(&[("x.yar", "rule new { condition: true }")]))
            .unwrap();
        let checksum = sha256_file(&archive).unwrap();

        let report =
            install_archive(&archive, &checksum, &rule_file, CompileOptions::default()).unwrap();
        assert_eq!(report.entries, 1);
        assert!(
            std::fs::read_to_string(&rule_file)
                .unwrap()
                .contains("rule new")
        );
        assert!(!dir.path().join("malware.yar.tmp").exists());
    }

    #[test]
    fn install_rejects_rules_that_do_not_compile() {
        let dir = tempfile::tempdir().unwrap();
        let rule_file = dir.path().join("malware.yar");
        std::fs::write(&rule_file, b"rule old { condition: true }").unwrap();

        let archive = dir.path().join("rules.tar");
        std::fs::write(
            &archive,
            build_tar(&[("x.yar", "rule headers { condition: pe.is_dll() }")]),
        )
        .unwrap();
        let checksum = sha256_file(&archive).unwrap();

        let err = install_archive(&archive, &checksum, &rule_file, CompileOptions::default())
            .unwrap_err();
        assert!(matches!(err, RuleUpdaterError::RulesRejected(_)), "{err}");
        assert_eq!(
            std::fs::read(&rule_file).unwrap(),
            b"rule old { condition: true }"
        );
        assert!(!dir.path().join("malware.yar.tmp").exists());
    }

    #[test]
    fn validate_follows_strictness() {
        let mixed = b"rule ok { strings: $a = \"x\" condition: $a }\n\
                      rule mod { condition: pe.number_of_sections == 1 }\n";
        assert_eq!(validate_rules(mixed, CompileOptions::default()).unwrap(), 1);
        let strict = CompileOptions {
            fail_on_warning: true,
        };
        assert!(matches!(
            validate_rules(mixed, strict),
            Err(RuleUpdaterError::RulesRejected(_))
        ));
        assert!(validate_rules(b"\xff\xfe", CompileOptions::default()).is_err());
    }
}
