//! The local build environment: debug symbols, fuzz-target metadata, and
//! checkout-relative path resolution.

use crate::exec::{CommandChannel, ProcessChannel};

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad fuzzer manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// One record of the build-time fuzzer manifest.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    fuzzers_package: String,
    fuzzers: Vec<String>,
}

pub struct Host {
    /// Checkout root; every relative path resolves under it.
    source_dir: PathBuf,
    /// Build output directory holding `fuzzers.json` and symbol stores.
    build_dir: PathBuf,
    /// The symbolizing filter binary.
    symbolizer: PathBuf,
    llvm_symbolizer: PathBuf,
    /// Debug-symbol search directories handed to the filter.
    build_id_dirs: Vec<PathBuf>,
    channel: Box<dyn CommandChannel>,
}

impl Host {
    pub fn new(
        source_dir: PathBuf,
        build_dir: PathBuf,
        symbolizer: PathBuf,
        llvm_symbolizer: PathBuf,
        build_id_dirs: Vec<PathBuf>,
    ) -> Result<Self, HostError> {
        let host = Self {
            source_dir,
            build_dir,
            symbolizer,
            llvm_symbolizer,
            build_id_dirs,
            channel: Box::new(ProcessChannel),
        };
        if !host.source_dir.is_dir() {
            return Err(HostError::InvalidPath(host.source_dir.display().to_string()));
        }
        if !host.build_dir.is_dir() {
            return Err(HostError::InvalidPath(host.build_dir.display().to_string()));
        }
        Ok(host)
    }

    #[cfg(test)]
    pub(crate) fn with_channel(
        source_dir: PathBuf,
        build_dir: PathBuf,
        channel: Box<dyn CommandChannel>,
    ) -> Self {
        Self {
            source_dir,
            build_dir,
            symbolizer: PathBuf::from("symbolize"),
            llvm_symbolizer: PathBuf::from("llvm-symbolizer"),
            build_id_dirs: Vec::new(),
            channel,
        }
    }

    /// Anchor `path` under the checkout root. Already-anchored paths come
    /// back unchanged, so repeated application is a no-op.
    pub fn path(&self, path: &Path) -> PathBuf {
        if path.starts_with(&self.source_dir) {
            path.to_path_buf()
        } else {
            self.source_dir.join(path)
        }
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    /// Pipe raw log bytes through the symbolizing filter. Symbolization is
    /// best-effort enrichment: a failed filter yields empty output, and
    /// the caller falls back to the raw log.
    pub fn symbolize(&self, raw: &[u8]) -> Result<Vec<u8>, HostError> {
        let mut argv = vec![
            self.symbolizer.display().to_string(),
            "-llvm-symbolizer".to_string(),
            self.llvm_symbolizer.display().to_string(),
        ];
        for dir in &self.build_id_dirs {
            argv.push("-build-id-dir".to_string());
            argv.push(dir.display().to_string());
        }
        let output = self.channel.run_with_input(&argv, raw)?;
        if !output.status.success() {
            log::warn!(
                "symbolizer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(Vec::new());
        }
        Ok(output.stdout)
    }

    /// All (package, executable) fuzz targets known to the build, sorted
    /// by package then executable for deterministic listing and matching.
    pub fn fuzzers(&self) -> Result<Vec<(String, String)>, HostError> {
        let path = self.build_dir.join("fuzzers.json");
        let mut json = String::new();
        File::open(&path)?.read_to_string(&mut json)?;
        read_fuzzer_manifest(&json)
    }
}

/// Parse the build-time manifest: a JSON array of records carrying a
/// package name and its fuzzer executables.
pub fn read_fuzzer_manifest(json: &str) -> Result<Vec<(String, String)>, HostError> {
    let entries: Vec<ManifestEntry> = serde_json::from_str(json)?;
    let mut fuzzers = Vec::new();
    for entry in entries {
        for executable in entry.fuzzers {
            fuzzers.push((entry.fuzzers_package.clone(), executable));
        }
    }
    fuzzers.sort();
    Ok(fuzzers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::{failed_output, ok_output, ScriptedChannel};

    #[test]
    fn manifest_is_sorted() {
        let json = r#"[
            {"fuzzers_package": "zeta", "fuzzers": ["b-fuzzer", "a-fuzzer"]},
            {"fuzzers_package": "alpha", "fuzzers": ["z-fuzzer"]}
        ]"#;
        let fuzzers = read_fuzzer_manifest(json).unwrap();
        assert_eq!(
            fuzzers,
            vec![
                ("alpha".to_string(), "z-fuzzer".to_string()),
                ("zeta".to_string(), "a-fuzzer".to_string()),
                ("zeta".to_string(), "b-fuzzer".to_string()),
            ]
        );
    }

    #[test]
    fn manifest_rejects_garbage() {
        assert!(read_fuzzer_manifest("not json").is_err());
    }

    #[test]
    fn path_anchoring_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let host = Host::with_channel(
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            Box::new(ScriptedChannel::new()),
        );
        let once = host.path(Path::new("out/default"));
        let twice = host.path(&once);
        assert_eq!(once, dir.path().join("out/default"));
        assert_eq!(once, twice);
    }

    #[test]
    fn symbolize_failure_degrades_to_empty() {
        let channel = ScriptedChannel::new();
        channel.push_reply(failed_output("no symbols"));
        let dir = tempfile::tempdir().unwrap();
        let host = Host::with_channel(
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            Box::new(channel),
        );
        assert!(host.symbolize(b"raw log").unwrap().is_empty());
    }

    #[test]
    fn symbolize_passes_through_filter_output() {
        let channel = ScriptedChannel::new();
        channel.push_reply(ok_output("#0 frame in fuzzer::main src/main.rs:10\n"));
        let dir = tempfile::tempdir().unwrap();
        let host = Host::with_channel(
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            Box::new(channel),
        );
        let symbolized = host.symbolize(b"#0 0xdeadbeef\n").unwrap();
        assert!(String::from_utf8(symbolized).unwrap().contains("src/main.rs:10"));
    }
}
