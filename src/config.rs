//! Explicit, validated configuration.
//!
//! Everything the CLI layer collects lands in named fields here and is
//! checked before the first device round trip; a bad path should never
//! survive long enough to become a confusing transport error.

use crate::device::SshConfig;

use std::path::PathBuf;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    /// Network address of the device.
    pub device_addr: String,
    pub ssh: SshConfig,

    /// Checkout root of the OS image build.
    pub source_dir: PathBuf,
    /// Build output directory, relative paths anchored under `source_dir`.
    pub build_dir: PathBuf,
    /// Symbolizing filter binary; default lives in the build tree.
    pub symbolizer: Option<PathBuf>,
    pub llvm_symbolizer: PathBuf,
    /// Extra debug-symbol directories on top of the build's own.
    pub build_id_dirs: Vec<PathBuf>,

    /// Host directory that receives logs and artifacts; must already exist.
    pub output: PathBuf,
    pub foreground: bool,
    pub debug: bool,
    /// Engine options as `key=value` strings, applied over the defaults.
    pub options: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_addr: String::new(),
            ssh: SshConfig::default(),
            source_dir: PathBuf::from("."),
            build_dir: PathBuf::from("out/default"),
            symbolizer: None,
            llvm_symbolizer: PathBuf::from("llvm-symbolizer"),
            build_id_dirs: Vec::new(),
            output: PathBuf::from("."),
            foreground: false,
            debug: false,
            options: Vec::new(),
        }
    }
}

impl Config {
    pub fn check(&self) -> anyhow::Result<()> {
        if self.device_addr.is_empty() {
            anyhow::bail!("no device address given");
        }
        if !self.source_dir.is_dir() {
            anyhow::bail!("bad source dir: {}", self.source_dir.display());
        }
        if !self.resolved_build_dir().is_dir() {
            anyhow::bail!("bad build dir: {}", self.resolved_build_dir().display());
        }
        if !self.output.is_dir() {
            anyhow::bail!("bad output dir: {}", self.output.display());
        }
        if let Some(identity) = self.ssh.identity.as_ref() {
            if !identity.is_file() {
                anyhow::bail!("bad ssh identity file: {}", identity.display());
            }
        }
        if let Some(config) = self.ssh.config.as_ref() {
            if !config.is_file() {
                anyhow::bail!("bad ssh config file: {}", config.display());
            }
        }
        for option in &self.options {
            parse_option(option)
                .with_context(|| format!("bad engine option '{}'", option))?;
        }
        Ok(())
    }

    /// Build dir anchored under the source dir; idempotent for absolute
    /// or already-anchored values.
    pub fn resolved_build_dir(&self) -> PathBuf {
        if self.build_dir.is_absolute() || self.build_dir.starts_with(&self.source_dir) {
            self.build_dir.clone()
        } else {
            self.source_dir.join(&self.build_dir)
        }
    }
}

/// Split one `key=value` engine option.
pub fn parse_option(option: &str) -> anyhow::Result<(&str, &str)> {
    let mut parts = option.splitn(2, '=');
    match (parts.next(), parts.next()) {
        (Some(key), Some(value)) if !key.is_empty() => Ok((key, value)),
        _ => anyhow::bail!("expected key=value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config(dir: &std::path::Path) -> Config {
        Config {
            device_addr: "::1".to_string(),
            source_dir: dir.to_path_buf(),
            build_dir: dir.to_path_buf(),
            output: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn check_accepts_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(valid_config(dir.path()).check().is_ok());
    }

    #[test]
    fn check_fails_fast_on_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path());
        config.output = dir.path().join("does-not-exist");
        assert!(config.check().is_err());
    }

    #[test]
    fn check_rejects_malformed_options() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path());
        config.options = vec!["=nokey".to_string()];
        assert!(config.check().is_err());
    }

    #[test]
    fn option_parsing() {
        assert_eq!(parse_option("jobs=4").unwrap(), ("jobs", "4"));
        assert_eq!(
            parse_option("dict=pkg/data/x/dictionary").unwrap(),
            ("dict", "pkg/data/x/dictionary")
        );
        // Values may carry their own '='.
        assert_eq!(parse_option("a=b=c").unwrap(), ("a", "b=c"));
        assert!(parse_option("novalue").is_err());
    }
}
