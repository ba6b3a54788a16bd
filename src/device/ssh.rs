//! Building ssh/scp argument vectors for the device transport.

use std::path::{Path, PathBuf};

/// Transport options shared by every ssh/scp invocation against a device.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    /// Ssh port on the device, `-p`/`-P`.
    pub port: Option<u16>,
    /// Path to the identity file, `-i`.
    pub identity: Option<PathBuf>,
    /// Path to an ssh config file, `-F`.
    pub config: Option<PathBuf>,
    /// Pass `-v` to the transport.
    pub verbose: bool,
    /// Extra `-o key=value` options.
    pub options: Vec<String>,
}

impl SshConfig {
    fn common(&self, argv: &mut Vec<String>) {
        if let Some(config) = self.config.as_ref() {
            argv.push("-F".to_string());
            argv.push(config.display().to_string());
        } else {
            // No config file means no interactive prompts either.
            argv.push("-o".to_string());
            argv.push("BatchMode=yes".to_string());
            argv.push("-o".to_string());
            argv.push("StrictHostKeyChecking=no".to_string());
            argv.push("-o".to_string());
            argv.push("UserKnownHostsFile=/dev/null".to_string());
        }
        if let Some(identity) = self.identity.as_ref() {
            argv.push("-i".to_string());
            argv.push(identity.display().to_string());
        }
        for opt in &self.options {
            argv.push("-o".to_string());
            argv.push(opt.clone());
        }
        if self.verbose {
            argv.push("-v".to_string());
        }
    }

    /// `ssh [options] <addr> <args...>`.
    pub fn ssh_argv<S: AsRef<str>>(&self, addr: &str, args: &[S]) -> Vec<String> {
        let mut argv = vec!["ssh".to_string()];
        self.common(&mut argv);
        if let Some(port) = self.port {
            argv.push("-p".to_string());
            argv.push(port.to_string());
        }
        argv.push(addr.to_string());
        argv.extend(args.iter().map(|a| a.as_ref().to_string()));
        argv
    }

    /// `scp [options] <sources...> <dest>`. Remote endpoints are written
    /// with the bracketed-address notation, see [`remote_path`].
    pub fn scp_argv<S: AsRef<str>>(&self, sources: &[S], dest: &str) -> Vec<String> {
        let mut argv = vec!["scp".to_string()];
        self.common(&mut argv);
        if let Some(port) = self.port {
            argv.push("-P".to_string());
            argv.push(port.to_string());
        }
        argv.extend(sources.iter().map(|s| s.as_ref().to_string()));
        argv.push(dest.to_string());
        argv
    }
}

/// Remote-copy endpoint: `[addr]:path`. The brackets keep scp from
/// misreading ipv6 addresses.
pub fn remote_path(addr: &str, path: &Path) -> String {
    format!("[{}]:{}", addr, path.display())
}
