//! One target device, reached only through the ssh transport.
//!
//! The device is an untrusted, laggy peer: every method here is a blocking
//! round trip over a spawned subprocess, and partial or garbled output is
//! normal. Line-level parse failures are skipped; whole-command failures
//! propagate to the caller.

use crate::exec::{CommandChannel, ProcessChannel};

use std::path::{Path, PathBuf};
use std::process::{Child, Output};

use lazy_static::lazy_static;
use regex::Regex;
use rustc_hash::FxHashMap;
use thiserror::Error;

pub mod ssh;

pub use ssh::SshConfig;

/// Sentinel pid for "no such process".
pub const NOT_RUNNING: i64 = -1;

lazy_static! {
    // `  <executable>.cmx[<pid>]: fuchsia-pkg://fuchsia.com/<package>#meta/<executable>.cmx`
    static ref CS_LINE: Regex = Regex::new(
        r"^\s*([\w\-]+)\.cmx\[(\d+)\]: fuchsia-pkg://fuchsia\.com/([\w\-]+)#meta/([\w\-]+)\.cmx$"
    )
    .unwrap();
    // `[<timestamp>][<pid>][<tid>][<tags>] <data>`
    static ref SYSLOG_LINE: Regex = Regex::new(r"^\[[^\]]*\]\[(\d+)\]\[\d+\]\[[^\]]*\]").unwrap();
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote command `{cmd}` failed: {stderr}")]
    CommandFailed { cmd: String, stderr: String },
    #[error("copy `{cmd}` failed: {stderr}")]
    CopyFailed { cmd: String, stderr: String },
    #[error("bad pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("glob: {0}")]
    Glob(#[from] glob::GlobError),
}

/// A (package, executable) pair, the unit every fuzz target is keyed by.
pub type TargetKey = (String, String);

pub struct Device {
    addr: String,
    ssh: SshConfig,
    channel: Box<dyn CommandChannel>,
    /// Cached (package, executable) -> pid map. `None` until the first
    /// status query; replaced wholesale on every refresh, never merged.
    pids: Option<FxHashMap<TargetKey, i64>>,
}

impl Device {
    pub fn new(addr: String, ssh: SshConfig) -> Self {
        Self::with_channel(addr, ssh, Box::new(ProcessChannel))
    }

    pub fn with_channel(addr: String, ssh: SshConfig, channel: Box<dyn CommandChannel>) -> Self {
        Self {
            addr,
            ssh,
            channel,
            pids: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Run a command on the device and wait for it, failing on nonzero exit.
    pub fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<Output, DeviceError> {
        let argv = self.ssh.ssh_argv(&self.addr, args);
        log::debug!("device: {:?}", argv);
        let output = self.channel.run(&argv)?;
        if !output.status.success() {
            return Err(DeviceError::CommandFailed {
                cmd: argv.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output)
    }

    /// Spawn a long-running command on the device, keeping its stderr
    /// piped for the caller to stream.
    pub fn spawn<S: AsRef<str>>(&self, args: &[S]) -> Result<Child, DeviceError> {
        let argv = self.ssh.ssh_argv(&self.addr, args);
        log::debug!("device (spawn): {:?}", argv);
        Ok(self.channel.spawn(&argv)?)
    }

    /// Spawn a remote command with nothing attached. For runs that outlive
    /// this process; monitoring happens later, by pid, possibly from
    /// another invocation.
    pub fn spawn_detached<S: AsRef<str>>(&self, args: &[S]) -> Result<Child, DeviceError> {
        let argv = self.ssh.ssh_argv(&self.addr, args);
        log::debug!("device (detached): {:?}", argv);
        Ok(self.channel.spawn_detached(&argv)?)
    }

    /// Drop the pid cache; the next [`pid`](Self::pid) query reloads it.
    pub fn refresh_cache(&mut self) {
        self.pids = None;
    }

    /// Pid of `package`/`executable`, or [`NOT_RUNNING`]. The component
    /// status query is expensive, so answers come from the cache unless it
    /// is empty or `refresh` is set; state-changing callers must refresh.
    pub fn pid(
        &mut self,
        package: &str,
        executable: &str,
        refresh: bool,
    ) -> Result<i64, DeviceError> {
        if refresh || self.pids.is_none() {
            self.pids = Some(self.load_pids()?);
        }
        let key = (package.to_string(), executable.to_string());
        Ok(*self.pids.as_ref().unwrap().get(&key).unwrap_or(&NOT_RUNNING))
    }

    fn load_pids(&self) -> Result<FxHashMap<TargetKey, i64>, DeviceError> {
        let output = self.run(&["cs"])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut pids = FxHashMap::default();
        for line in stdout.lines() {
            if let Some(caps) = CS_LINE.captures(line) {
                if caps[1] != caps[4] {
                    continue;
                }
                if let Ok(pid) = caps[2].parse::<i64>() {
                    pids.insert((caps[3].to_string(), caps[1].to_string()), pid);
                }
            }
        }
        Ok(pids)
    }

    /// Name -> size listing of a device directory. A failed listing is an
    /// empty map: callers probe for corpus/artifact directories that may
    /// simply not exist yet.
    pub fn list(&self, path: &Path) -> FxHashMap<String, u64> {
        let path = path.display().to_string();
        match self.run(&["ls", "-l", &path]) {
            Ok(output) => parse_ls(&String::from_utf8_lossy(&output.stdout)),
            Err(e) => {
                log::debug!("list {}: {}", path, e);
                FxHashMap::default()
            }
        }
    }

    /// Copy device files into `host_dir`, retrying a caller-chosen number
    /// of times. `retries == 0` means a single attempt.
    pub fn fetch(
        &self,
        host_dir: &Path,
        sources: &[PathBuf],
        retries: usize,
    ) -> Result<(), DeviceError> {
        let sources: Vec<String> = sources
            .iter()
            .map(|s| ssh::remote_path(&self.addr, s))
            .collect();
        let argv = self.ssh.scp_argv(&sources, &host_dir.display().to_string());
        let mut last = None;
        for attempt in 0..=retries {
            if attempt > 0 {
                log::warn!("fetch retry {}/{}", attempt, retries);
            }
            let output = self.channel.run(&argv)?;
            if output.status.success() {
                return Ok(());
            }
            last = Some(DeviceError::CopyFailed {
                cmd: argv.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Err(last.unwrap())
    }

    /// Copy host files matching `patterns` into `device_dir`, which is
    /// created first. Glob expansion happens here; the remote side never
    /// globs. Returns the files actually transferred so a caller can treat
    /// an empty expansion as its own error.
    pub fn store<S: AsRef<str>>(
        &self,
        device_dir: &Path,
        patterns: &[S],
    ) -> Result<Vec<PathBuf>, DeviceError> {
        let mut files = Vec::new();
        for pattern in patterns {
            for entry in glob::glob(pattern.as_ref())? {
                let path = entry?;
                if path.is_file() {
                    files.push(path);
                }
            }
        }
        if files.is_empty() {
            return Ok(files);
        }

        self.run(&["mkdir", "-p", &device_dir.display().to_string()])?;
        let sources: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
        let dest = ssh::remote_path(&self.addr, device_dir);
        let argv = self.ssh.scp_argv(&sources, &dest);
        let output = self.channel.run(&argv)?;
        if !output.status.success() {
            return Err(DeviceError::CopyFailed {
                cmd: argv.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(files)
    }

    /// Dump the device syslog, optionally filtered to one pid.
    pub fn syslog(&self, pid: i64) -> Result<Vec<u8>, DeviceError> {
        let mut args = vec![
            "log_listener".to_string(),
            "--dump_logs".to_string(),
            "yes".to_string(),
        ];
        if pid != NOT_RUNNING {
            args.push("--pid".to_string());
            args.push(pid.to_string());
        }
        Ok(self.run(&args)?.stdout)
    }

    /// Fallback pid recovery: the most recent syslog line that looks like
    /// fuzzing-engine or sanitizer output names the process in its second
    /// bracketed field. [`NOT_RUNNING`] if the log shows no such line.
    pub fn guess_pid(&self) -> Result<i64, DeviceError> {
        let log = self.syslog(NOT_RUNNING)?;
        let log = String::from_utf8_lossy(&log);
        let mut pid = NOT_RUNNING;
        for line in log.lines() {
            if !line.contains("libFuzzer") && !line.contains("Sanitizer") {
                continue;
            }
            if let Some(caps) = SYSLOG_LINE.captures(line) {
                if let Ok(p) = caps[1].parse::<i64>() {
                    pid = p;
                }
            }
        }
        Ok(pid)
    }
}

/// Parse POSIX `ls -l` output: size from column 5, name from column 9 on
/// (embedded spaces preserved). Anything shorter is skipped.
fn parse_ls(listing: &str) -> FxHashMap<String, u64> {
    let mut entries = FxHashMap::default();
    for line in listing.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let size = match fields[4].parse::<u64>() {
            Ok(size) => size,
            Err(_) => continue,
        };
        if let Some(start) = field_offset(line, 8) {
            entries.insert(line[start..].to_string(), size);
        }
    }
    entries
}

/// Byte offset where the n-th (0-based) whitespace-separated field begins.
fn field_offset(line: &str, n: usize) -> Option<usize> {
    let mut in_field = false;
    let mut seen = 0;
    for (i, c) in line.char_indices() {
        if c.is_whitespace() {
            in_field = false;
        } else if !in_field {
            if seen == n {
                return Some(i);
            }
            in_field = true;
            seen += 1;
        }
    }
    None
}
