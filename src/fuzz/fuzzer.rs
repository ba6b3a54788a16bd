//! Lifecycle control for one fuzz target on one device.

use crate::device::{Device, DeviceError, NOT_RUNNING};
use crate::fuzz::{
    is_artifact,
    log::{byte_lines, LogScanner},
};
use crate::host::{Host, HostError};

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// Seconds between refreshed liveness checks while monitoring; the device
/// offers no push notification, polling is all there is.
const MONITOR_POLL: Duration = Duration::from_secs(2);

lazy_static! {
    static ref ENGINE_LOG: Regex = Regex::new(r"^fuzz-(\d+)\.log$").unwrap();
}

#[derive(Debug, Error)]
pub enum FuzzerError {
    #[error("device: {0}")]
    Device(#[from] DeviceError),
    #[error("host: {0}")]
    Host(#[from] HostError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("'{0}/{1}' is running and must be stopped first")]
    AlreadyRunning(String, String),
    #[error("no units provided")]
    NoUnitsProvided,
    #[error("input units are only valid with repro")]
    UnexpectedUnits,
    #[error("no files matched '{0}'")]
    NoMatch(String),
}

/// What `stop` actually did; a no-op is observable, not an error.
#[derive(Debug, PartialEq, Eq)]
pub enum StopAction {
    Killed(i64),
    NotRunning,
}

pub struct Fuzzer {
    device: Device,
    host: Host,
    package: String,
    executable: String,
    /// Host directory runs log into; must exist before any run.
    output: PathBuf,
    /// Engine options merged over the defaults; key-sorted at argv time.
    options: BTreeMap<String, String>,
    /// Caller-supplied input paths; only `repro` accepts them.
    inputs: Vec<String>,
    /// Extra arguments for the target process, after the `--` separator.
    extra_args: Vec<String>,
    foreground: bool,
    debug: bool,
    /// Last pid observed through the device, [`NOT_RUNNING`] until seen.
    pid: i64,
}

impl Fuzzer {
    pub fn new(
        device: Device,
        host: Host,
        package: String,
        executable: String,
        output: PathBuf,
    ) -> Self {
        Self {
            device,
            host,
            package,
            executable,
            output,
            options: BTreeMap::new(),
            inputs: Vec::new(),
            extra_args: Vec::new(),
            foreground: false,
            debug: false,
            pid: NOT_RUNNING,
        }
    }

    pub fn set_foreground(&mut self, foreground: bool) {
        self.foreground = foreground;
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn set_option(&mut self, key: &str, value: &str) {
        self.options.insert(key.to_string(), value.to_string());
    }

    pub fn set_inputs(&mut self, inputs: Vec<String>) {
        self.inputs = inputs;
    }

    pub fn set_extra_args(&mut self, args: Vec<String>) {
        self.extra_args = args;
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// `package/executable`, the name users refer to the target by.
    pub fn name(&self) -> String {
        format!("{}/{}", self.package, self.executable)
    }

    pub fn url(&self) -> String {
        format!(
            "fuchsia-pkg://fuchsia.com/{}#meta/{}.cmx",
            self.package, self.executable
        )
    }

    /// Root of the target's mutable namespace on the device; the engine's
    /// `data/` maps here.
    pub fn data_path(&self, rel: &str) -> PathBuf {
        let root = PathBuf::from(format!(
            "/data/r/sys/fuchsia.com:{}:0#meta:{}.cmx",
            self.package, self.executable
        ));
        if rel.is_empty() {
            root
        } else {
            root.join(rel)
        }
    }

    pub fn corpus_path(&self) -> PathBuf {
        self.data_path("corpus")
    }

    /// Whether the target process exists on the device. Cheap when served
    /// from the cache; `refresh` forces a new status query and is required
    /// before any state-changing decision.
    pub fn is_running(&mut self, refresh: bool) -> Result<bool, FuzzerError> {
        self.pid = self
            .device
            .pid(&self.package, &self.executable, refresh)?;
        Ok(self.pid != NOT_RUNNING)
    }

    /// Launch a fuzzing run.
    ///
    /// Foreground runs block and stream the engine's stderr through the
    /// symbolizing scanner. Background runs return right after the spawn;
    /// a separate `monitor` invocation collects their logs.
    pub fn start(&mut self) -> Result<(), FuzzerError> {
        if !self.inputs.is_empty() {
            return Err(FuzzerError::UnexpectedUnits);
        }
        if self.is_running(true)? {
            return Err(FuzzerError::AlreadyRunning(
                self.package.clone(),
                self.executable.clone(),
            ));
        }

        // Stale logs from a previous background run would confuse the next
        // monitor pass.
        let logs = self.data_path("fuzz-*.log");
        self.device
            .run(&["rm", "-f", &logs.display().to_string()])?;
        let corpus = self.corpus_path();
        self.device
            .run(&["mkdir", "-p", &corpus.display().to_string()])?;

        let mut options = self.default_options();
        options.insert(
            "dict".to_string(),
            format!("pkg/data/{}/dictionary", self.executable),
        );
        if !self.foreground {
            options.insert("jobs".to_string(), "1".to_string());
        }
        options.extend(self.options.clone());

        let argv = self.run_argv(&options, &["data/corpus/".to_string()]);
        if self.foreground {
            log::info!("running {} in the foreground", self.name());
            self.run_attached(&argv)?;
        } else {
            log::info!("starting {}", self.name());
            // Nobody reads the engine here; a piped stderr with a dropped
            // handle would EPIPE the ssh session and take the run with it.
            // The on-device fuzz-*.log files are the record, collected by
            // a later monitor pass.
            self.device.spawn_detached(&argv)?;
        }
        Ok(())
    }

    /// Wait for a background run to end, then retrieve and symbolize its
    /// engine logs. The sole path by which background output gets
    /// symbolized; a run that wrote no log is quietly accepted.
    pub fn monitor(&mut self) -> Result<(), FuzzerError> {
        while self.is_running(true)? {
            sleep(MONITOR_POLL);
        }
        log::info!("{} has stopped, collecting logs", self.name());

        let listing = self.device.list(&self.data_path(""));
        let mut logs: Vec<(u64, String)> = listing
            .keys()
            .filter_map(|name| {
                ENGINE_LOG
                    .captures(name)
                    .and_then(|caps| caps[1].parse::<u64>().ok())
                    .map(|n| (n, name.clone()))
            })
            .collect();
        logs.sort();

        for (job, (_, name)) in logs.iter().enumerate() {
            let device_log = self.data_path(name);
            self.device.fetch(&self.output, &[device_log.clone()], 1)?;
            self.device
                .run(&["rm", "-f", &device_log.display().to_string()])?;

            let fetched = self.output.join(name);
            let raw = std::fs::read(&fetched)?;
            std::fs::remove_file(&fetched)?;
            self.symbolize_log(byte_lines(raw.as_slice()), job, false)?;
        }
        Ok(())
    }

    /// Kill the target if it is running.
    pub fn stop(&mut self) -> Result<StopAction, FuzzerError> {
        if !self.is_running(true)? {
            return Ok(StopAction::NotRunning);
        }
        let pid = self.pid;
        self.device.run(&["kill", &pid.to_string()])?;
        log::info!("stopped {} (pid {})", self.name(), pid);
        Ok(StopAction::Killed(pid))
    }

    /// Re-run the target once over previously saved inputs, foreground,
    /// to deterministically re-trigger a captured crash.
    pub fn repro(&mut self) -> Result<(), FuzzerError> {
        if self.inputs.is_empty() {
            return Err(FuzzerError::NoUnitsProvided);
        }
        if self.is_running(true)? {
            return Err(FuzzerError::AlreadyRunning(
                self.package.clone(),
                self.executable.clone(),
            ));
        }

        let mut units = Vec::new();
        for pattern in self.inputs.clone() {
            let sent = self.device.store(&self.data_path(""), &[&pattern])?;
            if sent.is_empty() {
                return Err(FuzzerError::NoMatch(pattern));
            }
            for file in sent {
                // The engine sees them through its data/ mapping.
                let name = file.file_name().unwrap().to_string_lossy().into_owned();
                units.push(format!("data/{}", name));
            }
        }
        self.inputs = units.clone();
        self.foreground = true;

        let mut options = self.default_options();
        options.extend(self.options.clone());
        let argv = self.run_argv(&options, &units);
        log::info!("reproducing with {} unit(s)", units.len());
        self.run_attached(&argv)
    }

    /// Merge corpora into the on-device corpus, explicit corpora first and
    /// any remote bundle second, then run as `start` does.
    pub fn analyze(
        &mut self,
        corpora: &[String],
        bundle: Option<&str>,
    ) -> Result<(), FuzzerError> {
        let corpus = self.corpus_path();
        for dir in corpora {
            let pattern = format!("{}/*", dir.trim_end_matches('/'));
            let sent = self.device.store(&corpus, &[&pattern])?;
            if sent.is_empty() {
                return Err(FuzzerError::NoMatch(dir.clone()));
            }
            log::info!("merged {} unit(s) from {}", sent.len(), dir);
        }
        if let Some(dir) = bundle {
            let pattern = format!("{}/*", dir.trim_end_matches('/'));
            let sent = self.device.store(&corpus, &[&pattern])?;
            log::info!("merged {} unit(s) from bundle {}", sent.len(), dir);
        }
        self.start()
    }

    /// (number of corpus units, total bytes).
    pub fn measure_corpus(&self) -> (usize, u64) {
        let listing = self.device.list(&self.corpus_path());
        let total = listing.values().sum();
        (listing.len(), total)
    }

    /// Artifact names currently sitting in the data namespace.
    pub fn list_artifacts(&self) -> Vec<String> {
        let listing = self.device.list(&self.data_path(""));
        let mut artifacts: Vec<String> = listing
            .keys()
            .filter(|name| is_artifact(name))
            .cloned()
            .collect();
        artifacts.sort();
        artifacts
    }

    fn default_options(&self) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        options.insert("artifact_prefix".to_string(), "data/".to_string());
        if self.debug {
            // Leave faults to an attached debugger instead of the engine.
            for handler in &["handle_abrt", "handle_bus", "handle_fpe", "handle_ill", "handle_segv"]
            {
                options.insert(handler.to_string(), "0".to_string());
            }
        }
        options
    }

    /// `run <url> -k1=v1 ... <tail...> [-- <extra args...>]` with options
    /// in key order, so identical configurations produce identical argvs.
    fn run_argv(&self, options: &BTreeMap<String, String>, tail: &[String]) -> Vec<String> {
        let mut argv = vec!["run".to_string(), self.url()];
        for (key, value) in options {
            argv.push(format!("-{}={}", key, value));
        }
        argv.extend(tail.iter().cloned());
        if !self.extra_args.is_empty() {
            argv.push("--".to_string());
            argv.extend(self.extra_args.iter().cloned());
        }
        argv
    }

    /// Spawn on the device and stay attached, streaming stderr through the
    /// scanner. A nonzero engine exit is normal (that is what a found
    /// crash looks like), so only the spawn itself can fail.
    fn run_attached(&mut self, argv: &[String]) -> Result<(), FuzzerError> {
        let mut child = self.device.spawn(argv)?;
        let stderr = child.stderr.take().expect("stderr was piped at spawn");
        let symbolized = self.symbolize_log(byte_lines(stderr), 0, true)?;
        let status = child.wait()?;
        log::debug!("engine exited with {}", status);
        if !symbolized {
            log::warn!("no symbolized output for this run; see the raw log");
        }
        Ok(())
    }

    /// Feed one run's line stream through the scanner, writing
    /// `fuzz-<job>.log` in the output directory, then bring announced
    /// artifacts home. Returns whether a symbolized block was written.
    pub fn symbolize_log<I>(&self, lines: I, job: usize, echo: bool) -> Result<bool, FuzzerError>
    where
        I: IntoIterator<Item = io::Result<Vec<u8>>>,
    {
        let log_path = self.output.join(format!("fuzz-{}.log", job));
        let out = File::create(&log_path)?;
        let scanner = LogScanner::new(&self.device, &self.host, out, echo);
        let result = scanner.scan(lines)?;

        for artifact in &result.artifacts {
            let source = self.data_path(artifact);
            self.device.fetch(&self.output, &[source], 2)?;
            log::info!("retrieved {}", artifact);
        }
        Ok(result.symbolized)
    }
}
