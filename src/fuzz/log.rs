//! Streaming symbolization of fuzzing-engine output.
//!
//! The engine interleaves its own chatter, sanitizer dumps, and artifact
//! announcements on one line stream. The scanner walks that stream once,
//! recovering the process id, splicing in a symbolized system log at the
//! first mutation dump, and collecting announced artifact names, while
//! echoing every raw line into the run's log file.

use crate::device::{Device, NOT_RUNNING};
use crate::fuzz::fuzzer::FuzzerError;
use crate::host::Host;

use std::io;
use std::io::{BufRead, Write};

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // `==<pid>==` sanitizer banner.
    static ref PID_LINE: Regex = Regex::new(r"^==(\d+)==").unwrap();
    // First line of a libFuzzer mutation dump.
    static ref MUTATION_LINE: Regex = Regex::new(r"^MS: \d+").unwrap();
    // `Test unit written to data/<name>`
    static ref ARTIFACT_LINE: Regex =
        Regex::new(r"Test unit written to (?:\./)?data/(\S+)").unwrap();
}

/// Where the scanner stands with respect to the one symbolized-log write
/// it is allowed per stream.
enum SymbolizeState {
    /// No `==pid==` banner seen yet.
    AwaitingPid,
    /// Pid known (last banner wins), mutation dump not seen yet.
    AwaitingLog(i64),
    /// The single symbolization fetch already happened.
    Done,
}

/// Everything one pass over a stream produced.
pub struct ScanResult {
    /// A non-empty symbolized block was written to the log.
    pub symbolized: bool,
    /// Artifact names announced by the engine, in announcement order.
    pub artifacts: Vec<String>,
}

pub struct LogScanner<'a, W: Write> {
    device: &'a Device,
    host: &'a Host,
    out: W,
    /// Mirror every write to stdout, for foreground runs.
    echo: bool,
    state: SymbolizeState,
    symbolized: bool,
    artifacts: Vec<String>,
}

impl<'a, W: Write> LogScanner<'a, W> {
    pub fn new(device: &'a Device, host: &'a Host, out: W, echo: bool) -> Self {
        Self {
            device,
            host,
            out,
            echo,
            state: SymbolizeState::AwaitingPid,
            symbolized: false,
            artifacts: Vec::new(),
        }
    }

    /// Drive the scanner over a whole stream of raw byte lines.
    pub fn scan<I>(mut self, lines: I) -> Result<ScanResult, FuzzerError>
    where
        I: IntoIterator<Item = io::Result<Vec<u8>>>,
    {
        for line in lines {
            self.scan_line(&line?)?;
        }
        self.out.flush()?;
        Ok(ScanResult {
            symbolized: self.symbolized,
            artifacts: self.artifacts,
        })
    }

    /// The engine and its target write arbitrary bytes; patterns are
    /// matched on a lossy decoding while the raw line passes through
    /// untouched.
    fn scan_line(&mut self, raw: &[u8]) -> Result<(), FuzzerError> {
        let line = String::from_utf8_lossy(raw);
        let line = line.as_ref();
        if let Some(caps) = PID_LINE.captures(line) {
            if let Ok(pid) = caps[1].parse::<i64>() {
                // The target can restart mid-stream; the newest banner is
                // the process we care about.
                self.state = match self.state {
                    SymbolizeState::Done => SymbolizeState::Done,
                    _ => SymbolizeState::AwaitingLog(pid),
                };
            }
        }

        if MUTATION_LINE.is_match(line) {
            match self.state {
                SymbolizeState::Done => {}
                SymbolizeState::AwaitingPid => {
                    let pid = self.device.guess_pid()?;
                    self.write_symbolized(pid)?;
                }
                SymbolizeState::AwaitingLog(pid) => self.write_symbolized(pid)?,
            }
        }

        if let Some(caps) = ARTIFACT_LINE.captures(line) {
            self.artifacts.push(caps[1].to_string());
        }

        self.emit(raw)?;
        Ok(())
    }

    fn write_symbolized(&mut self, pid: i64) -> Result<(), FuzzerError> {
        // One fetch per stream no matter how it goes from here.
        self.state = SymbolizeState::Done;
        if pid == NOT_RUNNING {
            log::warn!("mutation dump with no recoverable pid; skipping symbolization");
            return Ok(());
        }
        let syslog = self.device.syslog(pid)?;
        let symbolized = self.host.symbolize(&syslog)?;
        if symbolized.is_empty() {
            return Ok(());
        }
        self.out.write_all(&symbolized)?;
        if self.echo {
            io::stdout().write_all(&symbolized)?;
        }
        self.symbolized = true;
        Ok(())
    }

    fn emit(&mut self, line: &[u8]) -> io::Result<()> {
        self.out.write_all(line)?;
        self.out.write_all(b"\n")?;
        if self.echo {
            let stdout = io::stdout();
            let mut stdout = stdout.lock();
            stdout.write_all(line)?;
            stdout.write_all(b"\n")?;
        }
        Ok(())
    }
}

/// Byte-line iterator over a reader: terminators stripped, content kept
/// as-is whether or not it is utf-8.
pub struct ByteLines<R> {
    reader: R,
}

impl<R: BufRead> Iterator for ByteLines<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = Vec::new();
        match self.reader.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                Some(Ok(buf))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

pub fn byte_lines<R: io::Read>(reader: R) -> ByteLines<io::BufReader<R>> {
    ByteLines {
        reader: io::BufReader::new(reader),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SshConfig;
    use crate::exec::testing::{ok_output, ScriptedChannel};

    const SYSLOG: &str = "[9.8][42][0][foo] some raw frames\n";
    const SYMBOLIZED: &str = "#0 crash_me src/lib.rs:3\n";

    fn scan(
        device_channel: &ScriptedChannel,
        host_channel: &ScriptedChannel,
        lines: &[&str],
    ) -> (ScanResult, String) {
        let device = Device::with_channel(
            "::1".to_string(),
            SshConfig::default(),
            Box::new(device_channel.clone()),
        );
        let dir = tempfile::tempdir().unwrap();
        let host = Host::with_channel(
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            Box::new(host_channel.clone()),
        );
        let mut out = Vec::new();
        let scanner = LogScanner::new(&device, &host, &mut out, false);
        let result = scanner
            .scan(lines.iter().map(|l| Ok(l.as_bytes().to_vec())))
            .unwrap();
        (result, String::from_utf8(out).unwrap())
    }

    #[test]
    fn symbolizes_exactly_once() {
        let device_channel = ScriptedChannel::new();
        device_channel.push_reply(ok_output(SYSLOG));
        let host_channel = ScriptedChannel::new();
        host_channel.push_reply(ok_output(SYMBOLIZED));
        // A second mutation marker must not trigger a second fetch.
        let (result, out) = scan(
            &device_channel,
            &host_channel,
            &["==1234== INFO: libFuzzer", "MS: 1 ChangeBit-", "MS: 2 EraseBytes-"],
        );
        assert!(result.symbolized);
        assert_eq!(out.matches("src/lib.rs:3").count(), 1);
        // Exactly one syslog fetch, one symbolizer run.
        assert_eq!(device_channel.call_count(), 1);
        assert_eq!(host_channel.call_count(), 1);
        let syslog_argv = &device_channel.calls()[0];
        assert!(syslog_argv.contains(&"--pid".to_string()));
        assert!(syslog_argv.contains(&"1234".to_string()));
    }

    #[test]
    fn recovers_pid_from_device_when_banner_missing() {
        let device_channel = ScriptedChannel::new();
        // guess_pid dump, then the pid-filtered dump.
        device_channel.push_reply(ok_output(
            "[9.7][77][0][foo] ERROR: libFuzzer: deadly signal\n",
        ));
        device_channel.push_reply(ok_output(SYSLOG));
        let host_channel = ScriptedChannel::new();
        host_channel.push_reply(ok_output(SYMBOLIZED));
        let (result, _) = scan(&device_channel, &host_channel, &["MS: 3 ShuffleBytes-"]);
        assert!(result.symbolized);
        assert_eq!(device_channel.call_count(), 2);
        let filtered = &device_channel.calls()[1];
        assert!(filtered.contains(&"77".to_string()));
    }

    #[test]
    fn last_pid_banner_wins() {
        let device_channel = ScriptedChannel::new();
        device_channel.push_reply(ok_output(SYSLOG));
        let host_channel = ScriptedChannel::new();
        host_channel.push_reply(ok_output(SYMBOLIZED));
        let (_, _) = scan(
            &device_channel,
            &host_channel,
            &["==1111== INFO", "==2222== INFO", "MS: 1 ChangeBit-"],
        );
        let syslog_argv = &device_channel.calls()[0];
        assert!(syslog_argv.contains(&"2222".to_string()));
    }

    #[test]
    fn collects_announced_artifacts() {
        let device_channel = ScriptedChannel::new();
        let host_channel = ScriptedChannel::new();
        let (result, out) = scan(
            &device_channel,
            &host_channel,
            &[
                "==55== ERROR: AddressSanitizer",
                "Test unit written to data/crash-ab12",
                "Test unit written to data/leak-cd34",
            ],
        );
        assert_eq!(result.artifacts, vec!["crash-ab12", "leak-cd34"]);
        assert!(!result.symbolized);
        // Raw lines always land in the log.
        assert!(out.contains("crash-ab12"));
    }

    #[test]
    fn raw_bytes_pass_through_unmangled() {
        let device_channel = ScriptedChannel::new();
        let host_channel = ScriptedChannel::new();
        let device = Device::with_channel(
            "::1".to_string(),
            SshConfig::default(),
            Box::new(device_channel.clone()),
        );
        let dir = tempfile::tempdir().unwrap();
        let host = Host::with_channel(
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            Box::new(host_channel.clone()),
        );
        let mut out = Vec::new();
        let scanner = LogScanner::new(&device, &host, &mut out, false);
        // The middle line is not utf-8; the scan must neither fail nor
        // lose the artifact announced after it.
        let lines: Vec<io::Result<Vec<u8>>> = vec![
            Ok(b"INFO: Seed: 1".to_vec()),
            Ok(b"\xff\xfe garbage".to_vec()),
            Ok(b"Test unit written to data/crash-ab12".to_vec()),
        ];
        let result = scanner.scan(lines).unwrap();
        assert_eq!(result.artifacts, vec!["crash-ab12"]);
        assert!(out.windows(2).any(|w| w == b"\xff\xfe"));
    }

    #[test]
    fn byte_lines_strip_terminators_only() {
        let data: &[u8] = b"one\r\ntwo\n\xfflast";
        let lines: Vec<Vec<u8>> = byte_lines(data).map(|l| l.unwrap()).collect();
        assert_eq!(
            lines,
            vec![b"one".to_vec(), b"two".to_vec(), b"\xfflast".to_vec()]
        );
    }

    #[test]
    fn degraded_symbolizer_output_is_not_a_symbolization() {
        let device_channel = ScriptedChannel::new();
        device_channel.push_reply(ok_output(SYSLOG));
        let host_channel = ScriptedChannel::new();
        host_channel.push_reply(crate::exec::testing::failed_output("no symbols"));
        let (result, _) = scan(
            &device_channel,
            &host_channel,
            &["==9== INFO", "MS: 1 ChangeBit-", "MS: 1 ChangeBit-"],
        );
        assert!(!result.symbolized);
        // Still only one fetch attempt.
        assert_eq!(device_channel.call_count(), 1);
    }
}
