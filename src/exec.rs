//! Subprocess execution channel.
//!
//! Every interaction with the device, and the host-side symbolizer filter,
//! goes through a spawned subprocess. The channel trait is the seam that
//! lets the rest of the crate be exercised against scripted output.

use std::io;
use std::io::Write;
use std::process::{Child, Command, Output, Stdio};

/// Executes a fully-resolved argument vector, either to completion or as a
/// long-running spawned process.
pub trait CommandChannel {
    /// Run `argv` to completion with captured stdout/stderr. Stdin is
    /// redirected from null so the child can never block on the terminal.
    fn run(&self, argv: &[String]) -> io::Result<Output>;

    /// Run `argv` to completion, feeding `input` on stdin and capturing
    /// stdout/stderr.
    fn run_with_input(&self, argv: &[String], input: &[u8]) -> io::Result<Output>;

    /// Spawn `argv` without waiting. Stdin is nulled, stderr is piped so
    /// the caller may stream it; stdout is discarded. The caller must
    /// drain that pipe: dropping it closes the read end and the child
    /// dies of EPIPE on its next stderr write.
    fn spawn(&self, argv: &[String]) -> io::Result<Child>;

    /// Spawn `argv` fully detached, all stdio nulled. For children that
    /// outlive this process and whose output nobody reads.
    fn spawn_detached(&self, argv: &[String]) -> io::Result<Child>;
}

fn command(argv: &[String]) -> Command {
    assert!(!argv.is_empty());
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd
}

/// The real channel: plain `std::process` subprocesses.
#[derive(Debug, Default)]
pub struct ProcessChannel;

impl CommandChannel for ProcessChannel {
    fn run(&self, argv: &[String]) -> io::Result<Output> {
        command(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
    }

    fn run_with_input(&self, argv: &[String], input: &[u8]) -> io::Result<Output> {
        let mut child = command(argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        // The child may exit without draining stdin; a broken pipe here
        // just means it has already said everything it wanted to.
        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(input) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e),
            }
        }
        child.wait_with_output()
    }

    fn spawn(&self, argv: &[String]) -> io::Result<Child> {
        command(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
    }

    fn spawn_detached(&self, argv: &[String]) -> io::Result<Child> {
        command(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn detached_spawn_holds_no_pipes() {
        let mut child = ProcessChannel.spawn_detached(&["true".to_string()]).unwrap();
        assert!(child.stdout.is_none());
        assert!(child.stderr.is_none());
        child.wait().unwrap();
    }

    #[test]
    fn attached_spawn_pipes_stderr() {
        let mut child = ProcessChannel
            .spawn(&["sh".to_string(), "-c".to_string(), "echo oops >&2".to_string()])
            .unwrap();
        let mut stderr = Vec::new();
        child.stderr.take().unwrap().read_to_end(&mut stderr).unwrap();
        child.wait().unwrap();
        assert_eq!(stderr, b"oops\n");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted channel for tests: records every argv it sees and replays
    //! canned responses in order.

    use super::*;
    use std::cell::RefCell;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::rc::Rc;

    pub struct Script {
        pub calls: Vec<Vec<String>>,
        replies: Vec<io::Result<Output>>,
    }

    #[derive(Clone)]
    pub struct ScriptedChannel(pub Rc<RefCell<Script>>);

    pub fn ok_output(stdout: &str) -> io::Result<Output> {
        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        })
    }

    pub fn failed_output(stderr: &str) -> io::Result<Output> {
        Ok(Output {
            status: ExitStatus::from_raw(1 << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        })
    }

    impl ScriptedChannel {
        pub fn new() -> Self {
            ScriptedChannel(Rc::new(RefCell::new(Script {
                calls: Vec::new(),
                replies: Vec::new(),
            })))
        }

        /// Queue the reply for the next unanswered call.
        pub fn push_reply(&self, reply: io::Result<Output>) {
            self.0.borrow_mut().replies.push(reply);
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.0.borrow().calls.clone()
        }

        pub fn call_count(&self) -> usize {
            self.0.borrow().calls.len()
        }

        fn respond(&self, argv: &[String]) -> io::Result<Output> {
            let mut script = self.0.borrow_mut();
            script.calls.push(argv.to_vec());
            if script.replies.is_empty() {
                return ok_output("");
            }
            script.replies.remove(0)
        }
    }

    impl CommandChannel for ScriptedChannel {
        fn run(&self, argv: &[String]) -> io::Result<Output> {
            self.respond(argv)
        }

        fn run_with_input(&self, argv: &[String], _input: &[u8]) -> io::Result<Output> {
            self.respond(argv)
        }

        fn spawn(&self, _argv: &[String]) -> io::Result<Child> {
            // Attached runs need a live stderr stream the script cannot
            // fake; tests that would get here stop at a precondition.
            Err(io::Error::new(io::ErrorKind::Other, "scripted channel"))
        }

        fn spawn_detached(&self, argv: &[String]) -> io::Result<Child> {
            self.0.borrow_mut().calls.push(argv.to_vec());
            // A real no-op child; callers drop the handle right away.
            Command::new("true")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
        }
    }
}
