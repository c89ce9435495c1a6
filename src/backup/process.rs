//! Running shell commands and collecting their combined output.

use crate::backup::function_path;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use bon::Builder;
use function_name::named;
use getset::{CopyGetters, Getters};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exit code and combined stdout/stderr of one finished command.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters)]
pub struct ProcessResult {
    #[getset(get_copy = "pub")]
    exit_code: i32,
    #[getset(get = "pub")]
    output: String,
}

impl ProcessResult {
    pub fn new<S: Into<String>>(exit_code: i32, output: S) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A command line plus the environment it alone gets to see.
#[derive(Clone, Debug, Builder, Getters, CopyGetters)]
pub struct Invocation {
    #[builder(into)]
    #[getset(get = "pub")]
    command: String,
    /// Mirror output to stdout while it is produced.
    #[builder(default)]
    #[getset(get_copy = "pub")]
    echo: bool,
    #[builder(default)]
    #[getset(get = "pub")]
    env: Vec<(String, RedactedString)>,
    #[getset(get_copy = "pub")]
    timeout: Option<Duration>,
}

pub trait ProcessRunner {
    /// Run to completion. A non-zero exit code is returned as data, not as an error.
    fn run(&self, invocation: &Invocation) -> Result<ProcessResult>;
}

/// Runs commands through `sh -c` in their own process group.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShellRunner;

impl ProcessRunner for ShellRunner {
    #[named]
    fn run(&self, invocation: &Invocation) -> Result<ProcessResult> {
        debug!("Running {:?}", invocation.command());
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(invocation.command())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        for (key, value) in invocation.env() {
            command.env(key, value.inner());
        }

        let mut child = command
            .spawn()
            .map_err(Error::from)
            .with_debug_object_and_fn_name(invocation.clone(), function_path!())?;
        let pid = Pid::from_raw(child.id() as i32);

        let (event_tx, event_rx) = channel();
        if let Some(out) = child.stdout.take() {
            spawn_line_reader(out, event_tx.clone());
        }
        if let Some(err) = child.stderr.take() {
            spawn_line_reader(err, event_tx.clone());
        }
        let waiter = spawn_waiter(child, event_tx);

        let deadline = invocation.timeout().map(|timeout| Instant::now() + timeout);
        let mut output = String::new();
        let status = loop {
            let received = match deadline {
                Some(deadline) => {
                    event_rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => event_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(Event::Line(line)) => push_line(&mut output, line, invocation.echo()),
                Ok(Event::Exited(status)) => break status,
                // The waiter always reports before it hangs up.
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(std::io::Error::other("process waiter stopped"))
                }
                Err(RecvTimeoutError::Timeout) => {
                    let timeout = invocation.timeout().unwrap_or_default();
                    warn!(
                        "Killing {:?} after {}",
                        invocation.command(),
                        humantime_serde::re::humantime::format_duration(timeout)
                    );
                    kill_process_group(pid);
                    let _ = waiter.join();
                    return Err(Error::ProcessTimeout {
                        command: invocation.command().clone(),
                        timeout,
                    });
                }
            }
        };
        let _ = waiter.join();

        // Background children may keep the pipes open long after the shell exited.
        let drain_until = Instant::now() + DRAIN_GRACE;
        while let Ok(Event::Line(line)) =
            event_rx.recv_timeout(drain_until.saturating_duration_since(Instant::now()))
        {
            push_line(&mut output, line, invocation.echo());
        }

        let status = status
            .map_err(Error::from)
            .with_debug_object_and_fn_name(invocation.clone(), function_path!())?;
        Ok(ProcessResult::new(exit_code(status), output))
    }
}

/// Output left in the pipes after the shell exited is read for at most this long.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

enum Event {
    Line(String),
    Exited(std::io::Result<ExitStatus>),
}

fn push_line(output: &mut String, line: String, echo: bool) {
    if echo {
        print!("{line}");
    }
    output.push_str(&line);
}

fn spawn_line_reader<R: Read + Send + 'static>(source: R, tx: Sender<Event>) {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(Event::Line(line)).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_waiter(mut child: Child, tx: Sender<Event>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let _ = tx.send(Event::Exited(child.wait()));
    })
}

fn kill_process_group(pid: Pid) {
    if let Err(e) = killpg(pid, Signal::SIGKILL) {
        warn!("Failed to kill process group {pid}: {e}");
        let _ = kill(pid, Signal::SIGKILL);
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
