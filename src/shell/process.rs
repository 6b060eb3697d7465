//! Live shell session executor.
//!
//! This module provides [`ProcessShell`], which keeps one long-lived `sh`
//! process and writes each command line to its stdin. Every invocation is
//! framed with unique markers on both output streams so that the end of the
//! command and its exit status are detected without closing the shell:
//!
//! ```text
//! echo '<start>'; echo '<start>' >&2
//! { <command line>
//! <stdin payload, if any>
//! } </dev/null
//! echo "<end> $?"; echo '<end>' >&2
//! ```

use std::io::{self, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use which::which;

use super::pipe::{StreamEvent, forward_pipe, panic_message};
use super::signal::{ShellInterrupter, Signal};
use super::{RawOutcome, ShellExecutor};
use crate::error::ShellfsError;
use crate::privilege::{PrivilegeMethod, running_as_root};
use crate::program::{Interrupter, Program, StreamTag, WaitMode};

/// Lower bound for the startup handshake, which may include an escalation.
const HANDSHAKE_MIN: Duration = Duration::from_secs(5);

/// Exit status reported for a command stopped because it wrote to stderr
/// (128 + SIGTERM).
pub const EXIT_STOPPED_ON_STDERR: i32 = 143;

fn marker(kind: &str) -> String {
    format!("__SHELLFS_{}_{}__", kind, Uuid::new_v4().simple())
}

/// Splits one output stream of an invocation into its payload.
///
/// Everything before the start marker line is noise and dropped. Payload
/// bytes are released as soon as they cannot be the beginning of the end
/// marker; the end marker line completes the frame.
#[derive(Debug)]
struct StreamFrame {
    start: Vec<u8>,
    end: Vec<u8>,
    started: bool,
    trailer: Option<String>,
    buf: Vec<u8>,
}

impl StreamFrame {
    fn new(start: &str, end: &str) -> Self {
        let mut start_line = start.as_bytes().to_vec();
        start_line.push(b'\n');
        Self {
            start: start_line,
            end: end.as_bytes().to_vec(),
            started: false,
            trailer: None,
            buf: Vec::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.trailer.is_some()
    }

    /// Text that followed the end marker on its line.
    fn trailer(&self) -> Option<&str> {
        self.trailer.as_deref()
    }

    /// Feeds a chunk, returning the payload bytes it released.
    fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.is_complete() {
            return Vec::new();
        }
        self.buf.extend_from_slice(chunk);

        if !self.started {
            match find(&self.buf, &self.start) {
                Some(pos) => {
                    self.buf.drain(..pos + self.start.len());
                    self.started = true;
                }
                None => {
                    let keep = self.start.len().saturating_sub(1).min(self.buf.len());
                    let drop_len = self.buf.len() - keep;
                    self.buf.drain(..drop_len);
                    return Vec::new();
                }
            }
        }

        if let Some(pos) = find(&self.buf, &self.end) {
            let after = pos + self.end.len();
            let Some(newline) = self.buf[after..].iter().position(|&b| b == b'\n') else {
                // marker seen, trailer line still incomplete
                return self.buf.drain(..pos).collect();
            };
            let trailer = String::from_utf8_lossy(&self.buf[after..after + newline])
                .trim()
                .to_string();
            let payload = self.buf[..pos].to_vec();
            self.buf.clear();
            self.trailer = Some(trailer);
            return payload;
        }

        let hold = partial_suffix(&self.buf, &self.end);
        let ready = self.buf.len() - hold;
        self.buf.drain(..ready).collect()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest suffix of `buf` that is a proper prefix of `marker`.
fn partial_suffix(buf: &[u8], marker: &[u8]) -> usize {
    let max = buf.len().min(marker.len().saturating_sub(1));
    (1..=max)
        .rev()
        .find(|&k| buf.ends_with(&marker[..k]))
        .unwrap_or(0)
}

/// Kills a shell that failed to start and joins its reader threads.
fn cleanup_child_process<I>(child: &mut Child, handles: I)
where
    I: IntoIterator<Item = JoinHandle<()>>,
{
    let pid = child.id();
    if let Err(e) = child.kill() {
        debug!(pid = pid, "kill returned error (process may have already exited): {}", e);
    }
    if let Err(e) = child.wait() {
        warn!(pid = pid, "failed to wait for shell process after kill: {}", e);
    }
    for handle in handles {
        if let Err(e) = handle.join() {
            warn!("reader thread panicked during cleanup: {}", panic_message(&*e));
        }
    }
}

/// One running shell process.
struct Session {
    child: Child,
    stdin: Option<ChildStdin>,
    events: Receiver<StreamEvent>,
    interrupter: Arc<ShellInterrupter>,
    /// Cleared when an invocation was abandoned before its frame completed.
    reusable: bool,
}

impl Session {
    fn spawn(
        shell: &str,
        privilege: Option<PrivilegeMethod>,
        timeout: Duration,
    ) -> Result<Self, ShellfsError> {
        let (program, args) = match privilege {
            Some(method) if !running_as_root() => method.wrap_shell(shell),
            _ => (shell, Vec::new()),
        };
        let path = which(program).map_err(|e| ShellfsError::CommandNotFound {
            command: program.to_string(),
            detail: e.to_string(),
        })?;
        trace!("shell found: {}: {}", program, path.to_string_lossy());

        let mut child = Command::new(&path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ShellfsError::CommandNotFound {
                command: program.to_string(),
                detail: format!("failed to spawn shell: {}", e),
            })?;
        debug!(pid = child.id(), "spawned shell: {} {:?}", program, args);

        let stdin = child.stdin.take();
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let (Some(stdin), Some(stdout_pipe), Some(stderr_pipe)) = (stdin, stdout_pipe, stderr_pipe)
        else {
            cleanup_child_process(&mut child, []);
            return Err(ShellfsError::execution(program, "shell pipes were not captured"));
        };

        let (tx, events) = mpsc::channel();
        let stdout_tx = tx.clone();
        let stdout_handle = match thread::Builder::new()
            .name("stdout-reader".to_string())
            .spawn(move || forward_pipe(stdout_pipe, StreamTag::Stdout, stdout_tx))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, []);
                return Err(ShellfsError::execution(
                    program,
                    format!("failed to spawn stdout reader thread: {}", e),
                ));
            }
        };
        if let Err(e) = thread::Builder::new()
            .name("stderr-reader".to_string())
            .spawn(move || forward_pipe(stderr_pipe, StreamTag::Stderr, tx))
        {
            cleanup_child_process(&mut child, [stdout_handle]);
            return Err(ShellfsError::execution(
                program,
                format!("failed to spawn stderr reader thread: {}", e),
            ));
        }
        // Readers exit on EOF; they are not joined so that an orphaned
        // grandchild holding a pipe cannot block session teardown.
        drop(stdout_handle);

        let mut session = Self {
            child,
            stdin: Some(stdin),
            events,
            interrupter: Arc::new(ShellInterrupter::new(privilege)),
            reusable: true,
        };
        let pid = session.handshake(program, timeout.max(HANDSHAKE_MIN))?;
        session.interrupter.set_shell_pid(pid);
        info!(pid, privilege = ?privilege, "shell session ready");
        Ok(session)
    }

    /// Learns the pid of the inner shell, proving it accepts commands.
    fn handshake(&mut self, program: &str, timeout: Duration) -> Result<u32, ShellfsError> {
        let ready = marker("READY");
        self.write(format!("echo \"{} $$\"\n", ready).as_bytes())
            .map_err(|e| ShellfsError::execution(program, format!("shell rejected input: {}", e)))?;

        let deadline = Instant::now() + timeout;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            if let Some(pos) = find(&stdout, ready.as_bytes()) {
                let rest = &stdout[pos + ready.len()..];
                if let Some(newline) = rest.iter().position(|&b| b == b'\n') {
                    let pid = String::from_utf8_lossy(&rest[..newline]).trim().parse::<u32>();
                    return pid.map_err(|e| {
                        ShellfsError::execution(program, format!("unexpected handshake reply: {}", e))
                    });
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(StreamEvent::Data(StreamTag::Stdout, data)) => stdout.extend_from_slice(&data),
                Ok(StreamEvent::Data(StreamTag::Stderr, data)) => stderr.extend_from_slice(&data),
                Ok(StreamEvent::Closed(_)) | Err(RecvTimeoutError::Disconnected) => {
                    let reason = String::from_utf8_lossy(&stderr);
                    let reason = reason.trim();
                    return Err(ShellfsError::execution(
                        program,
                        if reason.is_empty() {
                            "shell exited during startup".to_string()
                        } else {
                            format!("shell exited during startup: {}", reason)
                        },
                    ));
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ShellfsError::OperationTimeout {
                        command: program.to_string(),
                        timeout,
                    });
                }
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "shell stdin is closed"))?;
        stdin.write_all(bytes)
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Writes the framed command and pumps output until both frames complete.
    fn run(&mut self, program: &dyn Program, timeout: Duration) -> Result<RawOutcome, ShellfsError> {
        let command = program.executable().command_line();
        let start = marker("START");
        let end = marker("END");

        let io_error = |e: io::Error| ShellfsError::execution(&command, format!("failed to write to shell: {}", e));
        self.write(format!("echo '{start}'; echo '{start}' >&2\n{{ {command}\n").as_bytes())
            .map_err(io_error)?;
        match self.stdin.as_mut() {
            Some(stdin) => program.write_stdin(stdin).map_err(io_error)?,
            None => return Err(io_error(io::Error::from(io::ErrorKind::BrokenPipe))),
        }
        self.write(format!("\n}} </dev/null\necho \"{end} $?\"; echo '{end}' >&2\n").as_bytes())
            .map_err(io_error)?;
        if let Some(stdin) = self.stdin.as_mut() {
            stdin.flush().map_err(io_error)?;
        }
        trace!(command = %command, "command written");

        let mut stdout_frame = StreamFrame::new(&start, &end);
        let mut stderr_frame = StreamFrame::new(&start, &end);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut timer = Instant::now();

        while !(stdout_frame.is_complete() && stderr_frame.is_complete()) {
            let event = match program.wait_mode() {
                WaitMode::Indefinite => self.events.recv().map_err(|_| {
                    ShellfsError::execution(&command, "shell output channel closed")
                })?,
                WaitMode::Bounded { .. } => {
                    let remaining = timeout.saturating_sub(timer.elapsed());
                    match self.events.recv_timeout(remaining) {
                        Ok(event) => event,
                        Err(RecvTimeoutError::Timeout) => {
                            return Err(ShellfsError::OperationTimeout {
                                command: command.clone(),
                                timeout,
                            });
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(ShellfsError::execution(&command, "shell output channel closed"));
                        }
                    }
                }
            };

            match event {
                StreamEvent::Data(tag, data) => {
                    if matches!(program.wait_mode(), WaitMode::Bounded { reset_on_data: true }) {
                        timer = Instant::now();
                    }
                    match tag {
                        StreamTag::Stdout => {
                            let payload = stdout_frame.feed(&data);
                            if payload.is_empty() {
                                continue;
                            }
                            program.on_stdout(&payload);
                            if program.capture_stdout() {
                                stdout.extend_from_slice(&payload);
                            }
                        }
                        StreamTag::Stderr => {
                            let payload = stderr_frame.feed(&data);
                            if payload.is_empty() {
                                continue;
                            }
                            program.on_stderr(&payload);
                            stderr.extend_from_slice(&payload);
                            if program.exit_on_stderr() {
                                return Ok(self.stop_on_stderr(&command, stdout, stderr));
                            }
                        }
                    }
                }
                StreamEvent::Closed(tag) => {
                    return Err(ShellfsError::execution(
                        &command,
                        format!("shell closed {} before the command completed", tag),
                    ));
                }
            }
        }

        let trailer = stdout_frame.trailer().unwrap_or_default();
        let exit_code = trailer.parse::<i32>().map_err(|e| {
            ShellfsError::execution(&command, format!("unreadable exit status {:?}: {}", trailer, e))
        })?;
        trace!(command = %command, exit_code, "command completed");

        Ok(RawOutcome {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Stops waiting for a command that wrote to stderr.
    ///
    /// The rest of the frame is never read, so the session is not reused:
    /// the shell may still be running later commands of the same line.
    fn stop_on_stderr(&mut self, command: &str, stdout: Vec<u8>, stderr: Vec<u8>) -> RawOutcome {
        self.reusable = false;
        match self.interrupter.interrupt(Signal::Term) {
            Ok(signalled) => debug!(command = %command, signalled, "stderr received; command stopped"),
            Err(e) => warn!(command = %command, "failed to interrupt: {}", e),
        }
        RawOutcome {
            exit_code: EXIT_STOPPED_ON_STDERR,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }
    }

    /// Kills whatever the session is running, then the session itself.
    fn abort(self) {
        if let Err(e) = self.interrupter.interrupt(Signal::Kill) {
            debug!("failed to kill running command: {}", e);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.interrupter.clear();
        // closing stdin lets an idle shell exit on its own
        drop(self.stdin.take());
        let pid = self.child.id();
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                debug!(pid, "kill returned error (shell may have already exited): {}", e);
            }
        }
        if let Err(e) = self.child.wait() {
            warn!(pid, "failed to wait for shell process: {}", e);
        }
        debug!(pid, "shell session closed");
    }
}

/// Shell executor backed by a live `sh` process.
///
/// Invocations on one `ProcessShell` are serialized: the session runs one
/// command at a time. A session that timed out or died is discarded and a
/// new one is spawned lazily by the next invocation.
///
/// When `dry_run` is true, command lines are logged but not executed, and
/// `run()` reports exit code 0 with empty output.
pub struct ProcessShell {
    name: String,
    shell: String,
    privilege: Option<PrivilegeMethod>,
    timeout: Duration,
    dry_run: bool,
    session: Mutex<Option<Session>>,
}

impl ProcessShell {
    /// Creates an unprivileged shell.
    pub fn new(shell: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: "sh".to_string(),
            shell: shell.into(),
            privilege: None,
            timeout,
            dry_run: false,
            session: Mutex::new(None),
        }
    }

    /// Creates a shell elevated with `method`.
    pub fn elevated(shell: impl Into<String>, method: PrivilegeMethod, timeout: Duration) -> Self {
        Self {
            name: format!("{}-sh", method),
            privilege: Some(method),
            ..Self::new(shell, timeout)
        }
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Returns the bounded-wait timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the pid of the inner shell, if a session is live.
    pub fn session_pid(&self) -> Option<u32> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|s| s.interrupter.shell_pid())
    }

    /// Closes the live session, if any.
    pub fn close(&self) {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl ShellExecutor for ProcessShell {
    fn name(&self) -> &str {
        &self.name
    }

    fn privilege(&self) -> Option<PrivilegeMethod> {
        self.privilege
    }

    fn run(&self, program: &dyn Program) -> Result<RawOutcome, ShellfsError> {
        if self.dry_run {
            info!(shell = %self.name, "dry run: {}", program.executable().command_line());
            return Ok(RawOutcome::default());
        }

        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let mut session = match guard.take() {
            Some(mut session) => {
                if session.is_alive() {
                    session
                } else {
                    debug!(shell = %self.name, "shell session died; respawning");
                    drop(session);
                    Session::spawn(&self.shell, self.privilege, self.timeout)?
                }
            }
            None => Session::spawn(&self.shell, self.privilege, self.timeout)?,
        };

        let interrupter: Arc<dyn Interrupter> = session.interrupter.clone();
        program.bind_interrupter(interrupter);

        match session.run(program, self.timeout) {
            Ok(outcome) => {
                if session.reusable {
                    *guard = Some(session);
                } else {
                    debug!(shell = %self.name, "discarding interrupted shell session");
                    session.abort();
                }
                Ok(outcome)
            }
            Err(e) => {
                warn!(shell = %self.name, "discarding shell session: {}", e);
                session.abort();
                Err(e)
            }
        }
    }
}
