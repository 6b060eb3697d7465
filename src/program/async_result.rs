//! Incremental result delivery for long-running commands.
//!
//! [`AsyncResultProgram`] decouples process I/O from result consumption. The
//! shell's reading thread (the producer) assembles chunks and pushes them on
//! a bounded channel; a consumer thread owned by the invocation dispatches
//! them to the parser strictly in arrival order, stdout and stderr
//! interleaved as received.
//!
//! The end of the stream travels on the same channel as the data, so the end
//! callbacks run on the consumer thread after the last queued chunk. A second
//! channel is the termination rendezvous: it disconnects when the consumer
//! thread exits, which is a different state from "queue is empty".
//!
//! States: `Created → Streaming → Draining → Ended`. A cancellation moves
//! `Streaming → Draining` early; chunks arriving after that are dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use strum::Display;
use tracing::{debug, trace, warn};

use super::{ChunkAssembler, Interrupter, Program, StreamTag, WaitMode};
use crate::error::ShellfsError;
use crate::executable::{Executable, ExitPolicy, WriteTargets};
use crate::shell::{Signal, panic_message};

/// Receives the results of an asynchronous program.
///
/// `on_async_start` is called on the thread that runs the program; every
/// other callback is called on the invocation's consumer thread.
pub trait AsyncResultListener: Send + Sync {
    fn on_async_start(&self) {}

    fn on_partial_result(&self, data: &str);

    fn on_async_exit_code(&self, _code: i32) {}

    fn on_async_end(&self, _cancelled: bool) {}

    /// Called by the orchestrator when the invocation failed.
    fn on_exception(&self, _cause: &ShellfsError) {}
}

/// Command-specific interpretation of streamed output.
///
/// Errors (and panics) raised by these hooks are logged and swallowed; a
/// single malformed chunk never stops the stream.
pub trait AsyncParser: Send + Sync {
    fn on_parse_partial_result(
        &self,
        chunk: &str,
        listener: &dyn AsyncResultListener,
    ) -> anyhow::Result<()>;

    fn on_parse_error_partial_result(
        &self,
        _chunk: &str,
        _listener: &dyn AsyncResultListener,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_end_parse_partial_result(
        &self,
        _cancelled: bool,
        _listener: &dyn AsyncResultListener,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Forwards every stdout line to the listener and logs stderr lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineParser;

impl AsyncParser for LineParser {
    fn on_parse_partial_result(
        &self,
        chunk: &str,
        listener: &dyn AsyncResultListener,
    ) -> anyhow::Result<()> {
        for line in chunk.lines() {
            listener.on_partial_result(line);
        }
        Ok(())
    }

    fn on_parse_error_partial_result(
        &self,
        chunk: &str,
        _listener: &dyn AsyncResultListener,
    ) -> anyhow::Result<()> {
        for line in chunk.lines() {
            debug!(stream = %StreamTag::Stderr, "{}", line);
        }
        Ok(())
    }
}

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum AsyncState {
    Created,
    Streaming,
    Draining,
    Ended,
}

/// Declared capabilities of an asynchronous program.
#[derive(Debug, Clone, Copy)]
pub struct AsyncOptions {
    /// Surface only complete lines; the trailing partial line waits for the next chunk.
    pub complete_lines_only: bool,
    /// Whether `cancel()`/`end()` do anything.
    pub cancellable: bool,
    /// Skip the stderr text rules of classification.
    pub ignore_stderr_check: bool,
    pub exit_policy: ExitPolicy,
    pub wait_mode: WaitMode,
    /// Bound of the chunk channel; the producer blocks when it is full.
    pub queue_capacity: usize,
    /// How long a stopped invocation waits for the consumer thread to exit.
    pub teardown_timeout: Duration,
}

impl Default for AsyncOptions {
    fn default() -> Self {
        Self {
            complete_lines_only: true,
            cancellable: false,
            ignore_stderr_check: false,
            exit_policy: ExitPolicy::STRICT,
            wait_mode: WaitMode::Indefinite,
            queue_capacity: 256,
            teardown_timeout: Duration::from_secs(5),
        }
    }
}

enum Message {
    Chunk(StreamTag, String),
    End {
        cancelled: bool,
        exit_code: Option<i32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Cancel,
    End,
}

/// The consumer thread of one invocation and both of its channels.
struct Consumer {
    sender: SyncSender<Message>,
    handle: JoinHandle<()>,
    done: Receiver<()>,
    queued: Arc<AtomicUsize>,
}

impl Consumer {
    fn spawn(
        command: &str,
        capacity: usize,
        parser: Arc<dyn AsyncParser>,
        listener: Arc<dyn AsyncResultListener>,
    ) -> Result<Self, ShellfsError> {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let (done_tx, done) = mpsc::channel::<()>();
        let queued = Arc::new(AtomicUsize::new(0));
        let thread_queued = Arc::clone(&queued);

        let handle = thread::Builder::new()
            .name("async-consumer".to_string())
            .spawn(move || {
                // Dropped when the thread exits, unwinding included.
                let _done = done_tx;
                consume(receiver, parser.as_ref(), listener.as_ref(), &thread_queued);
            })
            .map_err(|e| {
                ShellfsError::execution(command, format!("failed to spawn consumer thread: {}", e))
            })?;

        Ok(Self {
            sender,
            handle,
            done,
            queued,
        })
    }

    fn send(&self, message: Message) {
        if matches!(message, Message::Chunk(..)) {
            self.queued.fetch_add(1, Ordering::AcqRel);
        }
        if self.sender.send(message).is_err() {
            warn!("consumer thread is gone; result dropped");
        }
    }

    /// Closes the queue and waits for the thread to exit.
    ///
    /// `None` waits without bound.
    fn finish(self, bound: Option<Duration>, command: &str) {
        let Self {
            sender,
            handle,
            done,
            queued,
        } = self;
        drop(sender);

        let exited = match bound {
            None => {
                let _ = done.recv();
                true
            }
            Some(limit) => !matches!(done.recv_timeout(limit), Err(RecvTimeoutError::Timeout)),
        };

        if exited {
            if let Err(e) = handle.join() {
                warn!(command, "consumer thread panicked: {}", panic_message(&*e));
            }
        } else {
            warn!(
                command,
                queued = queued.load(Ordering::Acquire),
                "consumer thread did not exit within {:?}; detaching it",
                bound.unwrap_or_default()
            );
        }
    }
}

fn consume(
    receiver: Receiver<Message>,
    parser: &dyn AsyncParser,
    listener: &dyn AsyncResultListener,
    queued: &AtomicUsize,
) {
    for message in receiver {
        match message {
            Message::Chunk(tag, text) => {
                queued.fetch_sub(1, Ordering::AcqRel);
                run_hook(tag, || match tag {
                    StreamTag::Stdout => parser.on_parse_partial_result(&text, listener),
                    StreamTag::Stderr => parser.on_parse_error_partial_result(&text, listener),
                });
            }
            Message::End {
                cancelled,
                exit_code,
            } => {
                run_hook(StreamTag::Stdout, || {
                    parser.on_end_parse_partial_result(cancelled, listener)
                });
                if let Some(code) = exit_code {
                    listener.on_async_exit_code(code);
                }
                listener.on_async_end(cancelled);
                return;
            }
        }
    }
}

/// Runs a parser hook, logging errors and panics instead of propagating them.
fn run_hook<F>(tag: StreamTag, hook: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(stream = %tag, "failed to parse partial result: {:#}", e),
        Err(payload) => {
            warn!(stream = %tag, "partial result parser panicked: {}", panic_message(&*payload))
        }
    }
}

struct Invocation {
    state: AsyncState,
    stop: Option<Stop>,
    stdout: ChunkAssembler,
    stderr: ChunkAssembler,
    consumer: Option<Consumer>,
}

impl Invocation {
    fn idle(state: AsyncState, complete_lines: bool) -> Self {
        Self {
            state,
            stop: None,
            stdout: ChunkAssembler::new(complete_lines),
            stderr: ChunkAssembler::new(complete_lines),
            consumer: None,
        }
    }
}

/// A program that delivers ordered partial results while the command runs.
///
/// Concrete commands compose it from an [`AsyncParser`] (what the output
/// means) and an [`AsyncResultListener`] (who receives it). The same
/// instance can be run again after it ended, which is how a relaunch
/// replays an asynchronous write.
pub struct AsyncResultProgram {
    executable: Executable,
    options: AsyncOptions,
    write_targets: Option<WriteTargets>,
    parser: Arc<dyn AsyncParser>,
    listener: Arc<dyn AsyncResultListener>,
    interrupter: Mutex<Option<Arc<dyn Interrupter>>>,
    invocation: Mutex<Invocation>,
}

impl std::fmt::Debug for AsyncResultProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResultProgram")
            .field("executable", &self.executable)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl AsyncResultProgram {
    pub fn new(
        executable: Executable,
        options: AsyncOptions,
        parser: Arc<dyn AsyncParser>,
        listener: Arc<dyn AsyncResultListener>,
    ) -> Self {
        Self {
            executable,
            write_targets: None,
            parser,
            listener,
            interrupter: Mutex::new(None),
            invocation: Mutex::new(Invocation::idle(
                AsyncState::Created,
                options.complete_lines_only,
            )),
            options,
        }
    }

    /// Declares the program a writable operation on the given paths.
    #[must_use]
    pub fn with_write_targets(mut self, targets: WriteTargets) -> Self {
        self.write_targets = Some(targets);
        self
    }

    pub fn options(&self) -> &AsyncOptions {
        &self.options
    }

    pub fn listener(&self) -> &Arc<dyn AsyncResultListener> {
        &self.listener
    }

    pub fn state(&self) -> AsyncState {
        self.lock_invocation().state
    }

    pub fn is_cancellable(&self) -> bool {
        self.options.cancellable
    }

    /// Cancels the running command.
    ///
    /// A no-op returning false unless the command is cancellable and
    /// streaming. Otherwise stops accepting new output, sends SIGTERM to the
    /// command and returns whether the interrupt was confirmed.
    pub fn cancel(&self) -> bool {
        self.stop(Stop::Cancel, Signal::Term)
    }

    /// Ends the running command with `signal` (SIGTERM by default).
    ///
    /// Unlike [`cancel`](Self::cancel), output keeps flowing until the
    /// process exits and the listener sees a normal end.
    pub fn end(&self, signal: Option<Signal>) -> bool {
        self.stop(Stop::End, signal.unwrap_or(Signal::Term))
    }

    fn stop(&self, stop: Stop, signal: Signal) -> bool {
        if !self.options.cancellable {
            debug!(command = %self.executable.id(), "ignoring stop request: not cancellable");
            return false;
        }

        {
            let mut inv = self.lock_invocation();
            if inv.state != AsyncState::Streaming || inv.stop.is_some() {
                return false;
            }
            inv.stop = Some(stop);
            if stop == Stop::Cancel {
                inv.state = AsyncState::Draining;
            }
        }

        let interrupter = self
            .interrupter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(interrupter) = interrupter else {
            return true;
        };
        match interrupter.interrupt(signal) {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(command = %self.executable.id(), "failed to deliver {}: {}", signal, e);
                false
            }
        }
    }

    fn lock_invocation(&self) -> MutexGuard<'_, Invocation> {
        self.invocation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, tag: StreamTag, chunk: &[u8]) {
        let (sender, queued, text) = {
            let mut guard = self.lock_invocation();
            let inv = &mut *guard;
            if inv.state != AsyncState::Streaming {
                trace!(stream = %tag, "dropping {} byte(s) received while {}", chunk.len(), inv.state);
                return;
            }
            let assembler = match tag {
                StreamTag::Stdout => &mut inv.stdout,
                StreamTag::Stderr => &mut inv.stderr,
            };
            let Some(text) = assembler.push(chunk) else {
                return;
            };
            let Some(consumer) = inv.consumer.as_ref() else {
                return;
            };
            (consumer.sender.clone(), Arc::clone(&consumer.queued), text)
        };

        // Sent outside the lock: a full queue must not block cancel().
        queued.fetch_add(1, Ordering::AcqRel);
        if sender.send(Message::Chunk(tag, text)).is_err() {
            queued.fetch_sub(1, Ordering::AcqRel);
            warn!(stream = %tag, "consumer thread is gone; chunk dropped");
        }
    }
}

impl Program for AsyncResultProgram {
    fn executable(&self) -> &Executable {
        &self.executable
    }

    fn exit_policy(&self) -> ExitPolicy {
        self.options.exit_policy
    }

    fn wait_mode(&self) -> WaitMode {
        self.options.wait_mode
    }

    fn ignore_stderr_check(&self) -> bool {
        self.options.ignore_stderr_check
    }

    fn capture_stdout(&self) -> bool {
        false
    }

    fn write_targets(&self) -> Option<WriteTargets> {
        self.write_targets.clone()
    }

    fn bind_interrupter(&self, interrupter: Arc<dyn Interrupter>) {
        *self
            .interrupter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(interrupter);
    }

    fn on_start(&self) -> Result<(), ShellfsError> {
        {
            let mut inv = self.lock_invocation();
            if matches!(inv.state, AsyncState::Streaming | AsyncState::Draining) {
                return Err(ShellfsError::execution(
                    self.executable.command_line(),
                    "program is already running",
                ));
            }
            let consumer = Consumer::spawn(
                self.executable.id(),
                self.options.queue_capacity,
                Arc::clone(&self.parser),
                Arc::clone(&self.listener),
            )?;
            *inv = Invocation::idle(AsyncState::Streaming, self.options.complete_lines_only);
            inv.consumer = Some(consumer);
        }
        debug!(command = %self.executable.id(), "streaming started");
        self.listener.on_async_start();
        Ok(())
    }

    fn on_stdout(&self, chunk: &[u8]) {
        self.enqueue(StreamTag::Stdout, chunk);
    }

    fn on_stderr(&self, chunk: &[u8]) {
        self.enqueue(StreamTag::Stderr, chunk);
    }

    fn on_end(&self, exit_code: Option<i32>) {
        let (consumer, trailing, cancelled, stopping) = {
            let mut guard = self.lock_invocation();
            let inv = &mut *guard;
            if !matches!(inv.state, AsyncState::Streaming | AsyncState::Draining) {
                return;
            }
            let cancelled = inv.stop == Some(Stop::Cancel);
            let mut trailing = Vec::new();
            if cancelled {
                let dropped = inv.stdout.discard() + inv.stderr.discard();
                if dropped > 0 {
                    debug!(command = %self.executable.id(), "discarding {} byte(s) of partial line", dropped);
                }
            } else {
                if let Some(text) = inv.stdout.flush() {
                    trailing.push((StreamTag::Stdout, text));
                }
                if let Some(text) = inv.stderr.flush() {
                    trailing.push((StreamTag::Stderr, text));
                }
            }
            inv.state = AsyncState::Draining;
            (inv.consumer.take(), trailing, cancelled, inv.stop.is_some())
        };

        if let Some(consumer) = consumer {
            for (tag, text) in trailing {
                consumer.send(Message::Chunk(tag, text));
            }
            consumer.send(Message::End {
                cancelled,
                exit_code,
            });
            let bound = stopping.then_some(self.options.teardown_timeout);
            consumer.finish(bound, self.executable.id());
        }

        self.lock_invocation().state = AsyncState::Ended;
        *self
            .interrupter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        debug!(command = %self.executable.id(), cancelled, "streaming ended");
    }

    fn on_exception(&self, cause: &ShellfsError) {
        self.listener.on_exception(cause);
    }

    fn is_cancelled(&self) -> bool {
        self.lock_invocation().stop == Some(Stop::Cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl RecordingListener {
        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn wait_for_end(&self) -> Vec<String> {
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                let events = self.events();
                if events.iter().any(|e| e.starts_with("end:")) || Instant::now() > deadline {
                    return events;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl AsyncResultListener for RecordingListener {
        fn on_async_start(&self) {
            self.push("start".to_string());
        }

        fn on_partial_result(&self, data: &str) {
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            self.push(format!("partial:{}", data));
        }

        fn on_async_exit_code(&self, code: i32) {
            self.push(format!("exit:{}", code));
        }

        fn on_async_end(&self, cancelled: bool) {
            self.push(format!("end:{}", cancelled));
        }
    }

    /// Tags each line with the stream it came from.
    struct TaggingParser;

    impl AsyncParser for TaggingParser {
        fn on_parse_partial_result(
            &self,
            chunk: &str,
            listener: &dyn AsyncResultListener,
        ) -> anyhow::Result<()> {
            for line in chunk.lines() {
                listener.on_partial_result(&format!("out:{}", line));
            }
            Ok(())
        }

        fn on_parse_error_partial_result(
            &self,
            chunk: &str,
            listener: &dyn AsyncResultListener,
        ) -> anyhow::Result<()> {
            for line in chunk.lines() {
                listener.on_partial_result(&format!("err:{}", line));
            }
            Ok(())
        }
    }

    /// Fails on "bad" lines and panics on "boom" lines.
    struct FlakyParser;

    impl AsyncParser for FlakyParser {
        fn on_parse_partial_result(
            &self,
            chunk: &str,
            listener: &dyn AsyncResultListener,
        ) -> anyhow::Result<()> {
            for line in chunk.lines() {
                match line {
                    "bad" => anyhow::bail!("malformed line"),
                    "boom" => panic!("parser exploded"),
                    _ => listener.on_partial_result(line),
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockInterrupter {
        signals: Mutex<Vec<Signal>>,
    }

    impl Interrupter for MockInterrupter {
        fn interrupt(&self, signal: Signal) -> Result<bool, ShellfsError> {
            self.signals.lock().unwrap().push(signal);
            Ok(true)
        }
    }

    fn program(
        options: AsyncOptions,
        parser: Arc<dyn AsyncParser>,
        listener: Arc<RecordingListener>,
    ) -> AsyncResultProgram {
        AsyncResultProgram::new(Executable::raw("test", "stream"), options, parser, listener)
    }

    fn cancellable() -> AsyncOptions {
        AsyncOptions {
            cancellable: true,
            exit_policy: ExitPolicy::CANCELLATION,
            ..AsyncOptions::default()
        }
    }

    #[test]
    fn complete_lines_are_delivered_in_order_before_end() {
        let listener = Arc::new(RecordingListener::default());
        let p = program(AsyncOptions::default(), Arc::new(LineParser), listener.clone());

        p.on_start().unwrap();
        assert_eq!(p.state(), AsyncState::Streaming);
        p.on_stdout(b"abc\ndef");
        p.on_stdout(b"ghi\n");
        p.on_end(Some(0));

        assert_eq!(p.state(), AsyncState::Ended);
        assert_eq!(
            listener.events(),
            vec!["start", "partial:abc", "partial:defghi", "exit:0", "end:false"]
        );
    }

    #[test]
    fn trailing_partial_line_is_flushed_before_end() {
        let listener = Arc::new(RecordingListener::default());
        let p = program(AsyncOptions::default(), Arc::new(LineParser), listener.clone());

        p.on_start().unwrap();
        p.on_stdout(b"one\ntw");
        p.on_stdout(b"o");
        p.on_end(Some(0));

        assert_eq!(
            listener.events(),
            vec!["start", "partial:one", "partial:two", "exit:0", "end:false"]
        );
    }

    #[test]
    fn stdout_and_stderr_are_interleaved_as_received() {
        let listener = Arc::new(RecordingListener::default());
        let p = program(AsyncOptions::default(), Arc::new(TaggingParser), listener.clone());

        p.on_start().unwrap();
        p.on_stdout(b"a\n");
        p.on_stderr(b"warning\n");
        p.on_stdout(b"b\n");
        p.on_end(None);

        assert_eq!(
            listener.events(),
            vec!["start", "partial:out:a", "partial:err:warning", "partial:out:b", "end:false"]
        );
    }

    #[test]
    fn raw_mode_delivers_chunks_unsplit() {
        let listener = Arc::new(RecordingListener::default());
        let options = AsyncOptions {
            complete_lines_only: false,
            ..AsyncOptions::default()
        };
        let p = program(options, Arc::new(TaggingParser), listener.clone());

        p.on_start().unwrap();
        p.on_stdout(b"40%");
        p.on_end(Some(0));

        assert_eq!(listener.events(), vec!["start", "partial:out:40%", "exit:0", "end:false"]);
    }

    #[test]
    fn cancel_on_non_cancellable_is_a_noop() {
        let listener = Arc::new(RecordingListener::default());
        let p = program(AsyncOptions::default(), Arc::new(LineParser), listener.clone());
        let interrupter = Arc::new(MockInterrupter::default());

        p.on_start().unwrap();
        p.bind_interrupter(interrupter.clone());
        assert!(!p.cancel());
        assert!(!p.end(Some(Signal::Kill)));
        assert_eq!(p.state(), AsyncState::Streaming);
        assert!(!p.is_cancelled());
        assert!(interrupter.signals.lock().unwrap().is_empty());

        p.on_stdout(b"still delivered\n");
        p.on_end(Some(0));
        assert!(listener.events().contains(&"partial:still delivered".to_string()));
    }

    #[test]
    fn cancel_before_start_returns_false() {
        let listener = Arc::new(RecordingListener::default());
        let p = program(cancellable(), Arc::new(LineParser), listener);
        assert!(!p.cancel());
        assert_eq!(p.state(), AsyncState::Created);
    }

    #[test]
    fn cancel_stops_intake_and_reports_cancelled_end() {
        let listener = Arc::new(RecordingListener::default());
        let p = program(cancellable(), Arc::new(LineParser), listener.clone());
        let interrupter = Arc::new(MockInterrupter::default());

        p.on_start().unwrap();
        p.bind_interrupter(interrupter.clone());
        p.on_stdout(b"before\npartial");
        assert!(p.cancel());
        assert_eq!(p.state(), AsyncState::Draining);
        assert!(p.is_cancelled());
        assert!(!p.cancel(), "second cancel has nothing to do");

        p.on_stdout(b"after\n");
        p.on_end(Some(143));

        let events = listener.wait_for_end();
        assert_eq!(events, vec!["start", "partial:before", "exit:143", "end:true"]);
        assert_eq!(*interrupter.signals.lock().unwrap(), vec![Signal::Term]);
    }

    #[test]
    fn end_requests_signal_and_keeps_output() {
        let listener = Arc::new(RecordingListener::default());
        let p = program(cancellable(), Arc::new(LineParser), listener.clone());
        let interrupter = Arc::new(MockInterrupter::default());

        p.on_start().unwrap();
        p.bind_interrupter(interrupter.clone());
        assert!(p.end(Some(Signal::Int)));
        assert_eq!(p.state(), AsyncState::Streaming);
        p.on_stdout(b"late line\n");
        p.on_end(Some(130));

        let events = listener.wait_for_end();
        assert_eq!(events, vec!["start", "partial:late line", "exit:130", "end:false"]);
        assert_eq!(*interrupter.signals.lock().unwrap(), vec![Signal::Int]);
        assert!(!p.is_cancelled());
    }

    #[test]
    fn parser_failures_do_not_stop_the_stream() {
        let listener = Arc::new(RecordingListener::default());
        let p = program(AsyncOptions::default(), Arc::new(FlakyParser), listener.clone());

        p.on_start().unwrap();
        p.on_stdout(b"good\n");
        p.on_stdout(b"bad\n");
        p.on_stdout(b"boom\n");
        p.on_stdout(b"fine\n");
        p.on_end(Some(0));

        assert_eq!(
            listener.events(),
            vec!["start", "partial:good", "partial:fine", "exit:0", "end:false"]
        );
    }

    #[test]
    fn end_is_last_for_many_small_chunks_with_tiny_queue() {
        let listener = Arc::new(RecordingListener::default());
        let options = AsyncOptions {
            queue_capacity: 1,
            ..AsyncOptions::default()
        };
        let p = program(options, Arc::new(LineParser), listener.clone());

        let mut input = String::new();
        for i in 0..300 {
            input.push_str(&format!("line-{}\n", i));
        }

        p.on_start().unwrap();
        for (i, chunk) in input.as_bytes().chunks(7).enumerate() {
            if i % 2 == 0 {
                p.on_stdout(chunk);
            } else {
                // uneven producer pacing
                thread::yield_now();
                p.on_stdout(chunk);
            }
        }
        p.on_end(Some(0));

        let events = listener.events();
        assert_eq!(events.first().map(String::as_str), Some("start"));
        assert_eq!(events.last().map(String::as_str), Some("end:false"));
        let lines: Vec<String> = events
            .iter()
            .filter_map(|e| e.strip_prefix("partial:"))
            .map(str::to_string)
            .collect();
        let expected: Vec<String> = (0..300).map(|i| format!("line-{}", i)).collect();
        assert_eq!(lines, expected);
    }

    #[test]
    fn bounded_teardown_keeps_end_after_partials() {
        let listener = Arc::new(RecordingListener::slow(Duration::from_millis(20)));
        let options = AsyncOptions {
            teardown_timeout: Duration::from_millis(1),
            ..cancellable()
        };
        let p = program(options, Arc::new(LineParser), listener.clone());

        p.on_start().unwrap();
        p.on_stdout(b"a\nb\nc\nd\n");
        assert!(p.cancel());
        p.on_end(Some(143));
        assert_eq!(p.state(), AsyncState::Ended);

        let events = listener.wait_for_end();
        assert_eq!(
            events,
            vec!["start", "partial:a", "partial:b", "partial:c", "partial:d", "exit:143", "end:true"]
        );
    }

    #[test]
    fn program_can_run_again_after_end() {
        let listener = Arc::new(RecordingListener::default());
        let p = program(AsyncOptions::default(), Arc::new(LineParser), listener.clone());

        p.on_start().unwrap();
        p.on_stdout(b"first\n");
        p.on_end(Some(0));
        p.on_start().unwrap();
        p.on_stdout(b"second\n");
        p.on_end(Some(0));

        assert_eq!(
            listener.events(),
            vec![
                "start",
                "partial:first",
                "exit:0",
                "end:false",
                "start",
                "partial:second",
                "exit:0",
                "end:false"
            ]
        );
    }

    #[test]
    fn starting_twice_is_rejected() {
        let listener = Arc::new(RecordingListener::default());
        let p = program(AsyncOptions::default(), Arc::new(LineParser), listener);
        p.on_start().unwrap();
        assert!(p.on_start().is_err());
        p.on_end(Some(0));
    }

    #[test]
    fn end_without_start_is_ignored() {
        let listener = Arc::new(RecordingListener::default());
        let p = program(AsyncOptions::default(), Arc::new(LineParser), listener.clone());
        p.on_end(Some(0));
        assert_eq!(p.state(), AsyncState::Created);
        assert!(listener.events().is_empty());
    }
}
