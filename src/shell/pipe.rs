//! Internal utilities for forwarding shell output.
//!
//! Each output pipe of the live shell is drained by a dedicated thread that
//! forwards raw chunks over a channel to the thread running the current
//! invocation.

use std::io::{ErrorKind, Read};
use std::sync::mpsc::Sender;

use crate::program::StreamTag;

const CHUNK_SIZE: usize = 8192;

/// What a reader thread observed on its pipe.
#[derive(Debug)]
pub(super) enum StreamEvent {
    Data(StreamTag, Vec<u8>),
    /// End of file: the shell closed the stream (it exited or was killed).
    Closed(StreamTag),
}

/// Extracts a human-readable message from a thread panic.
///
/// The returned `&str` borrows from the panic payload, so it is valid
/// as long as the `err` reference is valid.
pub(crate) fn panic_message(err: &(dyn std::any::Any + Send)) -> &str {
    err.downcast_ref::<&str>()
        .copied()
        .or_else(|| err.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
}

/// Reads from a pipe until EOF, forwarding every chunk as it arrives.
///
/// - I/O errors stop reading; the receiver sees `Closed`, like EOF
/// - Stops early once the receiver is gone (the session was dropped)
pub(super) fn forward_pipe<R: Read>(mut pipe: R, tag: StreamTag, events: Sender<StreamEvent>) {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break, // EOF
            Ok(n) => {
                tracing::trace!(stream = %tag, bytes = n, "chunk received");
                if events.send(StreamEvent::Data(tag, buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(stream = %tag, error = %e, "I/O error, stopping read");
                break;
            }
        }
    }
    let _ = events.send(StreamEvent::Closed(tag));
}
