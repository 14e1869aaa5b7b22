//! Cancelable bridge between a producing token stream and the interactive
//! consumer.
//!
//! The producer (usually a blocking HTTP stream) runs on its own thread and
//! pushes into a bounded queue; the consumer interleaves a zero-timeout
//! stdin poll with dequeues so a Ctrl-C lands within one tick even while
//! the producer is blocked on the network.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::ai::TokenStream;

/// One consumer step.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamStep {
    Item((String, String)),
    Finished,
    Cancelled,
}

/// Non-blocking check whether stdin has bytes ready.
#[cfg(unix)]
pub fn poll_stdin_ready(timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd: libc::STDIN_FILENO,
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    ret > 0 && (pfd.revents & libc::POLLIN) != 0
}

/// Drain pending stdin input and report whether a cancel chord (Ctrl-C /
/// Ctrl-D) was among it.  Non-cancel bytes are discarded.
#[cfg(unix)]
pub fn check_cancel() -> bool {
    if !poll_stdin_ready(0) {
        return false;
    }
    let mut buf = [0u8; 10240];
    match std::io::stdin().read(&mut buf) {
        Ok(n) => buf[..n].iter().any(|&b| b == 0x03 || b == 0x04),
        Err(_) => false,
    }
}

pub struct CancelableStream {
    rx: mpsc::Receiver<(String, String)>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    poll_cancel: Box<dyn FnMut() -> bool + Send>,
    done: bool,
}

impl CancelableStream {
    /// Wrap `inner`, cancelling on the stdin chord.
    pub fn spawn(inner: TokenStream) -> Self {
        Self::with_poll(inner, Box::new(check_cancel))
    }

    /// Wrap `inner` with a custom cancel probe (tests inject one).
    pub fn with_poll(inner: TokenStream, poll_cancel: Box<dyn FnMut() -> bool + Send>) -> Self {
        let (tx, rx) = mpsc::sync_channel(64);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_producer = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            for item in inner {
                if stop_producer.load(Ordering::Relaxed) {
                    return;
                }
                if tx.send(item).is_err() {
                    return;
                }
            }
        });
        CancelableStream {
            rx,
            stop,
            handle: Some(handle),
            poll_cancel,
            done: false,
        }
    }

    /// Advance one step: poll for cancel, then wait briefly for the next
    /// item.  After `Finished`/`Cancelled` every further call returns
    /// `Finished`.
    pub fn next_step(&mut self) -> StreamStep {
        if self.done {
            return StreamStep::Finished;
        }
        loop {
            if (self.poll_cancel)() {
                self.stop();
                return StreamStep::Cancelled;
            }
            match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(item) => return StreamStep::Item(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.done = true;
                    return StreamStep::Finished;
                }
            }
        }
    }

    /// Ask the producer to stop and discard anything still queued.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.done = true;
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for CancelableStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Unblock a producer stuck on a full queue by draining, then let
        // the thread run out on its own; joining could wait on a blocking
        // network read.
        while self.rx.try_recv().is_ok() {}
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}
