// SPDX-License-Identifier: Apache-2.0

//! Streaming line reader over stdin, a named pipe, or a tail-followed
//! regular file.
//!
//! Architecture:
//! - A worker runs on a dedicated OS thread, owns the open handle, and does
//!   blocking reads so file I/O never lands on the async runtime.
//! - A control task owns the reader state machine. It forwards worker events
//!   to the external channel and serves `Reset` (reopen, for log rotation)
//!   and `Close` by swapping or stopping the worker. The external events
//!   channel is preserved across resets.
//!
//! A blocked read cannot be interrupted by dropping the handle from another
//! thread, so each source kind has its own wakeup: tail workers poll a stop
//! flag on the EOF sleep, pipe workers are woken by writing one newline into
//! the FIFO through a cloned handle, and stdin workers by closing the
//! descriptor.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};

/// Read size for all sources.
const READ_CHUNK: usize = 2048;

/// Tail mode sleeps this long after reading past EOF before retrying.
const EOF_POLL: Duration = Duration::from_millis(200);

/// Bound on waiting for a signalled worker to acknowledge its stop.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("error reading {path}: {source}")]
    Io { path: String, source: io::Error },

    #[error("refusing to read log data from a terminal")]
    Terminal,

    #[error("{0} is not a supported input type")]
    Unsupported(String),
}

impl ReaderError {
    fn io(path: &str, source: io::Error) -> ReaderError {
        ReaderError::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// Messages on the reader's external event channel. Lines are raw bytes,
/// exactly as read from the source; nothing upstream of the parser assumes
/// UTF-8.
pub enum ReadEvent {
    Line(Vec<u8>),
    /// Non-fatal: reopening after a rotation reset failed. The reader stays
    /// up but reads nothing further until it is closed.
    Error(ReaderError),
    /// Exactly one per reader lifetime. Carries the read failure that ended
    /// input, if any.
    Closed(Option<ReaderError>),
}

enum Control {
    Reset,
    Close,
}

enum WorkerEvent {
    Line(Vec<u8>),
    Closed(Option<ReaderError>),
}

#[derive(Clone)]
enum Source {
    Stdin,
    Pipe(PathBuf),
    Tail(PathBuf),
}

impl Source {
    fn detect(path: &str) -> Result<Source, ReaderError> {
        if path == "-" {
            // Data must be piped in; an interactive terminal is a
            // misconfiguration, not a log source.
            if unsafe { libc::isatty(libc::STDIN_FILENO) } == 1 {
                return Err(ReaderError::Terminal);
            }
            return Ok(Source::Stdin);
        }

        let meta = std::fs::metadata(path).map_err(|e| ReaderError::io(path, e))?;
        let file_type = meta.file_type();

        if file_type.is_fifo() {
            Ok(Source::Pipe(PathBuf::from(path)))
        } else if file_type.is_file() {
            Ok(Source::Tail(PathBuf::from(path)))
        } else {
            Err(ReaderError::Unsupported(path.to_string()))
        }
    }
}

/// Cheap-clone control side of a [`LineReader`].
#[derive(Clone)]
pub struct ReaderHandle {
    control_tx: BoundedSender<Control>,
}

impl ReaderHandle {
    /// Request a reopen of the input, used on log rotation.
    pub async fn reset(&self) {
        let _ = self.control_tx.send(Control::Reset).await;
    }

    /// Request a graceful shutdown; the event channel will deliver any
    /// remaining lines followed by one `Closed` event.
    pub async fn close(&self) {
        let _ = self.control_tx.send(Control::Close).await;
    }
}

pub struct LineReader {
    handle: ReaderHandle,
    events: BoundedReceiver<ReadEvent>,
}

impl LineReader {
    /// Stat the path and start the matching source worker. Must be called
    /// from within a tokio runtime. Open failures fail construction.
    pub fn open(path: &str) -> Result<LineReader, ReaderError> {
        let source = Source::detect(path)?;
        let worker = Worker::spawn(&source)?;

        let (events_tx, events_rx) = bounded(EVENT_CHANNEL_SIZE);
        let (control_tx, control_rx) = bounded(4);

        tokio::spawn(control_loop(source, worker, events_tx, control_rx));

        Ok(LineReader {
            handle: ReaderHandle { control_tx },
            events: events_rx,
        })
    }

    pub fn handle(&self) -> ReaderHandle {
        self.handle.clone()
    }

    pub fn events(&mut self) -> &mut BoundedReceiver<ReadEvent> {
        &mut self.events
    }

    pub fn split(self) -> (ReaderHandle, BoundedReceiver<ReadEvent>) {
        (self.handle, self.events)
    }
}

/// How a stopping worker gets unblocked from its read.
enum Waker {
    /// Tail workers observe the stop flag on the EOF-poll wakeup.
    Poll,
    /// Write one newline into the FIFO through a cloned handle.
    Pipe(File),
    /// Close descriptor 0 out from under the blocked read.
    Stdin,
}

struct Worker {
    events: BoundedReceiver<WorkerEvent>,
    stop: Arc<AtomicBool>,
    waker: Waker,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn spawn(source: &Source) -> Result<Worker, ReaderError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded(EVENT_CHANNEL_SIZE);

        let (waker, thread) = match source {
            Source::Stdin => {
                let flag = stop.clone();
                let thread = thread::spawn(move || read_stdin(tx, flag));
                (Waker::Stdin, thread)
            }
            Source::Pipe(path) => {
                // Open read+write so open() does not block waiting for a
                // writer and the reader survives all writers closing.
                let display = path.display().to_string();
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|e| ReaderError::io(&display, e))?;
                let wake = file.try_clone().map_err(|e| ReaderError::io(&display, e))?;

                let flag = stop.clone();
                let thread = thread::spawn(move || read_pipe(file, display, tx, flag));
                (Waker::Pipe(wake), thread)
            }
            Source::Tail(path) => {
                let display = path.display().to_string();
                let file = File::open(path).map_err(|e| ReaderError::io(&display, e))?;

                let flag = stop.clone();
                let thread = thread::spawn(move || read_tail(file, display, tx, flag));
                (Waker::Poll, thread)
            }
        };

        Ok(Worker {
            events: rx,
            stop,
            waker,
            thread,
        })
    }

    fn signal_stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        match &mut self.waker {
            Waker::Poll => {}
            Waker::Pipe(wake) => {
                let _ = wake.write_all(b"\n");
            }
            Waker::Stdin => unsafe {
                libc::close(libc::STDIN_FILENO);
            },
        }
    }
}

/// What the control loop woke up for.
enum Wakeup {
    Worker(Option<WorkerEvent>),
    Control(Option<Control>),
}

async fn control_loop(
    source: Source,
    worker: Worker,
    events_tx: BoundedSender<ReadEvent>,
    mut control_rx: BoundedReceiver<Control>,
) {
    let mut worker = Some(worker);

    loop {
        let wakeup = match worker.as_mut() {
            Some(w) => {
                tokio::select! {
                    ev = w.events.next() => Wakeup::Worker(ev),
                    ctl = control_rx.next() => Wakeup::Control(ctl),
                }
            }
            None => {
                // A reset reopen failed earlier; nothing left to read.
                Wakeup::Control(control_rx.next().await)
            }
        };

        match wakeup {
            Wakeup::Worker(Some(WorkerEvent::Line(line))) => {
                if events_tx.send(ReadEvent::Line(line)).await.is_err() {
                    return;
                }
            }
            Wakeup::Worker(ev) => {
                // Input ended on its own: EOF, or a read error
                let err = match ev {
                    Some(WorkerEvent::Closed(e)) => e,
                    _ => None,
                };
                join_worker(worker.take());
                let _ = events_tx.send(ReadEvent::Closed(err)).await;
                return;
            }
            Wakeup::Control(Some(Control::Reset)) => {
                if matches!(source, Source::Stdin) {
                    debug!("reset ignored for stdin input");
                    continue;
                }

                let Some(w) = worker.take() else {
                    debug!("reset ignored, input is gone");
                    continue;
                };
                stop_worker(w, &events_tx).await;

                // Reopen the source; the external events channel stays up
                // either way.
                let src = source.clone();
                match tokio::task::spawn_blocking(move || Worker::spawn(&src)).await {
                    Ok(Ok(fresh)) => worker = Some(fresh),
                    Ok(Err(e)) => {
                        warn!(error = %e, "failed to reopen input after reset");
                        let _ = events_tx.send(ReadEvent::Error(e)).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "reopen task failed");
                    }
                }
            }
            Wakeup::Control(_) => {
                // Close requested, or every handle was dropped
                let err = match worker.take() {
                    Some(w) => stop_worker(w, &events_tx).await,
                    None => None,
                };
                let _ = events_tx.send(ReadEvent::Closed(err)).await;
                return;
            }
        }
    }
}

/// Signal a worker to stop, forward any lines that raced ahead of the
/// signal, and reap the thread. Returns the worker's terminal error, if any.
async fn stop_worker(mut worker: Worker, events_tx: &BoundedSender<ReadEvent>) -> Option<ReaderError> {
    worker.signal_stop();

    let drained = tokio::time::timeout(WORKER_STOP_TIMEOUT, async {
        loop {
            match worker.events.next().await {
                Some(WorkerEvent::Line(line)) => {
                    let _ = events_tx.send(ReadEvent::Line(line)).await;
                }
                Some(WorkerEvent::Closed(err)) => return err,
                None => return None,
            }
        }
    })
    .await;

    match drained {
        Ok(err) => {
            join_worker(Some(worker));
            err
        }
        Err(_) => {
            // Leave the thread detached rather than hang shutdown on it
            warn!("timed out waiting for reader worker to stop");
            None
        }
    }
}

fn join_worker(worker: Option<Worker>) {
    if let Some(w) = worker {
        // The worker has already emitted Closed, so this join is immediate
        let _ = w.thread.join();
    }
}

/// Accumulates read chunks and emits complete lines without their newline.
/// `skip` drops the first N line terminations and everything before them,
/// which tail mode uses to discard a truncated tail fragment.
struct LineFramer {
    buf: Vec<u8>,
    skip: usize,
}

impl LineFramer {
    fn new(skip: usize) -> LineFramer {
        LineFramer {
            buf: Vec::with_capacity(READ_CHUNK),
            skip,
        }
    }

    /// Returns false when the event channel is gone.
    fn push(&mut self, chunk: &[u8], tx: &BoundedSender<WorkerEvent>) -> bool {
        let mut rest = chunk;

        loop {
            match rest.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    if self.skip > 0 {
                        self.skip -= 1;
                        self.buf.clear();
                    } else {
                        self.buf.extend_from_slice(&rest[..idx]);
                        if !self.buf.is_empty() {
                            let line = std::mem::take(&mut self.buf);
                            if tx.send_blocking(WorkerEvent::Line(line)).is_err() {
                                return false;
                            }
                        }
                    }
                    rest = &rest[idx + 1..];
                }
                None => {
                    if self.skip == 0 {
                        self.buf.extend_from_slice(rest);
                    }
                    return true;
                }
            }
        }
    }
}

/// Tail a regular file: start at the end, read past EOF, sleep, retry.
fn read_tail(mut file: File, path: String, tx: BoundedSender<WorkerEvent>, stop: Arc<AtomicBool>) {
    // Probe the last byte. Reopening mid-line means the head of the current
    // line is already gone, so the remainder has to be discarded too.
    let skip = match probe_tail(&mut file) {
        Ok(skip) => skip,
        Err(e) => {
            let _ = tx.send_blocking(WorkerEvent::Closed(Some(ReaderError::io(&path, e))));
            return;
        }
    };

    let mut framer = LineFramer::new(skip);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if stop.load(Ordering::Acquire) {
            let _ = tx.send_blocking(WorkerEvent::Closed(None));
            return;
        }

        match file.read(&mut chunk) {
            Ok(0) => {
                // This is actually how tail -f works
                thread::sleep(EOF_POLL);
            }
            Ok(n) => {
                if !framer.push(&chunk[..n], &tx) {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send_blocking(WorkerEvent::Closed(Some(ReaderError::io(&path, e))));
                return;
            }
        }
    }
}

/// Decide whether the file ends on a line boundary. Leaves the cursor at the
/// end of the file either way.
fn probe_tail(file: &mut File) -> io::Result<usize> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }

    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;

    Ok(if last[0] == b'\n' { 0 } else { 1 })
}

/// Read a FIFO opened read+write. EOF cannot happen while our own write half
/// is open, so a zero read means the handle itself went away.
fn read_pipe(mut file: File, path: String, tx: BoundedSender<WorkerEvent>, stop: Arc<AtomicBool>) {
    let mut framer = LineFramer::new(0);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match file.read(&mut chunk) {
            Ok(0) => {
                let _ = tx.send_blocking(WorkerEvent::Closed(None));
                return;
            }
            Ok(n) => {
                if stop.load(Ordering::Acquire) {
                    // Woken by the control side's newline. Bytes still in
                    // flight are discarded, matching rotation semantics.
                    let _ = tx.send_blocking(WorkerEvent::Closed(None));
                    return;
                }
                if !framer.push(&chunk[..n], &tx) {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send_blocking(WorkerEvent::Closed(Some(ReaderError::io(&path, e))));
                return;
            }
        }
    }
}

/// Read stdin until EOF. Close unblocks the read by closing descriptor 0.
fn read_stdin(tx: BoundedSender<WorkerEvent>, stop: Arc<AtomicBool>) {
    let mut framer = LineFramer::new(0);
    let mut chunk = [0u8; READ_CHUNK];
    let mut stdin = io::stdin().lock();

    loop {
        match stdin.read(&mut chunk) {
            Ok(0) => {
                let _ = tx.send_blocking(WorkerEvent::Closed(None));
                return;
            }
            Ok(n) => {
                if stop.load(Ordering::Acquire) {
                    let _ = tx.send_blocking(WorkerEvent::Closed(None));
                    return;
                }
                if !framer.push(&chunk[..n], &tx) {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // The descriptor was closed under us during shutdown
                let closed_err = if stop.load(Ordering::Acquire) {
                    None
                } else {
                    Some(ReaderError::io("-", e))
                };
                let _ = tx.send_blocking(WorkerEvent::Closed(closed_err));
                return;
            }
        }
    }
}
