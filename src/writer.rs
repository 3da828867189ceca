// SPDX-License-Identifier: Apache-2.0

//! Bounded tee of input lines to an auxiliary sink.
//!
//! The tee must never stall the main data path. A dedicated OS thread owns
//! the sink and does blocking writes through a single-slot handshake; the
//! control task buffers up to [`BUF_MAX`] bytes while the sink is busy and
//! beyond that drops data, counting what it dropped. The counters are
//! reported and reset once a minute.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileTypeExt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};

/// Most bytes held for a busy sink before writes are dropped.
const BUF_MAX: usize = 8192;

/// Drop accounting is reported and reset on this interval.
const NOTIFY_INTERVAL: Duration = Duration::from_secs(60);

/// Bound on waiting for the sink thread to flush during reset and close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("error writing log output: {0}")]
    Io(#[from] io::Error),

    #[error("Dropped {messages} messages and {bytes} bytes in the last minute")]
    Dropped { messages: u64, bytes: u64 },
}

/// Messages on the writer's external event channel.
pub enum WriteEvent {
    /// Diagnostic only: the periodic drop report.
    Error(WriterError),
    /// The sink is gone; the error is what killed it, if anything.
    Closed(Option<WriterError>),
}

enum Control {
    Write(Vec<u8>),
    Reset,
    Close,
}

enum Job {
    Data(Vec<u8>),
    Shutdown,
}

enum Signal {
    Ready,
    Closed(Option<WriterError>),
}

type SinkOpener = Arc<dyn Fn() -> io::Result<Box<dyn Write + Send>> + Send + Sync>;

/// Cheap-clone control side of a [`LineWriter`].
#[derive(Clone)]
pub struct WriterHandle {
    control_tx: BoundedSender<Control>,
}

impl WriterHandle {
    pub async fn write(&self, data: Vec<u8>) {
        let _ = self.control_tx.send(Control::Write(data)).await;
    }

    /// Drain and reopen a file sink; stdio sinks ignore this.
    pub async fn reset(&self) {
        let _ = self.control_tx.send(Control::Reset).await;
    }

    pub async fn close(&self) {
        let _ = self.control_tx.send(Control::Close).await;
    }
}

pub struct LineWriter {
    handle: WriterHandle,
    events: BoundedReceiver<WriteEvent>,
}

impl LineWriter {
    /// Open a tee to `-` (stdout), `stderr`, or a filesystem path. Must be
    /// called from within a tokio runtime.
    pub fn open(target: &str) -> Result<LineWriter, WriterError> {
        match target {
            "-" => Ok(start(
                Arc::new(|| Ok(Box::new(io::stdout()) as Box<dyn Write + Send>)),
                false,
                NOTIFY_INTERVAL,
            )),
            "stderr" => Ok(start(
                Arc::new(|| Ok(Box::new(io::stderr()) as Box<dyn Write + Send>)),
                false,
                NOTIFY_INTERVAL,
            )),
            path => {
                preflight(path)?;
                let path = path.to_string();
                let opener: SinkOpener = Arc::new(move || {
                    let file = open_sink_file(&path)?;
                    Ok(Box::new(file) as Box<dyn Write + Send>)
                });
                Ok(start(opener, true, NOTIFY_INTERVAL))
            }
        }
    }

    /// A writer that swallows everything, used when no tee is configured so
    /// the supervisor wiring stays uniform.
    pub fn disabled() -> LineWriter {
        let (control_tx, mut control_rx) = bounded(16);
        let (events_tx, events_rx) = bounded(4);

        tokio::spawn(async move {
            while let Some(ctl) = control_rx.next().await {
                if matches!(ctl, Control::Close) {
                    let _ = events_tx.send(WriteEvent::Closed(None)).await;
                    return;
                }
            }
        });

        LineWriter {
            handle: WriterHandle { control_tx },
            events: events_rx,
        }
    }

    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    pub fn split(self) -> (WriterHandle, BoundedReceiver<WriteEvent>) {
        (self.handle, self.events)
    }
}

/// Check that the target is writable before the worker starts. A named pipe
/// skips the test-open: opening a FIFO for writing blocks until a reader
/// shows up.
fn preflight(path: &str) -> Result<(), WriterError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => Ok(()),
        _ => {
            let file = open_sink_file(path)?;
            drop(file);
            Ok(())
        }
    }
}

fn open_sink_file(path: &str) -> io::Result<File> {
    // Create exclusively first; an existing file is appended to, not
    // clobbered.
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(file),
        Err(e) => {
            debug!(path, error = %e, "could not create log output, appending instead");
            OpenOptions::new().write(true).append(true).open(path)
        }
    }
}

struct SinkWorker {
    jobs: BoundedSender<Job>,
    signals: BoundedReceiver<Signal>,
    thread: thread::JoinHandle<()>,
}

fn spawn_sink(opener: SinkOpener) -> SinkWorker {
    // Single-slot handshake: at most one write in flight
    let (jobs_tx, jobs_rx) = bounded::<Job>(1);
    let (signals_tx, signals_rx) = bounded::<Signal>(4);

    let thread = thread::spawn(move || sink_thread(opener, jobs_rx, signals_tx));

    SinkWorker {
        jobs: jobs_tx,
        signals: signals_rx,
        thread,
    }
}

fn sink_thread(opener: SinkOpener, jobs_rx: BoundedReceiver<Job>, signals_tx: BoundedSender<Signal>) {
    let mut sink = match opener() {
        Ok(sink) => sink,
        Err(e) => {
            let _ = signals_tx.send_blocking(Signal::Closed(Some(e.into())));
            return;
        }
    };

    let _ = signals_tx.send_blocking(Signal::Ready);

    while let Some(job) = jobs_rx.recv_blocking() {
        match job {
            Job::Data(data) => {
                if let Err(e) = sink.write_all(&data).and_then(|_| sink.flush()) {
                    let _ = signals_tx.send_blocking(Signal::Closed(Some(e.into())));
                    return;
                }
                let _ = signals_tx.send_blocking(Signal::Ready);
            }
            Job::Shutdown => {
                let _ = sink.flush();
                let _ = signals_tx.send_blocking(Signal::Closed(None));
                return;
            }
        }
    }

    let _ = sink.flush();
    let _ = signals_tx.send_blocking(Signal::Closed(None));
}

fn start(opener: SinkOpener, resettable: bool, notify_interval: Duration) -> LineWriter {
    let (control_tx, control_rx) = bounded(64);
    let (events_tx, events_rx) = bounded(16);

    tokio::spawn(control_loop(
        opener,
        resettable,
        notify_interval,
        control_rx,
        events_tx,
    ));

    LineWriter {
        handle: WriterHandle { control_tx },
        events: events_rx,
    }
}

enum Wakeup {
    Sink(Option<Signal>),
    Control(Option<Control>),
    Tick,
}

async fn control_loop(
    opener: SinkOpener,
    resettable: bool,
    notify_interval: Duration,
    mut control_rx: BoundedReceiver<Control>,
    events_tx: BoundedSender<WriteEvent>,
) {
    let mut sink = spawn_sink(opener.clone());
    let mut ready: usize = 0;
    let mut buf = Vec::new();
    let mut dropped_bytes: u64 = 0;
    let mut dropped_messages: u64 = 0;

    let mut ticker = tokio::time::interval(notify_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick fires immediately

    loop {
        let wakeup = tokio::select! {
            sig = sink.signals.next() => Wakeup::Sink(sig),
            ctl = control_rx.next() => Wakeup::Control(ctl),
            _ = ticker.tick() => Wakeup::Tick,
        };

        match wakeup {
            Wakeup::Sink(Some(Signal::Ready)) => {
                if buf.is_empty() {
                    ready += 1;
                } else {
                    let data = std::mem::take(&mut buf);
                    let _ = sink.jobs.try_send(Job::Data(data));
                }
            }
            Wakeup::Sink(sig) => {
                // The sink died on its own; report and stop
                let err = match sig {
                    Some(Signal::Closed(e)) => e,
                    _ => None,
                };
                let _ = sink.thread.join();
                let _ = events_tx.send(WriteEvent::Closed(err)).await;
                return;
            }
            Wakeup::Control(Some(Control::Write(data))) => {
                if ready > 0 {
                    ready -= 1;
                    let _ = sink.jobs.try_send(Job::Data(data));
                } else if buf.len() < BUF_MAX {
                    // Sink is busy; hold the data for the next Ready
                    buf.extend_from_slice(&data);
                } else {
                    dropped_bytes += data.len() as u64;
                    dropped_messages += 1;
                }
            }
            Wakeup::Control(Some(Control::Reset)) => {
                if !resettable {
                    debug!("reset ignored for stdio log output");
                    continue;
                }

                let _ =
                    tokio::time::timeout(DRAIN_TIMEOUT, flush_and_shutdown(&mut sink, &mut buf))
                        .await;
                let _ = drain_sink(&mut sink).await;

                sink = spawn_sink(opener.clone());
                ready = 0;
            }
            Wakeup::Control(_) => {
                // Close requested, or every handle was dropped
                let _ =
                    tokio::time::timeout(DRAIN_TIMEOUT, flush_and_shutdown(&mut sink, &mut buf))
                        .await;
                let err = drain_sink(&mut sink).await;
                let _ = events_tx.send(WriteEvent::Closed(err)).await;
                return;
            }
            Wakeup::Tick => {
                if dropped_messages > 0 {
                    let report = WriterError::Dropped {
                        messages: dropped_messages,
                        bytes: dropped_bytes,
                    };
                    let _ = events_tx.send(WriteEvent::Error(report)).await;
                    dropped_messages = 0;
                    dropped_bytes = 0;
                }
            }
        }
    }
}

async fn flush_and_shutdown(sink: &mut SinkWorker, buf: &mut Vec<u8>) {
    if !buf.is_empty() {
        let _ = sink.jobs.send(Job::Data(std::mem::take(buf))).await;
    }
    let _ = sink.jobs.send(Job::Shutdown).await;
}

/// Wait up to [`DRAIN_TIMEOUT`] for the sink thread to acknowledge shutdown.
/// A stuck sink is abandoned rather than letting it hang the pipeline.
async fn drain_sink(sink: &mut SinkWorker) -> Option<WriterError> {
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    loop {
        match tokio::time::timeout_at(deadline, sink.signals.next()).await {
            Ok(Some(Signal::Ready)) => continue,
            Ok(Some(Signal::Closed(err))) => return err,
            Ok(None) => return None,
            Err(_) => {
                warn!("timed out waiting for log output to flush");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::{mpsc, Mutex};
    use tokio::time::timeout;

    async fn wait_closed(events: &mut BoundedReceiver<WriteEvent>) -> Option<WriterError> {
        loop {
            match timeout(Duration::from_secs(5), events.next()).await {
                Ok(Some(WriteEvent::Closed(err))) => return err,
                Ok(Some(_)) => continue,
                _ => panic!("no close event"),
            }
        }
    }

    #[tokio::test]
    async fn writes_reach_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tee.log");

        let writer = LineWriter::open(path.to_str().unwrap()).unwrap();
        let (handle, mut events) = writer.split();

        handle.write(b"one\n".to_vec()).await;
        handle.write(b"two\n".to_vec()).await;
        handle.close().await;
        assert!(wait_closed(&mut events).await.is_none());

        let mut content = String::new();
        File::open(&path).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    #[tokio::test]
    async fn existing_file_is_appended_not_clobbered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tee.log");
        std::fs::write(&path, "kept\n").unwrap();

        let writer = LineWriter::open(path.to_str().unwrap()).unwrap();
        let (handle, mut events) = writer.split();

        handle.write(b"added\n".to_vec()).await;
        handle.close().await;
        wait_closed(&mut events).await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "kept\nadded\n");
    }

    #[tokio::test]
    async fn disabled_writer_acknowledges_close() {
        let writer = LineWriter::disabled();
        let (handle, mut events) = writer.split();

        handle.write(b"ignored\n".to_vec()).await;
        handle.close().await;
        assert!(wait_closed(&mut events).await.is_none());
    }

    /// A sink whose every write blocks until the test sends a permit.
    struct GatedSink {
        gate: mpsc::Receiver<()>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for GatedSink {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            let _ = self.gate.recv();
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn backpressure_drops_with_accounting() {
        let (permit_tx, permit_rx) = mpsc::channel();
        let written = Arc::new(Mutex::new(Vec::new()));

        let sink_slot = Mutex::new(Some(GatedSink {
            gate: permit_rx,
            written: written.clone(),
        }));
        let opener: SinkOpener = Arc::new(move || {
            let sink = sink_slot.lock().unwrap().take().expect("sink reopened");
            Ok(Box::new(sink) as Box<dyn Write + Send>)
        });

        let writer = start(opener, false, Duration::from_millis(300));
        let (handle, mut events) = writer.split();

        // First write lands in the sink thread and blocks on the gate
        handle.write(b"first".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Now the single slot is taken: 1 KiB writes buffer until BUF_MAX,
        // everything past that is dropped and counted
        let chunk = vec![b'x'; 1000];
        for _ in 0..12 {
            handle.write(chunk.clone()).await;
        }

        // The periodic report carries the drop totals
        let report = loop {
            match timeout(Duration::from_secs(5), events.next()).await {
                Ok(Some(WriteEvent::Error(WriterError::Dropped { messages, bytes }))) => {
                    break (messages, bytes)
                }
                Ok(Some(_)) => continue,
                _ => panic!("no drop report"),
            }
        };
        assert_eq!(report, (3, 3000));

        // Unblock the sink: the in-flight write and the buffered bytes land,
        // the dropped ones never do
        permit_tx.send(()).unwrap();
        permit_tx.send(()).unwrap();
        handle.close().await;
        drop(permit_tx);
        wait_closed(&mut events).await;

        let written = written.lock().unwrap();
        assert_eq!(written.len(), "first".len() + 9000);
    }
}
