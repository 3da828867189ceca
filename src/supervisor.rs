// SPDX-License-Identifier: Apache-2.0

//! Process control loop: wires reader -> handler -> telemetry with the
//! optional tee, converts signals into reader commands, and runs the
//! bounded shutdown flush.
//!
//! Hangup reopens the input (log rotation); interrupt and terminate drain
//! briefly, flush telemetry, and exit with the negated signal number.

use std::time::Duration;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{info, warn};

use crate::bounded_channel::BoundedReceiver;
use crate::handlers::{HandlerError, LogHandler};
use crate::reader::{LineReader, ReadEvent, ReaderHandle};
use crate::telemetry::TelemetryClient;
use crate::writer::{LineWriter, WriteEvent, WriterHandle};

/// How long to wait for in-flight lines after a shutdown signal.
const DRAIN_WAIT: Duration = Duration::from_millis(250);

/// How long to wait for the tee to flush on exit.
const WRITER_CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Run the pipeline until end-of-input or a terminating signal. Returns the
/// process exit code: 0 on clean end-of-input, the negated signal number
/// otherwise.
pub async fn run(
    mut handler: Box<dyn LogHandler>,
    reader: LineReader,
    writer: LineWriter,
    client: TelemetryClient,
    flush_bound: Duration,
) -> Result<i32, HandlerError> {
    handler.initialize()?;

    let (reader_handle, mut reader_events) = reader.split();
    let (writer_handle, mut writer_events) = writer.split();
    let mut writer_alive = true;

    let mut sighup = sig(SignalKind::hangup());
    let mut sigint = sig(SignalKind::interrupt());
    let mut sigterm = sig(SignalKind::terminate());

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("hangup received, rotating input");
                reader_handle.reset().await;
                if writer_alive {
                    writer_handle.reset().await;
                }
            }

            _ = sigint.recv() => {
                info!("interrupt received, shutting down");
                let code = drain_and_exit(
                    libc::SIGINT,
                    handler.as_mut(),
                    &reader_handle,
                    &mut reader_events,
                    &writer_handle,
                    &mut writer_events,
                    writer_alive,
                    &client,
                    flush_bound,
                )
                .await;
                return Ok(code);
            }

            _ = sigterm.recv() => {
                info!("terminate received, shutting down");
                let code = drain_and_exit(
                    libc::SIGTERM,
                    handler.as_mut(),
                    &reader_handle,
                    &mut reader_events,
                    &writer_handle,
                    &mut writer_events,
                    writer_alive,
                    &client,
                    flush_bound,
                )
                .await;
                return Ok(code);
            }

            ev = reader_events.next() => match ev {
                Some(ReadEvent::Line(line)) => {
                    deliver(&line, handler.as_mut(), &writer_handle, writer_alive).await;
                }
                Some(ReadEvent::Error(e)) => {
                    warn!(error = %e, "input error");
                }
                Some(ReadEvent::Closed(err)) => {
                    if let Some(e) = err {
                        warn!(error = %e, "input failed");
                    }
                    info!("input closed");
                    close_writer(&writer_handle, &mut writer_events, writer_alive).await;
                    client.flush(flush_bound).await;
                    return Ok(0);
                }
                None => {
                    info!("input closed");
                    close_writer(&writer_handle, &mut writer_events, writer_alive).await;
                    client.flush(flush_bound).await;
                    return Ok(0);
                }
            },

            ev = writer_events.next(), if writer_alive => match ev {
                Some(WriteEvent::Error(e)) => {
                    // Periodic drop accounting from the tee
                    warn!("{}", e);
                }
                Some(WriteEvent::Closed(err)) => {
                    if let Some(e) = err {
                        warn!(error = %e, "log output failed");
                    }
                    warn!("log output closed, continuing without tee");
                    writer_alive = false;
                }
                None => {
                    warn!("log output closed, continuing without tee");
                    writer_alive = false;
                }
            },
        }
    }
}

fn sig(kind: SignalKind) -> Signal {
    signal(kind).unwrap()
}

/// Tee the line (with its newline restored), then hand it to the handler.
/// Handler errors are per-line: log and move on.
async fn deliver(
    line: &[u8],
    handler: &mut dyn LogHandler,
    writer_handle: &WriterHandle,
    writer_alive: bool,
) {
    if writer_alive {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line);
        data.push(b'\n');
        writer_handle.write(data).await;
    }

    if let Err(e) = handler.receive(line) {
        warn!(error = %e, "error processing log line");
    }
}

#[allow(clippy::too_many_arguments)]
async fn drain_and_exit(
    signo: i32,
    handler: &mut dyn LogHandler,
    reader_handle: &ReaderHandle,
    reader_events: &mut BoundedReceiver<ReadEvent>,
    writer_handle: &WriterHandle,
    writer_events: &mut BoundedReceiver<WriteEvent>,
    writer_alive: bool,
    client: &TelemetryClient,
    flush_bound: Duration,
) -> i32 {
    reader_handle.close().await;

    // Give lines already in flight a brief window to land
    let deadline = tokio::time::Instant::now() + DRAIN_WAIT;
    loop {
        match tokio::time::timeout_at(deadline, reader_events.next()).await {
            Ok(Some(ReadEvent::Line(line))) => {
                deliver(&line, handler, writer_handle, writer_alive).await;
            }
            Ok(Some(ReadEvent::Error(_))) => continue,
            Ok(Some(ReadEvent::Closed(_))) | Ok(None) => break,
            Err(_) => {
                warn!("input did not drain in time, proceeding");
                break;
            }
        }
    }

    close_writer(writer_handle, writer_events, writer_alive).await;
    client.flush(flush_bound).await;

    -signo
}

async fn close_writer(
    writer_handle: &WriterHandle,
    writer_events: &mut BoundedReceiver<WriteEvent>,
    writer_alive: bool,
) {
    if !writer_alive {
        return;
    }

    writer_handle.close().await;

    let deadline = tokio::time::Instant::now() + WRITER_CLOSE_WAIT;
    loop {
        match tokio::time::timeout_at(deadline, writer_events.next()).await {
            Ok(Some(WriteEvent::Closed(_))) | Ok(None) => return,
            Ok(Some(_)) => continue,
            Err(_) => {
                warn!("timed out waiting for log output to close");
                return;
            }
        }
    }
}
