// SPDX-License-Identifier: Apache-2.0

//! Free-text handler: regex include/exclude filters, optional batching into
//! a single trace item per window, severity tagging.

use std::time::Duration;

use regex::bytes::Regex;
use tracing::debug;

use super::{HandlerError, LogHandler};
use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};
use crate::telemetry::envelope::{SeverityLevel, Telemetry, TraceTelemetry};
use crate::telemetry::TelemetryClient;

const BATCH_QUEUE_SIZE: usize = 1024;

/// An ordered list of filters, matched against the raw line bytes. An empty
/// list falls back to the given default, so no include filters means include
/// everything and no exclude filters means exclude nothing.
pub struct RegexList {
    patterns: Vec<Regex>,
}

impl RegexList {
    pub fn compile(patterns: &[String]) -> Result<RegexList, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RegexList { patterns })
    }

    pub fn match_any(&self, line: &[u8], default: bool) -> bool {
        if self.patterns.is_empty() {
            return default;
        }
        self.patterns.iter().any(|re| re.is_match(line))
    }
}

#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Batch lines for this long and send them as one trace; zero sends each
    /// line on its own.
    pub batch_window: Duration,
    pub severity: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            include: Vec::new(),
            exclude: Vec::new(),
            batch_window: Duration::ZERO,
            severity: "information".to_string(),
        }
    }
}

pub struct TraceHandler {
    config: TraceConfig,
    client: TelemetryClient,
    include: RegexList,
    exclude: RegexList,
    severity: SeverityLevel,
    batch_tx: Option<BoundedSender<String>>,
}

impl TraceHandler {
    pub fn new(config: TraceConfig, client: TelemetryClient) -> TraceHandler {
        TraceHandler {
            config,
            client,
            include: RegexList { patterns: Vec::new() },
            exclude: RegexList { patterns: Vec::new() },
            severity: SeverityLevel::Information,
            batch_tx: None,
        }
    }
}

impl LogHandler for TraceHandler {
    fn initialize(&mut self) -> Result<(), HandlerError> {
        self.severity = SeverityLevel::parse(&self.config.severity)
            .ok_or_else(|| HandlerError::InvalidSeverity(self.config.severity.clone()))?;

        self.include = RegexList::compile(&self.config.include)?;
        self.exclude = RegexList::compile(&self.config.exclude)?;

        if !self.config.batch_window.is_zero() {
            let (tx, rx) = bounded(BATCH_QUEUE_SIZE);
            let client = self.client.clone();
            let severity = self.severity;
            let window = self.config.batch_window;
            tokio::spawn(async move {
                batch_loop(rx, window, |message| {
                    client.track(Telemetry::Trace(TraceTelemetry::new(message, severity)));
                })
                .await;
            });
            self.batch_tx = Some(tx);
        }

        Ok(())
    }

    fn receive(&mut self, line: &[u8]) -> Result<(), HandlerError> {
        let line = super::trim_line_ending(line);

        if !self.include.match_any(line, true) || self.exclude.match_any(line, false) {
            debug!("line filtered out");
            return Ok(());
        }

        // Trace payloads are text; the lossy conversion happens here, after
        // the byte-level filtering
        let message = String::from_utf8_lossy(line).into_owned();

        match &self.batch_tx {
            Some(tx) => {
                // Never stall the pipeline on a slow batcher
                if tx.try_send(message).is_err() {
                    debug!("trace batch queue full, line dropped");
                }
            }
            None => {
                self.client
                    .track(Telemetry::Trace(TraceTelemetry::new(message, self.severity)));
            }
        }

        Ok(())
    }
}

/// Accumulate lines into one payload per window. The window starts at the
/// first line of each batch, so the timer resets on every flush.
async fn batch_loop(
    mut rx: BoundedReceiver<String>,
    window: Duration,
    mut emit: impl FnMut(String),
) {
    while let Some(first) = rx.next().await {
        let mut buf = first;

        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                line = rx.next() => match line {
                    Some(line) => {
                        buf.push('\n');
                        buf.push_str(&line);
                    }
                    None => {
                        emit(buf);
                        return;
                    }
                },
            }
        }

        emit(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(patterns: &[&str]) -> RegexList {
        let owned: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        RegexList::compile(&owned).unwrap()
    }

    #[test]
    fn empty_list_uses_default() {
        let empty = list(&[]);
        assert!(empty.match_any(b"anything", true));
        assert!(!empty.match_any(b"anything", false));
    }

    #[test]
    fn match_any_is_an_or_over_patterns() {
        let filters = list(&["^error", "timeout$"]);
        assert!(filters.match_any(b"error: boom", false));
        assert!(filters.match_any(b"request timeout", false));
        assert!(!filters.match_any(b"all fine", true));
        // Raw bytes in the line do not break the filters
        assert!(filters.match_any(b"error: \xff boom", false));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        assert!(RegexList::compile(&["(unclosed".to_string()]).is_err());
    }

    #[tokio::test]
    async fn batch_loop_groups_lines_per_window() {
        let (tx, rx) = bounded(16);

        tx.send("one".to_string()).await.unwrap();
        tx.send("two".to_string()).await.unwrap();
        drop(tx);

        let mut batches = Vec::new();
        batch_loop(rx, Duration::from_secs(5), |b| batches.push(b)).await;

        assert_eq!(batches, vec!["one\ntwo".to_string()]);
    }

    #[tokio::test]
    async fn batch_loop_flushes_on_window_expiry() {
        let (tx, rx) = bounded(16);
        let (done_tx, mut done_rx) = bounded(16);

        tokio::spawn(async move {
            batch_loop(rx, Duration::from_millis(50), move |b| {
                let _ = done_tx.try_send(b);
            })
            .await;
        });

        tx.send("early".to_string()).await.unwrap();

        // First batch flushes on its own window, while the sender stays open
        let first = tokio::time::timeout(Duration::from_secs(5), done_rx.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "early");

        // A later line starts a fresh window
        tx.send("late".to_string()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), done_rx.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, "late");
    }
}
