// SPDX-License-Identifier: Apache-2.0

//! Minute-by-minute aggregation of connection-state counters into sampled
//! metric telemetry.

use std::time::Duration;

use tracing::debug;

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};
use crate::telemetry::envelope::{AggregateMetricTelemetry, Telemetry};
use crate::telemetry::TelemetryClient;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

const SAMPLE_QUEUE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Reading,
    Writing,
    Waiting,
}

impl ConnectionState {
    const ALL: [ConnectionState; 4] = [
        ConnectionState::Active,
        ConnectionState::Reading,
        ConnectionState::Writing,
        ConnectionState::Waiting,
    ];

    fn metric_name(self) -> &'static str {
        match self {
            ConnectionState::Active => "Nginx Active Connections",
            ConnectionState::Reading => "Nginx Reading Connections",
            ConnectionState::Writing => "Nginx Writing Connections",
            ConnectionState::Waiting => "Nginx Waiting Connections",
        }
    }

    fn index(self) -> usize {
        match self {
            ConnectionState::Active => 0,
            ConnectionState::Reading => 1,
            ConnectionState::Writing => 2,
            ConnectionState::Waiting => 3,
        }
    }
}

struct Sample {
    state: ConnectionState,
    value: f64,
}

/// Cheap-clone feed into the sampler task.
#[derive(Clone)]
pub struct StatusSampler {
    tx: BoundedSender<Sample>,
}

impl StatusSampler {
    /// Spawn the aggregation task. Must be called from within a tokio
    /// runtime.
    pub fn start(client: TelemetryClient) -> StatusSampler {
        let (tx, rx) = bounded(SAMPLE_QUEUE_SIZE);

        tokio::spawn(async move {
            sample_loop(rx, SAMPLE_INTERVAL, |metric| {
                client.track(Telemetry::Metric(metric));
            })
            .await;
        });

        StatusSampler { tx }
    }

    /// Record one observation; never blocks the pipeline.
    pub fn sample(&self, state: ConnectionState, value: f64) {
        if self.tx.try_send(Sample { state, value }).is_err() {
            debug!("sample queue full, observation dropped");
        }
    }
}

async fn sample_loop(
    mut rx: BoundedReceiver<Sample>,
    interval: Duration,
    mut emit: impl FnMut(AggregateMetricTelemetry),
) {
    let mut streams: [Vec<f64>; 4] = Default::default();

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            sample = rx.next() => match sample {
                Some(sample) => streams[sample.state.index()].push(sample.value),
                None => {
                    flush(&mut streams, &mut emit);
                    return;
                }
            },
            _ = ticker.tick() => {
                flush(&mut streams, &mut emit);
            }
        }
    }
}

fn flush(streams: &mut [Vec<f64>; 4], emit: &mut impl FnMut(AggregateMetricTelemetry)) {
    for state in ConnectionState::ALL {
        let samples = &mut streams[state.index()];
        if samples.is_empty() {
            continue;
        }

        let mut metric = AggregateMetricTelemetry::new(state.metric_name());
        metric.add_sampled_data(samples);
        emit(metric);
        samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aggregates_per_state_and_clears_on_flush() {
        let (tx, rx) = bounded(64);

        tx.send(Sample { state: ConnectionState::Active, value: 3.0 }).await.unwrap();
        tx.send(Sample { state: ConnectionState::Active, value: 5.0 }).await.unwrap();
        tx.send(Sample { state: ConnectionState::Waiting, value: 1.0 }).await.unwrap();
        drop(tx);

        let mut emitted = Vec::new();
        sample_loop(rx, Duration::from_secs(3600), |m| emitted.push(m)).await;

        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].name, "Nginx Active Connections");
        assert_eq!(emitted[0].count(), 2);
        assert_eq!(emitted[1].name, "Nginx Waiting Connections");
        assert_eq!(emitted[1].count(), 1);
    }

    #[tokio::test]
    async fn empty_streams_emit_nothing() {
        let (tx, rx) = bounded::<Sample>(4);
        drop(tx);

        let mut emitted = Vec::new();
        sample_loop(rx, Duration::from_secs(3600), |m| emitted.push(m)).await;
        assert!(emitted.is_empty());
    }
}
