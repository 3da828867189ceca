// SPDX-License-Identifier: Apache-2.0

//! Telemetry item shapes and their wire envelopes.
//!
//! Items are what handlers build; envelopes are the JSON documents the
//! submitter posts to the ingestion endpoint, one per line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// Trace severity, ordered least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SeverityLevel {
    Verbose,
    Information,
    Warning,
    Error,
    Critical,
}

impl SeverityLevel {
    /// Case-insensitive parse accepting the common short spellings.
    pub fn parse(s: &str) -> Option<SeverityLevel> {
        match s.to_ascii_lowercase().as_str() {
            "verbose" => Some(SeverityLevel::Verbose),
            "information" | "info" => Some(SeverityLevel::Information),
            "warning" | "warn" => Some(SeverityLevel::Warning),
            "error" | "err" => Some(SeverityLevel::Error),
            "critical" | "crit" => Some(SeverityLevel::Critical),
            _ => None,
        }
    }

    fn as_number(self) -> u8 {
        match self {
            SeverityLevel::Verbose => 0,
            SeverityLevel::Information => 1,
            SeverityLevel::Warning => 2,
            SeverityLevel::Error => 3,
            SeverityLevel::Critical => 4,
        }
    }
}

/// One completed request extracted from an access log line.
#[derive(Debug, Clone)]
pub struct RequestTelemetry {
    pub name: String,
    pub method: String,
    pub url: String,
    /// Request start time.
    pub timestamp: DateTime<Utc>,
    pub duration: chrono::Duration,
    pub response_code: String,
    pub success: bool,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub authenticated_user: Option<String>,
    pub properties: HashMap<String, String>,
    pub measurements: HashMap<String, f64>,
}

/// A free-text log line (or batch of lines) with a severity.
#[derive(Debug, Clone)]
pub struct TraceTelemetry {
    pub message: String,
    pub severity: SeverityLevel,
    pub timestamp: DateTime<Utc>,
}

impl TraceTelemetry {
    pub fn new(message: String, severity: SeverityLevel) -> TraceTelemetry {
        TraceTelemetry {
            message,
            severity,
            timestamp: Utc::now(),
        }
    }
}

/// Pre-aggregated samples of one metric over a window.
#[derive(Debug, Clone)]
pub struct AggregateMetricTelemetry {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    sum: f64,
    sq_sum: f64,
    count: usize,
    min: f64,
    max: f64,
}

impl AggregateMetricTelemetry {
    pub fn new(name: impl Into<String>) -> AggregateMetricTelemetry {
        AggregateMetricTelemetry {
            name: name.into(),
            timestamp: Utc::now(),
            sum: 0.0,
            sq_sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn add_sampled_data(&mut self, samples: &[f64]) {
        for &v in samples {
            self.sum += v;
            self.sq_sum += v * v;
            self.count += 1;
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        (self.sq_sum / n - mean * mean).max(0.0).sqrt()
    }
}

#[derive(Debug, Clone)]
pub enum Telemetry {
    Request(RequestTelemetry),
    Trace(TraceTelemetry),
    Metric(AggregateMetricTelemetry),
}

/// Initialization-time constants stamped on every envelope.
#[derive(Debug, Clone)]
pub struct EnvelopeContext {
    pub ikey: String,
    pub role: String,
    pub role_instance: String,
    pub custom_properties: HashMap<String, String>,
}

const SDK_VERSION: &str = concat!("logship:", env!("CARGO_PKG_VERSION"));

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> String {
    format!("{:016x}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Serialize)]
pub struct Envelope {
    name: &'static str,
    time: String,
    #[serde(rename = "iKey")]
    ikey: String,
    tags: HashMap<&'static str, String>,
    data: Data,
}

#[derive(Debug, Serialize)]
struct Data {
    #[serde(rename = "baseType")]
    base_type: &'static str,
    #[serde(rename = "baseData")]
    base_data: BaseData,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum BaseData {
    Request(RequestData),
    Message(MessageData),
    Metric(MetricData),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestData {
    ver: u8,
    id: String,
    name: String,
    duration: String,
    response_code: String,
    success: bool,
    url: String,
    properties: HashMap<String, String>,
    measurements: HashMap<String, f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageData {
    ver: u8,
    message: String,
    severity_level: u8,
    properties: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricData {
    ver: u8,
    metrics: Vec<DataPoint>,
    properties: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DataPoint {
    name: String,
    kind: u8,
    value: f64,
    count: usize,
    min: f64,
    max: f64,
    std_dev: f64,
}

/// `d.hh:mm:ss.fffffff`, the duration format the ingestion schema expects.
fn format_duration(d: chrono::Duration) -> String {
    let total_ms = d.num_milliseconds().max(0);
    let days = total_ms / 86_400_000;
    let hours = total_ms / 3_600_000 % 24;
    let minutes = total_ms / 60_000 % 60;
    let seconds = total_ms / 1000 % 60;
    let ticks = total_ms % 1000 * 10_000;
    format!("{}.{:02}:{:02}:{:02}.{:07}", days, hours, minutes, seconds, ticks)
}

impl Telemetry {
    pub fn into_envelope(self, ctx: &EnvelopeContext) -> Envelope {
        let mut tags: HashMap<&'static str, String> = HashMap::new();
        tags.insert("ai.cloud.role", ctx.role.clone());
        tags.insert("ai.cloud.roleInstance", ctx.role_instance.clone());
        tags.insert("ai.internal.sdkVersion", SDK_VERSION.to_string());

        // Custom properties are stamped last and overwrite any same-named
        // parsed field
        let with_custom = |mut props: HashMap<String, String>| {
            for (k, v) in &ctx.custom_properties {
                props.insert(k.clone(), v.clone());
            }
            props
        };

        match self {
            Telemetry::Request(req) => {
                if let Some(ip) = &req.client_ip {
                    tags.insert("ai.location.ip", ip.clone());
                }
                if let Some(agent) = &req.user_agent {
                    tags.insert("ai.user.userAgent", agent.clone());
                }
                if let Some(user) = &req.authenticated_user {
                    tags.insert("ai.user.authUserId", user.clone());
                }
                tags.insert("ai.operation.name", req.name.clone());

                Envelope {
                    name: "Microsoft.ApplicationInsights.Request",
                    time: req.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                    ikey: ctx.ikey.clone(),
                    tags,
                    data: Data {
                        base_type: "RequestData",
                        base_data: BaseData::Request(RequestData {
                            ver: 2,
                            id: next_request_id(),
                            name: req.name,
                            duration: format_duration(req.duration),
                            response_code: req.response_code,
                            success: req.success,
                            url: req.url,
                            properties: with_custom(req.properties),
                            measurements: req.measurements,
                        }),
                    },
                }
            }
            Telemetry::Trace(trace) => Envelope {
                name: "Microsoft.ApplicationInsights.Message",
                time: trace.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                ikey: ctx.ikey.clone(),
                tags,
                data: Data {
                    base_type: "MessageData",
                    base_data: BaseData::Message(MessageData {
                        ver: 2,
                        message: trace.message,
                        severity_level: trace.severity.as_number(),
                        properties: with_custom(HashMap::new()),
                    }),
                },
            },
            Telemetry::Metric(metric) => {
                let point = DataPoint {
                    name: metric.name.clone(),
                    kind: 1, // aggregation
                    value: metric.sum,
                    count: metric.count,
                    min: metric.min,
                    max: metric.max,
                    std_dev: metric.std_dev(),
                };

                Envelope {
                    name: "Microsoft.ApplicationInsights.Metric",
                    time: metric.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                    ikey: ctx.ikey.clone(),
                    tags,
                    data: Data {
                        base_type: "MetricData",
                        base_data: BaseData::Metric(MetricData {
                            ver: 2,
                            metrics: vec![point],
                            properties: with_custom(HashMap::new()),
                        }),
                    },
                }
            }
        }
    }
}
