// SPDX-License-Identifier: Apache-2.0

//! Access-log handler: parses each line against the format template and
//! shapes the extracted fields into request telemetry.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use super::status::{ConnectionState, StatusSampler};
use super::{FieldError, HandlerError, LogHandler};
use crate::telemetry::envelope::{RequestTelemetry, Telemetry};
use crate::telemetry::TelemetryClient;
use crate::template::{Template, TemplateOptions};

/// The stock combined access log format.
pub const DEFAULT_FORMAT: &str = r#"$remote_addr - $remote_user [$time_local] "$request" $status $body_bytes_sent "$http_referer" "$http_user_agent""#;

/// `$time_local` layout, e.g. `20/Feb/2017:13:06:09 +0000`.
const TIME_LOCAL_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Fields consumed by the interpreters below; everything else parsed from a
/// line becomes a custom property.
const RESERVED_FIELDS: &[&str] = &[
    "host",
    "http_x_forwarded_for",
    "msec",
    "remote_addr",
    "remote_user",
    "request",
    "request_method",
    "request_path",
    "request_time",
    "request_uri",
    "scheme",
    "status",
    "time_iso8601",
    "time_local",
    "uri",
];

/// Numeric fields additionally emitted as measurements.
const MEASUREMENT_FIELDS: &[&str] = &[
    "body_bytes_sent",
    "bytes_sent",
    "connection_requests",
    "connections_active",
    "connections_reading",
    "connections_waiting",
    "connections_writing",
    "content_length",
    "gzip_ratio",
    "request_length",
    "upstream_bytes_received",
    "upstream_bytes_sent",
    "upstream_connect_time",
    "upstream_first_byte_time",
    "upstream_header_time",
    "upstream_response_length",
    "upstream_response_time",
];

const CONNECTION_FIELDS: &[(ConnectionState, &str)] = &[
    (ConnectionState::Active, "connections_active"),
    (ConnectionState::Reading, "connections_reading"),
    (ConnectionState::Writing, "connections_writing"),
    (ConnectionState::Waiting, "connections_waiting"),
];

#[derive(Debug, Clone, Default)]
pub struct AccessLogConfig {
    /// Format template; falls back to [`DEFAULT_FORMAT`].
    pub format: Option<String>,
    /// The log is written with `escape=json`.
    pub json_escape: bool,
    /// Mask field-level errors and emit telemetry from whatever parsed.
    pub no_reject: bool,
    /// Strip the query string from the assembled URL.
    pub no_query: bool,
}

pub struct AccessLogHandler {
    config: AccessLogConfig,
    client: TelemetryClient,
    sampler: Option<StatusSampler>,
    template: Option<Template>,
}

impl AccessLogHandler {
    pub fn new(
        config: AccessLogConfig,
        client: TelemetryClient,
        sampler: Option<StatusSampler>,
    ) -> AccessLogHandler {
        AccessLogHandler {
            config,
            client,
            sampler,
            template: None,
        }
    }
}

impl LogHandler for AccessLogHandler {
    fn initialize(&mut self) -> Result<(), HandlerError> {
        let options = if self.config.json_escape {
            TemplateOptions::json_escaped()
        } else {
            TemplateOptions::common()
        };

        let format = self.config.format.as_deref().unwrap_or(DEFAULT_FORMAT);
        self.template = Some(Template::compile(format, &options)?);
        Ok(())
    }

    fn receive(&mut self, line: &[u8]) -> Result<(), HandlerError> {
        let line = super::trim_line_ending(line);
        let template = self
            .template
            .as_ref()
            .expect("initialize not called before receive");

        let fields = template.parse_to_map(line)?;

        // Connection-state counters feed the minute sampler whether or not
        // the line yields a request
        if let Some(sampler) = &self.sampler {
            for &(state, key) in CONNECTION_FIELDS {
                if let Some(v) = fields.get(key).and_then(|v| v.parse::<f64>().ok()) {
                    sampler.sample(state, v);
                }
            }
        }

        let telemetry = build_request(&fields, &self.config)?;
        self.client.track(Telemetry::Request(telemetry));
        Ok(())
    }
}

/// Sentinel-aware lookup: the literal `-` means the field is absent.
fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    match fields.get(name).map(String::as_str) {
        Some("-") | None => None,
        Some(v) => Some(v),
    }
}

/// Shape a parsed field map into request telemetry.
pub fn build_request(
    fields: &HashMap<String, String>,
    config: &AccessLogConfig,
) -> Result<RequestTelemetry, FieldError> {
    let duration = parse_duration(fields, config.no_reject)?;
    let timestamp = parse_timestamp(fields, duration, config.no_reject)?;

    let response_code = match field(fields, "status") {
        Some(v) => v.to_string(),
        None if config.no_reject => String::new(),
        None => return Err(FieldError::MissingResponseCode),
    };
    let success = response_code.parse::<i64>().map(|n| n < 400).unwrap_or(false);

    let method = match parse_method(fields) {
        Some(m) => m,
        None if config.no_reject => String::new(),
        None => return Err(FieldError::MissingMethod),
    };

    let url = parse_url(fields, config.no_query)?;

    // The request line names the operation; without one, fall back to what
    // was assembled
    let name = match field(fields, "request") {
        Some(r) => r.to_string(),
        None if method.is_empty() => url.clone(),
        None => format!("{} {}", method, url),
    };

    let mut properties = HashMap::new();
    let mut measurements = HashMap::new();
    for (key, value) in fields {
        if RESERVED_FIELDS.contains(&key.as_str()) || value == "-" {
            continue;
        }
        properties.insert(key.clone(), value.clone());

        if MEASUREMENT_FIELDS.contains(&key.as_str()) {
            if let Ok(v) = value.parse::<f64>() {
                measurements.insert(key.clone(), v);
            }
        }
    }

    Ok(RequestTelemetry {
        name,
        method,
        url,
        timestamp,
        duration,
        response_code,
        success,
        client_ip: field(fields, "remote_addr")
            .or_else(|| field(fields, "http_x_forwarded_for"))
            .map(str::to_string),
        user_agent: field(fields, "http_user_agent").map(str::to_string),
        authenticated_user: field(fields, "remote_user").map(str::to_string),
        properties,
        measurements,
    })
}

fn parse_duration(
    fields: &HashMap<String, String>,
    no_reject: bool,
) -> Result<chrono::Duration, FieldError> {
    // A missing duration is normal; an unparseable one is not
    match field(fields, "request_time") {
        Some(v) => match v.parse::<f64>() {
            Ok(secs) => Ok(chrono::Duration::nanoseconds((secs * 1e9) as i64)),
            Err(_) if no_reject => Ok(chrono::Duration::zero()),
            Err(_) => Err(FieldError::InvalidDuration(v.to_string())),
        },
        None => Ok(chrono::Duration::zero()),
    }
}

/// Timestamps in the log mark response completion; request telemetry wants
/// the start, so the observed duration is subtracted back out. `msec`
/// carries full precision, the string forms only whole seconds.
fn parse_timestamp(
    fields: &HashMap<String, String>,
    duration: chrono::Duration,
    no_reject: bool,
) -> Result<DateTime<Utc>, FieldError> {
    if let Some(msec) = field(fields, "msec") {
        if let Ok(secs) = msec.parse::<f64>() {
            let completed = Utc.timestamp_nanos((secs * 1e9) as i64);
            return Ok(completed - duration);
        }
    }

    let whole_seconds = chrono::Duration::seconds(duration.num_seconds());

    if let Some(v) = field(fields, "time_local") {
        if let Ok(t) = DateTime::parse_from_str(v, TIME_LOCAL_FORMAT) {
            return Ok(t.with_timezone(&Utc) - whole_seconds);
        }
    }

    if let Some(v) = field(fields, "time_iso8601") {
        if let Ok(t) = DateTime::parse_from_rfc3339(v) {
            return Ok(t.with_timezone(&Utc) - whole_seconds);
        }
    }

    if no_reject {
        debug!("no usable timestamp in line, substituting now");
        return Ok(Utc::now());
    }

    Err(FieldError::MissingTimestamp)
}

fn parse_method(fields: &HashMap<String, String>) -> Option<String> {
    if let Some(m) = field(fields, "request_method") {
        return Some(m.to_string());
    }

    // `$request` is `METHOD path protocol` when well-formed
    if let Some(request) = field(fields, "request") {
        let tokens: Vec<&str> = request.split(' ').collect();
        if tokens.len() == 3 {
            return Some(tokens[0].to_string());
        }
    }

    None
}

/// URL components assembled from whichever fields the template captured, in
/// priority order, with `$scheme`/`$host` filling remaining gaps.
#[derive(Debug, Default)]
struct UrlParts {
    scheme: Option<String>,
    host: Option<String>,
    path: Option<String>,
    query: Option<String>,
}

impl UrlParts {
    fn is_empty(&self) -> bool {
        self.scheme.is_none() && self.host.is_none() && self.path.is_none()
    }

    /// Fill any components this candidate has that are still missing. Only
    /// the first successfully parsed candidate contributes a query string.
    fn merge(&mut self, raw: &str) {
        let Ok(uri) = raw.parse::<http::Uri>() else {
            return;
        };
        let first = self.is_empty();

        if self.scheme.is_none() {
            self.scheme = uri.scheme_str().map(str::to_string);
        }
        if self.host.is_none() {
            self.host = uri.authority().map(|a| a.to_string());
        }
        if self.path.is_none() && !uri.path().is_empty() {
            self.path = Some(uri.path().to_string());
        }
        if first {
            self.query = uri.query().map(str::to_string);
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        if let Some(host) = &self.host {
            match &self.scheme {
                Some(scheme) => {
                    out.push_str(scheme);
                    out.push_str("://");
                }
                None => out.push_str("//"),
            }
            out.push_str(host);
        } else if let Some(scheme) = &self.scheme {
            out.push_str(scheme);
            out.push(':');
        }
        if let Some(path) = &self.path {
            out.push_str(path);
        }
        if let Some(query) = &self.query {
            out.push('?');
            out.push_str(query);
        }
        out
    }
}

fn parse_url(fields: &HashMap<String, String>, no_query: bool) -> Result<String, FieldError> {
    let mut parts = UrlParts::default();

    for key in ["request_uri", "request_path", "uri"] {
        if let Some(v) = field(fields, key) {
            parts.merge(v);
        }
    }

    if let Some(request) = field(fields, "request") {
        let tokens: Vec<&str> = request.split(' ').collect();
        if tokens.len() == 3 {
            parts.merge(tokens[1]);
        }
    }

    if parts.is_empty() {
        return Err(FieldError::MissingUrl);
    }

    if parts.scheme.is_none() {
        parts.scheme = field(fields, "scheme").map(str::to_string);
    }
    if parts.host.is_none() {
        parts.host = field(fields, "host").map(str::to_string);
    }
    if no_query {
        parts.query = None;
    }

    Ok(parts.render())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_default(line: &str) -> HashMap<String, String> {
        Template::compile(DEFAULT_FORMAT, &TemplateOptions::common())
            .unwrap()
            .parse_to_map(line.as_bytes())
            .unwrap()
    }

    const SAMPLE: &str = r#"192.168.0.1 - jdoe [20/Feb/2017:13:06:09 +0000] "GET /favicon.ico HTTP/1.1" 404 571 "http://h/" "UA""#;

    #[test]
    fn default_format_to_request_telemetry() {
        let fields = parse_default(SAMPLE);
        let req = build_request(&fields, &AccessLogConfig::default()).unwrap();

        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "/favicon.ico");
        assert_eq!(req.response_code, "404");
        assert!(!req.success);
        assert_eq!(req.name, "GET /favicon.ico HTTP/1.1");
        assert_eq!(req.authenticated_user.as_deref(), Some("jdoe"));
        assert_eq!(req.client_ip.as_deref(), Some("192.168.0.1"));
        assert_eq!(req.user_agent.as_deref(), Some("UA"));
        assert_eq!(
            req.timestamp,
            Utc.with_ymd_and_hms(2017, 2, 20, 13, 6, 9).unwrap()
        );
        assert_eq!(req.duration, chrono::Duration::zero());

        // Unreserved fields ride along as properties, numeric ones also as
        // measurements
        assert_eq!(req.properties.get("body_bytes_sent").unwrap(), "571");
        assert_eq!(req.properties.get("http_referer").unwrap(), "http://h/");
        assert_eq!(req.properties.get("http_user_agent").unwrap(), "UA");
        assert!(!req.properties.contains_key("remote_addr"));
        assert_eq!(*req.measurements.get("body_bytes_sent").unwrap(), 571.0);
    }

    #[test]
    fn success_flag_follows_status_class() {
        let mut fields = parse_default(SAMPLE);
        fields.insert("status".to_string(), "302".to_string());
        let req = build_request(&fields, &AccessLogConfig::default()).unwrap();
        assert!(req.success);
    }

    #[test]
    fn sentinel_user_is_absent() {
        let line = r#"192.168.0.1 - - [20/Feb/2017:13:06:09 +0000] "GET / HTTP/1.1" 200 5 "-" "-""#;
        let fields = parse_default(line);
        let req = build_request(&fields, &AccessLogConfig::default()).unwrap();
        assert!(req.authenticated_user.is_none());
        assert!(req.user_agent.is_none());
        // Sentinel values never become properties
        assert!(!req.properties.contains_key("http_referer"));
    }

    #[test]
    fn msec_timestamp_is_adjusted_by_duration() {
        let mut fields = HashMap::new();
        fields.insert("msec".to_string(), "1487595969.500".to_string());
        fields.insert("request_time".to_string(), "0.250".to_string());
        fields.insert("status".to_string(), "200".to_string());
        fields.insert("request".to_string(), "GET /a HTTP/1.1".to_string());

        let req = build_request(&fields, &AccessLogConfig::default()).unwrap();
        assert_eq!(req.timestamp.timestamp(), 1487595969);
        assert_eq!(req.timestamp.timestamp_subsec_millis(), 250);
        assert_eq!(req.duration, chrono::Duration::milliseconds(250));
    }

    #[test]
    fn time_local_subtracts_whole_seconds_only() {
        let mut fields = parse_default(SAMPLE);
        fields.insert("request_time".to_string(), "1.900".to_string());
        let req = build_request(&fields, &AccessLogConfig::default()).unwrap();
        assert_eq!(
            req.timestamp,
            Utc.with_ymd_and_hms(2017, 2, 20, 13, 6, 8).unwrap()
        );
    }

    #[test]
    fn time_iso8601_fallback() {
        let mut fields = HashMap::new();
        fields.insert("time_iso8601".to_string(), "2017-02-20T13:06:09+00:00".to_string());
        fields.insert("status".to_string(), "200".to_string());
        fields.insert("request".to_string(), "GET /a HTTP/1.1".to_string());

        let req = build_request(&fields, &AccessLogConfig::default()).unwrap();
        assert_eq!(
            req.timestamp,
            Utc.with_ymd_and_hms(2017, 2, 20, 13, 6, 9).unwrap()
        );
    }

    #[test]
    fn missing_fields_are_errors() {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), "200".to_string());
        fields.insert("request".to_string(), "GET /a HTTP/1.1".to_string());
        fields.insert("time_local".to_string(), "junk".to_string());
        assert_eq!(
            build_request(&fields, &AccessLogConfig::default()).unwrap_err(),
            FieldError::MissingTimestamp
        );

        let mut fields = HashMap::new();
        fields.insert("time_iso8601".to_string(), "2017-02-20T13:06:09Z".to_string());
        fields.insert("request".to_string(), "GET /a HTTP/1.1".to_string());
        assert_eq!(
            build_request(&fields, &AccessLogConfig::default()).unwrap_err(),
            FieldError::MissingResponseCode
        );

        let mut fields = HashMap::new();
        fields.insert("time_iso8601".to_string(), "2017-02-20T13:06:09Z".to_string());
        fields.insert("status".to_string(), "200".to_string());
        fields.insert("request_uri".to_string(), "/a".to_string());
        assert_eq!(
            build_request(&fields, &AccessLogConfig::default()).unwrap_err(),
            FieldError::MissingMethod
        );
    }

    #[test]
    fn no_reject_masks_field_errors() {
        let mut fields = HashMap::new();
        fields.insert("request_uri".to_string(), "/a".to_string());

        let config = AccessLogConfig {
            no_reject: true,
            ..Default::default()
        };
        let req = build_request(&fields, &config).unwrap();
        assert_eq!(req.url, "/a");
        assert_eq!(req.response_code, "");
        assert!(!req.success);
        assert_eq!(req.method, "");
        assert_eq!(req.name, "/a");
    }

    #[test]
    fn method_from_request_line_needs_three_tokens() {
        let mut fields = HashMap::new();
        fields.insert("request".to_string(), "GET /a HTTP/1.1".to_string());
        assert_eq!(parse_method(&fields).as_deref(), Some("GET"));

        fields.insert("request".to_string(), "mangled".to_string());
        assert_eq!(parse_method(&fields), None);

        fields.insert("request_method".to_string(), "PUT".to_string());
        assert_eq!(parse_method(&fields).as_deref(), Some("PUT"));
    }

    #[test]
    fn url_assembly_priority_and_defaults() {
        let mut fields = HashMap::new();
        fields.insert("request_uri".to_string(), "/q?x=1".to_string());
        fields.insert("uri".to_string(), "/other".to_string());
        fields.insert("scheme".to_string(), "https".to_string());
        fields.insert("host".to_string(), "example.com".to_string());
        assert_eq!(
            parse_url(&fields, false).unwrap(),
            "https://example.com/q?x=1"
        );
        assert_eq!(parse_url(&fields, true).unwrap(), "https://example.com/q");

        // Path-only when nothing provides scheme/host
        let mut fields = HashMap::new();
        fields.insert("request".to_string(), "GET /b?y=2 HTTP/1.1".to_string());
        assert_eq!(parse_url(&fields, false).unwrap(), "/b?y=2");

        // An absolute candidate keeps its own scheme and host
        let mut fields = HashMap::new();
        fields.insert("request_uri".to_string(), "http://cdn.local/img.png".to_string());
        fields.insert("host".to_string(), "example.com".to_string());
        assert_eq!(
            parse_url(&fields, false).unwrap(),
            "http://cdn.local/img.png"
        );

        let fields = HashMap::new();
        assert_eq!(parse_url(&fields, false).unwrap_err(), FieldError::MissingUrl);
    }

    #[test]
    fn query_comes_only_from_first_parsed_candidate() {
        let mut fields = HashMap::new();
        fields.insert("uri".to_string(), "/plain".to_string());
        fields.insert("request".to_string(), "GET /plain?x=1 HTTP/1.1".to_string());
        // `uri` parsed first and had no query; the request token cannot add
        // one afterwards
        assert_eq!(parse_url(&fields, false).unwrap(), "/plain");
    }
}
