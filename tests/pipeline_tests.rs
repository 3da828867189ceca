// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline tests: tail a growing log, run it through a handler,
//! and observe the envelopes arriving at a local ingestion endpoint.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::time::Duration;

use logship::handlers::access::{AccessLogConfig, AccessLogHandler};
use logship::handlers::trace::{TraceConfig, TraceHandler};
use logship::handlers::LogHandler;
use logship::reader::{LineReader, ReadEvent};
use logship::telemetry::{TelemetryClient, TelemetryConfig};

/// Minimal ingestion endpoint: accepts POSTs, hands each body to the test,
/// answers 200.
fn spawn_ingest_server() -> (String, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };

            let mut data = Vec::new();
            let mut buf = [0u8; 4096];
            let mut headers_end = 0;
            let mut content_length = 0;

            while headers_end == 0 {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        data.extend_from_slice(&buf[..n]);
                        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                            headers_end = pos + 4;
                            let headers = String::from_utf8_lossy(&data[..pos]);
                            for line in headers.lines() {
                                if let Some((key, value)) = line.split_once(':') {
                                    if key.eq_ignore_ascii_case("content-length") {
                                        content_length = value.trim().parse().unwrap_or(0);
                                    }
                                }
                            }
                        }
                    }
                }
            }
            if headers_end == 0 {
                continue;
            }

            while data.len() < headers_end + content_length {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => data.extend_from_slice(&buf[..n]),
                }
            }

            let body = String::from_utf8_lossy(&data[headers_end..]).into_owned();
            let _ = tx.send(body);
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            );
        }
    });

    (format!("http://{}/v2/track", addr), rx)
}

fn test_client(endpoint: String) -> TelemetryClient {
    let mut config = TelemetryConfig::new("itest-key".to_string());
    config.endpoint = Some(endpoint);
    config.role = "itest".to_string();
    config.role_instance = "itest-1".to_string();
    // Submission driven by explicit flushes only
    config.flush_interval = Duration::from_secs(3600);
    TelemetryClient::start(config)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tailed_access_log_reaches_the_endpoint() {
    let (endpoint, bodies) = spawn_ingest_server();
    let client = test_client(endpoint);

    let mut handler = AccessLogHandler::new(AccessLogConfig::default(), client.clone(), None);
    handler.initialize().unwrap();

    let file = tempfile::NamedTempFile::new().unwrap();
    let reader = LineReader::open(file.path().to_str().unwrap()).unwrap();
    let (handle, mut events) = reader.split();

    let mut appender = std::fs::OpenOptions::new()
        .append(true)
        .open(file.path())
        .unwrap();
    writeln!(
        appender,
        r#"192.168.0.1 - jdoe [20/Feb/2017:13:06:09 +0000] "GET /favicon.ico HTTP/1.1" 404 571 "http://h/" "UA""#
    )
    .unwrap();
    appender.flush().unwrap();

    // Drive the reader into the handler the way the supervisor does
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("no line within deadline")
        {
            Some(ReadEvent::Line(line)) => {
                handler.receive(&line).unwrap();
                break;
            }
            Some(_) => continue,
            None => panic!("reader events channel died"),
        }
    }

    handle.close().await;
    client.flush(Duration::from_secs(5)).await;

    let body = bodies.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(body.contains("Microsoft.ApplicationInsights.Request"));
    assert!(body.contains(r#""iKey":"itest-key""#));
    assert!(body.contains(r#""responseCode":"404""#));
    assert!(body.contains("/favicon.ico"));
    assert!(body.contains(r#""success":false"#));
    assert!(body.contains(r#""ai.user.authUserId":"jdoe""#));
    assert!(body.contains("2017-02-20T13:06:09"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn filtered_trace_lines_reach_the_endpoint() {
    let (endpoint, bodies) = spawn_ingest_server();
    let client = test_client(endpoint);

    let mut handler = TraceHandler::new(
        TraceConfig {
            include: vec!["^keep".to_string()],
            exclude: vec!["noise".to_string()],
            batch_window: Duration::ZERO,
            severity: "warning".to_string(),
        },
        client.clone(),
    );
    handler.initialize().unwrap();

    handler.receive(b"keep this line").unwrap();
    handler.receive(b"keep but noise, dropped").unwrap();
    handler.receive(b"unrelated, dropped").unwrap();

    client.flush(Duration::from_secs(5)).await;

    let body = bodies.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(body.contains("Microsoft.ApplicationInsights.Message"));
    assert!(body.contains("keep this line"));
    assert!(body.contains(r#""severityLevel":2"#));
    assert!(!body.contains("dropped"));

    // One envelope per line: exactly one passed the filters
    assert_eq!(body.trim_end().lines().count(), 1);
}
