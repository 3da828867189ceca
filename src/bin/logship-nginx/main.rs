// SPDX-License-Identifier: Apache-2.0

use std::process::{exit, ExitCode};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use logship::cli::{setup_logging, CommonArgs};
use logship::handlers::access::{AccessLogConfig, AccessLogHandler};
use logship::handlers::status::StatusSampler;
use logship::reader::LineReader;
use logship::supervisor;
use logship::telemetry::TelemetryClient;
use logship::writer::LineWriter;

#[derive(Debug, Parser)]
#[command(name = "logship-nginx")]
#[command(bin_name = "logship-nginx")]
#[command(version, about = "Forward nginx access logs as request telemetry", long_about = None)]
struct Arguments {
    #[clap(flatten)]
    common: CommonArgs,

    /// Access log format template; defaults to the combined format
    #[arg(long, env = "LOGSHIP_FORMAT")]
    format: Option<String>,

    /// The log is written with nginx `escape=json`
    #[arg(long, env = "LOGSHIP_JSON_ESCAPE", default_value = "false")]
    json_escape: bool,

    /// Emit telemetry from lines with missing fields instead of skipping them
    #[arg(long, env = "LOGSHIP_NO_REJECT", default_value = "false")]
    no_reject: bool,

    /// Strip query strings from request URLs
    #[arg(long, env = "LOGSHIP_NO_QUERY", default_value = "false")]
    no_query: bool,
}

fn main() -> ExitCode {
    let args = match Arguments::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // help and version land here too; only real errors exit nonzero
            let _ = e.print();
            return ExitCode::from(if e.use_stderr() { 1 } else { 0 });
        }
    };

    if let Err(e) = args.common.validate() {
        eprintln!("ERROR: {}", e);
        return ExitCode::from(1);
    }

    let _guard = setup_logging("logship-nginx", &args.common);

    match run(args) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => exit(code), // negated signal number
        Err(e) => {
            error!(error = %e, "failed to start");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run(args: Arguments) -> Result<i32, Box<dyn std::error::Error + Send + Sync>> {
    let input = args.common.input.clone().unwrap_or_default();
    info!(input = %input, "starting access log forwarder");

    let flush: Duration = args.common.flush.into();
    let client = TelemetryClient::start(args.common.telemetry_config());

    let reader = LineReader::open(&input)?;
    let writer = match args.common.output.as_deref() {
        Some(target) => LineWriter::open(target)?,
        None => LineWriter::disabled(),
    };

    let sampler = StatusSampler::start(client.clone());
    let handler = AccessLogHandler::new(
        AccessLogConfig {
            format: args.format,
            json_escape: args.json_escape,
            no_reject: args.no_reject,
            no_query: args.no_query,
        },
        client.clone(),
        Some(sampler),
    );

    let code = supervisor::run(Box::new(handler), reader, writer, client, flush).await?;
    Ok(code)
}
