// SPDX-License-Identifier: Apache-2.0

use std::process::{exit, ExitCode};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use logship::cli::{setup_logging, CommonArgs};
use logship::handlers::trace::{TraceConfig, TraceHandler};
use logship::reader::LineReader;
use logship::supervisor;
use logship::telemetry::TelemetryClient;
use logship::writer::LineWriter;

#[derive(Debug, Parser)]
#[command(name = "logship-trace")]
#[command(bin_name = "logship-trace")]
#[command(version, about = "Forward free-text logs as trace telemetry", long_about = None)]
struct Arguments {
    #[clap(flatten)]
    common: CommonArgs,

    /// Include lines matching this regex. Can be used multiple times
    #[arg(long = "include")]
    include: Vec<String>,

    /// Exclude lines matching this regex. Can be used multiple times
    #[arg(long = "exclude")]
    exclude: Vec<String>,

    /// Batch lines for this many seconds and send them as a single trace
    #[arg(long, env = "LOGSHIP_BATCH", default_value = "0")]
    batch: u64,

    /// Severity level: verbose, information, warning, error, or critical
    #[arg(long, env = "LOGSHIP_SEVERITY", default_value = "information")]
    severity: String,
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

    let _guard = setup_logging("logship-trace", &args.common);

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
    info!(input = %input, "starting trace forwarder");

    let flush: Duration = args.common.flush.into();
    let client = TelemetryClient::start(args.common.telemetry_config());

    let reader = LineReader::open(&input)?;
    let writer = match args.common.output.as_deref() {
        Some(target) => LineWriter::open(target)?,
        None => LineWriter::disabled(),
    };

    let handler = TraceHandler::new(
        TraceConfig {
            include: args.include,
            exclude: args.exclude,
            batch_window: Duration::from_secs(args.batch),
            severity: args.severity,
        },
        client.clone(),
    );

    let code = supervisor::run(Box::new(handler), reader, writer, client, flush).await?;
    Ok(code)
}
