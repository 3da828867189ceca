// SPDX-License-Identifier: Apache-2.0

//! CLI surface and logging setup shared by the forwarder binaries.

use std::collections::HashMap;
use std::error::Error;

use clap::{Args, ValueEnum};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::telemetry::TelemetryConfig;

#[derive(Debug, Args, Clone)]
pub struct CommonArgs {
    /// Instrumentation key for the telemetry endpoint (required)
    #[arg(long, env = "LOGSHIP_IKEY")]
    pub ikey: Option<String>,

    /// Override the telemetry ingestion endpoint
    #[arg(long, env = "LOGSHIP_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Telemetry role name; defaults to the machine hostname
    #[arg(long, env = "LOGSHIP_ROLE")]
    pub role: Option<String>,

    /// Telemetry role instance; defaults to the machine hostname
    #[arg(long, env = "LOGSHIP_ROLE_INSTANCE")]
    pub role_instance: Option<String>,

    /// Input file, or '-' for stdin (required)
    #[arg(long = "in", env = "LOGSHIP_IN")]
    pub input: Option<String>,

    /// Tee input lines to '-' (stdout), 'stderr', or a file path
    #[arg(long = "out", env = "LOGSHIP_OUT")]
    pub output: Option<String>,

    /// Extra property stamped on every telemetry item, like key=value.
    /// Can be used multiple times
    #[arg(long = "custom", value_parser = parse_key_val::<String, String>)]
    pub custom: Vec<(String, String)>,

    /// Telemetry submit interval, also the shutdown flush bound
    #[arg(long, env = "LOGSHIP_FLUSH", default_value = "3s")]
    pub flush: humantime::Duration,

    /// Show debugging output
    #[arg(long, env = "LOGSHIP_DEBUG", default_value = "false")]
    pub debug: bool,

    /// Don't write any output messages
    #[arg(long, env = "LOGSHIP_QUIET", default_value = "false")]
    pub quiet: bool,

    /// Log format
    #[arg(value_enum, long, env = "LOGSHIP_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl CommonArgs {
    /// Required-flag checks behind clap, so misconfiguration exits 1.
    pub fn validate(&self) -> Result<(), String> {
        if self.ikey.as_deref().unwrap_or("").is_empty() {
            return Err("must specify instrumentation key, see --help for usage".to_string());
        }
        if self.input.as_deref().unwrap_or("").is_empty() {
            return Err("must specify input file, see --help for usage".to_string());
        }
        Ok(())
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        let mut config = TelemetryConfig::new(self.ikey.clone().unwrap_or_default());
        config.endpoint = self.endpoint.clone();
        if let Some(role) = &self.role {
            config.role = role.clone();
        }
        if let Some(instance) = &self.role_instance {
            config.role_instance = instance.clone();
        }
        config.custom_properties = self.custom.iter().cloned().collect::<HashMap<_, _>>();
        config.flush_interval = self.flush.into();
        config
    }
}

/// Parse a single key-value pair
pub fn parse_key_val<T, U>(s: &str) -> Result<(T, U), Box<dyn Error + Send + Sync + 'static>>
where
    T: std::str::FromStr,
    T::Err: Error + Send + Sync + 'static,
    U: std::str::FromStr,
    U::Err: Error + Send + Sync + 'static,
{
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{s}`"))?;
    Ok((s[..pos].parse()?, s[pos + 1..].parse()?))
}

pub type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

/// Install the global subscriber. Logs go to stderr so stdout stays free for
/// the `-` tee target. `--debug` and `--quiet` move the filter floor.
pub fn setup_logging(name: &str, args: &CommonArgs) -> std::io::Result<LoggerGuard> {
    LogTracer::init().expect("Unable to setup log tracer!");

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let level = if args.debug {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        "info"
    };

    if args.log_format == LogFormat::Json {
        let app_name = format!("{}-{}", name, env!("CARGO_PKG_VERSION"));
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(EnvFilter::new(level))
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .compact();

        let subscriber = Registry::default()
            .with(EnvFilter::new(level))
            .with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    }

    Ok(guard)
}
