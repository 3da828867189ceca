// SPDX-License-Identifier: Apache-2.0

//! Line handlers. Each binary wires exactly one into the supervisor loop;
//! the handler turns input lines into telemetry items.

pub mod access;
pub mod status;
pub mod trace;

use thiserror::Error;

use crate::template::{ParseError, TemplateError};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Field(#[from] FieldError),

    #[error("invalid filter pattern: {0}")]
    Filter(#[from] regex::Error),

    #[error("invalid severity level {0:?}, must be one of: verbose, information, warning, error, critical")]
    InvalidSeverity(String),
}

/// A required telemetry field could not be derived from the parsed line.
/// Per-line: the supervisor logs these and moves on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("no timestamp field present or parseable")]
    MissingTimestamp,

    #[error("no response code in log line")]
    MissingResponseCode,

    #[error("request method not in log line")]
    MissingMethod,

    #[error("cannot assemble request URL from log line")]
    MissingUrl,

    #[error("could not parse request duration {0:?}")]
    InvalidDuration(String),
}

pub trait LogHandler: Send {
    /// Called once, after the runtime is up and before the first line.
    fn initialize(&mut self) -> Result<(), HandlerError>;

    /// Called for every input line, delivered as raw bytes. Errors are
    /// strictly per-line.
    fn receive(&mut self, line: &[u8]) -> Result<(), HandlerError>;
}

/// Strip the trailing carriage returns and newlines a producer may leave on
/// a framed line.
pub(crate) fn trim_line_ending(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}
