// SPDX-License-Identifier: Apache-2.0

//! Log format templates.
//!
//! A format string like
//! `$remote_addr - $remote_user [$time_local] "$request"` compiles into a
//! program of alternating variables and literal separators. Executing the
//! program against a log line walks the separators with an escape-aware
//! Boyer-Moore search and captures the bytes between them, so an escaped
//! separator character inside a field (`\"` inside a quoted field) does not
//! terminate the field.
//!
//! Lines are raw byte sequences throughout: escape spans are located with a
//! bytes regex, matching and capturing never assume UTF-8, and captured
//! values reach the [`Store`] sink as bytes. Conversion to text, where a
//! consumer wants it, happens per captured field after all matching is done.

pub mod searcher;
pub mod unescape;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use regex::bytes::Regex as ByteRegex;
use regex::Regex;
use thiserror::Error;

use searcher::{EscapeSpan, Searcher};
use unescape::UnescapeFn;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("two consecutive variables in format: {0}, {1}")]
    AdjacentVariables(String, String),

    #[error("empty literal separator in format")]
    EmptySeparator,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line does not match format")]
    FormatMismatch,

    #[error("invalid escape sequence {0:?}")]
    Unescape(String),
}

/// How a format string is interpreted: where variables are found, where
/// escape sequences are found in input lines, and how both are decoded.
pub struct TemplateOptions {
    /// Locates variables in the format string.
    pub variable_pattern: &'static str,
    /// Locates escape spans in input lines. Only used for locating; decoding
    /// goes through `unescape`.
    pub escape_pattern: &'static str,
    pub unescape: UnescapeFn,
    /// Strips the variable syntax down to the bare name (`$status` -> `status`).
    pub unwrap_variable: fn(&str) -> &str,
}

fn strip_dollar(var: &str) -> &str {
    var.strip_prefix('$').unwrap_or(var)
}

impl TemplateOptions {
    /// `$name` variables with the default backslash escape dialect.
    pub fn common() -> TemplateOptions {
        TemplateOptions {
            variable_pattern: r"\$[a-zA-Z0-9_]+",
            escape_pattern: unescape::COMMON_ESCAPE_PATTERN,
            unescape: unescape::unescape_common,
            unwrap_variable: strip_dollar,
        }
    }

    /// `$name` variables with nginx `escape=json` input.
    pub fn json_escaped() -> TemplateOptions {
        TemplateOptions {
            variable_pattern: r"\$[a-zA-Z0-9_]+",
            escape_pattern: unescape::JSON_ESCAPE_PATTERN,
            unescape: unescape::unescape_json,
            unwrap_variable: strip_dollar,
        }
    }
}

/// Receives parsed key/value pairs. Values are decoded bytes; borrowed
/// values are handed through when the captured field contained no escapes.
pub trait Store {
    fn store(&mut self, key: &str, value: Cow<'_, [u8]>);
}

/// Byte-exact field map.
impl Store for HashMap<String, Vec<u8>> {
    fn store(&mut self, key: &str, value: Cow<'_, [u8]>) {
        self.insert(key.to_string(), value.into_owned());
    }
}

/// Text field map. Conversion is lossy and happens per captured field, after
/// all byte matching is done, so it cannot disturb match offsets.
impl Store for HashMap<String, String> {
    fn store(&mut self, key: &str, value: Cow<'_, [u8]>) {
        self.insert(key.to_string(), String::from_utf8_lossy(&value).into_owned());
    }
}

/// One step of the compiled program. The three shapes:
///
/// * variable + searcher: capture bytes up to the separator
/// * variable, no searcher: capture to end of line (last segment only)
/// * searcher only: skip a leading literal, capture nothing
#[derive(Debug)]
struct Segment {
    variable: Option<String>,
    searcher: Option<Arc<Searcher>>,
}

/// A compiled format template. Immutable after compilation and freely
/// shareable between workers.
#[derive(Debug)]
pub struct Template {
    escape_re: ByteRegex,
    segments: Vec<Segment>,
    unescape: UnescapeFn,
}

impl Template {
    pub fn compile(format: &str, options: &TemplateOptions) -> Result<Template, TemplateError> {
        let var_re = Regex::new(options.variable_pattern)?;
        let escape_re = ByteRegex::new(options.escape_pattern)?;

        // Split the format into an alternating variable/literal sequence
        let mut pieces = Vec::new();
        let mut rest = format;
        while !rest.is_empty() {
            match var_re.find(rest) {
                None => {
                    pieces.push(rest);
                    break;
                }
                Some(m) => {
                    if m.start() > 0 {
                        pieces.push(&rest[..m.start()]);
                    }
                    pieces.push(&rest[m.start()..m.end()]);
                    rest = &rest[m.end()..];
                }
            }
        }

        // Group into segments, interning one searcher per distinct literal
        let mut searchers: HashMap<&str, Arc<Searcher>> = HashMap::new();
        let mut segments = Vec::new();
        let mut pending: Option<&str> = None;

        for piece in pieces {
            if var_re.is_match(piece) {
                if let Some(prev) = pending {
                    return Err(TemplateError::AdjacentVariables(
                        prev.to_string(),
                        piece.to_string(),
                    ));
                }
                pending = Some(piece);
            } else {
                let searcher = match searchers.get(piece) {
                    Some(s) => s.clone(),
                    None => {
                        let s = Arc::new(
                            Searcher::new(piece.as_bytes())
                                .ok_or(TemplateError::EmptySeparator)?,
                        );
                        searchers.insert(piece, s.clone());
                        s
                    }
                };

                segments.push(Segment {
                    variable: pending
                        .take()
                        .map(|v| (options.unwrap_variable)(v).to_string()),
                    searcher: Some(searcher),
                });
            }
        }

        if let Some(var) = pending {
            // Trailing variable captures to end of line
            segments.push(Segment {
                variable: Some((options.unwrap_variable)(var).to_string()),
                searcher: None,
            });
        }

        Ok(Template {
            escape_re,
            segments,
            unescape: options.unescape,
        })
    }

    /// The variable names this template captures, in format order.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments
            .iter()
            .filter_map(|s| s.variable.as_deref())
    }

    /// Parse one raw line, feeding each captured field into `out`. On
    /// success the stored key set is exactly the template's variable set.
    pub fn parse(&self, line: &[u8], out: &mut impl Store) -> Result<(), ParseError> {
        // Locate every escape span up front; each segment consumes the list
        // left to right without rescanning.
        let all_spans: Vec<EscapeSpan> = self
            .escape_re
            .find_iter(line)
            .map(|m| (m.start(), m.end()))
            .collect();
        let mut escapes: &[EscapeSpan] = &all_spans;

        let mut ptr = 0;

        for segment in &self.segments {
            match (&segment.variable, &segment.searcher) {
                (None, Some(searcher)) => {
                    // Leading literal: advance past it, capture nothing
                    let m = searcher
                        .search(line, ptr, escapes)
                        .ok_or(ParseError::FormatMismatch)?;
                    ptr = m.end;
                    escapes = &escapes[m.escapes_used..];
                }
                (Some(name), Some(searcher)) => {
                    let m = searcher
                        .search(line, ptr, escapes)
                        .ok_or(ParseError::FormatMismatch)?;

                    // Unescape only when escapes were skipped during this
                    // capture; a clean field is handed through borrowed.
                    if m.escapes_used > 0 {
                        let value =
                            self.decode(&line[ptr..m.begin], ptr, &escapes[..m.escapes_used])?;
                        escapes = &escapes[m.escapes_used..];
                        out.store(name, Cow::Owned(value));
                    } else {
                        out.store(name, Cow::Borrowed(&line[ptr..m.begin]));
                    }
                    ptr = m.end;
                }
                (Some(name), None) => {
                    // Trailing variable: rest of the line
                    if escapes.is_empty() {
                        out.store(name, Cow::Borrowed(&line[ptr..]));
                    } else {
                        let value = self.decode(&line[ptr..], ptr, escapes)?;
                        out.store(name, Cow::Owned(value));
                    }
                    ptr = line.len();
                }
                (None, None) => unreachable!("segment with neither variable nor separator"),
            }
        }

        Ok(())
    }

    /// Parse into a text field map (lossy per field, see [`Store`]).
    pub fn parse_to_map(&self, line: &[u8]) -> Result<HashMap<String, String>, ParseError> {
        let mut map = HashMap::new();
        self.parse(line, &mut map)?;
        Ok(map)
    }

    /// Decode a captured slice whose escape spans are given in whole-line
    /// coordinates; `offset` is the slice's position in the line.
    fn decode(
        &self,
        slice: &[u8],
        offset: usize,
        escapes: &[EscapeSpan],
    ) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::with_capacity(slice.len());
        let mut last = 0;

        for &(start, end) in escapes {
            let rel_start = start - offset;
            let rel_end = end - offset;

            out.extend_from_slice(&slice[last..rel_start]);

            let esc = &slice[rel_start..rel_end];
            if !(self.unescape)(esc, &mut out) {
                return Err(ParseError::Unescape(
                    String::from_utf8_lossy(esc).into_owned(),
                ));
            }

            last = rel_end;
        }

        out.extend_from_slice(&slice[last..]);

        Ok(out)
    }
}
