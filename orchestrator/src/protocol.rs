//! Streamed plain-text response protocol.
//!
//! A response is a sequence of stage banners, echoed command lines and raw tool
//! output, terminated by exactly one trailing line: `success`,
//! `RESULT: <url>` or `error: <reason>`.

use std::io::Write;
use tracing::warn;

pub const BANNER_RULE: &str = "===============================================";
pub const SUCCESS_LINE: &str = "success";
pub const RESULT_PREFIX: &str = "RESULT: ";
pub const ERROR_PREFIX: &str = "error: ";

/// Writes response text to the client, flushing after every write so progress
/// is visible while a stage is still running.
///
/// A broken client connection is logged once and further output is dropped;
/// the job itself keeps running so that its cleanup still happens.
pub struct ResponseWriter<'a> {
    out: &'a mut dyn Write,
    broken: bool,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(out: &'a mut dyn Write) -> Self {
        Self { out, broken: false }
    }

    pub fn banner(&mut self, title: &str) {
        self.line(BANNER_RULE);
        self.line(title);
    }

    pub fn line(&mut self, text: &str) {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(b'\n');
        self.emit(&bytes);
    }

    /// Raw tool output, passed through unmodified.
    pub fn chunk(&mut self, bytes: &[u8]) {
        self.emit(bytes);
    }

    pub fn success(&mut self) {
        self.line(SUCCESS_LINE);
    }

    pub fn result(&mut self, url: &str) {
        self.line(&format!("{}{}", RESULT_PREFIX, url));
    }

    /// Emits the `error:` trailer; multi-line reasons are folded onto one line.
    pub fn error(&mut self, reason: &str) {
        self.line(&format!("{}{}", ERROR_PREFIX, single_line(reason)));
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn emit(&mut self, bytes: &[u8]) {
        if self.broken {
            return;
        }
        let written = self.out.write_all(bytes).and_then(|_| self.out.flush());
        if let Err(err) = written {
            warn!(error = %err, "client stream closed, discarding further output");
            self.broken = true;
        }
    }
}

fn single_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// How a response ended, judged from its last non-empty line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Result(String),
    Error(String),
    Unknown,
}

impl Outcome {
    pub fn from_transcript(text: &str) -> Self {
        let Some(last) = text.lines().map(str::trim_end).rfind(|l| !l.is_empty()) else {
            return Outcome::Unknown;
        };

        if let Some(url) = last.strip_prefix(RESULT_PREFIX) {
            Outcome::Result(url.trim().to_string())
        } else if let Some(reason) = last.strip_prefix(ERROR_PREFIX) {
            Outcome::Error(reason.to_string())
        } else if last.starts_with(SUCCESS_LINE) {
            Outcome::Success
        } else {
            Outcome::Unknown
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::Result(_))
    }
}

/// Resolves a `RESULT:` path against the URL the request was posted to.
///
/// Absolute paths resolve against the server origin, relative ones against the
/// directory of the endpoint.
pub fn resolve_result_url(server_url: &str, result: &str) -> Option<String> {
    let scheme_end = server_url.find("://")? + 3;
    if let Some(path) = result.strip_prefix('/') {
        let origin_end = server_url[scheme_end..]
            .find('/')
            .map(|idx| scheme_end + idx)
            .unwrap_or(server_url.len());
        Some(format!("{}/{}", &server_url[..origin_end], path))
    } else {
        let dir_end = server_url.rfind('/').filter(|idx| *idx >= scheme_end)?;
        Some(format!("{}{}", &server_url[..=dir_end], result))
    }
}
