//! Newline-delimited JSON line framer (spec.md §4.1).
//!
//! Generalizes `claude-agent`'s `ClaudeProcess::next_message` read loop (which
//! reads one JSON message at a time off a child process's stdout) into a
//! reusable framer over any `AsyncRead` byte stream, yielding a parse result
//! per line instead of failing the whole read on a malformed one.

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

/// The result of framing and parsing a single NDJSON line.
#[derive(Debug, Clone)]
pub enum FrameResult {
    Ok(serde_json::Value),
    Fail { error_message: String, raw_line: String },
}

/// Wraps an `AsyncBufReadExt::lines()` reader, skipping blank/whitespace-only
/// lines and stripping a trailing `\r`, producing one [`FrameResult`] per
/// non-empty line.
pub struct LineFramer<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> LineFramer<R> {
    pub fn new(reader: R) -> Self {
        LineFramer {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Read and parse the next non-empty line. Returns `Ok(None)` on EOF.
    /// Never returns `Err` for malformed JSON — that surfaces as
    /// `FrameResult::Fail` so callers can keep consuming.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<FrameResult>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            let trimmed = line.strip_suffix('\r').unwrap_or(&line).trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(parse_line(trimmed)));
        }
    }

    /// Drain the remaining frames into a finite [`Stream`], matching the
    /// "lazy, finite sequence" contract of spec.md §4.1.
    pub fn into_stream(mut self) -> impl Stream<Item = FrameResult>
    where
        R: Send + 'static,
    {
        futures::stream::unfold(self, |mut framer| async move {
            match framer.next_frame().await {
                Ok(Some(frame)) => Some((frame, framer)),
                Ok(None) => None,
                Err(e) => Some((
                    FrameResult::Fail {
                        error_message: e.to_string(),
                        raw_line: String::new(),
                    },
                    framer,
                )),
            }
        })
    }
}

fn parse_line(line: &str) -> FrameResult {
    match serde_json::from_str(line) {
        Ok(value) => FrameResult::Ok(value),
        Err(e) => FrameResult::Fail {
            error_message: e.to_string(),
            raw_line: line.to_string(),
        },
    }
}
