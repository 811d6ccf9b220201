//! HTTP change-feed client producing a stream of text lines.

use std::collections::VecDeque;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::ACCEPT;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Result, StatsError};
use crate::shutdown;

pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("change-producer/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| StatsError::Internal(format!("Failed to build HTTP client: {}", e)))
}

/// How long the feed may take to answer with response headers.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens the feed and returns its body as lines.
///
/// Failing to connect, or a non-success status, is an error. Once connected,
/// a body read failure just ends the stream.
pub async fn connect(client: &reqwest::Client, url: &str) -> Result<BoxStream<'static, String>> {
    connect_within(client, url, RESPONSE_TIMEOUT).await
}

/// Like [`connect`], but gives up when no response headers arrive in `timeout`.
pub async fn connect_within(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<BoxStream<'static, String>> {
    let request = client.get(url).header(ACCEPT, "text/event-stream").send();
    let response = tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| {
            StatsError::FeedConnection(format!("{}: no response within {:?}", url, timeout))
        })?
        .map_err(|e| StatsError::FeedConnection(format!("{}: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(StatsError::FeedConnection(format!(
            "{} responded with {}",
            url, status
        )));
    }

    info!(url = %url, "Connected to change feed");
    Ok(response_lines(response))
}

/// Connects unless shutdown is requested first, in which case `None`.
pub async fn connect_or_cancel(
    client: &reqwest::Client,
    url: &str,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<Option<BoxStream<'static, String>>> {
    tokio::select! {
        biased;
        _ = shutdown::cancelled(shutdown_rx) => {
            info!(url = %url, "Shutdown requested before the change feed connected");
            Ok(None)
        }
        lines = connect(client, url) => lines.map(Some),
    }
}

struct LineState {
    response: Option<reqwest::Response>,
    splitter: LineSplitter,
    ready: VecDeque<String>,
}

fn response_lines(response: reqwest::Response) -> BoxStream<'static, String> {
    let state = LineState {
        response: Some(response),
        splitter: LineSplitter::default(),
        ready: VecDeque::new(),
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.ready.pop_front() {
                return Some((line, state));
            }

            let response = state.response.as_mut()?;
            match response.chunk().await {
                Ok(Some(chunk)) => state.ready.extend(state.splitter.push(&chunk)),
                Ok(None) => {
                    state.response = None;
                    state.ready.extend(state.splitter.finish());
                }
                Err(e) => {
                    warn!(error = %e, "Change feed body read failed, ending stream");
                    state.response = None;
                    state.ready.extend(state.splitter.finish());
                }
            }
        }
    })
    .boxed()
}

/// Longest feed line kept; longer lines are dropped whole.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Reassembles `\n`-terminated lines from arbitrarily split byte chunks.
pub struct LineSplitter {
    partial: Vec<u8>,
    max_line: usize,
    /// Inside a line that already exceeded `max_line`.
    discarding: bool,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineSplitter {
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            partial: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        while let Some(end) = chunk.iter().position(|b| *b == b'\n') {
            let line = &chunk[..end];
            chunk = &chunk[end + 1..];

            if self.discarding {
                self.discarding = false;
            } else if self.partial.len() + line.len() > self.max_line {
                self.drop_overlong();
            } else {
                self.partial.extend_from_slice(line);
                let raw = std::mem::take(&mut self.partial);
                lines.push(decode_line(&raw));
            }
        }

        if !self.discarding {
            if self.partial.len() + chunk.len() > self.max_line {
                self.drop_overlong();
                self.discarding = true;
            } else {
                self.partial.extend_from_slice(chunk);
            }
        }
        lines
    }

    /// Trailing text after the last newline, if any.
    pub fn finish(&mut self) -> Option<String> {
        if std::mem::take(&mut self.discarding) || self.partial.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.partial);
        Some(decode_line(&raw))
    }

    /// Bytes held for the line in progress.
    pub fn buffered(&self) -> usize {
        self.partial.len()
    }

    fn drop_overlong(&mut self) {
        warn!(max_line = self.max_line, "Dropping overlong feed line");
        self.partial = Vec::new();
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
