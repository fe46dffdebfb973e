//! Summarization strategy seam.

use async_trait::async_trait;
use caphub_contract::error::HubError;
use caphub_contract::thread::{Message, Thread, ThreadSummary};

/// Controls one `summarize` invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummarizePolicy {
    /// Summarize even when the log is under the threshold.
    pub force: bool,
    /// Tail messages to leave out of the summary; defaults to the service's
    /// `min_tail_messages`.
    pub keep_tail: Option<usize>,
}

/// Produces summary text for a slice of thread history.
///
/// The production summarizer calls a language model; that provider is an
/// external collaborator, so the seam is a trait.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        thread: &Thread,
        messages: &[Message],
        previous: Option<&ThreadSummary>,
    ) -> Result<String, HubError>;
}

/// Deterministic fallback summarizer: prefixes the previous summary and
/// truncates each message to one line.
#[derive(Debug, Clone)]
pub struct TruncatingSummarizer {
    pub max_line_chars: usize,
    pub max_lines: usize,
}

impl Default for TruncatingSummarizer {
    fn default() -> Self {
        Self {
            max_line_chars: 120,
            max_lines: 40,
        }
    }
}

#[async_trait]
impl Summarizer for TruncatingSummarizer {
    async fn summarize(
        &self,
        _thread: &Thread,
        messages: &[Message],
        previous: Option<&ThreadSummary>,
    ) -> Result<String, HubError> {
        let mut lines = Vec::with_capacity(messages.len() + 1);
        if let Some(prev) = previous {
            lines.push(prev.content.clone());
        }
        for message in messages {
            let mut line = message.content.replace('\n', " ");
            if line.len() > self.max_line_chars {
                line.truncate(self.max_line_chars);
                line.push('…');
            }
            lines.push(format!("[{:?}] {line}", message.role));
        }
        if lines.len() > self.max_lines {
            let skipped = lines.len() - self.max_lines;
            lines.drain(..skipped);
            lines.insert(0, format!("({skipped} earlier entries elided)"));
        }
        Ok(lines.join("\n"))
    }
}
