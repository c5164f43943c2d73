//! Turn raw process output into user-relevant text per engine convention.

use super::{ClaudeEvent, CodexEvent, GeminiResult};
use crate::runner::{OutputChunk, StreamKind};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// How an engine writes its answer to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputConvention {
    /// Every byte of stdout is answer text.
    PlainText,
    /// One JSON object per line; only some events carry answer text.
    JsonLines(JsonDialect),
    /// A single JSON document printed when the engine finishes.
    FinalJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonDialect {
    ClaudeStream,
    CodexExec,
}

/// A classified piece of engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Text(String),
    Error(String),
}

/// Stateful classifier for one engine execution.
///
/// Stderr is never classified as content; it stays with the runner's
/// captured output for diagnostics.
#[derive(Debug)]
pub struct ChunkClassifier {
    convention: OutputConvention,
    pending: String,
}

impl ChunkClassifier {
    pub fn new(convention: OutputConvention) -> Self {
        Self {
            convention,
            pending: String::new(),
        }
    }

    pub fn convention(&self) -> OutputConvention {
        self.convention
    }

    /// Classify one chunk. JSON-lines input may split a line across chunks;
    /// the partial tail is held until its newline arrives.
    pub fn push(&mut self, chunk: &OutputChunk) -> Vec<Classified> {
        if chunk.stream != StreamKind::Stdout {
            return Vec::new();
        }
        match self.convention {
            OutputConvention::PlainText => {
                if chunk.text.is_empty() {
                    Vec::new()
                } else {
                    vec![Classified::Text(chunk.text.clone())]
                }
            }
            OutputConvention::JsonLines(dialect) => {
                self.pending.push_str(&chunk.text);
                let mut out = Vec::new();
                while let Some(newline) = self.pending.find('\n') {
                    let line: String = self.pending.drain(..=newline).collect();
                    out.extend(classify_line(dialect, line.trim()));
                }
                out
            }
            OutputConvention::FinalJson => {
                self.pending.push_str(&chunk.text);
                Vec::new()
            }
        }
    }

    /// Flush whatever is still held once the process has exited.
    pub fn finish(&mut self) -> Vec<Classified> {
        let rest = std::mem::take(&mut self.pending);
        match self.convention {
            OutputConvention::PlainText => Vec::new(),
            OutputConvention::JsonLines(dialect) => classify_line(dialect, rest.trim()).into_iter().collect(),
            OutputConvention::FinalJson => classify_final(rest.trim()).into_iter().collect(),
        }
    }
}

fn classify_line(dialect: JsonDialect, line: &str) -> Option<Classified> {
    if line.is_empty() {
        return None;
    }
    match dialect {
        JsonDialect::ClaudeStream => match serde_json::from_str::<ClaudeEvent>(line) {
            Ok(ClaudeEvent::Assistant { message, .. }) => message.text().map(Classified::Text),
            Ok(ClaudeEvent::Result {
                is_error: true,
                result,
                subtype,
            }) => Some(Classified::Error(result.unwrap_or(subtype))),
            Ok(_) => None,
            Err(e) => {
                trace!(error = %e, "discarding non-event line");
                None
            }
        },
        JsonDialect::CodexExec => match serde_json::from_str::<CodexEvent>(line) {
            Ok(CodexEvent::ItemCompleted { item }) if item.item_type == "agent_message" => {
                item.text.filter(|t| !t.trim().is_empty()).map(Classified::Text)
            }
            Ok(CodexEvent::TurnFailed { error }) => Some(Classified::Error(
                error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "turn failed".to_string()),
            )),
            Ok(CodexEvent::Error { message }) => Some(Classified::Error(message)),
            Ok(_) => None,
            Err(e) => {
                trace!(error = %e, "discarding non-event line");
                None
            }
        },
    }
}

fn classify_final(body: &str) -> Option<Classified> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_str::<GeminiResult>(body) {
        Ok(GeminiResult {
            error: Some(error), ..
        }) => Some(Classified::Error(error.message)),
        Ok(GeminiResult {
            response: Some(text),
            ..
        }) => Some(Classified::Text(text)),
        Ok(_) => None,
        // Not JSON after all: treat the whole body as the answer.
        Err(_) => Some(Classified::Text(body.to_string())),
    }
}

/// Extract the final answer text from fully captured stdout.
///
/// Used once an execution succeeds, so the result does not depend on what
/// the streaming side happened to see.
///
/// For Claude's stream the terminal `result` event already holds the final
/// answer; the assistant turns before it are only used when it is missing.
pub fn extract_answer(convention: OutputConvention, stdout: &str) -> String {
    if convention == OutputConvention::JsonLines(JsonDialect::ClaudeStream)
        && let Some(result) = claude_final_result(stdout)
    {
        return result;
    }
    match convention {
        OutputConvention::PlainText => stdout.trim().to_string(),
        OutputConvention::JsonLines(_) | OutputConvention::FinalJson => {
            let mut classifier = ChunkClassifier::new(convention);
            let chunk = OutputChunk {
                stream: StreamKind::Stdout,
                text: stdout.to_string(),
            };
            let mut parts = classifier.push(&chunk);
            parts.extend(classifier.finish());
            parts
                .into_iter()
                .filter_map(|c| match c {
                    Classified::Text(t) => Some(t),
                    Classified::Error(_) => None,
                })
                .collect::<Vec<_>>()
                .join("\n\n")
        }
    }
}

/// Text of the last successful `result` event in a Claude stream.
fn claude_final_result(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<ClaudeEvent>(line.trim()).ok())
        .find_map(|event| match event {
            ClaudeEvent::Result {
                is_error: false,
                result: Some(text),
                ..
            } if !text.trim().is_empty() => Some(text),
            _ => None,
        })
}

/// First error an engine reported in its captured stdout, if any.
pub fn extract_error(convention: OutputConvention, stdout: &str) -> Option<String> {
    if convention == OutputConvention::PlainText {
        return None;
    }
    let mut classifier = ChunkClassifier::new(convention);
    let mut parts = classifier.push(&OutputChunk {
        stream: StreamKind::Stdout,
        text: stdout.to_string(),
    });
    parts.extend(classifier.finish());
    parts.into_iter().find_map(|c| match c {
        Classified::Error(e) => Some(e),
        Classified::Text(_) => None,
    })
}
