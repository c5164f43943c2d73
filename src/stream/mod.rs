//! Streaming event pipeline: engine wire formats and the events the
//! pipeline publishes to session subscribers.

pub mod buffer;
pub mod classify;
pub mod patterns;
pub mod pipeline;
pub mod progress;

pub use buffer::{BufferKey, Flushed, ThrottleBuffer};
pub use classify::{ChunkClassifier, Classified, JsonDialect, OutputConvention};
pub use patterns::PatternSet;
pub use pipeline::{EngineSink, StreamPipeline};
pub use progress::{AnalysisPhase, ProgressEvent, ProgressState, ProgressTracker};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine name used for pipeline-level events.
pub const SYSTEM_ENGINE: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventType {
    Start,
    Progress,
    Complete,
    Error,
}

impl std::fmt::Display for StreamEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamEventType::Start => write!(f, "start"),
            StreamEventType::Progress => write!(f, "progress"),
            StreamEventType::Complete => write!(f, "complete"),
            StreamEventType::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<AnalysisPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone: Option<String>,
    /// Number of classified chunks coalesced into this event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<usize>,
}

/// One outbound event for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingEvent {
    #[serde(rename = "type")]
    pub kind: StreamEventType,
    pub engine: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl StreamingEvent {
    pub fn new(
        kind: StreamEventType,
        engine: impl Into<String>,
        content: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            engine: engine.into(),
            content: content.into(),
            timestamp: Utc::now(),
            session_id: session_id.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ── Claude CLI `--output-format stream-json` ───────────────────────────────

/// Events from Claude CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClaudeEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    /// `system`, `user` (tool results) and anything newer.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },

    /// `thinking` and other internal blocks.
    #[serde(other)]
    Other,
}

impl AssistantMessage {
    /// Concatenated user-facing text blocks, if any.
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.trim().is_empty() => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

// ── Codex CLI `exec --json` ────────────────────────────────────────────────

/// Events from `codex exec --json`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum CodexEvent {
    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },

    #[serde(rename = "turn.failed")]
    TurnFailed {
        #[serde(default)]
        error: Option<CodexError>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },

    /// `thread.started`, `turn.started`, `item.started`, ...
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct CodexItem {
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CodexError {
    #[serde(default)]
    pub message: String,
}

// ── Gemini CLI `--output-format json` ──────────────────────────────────────

/// The single JSON document gemini prints when it finishes.
#[derive(Debug, Deserialize)]
pub struct GeminiResult {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
pub struct GeminiError {
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assistant_text() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello world"}]},"session_id":"abc"}"#;
        let event: ClaudeEvent = serde_json::from_str(json).unwrap();

        if let ClaudeEvent::Assistant { message, .. } = event {
            assert_eq!(message.text().as_deref(), Some("Hello world"));
        } else {
            panic!("Expected Assistant event");
        }
    }

    #[test]
    fn test_tool_use_and_thinking_have_no_text() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"},{"type":"tool_use","name":"Read","input":{"file_path":"/foo/bar.rs"},"id":"123"}]}}"#;
        let event: ClaudeEvent = serde_json::from_str(json).unwrap();
        if let ClaudeEvent::Assistant { message, .. } = event {
            assert_eq!(message.content.len(), 2);
            assert!(message.text().is_none());
        } else {
            panic!("Expected Assistant event");
        }
    }

    #[test]
    fn test_unknown_claude_event_is_other() {
        let event: ClaudeEvent =
            serde_json::from_str(r#"{"type":"system","subtype":"init","tools":[]}"#).unwrap();
        assert!(matches!(event, ClaudeEvent::Other));
    }

    #[test]
    fn test_parse_codex_agent_message() {
        let json = r#"{"type":"item.completed","item":{"id":"item_3","type":"agent_message","text":"Looks risky"}}"#;
        let event: CodexEvent = serde_json::from_str(json).unwrap();
        match event {
            CodexEvent::ItemCompleted { item } => {
                assert_eq!(item.item_type, "agent_message");
                assert_eq!(item.text.as_deref(), Some("Looks risky"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_codex_turn_failed() {
        let json = r#"{"type":"turn.failed","error":{"message":"usage limit"}}"#;
        let event: CodexEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, CodexEvent::TurnFailed { error: Some(e) } if e.message == "usage limit"));
    }

    #[test]
    fn test_parse_gemini_result() {
        let result: GeminiResult =
            serde_json::from_str(r#"{"response":"Fine.","stats":{"models":{}}}"#).unwrap();
        assert_eq!(result.response.as_deref(), Some("Fine."));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_streaming_event_serializes_type_field() {
        let event = StreamingEvent::new(StreamEventType::Progress, "codex", "hi", "s1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert!(json.get("metadata").is_none());
    }
}
