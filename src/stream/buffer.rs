//! Per-(engine, event type, session) coalescing buffers.

use super::StreamEventType;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_CHUNKS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub engine: String,
    pub kind: StreamEventType,
    pub session_id: String,
}

impl BufferKey {
    pub fn new(engine: impl Into<String>, kind: StreamEventType, session_id: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            kind,
            session_id: session_id.into(),
        }
    }
}

/// Content released from one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flushed {
    pub key: BufferKey,
    pub content: String,
    pub chunks: usize,
}

#[derive(Debug)]
struct Part {
    text: String,
    /// A complete message, as opposed to a slice of a raw stream.
    message: bool,
}

#[derive(Debug)]
struct Pending {
    parts: Vec<Part>,
    last_flush: Instant,
}

/// Coalesces bursts of classified text into fewer events.
///
/// A buffer flushes when it holds `max_chunks` parts, or when a push or
/// [`flush_due`](Self::flush_due) finds `interval` elapsed since its last
/// flush, whichever comes first.
#[derive(Debug)]
pub struct ThrottleBuffer {
    interval: Duration,
    max_chunks: usize,
    buffers: HashMap<BufferKey, Pending>,
}

impl Default for ThrottleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_CHUNKS)
    }
}

impl ThrottleBuffer {
    pub fn new(interval: Duration, max_chunks: usize) -> Self {
        Self {
            interval,
            max_chunks: max_chunks.max(1),
            buffers: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Buffer a slice of a raw stream. Slices are joined as-is.
    pub fn push(&mut self, key: BufferKey, text: String, now: Instant) -> Option<Flushed> {
        self.push_part(key, Part { text, message: false }, now)
    }

    /// Buffer one complete message. Messages are joined line by line.
    pub fn push_message(&mut self, key: BufferKey, text: String, now: Instant) -> Option<Flushed> {
        self.push_part(key, Part { text, message: true }, now)
    }

    fn push_part(&mut self, key: BufferKey, part: Part, now: Instant) -> Option<Flushed> {
        let pending = self.buffers.entry(key.clone()).or_insert_with(|| Pending {
            parts: Vec::new(),
            last_flush: now,
        });
        pending.parts.push(part);
        let full = pending.parts.len() >= self.max_chunks;
        let stale = now.saturating_duration_since(pending.last_flush) >= self.interval;
        if full || stale {
            Some(Self::take(key, pending, now))
        } else {
            None
        }
    }

    fn take(key: BufferKey, pending: &mut Pending, now: Instant) -> Flushed {
        let parts = std::mem::take(&mut pending.parts);
        pending.last_flush = now;
        let mut content = String::new();
        for part in &parts {
            if part.message && !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&part.text);
        }
        Flushed {
            key,
            chunks: parts.len(),
            content,
        }
    }

    /// Flush every non-empty buffer whose interval has elapsed.
    pub fn flush_due(&mut self, now: Instant) -> Vec<Flushed> {
        let interval = self.interval;
        let mut out: Vec<Flushed> = self
            .buffers
            .iter_mut()
            .filter(|(_, p)| {
                !p.parts.is_empty() && now.saturating_duration_since(p.last_flush) >= interval
            })
            .map(|(k, p)| Self::take(k.clone(), p, now))
            .collect();
        out.sort_by(|a, b| a.key.engine.cmp(&b.key.engine));
        out
    }

    /// Flush and drop every buffer matching `filter`.
    pub fn drain_where<F>(&mut self, now: Instant, filter: F) -> Vec<Flushed>
    where
        F: Fn(&BufferKey) -> bool,
    {
        let keys: Vec<BufferKey> = self.buffers.keys().filter(|k| filter(k)).cloned().collect();
        let mut out = Vec::new();
        for key in keys {
            if let Some(mut pending) = self.buffers.remove(&key)
                && !pending.parts.is_empty()
            {
                out.push(Self::take(key, &mut pending, now));
            }
        }
        out
    }

    /// Buffers currently tracked.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
