//! Session-scoped event pipeline.
//!
//! Runner chunks enter through an [`EngineSink`] callback, are classified,
//! coalesced by the [`ThrottleBuffer`], fed to the session's
//! [`ProgressTracker`], and published on two broadcast channels: one for
//! [`StreamingEvent`]s and one for [`ProgressEvent`]s.
//!
//! All of this happens under one lock, so events for a given
//! (engine, event type, session) are published in the order they arrived.

use super::buffer::{BufferKey, Flushed, ThrottleBuffer};
use super::classify::{ChunkClassifier, Classified, OutputConvention};
use super::patterns::PatternSet;
use super::progress::{ProgressEvent, ProgressState, ProgressTracker};
use super::{EventMetadata, StreamEventType, StreamingEvent, SYSTEM_ENGINE};
use crate::analysis::AnalysisType;
use crate::runner::{ChunkCallback, OutputChunk};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

const CHANNEL_CAPACITY: usize = 256;

struct Session {
    events: broadcast::Sender<StreamingEvent>,
    progress: broadcast::Sender<ProgressEvent>,
    tracker: ProgressTracker,
}

impl Session {
    fn send(&self, event: StreamingEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn send_progress(&self, events: Vec<ProgressEvent>) {
        for event in events {
            let _ = self.progress.send(event);
        }
    }
}

struct PipelineState {
    buffer: ThrottleBuffer,
    sessions: HashMap<String, Session>,
}

impl PipelineState {
    fn publish(&mut self, flushed: Flushed) {
        let Some(session) = self.sessions.get_mut(&flushed.key.session_id) else {
            trace!(session_id = %flushed.key.session_id, "dropping flush for closed session");
            return;
        };
        let mut event = StreamingEvent::new(
            flushed.key.kind,
            flushed.key.engine,
            flushed.content,
            flushed.key.session_id,
        );
        let progress = session.tracker.observe(&event);
        let milestone = progress.iter().rev().find_map(|p| match p {
            ProgressEvent::MilestoneCompleted { milestone, .. } => Some(milestone.clone()),
            _ => None,
        });
        event.metadata = Some(EventMetadata {
            phase: Some(session.tracker.phase()),
            milestone,
            chunks: Some(flushed.chunks),
        });
        session.send(event);
        session.send_progress(progress);
    }
}

struct PipelineShared {
    state: Mutex<PipelineState>,
    patterns: Arc<PatternSet>,
}

impl PipelineShared {
    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// `messages` is set when each item is a whole message rather than a
    /// slice of a plain-text stream.
    fn ingest(&self, session_id: &str, engine: &str, items: Vec<Classified>, messages: bool) {
        if items.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut state = self.lock();
        if !state.sessions.contains_key(session_id) {
            return;
        }
        for item in items {
            let (kind, text) = match item {
                Classified::Text(text) => (StreamEventType::Progress, text),
                Classified::Error(text) => (StreamEventType::Error, text),
            };
            let key = BufferKey::new(engine, kind, session_id);
            let flushed = if messages {
                state.buffer.push_message(key, text, now)
            } else {
                state.buffer.push(key, text, now)
            };
            if let Some(flushed) = flushed {
                state.publish(flushed);
            }
        }
    }

    fn flush_due(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        for flushed in state.buffer.flush_due(now) {
            state.publish(flushed);
        }
    }
}

/// Subscriptions handed out when a session opens.
pub struct SessionSubscription {
    pub events: broadcast::Receiver<StreamingEvent>,
    pub progress: broadcast::Receiver<ProgressEvent>,
}

pub struct StreamPipeline {
    shared: Arc<PipelineShared>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for StreamPipeline {
    fn default() -> Self {
        Self::new(ThrottleBuffer::default())
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }
}

impl StreamPipeline {
    pub fn new(buffer: ThrottleBuffer) -> Self {
        Self::with_patterns(buffer, PatternSet::builtin())
    }

    pub fn with_patterns(buffer: ThrottleBuffer, patterns: Arc<PatternSet>) -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                state: Mutex::new(PipelineState {
                    buffer,
                    sessions: HashMap::new(),
                }),
                patterns,
            }),
            ticker: Mutex::new(None),
        }
    }

    /// Spawn the task that releases time-expired buffers. Idempotent.
    pub fn start_ticker(&self) {
        let mut ticker = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if ticker.is_some() {
            return;
        }
        let period = self.shared.lock().buffer.interval().max(Duration::from_millis(10));
        let weak: Weak<PipelineShared> = Arc::downgrade(&self.shared);
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(shared) => shared.flush_due(),
                    None => break,
                }
            }
        }));
    }

    /// Release buffers whose interval has elapsed.
    pub fn flush_due(&self) {
        self.shared.flush_due();
    }

    /// Open a session for one analysis and publish its start event.
    ///
    /// Reopening a live session replaces its tracker but keeps existing
    /// subscribers.
    pub fn open_session(&self, session_id: &str, analysis: AnalysisType) -> SessionSubscription {
        let tracker = ProgressTracker::for_analysis(session_id, analysis, self.shared.patterns.clone());
        let mut state = self.shared.lock();
        let session = state
            .sessions
            .entry(session_id.to_string())
            .and_modify(|s| {
                s.tracker = ProgressTracker::for_analysis(session_id, analysis, self.shared.patterns.clone())
            })
            .or_insert_with(|| Session {
                events: broadcast::channel(CHANNEL_CAPACITY).0,
                progress: broadcast::channel(CHANNEL_CAPACITY).0,
                tracker,
            });
        let subscription = SessionSubscription {
            events: session.events.subscribe(),
            progress: session.progress.subscribe(),
        };
        debug!(session_id, analysis = %analysis, "stream session opened");
        session.send(StreamingEvent::new(
            StreamEventType::Start,
            SYSTEM_ENGINE,
            format!("{} started", analysis.title()),
            session_id,
        ));
        subscription
    }

    pub fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<StreamingEvent>> {
        self.shared.lock().sessions.get(session_id).map(|s| s.events.subscribe())
    }

    pub fn subscribe_progress(&self, session_id: &str) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.shared
            .lock()
            .sessions
            .get(session_id)
            .map(|s| s.progress.subscribe())
    }

    pub fn progress(&self, session_id: &str) -> Option<ProgressState> {
        self.shared
            .lock()
            .sessions
            .get(session_id)
            .map(|s| s.tracker.state().clone())
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.shared.lock().sessions.contains_key(session_id)
    }

    /// Entry point for one engine's output within a session.
    pub fn sink(&self, session_id: &str, engine: &str, convention: OutputConvention) -> EngineSink {
        EngineSink {
            shared: self.shared.clone(),
            session_id: session_id.to_string(),
            engine: engine.to_string(),
            classifier: Arc::new(Mutex::new(ChunkClassifier::new(convention))),
        }
    }

    /// Flush everything for the session, finalize its progress, publish the
    /// closing event, and drop it.
    pub fn close_session(&self, session_id: &str, error: Option<&str>) {
        let now = Instant::now();
        let mut state = self.shared.lock();
        for flushed in state.buffer.drain_where(now, |k| k.session_id == session_id) {
            state.publish(flushed);
        }
        let Some(mut session) = state.sessions.remove(session_id) else {
            return;
        };
        let (kind, content, progress) = match error {
            Some(e) => (StreamEventType::Error, e.to_string(), session.tracker.record_error(e)),
            None => (
                StreamEventType::Complete,
                "analysis complete".to_string(),
                session.tracker.mark_complete(),
            ),
        };
        let event = StreamingEvent::new(kind, SYSTEM_ENGINE, content, session_id).with_metadata(EventMetadata {
            phase: Some(session.tracker.phase()),
            ..EventMetadata::default()
        });
        session.send(event);
        session.send_progress(progress);
        debug!(session_id, failed = error.is_some(), "stream session closed");
    }
}

/// Feeds one engine execution into the pipeline.
#[derive(Clone)]
pub struct EngineSink {
    shared: Arc<PipelineShared>,
    session_id: String,
    engine: String,
    classifier: Arc<Mutex<ChunkClassifier>>,
}

impl std::fmt::Debug for EngineSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSink")
            .field("session_id", &self.session_id)
            .field("engine", &self.engine)
            .finish()
    }
}

impl EngineSink {
    fn send_direct(&self, kind: StreamEventType, content: String) {
        let state = self.shared.lock();
        if let Some(session) = state.sessions.get(&self.session_id) {
            session.send(StreamingEvent::new(kind, &self.engine, content, &self.session_id));
        }
    }

    /// Publish the engine's start event.
    pub fn start(&self) {
        self.send_direct(StreamEventType::Start, format!("{} started", self.engine));
    }

    pub fn push(&self, chunk: &OutputChunk) {
        let (items, messages) = {
            let mut classifier = self.classifier.lock().unwrap_or_else(|p| p.into_inner());
            let messages = classifier.convention() != OutputConvention::PlainText;
            (classifier.push(chunk), messages)
        };
        self.shared.ingest(&self.session_id, &self.engine, items, messages);
    }

    /// Callback to hand to the runner.
    pub fn callback(&self) -> ChunkCallback {
        let sink = self.clone();
        Arc::new(move |chunk: &OutputChunk| sink.push(chunk))
    }

    /// Drain the classifier and this engine's buffers, then publish the
    /// engine's completion or error event.
    pub fn finish(&self, error: Option<&str>) {
        let (items, messages) = {
            let mut classifier = self.classifier.lock().unwrap_or_else(|p| p.into_inner());
            let messages = classifier.convention() != OutputConvention::PlainText;
            (classifier.finish(), messages)
        };
        self.shared.ingest(&self.session_id, &self.engine, items, messages);

        let now = Instant::now();
        let mut state = self.shared.lock();
        let engine = self.engine.as_str();
        let session_id = self.session_id.as_str();
        for flushed in state
            .buffer
            .drain_where(now, |k| k.engine == engine && k.session_id == session_id)
        {
            state.publish(flushed);
        }
        if let Some(session) = state.sessions.get(session_id) {
            let event = match error {
                Some(e) => StreamingEvent::new(StreamEventType::Error, engine, e, session_id),
                None => StreamingEvent::new(
                    StreamEventType::Complete,
                    engine,
                    format!("{} finished", engine),
                    session_id,
                ),
            };
            session.send(event);
        }
    }
}
