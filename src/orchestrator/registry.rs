//! In-flight analysis registry owned by the orchestrator.

use crate::analysis::AnalysisType;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Snapshot of one running analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveAnalysis {
    pub id: String,
    pub session_id: Option<String>,
    pub analysis: AnalysisType,
    pub engines: Vec<String>,
    pub started_at: DateTime<Utc>,
}

/// Running analyses in start order.
///
/// Entries are inserted by [`register`](Self::register) and removed when the
/// returned guard drops, so a failed or panicking analysis cannot linger.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRegistry {
    entries: Arc<Mutex<IndexMap<String, ActiveAnalysis>>>,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, ActiveAnalysis>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register(
        &self,
        session_id: Option<&str>,
        analysis: AnalysisType,
        engines: &[String],
    ) -> AnalysisGuard {
        let id = uuid::Uuid::new_v4().to_string();
        let entry = ActiveAnalysis {
            id: id.clone(),
            session_id: session_id.map(str::to_string),
            analysis,
            engines: engines.to_vec(),
            started_at: Utc::now(),
        };
        self.lock().insert(id.clone(), entry);
        debug!(analysis_id = %id, %analysis, engines = engines.len(), "analysis registered");
        AnalysisGuard {
            registry: self.clone(),
            id,
        }
    }

    pub fn active(&self) -> Vec<ActiveAnalysis> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Removes its analysis from the registry on drop.
#[derive(Debug)]
pub struct AnalysisGuard {
    registry: AnalysisRegistry,
    id: String,
}

impl AnalysisGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for AnalysisGuard {
    fn drop(&mut self) {
        self.registry.lock().shift_remove(&self.id);
        debug!(analysis_id = %self.id, "analysis settled");
    }
}
